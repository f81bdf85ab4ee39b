//! The plan/act/observe controller driving one request through bounded
//! iterations.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde_json::{Value, json};
use synapse_graph::{PointerGraph, sanitise_project_id};
use synapse_paths::PathGuard;
use synapse_planning::{ExecutionGuard, PlanningEngine, tools_match};
use synapse_protocol::{
    AgentObserver, CodeNode, EmbeddingService, NodeKind, Phase, PhaseEvent, StepStatus,
};
use synapse_skills::SkillLibrary;
use synapse_tools::{ToolRegistry, is_failure_observation};
use synapse_vault::MemoryVault;
use tracing::{info, instrument, warn};

use crate::extract::{
    as_action_batch, extract_code_blocks, extract_json, inject_code_blocks, normalise_action,
};
use crate::history::format_history;
use crate::sessions::SessionRegistry;
use crate::trace::{InteractionLog, InteractionRecord, TraceLog};

/// Aggregate-source context is cut to this many bytes before injection.
const FULL_CONTEXT_BYTE_BUDGET: usize = 3_800_000;

/// How many graph neighbours seed the relational context block.
const RELATED_NODES: usize = 5;

/// How much of the monologue is kept as the "action" text of a success
/// memory.
const SUCCESS_MEMORY_SNIPPET: usize = 500;

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub project_id: String,
    pub session_id: String,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub data_root: PathBuf,
    /// Hard step budget per request.
    pub max_steps: usize,
    pub embedding_dimension: usize,
    /// Run a compile check after successful Python edits.
    pub auto_verify_edits: bool,
}

impl AgentConfig {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            max_steps: 16,
            embedding_dimension: 768,
            auto_verify_edits: true,
        }
    }
}

/// The autonomous loop plus the per-project stores it owns.
pub struct AgentExecutor {
    config: AgentConfig,
    guard: Arc<PathGuard>,
    registry: Arc<ToolRegistry>,
    vault: Arc<MemoryVault>,
    embedder: Arc<dyn EmbeddingService>,
    planner: Arc<PlanningEngine>,
    sessions: SessionRegistry,
    trace: Arc<TraceLog>,
    interactions: Arc<InteractionLog>,
    graphs: tokio::sync::Mutex<HashMap<String, Arc<PointerGraph>>>,
    skills: tokio::sync::Mutex<HashMap<String, Arc<SkillLibrary>>>,
}

impl AgentExecutor {
    pub fn new(
        config: AgentConfig,
        guard: Arc<PathGuard>,
        registry: Arc<ToolRegistry>,
        vault: Arc<MemoryVault>,
        embedder: Arc<dyn EmbeddingService>,
    ) -> Self {
        Self {
            config,
            guard,
            registry,
            vault,
            embedder,
            planner: Arc::new(PlanningEngine::new()),
            sessions: SessionRegistry::new(),
            trace: TraceLog::new(),
            interactions: InteractionLog::new(),
            graphs: tokio::sync::Mutex::new(HashMap::new()),
            skills: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn planner(&self) -> Arc<PlanningEngine> {
        self.planner.clone()
    }

    pub fn trace_log(&self) -> Arc<TraceLog> {
        self.trace.clone()
    }

    pub fn interaction_log(&self) -> Arc<InteractionLog> {
        self.interactions.clone()
    }

    /// The session's current cursor, if the session has run here.
    pub fn session_cursor(&self, session_id: &str) -> Option<String> {
        self.sessions.cursor(session_id)
    }

    /// The per-project graph, opened on first use under
    /// `data/graphs/<sanitised id>/`.
    pub async fn graph_for(&self, project_id: &str) -> Result<Arc<PointerGraph>> {
        let mut graphs = self.graphs.lock().await;
        if let Some(graph) = graphs.get(project_id) {
            return Ok(graph.clone());
        }
        let path = self
            .config
            .data_root
            .join("graphs")
            .join(sanitise_project_id(project_id));
        info!(project_id, path = %path.display(), "opening project graph");
        let graph = Arc::new(PointerGraph::open(path, self.config.embedding_dimension).await?);
        graphs.insert(project_id.to_owned(), graph.clone());
        Ok(graph)
    }

    async fn skills_for(&self, project_id: &str) -> Result<Arc<SkillLibrary>> {
        let mut skills = self.skills.lock().await;
        if let Some(library) = skills.get(project_id) {
            return Ok(library.clone());
        }
        let path = match self.guard.resolve_project_root(project_id) {
            Some(root) => root.join(".synapse").join("skills"),
            None => self.config.data_root.join(project_id).join("skills"),
        };
        info!(project_id, path = %path.display(), "loading skill library");
        let library = Arc::new(
            SkillLibrary::load(path, self.config.embedding_dimension, self.embedder.clone())
                .await?,
        );
        skills.insert(project_id.to_owned(), library.clone());
        Ok(library)
    }

    /// Feed indexer output into the project graph as context nodes.
    #[instrument(skip(self, nodes), fields(count = nodes.len()))]
    pub async fn ingest_sync_results(&self, project_id: &str, nodes: Vec<CodeNode>) -> Result<()> {
        let graph = self.graph_for(project_id).await?;
        for node in nodes {
            let mut metadata = BTreeMap::new();
            metadata.insert("file_path".to_owned(), node.file_path);
            metadata.insert("node_name".to_owned(), node.name);
            metadata.insert("node_type".to_owned(), node.kind);
            metadata.insert("dependencies".to_owned(), node.dependencies.join(","));
            let embedding = if node.embedding.is_empty() {
                None
            } else {
                Some(node.embedding.as_slice())
            };
            graph
                .add_node(node.content, NodeKind::ContextCode, "", embedding, metadata)
                .await;
        }
        graph.save().await?;
        info!(total = graph.node_count(), "sync ingestion complete");
        Ok(())
    }

    fn notify(&self, observer: &dyn AgentObserver, phase: Phase, payload: impl Into<String>) {
        let event = PhaseEvent::new(phase, payload);
        observer.notify(&event);
        self.trace.record(event);
    }

    fn notify_timed(
        &self,
        observer: &dyn AgentObserver,
        phase: Phase,
        payload: impl Into<String>,
        duration_ms: f64,
    ) {
        let mut event = PhaseEvent::new(phase, payload);
        event.duration_ms = Some(duration_ms);
        observer.notify(&event);
        self.trace.record(event);
    }

    fn load_full_context(&self, project_id: &str) -> String {
        let mut candidates = Vec::new();
        if let Some(root) = self.guard.resolve_project_root(project_id) {
            candidates.push(
                root.join(".synapse")
                    .join("converted_files")
                    .join("_full_context.txt"),
            );
        }
        candidates.push(
            self.config
                .data_root
                .join(project_id)
                .join("_full_context.txt"),
        );

        for path in candidates {
            if let Ok(content) = std::fs::read_to_string(&path) {
                if content.len() > FULL_CONTEXT_BYTE_BUDGET {
                    let mut cut = content;
                    cut.truncate(FULL_CONTEXT_BYTE_BUDGET);
                    return cut;
                }
                return content;
            }
        }
        String::new()
    }

    /// Related-code block: neighbours of the prompt embedding plus their
    /// children, named where the sync metadata allows.
    fn relational_context(&self, graph: &PointerGraph, prompt_vec: &[f32]) -> String {
        if prompt_vec.is_empty() {
            return String::new();
        }
        let top = graph.semantic_search(prompt_vec, RELATED_NODES);
        if top.is_empty() {
            return String::new();
        }

        let mut out = String::from("### RELATED CODE RELATIONSHIPS\n");
        let mut expanded = String::new();
        for node in &top {
            for child in graph.get_children(&node.id) {
                let child_name = child.meta("node_name").unwrap_or("anonymous_symbol");
                out.push_str(&format!("- {} -> links to -> {}\n", node.id, child_name));
                if child.kind == NodeKind::ContextCode {
                    let file = child.meta("file_path").unwrap_or("unknown_file");
                    expanded.push_str(&format!("\n# FILE: {}\n{}\n", file, child.content));
                }
            }
            if let Some(file) = node.meta("file_path") {
                out.push_str(&format!("- {} ({})\n", node.id, file));
            }
        }
        out.push_str(&expanded);
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn compose_prompt(
        &self,
        request: &AgentRequest,
        manifest: &str,
        relational: &str,
        skills_block: &str,
        full_context: &str,
        memories: &str,
        warnings: &str,
        monologue: &str,
        last_error: &str,
    ) -> String {
        let mut prompt = String::with_capacity(8192);
        prompt.push_str("### SYSTEM ROLE\nYou are 'Synapse', an autonomous coding agent.\n\n");
        prompt.push_str("### TOOL MANIFEST\n");
        prompt.push_str(manifest);
        prompt.push_str(
            "BATCH MODE ENABLED: you are encouraged to return a JSON LIST `[...]` of multiple tool calls to save time.\n\
             Example: `[ {\"tool\": \"apply_edit\", ...}, {\"tool\": \"execute_code\", ...} ]`\n\
             If you are confident, perform the edit, execution, and final answer in ONE response.\n\n",
        );
        prompt.push_str("### USER REQUEST\n");
        prompt.push_str(&request.prompt);
        prompt.push_str("\n\n");
        prompt.push_str(
            "### CRITICAL JSON FORMATTING RULES\n\
             1. INDENTATION IS VITAL: when writing Python code in JSON you MUST keep the real indentation.\n\
             \x20  WRONG: \"def foo():\\nreturn 1\"\n\
             \x20  RIGHT: \"def foo():\\n    return 1\"\n\
             2. Use single quotes for strings inside generated code: print('hello').\n\
             3. OUTPUT VALID JSON: start with `[` or `{`.\n\
             4. ESCAPE PROPERLY: newlines as \\n, tabs as \\t, quotes inside strings escaped.\n",
        );
        prompt.push_str(
            "### CODE GENERATION RULE\n\
             1. Write the full code inside a ```python block FIRST.\n\
             2. Then, inside your JSON, set \"content\": \"__CODE_BLOCK_0__\".\n\
             3. The system injects the code block into the file.\n",
        );
        prompt.push_str(relational);
        if !skills_block.is_empty() {
            prompt.push_str(skills_block);
            prompt.push('\n');
        }
        if !full_context.is_empty() {
            prompt.push_str("\n### FULL CODEBASE\n");
            prompt.push_str(full_context);
            prompt.push('\n');
        }
        let plan_block = self.planner.render_for_prompt();
        if !plan_block.is_empty() {
            prompt.push_str(&plan_block);
            prompt.push('\n');
        }
        if !memories.is_empty() {
            prompt.push_str(memories);
            prompt.push('\n');
        }
        if !monologue.is_empty() {
            prompt.push_str("### EXECUTION HISTORY (Read-Only)\n");
            prompt.push_str(monologue);
            prompt.push('\n');
        }
        if !warnings.is_empty() {
            prompt.push_str(warnings);
            prompt.push('\n');
        }
        if !last_error.is_empty() {
            prompt.push_str("\n### PREVIOUS ERROR\n");
            prompt.push_str(last_error);
            prompt.push_str("\nREQUIRED: Fix this error.\n");
        }
        prompt
    }

    /// Dispatch with a crash barrier: a panicking tool becomes a
    /// `SYSTEM EXCEPTION:` observation instead of unwinding the loop.
    async fn safe_execute_tool(&self, tool_name: &str, params: Value) -> String {
        let registry = self.registry.clone();
        let name = tool_name.to_owned();
        let started = Instant::now();
        let result = match tokio::spawn(async move { registry.dispatch(&name, params).await }).await
        {
            Ok(observation) => observation,
            Err(join_error) => {
                warn!(tool_name, %join_error, "tool crashed");
                format!("SYSTEM EXCEPTION: {join_error}")
            }
        };
        let elapsed = started.elapsed().as_millis();
        if is_failure_observation(&result) {
            warn!(tool_name, elapsed_ms = elapsed, "tool reported failure");
        } else {
            info!(
                tool_name,
                elapsed_ms = elapsed,
                output_len = result.len(),
                "tool finished"
            );
        }
        result
    }

    fn clean_response_text(text: &str) -> String {
        text.replace(['\r', '\u{c}'], "")
    }

    /// Run one request to a terminal answer or step exhaustion. Nothing
    /// escapes this boundary: every internal error becomes part of the
    /// returned text or an observation the model can react to.
    #[instrument(skip(self, request, observer), fields(project_id = %request.project_id, session_id = %request.session_id))]
    pub async fn run(&self, request: AgentRequest, observer: &dyn AgentObserver) -> String {
        let mission_started = Instant::now();

        // One in-flight request per session; later requests queue here.
        let session_lock = self.sessions.lock_for(&request.session_id);
        let _session_guard = session_lock.lock().await;

        self.notify(
            observer,
            Phase::Startup,
            format!("Mission received for project {}", request.project_id),
        );

        let graph = match self.graph_for(&request.project_id).await {
            Ok(graph) => graph,
            Err(error) => {
                let message = format!("ERROR: Failed to open project memory: {error}");
                self.notify(observer, Phase::Fatal, message.clone());
                return message;
            }
        };

        let prompt_vec = match self.embedder.embed(&request.prompt).await {
            Ok(vector) => vector,
            Err(error) => {
                warn!(%error, "prompt embedding failed, running without recall");
                Vec::new()
            }
        };

        let relational = self.relational_context(&graph, &prompt_vec);

        let parent_node_id = self.sessions.cursor_or_restore(&graph, &request.session_id);

        // Every node minted by this request carries the session tag so a
        // cold restore lands on the chain's true tail.
        let session_meta =
            BTreeMap::from([("session_id".to_owned(), request.session_id.clone())]);

        let embedding = (!prompt_vec.is_empty()).then_some(prompt_vec.as_slice());
        let root_node_id = graph
            .add_node(
                &request.prompt,
                NodeKind::Prompt,
                &parent_node_id,
                embedding,
                session_meta.clone(),
            )
            .await;
        let mut last_graph_node = root_node_id.clone();

        let skills_block = match self.skills_for(&request.project_id).await {
            Ok(library) => library.retrieve(&request.session_id, &request.prompt, &prompt_vec),
            Err(error) => {
                warn!(%error, "skill library unavailable");
                String::new()
            }
        };

        let mut monologue = if parent_node_id.is_empty() {
            String::new()
        } else {
            format_history(&graph.get_trace(&parent_node_id))
        };

        let mut memories = String::new();
        let mut warnings = String::new();
        if !prompt_vec.is_empty() {
            let recall = self.vault.recall(&prompt_vec);
            if recall.has_memories {
                if !recall.positive_hints.is_empty() {
                    memories = format!("\n### SUCCESSFUL STRATEGIES\n{}", recall.positive_hints);
                }
                if !recall.negative_warnings.is_empty() {
                    warnings = format!("\n### KNOWN PITFALLS\n{}", recall.negative_warnings);
                }
            }
        }

        let full_context = self.load_full_context(&request.project_id);
        let manifest = self.registry.manifest();

        let mut final_output = "Mission Timed Out.".to_owned();
        let mut last_error = String::new();
        let mut last_effective_prompt = String::new();

        'mission: for _step in 0..self.config.max_steps {
            let prompt = self.compose_prompt(
                &request,
                &manifest,
                &relational,
                &skills_block,
                &full_context,
                &memories,
                &warnings,
                &monologue,
                &last_error,
            );

            last_effective_prompt = prompt.clone();

            self.notify(observer, Phase::Thinking, "Processing logic...");
            let generation = match self.embedder.generate_text(&prompt).await {
                Ok(generation) => generation,
                Err(error) => {
                    final_output = format!("ERROR: AI Service Failure: {error}");
                    self.notify(observer, Phase::Fatal, final_output.clone());
                    break 'mission;
                }
            };
            if !generation.ok {
                final_output = format!(
                    "ERROR: AI Service Failure. The model provider declined the request: {}",
                    generation.text
                );
                self.notify(observer, Phase::Fatal, final_output.clone());
                break 'mission;
            }

            let raw = generation.text;
            let code_blocks = extract_code_blocks(&raw);
            let actions = as_action_batch(extract_json(&raw));
            let is_batch = actions.len() > 1;
            let mut batch_approved = false;

            for action in actions.iter() {
                let Some(action) = normalise_action(action) else {
                    if !is_batch {
                        // No structured action at all: the raw text is the
                        // reply.
                        final_output = raw.clone();
                        last_graph_node = graph
                            .add_node(
                                &final_output,
                                NodeKind::Response,
                                &last_graph_node,
                                None,
                                session_meta.clone(),
                            )
                            .await;
                        self.notify_timed(
                            observer,
                            Phase::Final,
                            final_output.clone(),
                            mission_started.elapsed().as_millis() as f64,
                        );
                        break 'mission;
                    }
                    continue;
                };
                let tool_name = action.tool.clone();

                let mut params = action.parameters.clone();
                inject_code_blocks(&mut params, &code_blocks);
                params["project_id"] = json!(request.project_id.clone());
                if batch_approved {
                    params[synapse_planning::BATCH_MODE_KEY] = json!(true);
                }

                if let Some(thought) = action.thought.as_deref() {
                    last_graph_node = graph
                        .add_node(
                            thought,
                            NodeKind::SystemThought,
                            &last_graph_node,
                            None,
                            session_meta.clone(),
                        )
                        .await;
                    monologue.push_str("\n[THOUGHT] ");
                    monologue.push_str(thought);
                    self.notify(observer, Phase::Planning, thought);
                }

                if tool_name == "propose_plan" {
                    // Fold past failures into the plan review instead of
                    // letting the model re-walk a known dead end.
                    if !prompt_vec.is_empty() {
                        let recall = self.vault.recall(&prompt_vec);
                        if !recall.negative_warnings.is_empty() {
                            monologue.push_str("\nRecalling similar past failures:\n");
                            monologue.push_str(&recall.negative_warnings);
                        }
                    }

                    let Some(steps) = params.get("steps").and_then(Value::as_array).cloned()
                    else {
                        continue;
                    };
                    self.planner.propose_plan(&request.prompt, &steps);

                    if is_batch {
                        self.planner.approve_plan();
                        batch_approved = true;
                        self.notify(
                            observer,
                            Phase::Planning,
                            "Plan proposed and auto-approved for batch execution.",
                        );
                        continue;
                    }

                    let snapshot = self
                        .planner
                        .snapshot()
                        .and_then(|plan| serde_json::to_string(&plan).ok())
                        .unwrap_or_default();
                    self.notify(observer, Phase::Proposal, snapshot);
                    final_output = "Plan Proposed.".to_owned();
                    break 'mission;
                }

                let plan_snapshot = self.planner.snapshot();
                let decision =
                    ExecutionGuard::validate(&tool_name, &params, plan_snapshot.as_ref());
                if !decision.allowed {
                    warn!(reason = %decision.reason, "guard blocked action");
                    self.notify(observer, Phase::Blocked, decision.reason.clone());
                    monologue.push_str("\n[BLOCKED] ");
                    monologue.push_str(&decision.reason);
                    last_error = decision.reason;
                    break;
                }

                if tool_name == "FINAL_ANSWER" {
                    final_output = params
                        .get("answer")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_owned();
                    let mut response_meta = session_meta.clone();
                    response_meta.insert("status".to_owned(), "success".to_owned());
                    last_graph_node = graph
                        .add_node(
                            &final_output,
                            NodeKind::Response,
                            &last_graph_node,
                            None,
                            response_meta,
                        )
                        .await;
                    if last_error.is_empty() && !prompt_vec.is_empty() {
                        let action_text = format!(
                            "Solved via: {}",
                            monologue.chars().take(SUCCESS_MEMORY_SNIPPET).collect::<String>()
                        );
                        self.vault
                            .add_success(&request.prompt, &action_text, &prompt_vec)
                            .await;
                    }
                    self.notify_timed(
                        observer,
                        Phase::Final,
                        final_output.clone(),
                        mission_started.elapsed().as_millis() as f64,
                    );
                    break 'mission;
                }

                self.notify(observer, Phase::ToolExec, format!("Running {tool_name}"));
                let mut observation = self.safe_execute_tool(&tool_name, params.clone()).await;

                if tool_name == "apply_edit"
                    && observation.starts_with("SUCCESS")
                    && self.config.auto_verify_edits
                {
                    let path = params.get("path").and_then(Value::as_str).unwrap_or("");
                    if path.ends_with(".py") {
                        self.notify(observer, Phase::Verifying, "Running automated build check...");
                        let verify_params = json!({
                            "command": format!("python -m py_compile {path}"),
                            "project_id": request.project_id.clone(),
                        });
                        let build_log =
                            self.safe_execute_tool("run_command", verify_params).await;
                        if !build_log.contains("Exit Code: 0") {
                            observation = format!(
                                "EDIT APPLIED BUT BUILD FAILED:\n{build_log}\nACTION REQUIRED: Re-read the file and fix the syntax error."
                            );
                            self.notify(
                                observer,
                                Phase::AutoRepair,
                                "Build failed. Feeding error back to the model.",
                            );
                        }
                    }
                }

                let failed = is_failure_observation(&observation);

                if let Some(plan) = self.planner.snapshot()
                    && plan.status.is_executable()
                    && let Some(step) = plan.current_step()
                    && tools_match(&step.tool_name, &tool_name)
                {
                    let status = if failed {
                        StepStatus::Failed
                    } else {
                        StepStatus::Success
                    };
                    self.planner
                        .mark_step_status(plan.current_step_idx, status, &observation);
                }

                let mut signature = tool_name.clone();
                if let Some(path) = params.get("path").and_then(Value::as_str) {
                    signature.push(' ');
                    signature.push_str(path);
                }
                let mut call_meta = session_meta.clone();
                call_meta.insert("tool".to_owned(), tool_name.clone());
                last_graph_node = graph
                    .add_node(
                        &signature,
                        NodeKind::ToolCall,
                        &last_graph_node,
                        None,
                        call_meta,
                    )
                    .await;
                last_graph_node = graph
                    .add_node(
                        &observation,
                        NodeKind::ContextCode,
                        &last_graph_node,
                        None,
                        session_meta.clone(),
                    )
                    .await;

                monologue.push_str("\n[ACTION] ");
                monologue.push_str(&signature);
                monologue.push_str("\n### OBSERVATION (Result)\n```\n");
                monologue.push_str(&observation);
                monologue.push_str("\n```");

                if failed {
                    if !prompt_vec.is_empty() {
                        self.vault
                            .add_failure(
                                &request.prompt,
                                &format!("Tool Failed: {tool_name}"),
                                &prompt_vec,
                            )
                            .await;
                    }
                    last_error = observation;
                    self.notify(observer, Phase::ErrorCatch, "Action failed. Halting batch.");
                    break;
                }

                self.notify(observer, Phase::Success, format!("{tool_name} ok"));
            }
        }

        self.sessions
            .set_cursor(&request.session_id, &last_graph_node);

        // Stamp the mission outcome onto the prompt node; the only
        // mutation nodes ever see.
        let outcome = if final_output == "Mission Timed Out." {
            "timeout"
        } else if last_error.is_empty() {
            "success"
        } else {
            "failed"
        };
        graph.update_metadata(&root_node_id, "outcome", outcome);

        if let Err(error) = graph.save().await {
            warn!(%error, "final graph persistence failed");
        }

        let final_output = Self::clean_response_text(&final_output);
        let elapsed_ms = mission_started.elapsed().as_millis() as f64;
        self.interactions.record(InteractionRecord {
            project_id: request.project_id.clone(),
            session_id: request.session_id.clone(),
            user_query: request.prompt.clone(),
            final_answer: final_output.clone(),
            duration_ms: elapsed_ms,
            full_prompt: last_effective_prompt,
        });
        info!(elapsed_ms, "mission complete");

        final_output
    }
}
