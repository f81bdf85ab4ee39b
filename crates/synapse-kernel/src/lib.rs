use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use synapse_agent::{AgentConfig, AgentExecutor, AgentRequest, InteractionLog, PhaseHub, TraceLog};
use synapse_graph::PointerGraph;
use synapse_paths::PathGuard;
use synapse_protocol::{
    AgentObserver, CodeNode, EmbeddingService, ExecutionPlan, PhaseEvent, ProjectConfig,
};
use synapse_sandbox::LocalShellRunner;
use synapse_tools::ToolRegistry;
use synapse_vault::MemoryVault;
use tracing::instrument;

#[derive(Debug, Clone)]
pub struct KernelBuilder {
    data_root: PathBuf,
    allowed_commands: Vec<String>,
    max_steps: usize,
    embedding_dimension: usize,
    auto_verify_edits: bool,
}

impl KernelBuilder {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            allowed_commands: LocalShellRunner::with_default_whitelist().allowed_prefixes,
            max_steps: 16,
            embedding_dimension: 768,
            auto_verify_edits: true,
        }
    }

    pub fn allowed_commands(mut self, allowed_commands: Vec<String>) -> Self {
        self.allowed_commands = allowed_commands;
        self
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn embedding_dimension(mut self, dimension: usize) -> Self {
        self.embedding_dimension = dimension;
        self
    }

    pub fn auto_verify_edits(mut self, enabled: bool) -> Self {
        self.auto_verify_edits = enabled;
        self
    }

    pub async fn build(self, embedder: Arc<dyn EmbeddingService>) -> Result<SynapseKernel> {
        let guard = Arc::new(PathGuard::new(&self.data_root));
        let shell_runner = Arc::new(LocalShellRunner::new(self.allowed_commands));
        let registry = Arc::new(ToolRegistry::with_core_tools(guard.clone(), shell_runner));

        let vault = Arc::new(
            MemoryVault::open(
                self.data_root.join("memory_vault"),
                self.embedding_dimension,
            )
            .await?,
        );

        let config = AgentConfig {
            data_root: self.data_root,
            max_steps: self.max_steps,
            embedding_dimension: self.embedding_dimension,
            auto_verify_edits: self.auto_verify_edits,
        };
        let executor = Arc::new(AgentExecutor::new(
            config,
            guard.clone(),
            registry,
            vault.clone(),
            embedder,
        ));

        Ok(SynapseKernel {
            executor,
            vault,
            guard,
            hub: PhaseHub::new(1024),
        })
    }
}

/// The assembled agent core: one facade over the loop, the planner, the
/// per-project stores and the phase stream.
#[derive(Clone)]
pub struct SynapseKernel {
    executor: Arc<AgentExecutor>,
    vault: Arc<MemoryVault>,
    guard: Arc<PathGuard>,
    hub: PhaseHub,
}

impl SynapseKernel {
    /// Drive one request to completion, streaming phases to the kernel
    /// hub.
    #[instrument(skip_all)]
    pub async fn run_request(
        &self,
        project_id: impl Into<String>,
        session_id: impl Into<String>,
        prompt: impl Into<String>,
    ) -> String {
        let request = AgentRequest {
            project_id: project_id.into(),
            session_id: session_id.into(),
            prompt: prompt.into(),
        };
        self.executor.run(request, &self.hub).await
    }

    /// Drive one request with a caller-supplied observer (transport
    /// adapters stream these events to their client).
    pub async fn run_request_observed(
        &self,
        request: AgentRequest,
        observer: &dyn AgentObserver,
    ) -> String {
        self.executor.run(request, observer).await
    }

    /// Human approval for the currently proposed plan.
    pub fn approve_plan(&self) {
        self.executor.planner().approve_plan();
    }

    pub fn plan_snapshot(&self) -> Option<ExecutionPlan> {
        self.executor.planner().snapshot()
    }

    /// Register (or replace) a project's configuration under the data
    /// root.
    pub async fn register_project(
        &self,
        project_id: &str,
        config: &ProjectConfig,
    ) -> Result<()> {
        let dir = self.guard.data_root().join(project_id);
        tokio::fs::create_dir_all(&dir).await?;
        let payload = serde_json::to_string_pretty(config)?;
        tokio::fs::write(dir.join("config.json"), payload).await?;
        Ok(())
    }

    /// Feed indexer output into a project's graph.
    pub async fn ingest_sync_results(
        &self,
        project_id: &str,
        nodes: Vec<CodeNode>,
    ) -> Result<()> {
        self.executor.ingest_sync_results(project_id, nodes).await
    }

    /// Direct access to a project graph (admin/inspection surface).
    pub async fn graph(&self, project_id: &str) -> Result<Arc<PointerGraph>> {
        self.executor.graph_for(project_id).await
    }

    pub fn memory_vault(&self) -> Arc<MemoryVault> {
        self.vault.clone()
    }

    pub fn subscribe_phases(&self) -> tokio::sync::broadcast::Receiver<PhaseEvent> {
        self.hub.subscribe()
    }

    pub fn trace_log(&self) -> Arc<TraceLog> {
        self.executor.trace_log()
    }

    pub fn interaction_log(&self) -> Arc<InteractionLog> {
        self.executor.interaction_log()
    }

    /// The latest graph node id for a session, if it has run here.
    pub fn session_cursor(&self, session_id: &str) -> Option<String> {
        self.executor.session_cursor(session_id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::time::{SystemTime, UNIX_EPOCH};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use synapse_protocol::{
        Generation, KernelResult, NodeKind, Phase, PlanStatus,
    };

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    const DIM: usize = 8;

    /// Deterministic embedding plus a scripted sequence of model turns.
    struct ScriptedModel {
        turns: Mutex<VecDeque<String>>,
    }

    impl ScriptedModel {
        fn new(turns: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(turns.iter().map(|t| (*t).to_owned()).collect()),
            })
        }

        fn embed_text(text: &str) -> Vec<f32> {
            let mut vector = vec![0.0f32; DIM];
            for (index, byte) in text.bytes().enumerate() {
                vector[(byte as usize + index) % DIM] += 1.0;
            }
            vector
        }
    }

    #[async_trait]
    impl EmbeddingService for ScriptedModel {
        async fn embed(&self, text: &str) -> KernelResult<Vec<f32>> {
            Ok(Self::embed_text(text))
        }

        async fn embed_batch(&self, texts: &[String]) -> KernelResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| Self::embed_text(t)).collect())
        }

        async fn generate_text(&self, _prompt: &str) -> KernelResult<Generation> {
            match self.turns.lock().pop_front() {
                Some(text) => Ok(Generation {
                    text,
                    ok: true,
                    tokens: None,
                }),
                None => Ok(Generation::failure("script exhausted")),
            }
        }
    }

    /// Observer capturing every phase event for assertions.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<PhaseEvent>>,
    }

    impl Recorder {
        fn phases(&self) -> Vec<Phase> {
            self.events.lock().iter().map(|e| e.phase).collect()
        }

        fn contains_subsequence(&self, expected: &[Phase]) -> bool {
            let phases = self.phases();
            let mut cursor = 0usize;
            for phase in phases {
                if cursor < expected.len() && phase == expected[cursor] {
                    cursor += 1;
                }
            }
            cursor == expected.len()
        }
    }

    impl AgentObserver for Recorder {
        fn notify(&self, event: &PhaseEvent) {
            self.events.lock().push(event.clone());
        }
    }

    async fn project_fixture(data_root: &Path, project_id: &str) -> PathBuf {
        let project_root = unique_test_root(&format!("synapse-kernel-proj-{project_id}"));
        tokio::fs::create_dir_all(project_root.join("src")).await.unwrap();
        tokio::fs::write(project_root.join("src/a.py"), "def a():\n    return 1\n")
            .await
            .unwrap();

        let config = ProjectConfig {
            local_path: project_root.to_string_lossy().into_owned(),
            ..ProjectConfig::default()
        };
        let dir = data_root.join(project_id);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join("config.json"),
            serde_json::to_string_pretty(&config).unwrap(),
        )
        .await
        .unwrap();
        project_root
    }

    async fn kernel_with_script(data_root: &Path, turns: &[&str]) -> SynapseKernel {
        KernelBuilder::new(data_root)
            .embedding_dimension(DIM)
            .auto_verify_edits(false)
            .allowed_commands(vec!["ls".into()])
            .build(ScriptedModel::new(turns))
            .await
            .unwrap()
    }

    async fn run(
        kernel: &SynapseKernel,
        recorder: &Recorder,
        session: &str,
        prompt: &str,
    ) -> String {
        kernel
            .run_request_observed(
                AgentRequest {
                    project_id: "proj".into(),
                    session_id: session.into(),
                    prompt: prompt.into(),
                },
                recorder,
            )
            .await
    }

    #[tokio::test]
    async fn fresh_session_read_only_task() {
        let data_root = unique_test_root("synapse-kernel-s1");
        let project_root = project_fixture(&data_root, "proj").await;

        let kernel = kernel_with_script(
            &data_root,
            &[
                r#"{"thought": "I should look at the directory first.", "tool": "list_dir", "parameters": {"path": "src"}}"#,
                r#"{"tool": "FINAL_ANSWER", "parameters": {"answer": "src contains a.py"}}"#,
            ],
        )
        .await;

        let recorder = Recorder::default();
        let answer = run(&kernel, &recorder, "S1", "list the files in src").await;
        assert_eq!(answer, "src contains a.py");

        assert!(recorder.contains_subsequence(&[
            Phase::Thinking,
            Phase::Planning,
            Phase::ToolExec,
            Phase::Final
        ]));

        // The session chain records prompt, thought, action, observation
        // and response in order.
        let graph = kernel.graph("proj").await.unwrap();
        let prompt_node = graph
            .query_by_metadata("session_id", "S1")
            .into_iter()
            .find(|node| node.is_root())
            .unwrap();
        let mut cursor = prompt_node.id.clone();
        let mut kinds = Vec::new();
        loop {
            let node = graph.get_node(&cursor).unwrap();
            kinds.push(node.kind);
            match node.children_ids.first() {
                Some(child) => cursor = child.clone(),
                None => break,
            }
        }
        assert_eq!(
            kinds,
            vec![
                NodeKind::Prompt,
                NodeKind::SystemThought,
                NodeKind::ToolCall,
                NodeKind::ContextCode,
                NodeKind::Response
            ]
        );

        let observation = graph
            .get_trace(kernel.session_cursor("S1").unwrap().as_str())
            .into_iter()
            .find(|node| node.kind == NodeKind::ContextCode)
            .unwrap();
        assert!(observation.content.contains("src/a.py"));

        // The prompt node carries the mission outcome and the request
        // landed in the interaction log.
        assert_eq!(prompt_node.meta("outcome"), Some("success"));
        let interactions = kernel.interaction_log().recent();
        assert_eq!(interactions.len(), 1);
        assert_eq!(interactions[0].final_answer, "src contains a.py");
        assert!(interactions[0].duration_ms >= 0.0);

        let _ = tokio::fs::remove_dir_all(data_root).await;
        let _ = tokio::fs::remove_dir_all(project_root).await;
    }

    #[tokio::test]
    async fn plan_gating_blocks_then_executes_after_approval() {
        let data_root = unique_test_root("synapse-kernel-s2");
        let project_root = project_fixture(&data_root, "proj").await;

        let kernel = kernel_with_script(
            &data_root,
            &[
                // Turn 1: unplanned edit, must be blocked.
                r#"{"tool": "apply_edit", "parameters": {"path": "src/x.py", "content": "def foo():\n    return 42\n"}}"#,
                // Turn 2: propose a plan; solo proposal ends the request.
                r#"{"tool": "propose_plan", "parameters": {"steps": [{"description": "create foo in x.py", "tool": "apply_edit", "parameters": {"path": "src/x.py"}}]}}"#,
                // Request 2 after approval: execute, then finish.
                r#"{"tool": "apply_edit", "parameters": {"path": "src/x.py", "content": "def foo():\n    return 42\n"}}"#,
                r#"{"tool": "FINAL_ANSWER", "parameters": {"answer": "foo added"}}"#,
            ],
        )
        .await;

        let recorder = Recorder::default();
        let first = run(
            &kernel,
            &recorder,
            "S2",
            "add a Python function foo that returns 42 to src/x.py",
        )
        .await;
        assert_eq!(first, "Plan Proposed.");
        assert!(recorder.contains_subsequence(&[Phase::Blocked, Phase::Proposal]));
        assert_eq!(
            kernel.plan_snapshot().unwrap().status,
            PlanStatus::ReviewRequired
        );

        kernel.approve_plan();

        let recorder = Recorder::default();
        let second = run(&kernel, &recorder, "S2", "continue").await;
        assert_eq!(second, "foo added");

        let plan = kernel.plan_snapshot().unwrap();
        assert_eq!(plan.status, PlanStatus::Completed);

        let content = tokio::fs::read_to_string(project_root.join("src/x.py"))
            .await
            .unwrap();
        assert_eq!(content, "def foo():\n    return 42\n");

        let _ = tokio::fs::remove_dir_all(data_root).await;
        let _ = tokio::fs::remove_dir_all(project_root).await;
    }

    #[tokio::test]
    async fn edit_rollback_on_broken_syntax() {
        let data_root = unique_test_root("synapse-kernel-s3");
        let project_root = project_fixture(&data_root, "proj").await;
        let pre_image = "def keep():\n    return 1\n";
        tokio::fs::write(project_root.join("src/x.py"), pre_image)
            .await
            .unwrap();

        let prompt = "add a Python function foo that returns 42 to src/x.py";
        let kernel = kernel_with_script(
            &data_root,
            &[
                r#"{"tool": "propose_plan", "parameters": {"steps": [{"description": "edit x.py", "tool": "apply_edit", "parameters": {"path": "src/x.py"}}]}}"#,
                // After approval: broken content must be rejected.
                r#"{"tool": "apply_edit", "parameters": {"path": "src/x.py", "content": "def foo(\n    return 42"}}"#,
                r#"{"tool": "FINAL_ANSWER", "parameters": {"answer": "could not edit"}}"#,
            ],
        )
        .await;

        let recorder = Recorder::default();
        let first = run(&kernel, &recorder, "S3", prompt).await;
        assert_eq!(first, "Plan Proposed.");
        kernel.approve_plan();

        let recorder = Recorder::default();
        let _second = run(&kernel, &recorder, "S3", prompt).await;

        // The target is byte-identical to its pre-image, no sidecar.
        let content = tokio::fs::read_to_string(project_root.join("src/x.py"))
            .await
            .unwrap();
        assert_eq!(content, pre_image);
        assert!(!project_root.join("src/x.py.journal").exists());

        // The observation in the chain carries the rejection.
        let graph = kernel.graph("proj").await.unwrap();
        let cursor = kernel.session_cursor("S3").unwrap();
        assert!(
            graph
                .get_trace(&cursor)
                .iter()
                .any(|node| node.content.starts_with("ERROR: AST REJECTION"))
        );

        // The failure landed in long-term memory and comes back as a
        // warning for the same prompt.
        let query = ScriptedModel::embed_text(prompt);
        let recall = kernel.memory_vault().recall(&query);
        assert!(recall.has_memories);
        assert!(recall.negative_warnings.contains("apply_edit"));

        assert_eq!(kernel.plan_snapshot().unwrap().status, PlanStatus::Failed);

        let _ = tokio::fs::remove_dir_all(data_root).await;
        let _ = tokio::fs::remove_dir_all(project_root).await;
    }

    #[tokio::test]
    async fn session_continuity_across_restart() {
        let data_root = unique_test_root("synapse-kernel-s4");
        let project_root = project_fixture(&data_root, "proj").await;

        {
            let kernel = kernel_with_script(
                &data_root,
                &[r#"{"tool": "FINAL_ANSWER", "parameters": {"answer": "The answer is 42."}}"#],
            )
            .await;
            let recorder = Recorder::default();
            let answer = run(&kernel, &recorder, "S", "what is the answer?").await;
            assert_eq!(answer, "The answer is 42.");
        }

        // Fresh process: a new kernel over the same data root.
        let kernel = kernel_with_script(
            &data_root,
            &[r#"{"tool": "FINAL_ANSWER", "parameters": {"answer": "continuing"}}"#],
        )
        .await;
        let recorder = Recorder::default();
        let answer = run(&kernel, &recorder, "S", "continue").await;
        assert_eq!(answer, "continuing");

        let graph = kernel.graph("proj").await.unwrap();
        // The new prompt attached under the restored cursor: exactly one
        // root in the session chain, and the chain remembers P1.
        let cursor = kernel.session_cursor("S").unwrap();
        let trace = graph.get_trace(&cursor);
        assert!(trace.iter().any(|n| n.content == "what is the answer?"));
        assert!(trace.iter().any(|n| n.content == "The answer is 42."));

        let session_nodes = graph.query_by_metadata("session_id", "S");
        let roots = session_nodes.iter().filter(|n| n.is_root()).count();
        assert_eq!(roots, 1);

        let _ = tokio::fs::remove_dir_all(data_root).await;
        let _ = tokio::fs::remove_dir_all(project_root).await;
    }

    #[tokio::test]
    async fn sync_ingestion_feeds_semantic_search() {
        let data_root = unique_test_root("synapse-kernel-ingest");
        let project_root = project_fixture(&data_root, "proj").await;

        let kernel = kernel_with_script(&data_root, &[]).await;
        let embedding = ScriptedModel::embed_text("def parse_config(): ...");
        kernel
            .ingest_sync_results(
                "proj",
                vec![CodeNode {
                    id: "src/a.py::parse_config".into(),
                    name: "parse_config".into(),
                    file_path: "src/a.py".into(),
                    kind: "function_definition".into(),
                    content: "def parse_config(): ...".into(),
                    embedding: embedding.clone(),
                    dependencies: vec!["os".into()],
                }],
            )
            .await
            .unwrap();

        let graph = kernel.graph("proj").await.unwrap();
        let hits = graph.semantic_search(&embedding, 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].meta("node_name"), Some("parse_config"));

        let _ = tokio::fs::remove_dir_all(data_root).await;
        let _ = tokio::fs::remove_dir_all(project_root).await;
    }

    #[tokio::test]
    async fn exhausted_script_degrades_gracefully() {
        let data_root = unique_test_root("synapse-kernel-degraded");
        let project_root = project_fixture(&data_root, "proj").await;

        let kernel = kernel_with_script(&data_root, &[]).await;
        let recorder = Recorder::default();
        let answer = run(&kernel, &recorder, "S", "anything").await;
        assert!(answer.starts_with("ERROR: AI Service Failure"));
        assert!(recorder.phases().contains(&Phase::Fatal));

        let _ = tokio::fs::remove_dir_all(data_root).await;
        let _ = tokio::fs::remove_dir_all(project_root).await;
    }
}
