use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use synapse_graph::VectorIndex;
use synapse_protocol::EmbeddingService;
use tracing::{debug, info, warn};

/// Rule files with these extensions are picked up from the skill
/// directory.
const SKILL_EXTENSIONS: &[&str] = &["yaml", "yml", "json", "md"];

/// Squared-L2 acceptance threshold. Strict on purpose: a loose match
/// injects noise the model then treats as policy.
const SKILL_DISTANCE_MAX: f32 = 1.1;

/// How many rules one retrieval considers before thresholding.
const SKILL_CANDIDATES: usize = 3;

/// Prompts at or under this length are treated as short follow-ups
/// ("yes, proceed") and reuse the session's previous skill block instead
/// of re-retrieving against an uninformative query.
const FOLLOW_UP_MAX_LEN: usize = 32;

/// Rules are embedded from at most this many leading characters.
const EMBED_PREFIX_LEN: usize = 1000;

#[derive(Debug, Clone)]
struct SkillRule {
    name: String,
    content: String,
    vector_id: i64,
}

/// Per-project library of domain-rule snippets retrieved by semantic
/// match against the user prompt.
pub struct SkillLibrary {
    rules: RwLock<Vec<SkillRule>>,
    index: RwLock<VectorIndex>,
    /// session id → last rendered block handed to that session.
    session_cache: Mutex<HashMap<String, String>>,
    embedder: Arc<dyn EmbeddingService>,
    root_path: PathBuf,
    dimension: usize,
}

impl SkillLibrary {
    /// Load every rule file under `root_path` and embed it. A missing
    /// directory is created and yields an empty library.
    pub async fn load(
        root_path: impl Into<PathBuf>,
        dimension: usize,
        embedder: Arc<dyn EmbeddingService>,
    ) -> Result<Self> {
        let root_path = root_path.into();
        let library = Self {
            rules: RwLock::new(Vec::new()),
            index: RwLock::new(VectorIndex::new(dimension)),
            session_cache: Mutex::new(HashMap::new()),
            embedder,
            root_path,
            dimension,
        };
        library.reload().await?;
        Ok(library)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    /// Re-scan the skill directory and rebuild the index.
    pub async fn reload(&self) -> Result<()> {
        if !self.root_path.exists() {
            tokio::fs::create_dir_all(&self.root_path).await?;
            warn!(path = %self.root_path.display(), "skill directory created");
            return Ok(());
        }

        let mut files = Vec::new();
        collect_rule_files(&self.root_path, &mut files)?;

        let mut rules = Vec::new();
        let mut index = VectorIndex::new(self.dimension);
        for path in files {
            let Ok(content) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            if content.trim().is_empty() {
                continue;
            }
            let prefix: String = content.chars().take(EMBED_PREFIX_LEN).collect();
            let embedding = match self.embedder.embed(&prefix).await {
                Ok(vector) if !vector.is_empty() => vector,
                Ok(_) => continue,
                Err(error) => {
                    warn!(%error, path = %path.display(), "skill embedding failed, rule skipped");
                    continue;
                }
            };
            let Ok(vector_id) = index.insert(&embedding) else {
                continue;
            };
            let name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            rules.push(SkillRule {
                name,
                content,
                vector_id,
            });
        }

        info!(rules = rules.len(), "skill library loaded");
        *self.rules.write() = rules;
        *self.index.write() = index;
        self.session_cache.lock().clear();
        Ok(())
    }

    /// Retrieve the rules relevant to `prompt`, rendered as a prompt
    /// block. Short follow-up prompts return the session's cached block so
    /// a "yes, proceed" does not swap the rule set mid-conversation.
    pub fn retrieve(&self, session_id: &str, prompt: &str, prompt_vec: &[f32]) -> String {
        if prompt.trim().len() <= FOLLOW_UP_MAX_LEN {
            if let Some(cached) = self.session_cache.lock().get(session_id) {
                debug!(session_id, "short follow-up, reusing cached skill block");
                return cached.clone();
            }
        }

        let block = self.search_block(prompt_vec);
        self.session_cache
            .lock()
            .insert(session_id.to_owned(), block.clone());
        block
    }

    fn search_block(&self, prompt_vec: &[f32]) -> String {
        let rules = self.rules.read();
        if rules.is_empty() {
            return String::new();
        }

        let hits = self.index.read().search(prompt_vec, SKILL_CANDIDATES);
        let mut block = String::new();
        for (handle, distance) in hits {
            let Some(rule) = rules.iter().find(|rule| rule.vector_id == handle) else {
                continue;
            };
            if distance >= SKILL_DISTANCE_MAX {
                debug!(rule = %rule.name, distance, "skill rejected as irrelevant");
                continue;
            }
            if block.is_empty() {
                block.push_str("### BUSINESS CONTEXT & SKILLS (Strictly Follow)\n");
            }
            debug!(rule = %rule.name, distance, "skill accepted");
            block.push_str(&format!(
                "SOURCE: {}\nRULES:\n{}\n--------------------------------------------------\n",
                rule.name, rule.content
            ));
        }
        block
    }

    /// Forget a session's cached block (end of session).
    pub fn evict_session(&self, session_id: &str) {
        self.session_cache.lock().remove(session_id);
    }
}

fn collect_rule_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_rule_files(&path, out)?;
        } else if path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| SKILL_EXTENSIONS.contains(&ext))
        {
            out.push(path);
        }
    }
    Ok(())
}
