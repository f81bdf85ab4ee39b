use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use synapse_graph::VectorIndex;
use synapse_protocol::{MemoryRecall, now_millis};
use tracing::{debug, info, warn};

/// Records file inside the vault directory; the vector index keeps its own
/// snapshot alongside it.
const VAULT_FILE: &str = "vault.json";

/// Squared-L2 cut-off for recall over unit-normalised vectors. A tuning
/// parameter, not a contract: 0.5 is a near-exact match, 2.0 is
/// orthogonal.
const RECALL_DISTANCE_MAX: f32 = 1.35;

/// How many neighbours one recall inspects before thresholding.
const RECALL_CANDIDATES: usize = 4;

/// Long actions are cut to this many characters when rendered back into a
/// prompt.
const ACTION_SNIPPET_LEN: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VaultRecord {
    situation: String,
    action: String,
    vector_id: i64,
    /// +1.0 for a success pattern, -1.0 for a failure pattern.
    valence: f32,
    created_at: i64,
}

/// Process-wide long-term memory of situation→action patterns with a
/// valence sign. One instance serves every project; construction happens
/// once at startup.
pub struct MemoryVault {
    storage_path: PathBuf,
    state: RwLock<VaultInner>,
}

#[derive(Debug)]
struct VaultInner {
    records: Vec<VaultRecord>,
    index: VectorIndex,
}

impl MemoryVault {
    /// Open (and load) the vault at `storage_path`. Corrupt state is
    /// logged and discarded; the vault always opens.
    pub async fn open(storage_path: impl Into<PathBuf>, dimension: usize) -> Result<Self> {
        let storage_path = storage_path.into();
        tokio::fs::create_dir_all(&storage_path)
            .await
            .with_context(|| format!("failed creating vault dir {storage_path:?}"))?;

        let index = VectorIndex::load(&storage_path, dimension).await;
        let records = Self::load_records(&storage_path).await;
        let records = records
            .into_iter()
            .filter(|record| {
                let ok = index.contains(record.vector_id);
                if !ok {
                    warn!(vector_id = record.vector_id, "vault record lost its vector, dropped");
                }
                ok
            })
            .collect::<Vec<_>>();

        if !records.is_empty() {
            info!(records = records.len(), "memory vault loaded");
        }

        Ok(Self {
            storage_path,
            state: RwLock::new(VaultInner { records, index }),
        })
    }

    async fn load_records(dir: &Path) -> Vec<VaultRecord> {
        let path = dir.join(VAULT_FILE);
        match tokio::fs::read(&path).await {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(records) => records,
                Err(error) => {
                    warn!(%error, "vault records corrupt or version mismatch, starting fresh");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a pattern that worked.
    pub async fn add_success(&self, situation: &str, action: &str, embedding: &[f32]) {
        self.add_record(situation, action, embedding, 1.0).await;
    }

    /// Record a pattern that failed.
    pub async fn add_failure(&self, situation: &str, action: &str, embedding: &[f32]) {
        self.add_record(situation, action, embedding, -1.0).await;
    }

    async fn add_record(&self, situation: &str, action: &str, embedding: &[f32], valence: f32) {
        let snapshot = {
            let mut state = self.state.write();
            let handle = match state.index.insert(embedding) {
                Ok(handle) => handle,
                Err(error) => {
                    warn!(%error, "vault embedding rejected, pattern not recorded");
                    return;
                }
            };
            state.records.push(VaultRecord {
                situation: situation.to_owned(),
                action: action.to_owned(),
                vector_id: handle,
                valence,
                created_at: now_millis(),
            });
            debug!(
                total = state.records.len(),
                valence, "memory vault learned a new pattern"
            );
            (state.records.clone(), state.index.clone())
        };

        // Persistence failures never propagate; memory stays in RAM.
        if let Err(error) = self.write_snapshot(snapshot).await {
            warn!(%error, "vault persistence failed");
        }
    }

    async fn write_snapshot(
        &self,
        (records, index): (Vec<VaultRecord>, VectorIndex),
    ) -> Result<()> {
        index.save(&self.storage_path).await?;
        let payload = serde_json::to_vec_pretty(&records)?;
        tokio::fs::write(self.storage_path.join(VAULT_FILE), payload).await?;
        Ok(())
    }

    /// Nearest-pattern recall: neighbours within the distance cut-off,
    /// deduplicated by action text, actions truncated to a snippet, and
    /// split by valence into hints and warnings.
    pub fn recall(&self, query: &[f32]) -> MemoryRecall {
        let state = self.state.read();
        if state.records.is_empty() {
            return MemoryRecall::default();
        }

        let hits = state.index.search(query, RECALL_CANDIDATES);
        let mut positive = String::new();
        let mut negative = String::new();
        let mut seen_actions = Vec::new();

        for (handle, distance) in hits {
            if distance >= RECALL_DISTANCE_MAX {
                continue;
            }
            let Some(record) = state
                .records
                .iter()
                .find(|record| record.vector_id == handle)
            else {
                continue;
            };
            if seen_actions.iter().any(|seen| seen == &record.action) {
                continue;
            }
            seen_actions.push(record.action.clone());

            let action_snippet: String = record.action.chars().take(ACTION_SNIPPET_LEN).collect();
            let line = format!(
                "- SITUATION: {}\n  ACTION: {}\n",
                record.situation, action_snippet
            );
            if record.valence > 0.0 {
                positive.push_str(&line);
            } else {
                negative.push_str(&line);
            }
        }

        MemoryRecall {
            has_memories: !positive.is_empty() || !negative.is_empty(),
            positive_hints: positive,
            negative_warnings: negative,
        }
    }
}
