use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use synapse_protocol::{NodeKind, PointerNode, next_node_id, now_millis};
use tracing::{debug, info, instrument, warn};

mod vector;

pub use vector::VectorIndex;

/// Graph snapshot file inside the storage directory.
const GRAPH_FILE: &str = "graph.json";

/// Snapshot cadence: persist after this many inserts.
const SAVE_EVERY: usize = 10;

/// Upper bound on a parent-chain walk; defends against corrupted links.
const MAX_TRACE_HOPS: usize = 50;

/// Map a project id onto a filesystem-safe directory name.
pub fn sanitise_project_id(project_id: &str) -> String {
    project_id
        .chars()
        .map(|c| match c {
            ':' | '/' | '\\' => '_',
            other => other,
        })
        .collect()
}

#[derive(Debug)]
struct GraphState {
    nodes: HashMap<String, PointerNode>,
    vector_to_node: HashMap<i64, String>,
    index: VectorIndex,
    inserts_since_save: usize,
}

impl GraphState {
    fn new(dimension: usize) -> Self {
        Self {
            nodes: HashMap::new(),
            vector_to_node: HashMap::new(),
            index: VectorIndex::new(dimension),
            inserts_since_save: 0,
        }
    }
}

/// The per-project hybrid store: an episodic parent/child graph of
/// conversation events married to a vector index over the same nodes.
///
/// Parents own the graph through the id-keyed map; children hold only
/// parent id strings, so the structure is a forest by construction.
/// Readers take shared access; `add_node`, `update_metadata` and `clear`
/// take exclusive access. Snapshots are copied out under the lock and
/// serialised outside it.
pub struct PointerGraph {
    storage_path: PathBuf,
    dimension: usize,
    state: RwLock<GraphState>,
}

impl PointerGraph {
    /// Open a graph at `storage_path`, loading any previous snapshot.
    /// Partial state never fails the open: a missing vector index loads
    /// empty and a corrupt graph file starts fresh.
    pub async fn open(storage_path: impl Into<PathBuf>, dimension: usize) -> Result<Self> {
        let storage_path = storage_path.into();
        tokio::fs::create_dir_all(&storage_path)
            .await
            .with_context(|| format!("failed creating graph dir {storage_path:?}"))?;

        let graph = Self {
            storage_path,
            dimension,
            state: RwLock::new(GraphState::new(dimension)),
        };
        graph.load().await;
        Ok(graph)
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    /// Append a node, linking it under `parent_id` (empty for a root) and
    /// registering its embedding when one is supplied. Returns the new id.
    ///
    /// Periodically persists the whole graph; persistence failures are
    /// logged and swallowed because the in-memory state stays
    /// authoritative.
    #[instrument(skip(self, content, embedding, metadata), fields(kind = ?kind))]
    pub async fn add_node(
        &self,
        content: impl Into<String>,
        kind: NodeKind,
        parent_id: &str,
        embedding: Option<&[f32]>,
        metadata: BTreeMap<String, String>,
    ) -> String {
        let content = content.into();
        let (id, snapshot) = {
            let mut state = self.state.write();
            let id = next_node_id();

            let mut node = PointerNode {
                id: id.clone(),
                kind,
                timestamp: now_millis(),
                parent_id: String::new(),
                children_ids: Vec::new(),
                vector_id: None,
                content,
                metadata,
            };

            if !parent_id.is_empty() {
                if let Some(parent) = state.nodes.get_mut(parent_id) {
                    parent.children_ids.push(id.clone());
                    node.parent_id = parent_id.to_owned();
                } else {
                    warn!(parent_id, "parent not found, node becomes a root");
                }
            }

            if let Some(vector) = embedding {
                match state.index.insert(vector) {
                    Ok(handle) => {
                        node.vector_id = Some(handle);
                        state.vector_to_node.insert(handle, id.clone());
                    }
                    Err(error) => {
                        warn!(%error, "embedding rejected, node stored without vector");
                    }
                }
            }

            state.nodes.insert(id.clone(), node);
            state.inserts_since_save += 1;

            let snapshot = if state.inserts_since_save >= SAVE_EVERY {
                state.inserts_since_save = 0;
                Some((Self::copy_nodes(&state), state.index.clone()))
            } else {
                None
            };
            (id, snapshot)
        };

        if let Some(snapshot) = snapshot {
            // Serialisation happens outside the lock on a copied snapshot;
            // failures are logged only, in-memory state stays authoritative.
            if let Err(error) = self.write_snapshot(snapshot).await {
                warn!(%error, "periodic graph persistence failed");
            }
        }
        id
    }

    fn copy_nodes(state: &GraphState) -> Vec<PointerNode> {
        let mut nodes: Vec<PointerNode> = state.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Point mutation of one node's metadata map.
    pub fn update_metadata(&self, node_id: &str, key: &str, value: &str) {
        let mut state = self.state.write();
        if let Some(node) = state.nodes.get_mut(node_id) {
            node.metadata.insert(key.to_owned(), value.to_owned());
        }
    }

    pub fn get_node(&self, node_id: &str) -> Option<PointerNode> {
        self.state.read().nodes.get(node_id).cloned()
    }

    /// Nearest nodes to `query`, materialised in decreasing similarity.
    pub fn semantic_search(&self, query: &[f32], k: usize) -> Vec<PointerNode> {
        let state = self.state.read();
        state
            .index
            .search(query, k)
            .into_iter()
            .filter_map(|(handle, _)| {
                state
                    .vector_to_node
                    .get(&handle)
                    .and_then(|id| state.nodes.get(id))
                    .cloned()
            })
            .collect()
    }

    /// A node's children, in insertion order.
    pub fn get_children(&self, node_id: &str) -> Vec<PointerNode> {
        let state = self.state.read();
        let Some(node) = state.nodes.get(node_id) else {
            return Vec::new();
        };
        node.children_ids
            .iter()
            .filter_map(|child_id| state.nodes.get(child_id))
            .cloned()
            .collect()
    }

    /// Walk parent links from `end_id` to the root and return the chain in
    /// chronological order. The walk is capped so a corrupted cycle cannot
    /// hang a request.
    pub fn get_trace(&self, end_id: &str) -> Vec<PointerNode> {
        let state = self.state.read();
        let mut trace = Vec::new();
        let mut current = end_id.to_owned();

        while !current.is_empty() {
            let Some(node) = state.nodes.get(&current) else {
                break;
            };
            trace.push(node.clone());
            current = node.parent_id.clone();
            if trace.len() >= MAX_TRACE_HOPS {
                break;
            }
        }

        trace.reverse();
        trace
    }

    /// Linear scan for nodes whose metadata maps `key` to `value`.
    pub fn query_by_metadata(&self, key: &str, value: &str) -> Vec<PointerNode> {
        let state = self.state.read();
        state
            .nodes
            .values()
            .filter(|node| node.meta(key) == Some(value))
            .cloned()
            .collect()
    }

    /// Persist the graph and vector index now.
    pub async fn save(&self) -> Result<()> {
        let snapshot = {
            let state = self.state.read();
            (Self::copy_nodes(&state), state.index.clone())
        };
        self.write_snapshot(snapshot).await
    }

    async fn write_snapshot(&self, (nodes, index): (Vec<PointerNode>, VectorIndex)) -> Result<()> {
        index.save(&self.storage_path).await?;

        let payload =
            serde_json::to_vec_pretty(&nodes).context("failed serialising graph nodes")?;
        let path = self.storage_path.join(GRAPH_FILE);
        tokio::fs::write(&path, payload)
            .await
            .with_context(|| format!("failed writing graph file {path:?}"))?;
        debug!(nodes = nodes.len(), "graph snapshot written");
        Ok(())
    }

    /// Reload from disk. Missing files are treated as empty state and a
    /// corrupt graph file is logged and skipped; partial recovery must
    /// never abort startup.
    pub async fn load(&self) {
        let index = VectorIndex::load(&self.storage_path, self.dimension).await;

        let path = self.storage_path.join(GRAPH_FILE);
        let nodes: Vec<PointerNode> = match tokio::fs::read(&path).await {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(nodes) => nodes,
                Err(error) => {
                    warn!(%error, path = %path.display(), "corrupt graph file, starting empty");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };

        let mut state = self.state.write();
        state.index = index;
        state.nodes.clear();
        state.vector_to_node.clear();
        for node in nodes {
            if let Some(handle) = node.vector_id {
                if state.index.contains(handle) {
                    state.vector_to_node.insert(handle, node.id.clone());
                } else {
                    warn!(node_id = %node.id, handle, "dangling vector handle dropped on load");
                }
            }
            state.nodes.insert(node.id.clone(), node);
        }
        if !state.nodes.is_empty() {
            info!(nodes = state.nodes.len(), "pointer graph loaded");
        }
    }

    /// Drop all state and re-initialise the vector index at the configured
    /// dimension, persisting the emptiness.
    pub async fn clear(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            *state = GraphState::new(self.dimension);
        }
        self.save().await
    }
}
