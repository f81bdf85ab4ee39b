//! The episodic memory unit: a single recorded event in a session chain.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What a pointer node records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    /// User input.
    Prompt,
    /// Action taken by the agent.
    ToolCall,
    /// Code or observation text retrieved/produced.
    ContextCode,
    /// Final or intermediate answer.
    Response,
    /// Internal monologue.
    SystemThought,
    #[serde(other)]
    Unknown,
}

/// A node in the pointer graph.
///
/// Parent links form a forest: each node carries at most one parent id,
/// assigned once at creation. `vector_id` is a secondary index key into the
/// vector store, not an ownership link; it is `None` for nodes that were
/// never embedded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointerNode {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Wall-clock milliseconds at creation.
    pub timestamp: i64,
    /// Empty string for roots.
    #[serde(default)]
    pub parent_id: String,
    #[serde(default)]
    pub children_ids: Vec<String>,
    #[serde(default)]
    pub vector_id: Option<i64>,
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl PointerNode {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_empty()
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}
