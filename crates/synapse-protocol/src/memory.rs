//! Memory types shared across the graph, vault and sync ingestion.

use serde::{Deserialize, Serialize};

/// A code symbol produced by the external sync/indexing collaborator and
/// fed into the project graph as a `CONTEXT_CODE` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeNode {
    pub id: String,
    pub name: String,
    pub file_path: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// The result of a long-term memory recall, split by valence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryRecall {
    /// Rendered block of past strategies that worked.
    pub positive_hints: String,
    /// Rendered block of past failures to avoid.
    pub negative_warnings: String,
    pub has_memories: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_node_tolerates_missing_embedding() {
        let raw = r#"{
            "id": "src/x.py::foo",
            "name": "foo",
            "file_path": "src/x.py",
            "type": "function_definition",
            "content": "def foo(): ..."
        }"#;
        let node: CodeNode = serde_json::from_str(raw).unwrap();
        assert!(node.embedding.is_empty());
        assert!(node.dependencies.is_empty());
    }

    #[test]
    fn empty_recall_has_no_memories() {
        let recall = MemoryRecall::default();
        assert!(!recall.has_memories);
        assert!(recall.positive_hints.is_empty());
    }
}
