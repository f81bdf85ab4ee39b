//! Session→cursor registry with cold restore from the durable graph.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use synapse_graph::PointerGraph;
use tracing::info;

/// Maps each session id to the id of its latest graph node, and hands out
/// the per-session locks that serialise in-flight requests.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    cursors: Mutex<HashMap<String, String>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock guarding a session: one in-flight request per session id,
    /// later requests queue on it.
    pub fn lock_for(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(session_id.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// The session's cursor, restoring it from the graph on a cold miss:
    /// the session's newest node by timestamp wins. An unknown session
    /// yields the empty cursor (new root).
    pub fn cursor_or_restore(&self, graph: &PointerGraph, session_id: &str) -> String {
        if let Some(cursor) = self.cursors.lock().get(session_id) {
            return cursor.clone();
        }

        let restored = graph
            .query_by_metadata("session_id", session_id)
            .into_iter()
            .max_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|node| node.id)
            .unwrap_or_default();

        if !restored.is_empty() {
            info!(session_id, cursor = %restored, "session cursor restored from graph");
        }
        self.cursors
            .lock()
            .insert(session_id.to_owned(), restored.clone());
        restored
    }

    /// Move the cursor at the end of a request.
    pub fn set_cursor(&self, session_id: &str, node_id: &str) {
        self.cursors
            .lock()
            .insert(session_id.to_owned(), node_id.to_owned());
    }

    pub fn cursor(&self, session_id: &str) -> Option<String> {
        self.cursors.lock().get(session_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use synapse_protocol::NodeKind;

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn session_meta(session_id: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("session_id".to_owned(), session_id.to_owned())])
    }

    #[tokio::test]
    async fn cold_miss_restores_latest_session_node() {
        let graph = PointerGraph::open(unique_test_root("synapse-sessions"), 4)
            .await
            .unwrap();

        let first = graph
            .add_node("p1", NodeKind::Prompt, "", None, session_meta("S"))
            .await;
        let second = graph
            .add_node("r1", NodeKind::Response, &first, None, session_meta("S"))
            .await;
        graph
            .add_node("other", NodeKind::Prompt, "", None, session_meta("T"))
            .await;

        let registry = SessionRegistry::new();
        assert_eq!(registry.cursor_or_restore(&graph, "S"), second);
        // Second lookup hits the in-memory map.
        assert_eq!(registry.cursor_or_restore(&graph, "S"), second);

        let _ = tokio::fs::remove_dir_all(graph.storage_path()).await;
    }

    #[tokio::test]
    async fn unknown_session_starts_empty() {
        let graph = PointerGraph::open(unique_test_root("synapse-sessions-empty"), 4)
            .await
            .unwrap();
        let registry = SessionRegistry::new();
        assert!(registry.cursor_or_restore(&graph, "nope").is_empty());

        let _ = tokio::fs::remove_dir_all(graph.storage_path()).await;
    }

    #[test]
    fn set_cursor_overrides_restore() {
        let registry = SessionRegistry::new();
        registry.set_cursor("S", "node_x");
        assert_eq!(registry.cursor("S").unwrap(), "node_x");
    }

    #[tokio::test]
    async fn session_lock_serialises_requests() {
        let registry = Arc::new(SessionRegistry::new());
        let lock = registry.lock_for("S");
        let guard = lock.lock().await;

        let registry_clone = registry.clone();
        let contender = tokio::spawn(async move {
            let lock = registry_clone.lock_for("S");
            let _guard = lock.lock().await;
        });

        // The second request stays queued while the first holds the lock.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }
}
