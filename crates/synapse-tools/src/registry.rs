//! Name→tool dispatch with a uniform result envelope.
//!
//! Observations beginning with `ERROR:` or `SYSTEM EXCEPTION:` denote
//! failure; anything else is a successful observation. The registry is
//! immutable after startup.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::{info, instrument, warn};

/// What a tool tells the model about itself.
#[derive(Debug, Clone)]
pub struct ToolMetadata {
    pub name: &'static str,
    pub description: &'static str,
    /// JSON schema for the parameters object, as a literal string.
    pub params_schema: &'static str,
}

/// A named capability. `execute` returns the textual observation envelope
/// and must not panic; the dispatch wrapper in the agent crate is the
/// crash barrier of last resort.
#[async_trait]
pub trait Tool: Send + Sync {
    fn metadata(&self) -> ToolMetadata;
    async fn execute(&self, params: Value) -> String;
}

/// Immutable name→tool table plus the manifest the model sees. The map
/// keeps registration order so the manifest reads the way the tools were
/// wired.
#[derive(Default)]
pub struct ToolRegistry {
    tools: IndexMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.metadata().name;
        if self.tools.insert(name, tool).is_some() {
            warn!(name, "tool re-registered, previous definition replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }

    /// The concatenated tool descriptions injected into the model prompt.
    pub fn manifest(&self) -> String {
        let mut out = String::new();
        for tool in self.tools.values() {
            let meta = tool.metadata();
            out.push_str(&format!(
                "- {}: {}\n  params: {}\n",
                meta.name, meta.description, meta.params_schema
            ));
        }
        out
    }

    /// Synchronous name lookup, then execution. Unknown names come back as
    /// an `ERROR:` observation like any other tool failure.
    #[instrument(skip(self, params), fields(tool = name))]
    pub async fn dispatch(&self, name: &str, params: Value) -> String {
        let Some(tool) = self.get(name) else {
            warn!(name, "unknown tool requested");
            return format!("ERROR: Unknown tool '{name}'. Check the tool manifest.");
        };
        info!(name, "tool dispatch");
        tool.execute(params).await
    }
}

/// Whether an observation envelope denotes failure.
pub fn is_failure_observation(observation: &str) -> bool {
    observation.starts_with("ERROR:") || observation.starts_with("SYSTEM EXCEPTION:")
}
