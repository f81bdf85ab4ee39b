//! Persisted configuration shapes.

use serde::{Deserialize, Serialize};

/// Per-project configuration, stored at `data/<project_id>/config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// File extensions (without the dot) the listing tool surfaces; empty
    /// means no extension filter.
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    /// Project-relative path prefixes hidden from every tool.
    #[serde(default)]
    pub ignored_paths: Vec<String>,
    /// Whitelist exceptions inside ignored prefixes.
    #[serde(default)]
    pub included_paths: Vec<String>,
    /// Absolute path of the source tree this project id maps to.
    #[serde(default)]
    pub local_path: String,
    /// Where derived artifacts (indexes, caches) for this project live.
    #[serde(default)]
    pub storage_path: String,
}

/// Shape of the root `keys.json` credential file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysFile {
    pub keys: Vec<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub serper: String,
}
