//! Read-only filesystem tools: `read_file` and `list_dir`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use synapse_paths::PathGuard;
use tracing::warn;

use crate::registry::{Tool, ToolMetadata};

/// Files larger than this are refused by `read_file`.
const MAX_READ_BYTES: u64 = 512 * 1024;

/// Hard cap on entries one listing crawl will visit.
const MAX_CRAWL_ENTRIES: usize = 5_000;

/// Default recursion depth for `list_dir`.
const DEFAULT_DEPTH: usize = 2;

/// Resolve a tool's `{project_id, path}` pair to `(root, target)` or an
/// error observation.
pub(crate) fn resolve_target(
    guard: &PathGuard,
    params: &Value,
) -> Result<(PathBuf, PathBuf), String> {
    let project_id = params
        .get("project_id")
        .and_then(Value::as_str)
        .unwrap_or("");
    let Some(root) = guard.resolve_project_root(project_id) else {
        return Err("ERROR: Project path invalid or not registered.".to_owned());
    };

    let mut rel = params.get("path").and_then(Value::as_str).unwrap_or(".");
    if rel.is_empty() || rel == "/" || rel == "\\" {
        rel = ".";
    }
    let target = root.join(rel);

    if !PathGuard::is_safe_path(&root, &target) {
        return Err("ERROR: Security Block (Path Traversal).".to_owned());
    }
    Ok((root, target))
}

pub struct ReadFileTool {
    guard: Arc<PathGuard>,
}

impl ReadFileTool {
    pub fn new(guard: Arc<PathGuard>) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: "read_file",
            description: "Reads a UTF-8 text file from the project. Use before editing anything.",
            params_schema: r#"{"type":"object","properties":{"path":{"type":"string"},"project_id":{"type":"string"}},"required":["path","project_id"]}"#,
        }
    }

    async fn execute(&self, params: Value) -> String {
        let (_root, target) = match resolve_target(&self.guard, &params) {
            Ok(pair) => pair,
            Err(observation) => return observation,
        };
        let project_id = params
            .get("project_id")
            .and_then(Value::as_str)
            .unwrap_or("");

        if !self.guard.is_path_allowed(project_id, &target) {
            warn!(target = %target.display(), "read denied by path rules");
            return "ERROR: Access Denied. This path is in the project's ignored list.".to_owned();
        }

        match tokio::fs::metadata(&target).await {
            Ok(meta) if meta.len() > MAX_READ_BYTES => "ERROR: File too large (>512KB).".to_owned(),
            Ok(_) => match tokio::fs::read_to_string(&target).await {
                Ok(content) => content,
                Err(err) => format!("ERROR: Failed to read file: {err}"),
            },
            Err(_) => format!(
                "ERROR: File not found at {}",
                params.get("path").and_then(Value::as_str).unwrap_or("?")
            ),
        }
    }
}

pub struct ListDirTool {
    guard: Arc<PathGuard>,
}

impl ListDirTool {
    pub fn new(guard: Arc<PathGuard>) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: "list_dir",
            description: "Recursively lists project files and directories, honoring the project's visibility rules.",
            params_schema: r#"{"type":"object","properties":{"path":{"type":"string"},"depth":{"type":"integer"},"project_id":{"type":"string"}},"required":["project_id"]}"#,
        }
    }

    async fn execute(&self, params: Value) -> String {
        let (root, target) = match resolve_target(&self.guard, &params) {
            Ok(pair) => pair,
            Err(observation) => return observation,
        };
        if !target.exists() {
            return "ERROR: Path not found.".to_owned();
        }

        let project_id = params
            .get("project_id")
            .and_then(Value::as_str)
            .unwrap_or("");
        let depth = params
            .get("depth")
            .and_then(Value::as_u64)
            .map(|d| d as usize)
            .unwrap_or(DEFAULT_DEPTH)
            .max(1);

        let config = self.guard.load_config(project_id);
        let trie = synapse_paths::RuleTrie::from_config(&config);

        let mut lines = Vec::new();
        let mut visited = 0usize;
        let mut stack = vec![(target.clone(), 0usize)];

        while let Some((dir, level)) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            let mut children: Vec<_> = entries.flatten().collect();
            children.sort_by_key(|entry| entry.file_name());

            for entry in children {
                visited += 1;
                if visited > MAX_CRAWL_ENTRIES {
                    break;
                }
                let path = entry.path();
                let Ok(rel) = path.strip_prefix(&root) else {
                    continue;
                };
                let is_dir = path.is_dir();

                let flags = trie.check(rel);
                let ignored = flags & synapse_paths::FLAG_IGNORE != 0;
                let included = flags & synapse_paths::FLAG_INCLUDE != 0;
                let bridge = ignored && trie.leads_to_include(rel);

                if is_dir {
                    // An ignored directory stays visible only as an
                    // exception or as the bridge toward one.
                    if ignored && !included && !bridge {
                        continue;
                    }
                    lines.push(format!(
                        "{}{}/",
                        "  ".repeat(level),
                        rel.to_string_lossy().replace('\\', "/")
                    ));
                    if level + 1 < depth {
                        stack.push((path, level + 1));
                    }
                } else {
                    if ignored && !included {
                        continue;
                    }
                    let ext = path
                        .extension()
                        .map(|e| e.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let ext_match = config.allowed_extensions.is_empty()
                        || config.allowed_extensions.iter().any(|a| *a == ext);
                    if !ext_match && !included {
                        continue;
                    }
                    lines.push(format!(
                        "{}{}",
                        "  ".repeat(level),
                        rel.to_string_lossy().replace('\\', "/")
                    ));
                }
            }
            if visited > MAX_CRAWL_ENTRIES {
                break;
            }
        }

        let mut out = format!("WORKSPACE: {}\n", root.to_string_lossy().replace('\\', "/"));
        if lines.is_empty() {
            out.push_str("(No visible files matching filters)\n");
        } else {
            lines.sort();
            for line in lines {
                out.push_str(&line);
                out.push('\n');
            }
        }
        out
    }
}
