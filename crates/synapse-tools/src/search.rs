//! Regex scan over text-like project files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::Value;
use synapse_paths::PathGuard;

use crate::fs_tools::resolve_target;
use crate::registry::{Tool, ToolMetadata};

/// Search stops after this many matching lines.
const MAX_MATCHES: usize = 200;

/// Extensions considered text-like enough to scan.
const SEARCHABLE_EXTENSIONS: &[&str] = &[
    "java", "cpp", "h", "hpp", "py", "ts", "js", "cs", "json", "rs", "toml", "md", "txt", "yaml",
    "yml",
];

pub struct PatternSearchTool {
    guard: Arc<PathGuard>,
}

impl PatternSearchTool {
    pub fn new(guard: Arc<PathGuard>) -> Self {
        Self { guard }
    }
}

struct SearchAccumulator {
    out: String,
    total_matches: usize,
    files_with_matches: usize,
    context_lines: usize,
}

impl SearchAccumulator {
    fn search_file(&mut self, root: &Path, path: &Path, re: &regex::Regex) {
        let Ok(content) = std::fs::read_to_string(path) else {
            return;
        };
        let lines: Vec<&str> = content.lines().collect();
        let mut file_block = String::new();
        let mut file_has_match = false;

        for (index, line) in lines.iter().enumerate() {
            if self.total_matches >= MAX_MATCHES {
                break;
            }
            if !re.is_match(line) {
                continue;
            }
            file_has_match = true;
            self.total_matches += 1;

            if self.context_lines > 0 {
                let from = index.saturating_sub(self.context_lines);
                let to = (index + self.context_lines).min(lines.len() - 1);
                for ctx in from..=to {
                    if ctx == index {
                        file_block.push_str(&format!("  {}: {}\n", ctx + 1, lines[ctx]));
                    } else {
                        file_block.push_str(&format!("     | {}\n", lines[ctx]));
                    }
                }
            } else {
                file_block.push_str(&format!("  {}: {}\n", index + 1, line));
            }
        }

        if file_has_match {
            self.files_with_matches += 1;
            let rel = path.strip_prefix(root).unwrap_or(path);
            self.out.push_str(&format!(
                "{}:\n{}\n",
                rel.to_string_lossy().replace('\\', "/"),
                file_block
            ));
        }
    }
}

#[async_trait]
impl Tool for PatternSearchTool {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: "pattern_search",
            description: "Recursively searches for a regex pattern. Returns file paths and matching lines. Best for finding usages and definitions.",
            params_schema: r#"{"type":"object","properties":{"path":{"type":"string"},"pattern":{"type":"string"},"context_lines":{"type":"integer"},"project_id":{"type":"string"}},"required":["path","pattern","project_id"]}"#,
        }
    }

    async fn execute(&self, params: Value) -> String {
        let (root, target) = match resolve_target(&self.guard, &params) {
            Ok(pair) => pair,
            Err(observation) => return observation,
        };
        let project_id = params
            .get("project_id")
            .and_then(Value::as_str)
            .unwrap_or("");
        if !self.guard.is_path_allowed(project_id, &target) {
            return "ERROR: Access Denied (Ignored Path).".to_owned();
        }
        if !target.exists() {
            return "ERROR: Path not found.".to_owned();
        }

        let pattern = params.get("pattern").and_then(Value::as_str).unwrap_or("");
        let re = match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(re) => re,
            Err(err) => return format!("ERROR: Invalid Regex Syntax: {err}"),
        };

        let context_lines = params
            .get("context_lines")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;

        let mut acc = SearchAccumulator {
            out: String::new(),
            total_matches: 0,
            files_with_matches: 0,
            context_lines,
        };

        if target.is_dir() {
            let mut stack = vec![target.clone()];
            while let Some(dir) = stack.pop() {
                if acc.total_matches >= MAX_MATCHES {
                    break;
                }
                let Ok(entries) = std::fs::read_dir(&dir) else {
                    continue;
                };
                let mut children: Vec<PathBuf> =
                    entries.flatten().map(|entry| entry.path()).collect();
                children.sort();
                for path in children {
                    if acc.total_matches >= MAX_MATCHES {
                        break;
                    }
                    if path.is_dir() {
                        stack.push(path);
                    } else if path
                        .extension()
                        .and_then(|ext| ext.to_str())
                        .is_some_and(|ext| SEARCHABLE_EXTENSIONS.contains(&ext))
                        && self.guard.is_path_allowed(project_id, &path)
                    {
                        acc.search_file(&root, &path, &re);
                    }
                }
            }
        } else {
            acc.search_file(&root, &target, &re);
        }

        if acc.total_matches == 0 {
            return "NO MATCHES FOUND.".to_owned();
        }

        let mut out = acc.out;
        out.push_str(&format!(
            "\n[SUMMARY] Found {} matches in {} files.",
            acc.total_matches, acc.files_with_matches
        ));
        if acc.total_matches >= MAX_MATCHES {
            out.push_str(" (Search limit reached)");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use serde_json::json;
    use synapse_protocol::ProjectConfig;

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    async fn fixture(name: &str) -> (PatternSearchTool, PathBuf, PathBuf) {
        let data_root = unique_test_root(&format!("{name}-data"));
        let project_root = unique_test_root(&format!("{name}-proj"));
        tokio::fs::create_dir_all(project_root.join("src")).await.unwrap();
        tokio::fs::write(
            project_root.join("src/a.py"),
            "import os\n\ndef alpha():\n    return os.name\n",
        )
        .await
        .unwrap();
        tokio::fs::write(
            project_root.join("src/b.py"),
            "def beta():\n    return 'alpha beta'\n",
        )
        .await
        .unwrap();
        tokio::fs::write(project_root.join("src/binary.bin"), "alpha").await.unwrap();

        let config = ProjectConfig {
            local_path: project_root.to_string_lossy().into_owned(),
            ..ProjectConfig::default()
        };
        let dir = data_root.join("proj");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join("config.json"),
            serde_json::to_string_pretty(&config).unwrap(),
        )
        .await
        .unwrap();

        (
            PatternSearchTool::new(Arc::new(PathGuard::new(&data_root))),
            data_root,
            project_root,
        )
    }

    #[tokio::test]
    async fn finds_matches_with_line_numbers() {
        let (tool, data_root, project_root) = fixture("synapse-search").await;

        let result = tool
            .execute(json!({"project_id": "proj", "path": "src", "pattern": "alpha"}))
            .await;
        assert!(result.contains("src/a.py"));
        assert!(result.contains("src/b.py"));
        assert!(result.contains("3: def alpha():"));
        assert!(result.contains("[SUMMARY]"));
        // Non-text extensions are skipped.
        assert!(!result.contains("binary.bin"));

        let _ = tokio::fs::remove_dir_all(data_root).await;
        let _ = tokio::fs::remove_dir_all(project_root).await;
    }

    #[tokio::test]
    async fn invalid_regex_is_reported() {
        let (tool, data_root, project_root) = fixture("synapse-search-badre").await;
        let result = tool
            .execute(json!({"project_id": "proj", "path": "src", "pattern": "(unclosed"}))
            .await;
        assert!(result.starts_with("ERROR: Invalid Regex Syntax"));

        let _ = tokio::fs::remove_dir_all(data_root).await;
        let _ = tokio::fs::remove_dir_all(project_root).await;
    }

    #[tokio::test]
    async fn no_matches_is_explicit() {
        let (tool, data_root, project_root) = fixture("synapse-search-none").await;
        let result = tool
            .execute(json!({"project_id": "proj", "path": "src", "pattern": "zzz_nothing"}))
            .await;
        assert_eq!(result, "NO MATCHES FOUND.");

        let _ = tokio::fs::remove_dir_all(data_root).await;
        let _ = tokio::fs::remove_dir_all(project_root).await;
    }

    #[tokio::test]
    async fn context_lines_are_rendered() {
        let (tool, data_root, project_root) = fixture("synapse-search-ctx").await;
        let result = tool
            .execute(json!({
                "project_id": "proj",
                "path": "src/a.py",
                "pattern": "def alpha",
                "context_lines": 1
            }))
            .await;
        assert!(result.contains("3: def alpha():"));
        assert!(result.contains("|     return os.name"));

        let _ = tokio::fs::remove_dir_all(data_root).await;
        let _ = tokio::fs::remove_dir_all(project_root).await;
    }
}
