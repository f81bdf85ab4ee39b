//! Whitelisted shell execution in the project root.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use synapse_paths::PathGuard;
use synapse_sandbox::{LocalShellRunner, SandboxLimits, SandboxRequest, SandboxRunner};

use crate::registry::{Tool, ToolMetadata};

/// Wall-clock budget for one build/test command.
const SHELL_TIMEOUT_SECS: u64 = 60;

/// Combined stdout+stderr cap.
const SHELL_OUTPUT_CAP: usize = 8 * 1024;

pub struct RunCommandTool {
    guard: Arc<PathGuard>,
    runner: Arc<LocalShellRunner>,
}

impl RunCommandTool {
    pub fn new(guard: Arc<PathGuard>, runner: Arc<LocalShellRunner>) -> Self {
        Self { guard, runner }
    }
}

#[async_trait]
impl Tool for RunCommandTool {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: "run_command",
            description: "Executes a shell command in the project root. Use this to compile code, run tests, or check build status. Returns stdout/stderr with the exit code.",
            params_schema: r#"{"type":"object","properties":{"command":{"type":"string"},"project_id":{"type":"string"}},"required":["command","project_id"]}"#,
        }
    }

    async fn execute(&self, params: Value) -> String {
        let command = params.get("command").and_then(Value::as_str).unwrap_or("");
        if command.is_empty() {
            return "ERROR: No command provided.".to_owned();
        }
        let project_id = params
            .get("project_id")
            .and_then(Value::as_str)
            .unwrap_or("");
        let Some(root) = self.guard.resolve_project_root(project_id) else {
            return "ERROR: Invalid Project ID.".to_owned();
        };

        let request = SandboxRequest {
            command: format!("{command} 2>&1"),
            cwd: root,
            env: BTreeMap::new(),
            limits: SandboxLimits {
                max_runtime_secs: SHELL_TIMEOUT_SECS,
                max_output_bytes: SHELL_OUTPUT_CAP,
            },
        };

        match self.runner.run(request).await {
            Ok(execution) => format!(
                "Exit Code: {}\nOUTPUT:\n{}",
                execution.exit_code, execution.output
            ),
            Err(_) => {
                "ERROR: Security Block. Only whitelisted build/test commands are allowed."
                    .to_owned()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
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

    async fn fixture(name: &str, whitelist: Vec<String>) -> (RunCommandTool, PathBuf, PathBuf) {
        let data_root = unique_test_root(&format!("{name}-data"));
        let project_root = unique_test_root(&format!("{name}-proj"));
        tokio::fs::create_dir_all(&project_root).await.unwrap();
        tokio::fs::write(project_root.join("marker.txt"), "here").await.unwrap();

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
            RunCommandTool::new(
                Arc::new(PathGuard::new(&data_root)),
                Arc::new(LocalShellRunner::new(whitelist)),
            ),
            data_root,
            project_root,
        )
    }

    #[tokio::test]
    async fn command_runs_in_project_root() {
        let (tool, data_root, project_root) = fixture("synapse-shell", vec!["ls".into()]).await;

        let result = tool
            .execute(json!({"project_id": "proj", "command": "ls"}))
            .await;
        assert!(result.starts_with("Exit Code: 0"));
        assert!(result.contains("marker.txt"));

        let _ = tokio::fs::remove_dir_all(data_root).await;
        let _ = tokio::fs::remove_dir_all(project_root).await;
    }

    #[tokio::test]
    async fn non_whitelisted_command_is_blocked() {
        let (tool, data_root, project_root) =
            fixture("synapse-shell-deny", vec!["ls".into()]).await;

        let result = tool
            .execute(json!({"project_id": "proj", "command": "curl http://example.com"}))
            .await;
        assert!(result.starts_with("ERROR: Security Block"));

        let _ = tokio::fs::remove_dir_all(data_root).await;
        let _ = tokio::fs::remove_dir_all(project_root).await;
    }

    #[tokio::test]
    async fn missing_command_and_project_are_errors() {
        let (tool, data_root, project_root) = fixture("synapse-shell-args", vec![]).await;

        let empty = tool.execute(json!({"project_id": "proj"})).await;
        assert_eq!(empty, "ERROR: No command provided.");

        let ghost = tool
            .execute(json!({"project_id": "ghost", "command": "ls"}))
            .await;
        assert_eq!(ghost, "ERROR: Invalid Project ID.");

        let _ = tokio::fs::remove_dir_all(data_root).await;
        let _ = tokio::fs::remove_dir_all(project_root).await;
    }
}
