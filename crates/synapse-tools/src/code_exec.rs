//! Sandboxed code execution for model-written snippets.

use async_trait::async_trait;
use serde_json::Value;
use synapse_sandbox::{ContainerRunner, ExecLanguage, SandboxLimits};

use crate::registry::{Tool, ToolMetadata};

/// Snippets get a short leash.
const EXEC_TIMEOUT_SECS: u64 = 5;

const EXEC_OUTPUT_CAP: usize = 8 * 1024;

pub struct ExecuteCodeTool {
    runner: ContainerRunner,
}

impl ExecuteCodeTool {
    pub fn new(runner: ContainerRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Tool for ExecuteCodeTool {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: "execute_code",
            description: "Executes Python or JavaScript code in a secure sandbox with no network access. Input: {'lang': 'python'|'js', 'code': '...'}",
            params_schema: r#"{"type":"object","properties":{"lang":{"type":"string"},"code":{"type":"string"}},"required":["lang","code"]}"#,
        }
    }

    async fn execute(&self, params: Value) -> String {
        let lang_raw = params.get("lang").and_then(Value::as_str).unwrap_or("python");
        let code = params.get("code").and_then(Value::as_str).unwrap_or("");

        if code.is_empty() {
            return "ERROR: Code cannot be empty.".to_owned();
        }
        let Some(lang) = ExecLanguage::parse(lang_raw) else {
            return "ERROR: Unsupported language. Use 'python' or 'js'.".to_owned();
        };

        let limits = SandboxLimits {
            max_runtime_secs: EXEC_TIMEOUT_SECS,
            max_output_bytes: EXEC_OUTPUT_CAP,
        };
        match self.runner.execute(lang, code, limits).await {
            Ok(execution) => {
                let status = if execution.exit_code == 0 {
                    "SUCCESS"
                } else {
                    "RUNTIME_ERROR"
                };
                format!("### EXECUTION RESULT ({status})\n{}", execution.output)
            }
            Err(err) => format!("ERROR: Sandbox Interface Failure: {err}"),
        }
    }
}
