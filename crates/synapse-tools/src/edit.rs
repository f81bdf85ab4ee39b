//! The transactional file-edit tool.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use synapse_paths::PathGuard;
use synapse_syntax::SyntaxValidator;
use tracing::{info, warn};

use crate::fs_tools::resolve_target;
use crate::journal::JournaledWriter;
use crate::registry::{Tool, ToolMetadata};

pub struct ApplyEditTool {
    guard: Arc<PathGuard>,
    validator: SyntaxValidator,
    writer: JournaledWriter,
}

impl ApplyEditTool {
    pub fn new(guard: Arc<PathGuard>, validator: SyntaxValidator) -> Self {
        Self {
            guard,
            validator,
            writer: JournaledWriter::new(validator),
        }
    }
}

#[async_trait]
impl Tool for ApplyEditTool {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: "apply_edit",
            description: "Safely replaces a file's contents. The edit is syntax-checked and journaled; broken code is rejected before touching disk.",
            params_schema: r#"{"type":"object","properties":{"path":{"type":"string"},"content":{"type":"string"},"project_id":{"type":"string"}},"required":["path","content","project_id"]}"#,
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
        let rel_path = params.get("path").and_then(Value::as_str).unwrap_or("");
        let content = params.get("content").and_then(Value::as_str).unwrap_or("");

        if !self.guard.is_path_allowed(project_id, &target) {
            warn!(target = %target.display(), "write blocked by path rules");
            return "ERROR: Permission Denied. You cannot write to folders in the ignored list."
                .to_owned();
        }

        // Surface the syntax verdict before the journal machinery runs so
        // the model sees the precise rejection cause.
        let extension = target
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        if !self.validator.validate_syntax(content, &extension) {
            return format!(
                "ERROR: AST REJECTION. Your proposed code for '{rel_path}' contains syntax or indentation errors. Please fix the structure and try again."
            );
        }

        // Missing parents are created: a new module in a new directory is
        // a legitimate edit.
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                if let Err(err) = tokio::fs::create_dir_all(parent).await {
                    return format!("ERROR: Failed to create parent directories: {err}");
                }
            }
        }

        info!(target = %target.display(), bytes = content.len(), "attempting journaled write");
        if self.writer.apply_surgery_safe(&target, content).await {
            "SUCCESS: File updated safely.".to_owned()
        } else {
            "ERROR: Edit rejected by Safety Engine.".to_owned()
        }
    }
}
