//! The tool action shape accepted from the model.

use serde::{Deserialize, Serialize};

/// One structured action extracted from free-form model output.
///
/// The canonical shape is `{thought?, tool, parameters}`; the extractor in
/// the agent crate also accepts the aliases `name`/`function` for `tool`
/// and `arguments`/`args` for `parameters` before constructing this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    pub tool: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl ToolAction {
    pub fn new(tool: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            thought: None,
            tool: tool.into(),
            parameters,
        }
    }

    /// String parameter lookup with an empty-string default.
    pub fn param_str(&self, key: &str) -> &str {
        self.parameters
            .get(key)
            .and_then(serde_json::Value::as_str)
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_serde_roundtrip() {
        let action = ToolAction {
            thought: Some("read first".into()),
            tool: "read_file".into(),
            parameters: json!({"path": "src/x.py"}),
        };
        let raw = serde_json::to_string(&action).unwrap();
        let back: ToolAction = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.tool, "read_file");
        assert_eq!(back.param_str("path"), "src/x.py");
    }

    #[test]
    fn missing_parameters_default_to_null() {
        let back: ToolAction = serde_json::from_str(r#"{"tool":"FINAL_ANSWER"}"#).unwrap();
        assert!(back.parameters.is_null());
        assert_eq!(back.param_str("answer"), "");
    }
}
