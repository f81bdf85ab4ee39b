//! The terminal tool. The agent loop intercepts it before dispatch; the
//! registry carries it so the manifest documents the termination shape.

use async_trait::async_trait;
use serde_json::Value;

use crate::registry::{Tool, ToolMetadata};

pub struct FinalAnswerTool;

#[async_trait]
impl Tool for FinalAnswerTool {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: "FINAL_ANSWER",
            description: "Ends the mission and returns the final answer to the user. Input: {'answer': '...'}",
            params_schema: r#"{"type":"object","properties":{"answer":{"type":"string"}},"required":["answer"]}"#,
        }
    }

    async fn execute(&self, params: Value) -> String {
        params
            .get("answer")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_owned()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn returns_the_answer_verbatim() {
        let tool = FinalAnswerTool;
        let result = tool.execute(json!({"answer": "All done."})).await;
        assert_eq!(result, "All done.");
    }
}
