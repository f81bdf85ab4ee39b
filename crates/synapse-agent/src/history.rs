//! Rendering a graph trace into the execution-history block of the model
//! prompt.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use synapse_protocol::{NodeKind, PointerNode};

/// How many trailing trace entries make it into the prompt.
const HISTORY_WINDOW: usize = 25;

/// Old observations are cut to this many characters; the most recent ones
/// stay verbatim.
const OBSERVATION_TRUNCATE: usize = 2000;

/// The last N entries are always rendered in full, duplicates included.
const RECENT_KEEP: usize = 2;

fn content_key(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Format a chronological trace as the agent's internal monologue.
/// Repeated identical observations collapse to a placeholder, except for
/// the most recent entries which always appear verbatim.
pub fn format_history(trace: &[PointerNode]) -> String {
    let start = trace.len().saturating_sub(HISTORY_WINDOW);
    let window = &trace[start..];

    let mut out = String::new();
    let mut last_user_content = String::new();
    let mut seen_observations: HashSet<String> = HashSet::new();

    for (index, node) in window.iter().enumerate() {
        let is_recent = index + RECENT_KEEP >= window.len();
        match node.kind {
            NodeKind::Prompt => {
                if node.content == last_user_content {
                    continue;
                }
                out.push_str("\n\n[USER REQUEST]\n");
                out.push_str(&node.content);
                last_user_content = node.content.clone();
            }
            NodeKind::SystemThought => {
                out.push_str("\n[THOUGHT] ");
                out.push_str(&node.content);
            }
            NodeKind::ToolCall => {
                out.push_str("\n[ACTION] ");
                out.push_str(&node.content);
            }
            NodeKind::ContextCode => {
                let key = content_key(&node.content);
                let duplicate = seen_observations.contains(&key);
                out.push_str("\n### OBSERVATION (Result)\n");
                if duplicate && !is_recent {
                    out.push_str("(Result same as previous step, elided to save context)\n");
                } else {
                    out.push_str("```\n");
                    if node.content.len() > OBSERVATION_TRUNCATE && !is_recent {
                        let cut: String =
                            node.content.chars().take(OBSERVATION_TRUNCATE).collect();
                        out.push_str(&cut);
                        out.push_str("\n... (Truncated history)");
                    } else {
                        out.push_str(&node.content);
                    }
                    out.push_str("\n```");
                    seen_observations.insert(key);
                }
            }
            NodeKind::Response => {
                out.push_str("\n[AI REPLY] ");
                out.push_str(&node.content);
            }
            NodeKind::Unknown => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn node(kind: NodeKind, content: &str) -> PointerNode {
        PointerNode {
            id: synapse_protocol::next_node_id(),
            kind,
            timestamp: 0,
            parent_id: String::new(),
            children_ids: Vec::new(),
            vector_id: None,
            content: content.to_owned(),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn renders_each_kind_in_order() {
        let trace = vec![
            node(NodeKind::Prompt, "list the files"),
            node(NodeKind::SystemThought, "I should list the dir"),
            node(NodeKind::ToolCall, "list_dir src"),
            node(NodeKind::ContextCode, "src/a.py"),
            node(NodeKind::Response, "done"),
        ];
        let out = format_history(&trace);
        let request = out.find("[USER REQUEST]").unwrap();
        let thought = out.find("[THOUGHT]").unwrap();
        let action = out.find("[ACTION]").unwrap();
        let observation = out.find("OBSERVATION").unwrap();
        let reply = out.find("[AI REPLY]").unwrap();
        assert!(request < thought && thought < action && action < observation && observation < reply);
    }

    #[test]
    fn duplicate_observations_collapse_except_most_recent() {
        let trace = vec![
            node(NodeKind::ContextCode, "same payload"),
            node(NodeKind::ContextCode, "same payload"),
            node(NodeKind::ContextCode, "other"),
            node(NodeKind::ContextCode, "same payload"),
        ];
        let out = format_history(&trace);
        // First occurrence verbatim, middle duplicate elided, last
        // occurrence verbatim because it is recent.
        assert_eq!(out.matches("same payload").count(), 2);
        assert_eq!(out.matches("elided to save context").count(), 1);
    }

    #[test]
    fn old_long_observations_are_truncated() {
        let long = "x".repeat(5000);
        let mut trace = vec![node(NodeKind::ContextCode, &long)];
        for step in 0..3 {
            trace.push(node(NodeKind::ToolCall, &format!("step {step}")));
        }
        let out = format_history(&trace);
        assert!(out.contains("(Truncated history)"));
    }

    #[test]
    fn window_keeps_only_the_tail() {
        let mut trace = Vec::new();
        for step in 0..40 {
            trace.push(node(NodeKind::ToolCall, &format!("action {step}")));
        }
        let out = format_history(&trace);
        assert!(!out.contains("action 0\n"));
        assert!(out.contains("action 39"));
    }

    #[test]
    fn repeated_prompts_are_skipped() {
        let trace = vec![
            node(NodeKind::Prompt, "same question"),
            node(NodeKind::Prompt, "same question"),
        ];
        let out = format_history(&trace);
        assert_eq!(out.matches("same question").count(), 1);
    }
}
