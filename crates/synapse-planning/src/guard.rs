//! The execution guard: authorisation check before every side-effecting
//! tool call.

use synapse_protocol::ExecutionPlan;
use tracing::warn;

/// Marker the loop injects into params when an action belongs to a
/// model-produced batch that was implicitly approved as a whole.
pub const BATCH_MODE_KEY: &str = "_batch_mode";

/// Tools with no side effects, allowed regardless of plan state.
const SAFE_TOOLS: &[&str] = &[
    "read_file",
    "list_dir",
    "pattern_search",
    "propose_plan",
    "FINAL_ANSWER",
];

/// Tools that write files and therefore get path-pinned to the plan step.
const FILE_WRITE_TOOLS: &[&str] = &["apply_edit", "create_file", "write_file", "file_surgical_tool"];

/// Synonym groups: a plan step naming one member authorises the others.
const TOOL_SYNONYMS: &[&[&str]] = &[&["apply_edit", "create_file", "write_file"]];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardDecision {
    pub allowed: bool,
    pub reason: String,
}

impl GuardDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Exact match, substring match either direction, or canonical synonym
/// pair. Shared with the loop so step bookkeeping agrees with the guard.
pub fn tools_match(planned: &str, requested: &str) -> bool {
    if planned == requested {
        return true;
    }
    if !planned.is_empty() && !requested.is_empty()
        && (planned.contains(requested) || requested.contains(planned))
    {
        return true;
    }
    TOOL_SYNONYMS
        .iter()
        .any(|group| group.contains(&planned) && group.contains(&requested))
}

/// Stateless plan-compliance check. The decision ladder, in order:
/// batch marker, safe set, terminal plan states, missing plan,
/// unapproved plan, step tool match, step path match.
pub struct ExecutionGuard;

impl ExecutionGuard {
    pub fn validate(
        tool_name: &str,
        params: &serde_json::Value,
        plan: Option<&ExecutionPlan>,
    ) -> GuardDecision {
        if params
            .get(BATCH_MODE_KEY)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
        {
            return GuardDecision::allow("Batch pre-authorized.");
        }

        if SAFE_TOOLS.contains(&tool_name) {
            return GuardDecision::allow("Safe tool allowed.");
        }

        let Some(plan) = plan else {
            return GuardDecision::deny(
                "BLOCKED: No active plan. Propose a plan first with propose_plan.",
            );
        };

        if plan.status.is_terminal() {
            // Only wrapping up is allowed once the plan has ended, and
            // FINAL_ANSWER already passed through the safe set above.
            return GuardDecision::deny(
                "BLOCKED: Plan completed or failed. Only FINAL_ANSWER is authorized.",
            );
        }

        if !plan.status.is_executable() {
            return GuardDecision::deny(
                "BLOCKED: Active plan is not approved. Please review and approve the plan first.",
            );
        }

        let Some(step) = plan.current_step() else {
            return GuardDecision::deny("BLOCKED: Plan completed. No further actions authorized.");
        };

        if !tools_match(&step.tool_name, tool_name) {
            let reason = format!(
                "DEVIATION DETECTED: Plan expects '{}', but Agent tried '{}'.",
                step.tool_name, tool_name
            );
            warn!(%reason, "guard blocked tool call");
            return GuardDecision::deny(reason);
        }

        if FILE_WRITE_TOOLS.contains(&tool_name) {
            let planned_path = step
                .params
                .get("path")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("");
            let actual_path = params
                .get("path")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("");
            if planned_path.is_empty() {
                warn!(tool_name, actual_path, "plan step omitted a path, allowing with warning");
            } else if planned_path != actual_path {
                let reason = format!(
                    "SECURITY ALERT: File path deviation. Planned: {planned_path}, Actual: {actual_path}"
                );
                warn!(%reason, "guard blocked file write");
                return GuardDecision::deny(reason);
            }
        }

        GuardDecision::allow(format!("Authorized by Plan Step {}", step.id))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use synapse_protocol::{PlanStatus, PlanStep, StepStatus};

    use super::*;

    fn approved_plan(tool: &str, path: &str) -> ExecutionPlan {
        ExecutionPlan {
            id: "plan_1".into(),
            goal: "goal".into(),
            steps: vec![PlanStep {
                id: "1".into(),
                description: "step".into(),
                tool_name: tool.into(),
                params: if path.is_empty() {
                    json!({})
                } else {
                    json!({"path": path})
                },
                status: StepStatus::Approved,
                result_summary: String::new(),
            }],
            status: PlanStatus::Approved,
            current_step_idx: 0,
        }
    }

    #[test]
    fn safe_tools_pass_without_a_plan() {
        for tool in ["read_file", "list_dir", "pattern_search", "propose_plan", "FINAL_ANSWER"] {
            let decision = ExecutionGuard::validate(tool, &json!({}), None);
            assert!(decision.allowed, "{tool} should be safe");
        }
    }

    #[test]
    fn side_effecting_tool_without_plan_is_denied() {
        let decision = ExecutionGuard::validate("apply_edit", &json!({"path": "x.py"}), None);
        assert!(!decision.allowed);
        assert!(decision.reason.contains("No active plan"));
    }

    #[test]
    fn unapproved_plan_denies_side_effects() {
        let mut plan = approved_plan("apply_edit", "x.py");
        plan.status = PlanStatus::ReviewRequired;
        let decision =
            ExecutionGuard::validate("apply_edit", &json!({"path": "x.py"}), Some(&plan));
        assert!(!decision.allowed);
        assert!(decision.reason.contains("not approved"));
    }

    #[test]
    fn batch_marker_bypasses_plan_checks() {
        let decision = ExecutionGuard::validate(
            "apply_edit",
            &json!({"path": "x.py", "_batch_mode": true}),
            None,
        );
        assert!(decision.allowed);
    }

    #[test]
    fn terminal_plan_only_allows_wrap_up() {
        let mut plan = approved_plan("apply_edit", "x.py");
        plan.status = PlanStatus::Completed;
        plan.current_step_idx = 1;

        let edit = ExecutionGuard::validate("apply_edit", &json!({"path": "x.py"}), Some(&plan));
        assert!(!edit.allowed);

        let answer = ExecutionGuard::validate("FINAL_ANSWER", &json!({}), Some(&plan));
        assert!(answer.allowed);
    }

    #[test]
    fn matching_step_is_authorized() {
        let plan = approved_plan("apply_edit", "src/x.py");
        let decision =
            ExecutionGuard::validate("apply_edit", &json!({"path": "src/x.py"}), Some(&plan));
        assert!(decision.allowed);
        assert!(decision.reason.contains("Plan Step 1"));
    }

    #[test]
    fn tool_deviation_is_blocked() {
        let plan = approved_plan("read_file_deep", "");
        let decision = ExecutionGuard::validate("run_command", &json!({}), Some(&plan));
        assert!(!decision.allowed);
        assert!(decision.reason.contains("DEVIATION"));
    }

    #[test]
    fn substring_and_synonym_matches_pass() {
        let plan = approved_plan("edit", "src/x.py");
        let sub = ExecutionGuard::validate("apply_edit", &json!({"path": "src/x.py"}), Some(&plan));
        assert!(sub.allowed);

        let plan = approved_plan("apply_edit", "src/x.py");
        let synonym =
            ExecutionGuard::validate("write_file", &json!({"path": "src/x.py"}), Some(&plan));
        assert!(synonym.allowed);
    }

    #[test]
    fn path_deviation_is_blocked() {
        let plan = approved_plan("apply_edit", "src/x.py");
        let decision =
            ExecutionGuard::validate("apply_edit", &json!({"path": "src/other.py"}), Some(&plan));
        assert!(!decision.allowed);
        assert!(decision.reason.contains("File path deviation"));
    }

    #[test]
    fn missing_plan_path_allows_with_warning() {
        let plan = approved_plan("apply_edit", "");
        let decision =
            ExecutionGuard::validate("apply_edit", &json!({"path": "anything.py"}), Some(&plan));
        assert!(decision.allowed);
    }
}
