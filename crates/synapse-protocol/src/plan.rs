//! Plan types: the execution plan and its step/state machines.

use serde::{Deserialize, Serialize};

/// Lifecycle of a whole plan.
///
/// ```text
/// (none) ─propose─▶ REVIEW_REQUIRED ─approve─▶ APPROVED
///     APPROVED ─first step success─▶ IN_PROGRESS ─last step─▶ COMPLETED
///     any step failure ─▶ FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Draft,
    ReviewRequired,
    Approved,
    InProgress,
    Completed,
    Failed,
}

impl PlanStatus {
    /// A plan in a terminal state accepts no further step transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, PlanStatus::Completed | PlanStatus::Failed)
    }

    /// Side-effecting tools may run only under an approved or running plan.
    pub fn is_executable(self) -> bool {
        matches!(self, PlanStatus::Approved | PlanStatus::InProgress)
    }
}

/// Lifecycle of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Approved,
    InProgress,
    Success,
    Failed,
}

/// A single authorised action inside a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    #[serde(rename = "tool")]
    pub tool_name: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub status: StepStatus,
    #[serde(default, rename = "result")]
    pub result_summary: String,
}

/// The plan: an ordered list of steps plus a cursor.
///
/// Invariant: `current_step_idx <= steps.len()`; equality implies the plan
/// is `Completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,
    pub goal: String,
    pub steps: Vec<PlanStep>,
    pub status: PlanStatus,
    #[serde(rename = "current_step")]
    pub current_step_idx: usize,
}

impl ExecutionPlan {
    /// The step the cursor points at, if the plan is not yet exhausted.
    pub fn current_step(&self) -> Option<&PlanStep> {
        self.steps.get(self.current_step_idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_status_serde_uses_wire_names() {
        assert_eq!(
            serde_json::to_string(&PlanStatus::ReviewRequired).unwrap(),
            "\"REVIEW_REQUIRED\""
        );
        assert_eq!(
            serde_json::to_string(&PlanStatus::InProgress).unwrap(),
            "\"IN_PROGRESS\""
        );
    }

    #[test]
    fn terminal_and_executable_partitions() {
        assert!(PlanStatus::Completed.is_terminal());
        assert!(PlanStatus::Failed.is_terminal());
        assert!(!PlanStatus::Approved.is_terminal());
        assert!(PlanStatus::Approved.is_executable());
        assert!(PlanStatus::InProgress.is_executable());
        assert!(!PlanStatus::ReviewRequired.is_executable());
    }

    #[test]
    fn plan_serde_roundtrip() {
        let plan = ExecutionPlan {
            id: "plan_1".into(),
            goal: "add a function".into(),
            steps: vec![PlanStep {
                id: "1".into(),
                description: "edit the file".into(),
                tool_name: "apply_edit".into(),
                params: serde_json::json!({"path": "src/x.py"}),
                status: StepStatus::Pending,
                result_summary: String::new(),
            }],
            status: PlanStatus::ReviewRequired,
            current_step_idx: 0,
        };
        let json = serde_json::to_string(&plan).unwrap();
        let back: ExecutionPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back.steps.len(), 1);
        assert_eq!(back.status, PlanStatus::ReviewRequired);
        assert_eq!(back.current_step().unwrap().tool_name, "apply_edit");
    }
}
