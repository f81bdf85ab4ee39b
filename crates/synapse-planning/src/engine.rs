//! The plan state machine.

use std::fmt::Write as _;

use parking_lot::Mutex;
use synapse_protocol::{ExecutionPlan, PlanStatus, PlanStep, StepStatus, next_plan_id};
use tracing::{info, warn};

/// Infer a tool from a step description when the model omitted one.
fn infer_tool(description: &str) -> &'static str {
    let lower = description.to_lowercase();
    if lower.contains("read") || lower.contains("check") {
        "read_file"
    } else if lower.contains("write") || lower.contains("create") || lower.contains("edit") {
        "apply_edit"
    } else if lower.contains("run") || lower.contains("test") || lower.contains("compile") {
        "run_command"
    } else if lower.contains("search") {
        "pattern_search"
    } else if lower.contains("list") || lower.contains("dir") {
        "list_dir"
    } else {
        "unknown"
    }
}

/// Holds at most one plan at a time and drives it through its lifecycle.
/// The plan survives across requests so a human approval between turns
/// lands on the same plan the model proposed.
#[derive(Debug, Default)]
pub struct PlanningEngine {
    current: Mutex<Option<ExecutionPlan>>,
}

impl PlanningEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any previous plan with a freshly proposed one awaiting
    /// review. Steps missing a tool name get one inferred from their
    /// description.
    pub fn propose_plan(&self, goal: &str, raw_steps: &[serde_json::Value]) {
        let steps: Vec<PlanStep> = raw_steps
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                let description = raw
                    .get("description")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("Unknown Step")
                    .to_owned();
                let tool_name = raw
                    .get("tool")
                    .and_then(serde_json::Value::as_str)
                    .filter(|tool| !tool.is_empty())
                    .map(ToOwned::to_owned)
                    .unwrap_or_else(|| infer_tool(&description).to_owned());
                PlanStep {
                    id: (index + 1).to_string(),
                    description,
                    tool_name,
                    params: raw
                        .get("parameters")
                        .cloned()
                        .unwrap_or_else(|| serde_json::json!({})),
                    status: StepStatus::Pending,
                    result_summary: String::new(),
                }
            })
            .collect();

        let plan = ExecutionPlan {
            id: next_plan_id(),
            goal: goal.to_owned(),
            steps,
            status: PlanStatus::ReviewRequired,
            current_step_idx: 0,
        };
        info!(steps = plan.steps.len(), "plan proposed, awaiting approval");
        *self.current.lock() = Some(plan);
    }

    /// Move a reviewed plan to APPROVED and bulk-approve its steps.
    pub fn approve_plan(&self) {
        let mut guard = self.current.lock();
        if let Some(plan) = guard.as_mut()
            && plan.status == PlanStatus::ReviewRequired
        {
            plan.status = PlanStatus::Approved;
            for step in &mut plan.steps {
                step.status = StepStatus::Approved;
            }
            info!(plan_id = %plan.id, "plan approved");
        }
    }

    /// A plan exists and has not reached a terminal state.
    pub fn has_active_plan(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|plan| !plan.status.is_terminal())
    }

    pub fn is_plan_approved(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|plan| plan.status.is_executable())
    }

    pub fn snapshot(&self) -> Option<ExecutionPlan> {
        self.current.lock().clone()
    }

    /// Record a step outcome. A SUCCESS advances the cursor and moves the
    /// plan to IN_PROGRESS or COMPLETED; a FAILED transition fails the
    /// plan. Terminal plans ignore further transitions.
    pub fn mark_step_status(&self, index: usize, status: StepStatus, result: &str) {
        let mut guard = self.current.lock();
        let Some(plan) = guard.as_mut() else {
            return;
        };
        if plan.status.is_terminal() {
            warn!(plan_id = %plan.id, "step transition ignored on terminal plan");
            return;
        }
        let Some(step) = plan.steps.get_mut(index) else {
            return;
        };
        step.status = status;
        step.result_summary = result.to_owned();

        match status {
            StepStatus::Success => {
                plan.current_step_idx += 1;
                if plan.current_step_idx >= plan.steps.len() {
                    plan.status = PlanStatus::Completed;
                    info!(plan_id = %plan.id, "plan completed");
                } else {
                    plan.status = PlanStatus::InProgress;
                }
            }
            StepStatus::Failed => {
                plan.status = PlanStatus::Failed;
                warn!(plan_id = %plan.id, step = index, "plan failed");
            }
            _ => {}
        }
    }

    /// Drop the plan entirely (new mission).
    pub fn reset(&self) {
        *self.current.lock() = None;
    }

    /// The AI-facing plan summary: every step with an arrow on the current
    /// one, plus either the approval constraint or the execution
    /// authorisation line.
    pub fn render_for_prompt(&self) -> String {
        let guard = self.current.lock();
        let Some(plan) = guard.as_ref() else {
            return String::new();
        };
        if plan.status == PlanStatus::Draft {
            return String::new();
        }

        let mut out = String::from("\n### CURRENT EXECUTION PLAN\n");
        let executable = plan.status.is_executable();
        let _ = writeln!(
            out,
            "Status: {}",
            if executable {
                "APPROVED (Execute now)"
            } else {
                "PENDING REVIEW (Do not execute)"
            }
        );

        for (index, step) in plan.steps.iter().enumerate() {
            let marker = if index == plan.current_step_idx {
                "-> "
            } else {
                "   "
            };
            let done = if step.status == StepStatus::Success {
                " (DONE)"
            } else {
                ""
            };
            let _ = writeln!(
                out,
                "{}. {}[{}] {}{}",
                index + 1,
                marker,
                step.tool_name,
                step.description,
                done
            );
        }

        if executable {
            let _ = writeln!(
                out,
                "\nAUTHORIZATION: You are authorized to execute step {}.",
                plan.current_step_idx + 1
            );
        } else {
            let _ = writeln!(
                out,
                "\nCONSTRAINT: You must ask the user to approve this plan before running any side-effect tools (edit, run)."
            );
        }
        out
    }
}
