mod engine;
mod guard;

pub use engine::PlanningEngine;
pub use guard::{BATCH_MODE_KEY, ExecutionGuard, GuardDecision, tools_match};
