//! Phase taxonomy and the observer contract.
//!
//! Every phase transition inside the agent loop produces a [`PhaseEvent`]
//! delivered to an injected [`AgentObserver`]. Transport adapters (gRPC,
//! websocket, dashboard) implement the trait outside this workspace.

use serde::{Deserialize, Serialize};

/// Loop phases, in the order a healthy request tends to visit them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Startup,
    Thinking,
    Planning,
    Proposal,
    ToolExec,
    Verifying,
    AutoRepair,
    Success,
    Blocked,
    ErrorCatch,
    Final,
    Fatal,
}

/// A structured phase transition.
///
/// `payload` is free-form text except for [`Phase::Proposal`], which carries
/// the serialised plan snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub phase: Phase,
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
}

impl PhaseEvent {
    pub fn new(phase: Phase, payload: impl Into<String>) -> Self {
        Self {
            phase,
            payload: payload.into(),
            duration_ms: None,
        }
    }
}

/// Receives phase events as the loop runs. Implementations must be cheap
/// and non-blocking; the loop calls this inline.
pub trait AgentObserver: Send + Sync {
    fn notify(&self, event: &PhaseEvent);
}

/// Observer that drops everything; used when no client is streaming.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl AgentObserver for NullObserver {
    fn notify(&self, _event: &PhaseEvent) {}
}
