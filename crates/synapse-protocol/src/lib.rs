//! # synapse-protocol — Canonical Agent Core Contract
//!
//! This crate defines the shared types, event taxonomy, and trait interfaces
//! that every Synapse subsystem depends on.
//!
//! It is intentionally dependency-light (no runtime deps like tokio or
//! tree-sitter) so it can be used as a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`] — Time-sortable node/plan identifier generation
//! - [`node`] — PointerNode + NodeKind (the episodic memory unit)
//! - [`plan`] — ExecutionPlan, PlanStep and their status machines
//! - [`action`] — ToolAction (the shape accepted from the model)
//! - [`event`] — Phase taxonomy, PhaseEvent, AgentObserver
//! - [`memory`] — CodeNode (sync ingestion), MemoryRecall
//! - [`config`] — ProjectConfig, KeysFile (persisted state shapes)
//! - [`ports`] — Runtime boundary ports (embedding/generation)
//! - [`error`] — KernelError, KernelResult

pub mod action;
pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod memory;
pub mod node;
pub mod plan;
pub mod ports;

// Re-export the most commonly used types at the crate root.
pub use action::ToolAction;
pub use config::{KeysFile, ProjectConfig};
pub use error::{KernelError, KernelResult};
pub use event::{AgentObserver, NullObserver, Phase, PhaseEvent};
pub use ids::{next_node_id, next_plan_id, now_millis};
pub use memory::{CodeNode, MemoryRecall};
pub use node::{NodeKind, PointerNode};
pub use plan::{ExecutionPlan, PlanStatus, PlanStep, StepStatus};
pub use ports::{EmbeddingService, Generation};
