mod executor;
mod extract;
mod history;
mod sessions;
mod trace;

pub use executor::{AgentConfig, AgentExecutor, AgentRequest};
pub use extract::{
    action_parameters, action_tool_name, as_action_batch, extract_code_blocks, extract_json,
    inject_code_blocks, normalise_action,
};
pub use history::format_history;
pub use sessions::SessionRegistry;
pub use trace::{InteractionLog, InteractionRecord, PhaseHub, TraceLog};
