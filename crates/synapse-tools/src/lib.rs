use std::sync::Arc;

use synapse_paths::PathGuard;
use synapse_sandbox::{ContainerRunner, LocalShellRunner};
use synapse_syntax::SyntaxValidator;

mod code_exec;
mod edit;
mod final_answer;
mod fs_tools;
mod journal;
mod registry;
mod search;
mod shell;

pub use code_exec::ExecuteCodeTool;
pub use edit::ApplyEditTool;
pub use final_answer::FinalAnswerTool;
pub use fs_tools::{ListDirTool, ReadFileTool};
pub use journal::{JOURNAL_SUFFIX, JournaledWriter};
pub use registry::{Tool, ToolMetadata, ToolRegistry, is_failure_observation};
pub use search::PatternSearchTool;
pub use shell::RunCommandTool;

impl ToolRegistry {
    /// A registry holding every core tool, wired against the given path
    /// guard and command whitelist.
    pub fn with_core_tools(guard: Arc<PathGuard>, shell_runner: Arc<LocalShellRunner>) -> Self {
        let validator = SyntaxValidator::new();
        let mut registry = Self::new();
        registry.register(Arc::new(ReadFileTool::new(guard.clone())));
        registry.register(Arc::new(ListDirTool::new(guard.clone())));
        registry.register(Arc::new(PatternSearchTool::new(guard.clone())));
        registry.register(Arc::new(ApplyEditTool::new(guard.clone(), validator)));
        registry.register(Arc::new(RunCommandTool::new(guard, shell_runner)));
        registry.register(Arc::new(ExecuteCodeTool::new(ContainerRunner::default())));
        registry.register(Arc::new(FinalAnswerTool));
        registry
    }
}
