mod config;
mod dreaming;
mod error;
mod lifecycle;
mod orchestrator;
mod tools;

pub use config::{resolve_workspace_path, RuntimeConfig};
pub use dreaming::{CycleReport, DreamCycle, DreamState};
pub use error::{Error, Result};
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use orchestrator::{
    OrchestratorConfig, Phase, PhaseOutcome, ReviewIssue, RunFailure, RunMode, RunResult,
    RunStatus, TaskRunner,
};
pub use tools::{
    builtin_tools, ToolContext, ToolHandler, ToolOutput, ToolRegistry,
};
