pub mod builtin;

mod audit;
mod engine;

pub use audit::{AuditFilter, AuditReportFormat, SessionAuditSummary};
pub use engine::{AuditSink, PolicyEngine, PolicyRule, PolicySet};

use serde::{Deserialize, Serialize};

/// Policy enforcement configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Strict enforcement: a deny short-circuits rule evaluation.
    pub enforce: bool,
    /// Dollar ceiling per session for model calls.
    pub cost_budget: f64,
    /// Path prefixes writes/reads are confined to; empty = unrestricted.
    pub allowed_paths: Vec<String>,
    pub denied_paths: Vec<String>,
    pub denied_commands: Vec<String>,
    pub max_files_per_session: u64,
    pub max_commands_per_session: u64,
    /// Whether spawned sub-agents inherit this policy set.
    pub inherit_to_sub_agents: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enforce: true,
            cost_budget: 25.0,
            allowed_paths: Vec::new(),
            denied_paths: vec!["/etc".to_string(), "/root/.ssh".to_string()],
            denied_commands: vec![
                "rm -rf /".to_string(),
                "mkfs".to_string(),
                "shutdown".to_string(),
            ],
            max_files_per_session: 200,
            max_commands_per_session: 500,
            inherit_to_sub_agents: true,
        }
    }
}
