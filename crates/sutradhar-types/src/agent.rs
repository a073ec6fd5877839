use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Hard ceiling on agent tree depth, independent of configuration.
pub const SYSTEM_MAX_DEPTH: u32 = 10;

/// Hard ceiling on direct live children per parent, independent of configuration.
pub const SYSTEM_MAX_FAN_OUT: usize = 16;

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Alive,
    Stale,
    Dead,
    Killed,
    Completed,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Alive => "alive",
            AgentStatus::Stale => "stale",
            AgentStatus::Dead => "dead",
            AgentStatus::Killed => "killed",
            AgentStatus::Completed => "completed",
            AgentStatus::Error => "error",
        }
    }

    /// Terminal statuses are never transitioned out of.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Killed | AgentStatus::Completed | AgentStatus::Dead
        )
    }

    /// Statuses that count against the global live-agent limit.
    pub fn counts_as_live(&self) -> bool {
        matches!(self, AgentStatus::Alive | AgentStatus::Stale)
    }
}

/// The lifecycle manager's view of one agent.
///
/// `last_beat` and `status_changed_at` are monotonic instants so staleness
/// and kill-cascade ordering are immune to wall-clock adjustment.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub agent_id: String,
    pub parent_id: Option<String>,
    pub depth: u32,
    pub purpose: String,
    pub status: AgentStatus,
    pub last_beat: Instant,
    pub status_changed_at: Instant,
    pub registered_at: DateTime<Utc>,
    pub turn_count: u64,
    pub token_usage: u64,
    pub token_budget: u64,
    pub stuck_reason: Option<String>,
}

impl Heartbeat {
    pub fn new(
        agent_id: impl Into<String>,
        parent_id: Option<String>,
        depth: u32,
        purpose: impl Into<String>,
        token_budget: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            agent_id: agent_id.into(),
            parent_id,
            depth,
            purpose: purpose.into(),
            status: AgentStatus::Alive,
            last_beat: now,
            status_changed_at: now,
            registered_at: Utc::now(),
            turn_count: 0,
            token_usage: 0,
            token_budget,
            stuck_reason: None,
        }
    }

    /// Tokens still available before the budget is exhausted.
    pub fn remaining_budget(&self) -> u64 {
        self.token_budget.saturating_sub(self.token_usage)
    }
}

/// Partial heartbeat payload merged on `record_heartbeat`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BeatUpdate {
    pub turn_count: Option<u64>,
    pub token_usage: Option<u64>,
}

/// Emitted to status observers on every transition.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub agent_id: String,
    pub old_status: AgentStatus,
    pub new_status: AgentStatus,
    pub parent_id: Option<String>,
}

/// Outcome of a kill-cascade request.
#[derive(Debug, Clone)]
pub struct KillResult {
    pub success: bool,
    pub reason: Option<String>,
    /// Killed agents in transition order: descendants first, deepest to
    /// shallowest, the target last.
    pub killed_ids: Vec<String>,
    /// Sum of `token_budget - token_usage` over everything killed.
    pub freed_tokens: u64,
}

impl KillResult {
    pub fn refused(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
            killed_ids: Vec::new(),
            freed_tokens: 0,
        }
    }
}

/// Outcome of one `heal_tree` sweep.
#[derive(Debug, Clone, Default)]
pub struct HealReport {
    pub checked: usize,
    pub marked_stale: usize,
    pub marked_dead: usize,
    pub reaped_ids: Vec<String>,
    pub orphans_resolved: usize,
    pub over_budget_killed: usize,
    pub duration_ms: u64,
}

/// Answer to a `can_spawn` query.
#[derive(Debug, Clone)]
pub struct SpawnCheck {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl SpawnCheck {
    pub fn permitted() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn refused(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// What the sweep does with agents whose parent no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Kill the orphaned subtree.
    Cascade,
    /// Attach to the nearest live ancestor.
    Reparent,
    /// Detach as a new root (`parent_id = None`, `depth = 0`).
    Promote,
}

impl Default for OrphanPolicy {
    fn default() -> Self {
        Self::Cascade
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(AgentStatus::Killed.is_terminal());
        assert!(AgentStatus::Completed.is_terminal());
        assert!(!AgentStatus::Stale.is_terminal());
        assert!(AgentStatus::Alive.counts_as_live());
        assert!(AgentStatus::Stale.counts_as_live());
        assert!(!AgentStatus::Dead.counts_as_live());
    }

    #[test]
    fn test_remaining_budget_saturates() {
        let mut beat = Heartbeat::new("a1", None, 0, "root", 1000);
        beat.token_usage = 1200;
        assert_eq!(beat.remaining_budget(), 0);
    }

    #[test]
    fn test_new_heartbeat_is_alive() {
        let beat = Heartbeat::new("a1", Some("root".to_string()), 1, "worker", 500);
        assert_eq!(beat.status, AgentStatus::Alive);
        assert_eq!(beat.depth, 1);
        assert_eq!(beat.turn_count, 0);
    }
}
