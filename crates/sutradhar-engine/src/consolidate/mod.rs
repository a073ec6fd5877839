mod crystallize;
mod extract;
mod procedures;

pub use crystallize::{decay_strength, holdout_accuracy, promote_vasanas, Crystallizer, VasanaChange};
pub use extract::{extract_patterns, PatternObservation, ReplaySession, ReplayToolCall, ReplayTurn};
pub use procedures::mine_procedures;

use serde::{Deserialize, Serialize};

/// Consolidator configuration: dream-cycle cadence plus the thresholds the
/// crystallization and procedure-mining phases apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidatorConfig {
    pub listening_heartbeat_ms: u64,
    pub dreaming_heartbeat_ms: u64,
    pub deep_sleep_heartbeat_ms: u64,
    /// Idle time before a dream cycle may begin.
    pub idle_timeout_ms: u64,
    pub dream_duration_ms: u64,
    pub deep_sleep_duration_ms: u64,
    /// Consecutive stable observations required to crystallize.
    pub stability_window: u32,
    /// Holdout validation accuracy floor.
    pub accuracy_threshold: f64,
    /// Minimum observations before a candidate becomes a samskara.
    pub min_pattern_frequency: u64,
    pub max_sessions_per_cycle: usize,
    /// Shortest tool n-gram mined into a procedure.
    pub min_sequence_length: usize,
    /// Average tool success floor for a mined procedure.
    pub min_success_rate: f64,
    /// Projects a tendency must span before global promotion.
    pub promotion_min_projects: usize,
    pub decay_half_life_ms: i64,
}

impl Default for ConsolidatorConfig {
    fn default() -> Self {
        Self {
            listening_heartbeat_ms: 30_000,
            dreaming_heartbeat_ms: 5_000,
            deep_sleep_heartbeat_ms: 60_000,
            idle_timeout_ms: 300_000,
            dream_duration_ms: 60_000,
            deep_sleep_duration_ms: 120_000,
            stability_window: 3,
            accuracy_threshold: 0.6,
            min_pattern_frequency: 2,
            max_sessions_per_cycle: 20,
            min_sequence_length: 2,
            min_success_rate: 0.7,
            promotion_min_projects: 2,
            decay_half_life_ms: 14 * 24 * 60 * 60 * 1000,
        }
    }
}
