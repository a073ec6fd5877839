use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a tool's recent success-rate movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Declining,
}

/// Per-tool mastery statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMastery {
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    /// Wilson 95% interval on the success rate.
    pub confidence_interval: (f64, f64),
    pub trend: Trend,
    pub total_invocations: u64,
    pub successes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_improved: Option<DateTime<Utc>>,
}

impl Default for ToolMastery {
    fn default() -> Self {
        Self {
            success_rate: 0.0,
            avg_latency_ms: 0.0,
            confidence_interval: (0.0, 1.0),
            trend: Trend::Stable,
            total_invocations: 0,
            successes: 0,
            last_improved: None,
        }
    }
}

/// Behavioral style expressed as three values in [0, 1].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StyleFingerprint {
    pub exploration_vs_exploitation: f64,
    pub tool_density: f64,
    pub error_recovery_speed: f64,
}

/// Emitted after every mastery update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfUpdate {
    pub calibration: f64,
    pub learning_velocity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_tool: Option<String>,
}

/// One tool execution outcome fed into metacognition.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub tool_name: String,
    pub success: bool,
    pub latency_ms: u64,
    /// A prior self-prediction of success probability, if one was made.
    pub predicted_success: Option<f64>,
}
