use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use sutradhar_types::{SelfUpdate, StyleFingerprint, ToolMastery, ToolOutcome, Trend};

/// How many updates back trend detection compares against.
const TREND_LOOKBACK: usize = 5;

/// Wilson z for a 95% interval.
const WILSON_Z: f64 = 1.96;

/// Success-rate delta that flips a trend out of stable.
const TREND_DELTA: f64 = 0.05;

/// Consecutive failures before a limitation is recorded.
const LIMITATION_STREAK: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetacogConfig {
    /// Sliding window of (predicted, actual) pairs for calibration.
    pub calibration_window: usize,
    /// Bound on the discovered-limitation list.
    pub max_limitations: usize,
}

impl Default for MetacogConfig {
    fn default() -> Self {
        Self {
            calibration_window: 50,
            max_limitations: 20,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ToolState {
    mastery: ToolMastery,
    /// Success-rate history, newest last, capped at TREND_LOOKBACK + 1.
    history: VecDeque<f64>,
    consecutive_failures: u32,
    /// Call index of the last unrecovered error, for recovery distance.
    pending_error_at: Option<u64>,
}

/// Wilson score 95% interval for `successes` out of `n`.
fn wilson_interval(successes: u64, n: u64) -> (f64, f64) {
    if n == 0 {
        return (0.0, 1.0);
    }
    let n = n as f64;
    let p = successes as f64 / n;
    let z2 = WILSON_Z * WILSON_Z;
    let denom = 1.0 + z2 / n;
    let center = p + z2 / (2.0 * n);
    let spread = WILSON_Z * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt();
    (
        ((center - spread) / denom).clamp(0.0, 1.0),
        ((center + spread) / denom).clamp(0.0, 1.0),
    )
}

/// Per-tool mastery tracking, calibration, and behavioral style.
pub struct Metacognition {
    config: MetacogConfig,
    tools: HashMap<String, ToolState>,
    limitations: VecDeque<String>,
    /// Sliding (predicted, actual) window.
    calibration: VecDeque<(f64, f64)>,
    /// Cross-tool average success history for learning velocity.
    global_history: VecDeque<f64>,
    total_tool_calls: u64,
    turn_count: u64,
    seen_tools: HashSet<String>,
    recovery_distance_sum: f64,
    recovery_count: u64,
}

/// Shape-preserving serialization of the whole metacognitive state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetacogSnapshot {
    tools: HashMap<String, ToolState>,
    limitations: Vec<String>,
    calibration: Vec<(f64, f64)>,
    global_history: Vec<f64>,
    total_tool_calls: u64,
    turn_count: u64,
    recovery_distance_sum: f64,
    recovery_count: u64,
}

impl Metacognition {
    pub fn new(config: MetacogConfig) -> Self {
        Self {
            config,
            tools: HashMap::new(),
            limitations: VecDeque::new(),
            calibration: VecDeque::new(),
            global_history: VecDeque::new(),
            total_tool_calls: 0,
            turn_count: 0,
            seen_tools: HashSet::new(),
            recovery_distance_sum: 0.0,
            recovery_count: 0,
        }
    }

    /// Count a conversation turn (for tool-density).
    pub fn note_turn(&mut self) {
        self.turn_count += 1;
    }

    /// Record one tool execution outcome and return the self-update event.
    pub fn record(&mut self, outcome: &ToolOutcome) -> SelfUpdate {
        self.total_tool_calls += 1;
        let call_index = self.total_tool_calls;
        self.seen_tools.insert(outcome.tool_name.clone());

        let state = self
            .tools
            .entry(outcome.tool_name.clone())
            .or_insert_with(ToolState::default);

        let mastery = &mut state.mastery;
        mastery.total_invocations += 1;
        if outcome.success {
            mastery.successes += 1;
        }
        mastery.success_rate = mastery.successes as f64 / mastery.total_invocations as f64;

        // Incremental latency mean.
        let n = mastery.total_invocations as f64;
        mastery.avg_latency_ms += (outcome.latency_ms as f64 - mastery.avg_latency_ms) / n;

        mastery.confidence_interval = wilson_interval(mastery.successes, mastery.total_invocations);

        // Trend against the rate TREND_LOOKBACK updates ago.
        state.history.push_back(mastery.success_rate);
        while state.history.len() > TREND_LOOKBACK + 1 {
            state.history.pop_front();
        }
        if state.history.len() == TREND_LOOKBACK + 1 {
            let past = state.history.front().copied().unwrap_or(0.0);
            let delta = mastery.success_rate - past;
            let previous = mastery.trend;
            mastery.trend = if delta > TREND_DELTA {
                Trend::Improving
            } else if delta < -TREND_DELTA {
                Trend::Declining
            } else {
                Trend::Stable
            };
            if mastery.trend == Trend::Improving && previous != Trend::Improving {
                mastery.last_improved = Some(chrono::Utc::now());
            }
        }

        // Failure streaks and recovery distance.
        if outcome.success {
            if let Some(error_at) = state.pending_error_at.take() {
                self.recovery_distance_sum += (call_index - error_at) as f64;
                self.recovery_count += 1;
            }
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures += 1;
            if state.pending_error_at.is_none() {
                state.pending_error_at = Some(call_index);
            }
            if state.consecutive_failures == LIMITATION_STREAK {
                let limitation = format!(
                    "{} failed {} times in a row",
                    outcome.tool_name, LIMITATION_STREAK
                );
                if !self.limitations.contains(&limitation) {
                    if self.limitations.len() == self.config.max_limitations {
                        self.limitations.pop_front();
                    }
                    self.limitations.push_back(limitation);
                }
            }
        }

        // Calibration window.
        if let Some(predicted) = outcome.predicted_success {
            if self.calibration.len() == self.config.calibration_window {
                self.calibration.pop_front();
            }
            self.calibration
                .push_back((predicted, if outcome.success { 1.0 } else { 0.0 }));
        }

        // Global success average for learning velocity.
        let avg = self.average_success_all_tools();
        self.global_history.push_back(avg);
        while self.global_history.len() > TREND_LOOKBACK + 1 {
            self.global_history.pop_front();
        }

        SelfUpdate {
            calibration: self.calibration_ratio(),
            learning_velocity: self.learning_velocity(),
            top_tool: self.top_tool(),
        }
    }

    fn average_success_all_tools(&self) -> f64 {
        if self.tools.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .tools
            .values()
            .map(|state| state.mastery.success_rate)
            .sum();
        sum / self.tools.len() as f64
    }

    /// avgPredicted / avgActual over the sliding window; infinite when the
    /// window contains only failures.
    pub fn calibration_ratio(&self) -> f64 {
        if self.calibration.is_empty() {
            return 1.0;
        }
        let n = self.calibration.len() as f64;
        let avg_predicted: f64 = self.calibration.iter().map(|(p, _)| p).sum::<f64>() / n;
        let avg_actual: f64 = self.calibration.iter().map(|(_, a)| a).sum::<f64>() / n;
        if avg_actual == 0.0 {
            return f64::INFINITY;
        }
        avg_predicted / avg_actual
    }

    pub fn learning_velocity(&self) -> f64 {
        if self.global_history.len() < TREND_LOOKBACK + 1 {
            return 0.0;
        }
        let past = self.global_history.front().copied().unwrap_or(0.0);
        let current = self.global_history.back().copied().unwrap_or(0.0);
        (current - past) / TREND_LOOKBACK as f64
    }

    pub fn style_fingerprint(&self) -> StyleFingerprint {
        let exploration = if self.total_tool_calls == 0 {
            0.0
        } else {
            self.seen_tools.len() as f64 / self.total_tool_calls as f64
        };

        let density = if self.turn_count == 0 {
            0.0
        } else {
            1.0 - 1.0 / (1.0 + self.total_tool_calls as f64 / self.turn_count as f64)
        };

        let recovery = if self.recovery_count == 0 {
            1.0
        } else {
            1.0 / (1.0 + self.recovery_distance_sum / self.recovery_count as f64)
        };

        StyleFingerprint {
            exploration_vs_exploitation: exploration,
            tool_density: density,
            error_recovery_speed: recovery,
        }
    }

    pub fn mastery(&self, tool: &str) -> Option<&ToolMastery> {
        self.tools.get(tool).map(|state| &state.mastery)
    }

    pub fn limitations(&self) -> Vec<String> {
        self.limitations.iter().cloned().collect()
    }

    /// Tool with the highest success rate (most invocations breaks ties).
    pub fn top_tool(&self) -> Option<String> {
        self.tools
            .iter()
            .max_by(|(_, a), (_, b)| {
                a.mastery
                    .success_rate
                    .partial_cmp(&b.mastery.success_rate)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.mastery.total_invocations.cmp(&b.mastery.total_invocations))
            })
            .map(|(name, _)| name.clone())
    }

    // ==========================================
    // Persistence
    // ==========================================

    pub fn snapshot(&self) -> MetacogSnapshot {
        MetacogSnapshot {
            tools: self.tools.clone(),
            limitations: self.limitations.iter().cloned().collect(),
            calibration: self.calibration.iter().copied().collect(),
            global_history: self.global_history.iter().copied().collect(),
            total_tool_calls: self.total_tool_calls,
            turn_count: self.turn_count,
            recovery_distance_sum: self.recovery_distance_sum,
            recovery_count: self.recovery_count,
        }
    }

    /// Restore from a snapshot; histories are re-seeded so trend detection
    /// continues where it left off.
    pub fn from_snapshot(config: MetacogConfig, snapshot: MetacogSnapshot) -> Self {
        let seen_tools = snapshot.tools.keys().cloned().collect();
        Self {
            config,
            tools: snapshot.tools,
            limitations: snapshot.limitations.into(),
            calibration: snapshot.calibration.into(),
            global_history: snapshot.global_history.into(),
            total_tool_calls: snapshot.total_tool_calls,
            turn_count: snapshot.turn_count,
            seen_tools,
            recovery_distance_sum: snapshot.recovery_distance_sum,
            recovery_count: snapshot.recovery_count,
        }
    }
}
