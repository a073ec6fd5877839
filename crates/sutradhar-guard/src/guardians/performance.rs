use crate::guardians::Guardian;
use std::collections::HashMap;
use sutradhar_types::{Domain, Finding, Severity, ToolObservation};

/// Context-usage warning threshold (percent).
const CONTEXT_WARNING_PCT: f64 = 80.0;

/// Context-usage critical threshold (percent).
const CONTEXT_CRITICAL_PCT: f64 = 95.0;

#[derive(Debug, Clone, Copy, Default)]
struct LatencyStats {
    samples: u64,
    mean_ms: f64,
}

/// Tracks tool latency and context pressure per turn.
///
/// A tool call slower than twice its moving average raises a warning once
/// enough samples exist; context usage warns at 80% and goes critical at
/// 95%; unusually token-hungry turns get an informational note.
pub struct PerformanceGuardian {
    id: String,
    min_samples: u64,
    token_info_threshold: u64,
    latency: HashMap<String, LatencyStats>,
}

impl PerformanceGuardian {
    pub fn new(min_samples: u64, token_info_threshold: u64) -> Self {
        Self {
            id: "performance".to_string(),
            min_samples,
            token_info_threshold,
            latency: HashMap::new(),
        }
    }
}

impl Guardian for PerformanceGuardian {
    fn id(&self) -> &str {
        &self.id
    }

    fn domain(&self) -> Domain {
        Domain::Performance
    }

    fn scan(&mut self, observation: &ToolObservation) -> Vec<Finding> {
        let mut findings = Vec::new();
        let duration = observation.duration_ms as f64;

        let stats = self
            .latency
            .entry(observation.tool_name.clone())
            .or_default();

        if stats.samples >= self.min_samples && duration > 2.0 * stats.mean_ms && stats.mean_ms > 0.0
        {
            findings.push(
                Finding::new(
                    &self.id,
                    Domain::Performance,
                    Severity::Warning,
                    format!("Slow {} call", observation.tool_name),
                    format!(
                        "{}ms against a {:.0}ms moving average",
                        observation.duration_ms, stats.mean_ms
                    ),
                    &observation.tool_name,
                    0.75,
                )
                .with_suggestion("check for oversized inputs or external slowness"),
            );
        }

        stats.samples += 1;
        stats.mean_ms += (duration - stats.mean_ms) / stats.samples as f64;

        if observation.context_used_pct >= CONTEXT_CRITICAL_PCT {
            findings.push(Finding::new(
                &self.id,
                Domain::Performance,
                Severity::Critical,
                "Context window nearly exhausted",
                format!("{:.1}% of the context window in use", observation.context_used_pct),
                format!("turn {}", observation.turn_number),
                0.95,
            ));
        } else if observation.context_used_pct >= CONTEXT_WARNING_PCT {
            findings.push(Finding::new(
                &self.id,
                Domain::Performance,
                Severity::Warning,
                "Context window pressure",
                format!("{:.1}% of the context window in use", observation.context_used_pct),
                format!("turn {}", observation.turn_number),
                0.85,
            ));
        }

        if observation.tokens_this_turn > self.token_info_threshold {
            findings.push(Finding::new(
                &self.id,
                Domain::Performance,
                Severity::Info,
                "Token-heavy turn",
                format!("{} tokens consumed this turn", observation.tokens_this_turn),
                format!("turn {}", observation.turn_number),
                0.70,
            ));
        }

        findings
    }
}
