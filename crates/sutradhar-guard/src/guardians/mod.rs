mod correctness;
mod performance;
mod security;

pub use correctness::CorrectnessGuardian;
pub use performance::PerformanceGuardian;
pub use security::SecurityGuardian;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::time::Instant;
use sutradhar_core::Ring;
use sutradhar_types::{Domain, Finding, Severity, ToolObservation};
use tokio::sync::broadcast;
use tracing::warn;

/// A guardian scans one tool observation and emits zero or more findings.
/// Guardians may keep internal state (moving averages, error streaks).
pub trait Guardian: Send {
    fn id(&self) -> &str;
    fn domain(&self) -> Domain;
    fn scan(&mut self, observation: &ToolObservation) -> Vec<Finding>;
}

/// Guardian pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardianConfig {
    /// Ring capacity per guardian.
    pub max_findings: usize,
    /// Findings below this confidence are dropped.
    pub confidence_threshold: f64,
    /// Samples before latency anomaly detection engages.
    pub latency_min_samples: u64,
    /// Per-turn token usage that triggers an informational finding.
    pub token_info_threshold: u64,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            max_findings: 500,
            confidence_threshold: 0.5,
            latency_min_samples: 5,
            token_info_threshold: 20_000,
        }
    }
}

/// Aggregate scan statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub scans_completed: u64,
    pub findings_by_severity: HashMap<String, u64>,
    pub total_scan_ms: u64,
}

struct GuardianSlot {
    guardian: Box<dyn Guardian>,
    ring: Ring<Finding>,
}

type Listener = Box<dyn Fn(&Finding) + Send + Sync>;

/// Fans every tool observation out to the three guardians in parallel,
/// retains findings in per-guardian rings, and broadcasts criticals.
pub struct GuardianPipeline {
    config: GuardianConfig,
    slots: Vec<Mutex<GuardianSlot>>,
    listeners: Mutex<Vec<Listener>>,
    critical_tx: broadcast::Sender<Finding>,
    stats: Mutex<PipelineStats>,
}

impl GuardianPipeline {
    pub fn new(config: GuardianConfig) -> Self {
        let slots = vec![
            Self::slot(Box::new(SecurityGuardian::new()), config.max_findings),
            Self::slot(
                Box::new(PerformanceGuardian::new(
                    config.latency_min_samples,
                    config.token_info_threshold,
                )),
                config.max_findings,
            ),
            Self::slot(Box::new(CorrectnessGuardian::new()), config.max_findings),
        ];
        let (critical_tx, _) = broadcast::channel(64);
        Self {
            config,
            slots,
            listeners: Mutex::new(Vec::new()),
            critical_tx,
            stats: Mutex::new(PipelineStats::default()),
        }
    }

    fn slot(guardian: Box<dyn Guardian>, capacity: usize) -> Mutex<GuardianSlot> {
        Mutex::new(GuardianSlot {
            guardian,
            ring: Ring::new(capacity),
        })
    }

    /// Register a listener invoked for every retained finding. Listener
    /// panics are swallowed and must not affect other listeners or scans.
    pub fn add_listener(&self, listener: impl Fn(&Finding) + Send + Sync + 'static) {
        self.listeners.lock().unwrap().push(Box::new(listener));
    }

    /// Subscribe to the ambient critical-finding channel.
    pub fn subscribe_critical(&self) -> broadcast::Receiver<Finding> {
        self.critical_tx.subscribe()
    }

    /// Scan one tool execution. Guardians run on parallel threads, each
    /// owning its ring exclusively; the merged result is newest-first with
    /// a stable id tie-break.
    pub fn scan(&self, observation: &ToolObservation) -> Vec<Finding> {
        let started = Instant::now();
        let threshold = self.config.confidence_threshold;

        let mut merged: Vec<Finding> = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .slots
                .iter()
                .map(|slot| {
                    scope.spawn(move || {
                        let mut slot = slot.lock().unwrap();
                        let findings: Vec<Finding> = slot
                            .guardian
                            .scan(observation)
                            .into_iter()
                            .filter(|f| f.confidence >= threshold)
                            .collect();
                        for finding in &findings {
                            slot.ring.push(finding.clone());
                        }
                        findings
                    })
                })
                .collect();

            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap_or_default())
                .collect()
        });

        merged.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms).then(a.id.cmp(&b.id)));

        {
            let mut stats = self.stats.lock().unwrap();
            stats.scans_completed += 1;
            stats.total_scan_ms += started.elapsed().as_millis() as u64;
            for finding in &merged {
                *stats
                    .findings_by_severity
                    .entry(finding.severity.as_str().to_string())
                    .or_default() += 1;
            }
        }

        let listeners = self.listeners.lock().unwrap();
        for finding in &merged {
            for listener in listeners.iter() {
                if catch_unwind(AssertUnwindSafe(|| listener(finding))).is_err() {
                    warn!(finding = %finding.id, "guardian listener panicked");
                }
            }
            if finding.severity == Severity::Critical {
                let _ = self.critical_tx.send(finding.clone());
            }
        }

        merged
    }

    /// Union of all rings, newest first, optionally limited.
    pub fn all_findings(&self, limit: Option<usize>) -> Vec<Finding> {
        let mut all: Vec<Finding> = self
            .slots
            .iter()
            .flat_map(|slot| slot.lock().unwrap().ring.snapshot())
            .collect();
        all.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms).then(a.id.cmp(&b.id)));
        if let Some(limit) = limit {
            all.truncate(limit);
        }
        all
    }

    pub fn findings_by_domain(&self, domain: Domain) -> Vec<Finding> {
        self.all_findings(None)
            .into_iter()
            .filter(|f| f.domain == domain)
            .collect()
    }

    pub fn critical_findings(&self) -> Vec<Finding> {
        self.all_findings(None)
            .into_iter()
            .filter(|f| f.severity == Severity::Critical)
            .collect()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn credential_observation() -> ToolObservation {
        ToolObservation {
            tool_name: "bash".to_string(),
            args: serde_json::json!({"command": "cat config"}),
            output: "api_key = \"sk-abcdefghijklmnopqrstuvwx\"".to_string(),
            duration_ms: 50,
            turn_number: 1,
            tokens_this_turn: 100,
            context_used_pct: 10.0,
            is_error: false,
            error_message: None,
            user_text: None,
        }
    }

    fn benign_observation() -> ToolObservation {
        ToolObservation {
            tool_name: "read".to_string(),
            args: serde_json::json!({"file_path": "src/lib.rs"}),
            output: "fn main() {}".to_string(),
            duration_ms: 5,
            turn_number: 1,
            tokens_this_turn: 50,
            context_used_pct: 5.0,
            is_error: false,
            error_message: None,
            user_text: None,
        }
    }

    #[test]
    fn test_scan_detects_credential_and_broadcasts() {
        let pipeline = GuardianPipeline::new(GuardianConfig::default());
        let mut critical_rx = pipeline.subscribe_critical();

        let findings = pipeline.scan(&credential_observation());
        assert!(findings
            .iter()
            .any(|f| f.severity == Severity::Critical && f.domain == Domain::Security));

        let broadcast = critical_rx.try_recv().unwrap();
        assert_eq!(broadcast.severity, Severity::Critical);
    }

    #[test]
    fn test_benign_scan_produces_nothing() {
        let pipeline = GuardianPipeline::new(GuardianConfig::default());
        let findings = pipeline.scan(&benign_observation());
        assert!(findings.is_empty());
        assert_eq!(pipeline.stats().scans_completed, 1);
    }

    #[test]
    fn test_listener_panic_does_not_stop_others() {
        let pipeline = GuardianPipeline::new(GuardianConfig::default());
        let seen = Arc::new(AtomicUsize::new(0));

        pipeline.add_listener(|_| panic!("bad listener"));
        let counter = seen.clone();
        pipeline.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let findings = pipeline.scan(&credential_observation());
        assert!(!findings.is_empty());
        assert_eq!(seen.load(Ordering::SeqCst), findings.len());
    }

    #[test]
    fn test_rings_are_bounded() {
        let pipeline = GuardianPipeline::new(GuardianConfig {
            max_findings: 3,
            ..Default::default()
        });
        for _ in 0..10 {
            pipeline.scan(&credential_observation());
        }
        let security = pipeline.findings_by_domain(Domain::Security);
        assert!(security.len() <= 3);
    }

    #[test]
    fn test_all_findings_newest_first() {
        let pipeline = GuardianPipeline::new(GuardianConfig::default());
        pipeline.scan(&credential_observation());
        pipeline.scan(&credential_observation());

        let all = pipeline.all_findings(None);
        assert!(all.len() >= 2);
        for pair in all.windows(2) {
            assert!(pair[0].timestamp_ms >= pair[1].timestamp_ms);
        }

        let limited = pipeline.all_findings(Some(1));
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_low_confidence_findings_dropped() {
        let pipeline = GuardianPipeline::new(GuardianConfig {
            confidence_threshold: 0.99,
            ..Default::default()
        });
        let findings = pipeline.scan(&credential_observation());
        assert!(findings.is_empty());
    }
}
