use crate::math::{ln_gamma, log_sum_exp};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

// NOTE: BOCPD Numerical Design
//
// Run-length probabilities live in log space and are normalized with
// log-sum-exp; the Student-t predictive uses ln_gamma throughout. An
// observation far outside every run-length's predictive mass contributes
// essentially zero likelihood, which collapses the posterior onto short
// runs and opens a pending spike. Whether the spike was a one-off anomaly
// or a real regime shift is decided by watching the next few observations:
// if they revert to the pre-spike regime the spike is an anomaly, if they
// keep violating it the spike confirms as a change point.

/// Classification of one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Fits the current regime.
    Stable,
    /// A spike that reverted (or is still unresolved) within the window.
    Anomaly,
    /// The spike persisted across the revert window.
    ChangePoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BocpdConfig {
    /// Expected run length; hazard is its reciprocal.
    pub expected_run_length: f64,
    /// Observations over which a spike must persist to confirm.
    pub revert_window: usize,
    /// Fraction of the revert window that must stay out of regime to confirm.
    pub confirm_ratio: f64,
    /// Run-length distribution truncation.
    pub max_run_length: usize,
}

impl Default for BocpdConfig {
    fn default() -> Self {
        Self {
            expected_run_length: 250.0,
            revert_window: 5,
            confirm_ratio: 0.6,
            max_run_length: 500,
        }
    }
}

/// Normal-Gamma sufficient statistics for one run-length hypothesis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct NormalGamma {
    mu: f64,
    kappa: f64,
    alpha: f64,
    beta: f64,
}

impl NormalGamma {
    fn prior() -> Self {
        Self {
            mu: 0.0,
            kappa: 1.0,
            alpha: 1.0,
            beta: 1.0,
        }
    }

    fn updated(&self, x: f64) -> Self {
        let kappa = self.kappa + 1.0;
        Self {
            mu: (self.kappa * self.mu + x) / kappa,
            kappa,
            alpha: self.alpha + 0.5,
            beta: self.beta + self.kappa * (x - self.mu).powi(2) / (2.0 * kappa),
        }
    }

    /// Log predictive density: Student-t with 2α degrees of freedom.
    fn log_predictive(&self, x: f64) -> f64 {
        let df = 2.0 * self.alpha;
        let scale2 = self.beta * (self.kappa + 1.0) / (self.alpha * self.kappa);
        let t2 = (x - self.mu).powi(2) / scale2;
        ln_gamma((df + 1.0) / 2.0)
            - ln_gamma(df / 2.0)
            - 0.5 * (df * std::f64::consts::PI * scale2).ln()
            - (df + 1.0) / 2.0 * (1.0 + t2 / df).ln()
    }

    fn std_dev(&self) -> f64 {
        (self.beta / self.alpha).sqrt()
    }
}

/// A spike awaiting anomaly-vs-change-point resolution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PendingSpike {
    /// Pre-spike regime mean and deviation, frozen at spike time.
    mu: f64,
    sigma: f64,
    seen: u32,
    out_of_regime: u32,
}

/// Minimum MAP run length before spike detection engages.
const BURN_IN: usize = 5;

/// Bayesian Online Change-Point Detection over one scalar feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BocpdState {
    config: BocpdConfig,
    /// Log run-length distribution; index = hypothesized run length.
    log_r: Vec<f64>,
    stats: Vec<NormalGamma>,
    consecutive_stable: u32,
    /// Recent P(r = 0) values, newest last, for inspection.
    recent_cp_probs: VecDeque<f64>,
    pending: Option<PendingSpike>,
    observations: u64,
}

impl BocpdState {
    pub fn new(config: BocpdConfig) -> Self {
        Self {
            config,
            log_r: vec![0.0],
            stats: vec![NormalGamma::prior()],
            consecutive_stable: 0,
            recent_cp_probs: VecDeque::new(),
            pending: None,
            observations: 0,
        }
    }

    pub fn consecutive_stable(&self) -> u32 {
        self.consecutive_stable
    }

    pub fn observations(&self) -> u64 {
        self.observations
    }

    /// Probability mass currently on run length zero.
    pub fn change_point_probability(&self) -> f64 {
        self.log_r.first().map(|lp| lp.exp()).unwrap_or(0.0)
    }

    fn map_run(&self) -> (usize, NormalGamma) {
        let index = self
            .log_r
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0);
        (index, self.stats.get(index).copied().unwrap_or_else(NormalGamma::prior))
    }

    /// Ingest one observation and classify it.
    pub fn observe(&mut self, x: f64) -> Classification {
        self.observations += 1;

        // Pre-update MAP regime, used both for spike detection and for the
        // frozen reference a pending spike is judged against.
        let (map_index, map_stats) = self.map_run();
        let regime_sigma = map_stats.std_dev().max(1e-9);
        let out_of_regime = (x - map_stats.mu).abs() > 3.0 * regime_sigma;

        self.posterior_update(x);

        let p0 = self.change_point_probability();
        if self.recent_cp_probs.len() == self.config.revert_window {
            self.recent_cp_probs.pop_front();
        }
        self.recent_cp_probs.push_back(p0);

        if let Some(mut spike) = self.pending.take() {
            spike.seen += 1;
            if (x - spike.mu).abs() > 3.0 * spike.sigma {
                spike.out_of_regime += 1;
            }
            if spike.seen as usize >= self.config.revert_window {
                let ratio = spike.out_of_regime as f64 / spike.seen as f64;
                return if ratio >= self.config.confirm_ratio {
                    Classification::ChangePoint
                } else {
                    Classification::Anomaly
                };
            }
            self.pending = Some(spike);
            return Classification::Anomaly;
        }

        if map_index >= BURN_IN && out_of_regime {
            self.consecutive_stable = 0;
            self.pending = Some(PendingSpike {
                mu: map_stats.mu,
                sigma: regime_sigma,
                seen: 0,
                out_of_regime: 0,
            });
            return Classification::Anomaly;
        }

        self.consecutive_stable += 1;
        Classification::Stable
    }

    /// Standard run-length posterior recursion.
    fn posterior_update(&mut self, x: f64) {
        let hazard = 1.0 / self.config.expected_run_length.max(1.0);
        let log_h = hazard.ln();
        let log_1mh = (1.0 - hazard).ln();

        let predictive: Vec<f64> = self.stats.iter().map(|s| s.log_predictive(x)).collect();

        // Growth shifts every run length up by one; change-point mass
        // collapses onto r = 0.
        let mut cp_terms = Vec::with_capacity(self.log_r.len());
        let mut next_log_r = Vec::with_capacity(self.log_r.len() + 1);
        next_log_r.push(f64::NEG_INFINITY);
        for (r, log_p) in self.log_r.iter().enumerate() {
            let joint = log_p + predictive[r];
            cp_terms.push(joint + log_h);
            next_log_r.push(joint + log_1mh);
        }
        next_log_r[0] = log_sum_exp(&cp_terms);

        let norm = log_sum_exp(&next_log_r);
        for value in next_log_r.iter_mut() {
            *value -= norm;
        }

        let mut next_stats = Vec::with_capacity(self.stats.len() + 1);
        next_stats.push(NormalGamma::prior());
        for stat in &self.stats {
            next_stats.push(stat.updated(x));
        }

        if next_log_r.len() > self.config.max_run_length {
            next_log_r.truncate(self.config.max_run_length);
            next_stats.truncate(self.config.max_run_length);
            let norm = log_sum_exp(&next_log_r);
            for value in next_log_r.iter_mut() {
                *value -= norm;
            }
        }

        self.log_r = next_log_r;
        self.stats = next_stats;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(state: &mut BocpdState, values: &[f64]) -> Vec<Classification> {
        values.iter().map(|v| state.observe(*v)).collect()
    }

    #[test]
    fn test_steady_stream_is_stable() {
        let mut state = BocpdState::new(BocpdConfig::default());
        let values: Vec<f64> = (0..40).map(|i| 1.0 + 0.01 * (i % 3) as f64).collect();
        let classes = drive(&mut state, &values);

        assert!(classes[10..].iter().all(|c| *c == Classification::Stable));
        assert!(state.consecutive_stable() >= 30);
    }

    #[test]
    fn test_log_r_stays_normalized() {
        let mut state = BocpdState::new(BocpdConfig::default());
        for i in 0..100 {
            state.observe((i % 5) as f64 * 0.1);
        }
        let total: f64 = state.log_r.iter().map(|lp| lp.exp()).sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_regime_shift_confirms_as_change_point() {
        let mut state = BocpdState::new(BocpdConfig {
            expected_run_length: 50.0,
            revert_window: 3,
            confirm_ratio: 0.6,
            max_run_length: 200,
        });

        let mut values: Vec<f64> = (0..30).map(|_| 0.0).collect();
        values.extend((0..10).map(|_| 50.0));
        let classes = drive(&mut state, &values);

        let tail = &classes[30..];
        assert!(tail.iter().any(|c| *c != Classification::Stable));
        assert!(tail.iter().any(|c| *c == Classification::ChangePoint));
    }

    #[test]
    fn test_single_outlier_reads_as_anomaly_not_change_point() {
        let mut state = BocpdState::new(BocpdConfig {
            expected_run_length: 50.0,
            revert_window: 4,
            confirm_ratio: 0.75,
            max_run_length: 200,
        });

        let mut values: Vec<f64> = (0..30).map(|_| 0.0).collect();
        values.push(80.0);
        values.extend((0..10).map(|_| 0.0));
        let classes = drive(&mut state, &values);

        assert!(!classes.contains(&Classification::ChangePoint));
        assert!(classes[29..36].iter().any(|c| *c == Classification::Anomaly));
    }

    #[test]
    fn test_stable_counter_resets_on_spike() {
        let mut state = BocpdState::new(BocpdConfig {
            expected_run_length: 50.0,
            revert_window: 3,
            confirm_ratio: 0.6,
            max_run_length: 200,
        });

        for _ in 0..20 {
            state.observe(0.0);
        }
        assert!(state.consecutive_stable() >= 15);
        state.observe(100.0);
        assert_eq!(state.consecutive_stable(), 0);
    }

    #[test]
    fn test_truncation_bounds_run_lengths() {
        let mut state = BocpdState::new(BocpdConfig {
            expected_run_length: 1000.0,
            revert_window: 5,
            confirm_ratio: 0.6,
            max_run_length: 20,
        });
        for _ in 0..100 {
            state.observe(1.0);
        }
        assert!(state.log_r.len() <= 20);
    }
}
