use crate::linalg::{self, Matrix, Vector};
use serde::{Deserialize, Serialize};
use sutradhar_types::{
    CascadeOutcome, ContextVector, RouteDecision, RoutePreference, Tier, FEATURE_DIM, NUM_TIERS,
};

/// Tier-routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// LinUCB exploration parameter.
    pub linucb_alpha: f64,
    /// Blended per-call cost estimate per tier, cheapest first.
    pub tier_costs: [f64; NUM_TIERS],
    pub max_conversation_depth: usize,
    pub max_memory_hits: usize,
    /// Dollar budget per day, used for the Lagrangian step size target.
    pub daily_budget: f64,
    pub expected_daily_requests: f64,
    /// Confidence below which a decision escalates one tier.
    pub cascade_threshold: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            linucb_alpha: 0.5,
            tier_costs: [0.0, 0.25, 3.0, 15.0],
            max_conversation_depth: 40,
            max_memory_hits: 20,
            daily_budget: 25.0,
            expected_daily_requests: 200.0,
            cascade_threshold: 0.4,
        }
    }
}

impl RouterConfig {
    fn budget_per_step(&self) -> f64 {
        if self.expected_daily_requests <= 0.0 {
            return 0.0;
        }
        self.daily_budget / self.expected_daily_requests
    }
}

/// Learning rate for the budget Lagrangian (PILOT update).
const LAMBDA_ETA: f64 = 0.01;

/// One bandit arm: Thompson posteriors plus LinUCB sufficient statistics.
#[derive(Debug, Clone)]
struct ArmState {
    plays: u64,
    total_reward: f64,
    total_cost: f64,
    alpha: f64,
    beta: f64,
    /// D×D design matrix; identity at init, so always SPD.
    a: Matrix,
    /// D-dim reward-weighted feature accumulator.
    b: Vector,
}

impl ArmState {
    fn new() -> Self {
        Self {
            plays: 0,
            total_reward: 0.0,
            total_cost: 0.0,
            alpha: 1.0,
            beta: 1.0,
            a: linalg::identity(),
            b: [0.0; FEATURE_DIM],
        }
    }
}

/// Serialized router state; round-trips through serde.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSnapshot {
    pub total_plays: u64,
    pub opus_baseline_cost: f64,
    pub lambda: f64,
    pub arms: Vec<ArmSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmSnapshot {
    pub plays: u64,
    pub total_reward: f64,
    pub total_cost: f64,
    pub alpha: f64,
    pub beta: f64,
    pub a: Vec<Vec<f64>>,
    pub b: Vec<f64>,
}

/// Cumulative savings versus always routing to the top tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavingsReport {
    pub opus_baseline_cost: f64,
    pub actual_cost: f64,
    pub saved: f64,
    pub plays_per_tier: [u64; NUM_TIERS],
}

/// Contextual bandit over the four model tiers.
///
/// Cold start runs a deterministic heuristic until every arm has had a
/// chance to accumulate signal; after that, selection is LinUCB blended
/// with a cost preference and penalized by a budget Lagrangian.
pub struct TierRouter {
    config: RouterConfig,
    arms: [ArmState; NUM_TIERS],
    total_plays: u64,
    opus_baseline_cost: f64,
    lambda: f64,
}

impl TierRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            arms: [
                ArmState::new(),
                ArmState::new(),
                ArmState::new(),
                ArmState::new(),
            ],
            total_plays: 0,
            opus_baseline_cost: 0.0,
            lambda: 0.0,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn total_plays(&self) -> u64 {
        self.total_plays
    }

    /// Pick a tier for the given context.
    pub fn classify(&self, context: &ContextVector, preference: &RoutePreference) -> RouteDecision {
        let context = context.clamped();
        if self.total_plays < 2 * NUM_TIERS as u64 {
            return self.heuristic_classify(&context);
        }
        self.linucb_classify(&context, preference)
    }

    /// Deterministic cold-start heuristic.
    fn heuristic_classify(&self, context: &ContextVector) -> RouteDecision {
        let score = 0.25 * context.complexity
            + 0.2 * context.precision
            + 0.2 * context.code_ratio
            + 0.2 * context.creativity
            + 0.15 * context.urgency;

        let mut tier = if score < 0.1 {
            Tier::NoLlm
        } else if score < 0.25 {
            Tier::Haiku
        } else if score < 0.55 {
            Tier::Sonnet
        } else {
            Tier::Opus
        };

        let mut rationale = format!("Heuristic cold start (score {:.3})", score);
        if context.complexity > 0.7 {
            tier = Tier::Opus;
            rationale.push_str("; High complexity forces top tier");
        } else if tier == Tier::NoLlm && context.urgency > 0.3 {
            tier = Tier::Haiku;
            rationale.push_str("; urgency promotes past no-llm");
        }

        RouteDecision {
            tier,
            confidence: 1.0,
            cost_estimate: self.config.tier_costs[tier.index()],
            context: *context,
            rationale,
            arm_index: tier.index(),
        }
    }

    fn linucb_classify(
        &self,
        context: &ContextVector,
        preference: &RoutePreference,
    ) -> RouteDecision {
        let x = context.features();
        let cost_max = self
            .config
            .tier_costs
            .iter()
            .copied()
            .fold(f64::MIN, f64::max)
            .max(f64::EPSILON);
        let weight = preference.cost_weight.clamp(0.0, 1.0);

        let mut best_index = 0usize;
        let mut best_score = f64::NEG_INFINITY;
        let mut best_sigma = 0.0;
        let mut best_ucb = 0.0;

        for (index, arm) in self.arms.iter().enumerate() {
            // A is SPD by construction; a failed solve would be a logic bug,
            // so fall back to the prior mean rather than panicking.
            let theta = linalg::solve_spd(&arm.a, &arm.b).unwrap_or([0.0; FEATURE_DIM]);
            let mu = linalg::dot(&x, &theta);
            let z = linalg::solve_spd(&arm.a, &x).unwrap_or([0.0; FEATURE_DIM]);
            let sigma = linalg::dot(&x, &z).max(0.0).sqrt();

            let ucb = mu + self.config.linucb_alpha * sigma;
            let cost = self.config.tier_costs[index];
            let cost_score = 1.0 - cost / cost_max;
            let blended = (1.0 - weight) * ucb + weight * cost_score;
            let score = blended - self.lambda * cost;

            if score > best_score {
                best_score = score;
                best_index = index;
                best_sigma = sigma;
                best_ucb = ucb;
            }
        }

        let tier = Tier::from_index(best_index).unwrap_or(Tier::Sonnet);
        RouteDecision {
            tier,
            confidence: 1.0 - best_sigma / (best_sigma + 1.0),
            cost_estimate: self.config.tier_costs[best_index],
            context: *context,
            rationale: format!(
                "LinUCB selected {} (ucb {:.3}, sigma {:.3}, lambda {:.4})",
                tier.as_str(),
                best_ucb,
                best_sigma,
                self.lambda
            ),
            arm_index: best_index,
        }
    }

    /// One-step escalation when confidence is low. Never escalates twice,
    /// never escalates the top tier.
    pub fn cascade_decision(&self, decision: &RouteDecision) -> CascadeOutcome {
        let threshold = self.config.cascade_threshold;
        if decision.confidence >= threshold || decision.tier == Tier::Opus {
            return CascadeOutcome {
                final_tier: decision.tier,
                escalated: false,
                original_tier: decision.tier,
            };
        }
        let next = decision.tier.next_up().unwrap_or(decision.tier);
        CascadeOutcome {
            final_tier: next,
            escalated: next != decision.tier,
            original_tier: decision.tier,
        }
    }

    /// Feed back an outcome reward in [0, 1] for a past decision.
    pub fn record_outcome(&mut self, tier: Tier, context: &ContextVector, reward: f64) {
        let reward = reward.clamp(0.0, 1.0);
        let index = tier.index();
        let x = context.clamped().features();
        let cost = self.config.tier_costs[index];

        let arm = &mut self.arms[index];
        arm.plays += 1;
        arm.total_reward += reward;
        arm.total_cost += cost;
        arm.alpha += reward;
        arm.beta += 1.0 - reward;
        linalg::add_outer(&mut arm.a, &x);
        for (bi, xi) in arm.b.iter_mut().zip(x.iter()) {
            *bi += reward * xi;
        }

        self.total_plays += 1;
        // The top tier is treated as a fully substitutable baseline, so the
        // baseline accrues on every outcome, opus plays included.
        self.opus_baseline_cost += self.config.tier_costs[Tier::Opus.index()];
        self.lambda = (self.lambda + LAMBDA_ETA * (cost - self.config.budget_per_step())).max(0.0);
    }

    pub fn savings_report(&self) -> SavingsReport {
        let actual: f64 = self.arms.iter().map(|arm| arm.total_cost).sum();
        let mut plays = [0u64; NUM_TIERS];
        for (slot, arm) in plays.iter_mut().zip(self.arms.iter()) {
            *slot = arm.plays;
        }
        SavingsReport {
            opus_baseline_cost: self.opus_baseline_cost,
            actual_cost: actual,
            saved: self.opus_baseline_cost - actual,
            plays_per_tier: plays,
        }
    }

    // ==========================================
    // Persistence
    // ==========================================

    pub fn snapshot(&self) -> RouterSnapshot {
        RouterSnapshot {
            total_plays: self.total_plays,
            opus_baseline_cost: self.opus_baseline_cost,
            lambda: self.lambda,
            arms: self
                .arms
                .iter()
                .map(|arm| ArmSnapshot {
                    plays: arm.plays,
                    total_reward: arm.total_reward,
                    total_cost: arm.total_cost,
                    alpha: arm.alpha,
                    beta: arm.beta,
                    a: arm.a.iter().map(|row| row.to_vec()).collect(),
                    b: arm.b.to_vec(),
                })
                .collect(),
        }
    }

    pub fn from_snapshot(config: RouterConfig, snapshot: &RouterSnapshot) -> Self {
        let mut router = Self::new(config);
        router.total_plays = snapshot.total_plays;
        router.opus_baseline_cost = snapshot.opus_baseline_cost;
        router.lambda = snapshot.lambda;
        for (arm, saved) in router.arms.iter_mut().zip(snapshot.arms.iter()) {
            arm.plays = saved.plays;
            arm.total_reward = saved.total_reward;
            arm.total_cost = saved.total_cost;
            arm.alpha = saved.alpha;
            arm.beta = saved.beta;
            for (row, saved_row) in arm.a.iter_mut().zip(saved.a.iter()) {
                for (cell, value) in row.iter_mut().zip(saved_row.iter()) {
                    *cell = *value;
                }
            }
            for (cell, value) in arm.b.iter_mut().zip(saved.b.iter()) {
                *cell = *value;
            }
        }
        router
    }

    pub fn serialize(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.snapshot())
    }

    pub fn deserialize(config: RouterConfig, json: &str) -> serde_json::Result<Self> {
        let snapshot: RouterSnapshot = serde_json::from_str(json)?;
        Ok(Self::from_snapshot(config, &snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::cholesky;

    fn complex_context() -> ContextVector {
        ContextVector {
            complexity: 0.8,
            urgency: 0.1,
            creativity: 0.1,
            precision: 0.1,
            code_ratio: 0.2,
            conversation_depth: 0.1,
            memory_load: 0.1,
        }
    }

    fn trivial_context() -> ContextVector {
        ContextVector {
            complexity: 0.02,
            ..Default::default()
        }
    }

    #[test]
    fn test_cold_start_high_complexity_forces_opus() {
        let router = TierRouter::new(RouterConfig::default());
        let decision = router.classify(&complex_context(), &RoutePreference::default());
        assert_eq!(decision.tier, Tier::Opus);
        assert!(decision.rationale.contains("High complexity"));
    }

    #[test]
    fn test_cold_start_trivial_goes_no_llm() {
        let router = TierRouter::new(RouterConfig::default());
        let decision = router.classify(&trivial_context(), &RoutePreference::default());
        assert_eq!(decision.tier, Tier::NoLlm);
    }

    #[test]
    fn test_cold_start_urgency_promotes_no_llm_to_haiku() {
        let router = TierRouter::new(RouterConfig::default());
        let context = ContextVector {
            complexity: 0.02,
            urgency: 0.5,
            ..Default::default()
        };
        let decision = router.classify(&context, &RoutePreference::default());
        assert_eq!(decision.tier, Tier::Haiku);
    }

    #[test]
    fn test_plays_sum_matches_total() {
        let mut router = TierRouter::new(RouterConfig::default());
        let ctx = complex_context();
        for _ in 0..3 {
            router.record_outcome(Tier::Sonnet, &ctx, 0.9);
            router.record_outcome(Tier::Haiku, &ctx, 0.4);
        }
        let report = router.savings_report();
        let sum: u64 = report.plays_per_tier.iter().sum();
        assert_eq!(sum, router.total_plays());
        assert_eq!(sum, 6);
    }

    #[test]
    fn test_design_matrix_stays_spd() {
        let mut router = TierRouter::new(RouterConfig::default());
        let contexts = [complex_context(), trivial_context()];
        for i in 0..100 {
            let ctx = contexts[i % 2];
            let tier = Tier::ALL[i % NUM_TIERS];
            router.record_outcome(tier, &ctx, (i % 3) as f64 / 2.0);
        }
        for arm in &router.arms {
            assert!(cholesky(&arm.a).is_some(), "A must remain SPD");
        }
    }

    #[test]
    fn test_linucb_mode_after_warmup() {
        let mut router = TierRouter::new(RouterConfig::default());
        let ctx = complex_context();
        for tier in Tier::ALL {
            router.record_outcome(tier, &ctx, 0.5);
            router.record_outcome(tier, &ctx, 0.5);
        }
        let decision = router.classify(&ctx, &RoutePreference::default());
        assert!(decision.rationale.contains("LinUCB"));
        assert!(decision.confidence > 0.0 && decision.confidence <= 1.0);
    }

    #[test]
    fn test_cost_preference_pulls_selection_down() {
        let mut router = TierRouter::new(RouterConfig::default());
        let ctx = complex_context();
        // Warm every arm equally.
        for tier in Tier::ALL {
            for _ in 0..4 {
                router.record_outcome(tier, &ctx, 0.5);
            }
        }
        let thrifty = router.classify(&ctx, &RoutePreference { cost_weight: 1.0 });
        assert_eq!(thrifty.tier, Tier::NoLlm);
    }

    #[test]
    fn test_cascade_escalates_low_confidence_once() {
        let router = TierRouter::new(RouterConfig::default());
        let decision = RouteDecision {
            tier: Tier::Haiku,
            confidence: 0.2,
            cost_estimate: 0.25,
            context: trivial_context(),
            rationale: String::new(),
            arm_index: 1,
        };
        let outcome = router.cascade_decision(&decision);
        assert!(outcome.escalated);
        assert_eq!(outcome.final_tier, Tier::Sonnet);
        assert_eq!(outcome.original_tier, Tier::Haiku);
    }

    #[test]
    fn test_cascade_never_escalates_confident_or_opus() {
        let router = TierRouter::new(RouterConfig::default());
        let confident = RouteDecision {
            tier: Tier::Haiku,
            confidence: 0.9,
            cost_estimate: 0.25,
            context: trivial_context(),
            rationale: String::new(),
            arm_index: 1,
        };
        assert!(!router.cascade_decision(&confident).escalated);

        let opus = RouteDecision {
            tier: Tier::Opus,
            confidence: 0.1,
            cost_estimate: 15.0,
            context: trivial_context(),
            rationale: String::new(),
            arm_index: 3,
        };
        assert!(!router.cascade_decision(&opus).escalated);
    }

    #[test]
    fn test_serialize_round_trip_preserves_decisions() {
        let mut router = TierRouter::new(RouterConfig::default());
        let ctx = complex_context();
        for _ in 0..3 {
            router.record_outcome(Tier::Sonnet, &ctx, 0.8);
        }

        let json = router.serialize().unwrap();
        let restored = TierRouter::deserialize(RouterConfig::default(), &json).unwrap();

        // Still in heuristic range: decisions must match exactly.
        let a = router.classify(&ctx, &RoutePreference::default());
        let b = restored.classify(&ctx, &RoutePreference::default());
        assert_eq!(a.tier, b.tier);
        assert!((a.confidence - b.confidence).abs() < 1e-12);
        assert_eq!(restored.total_plays(), router.total_plays());
        assert!(
            (restored.savings_report().opus_baseline_cost
                - router.savings_report().opus_baseline_cost)
                .abs()
                < 1e-12
        );
    }

    #[test]
    fn test_opus_baseline_accrues_on_every_outcome() {
        let mut router = TierRouter::new(RouterConfig::default());
        let ctx = trivial_context();
        router.record_outcome(Tier::Opus, &ctx, 1.0);
        router.record_outcome(Tier::NoLlm, &ctx, 1.0);
        let report = router.savings_report();
        assert!((report.opus_baseline_cost - 30.0).abs() < 1e-12);
        assert!((report.actual_cost - 15.0).abs() < 1e-12);
        assert!((report.saved - 15.0).abs() < 1e-12);
    }

    #[test]
    fn test_lambda_stays_non_negative() {
        let mut router = TierRouter::new(RouterConfig {
            daily_budget: 0.0,
            ..Default::default()
        });
        let ctx = trivial_context();
        for _ in 0..10 {
            router.record_outcome(Tier::NoLlm, &ctx, 1.0);
        }
        assert!(router.lambda >= 0.0);
    }
}
