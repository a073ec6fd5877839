use serde::{Deserialize, Serialize};

/// Number of routable model tiers.
pub const NUM_TIERS: usize = 4;

/// Context features extracted from a conversation.
pub const CONTEXT_DIM: usize = 7;

/// LinUCB feature dimension: bias term + context features.
pub const FEATURE_DIM: usize = 8;

/// Model capability/cost tier, ordered cheapest to most capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    NoLlm,
    Haiku,
    Sonnet,
    Opus,
}

impl Tier {
    pub const ALL: [Tier; NUM_TIERS] = [Tier::NoLlm, Tier::Haiku, Tier::Sonnet, Tier::Opus];

    pub fn index(&self) -> usize {
        match self {
            Tier::NoLlm => 0,
            Tier::Haiku => 1,
            Tier::Sonnet => 2,
            Tier::Opus => 3,
        }
    }

    pub fn from_index(index: usize) -> Option<Tier> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::NoLlm => "no-llm",
            Tier::Haiku => "haiku",
            Tier::Sonnet => "sonnet",
            Tier::Opus => "opus",
        }
    }

    /// Model identifier handed to the provider layer. `NoLlm` never reaches
    /// a provider.
    pub fn model_id(&self) -> Option<&'static str> {
        match self {
            Tier::NoLlm => None,
            Tier::Haiku => Some("claude-haiku-4-5"),
            Tier::Sonnet => Some("claude-sonnet-4-5"),
            Tier::Opus => Some("claude-opus-4-5"),
        }
    }

    /// Next tier up for cascade escalation; `None` at the top.
    pub fn next_up(&self) -> Option<Tier> {
        Self::from_index(self.index() + 1)
    }

    /// Context window of the tier's model, in tokens. Used to report
    /// context pressure to the guardians.
    pub fn context_window(&self) -> u64 {
        match self {
            // No model behind it; callers treat pressure as zero.
            Tier::NoLlm => 0,
            Tier::Haiku | Tier::Sonnet | Tier::Opus => 200_000,
        }
    }
}

/// Seven conversation features, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ContextVector {
    pub complexity: f64,
    pub urgency: f64,
    pub creativity: f64,
    pub precision: f64,
    pub code_ratio: f64,
    pub conversation_depth: f64,
    pub memory_load: f64,
}

impl ContextVector {
    /// LinUCB feature vector with the bias term prepended.
    pub fn features(&self) -> [f64; FEATURE_DIM] {
        [
            1.0,
            self.complexity,
            self.urgency,
            self.creativity,
            self.precision,
            self.code_ratio,
            self.conversation_depth,
            self.memory_load,
        ]
    }

    /// Clamp every feature into [0, 1].
    pub fn clamped(mut self) -> Self {
        self.complexity = self.complexity.clamp(0.0, 1.0);
        self.urgency = self.urgency.clamp(0.0, 1.0);
        self.creativity = self.creativity.clamp(0.0, 1.0);
        self.precision = self.precision.clamp(0.0, 1.0);
        self.code_ratio = self.code_ratio.clamp(0.0, 1.0);
        self.conversation_depth = self.conversation_depth.clamp(0.0, 1.0);
        self.memory_load = self.memory_load.clamp(0.0, 1.0);
        self
    }
}

/// Caller preference blended into arm selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoutePreference {
    /// Weight of the cost score in [0, 1]; 0 = pure reward, 1 = pure thrift.
    pub cost_weight: f64,
}

impl Default for RoutePreference {
    fn default() -> Self {
        Self { cost_weight: 0.0 }
    }
}

/// Outcome of one routing decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub tier: Tier,
    /// `1 - sigma/(sigma+1)` for the selected arm; 1.0 in heuristic mode.
    pub confidence: f64,
    pub cost_estimate: f64,
    pub context: ContextVector,
    pub rationale: String,
    pub arm_index: usize,
}

/// Result of applying cascade escalation to a decision.
#[derive(Debug, Clone)]
pub struct CascadeOutcome {
    pub final_tier: Tier,
    pub escalated: bool,
    pub original_tier: Tier,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering_and_escalation() {
        assert!(Tier::Opus > Tier::NoLlm);
        assert_eq!(Tier::NoLlm.next_up(), Some(Tier::Haiku));
        assert_eq!(Tier::Sonnet.next_up(), Some(Tier::Opus));
        assert_eq!(Tier::Opus.next_up(), None);
    }

    #[test]
    fn test_context_windows() {
        assert_eq!(Tier::NoLlm.context_window(), 0);
        for tier in [Tier::Haiku, Tier::Sonnet, Tier::Opus] {
            assert!(tier.context_window() > 0);
        }
    }

    #[test]
    fn test_tier_index_round_trip() {
        for tier in Tier::ALL {
            assert_eq!(Tier::from_index(tier.index()), Some(tier));
        }
        assert_eq!(Tier::from_index(4), None);
    }

    #[test]
    fn test_features_prepends_bias() {
        let ctx = ContextVector {
            complexity: 0.5,
            ..Default::default()
        };
        let features = ctx.features();
        assert_eq!(features[0], 1.0);
        assert_eq!(features[1], 0.5);
        assert_eq!(features.len(), FEATURE_DIM);
    }

    #[test]
    fn test_clamped() {
        let ctx = ContextVector {
            complexity: 1.5,
            urgency: -0.2,
            ..Default::default()
        }
        .clamped();
        assert_eq!(ctx.complexity, 1.0);
        assert_eq!(ctx.urgency, 0.0);
    }

    #[test]
    fn test_tier_serde_kebab_case() {
        assert_eq!(serde_json::to_string(&Tier::NoLlm).unwrap(), "\"no-llm\"");
        assert_eq!(serde_json::to_string(&Tier::Haiku).unwrap(), "\"haiku\"");
    }
}
