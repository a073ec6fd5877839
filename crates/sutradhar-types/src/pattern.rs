use serde::{Deserialize, Serialize};

/// Scope name under which cross-project tendencies are stored.
pub const GLOBAL_PROJECT: &str = "__global__";

/// User phrases that signal a correction. Shared by the correctness
/// guardian and the pattern extractor so both detect the same events.
pub const CORRECTION_PHRASES: &[&str] = &[
    "that's wrong",
    "that is wrong",
    "no, actually",
    "that's not right",
    "that's not what i asked",
    "incorrect",
    "undo that",
];

/// Category of a detected candidate pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternType {
    ToolSequence,
    Preference,
    Decision,
    Correction,
    Convention,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::ToolSequence => "tool-sequence",
            PatternType::Preference => "preference",
            PatternType::Decision => "decision",
            PatternType::Correction => "correction",
            PatternType::Convention => "convention",
        }
    }
}

/// A candidate behavioral pattern observed during replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Samskara {
    /// FNV-1a of `pattern_type + normalized(content)`.
    pub id: String,
    pub session_id: String,
    pub pattern_type: PatternType,
    pub content: String,
    pub observation_count: u64,
    pub confidence: f64,
    pub project: String,
}

/// Emotional valence of a crystallized tendency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Valence {
    Positive,
    Negative,
    Neutral,
}

/// A crystallized stable tendency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vasana {
    pub id: String,
    pub tendency: String,
    pub description: String,
    /// Decays exponentially; rows below 0.01 are deleted.
    pub strength: f64,
    pub stability: f64,
    pub valence: Valence,
    pub source_samskaras: Vec<String>,
    pub reinforcement_count: u64,
    pub last_activated_ms: i64,
    pub predictive_accuracy: f64,
    pub project: String,
}

/// One step of a mined procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VidhiStep {
    pub index: usize,
    pub tool_name: String,
    /// Argument template with `${param}` placeholders.
    pub arg_template: String,
    pub description: String,
}

/// A parameter slot discovered by anti-unification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    /// Inferred JSON type: string, number, boolean, array, object.
    pub param_type: String,
    /// Up to three observed example values.
    pub examples: Vec<serde_json::Value>,
}

/// A parameterized, named tool-call procedure mined from repeated sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vidhi {
    /// FNV-1a of `name + project`.
    pub id: String,
    pub project: String,
    pub name: String,
    /// Session ids the procedure was learned from.
    pub learned_from: Vec<String>,
    pub confidence: f64,
    pub steps: Vec<VidhiStep>,
    /// Natural-language trigger phrases.
    pub triggers: Vec<String>,
    pub success_rate: f64,
    pub parameter_schema: Vec<ParamSpec>,
}
