use serde::{Deserialize, Serialize};
use sutradhar_core::{fnv1a_hex, unique_millis};

/// Severity scale shared by guardian findings and policy rules.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// Which guardian family produced a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Security,
    Performance,
    Correctness,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Security => "security",
            Domain::Performance => "performance",
            Domain::Correctness => "correctness",
        }
    }
}

/// One observation emitted by a guardian.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// Deterministic id: FNV-1a over guardian, title, location, and a
    /// process-unique millisecond timestamp.
    pub id: String,
    pub guardian_id: String,
    pub domain: Domain,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    pub confidence: f64,
    pub auto_fixable: bool,
    pub timestamp_ms: i64,
}

impl Finding {
    pub fn new(
        guardian_id: impl Into<String>,
        domain: Domain,
        severity: Severity,
        title: impl Into<String>,
        description: impl Into<String>,
        location: impl Into<String>,
        confidence: f64,
    ) -> Self {
        let guardian_id = guardian_id.into();
        let title = title.into();
        let location = location.into();
        let timestamp_ms = unique_millis();
        let id = fnv1a_hex(&format!(
            "{}:{}:{}:{}",
            guardian_id, title, location, timestamp_ms
        ));
        Self {
            id,
            guardian_id,
            domain,
            severity,
            title,
            description: description.into(),
            location,
            suggestion: None,
            confidence: confidence.clamp(0.0, 1.0),
            auto_fixable: false,
            timestamp_ms,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// What the guardian pipeline sees after every tool execution.
#[derive(Debug, Clone)]
pub struct ToolObservation {
    pub tool_name: String,
    pub args: serde_json::Value,
    pub output: String,
    pub duration_ms: u64,
    pub turn_number: u64,
    pub tokens_this_turn: u64,
    /// Context window utilization in [0, 100].
    pub context_used_pct: f64,
    pub is_error: bool,
    pub error_message: Option<String>,
    /// Latest user text, when the observation follows a user turn.
    pub user_text: Option<String>,
}

impl ToolObservation {
    pub fn new(tool_name: impl Into<String>, args: serde_json::Value, output: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            args,
            output: output.into(),
            duration_ms: 0,
            turn_number: 0,
            tokens_this_turn: 0,
            context_used_pct: 0.0,
            is_error: false,
            error_message: None,
            user_text: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn test_finding_ids_unique_under_clock_ties() {
        // Two findings with identical guardian/title/location created
        // back-to-back must still get distinct ids.
        let a = Finding::new(
            "security",
            Domain::Security,
            Severity::Critical,
            "Credential detected",
            "api key in output",
            "bash",
            0.85,
        );
        let b = Finding::new(
            "security",
            Domain::Security,
            Severity::Critical,
            "Credential detected",
            "api key in output",
            "bash",
            0.85,
        );
        assert_ne!(a.id, b.id);
        assert!(b.timestamp_ms > a.timestamp_ms);
    }

    #[test]
    fn test_confidence_clamped() {
        let finding = Finding::new(
            "performance",
            Domain::Performance,
            Severity::Info,
            "t",
            "d",
            "l",
            1.7,
        );
        assert_eq!(finding.confidence, 1.0);
    }
}
