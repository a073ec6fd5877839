use crate::guardians::Guardian;
use std::collections::HashMap;
use sutradhar_types::{Domain, Finding, Severity, ToolObservation, CORRECTION_PHRASES};

/// Repeats of the error→retry→same-error loop that escalate to critical.
const LOOP_CRITICAL_COUNT: u32 = 3;

#[derive(Debug, Clone, Default)]
struct ToolErrorState {
    last_error: Option<String>,
    /// Consecutive occurrences of the same error message.
    repeat_count: u32,
}

/// Watches for repeated tool errors, correction loops, and user
/// corrections.
pub struct CorrectnessGuardian {
    id: String,
    errors: HashMap<String, ToolErrorState>,
}

impl CorrectnessGuardian {
    pub fn new() -> Self {
        Self {
            id: "correctness".to_string(),
            errors: HashMap::new(),
        }
    }
}

impl Default for CorrectnessGuardian {
    fn default() -> Self {
        Self::new()
    }
}

impl Guardian for CorrectnessGuardian {
    fn id(&self) -> &str {
        &self.id
    }

    fn domain(&self) -> Domain {
        Domain::Correctness
    }

    fn scan(&mut self, observation: &ToolObservation) -> Vec<Finding> {
        let mut findings = Vec::new();

        let state = self
            .errors
            .entry(observation.tool_name.clone())
            .or_default();

        if observation.is_error {
            let message = observation
                .error_message
                .clone()
                .unwrap_or_else(|| observation.output.clone());
            let same_as_last = state.last_error.as_deref() == Some(message.as_str());
            if same_as_last {
                state.repeat_count += 1;
            } else {
                state.repeat_count = 1;
                state.last_error = Some(message.clone());
            }

            if state.repeat_count >= LOOP_CRITICAL_COUNT {
                findings.push(
                    Finding::new(
                        &self.id,
                        Domain::Correctness,
                        Severity::Critical,
                        format!("Correction loop on {}", observation.tool_name),
                        format!(
                            "the same error recurred {} times: {}",
                            state.repeat_count,
                            truncate(&message, 120)
                        ),
                        &observation.tool_name,
                        0.90,
                    )
                    .with_suggestion("step back and change approach"),
                );
            } else if state.repeat_count == 2 {
                findings.push(Finding::new(
                    &self.id,
                    Domain::Correctness,
                    Severity::Warning,
                    format!("Repeated {} error", observation.tool_name),
                    format!("consecutive identical errors: {}", truncate(&message, 120)),
                    &observation.tool_name,
                    0.80,
                ));
            }
        } else {
            state.last_error = None;
            state.repeat_count = 0;
        }

        if let Some(user_text) = &observation.user_text {
            let lowered = user_text.to_lowercase();
            if let Some(phrase) = CORRECTION_PHRASES
                .iter()
                .find(|phrase| lowered.contains(**phrase))
            {
                findings.push(Finding::new(
                    &self.id,
                    Domain::Correctness,
                    Severity::Warning,
                    "User correction detected",
                    format!("user said \"{}\"", phrase),
                    format!("turn {}", observation.turn_number),
                    0.75,
                ));
            }
        }

        findings
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    text.chars().take(max).collect()
}
