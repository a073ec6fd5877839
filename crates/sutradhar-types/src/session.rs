use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of the actor that produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

/// One content block within a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Thinking {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        /// Arguments as the raw JSON string the model emitted.
        arguments: String,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

/// Token and dollar cost attributed to one turn.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub cost_usd: f64,
}

impl CostBreakdown {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// One user or assistant exchange within a session. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub session_id: String,
    /// Monotonic per session, starting at 0.
    pub turn_number: u64,
    pub role: Role,
    pub parts: Vec<ContentPart>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub cost: CostBreakdown,
}

/// A completed tool call extracted from a turn's content parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub is_error: bool,
}

impl Turn {
    pub fn new(session_id: impl Into<String>, turn_number: u64, role: Role) -> Self {
        Self {
            session_id: session_id.into(),
            turn_number,
            role,
            parts: Vec::new(),
            timestamp: Utc::now(),
            model: None,
            cost: CostBreakdown::default(),
        }
    }

    /// Concatenated text content (tool payloads excluded).
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let ContentPart::Text { text } = part {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    /// Tool calls paired with their results by `tool_use_id`.
    ///
    /// A call with no matching result in the same turn is returned with
    /// `result: None` (the execution was lost or is still pending).
    pub fn tool_calls(&self) -> Vec<ToolCallRecord> {
        let mut calls: Vec<(String, ToolCallRecord)> = Vec::new();
        for part in &self.parts {
            match part {
                ContentPart::ToolUse {
                    id,
                    name,
                    arguments,
                } => {
                    calls.push((
                        id.clone(),
                        ToolCallRecord {
                            name: name.clone(),
                            arguments: arguments.clone(),
                            result: None,
                            is_error: false,
                        },
                    ));
                }
                ContentPart::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    if let Some((_, record)) =
                        calls.iter_mut().find(|(id, _)| id == tool_use_id)
                    {
                        record.result = Some(content.clone());
                        record.is_error = *is_error;
                    }
                }
                _ => {}
            }
        }
        calls.into_iter().map(|(_, record)| record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn_with_tool_parts() -> Turn {
        let mut turn = Turn::new("s1", 0, Role::Assistant);
        turn.parts = vec![
            ContentPart::Text {
                text: "Reading the file".to_string(),
            },
            ContentPart::ToolUse {
                id: "t1".to_string(),
                name: "read".to_string(),
                arguments: r#"{"file_path":"src/main.rs"}"#.to_string(),
            },
            ContentPart::ToolResult {
                tool_use_id: "t1".to_string(),
                content: "fn main() {}".to_string(),
                is_error: false,
            },
            ContentPart::ToolUse {
                id: "t2".to_string(),
                name: "bash".to_string(),
                arguments: r#"{"command":"ls"}"#.to_string(),
            },
        ];
        turn
    }

    #[test]
    fn test_tool_calls_pairing() {
        let calls = turn_with_tool_parts().tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "read");
        assert_eq!(calls[0].result.as_deref(), Some("fn main() {}"));
        assert!(!calls[0].is_error);
        assert_eq!(calls[1].name, "bash");
        assert!(calls[1].result.is_none());
    }

    #[test]
    fn test_text_excludes_tool_payloads() {
        let turn = turn_with_tool_parts();
        assert_eq!(turn.text(), "Reading the file");
    }

    #[test]
    fn test_turn_serde_round_trip() {
        let turn = turn_with_tool_parts();
        let json = serde_json::to_string(&turn).unwrap();
        let back: Turn = serde_json::from_str(&json).unwrap();
        assert_eq!(back.parts, turn.parts);
        assert_eq!(back.turn_number, 0);
    }
}
