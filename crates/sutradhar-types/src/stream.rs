use serde::{Deserialize, Serialize};

/// Why a model stream terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
}

/// Token accounting for one model call. Providers may emit this
/// incrementally; the last emission wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// The provider streaming contract: a fixed event sequence of
/// `Start (Text|Thinking|ToolCall)* Usage* Done`, or a terminal `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Start {
        message_id: String,
    },
    Text {
        text: String,
    },
    Thinking {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        /// Arguments as a JSON string.
        arguments: String,
    },
    Usage(TokenUsage),
    Done {
        stop_reason: StopReason,
        usage: TokenUsage,
        #[serde(skip_serializing_if = "Option::is_none")]
        cost: Option<f64>,
    },
    Error {
        message: String,
    },
}

impl StreamEvent {
    /// Terminal events end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_event_serde_tagging() {
        let event = StreamEvent::ToolCall {
            id: "t1".to_string(),
            name: "read".to_string(),
            arguments: r#"{"file_path":"a.rs"}"#.to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"tool_call\""));
        let back: StreamEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_terminal_classification() {
        assert!(StreamEvent::Error {
            message: "boom".to_string()
        }
        .is_terminal());
        assert!(StreamEvent::Done {
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage::default(),
            cost: None,
        }
        .is_terminal());
        assert!(!StreamEvent::Text {
            text: "hi".to_string()
        }
        .is_terminal());
    }
}
