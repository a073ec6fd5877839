use crate::CancelToken;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use sutradhar_types::{StreamEvent, Turn};

/// A tool advertised to the model. The handler itself lives in the runtime
/// tool registry; providers only see the definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Everything a model call needs: system prompt, history, tool catalog.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub system_prompt: String,
    pub messages: Vec<Turn>,
    pub tools: Vec<ToolDefinition>,
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub max_tokens: u32,
    pub cancel: CancelToken,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_tokens: 8192,
            cancel: CancelToken::new(),
        }
    }
}

/// Boxed stream of provider events. The sequence is
/// `Start (Text|Thinking|ToolCall)* Usage* Done`, or a terminal `Error`.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// A model provider. The wire protocol behind `stream` is opaque to the
/// core; one HTTP connection per stream.
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    fn stream(&self, model: &str, context: &Context, options: &StreamOptions) -> EventStream;
}
