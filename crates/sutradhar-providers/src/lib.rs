mod cancel;
mod client;
mod error;
mod limiter;
mod retry;
mod scripted;

pub use cancel::CancelToken;
pub use client::{Context, EventStream, ModelProvider, StreamOptions, ToolDefinition};
pub use error::{Error, Result};
pub use limiter::{RateLimiter, RateLimits, RatePermit};
pub use retry::{backoff_delay, with_retries};
pub use scripted::ScriptedProvider;
