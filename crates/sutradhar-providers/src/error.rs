use std::fmt;

/// Result type for sutradhar-providers operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the provider layer
#[derive(Debug)]
pub enum Error {
    /// Missing or rejected credentials; surfaced to the user, never retried
    Auth(String),

    /// HTTP-level failure with a status code
    Http { status: u16, message: String },

    /// Provider violated the streaming protocol
    Protocol(String),

    /// The call exceeded its deadline
    Timeout,

    /// Provider-side rate limit
    RateLimited,

    /// The caller cancelled the stream
    Cancelled,
}

impl Error {
    /// Only rate limits, timeouts, and 429/5xx responses are retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RateLimited | Error::Timeout => true,
            Error::Http { status, .. } => *status == 429 || *status >= 500,
            Error::Auth(_) | Error::Protocol(_) | Error::Cancelled => false,
        }
    }

    /// Classify a terminal stream error. Providers surface wire failures
    /// as plain text in the `error` event; recognizing rate limits,
    /// timeouts, auth failures, and HTTP statuses here is what lets the
    /// retry policy distinguish transient from permanent faults.
    pub fn from_stream_message(message: &str) -> Error {
        let lowered = message.to_lowercase();
        if lowered.contains("rate limit") || lowered.contains("overloaded") {
            return Error::RateLimited;
        }
        if lowered.contains("timed out") || lowered.contains("timeout") {
            return Error::Timeout;
        }
        match extract_status(&lowered) {
            Some(429) => Error::RateLimited,
            Some(401) | Some(403) => Error::Auth(message.to_string()),
            Some(status) => Error::Http {
                status,
                message: message.to_string(),
            },
            None => Error::Protocol(message.to_string()),
        }
    }
}

/// First HTTP-status-looking number in the text.
fn extract_status(text: &str) -> Option<u16> {
    text.split(|c: char| !c.is_ascii_digit())
        .filter_map(|token| token.parse::<u16>().ok())
        .find(|status| (400..=599).contains(status))
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Auth(msg) => write!(f, "Authentication error: {}", msg),
            Error::Http { status, message } => write!(f, "HTTP {}: {}", status, message),
            Error::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Error::Timeout => write!(f, "Provider call timed out"),
            Error::RateLimited => write!(f, "Provider rate limit reached"),
            Error::Cancelled => write!(f, "Stream cancelled"),
        }
    }
}

impl std::error::Error for Error {}
