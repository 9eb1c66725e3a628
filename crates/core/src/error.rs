//! Error types for the chatweave domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; [`Error`] aggregates them.

use thiserror::Error;

/// The top-level error type for all chatweave operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Prompt packing ---
    #[error("Packing error: {0}")]
    Pack(#[from] PackError),

    // --- Backend transport ---
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    // --- Tokenizer ---
    #[error("Tokenizer error: {0}")]
    Tokenizer(#[from] TokenizerError),

    // --- Generation session ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Swipe bookkeeping ---
    #[error("Swipe error: {0}")]
    Swipe(#[from] SwipeError),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures of the prompt budget packer. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PackError {
    /// Content that may not be evicted does not fit the ceiling.
    #[error("Segment '{segment}' overflows the context: {required} tokens required, ceiling is {ceiling}")]
    Overflow {
        segment: String,
        required: usize,
        ceiling: usize,
    },

    /// The configured ceiling leaves no room at all.
    #[error("Invalid token ceiling: {0}")]
    InvalidCeiling(String),
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by backend, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Malformed chunk: {0}")]
    MalformedChunk(String),

    #[error("Transport not configured: {0}")]
    NotConfigured(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Cancelled before the stream opened")]
    Cancelled,
}

#[derive(Debug, Clone, Error)]
pub enum TokenizerError {
    #[error("Tokenizer unavailable: {0}")]
    Unavailable(String),
}

/// Misuse of the generation session API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("A generation is already in progress for this conversation")]
    Busy,

    #[error("Nothing to {0}: the chat history is empty")]
    EmptyHistory(&'static str),

    #[error("Cannot {action} a {role} message")]
    WrongTarget { action: &'static str, role: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SwipeError {
    #[error("Swipe index {index} out of range ({len} swipes)")]
    OutOfRange { index: usize, len: usize },

    #[error("Cannot delete the only remaining swipe")]
    LastSwipe,

    #[error("Message index {0} out of range")]
    NoSuchMessage(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_error_names_segment() {
        let err = Error::Pack(PackError::Overflow {
            segment: "story".into(),
            required: 900,
            ceiling: 512,
        });
        let msg = err.to_string();
        assert!(msg.contains("story"));
        assert!(msg.contains("900"));
        assert!(msg.contains("512"));
    }

    #[test]
    fn transport_error_displays_correctly() {
        let err = Error::Transport(TransportError::ApiError {
            status_code: 502,
            message: "bad gateway".into(),
        });
        assert!(err.to_string().contains("502"));
        assert!(err.to_string().contains("bad gateway"));
    }

    #[test]
    fn session_error_wrong_target() {
        let err = SessionError::WrongTarget {
            action: "continue",
            role: "user".into(),
        };
        assert_eq!(err.to_string(), "Cannot continue a user message");
    }
}
