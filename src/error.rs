//! Speech provider error types.
//!
//! Errors are values: every message carries its provider prefix
//! (`gemini:`, `openai:`, `coqui:`) so callers can log them without extra
//! context. Variants hold owned strings so the per-session first-error
//! latch can hand out clones.

/// Errors produced by the speech provider layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpeechError {
    /// Dialing or the initial configuration write failed; the transport
    /// has been closed.
    #[error("{provider}: connect failed: {message}")]
    Connect {
        provider: &'static str,
        message: String,
    },

    /// The reader loop observed an I/O error while the session was live.
    #[error("{provider}: transport error: {message}")]
    Transport {
        provider: &'static str,
        message: String,
    },

    /// A write was attempted after `close()`.
    #[error("{provider}: session closed")]
    SessionClosed { provider: &'static str },

    /// The operation does not exist on this provider.
    #[error("{provider}: {operation}")]
    Unsupported {
        provider: &'static str,
        operation: &'static str,
    },

    /// The server reported a protocol-level error. Delivered to the
    /// `on_error` callback when one is installed.
    #[error("{provider}: server error: {message}")]
    Protocol {
        provider: &'static str,
        message: String,
    },

    /// A precondition on the call arguments failed; nothing was sent.
    #[error("{provider}: {message}")]
    InvalidInput {
        provider: &'static str,
        message: String,
    },

    /// The HTTP backend answered with a non-success status.
    #[error("{provider}: http status {status}: {message}")]
    Http {
        provider: &'static str,
        status: u16,
        message: String,
    },

    /// The audio payload was not in the expected shape.
    #[error("{provider}: audio: {message}")]
    Audio {
        provider: &'static str,
        message: String,
    },
}

impl SpeechError {
    /// The provider tag this error originated from.
    pub fn provider(&self) -> &'static str {
        match self {
            SpeechError::Connect { provider, .. }
            | SpeechError::Transport { provider, .. }
            | SpeechError::SessionClosed { provider }
            | SpeechError::Unsupported { provider, .. }
            | SpeechError::Protocol { provider, .. }
            | SpeechError::InvalidInput { provider, .. }
            | SpeechError::Http { provider, .. }
            | SpeechError::Audio { provider, .. } => provider,
        }
    }
}
