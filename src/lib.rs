//! Voicelink - Real-Time Speech Provider Layer
//!
//! A uniform abstraction over the speech services of a conversational
//! agent:
//! - Gemini Live style speech-to-speech (nested JSON envelopes, fixed
//!   capabilities at setup)
//! - OpenAI Realtime style speech-to-speech (flat typed events,
//!   mid-session reconfiguration, cancellation)
//! - Coqui-style local TTS behind a streaming adapter (sentence
//!   segmentation, bounded concurrent dispatch, ordered PCM output)
//!
//! CLI wiring, configuration files, credential storage and audio
//! playback live with the caller; this crate is the protocol layer.
//!
//! # Example
//!
//! ```ignore
//! use tokio_util::sync::CancellationToken;
//! use voicelink::{GeminiLive, S2sProvider, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let provider = GeminiLive::new(std::env::var("GEMINI_API_KEY")?);
//!     let session = provider
//!         .connect(&CancellationToken::new(), SessionConfig::default())
//!         .await?;
//!     let mut audio = session.take_audio().expect("audio stream");
//!     while let Some(chunk) = audio.recv().await {
//!         // feed the playback path
//!         let _ = chunk;
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod s2s;
pub mod tts;
pub mod types;

// Re-export the surface most callers need
pub use error::SpeechError;
pub use s2s::gemini::{GeminiLive, GeminiSession};
pub use s2s::openai::{OpenAiRealtime, OpenAiSession};
pub use s2s::{ErrorHandler, S2sProvider, S2sSession, ToolCallHandler};
pub use tts::{ApiMode, CoquiTts};
pub use types::{
    ContextItem, Role, S2sCapabilities, SessionConfig, ToolDefinition, TranscriptEntry,
    VoiceProfile,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Truncate a string for logging without splitting a UTF-8 char.
pub(crate) fn truncate_safe(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
