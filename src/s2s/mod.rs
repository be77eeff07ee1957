//! Speech-to-speech sessions
//!
//! One uniform contract over the vendor realtime APIs: a provider dials
//! a persistent framed connection, and the resulting session carries
//! audio both ways plus transcripts and tool calls. The two translators
//! ([`gemini`] and [`openai`]) share the same framed-session runtime;
//! only the wire vocabulary differs.

pub mod gemini;
pub mod openai;
mod session;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SpeechError;
use crate::types::{ContextItem, S2sCapabilities, SessionConfig, ToolDefinition, TranscriptEntry};

/// Depth of the audio output channel, in PCM chunks.
pub const AUDIO_CHANNEL_CAPACITY: usize = 64;

/// Depth of the transcript output channel, in entries.
pub const TRANSCRIPT_CHANNEL_CAPACITY: usize = 16;

/// Tool-call callback: `(name, raw JSON arguments)` in, result string or
/// error message out. Invoked on the session's reader task.
pub type ToolCallHandler = Arc<dyn Fn(&str, &str) -> Result<String, String> + Send + Sync>;

/// Error callback for protocol-level server errors.
pub type ErrorHandler = Arc<dyn Fn(SpeechError) + Send + Sync>;

/// A speech-to-speech provider: static capabilities plus the ability to
/// open sessions.
#[async_trait]
pub trait S2sProvider: Send + Sync {
    /// Static capability report. Never changes across a process
    /// lifetime.
    fn capabilities(&self) -> S2sCapabilities;

    /// Dial the provider and send the initial configuration.
    ///
    /// Completes only once the transport is up and the configuration
    /// frame has been enqueued; any failure on that path closes the
    /// transport and surfaces here. A cancelled token fails the call
    /// before any background task is spawned.
    async fn connect(
        &self,
        cancel: &CancellationToken,
        config: SessionConfig,
    ) -> Result<Box<dyn S2sSession>, SpeechError>;
}

/// One live speech-to-speech session.
///
/// All methods may be called concurrently from any task. Writers fail
/// with a session-closed error after [`close`](S2sSession::close);
/// `close` itself is idempotent.
#[async_trait]
pub trait S2sSession: Send + Sync {
    /// Encode one PCM frame and enqueue it to the server.
    async fn send_audio(&self, pcm: &[u8]) -> Result<(), SpeechError>;

    /// Take the audio output channel. Bounded, closed on session end;
    /// yields `None` after the first call.
    fn take_audio(&self) -> Option<mpsc::Receiver<Vec<u8>>>;

    /// Take the transcript output channel. Bounded, closed on session
    /// end; yields `None` after the first call.
    fn take_transcripts(&self) -> Option<mpsc::Receiver<TranscriptEntry>>;

    /// Install or replace the tool-call handler. Safe while a frame is
    /// being dispatched.
    fn on_tool_call(&self, handler: ToolCallHandler);

    /// Install or replace the error handler. Safe while a frame is
    /// being dispatched.
    fn on_error(&self, handler: ErrorHandler);

    /// Replace the advertised tool list mid-session.
    async fn set_tools(&self, tools: Vec<ToolDefinition>) -> Result<(), SpeechError>;

    /// Replace the system instructions mid-session.
    async fn update_instructions(&self, instructions: &str) -> Result<(), SpeechError>;

    /// Inject textual conversation turns.
    async fn inject_text_context(&self, items: Vec<ContextItem>) -> Result<(), SpeechError>;

    /// Cancel the in-flight model response.
    async fn interrupt(&self) -> Result<(), SpeechError>;

    /// First transport error observed by the reader, if any. Sticky.
    fn last_error(&self) -> Option<SpeechError>;

    /// Tear the session down. Idempotent; never fails.
    async fn close(&self);
}
