//! Shared framed-session runtime
//!
//! Both speech-to-speech translators run the same machinery: a split
//! WebSocket whose write half sits behind an async mutex (frame writes
//! are serialised), a per-session state block under a sync mutex
//! (closed flag, sticky error latch, callback slots, transcript-delta
//! accumulator), an internal cancellation token rooted fresh so the
//! caller's connect token cannot tear the session down, and a reader
//! task that owns the output channel senders — dropping them on exit is
//! what closes the public channels, exactly once.

use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SpeechError;
use crate::s2s::{ErrorHandler, ToolCallHandler};
use crate::types::TranscriptEntry;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSink = SplitSink<WsStream, Message>;
pub(crate) type WsSource = SplitStream<WsStream>;

/// Ping cadence for providers that need keepalive.
const KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(20);

/// How long a single ping write may take before it is abandoned.
const KEEPALIVE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Per-session shared state. Everything here is touched from both the
/// reader task and arbitrary caller tasks, so it lives under one mutex.
struct SessionState {
    closed: bool,
    error: Option<SpeechError>,
    on_tool_call: Option<ToolCallHandler>,
    on_error: Option<ErrorHandler>,
    transcript_delta: String,
}

/// The runtime core shared by every vendor session.
pub(crate) struct SessionCore {
    provider: &'static str,
    writer: AsyncMutex<WsSink>,
    cancel: CancellationToken,
    done_tx: watch::Sender<bool>,
    state: std::sync::Mutex<SessionState>,
}

impl SessionCore {
    /// Wrap the write half. The returned watch receiver fires when the
    /// reader exits (or the session closes) and is what stops the
    /// keepalive task.
    pub(crate) fn new(provider: &'static str, sink: WsSink) -> (Arc<Self>, watch::Receiver<bool>) {
        let (done_tx, done_rx) = watch::channel(false);
        let core = Arc::new(Self {
            provider,
            writer: AsyncMutex::new(sink),
            cancel: CancellationToken::new(),
            done_tx,
            state: std::sync::Mutex::new(SessionState {
                closed: false,
                error: None,
                on_tool_call: None,
                on_error: None,
                transcript_delta: String::new(),
            }),
        });
        (core, done_rx)
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Serialise a frame and write it as one framed text message. The
    /// single writer mutex keeps concurrent senders from interleaving
    /// frames; the session token aborts a write that would outlive the
    /// session.
    pub(crate) async fn send_json<T: Serialize>(&self, frame: &T) -> Result<(), SpeechError> {
        self.ensure_open()?;
        let json = serde_json::to_string(frame).map_err(|e| SpeechError::Transport {
            provider: self.provider,
            message: format!("encode: {e}"),
        })?;

        tokio::select! {
            _ = self.cancel.cancelled() => Err(SpeechError::SessionClosed {
                provider: self.provider,
            }),
            result = async {
                let mut writer = self.writer.lock().await;
                writer.send(Message::Text(json.into())).await
            } => result.map_err(|e| SpeechError::Transport {
                provider: self.provider,
                message: e.to_string(),
            }),
        }
    }

    /// Writer-side closed check.
    pub(crate) fn ensure_open(&self) -> Result<(), SpeechError> {
        let state = self.state.lock().unwrap();
        if state.closed {
            return Err(SpeechError::SessionClosed {
                provider: self.provider,
            });
        }
        Ok(())
    }

    /// Latch the first transport error. Later errors are dropped.
    pub(crate) fn latch_error(&self, err: SpeechError) {
        let mut state = self.state.lock().unwrap();
        if state.error.is_none() {
            state.error = Some(err);
        }
    }

    pub(crate) fn last_error(&self) -> Option<SpeechError> {
        self.state.lock().unwrap().error.clone()
    }

    pub(crate) fn set_tool_handler(&self, handler: ToolCallHandler) {
        self.state.lock().unwrap().on_tool_call = Some(handler);
    }

    pub(crate) fn set_error_handler(&self, handler: ErrorHandler) {
        self.state.lock().unwrap().on_error = Some(handler);
    }

    /// Clone the installed tool handler. Taken under the mutex so a
    /// concurrent `on_tool_call` swap cannot race the invocation.
    pub(crate) fn tool_handler(&self) -> Option<ToolCallHandler> {
        self.state.lock().unwrap().on_tool_call.clone()
    }

    pub(crate) fn error_handler(&self) -> Option<ErrorHandler> {
        self.state.lock().unwrap().on_error.clone()
    }

    /// Append to the transcript-delta accumulator.
    pub(crate) fn append_transcript_delta(&self, delta: &str) {
        self.state.lock().unwrap().transcript_delta.push_str(delta);
    }

    /// Swap the accumulated transcript out.
    pub(crate) fn take_transcript_delta(&self) -> String {
        std::mem::take(&mut self.state.lock().unwrap().transcript_delta)
    }

    /// Reader-exit signal; lets the keepalive task stop even when the
    /// session token was never cancelled (transport death).
    pub(crate) fn mark_done(&self) {
        let _ = self.done_tx.send(true);
    }

    /// Idempotent teardown: flips the closed flag, cancels the session
    /// token (unblocking reader and keepalive) and sends a best-effort
    /// normal-closure frame. The public channels are not touched here;
    /// the reader closes them on its way out.
    pub(crate) async fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        info!(provider = self.provider, "closing session");
        self.cancel.cancel();
        let _ = self.done_tx.send(true);

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })))
            .await
        {
            debug!(provider = self.provider, error = %e, "close frame not delivered");
        }
    }
}

/// The output channels a session hands to its consumer, each taken at
/// most once.
pub(crate) struct SessionChannels {
    audio: std::sync::Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    transcripts: std::sync::Mutex<Option<mpsc::Receiver<TranscriptEntry>>>,
}

impl SessionChannels {
    pub(crate) fn new(
        audio: mpsc::Receiver<Vec<u8>>,
        transcripts: mpsc::Receiver<TranscriptEntry>,
    ) -> Self {
        Self {
            audio: std::sync::Mutex::new(Some(audio)),
            transcripts: std::sync::Mutex::new(Some(transcripts)),
        }
    }

    pub(crate) fn take_audio(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.audio.lock().unwrap().take()
    }

    pub(crate) fn take_transcripts(&self) -> Option<mpsc::Receiver<TranscriptEntry>> {
        self.transcripts.lock().unwrap().take()
    }
}

/// Dial the endpoint, honouring the caller's token. Nothing is spawned
/// here, so a cancelled token fails the connect with no background work
/// left behind.
pub(crate) async fn dial(
    provider: &'static str,
    request: tokio_tungstenite::tungstenite::handshake::client::Request,
    cancel: &CancellationToken,
) -> Result<WsStream, SpeechError> {
    if cancel.is_cancelled() {
        return Err(SpeechError::Connect {
            provider,
            message: "cancelled before dialing".into(),
        });
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(SpeechError::Connect {
            provider,
            message: "cancelled while dialing".into(),
        }),
        result = connect_async(request) => result
            .map(|(ws, _response)| ws)
            .map_err(|e| SpeechError::Connect {
                provider,
                message: e.to_string(),
            }),
    }
}

/// Build a WebSocket request from a URL.
pub(crate) fn client_request(
    provider: &'static str,
    url: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, SpeechError> {
    url.into_client_request().map_err(|e| SpeechError::Connect {
        provider,
        message: e.to_string(),
    })
}

/// Send the initial configuration frame on the still-unsplit stream.
/// On failure the transport is closed before the error is returned.
pub(crate) async fn send_initial_frame<T: Serialize>(
    provider: &'static str,
    ws: &mut WsStream,
    frame: &T,
    cancel: &CancellationToken,
) -> Result<(), SpeechError> {
    let json = serde_json::to_string(frame).map_err(|e| SpeechError::Connect {
        provider,
        message: format!("encode: {e}"),
    })?;

    let result = tokio::select! {
        _ = cancel.cancelled() => Err(SpeechError::Connect {
            provider,
            message: "cancelled during setup".into(),
        }),
        sent = ws.send(Message::Text(json.into())) => sent.map_err(|e| SpeechError::Connect {
            provider,
            message: e.to_string(),
        }),
    };

    if result.is_err() {
        let _ = ws.close(None).await;
    }
    result
}

/// Pull the next framed text message. Pings, pongs and binary frames
/// are skipped. Returns `None` when the session should end: token
/// cancelled (clean), server closed (clean), or a transport error,
/// which is latched first.
pub(crate) async fn next_text_frame(core: &SessionCore, reader: &mut WsSource) -> Option<String> {
    loop {
        let msg = tokio::select! {
            _ = core.cancel.cancelled() => return None,
            msg = reader.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => return Some(text.to_string()),
            Some(Ok(Message::Close(frame))) => {
                debug!(provider = core.provider, frame = ?frame, "server closed session");
                return None;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                if core.cancel.is_cancelled() {
                    return None;
                }
                warn!(provider = core.provider, error = %e, "transport error");
                core.latch_error(SpeechError::Transport {
                    provider: core.provider,
                    message: e.to_string(),
                });
                return None;
            }
            None => {
                debug!(provider = core.provider, "transport ended");
                return None;
            }
        }
    }
}

/// Bounded channel send raced against the session token: never blocks
/// past cancellation, drops the item instead.
pub(crate) async fn send_or_cancel<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

/// Keepalive task: ping every 20 s with a 5 s budget; failures are
/// logged and ignored. Stops on the session token or the reader-done
/// signal.
pub(crate) fn spawn_keepalive(core: Arc<SessionCore>, mut done: watch::Receiver<bool>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = core.cancel.cancelled() => return,
                _ = done.changed() => return,
                _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => {
                    let ping = async {
                        let mut writer = core.writer.lock().await;
                        writer.send(Message::Ping(Vec::new().into())).await
                    };
                    match tokio::time::timeout(KEEPALIVE_TIMEOUT, ping).await {
                        Ok(Ok(())) => debug!(provider = core.provider, "keepalive ping"),
                        Ok(Err(e)) => debug!(provider = core.provider, error = %e, "ping failed"),
                        Err(_) => debug!(provider = core.provider, "ping timed out"),
                    }
                }
            }
        }
    });
}
