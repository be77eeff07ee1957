//! OpenAI Realtime speech-to-speech translator
//!
//! Flat typed events over one persistent WebSocket. Unlike Gemini the
//! session is reconfigurable: tools and instructions can be replaced
//! mid-session with another `session.update`, and an in-flight response
//! can be cancelled. Audio is `pcm16` in both directions.
//!
//! Model transcripts arrive as deltas and are assembled in the
//! per-session accumulator until the matching `done` event.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::SpeechError;
use crate::s2s::session::{self, SessionChannels, SessionCore, WsSource};
use crate::s2s::{
    ErrorHandler, S2sProvider, S2sSession, ToolCallHandler, AUDIO_CHANNEL_CAPACITY,
    TRANSCRIPT_CHANNEL_CAPACITY,
};
use crate::types::{
    ContextItem, Role, S2sCapabilities, SessionConfig, ToolDefinition, TranscriptEntry,
    VoiceProfile,
};

const PROVIDER: &str = "openai";

const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview";
const DEFAULT_BASE_URL: &str = "wss://api.openai.com/v1/realtime";

/// Audio format advertised in every `session.update`.
const AUDIO_FORMAT: &str = "pcm16";

/// OpenAI Realtime provider.
pub struct OpenAiRealtime {
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiRealtime {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Model name placed in the connection URL.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Override the WebSocket base URL (tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}?model={}", self.base_url, self.model)
    }

    fn initial_update(config: &SessionConfig) -> SessionUpdateFrame {
        SessionUpdateFrame {
            kind: "session.update",
            session: SessionPayload {
                input_audio_format: AUDIO_FORMAT,
                output_audio_format: AUDIO_FORMAT,
                voice: config.voice.as_ref().map(|voice| voice.id.clone()),
                instructions: config.instructions.clone(),
                tools: if config.tools.is_empty() {
                    None
                } else {
                    Some(config.tools.iter().map(RealtimeTool::from).collect())
                },
            },
        }
    }

    /// Open a session. See [`S2sProvider::connect`] for the contract.
    pub async fn connect(
        &self,
        cancel: &CancellationToken,
        config: SessionConfig,
    ) -> Result<OpenAiSession, SpeechError> {
        let mut request = session::client_request(PROVIDER, &self.endpoint())?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.api_key)).map_err(|_| {
            SpeechError::Connect {
                provider: PROVIDER,
                message: "api key is not a valid header value".into(),
            }
        })?;
        request.headers_mut().insert(AUTHORIZATION, auth);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let mut ws = session::dial(PROVIDER, request, cancel).await?;
        session::send_initial_frame(PROVIDER, &mut ws, &Self::initial_update(&config), cancel)
            .await?;

        info!(
            model = %self.model,
            voice = config.voice.as_ref().map(|v| v.id.as_str()).unwrap_or(""),
            tools = config.tools.len(),
            "openai session established"
        );

        let (sink, source) = ws.split();
        let (core, _done_rx) = SessionCore::new(PROVIDER, sink);
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (transcript_tx, transcript_rx) = mpsc::channel(TRANSCRIPT_CHANNEL_CAPACITY);

        tokio::spawn(read_loop(core.clone(), source, audio_tx, transcript_tx));

        Ok(OpenAiSession {
            core,
            channels: SessionChannels::new(audio_rx, transcript_rx),
        })
    }
}

#[async_trait]
impl S2sProvider for OpenAiRealtime {
    fn capabilities(&self) -> S2sCapabilities {
        S2sCapabilities {
            context_window_tokens: 128_000,
            max_session_ms: 1_800_000,
            supports_resumption: false,
            voices: [
                "alloy", "ash", "ballad", "coral", "echo", "sage", "shimmer", "verse",
            ]
            .iter()
            .map(|name| VoiceProfile::new(*name, *name, PROVIDER))
            .collect(),
        }
    }

    async fn connect(
        &self,
        cancel: &CancellationToken,
        config: SessionConfig,
    ) -> Result<Box<dyn S2sSession>, SpeechError> {
        Ok(Box::new(OpenAiRealtime::connect(self, cancel, config).await?))
    }
}

/// A live OpenAI Realtime session.
pub struct OpenAiSession {
    core: Arc<SessionCore>,
    channels: SessionChannels,
}

impl std::fmt::Debug for OpenAiSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiSession").finish_non_exhaustive()
    }
}

#[async_trait]
impl S2sSession for OpenAiSession {
    async fn send_audio(&self, pcm: &[u8]) -> Result<(), SpeechError> {
        let frame = AudioAppendFrame {
            kind: "input_audio_buffer.append",
            audio: BASE64.encode(pcm),
        };
        self.core.send_json(&frame).await
    }

    fn take_audio(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.channels.take_audio()
    }

    fn take_transcripts(&self) -> Option<mpsc::Receiver<TranscriptEntry>> {
        self.channels.take_transcripts()
    }

    fn on_tool_call(&self, handler: ToolCallHandler) {
        self.core.set_tool_handler(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.core.set_error_handler(handler);
    }

    async fn set_tools(&self, tools: Vec<ToolDefinition>) -> Result<(), SpeechError> {
        let frame = SessionUpdateFrame {
            kind: "session.update",
            session: SessionPayload {
                input_audio_format: AUDIO_FORMAT,
                output_audio_format: AUDIO_FORMAT,
                voice: None,
                instructions: None,
                tools: Some(tools.iter().map(RealtimeTool::from).collect()),
            },
        };
        self.core.send_json(&frame).await
    }

    async fn update_instructions(&self, instructions: &str) -> Result<(), SpeechError> {
        let frame = SessionUpdateFrame {
            kind: "session.update",
            session: SessionPayload {
                input_audio_format: AUDIO_FORMAT,
                output_audio_format: AUDIO_FORMAT,
                voice: None,
                instructions: Some(instructions.to_string()),
                tools: None,
            },
        };
        self.core.send_json(&frame).await
    }

    async fn inject_text_context(&self, items: Vec<ContextItem>) -> Result<(), SpeechError> {
        for item in items {
            let role = normalize_role(item.role);
            let frame = ItemCreateFrame {
                kind: "conversation.item.create",
                item: MessageItem {
                    kind: "message",
                    role,
                    content: vec![ContentPart {
                        kind: content_type(role),
                        text: item.content,
                    }],
                },
            };
            self.core.send_json(&frame).await?;
        }
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), SpeechError> {
        self.core.send_json(&BareFrame { kind: "response.cancel" }).await
    }

    fn last_error(&self) -> Option<SpeechError> {
        self.core.last_error()
    }

    async fn close(&self) {
        self.core.close().await;
    }
}

/// OpenAI keeps `assistant` and `system`; everything else becomes
/// `user`.
fn normalize_role(role: Role) -> &'static str {
    match role {
        Role::Assistant => "assistant",
        Role::System => "system",
        Role::User | Role::Model => "user",
    }
}

/// Assistant turns carry `text` parts; user and system turns carry
/// `input_text`.
fn content_type(role: &'static str) -> &'static str {
    if role == "assistant" {
        "text"
    } else {
        "input_text"
    }
}

/// Reader task: dispatch flat events. Owns the output channel senders;
/// dropping them on exit closes the public channels.
async fn read_loop(
    core: Arc<SessionCore>,
    mut source: WsSource,
    audio_tx: mpsc::Sender<Vec<u8>>,
    transcript_tx: mpsc::Sender<TranscriptEntry>,
) {
    while let Some(text) = session::next_text_frame(&core, &mut source).await {
        let event: RealtimeEvent = match serde_json::from_str(&text) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "skipping undecodable event");
                continue;
            }
        };
        dispatch(&core, event, &audio_tx, &transcript_tx).await;
    }
    core.mark_done();
}

async fn dispatch(
    core: &SessionCore,
    event: RealtimeEvent,
    audio_tx: &mpsc::Sender<Vec<u8>>,
    transcript_tx: &mpsc::Sender<TranscriptEntry>,
) {
    let cancel = core.cancel_token();
    match event.event_type.as_str() {
        "response.audio.delta" => {
            let Some(delta) = event.delta else { return };
            match BASE64.decode(delta.as_bytes()) {
                Ok(pcm) if !pcm.is_empty() => {
                    session::send_or_cancel(audio_tx, pcm, cancel).await;
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "skipping invalid audio delta"),
            }
        }
        "response.audio_transcript.delta" => {
            if let Some(delta) = event.delta {
                core.append_transcript_delta(&delta);
            }
        }
        "response.audio_transcript.done" => {
            let text = core.take_transcript_delta();
            if !text.is_empty() {
                let entry = TranscriptEntry::npc("assistant", "Assistant", PROVIDER, text);
                session::send_or_cancel(transcript_tx, entry, cancel).await;
            }
        }
        "conversation.item.input_audio_transcription.completed" => {
            if let Some(transcript) = event.transcript {
                if !transcript.is_empty() {
                    session::send_or_cancel(transcript_tx, TranscriptEntry::user(transcript), cancel)
                        .await;
                }
            }
        }
        "response.function_call_arguments.done" => {
            handle_tool_call(core, event).await;
        }
        "error" => {
            if let Some(err) = event.error {
                if let Some(handler) = core.error_handler() {
                    handler(SpeechError::Protocol {
                        provider: PROVIDER,
                        message: err.message,
                    });
                }
            }
        }
        _ => {}
    }
}

async fn handle_tool_call(core: &SessionCore, event: RealtimeEvent) {
    let Some(handler) = core.tool_handler() else {
        debug!("function call received with no handler installed");
        return;
    };
    let name = event.name.unwrap_or_default();
    let arguments = event.arguments.unwrap_or_default();

    let output = match handler(&name, &arguments) {
        Ok(result) => result,
        Err(message) => serde_json::json!({ "error": message }).to_string(),
    };

    let frame = FunctionOutputFrame {
        kind: "conversation.item.create",
        item: FunctionOutputItem {
            kind: "function_call_output",
            call_id: event.call_id.unwrap_or_default(),
            output,
        },
    };
    if let Err(e) = core.send_json(&frame).await {
        debug!(error = %e, "function output not delivered");
        return;
    }
    if let Err(e) = core.send_json(&BareFrame { kind: "response.create" }).await {
        debug!(error = %e, "response.create not delivered");
    }
}

// ─── Outbound events ─────────────────────────────────────────

#[derive(Serialize)]
struct SessionUpdateFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    session: SessionPayload,
}

#[derive(Serialize)]
struct SessionPayload {
    input_audio_format: &'static str,
    output_audio_format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<RealtimeTool>>,
}

#[derive(Serialize)]
struct RealtimeTool {
    #[serde(rename = "type")]
    kind: &'static str,
    name: String,
    description: String,
    parameters: serde_json::Map<String, serde_json::Value>,
}

impl From<&ToolDefinition> for RealtimeTool {
    fn from(tool: &ToolDefinition) -> Self {
        Self {
            kind: "function",
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.parameters.clone(),
        }
    }
}

#[derive(Serialize)]
struct AudioAppendFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    audio: String,
}

#[derive(Serialize)]
struct ItemCreateFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    item: MessageItem,
}

#[derive(Serialize)]
struct MessageItem {
    #[serde(rename = "type")]
    kind: &'static str,
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Serialize)]
struct ContentPart {
    #[serde(rename = "type")]
    kind: &'static str,
    text: String,
}

#[derive(Serialize)]
struct FunctionOutputFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    item: FunctionOutputItem,
}

#[derive(Serialize)]
struct FunctionOutputItem {
    #[serde(rename = "type")]
    kind: &'static str,
    call_id: String,
    output: String,
}

#[derive(Serialize)]
struct BareFrame {
    #[serde(rename = "type")]
    kind: &'static str,
}

// ─── Inbound events ──────────────────────────────────────────

/// Flat event shape: servers add fields freely, so everything beyond
/// the type tag is optional.
#[derive(Debug, Deserialize)]
struct RealtimeEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    transcript: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    error: Option<RealtimeError>,
}

#[derive(Debug, Deserialize)]
struct RealtimeError {
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_update_shape() {
        let config = SessionConfig::default()
            .with_instructions("Be brief.")
            .with_voice(VoiceProfile::new("alloy", "Alloy", "openai"))
            .with_tools(vec![ToolDefinition::new("cast_spell", "Casts a spell")]);

        let frame = serde_json::to_value(OpenAiRealtime::initial_update(&config)).unwrap();
        assert_eq!(
            frame,
            serde_json::json!({
                "type": "session.update",
                "session": {
                    "input_audio_format": "pcm16",
                    "output_audio_format": "pcm16",
                    "voice": "alloy",
                    "instructions": "Be brief.",
                    "tools": [{
                        "type": "function",
                        "name": "cast_spell",
                        "description": "Casts a spell",
                        "parameters": {}
                    }]
                }
            })
        );
    }

    #[test]
    fn test_initial_update_always_carries_audio_formats() {
        let frame =
            serde_json::to_value(OpenAiRealtime::initial_update(&SessionConfig::default())).unwrap();
        assert_eq!(
            frame,
            serde_json::json!({
                "type": "session.update",
                "session": {
                    "input_audio_format": "pcm16",
                    "output_audio_format": "pcm16"
                }
            })
        );
    }

    #[test]
    fn test_endpoint_url() {
        let provider = OpenAiRealtime::new("sk-test").with_base_url("ws://127.0.0.1:9000");
        assert_eq!(provider.endpoint(), "ws://127.0.0.1:9000?model=gpt-4o-realtime-preview");
    }

    #[test]
    fn test_role_and_content_type_mapping() {
        assert_eq!(normalize_role(Role::Assistant), "assistant");
        assert_eq!(normalize_role(Role::System), "system");
        assert_eq!(normalize_role(Role::User), "user");
        assert_eq!(normalize_role(Role::Model), "user");

        assert_eq!(content_type("assistant"), "text");
        assert_eq!(content_type("user"), "input_text");
        assert_eq!(content_type("system"), "input_text");
    }

    #[test]
    fn test_event_decode_tolerates_extra_fields() {
        let event: RealtimeEvent = serde_json::from_str(
            r#"{"type":"response.audio.delta","delta":"AAAA","response_id":"r1","item_id":"i1"}"#,
        )
        .unwrap();
        assert_eq!(event.event_type, "response.audio.delta");
        assert_eq!(event.delta.as_deref(), Some("AAAA"));
    }

    #[test]
    fn test_capabilities_are_nonempty() {
        let caps = S2sProvider::capabilities(&OpenAiRealtime::new("sk"));
        assert!(caps.context_window_tokens > 0);
        assert!(!caps.voices.is_empty());
    }
}
