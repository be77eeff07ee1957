//! Gemini Live speech-to-speech translator
//!
//! Speaks the BidiGenerateContent protocol: one persistent WebSocket
//! carrying nested JSON envelopes. Capabilities are fixed at session
//! setup — the model, voice, instructions and tools all travel in the
//! single `setup` frame and cannot change afterwards, so the
//! mid-session mutators report unsupported.
//!
//! Audio out is `audio/pcm;rate=16000`, audio in arrives as
//! `audio/pcm;rate=24000`, both mono 16-bit LE base64.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
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

const PROVIDER: &str = "gemini";

const DEFAULT_MODEL: &str = "gemini-2.0-flash-exp";
const DEFAULT_BASE_URL: &str = "wss://generativelanguage.googleapis.com/ws";
const BIDI_SERVICE: &str = "google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// MIME type for outbound microphone audio.
const INPUT_MIME: &str = "audio/pcm;rate=16000";

/// Gemini Live provider.
pub struct GeminiLive {
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiLive {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Model name placed in the setup frame.
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
        format!("{}/{}?key={}", self.base_url, BIDI_SERVICE, self.api_key)
    }

    fn setup_frame(&self, config: &SessionConfig) -> SetupFrame {
        SetupFrame {
            setup: Setup {
                model: format!("models/{}", self.model),
                generation_config: GenerationConfig {
                    response_modalities: ["audio"],
                    speech_config: config.voice.as_ref().map(|voice| SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: voice.id.clone(),
                            },
                        },
                    }),
                },
                system_instruction: config.instructions.as_ref().map(|text| Instruction {
                    parts: vec![TextPart { text: text.clone() }],
                }),
                tools: if config.tools.is_empty() {
                    None
                } else {
                    Some(vec![ToolGroup {
                        function_declarations: config.tools.clone(),
                    }])
                },
            },
        }
    }

    /// Open a session. See [`S2sProvider::connect`] for the contract.
    pub async fn connect(
        &self,
        cancel: &CancellationToken,
        config: SessionConfig,
    ) -> Result<GeminiSession, SpeechError> {
        let request = session::client_request(PROVIDER, &self.endpoint())?;
        let mut ws = session::dial(PROVIDER, request, cancel).await?;

        let setup = self.setup_frame(&config);
        session::send_initial_frame(PROVIDER, &mut ws, &setup, cancel).await?;

        info!(
            model = %self.model,
            voice = config.voice.as_ref().map(|v| v.id.as_str()).unwrap_or(""),
            tools = config.tools.len(),
            "gemini session established"
        );

        let (sink, source) = ws.split();
        let (core, done_rx) = SessionCore::new(PROVIDER, sink);
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (transcript_tx, transcript_rx) = mpsc::channel(TRANSCRIPT_CHANNEL_CAPACITY);

        tokio::spawn(read_loop(core.clone(), source, audio_tx, transcript_tx));
        session::spawn_keepalive(core.clone(), done_rx);

        Ok(GeminiSession {
            core,
            channels: SessionChannels::new(audio_rx, transcript_rx),
        })
    }
}

#[async_trait]
impl S2sProvider for GeminiLive {
    fn capabilities(&self) -> S2sCapabilities {
        S2sCapabilities {
            context_window_tokens: 32_768,
            max_session_ms: 900_000,
            supports_resumption: false,
            voices: ["Aoede", "Charon", "Fenrir", "Kore", "Puck"]
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
        Ok(Box::new(GeminiLive::connect(self, cancel, config).await?))
    }
}

/// A live Gemini session.
pub struct GeminiSession {
    core: Arc<SessionCore>,
    channels: SessionChannels,
}

impl std::fmt::Debug for GeminiSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiSession").finish_non_exhaustive()
    }
}

#[async_trait]
impl S2sSession for GeminiSession {
    async fn send_audio(&self, pcm: &[u8]) -> Result<(), SpeechError> {
        let frame = RealtimeInputFrame {
            realtime_input: RealtimeInput {
                media_chunks: vec![MediaChunk {
                    mime_type: INPUT_MIME,
                    data: BASE64.encode(pcm),
                }],
            },
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

    async fn set_tools(&self, _tools: Vec<ToolDefinition>) -> Result<(), SpeechError> {
        Err(SpeechError::Unsupported {
            provider: PROVIDER,
            operation: "mid-session tool updates are not supported",
        })
    }

    async fn update_instructions(&self, _instructions: &str) -> Result<(), SpeechError> {
        Err(SpeechError::Unsupported {
            provider: PROVIDER,
            operation: "mid-session instruction updates are not supported",
        })
    }

    async fn inject_text_context(&self, items: Vec<ContextItem>) -> Result<(), SpeechError> {
        if items.is_empty() {
            return Ok(());
        }
        let frame = ClientContentFrame {
            client_content: ClientContent {
                turns: items
                    .iter()
                    .map(|item| Turn {
                        role: normalize_role(item.role),
                        parts: vec![TextPart {
                            text: item.content.clone(),
                        }],
                    })
                    .collect(),
                turn_complete: true,
            },
        };
        self.core.send_json(&frame).await
    }

    async fn interrupt(&self) -> Result<(), SpeechError> {
        Err(SpeechError::Unsupported {
            provider: PROVIDER,
            operation: "interrupt is not supported",
        })
    }

    fn last_error(&self) -> Option<SpeechError> {
        self.core.last_error()
    }

    async fn close(&self) {
        self.core.close().await;
    }
}

/// Gemini accepts `user` and `model` turn roles only.
fn normalize_role(role: Role) -> &'static str {
    match role {
        Role::Assistant | Role::Model => "model",
        Role::User | Role::System => "user",
    }
}

/// Reader task: decode envelopes and fan out. Owns the output channel
/// senders; dropping them on exit closes the public channels.
async fn read_loop(
    core: Arc<SessionCore>,
    mut source: WsSource,
    audio_tx: mpsc::Sender<Vec<u8>>,
    transcript_tx: mpsc::Sender<TranscriptEntry>,
) {
    while let Some(text) = session::next_text_frame(&core, &mut source).await {
        let envelope: ServerEnvelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Servers may add fields or whole envelope kinds.
                debug!(error = %e, "skipping undecodable frame");
                continue;
            }
        };
        dispatch(&core, envelope, &audio_tx, &transcript_tx).await;
    }
    core.mark_done();
}

async fn dispatch(
    core: &SessionCore,
    envelope: ServerEnvelope,
    audio_tx: &mpsc::Sender<Vec<u8>>,
    transcript_tx: &mpsc::Sender<TranscriptEntry>,
) {
    if envelope.setup_complete.is_some() {
        debug!("setup acknowledged");
        return;
    }

    if let Some(content) = envelope.server_content {
        let cancel = core.cancel_token();
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(inline) = part.inline_data {
                    match BASE64.decode(inline.data.as_bytes()) {
                        Ok(pcm) if !pcm.is_empty() => {
                            session::send_or_cancel(audio_tx, pcm, cancel).await;
                        }
                        Ok(_) => {}
                        Err(e) => debug!(error = %e, "skipping invalid audio payload"),
                    }
                }
                if let Some(text) = part.text {
                    if !text.is_empty() {
                        session::send_or_cancel(transcript_tx, model_entry(text), cancel).await;
                    }
                }
            }
        }
        if let Some(transcription) = content.input_transcription {
            if !transcription.text.is_empty() {
                session::send_or_cancel(transcript_tx, TranscriptEntry::user(transcription.text), cancel)
                    .await;
            }
        }
        if let Some(transcription) = content.output_transcription {
            if !transcription.text.is_empty() {
                session::send_or_cancel(transcript_tx, model_entry(transcription.text), cancel)
                    .await;
            }
        }
        return;
    }

    if let Some(tool_call) = envelope.tool_call {
        handle_tool_call(core, tool_call).await;
        return;
    }

    if envelope.tool_call_cancellation.is_some() {
        debug!("tool call cancellation acknowledged");
        return;
    }

    if let Some(err) = envelope.error {
        if let Some(handler) = core.error_handler() {
            handler(SpeechError::Protocol {
                provider: PROVIDER,
                message: err.message,
            });
        }
    }
}

async fn handle_tool_call(core: &SessionCore, tool_call: ToolCallPayload) {
    let Some(handler) = core.tool_handler() else {
        debug!("tool call received with no handler installed");
        return;
    };

    for call in tool_call.function_calls {
        let args = serde_json::to_string(&call.args).unwrap_or_else(|_| "{}".to_string());
        let response = match handler(&call.name, &args) {
            // A structured result passes through; plain text is wrapped.
            Ok(result) => serde_json::from_str::<serde_json::Value>(&result)
                .unwrap_or_else(|_| serde_json::json!({ "output": result })),
            Err(message) => serde_json::json!({ "error": message }),
        };

        let frame = ToolResponseFrame {
            tool_response: ToolResponsePayload {
                function_responses: vec![FunctionResponse {
                    id: call.id,
                    name: call.name,
                    response,
                }],
            },
        };
        if let Err(e) = core.send_json(&frame).await {
            debug!(error = %e, "tool response not delivered");
        }
    }
}

fn model_entry(text: String) -> TranscriptEntry {
    TranscriptEntry::npc("model", "Gemini", PROVIDER, text)
}

// ─── Outbound envelopes ──────────────────────────────────────

#[derive(Serialize)]
struct SetupFrame {
    setup: Setup,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Instruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolGroup>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: [&'static str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    speech_config: Option<SpeechConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Serialize)]
struct Instruction {
    parts: Vec<TextPart>,
}

#[derive(Serialize)]
struct TextPart {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolGroup {
    function_declarations: Vec<ToolDefinition>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputFrame {
    realtime_input: RealtimeInput,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<MediaChunk>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk {
    mime_type: &'static str,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientContentFrame {
    client_content: ClientContent,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientContent {
    turns: Vec<Turn>,
    turn_complete: bool,
}

#[derive(Serialize)]
struct Turn {
    role: &'static str,
    parts: Vec<TextPart>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResponseFrame {
    tool_response: ToolResponsePayload,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResponsePayload {
    function_responses: Vec<FunctionResponse>,
}

#[derive(Serialize)]
struct FunctionResponse {
    id: String,
    name: String,
    response: serde_json::Value,
}

// ─── Inbound envelopes ───────────────────────────────────────

/// At most one field is non-null per message; unknown envelope kinds
/// simply leave every field empty and are ignored.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerEnvelope {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
    #[serde(default)]
    tool_call: Option<ToolCallPayload>,
    #[serde(default)]
    tool_call_cancellation: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<ServerError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    input_transcription: Option<Transcription>,
    #[serde(default)]
    output_transcription: Option<Transcription>,
}

#[derive(Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<ServerPart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerPart {
    #[serde(default)]
    inline_data: Option<InlineData>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    #[allow(dead_code)]
    mime_type: String,
    #[serde(default)]
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallPayload {
    #[serde(default)]
    function_calls: Vec<FunctionCall>,
}

#[derive(Deserialize)]
struct FunctionCall {
    #[serde(default)]
    id: String,
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Deserialize)]
struct Transcription {
    #[serde(default)]
    text: String,
}

/// Only the message is contractual; codes vary by deployment.
#[derive(Deserialize)]
struct ServerError {
    #[serde(default)]
    message: String,
}
