//! Shared types used across providers
//!
//! The glue surface between the conversational agent and the individual
//! speech providers: voice selection, tool wiring, injected context and
//! the transcript stream all speak in terms of this module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A voice offered by (or configured for) a speech provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoiceProfile {
    /// Provider-specific voice identifier (prebuilt voice name, studio
    /// speaker name, reference-sample id, ...).
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    /// Tag of the provider this voice belongs to (`"gemini"`, `"openai"`,
    /// `"coqui"`).
    pub provider: String,
    /// Optional pitch adjustment (1.0 = neutral).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pitch: Option<f32>,
    /// Optional speed adjustment (1.0 = neutral).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    /// Free-form provider metadata (model name, voice type, ...).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl VoiceProfile {
    /// Create a profile with the three identifying fields set.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider: provider.into(),
            pitch: None,
            speed: None,
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A callable tool advertised to the model at session setup (or, where
/// the provider supports it, mid-session).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Function name the model will call.
    pub name: String,
    /// What the tool does, shown to the model.
    pub description: String,
    /// JSON-schema-shaped parameter object. Opaque to this layer.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

impl ToolDefinition {
    /// Create a tool with no declared parameters.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::Map::new(),
        }
    }

    /// Set the parameter schema.
    pub fn with_parameters(
        mut self,
        parameters: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Speaker role of an injected context item.
///
/// Each provider normalises roles to what its wire protocol accepts; the
/// mapping lives with the provider translators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Model,
}

/// One turn of textual conversation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub role: Role,
    pub content: String,
}

impl ContextItem {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One utterance on the transcript stream.
///
/// Model-produced entries carry an NPC id; user entries do not. The two
/// always go together: `npc_id` is `Some` exactly when [`is_npc`] is
/// true.
///
/// [`is_npc`]: TranscriptEntry::is_npc
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// Stable speaker id (`"user"`, `"model"`, `"assistant"`).
    pub speaker_id: String,
    /// Display name for the speaker.
    pub speaker_name: String,
    /// Transcribed text.
    pub text: String,
    /// NPC identity, present only for model-produced speech.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub npc_id: Option<String>,
    /// When this layer observed the utterance.
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEntry {
    /// Build an entry for model-produced speech.
    pub fn npc(
        speaker_id: impl Into<String>,
        speaker_name: impl Into<String>,
        npc_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            speaker_id: speaker_id.into(),
            speaker_name: speaker_name.into(),
            text: text.into(),
            npc_id: Some(npc_id.into()),
            timestamp: Utc::now(),
        }
    }

    /// Build an entry for user speech.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            speaker_id: "user".to_string(),
            speaker_name: "User".to_string(),
            text: text.into(),
            npc_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Whether this utterance came from the model side of the session.
    pub fn is_npc(&self) -> bool {
        self.npc_id.is_some()
    }
}

/// Session parameters passed at connect time. All fields optional.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// System prompt for the session.
    pub instructions: Option<String>,
    /// Voice to synthesise with.
    pub voice: Option<VoiceProfile>,
    /// Tools available from the first turn.
    pub tools: Vec<ToolDefinition>,
}

impl SessionConfig {
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_voice(mut self, voice: VoiceProfile) -> Self {
        self.voice = Some(voice);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// Static capability report for a speech-to-speech provider.
///
/// Capabilities are fixed per provider build and never change across a
/// process lifetime.
#[derive(Debug, Clone)]
pub struct S2sCapabilities {
    /// Context window in tokens.
    pub context_window_tokens: u32,
    /// Maximum session duration in milliseconds.
    pub max_session_ms: u64,
    /// Whether the provider can resume a previous session.
    pub supports_resumption: bool,
    /// Built-in voices.
    pub voices: Vec<VoiceProfile>,
}
