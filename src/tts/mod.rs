//! Streaming TTS over a Coqui-style synthesis server
//!
//! The server itself is batch: one HTTP call synthesises one piece of
//! text into a WAV response. This module fronts it with a streaming
//! adapter — text fragments go in, sentence-sized HTTP calls fan out
//! with bounded lookahead, and ordered PCM chunks come back — plus the
//! voice catalogue and voice-cloning endpoints.
//!
//! Two API flavours exist in the wild and both are supported:
//! - **standard**: `GET /api/tts`, single- or multi-speaker models.
//! - **xtts**: `POST /tts_to_audio/`, reference-sample voices, cloning.

mod stream;
mod wav;

pub use wav::{parse_wav, resample_linear, WavError, WavInfo};

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::SpeechError;
use crate::types::VoiceProfile;

const PROVIDER: &str = "coqui";

/// Default language sent with every synthesis request.
const DEFAULT_LANGUAGE: &str = "en";

/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Which HTTP surface the server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApiMode {
    /// `GET /api/tts` — classic Coqui server, works without a voice id
    /// for single-speaker models.
    #[default]
    Standard,
    /// `POST /tts_to_audio/` — XTTS streaming server; a voice id is
    /// required.
    Xtts,
}

/// Client for a Coqui-style TTS server.
#[derive(Debug, Clone)]
pub struct CoquiTts {
    base_url: String,
    language: String,
    timeout: Duration,
    mode: ApiMode,
    output_sample_rate: u32,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct DetailsResponse {
    model_name: String,
    #[serde(default)]
    #[allow(dead_code)]
    language: Option<String>,
    #[serde(default)]
    speakers: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct CloneResponse {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

impl CoquiTts {
    /// Create a client for the server at `server_url`.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            base_url: server_url.into().trim_end_matches('/').to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
            timeout: DEFAULT_TIMEOUT,
            mode: ApiMode::default(),
            output_sample_rate: 0,
            client: reqwest::Client::new(),
        }
    }

    /// Language id sent with synthesis requests.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Select the server's API flavour.
    pub fn with_api_mode(mut self, mode: ApiMode) -> Self {
        self.mode = mode;
        self
    }

    /// Resample emitted PCM to this rate (0 disables resampling).
    pub fn with_output_sample_rate(mut self, rate: u32) -> Self {
        self.output_sample_rate = rate;
        self
    }

    /// Whether the server answers at all.
    pub async fn is_available(&self) -> bool {
        self.client
            .get(&self.base_url)
            .timeout(self.timeout)
            .send()
            .await
            .is_ok()
    }

    /// Stream synthesis: text fragments in, ordered PCM chunks out.
    ///
    /// The returned channel yields the per-sentence PCM payloads in
    /// sentence order, split into fixed-size chunks, and closes when the
    /// input closes, the token cancels, or a synthesis fails. An empty
    /// input produces an immediately-closed channel.
    pub fn synthesize_stream(
        &self,
        cancel: &CancellationToken,
        fragments: mpsc::Receiver<String>,
        voice: &VoiceProfile,
    ) -> Result<mpsc::Receiver<Vec<u8>>, SpeechError> {
        if self.mode == ApiMode::Xtts && voice.id.is_empty() {
            return Err(SpeechError::InvalidInput {
                provider: PROVIDER,
                message: "xtts mode requires a voice id".into(),
            });
        }
        info!(voice = %voice.id, mode = ?self.mode, "starting synthesis stream");
        Ok(stream::spawn_pipeline(
            self.clone(),
            cancel,
            fragments,
            voice.clone(),
        ))
    }

    /// List the voices the server offers.
    pub async fn list_voices(&self) -> Result<Vec<VoiceProfile>, SpeechError> {
        match self.mode {
            ApiMode::Xtts => self.list_studio_speakers().await,
            ApiMode::Standard => self.list_model_speakers().await,
        }
    }

    /// Clone a voice from reference samples (XTTS only).
    ///
    /// Uploads one `wav_files` part per sample and returns a profile for
    /// the new speaker.
    pub async fn clone_voice(&self, samples: Vec<Vec<u8>>) -> Result<VoiceProfile, SpeechError> {
        if self.mode != ApiMode::Xtts {
            return Err(SpeechError::Unsupported {
                provider: PROVIDER,
                operation: "voice cloning is not supported in standard API mode",
            });
        }
        if samples.is_empty() {
            return Err(SpeechError::InvalidInput {
                provider: PROVIDER,
                message: "voice cloning requires at least one sample".into(),
            });
        }

        let mut form = reqwest::multipart::Form::new();
        for (i, sample) in samples.into_iter().enumerate() {
            let part = reqwest::multipart::Part::bytes(sample)
                .file_name(format!("sample_{i:02}.wav"))
                .mime_str("audio/wav")
                .map_err(|e| SpeechError::InvalidInput {
                    provider: PROVIDER,
                    message: e.to_string(),
                })?;
            form = form.part("wav_files", part);
        }

        let response = self
            .client
            .post(format!("{}/clone_speaker", self.base_url))
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(connect_error)?;
        let response = check_status(response).await?;

        let body: CloneResponse = response.json().await.map_err(connect_error)?;
        let name = body.name.ok_or_else(|| SpeechError::Protocol {
            provider: PROVIDER,
            message: "clone response missing speaker name".into(),
        })?;

        info!(speaker = %name, "cloned voice");
        let mut profile = VoiceProfile::new(&name, &name, PROVIDER).with_metadata("type", "cloned");
        if let Some(status) = body.status {
            profile = profile.with_metadata("status", status);
        }
        Ok(profile)
    }

    /// Synthesise one sentence and return its raw PCM payload,
    /// resampled when an output rate is configured.
    pub(crate) async fn synthesize_sentence(
        &self,
        text: &str,
        voice: &VoiceProfile,
    ) -> Result<Vec<u8>, SpeechError> {
        debug!(
            text = crate::truncate_safe(text, 80),
            mode = ?self.mode,
            "synthesizing sentence"
        );

        let response = match self.mode {
            ApiMode::Xtts => {
                let body = serde_json::json!({
                    "text": text,
                    "speaker_wav": voice.id,
                    "language": self.language,
                });
                self.client
                    .post(format!("{}/tts_to_audio/", self.base_url))
                    .header(reqwest::header::ACCEPT, "audio/wav")
                    .json(&body)
                    .timeout(self.timeout)
                    .send()
                    .await
            }
            ApiMode::Standard => {
                let mut query: Vec<(&str, &str)> = vec![("text", text)];
                if !voice.id.is_empty() {
                    query.push(("speaker_id", &voice.id));
                }
                if !self.language.is_empty() {
                    query.push(("language_id", &self.language));
                }
                self.client
                    .get(format!("{}/api/tts", self.base_url))
                    .header(reqwest::header::ACCEPT, "audio/wav")
                    .query(&query)
                    .timeout(self.timeout)
                    .send()
                    .await
            }
        }
        .map_err(connect_error)?;

        let response = check_status(response).await?;
        let wav_bytes = response.bytes().await.map_err(connect_error)?;

        let info = parse_wav(&wav_bytes).map_err(|e| SpeechError::Audio {
            provider: PROVIDER,
            message: e.to_string(),
        })?;
        let pcm = &wav_bytes[info.data_offset..info.data_offset + info.data_len];

        if self.output_sample_rate != 0
            && info.sample_rate != 0
            && info.sample_rate != self.output_sample_rate
            && info.channels == 1
        {
            Ok(resample_linear(pcm, info.sample_rate, self.output_sample_rate))
        } else {
            Ok(pcm.to_vec())
        }
    }

    async fn list_studio_speakers(&self) -> Result<Vec<VoiceProfile>, SpeechError> {
        let response = self
            .client
            .get(format!("{}/studio_speakers", self.base_url))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(connect_error)?;
        let response = check_status(response).await?;

        // BTreeMap gives the lexicographic ordering for free.
        let speakers: BTreeMap<String, serde_json::Value> =
            response.json().await.map_err(connect_error)?;

        Ok(speakers
            .into_keys()
            .map(|name| VoiceProfile::new(&name, &name, PROVIDER).with_metadata("type", "studio"))
            .collect())
    }

    async fn list_model_speakers(&self) -> Result<Vec<VoiceProfile>, SpeechError> {
        let response = self
            .client
            .get(format!("{}/details", self.base_url))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(connect_error)?;
        let response = check_status(response).await?;

        let details: DetailsResponse = response.json().await.map_err(connect_error)?;
        let mut speakers = details.speakers.unwrap_or_default();

        if speakers.is_empty() {
            return Ok(vec![VoiceProfile::new(
                &details.model_name,
                &details.model_name,
                PROVIDER,
            )
            .with_metadata("type", "single-speaker")
            .with_metadata("model_name", &details.model_name)]);
        }

        speakers.sort();
        Ok(speakers
            .into_iter()
            .map(|name| {
                VoiceProfile::new(&name, &name, PROVIDER)
                    .with_metadata("type", "speaker")
                    .with_metadata("model_name", &details.model_name)
            })
            .collect())
    }
}

fn connect_error(err: reqwest::Error) -> SpeechError {
    SpeechError::Connect {
        provider: PROVIDER,
        message: err.to_string(),
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SpeechError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(SpeechError::Http {
        provider: PROVIDER,
        status: status.as_u16(),
        message,
    })
}
