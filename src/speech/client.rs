//! HTTP client for the SiliconFlow-compatible speech API.
//!
//! Endpoints (relative to `apiUrl`):
//! - `POST /audio/speech`: synthesize, returns audio bytes
//! - `GET /audio/voice/list`: custom (cloned) voices
//! - `POST /uploads/audio/voice`: clone a voice from a reference clip
//! - `POST /audio/voice/deletions`: delete a custom voice

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::settings::{CustomVoice, Settings};

pub const MAX_VOICE_NAME_LEN: usize = 64;

/// Preset voices of `FunAudioLLM/CosyVoice2-0.5B`.
pub const PRESET_VOICES: &[(&str, &str)] = &[
    ("alex", "Alex (male)"),
    ("anna", "Anna (female)"),
    ("bella", "Bella (female)"),
    ("benjamin", "Benjamin (male)"),
    ("charles", "Charles (male)"),
    ("claire", "Claire (female)"),
    ("david", "David (male)"),
    ("diana", "Diana (female)"),
];

#[derive(Error, Debug)]
pub enum TtsError {
    #[error("API key not configured")]
    MissingApiKey,

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid voice name '{0}': use letters, digits, '_' or '-', at most 64 characters")]
    InvalidVoiceName(String),

    #[error("reference text is empty")]
    EmptyReferenceText,

    #[error("reference audio is empty")]
    EmptyReferenceAudio,

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, TtsError>;

/// Per-call overrides of the stored settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpeakOptions {
    pub voice: Option<String>,
    pub speed: Option<f32>,
    pub gain: Option<f32>,
    pub auto_play: Option<bool>,
}

#[derive(Serialize)]
struct SpeechBody<'a> {
    model: &'a str,
    input: &'a str,
    voice: String,
    response_format: &'a str,
    sample_rate: u32,
    speed: f32,
    gain: f32,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct VoiceList {
    result: Option<Vec<CustomVoice>>,
    results: Option<Vec<CustomVoice>>,
}

/// A reference clip for voice cloning.
#[derive(Debug, Clone)]
pub struct VoiceUpload {
    pub name: String,
    pub text: String,
    pub audio: Vec<u8>,
    pub file_name: String,
}

impl VoiceUpload {
    pub fn from_file(name: &str, text: &str, path: &Path) -> Result<Self> {
        let audio = std::fs::read(path).map_err(|source| TtsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio".into());

        Ok(Self {
            name: name.to_string(),
            text: text.to_string(),
            audio,
            file_name,
        })
    }

    fn mime(&self) -> &'static str {
        let ext = Path::new(&self.file_name)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());
        match ext.as_deref() {
            Some("mp3") => "audio/mpeg",
            Some("wav") => "audio/wav",
            Some("ogg") | Some("opus") => "audio/ogg",
            Some("flac") => "audio/flac",
            Some("m4a") => "audio/mp4",
            _ => "application/octet-stream",
        }
    }

    fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime(), STANDARD.encode(&self.audio))
    }
}

/// A voice containing `:` is an opaque custom voice URI and is sent as is;
/// a bare preset name is qualified with the model id.
pub fn voice_param(model: &str, voice: &str) -> String {
    if voice.contains(':') {
        voice.to_string()
    } else {
        format!("{model}:{voice}")
    }
}

pub fn validate_voice_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_VOICE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(TtsError::InvalidVoiceName(name.to_string()))
    }
}

#[derive(Clone, Default)]
pub struct TtsClient {
    client: Client,
}

impl TtsClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Synthesize `text`, returning the encoded audio (`responseFormat`).
    pub async fn synthesize(
        &self,
        settings: &Settings,
        text: &str,
        options: &SpeakOptions,
    ) -> Result<Vec<u8>> {
        let voice = options
            .voice
            .as_deref()
            .filter(|v| !v.is_empty())
            .or(Some(settings.tts_voice.as_str()).filter(|v| !v.is_empty()))
            .unwrap_or("alex");
        let speed = options
            .speed
            .unwrap_or(if settings.tts_speed > 0.0 { settings.tts_speed } else { 1.0 });
        let gain = options.gain.unwrap_or(settings.tts_gain);

        let body = SpeechBody {
            model: &settings.tts_model,
            input: text,
            voice: voice_param(&settings.tts_model, voice),
            response_format: &settings.response_format,
            sample_rate: settings.sample_rate,
            speed,
            gain,
        };

        let preview: String = text.chars().take(50).collect();
        debug!(
            "TTS request: voice={} speed={speed} gain={gain} text=\"{preview}{}\"",
            body.voice,
            if text.chars().count() > 50 { "..." } else { "" }
        );

        let resp = self
            .authorized(settings, self.client.post(endpoint(settings, "/audio/speech")))?
            .json(&body)
            .send()
            .await?;
        let audio = check(resp).await?.bytes().await?;

        debug!("Received {} bytes of {} audio", audio.len(), settings.response_format);
        Ok(audio.to_vec())
    }

    /// Succeeds when the voice list endpoint answers 2xx.
    pub async fn test_connection(&self, settings: &Settings) -> Result<()> {
        let resp = self
            .authorized(settings, self.client.get(endpoint(settings, "/audio/voice/list")))?
            .send()
            .await?;
        check(resp).await?;
        info!("API connection OK");
        Ok(())
    }

    pub async fn list_custom_voices(&self, settings: &Settings) -> Result<Vec<CustomVoice>> {
        let resp = self
            .authorized(settings, self.client.get(endpoint(settings, "/audio/voice/list")))?
            .send()
            .await?;
        let list: VoiceList = check(resp).await?.json().await?;
        let voices = list.result.or(list.results).unwrap_or_default();
        debug!("Custom voices: {}", voices.len());
        Ok(voices)
    }

    /// Clone a voice. Tries a JSON body with a base64 data URL first and
    /// falls back to a multipart form if the server rejects it.
    pub async fn upload_voice(&self, settings: &Settings, upload: &VoiceUpload) -> Result<()> {
        validate_voice_name(&upload.name)?;
        if upload.text.trim().is_empty() {
            return Err(TtsError::EmptyReferenceText);
        }
        if upload.audio.is_empty() {
            return Err(TtsError::EmptyReferenceAudio);
        }
        let url = endpoint(settings, "/uploads/audio/voice");

        let body = json!({
            "model": settings.tts_model,
            "customName": upload.name,
            "text": upload.text,
            "audio": upload.data_url(),
        });
        let resp = self
            .authorized(settings, self.client.post(&url))?
            .json(&body)
            .send()
            .await?;

        if resp.status().is_success() {
            info!("Voice '{}' uploaded (json)", upload.name);
            return Ok(());
        }

        let status = resp.status();
        let detail = resp.text().await.unwrap_or_default();
        info!("JSON voice upload rejected (HTTP {status}: {detail}), retrying as multipart");

        let audio = Part::bytes(upload.audio.clone())
            .file_name(upload.file_name.clone())
            .mime_str(upload.mime())?;
        let form = Form::new()
            .text("model", settings.tts_model.clone())
            .text("customName", upload.name.clone())
            .text("text", upload.text.clone())
            .part("audio", audio);

        let resp = self
            .authorized(settings, self.client.post(&url))?
            .multipart(form)
            .send()
            .await?;
        check(resp).await?;
        info!("Voice '{}' uploaded (multipart)", upload.name);
        Ok(())
    }

    pub async fn delete_voice(&self, settings: &Settings, uri: &str) -> Result<()> {
        let resp = self
            .authorized(settings, self.client.post(endpoint(settings, "/audio/voice/deletions")))?
            .json(&json!({ "uri": uri }))
            .send()
            .await?;
        check(resp).await?;
        info!("Deleted voice {uri}");
        Ok(())
    }

    fn authorized(&self, settings: &Settings, request: RequestBuilder) -> Result<RequestBuilder> {
        if settings.api_key.is_empty() {
            return Err(TtsError::MissingApiKey);
        }
        Ok(request.bearer_auth(&settings.api_key))
    }
}

fn endpoint(settings: &Settings, path: &str) -> String {
    format!("{}{path}", settings.api_url.trim_end_matches('/'))
}

async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(TtsError::Status {
        status: status.as_u16(),
        body,
    })
}
