//! Turns text into speech: synthesis, playback, feedback and history.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{SpeakOptions, TtsClient, VoiceUpload};
use super::history::{NarrationHistory, NarrationRecord, Outcome};
use super::player::AudioPlayer;
use crate::extract::ExtractMode;
use crate::narration::{Origin, Speaker};
use crate::notifier::{Level, Notifier};
use crate::settings::{CustomVoice, SettingsStore};

const TITLE: &str = "Tavern Narrator";

#[derive(Debug, Clone)]
pub struct SpeechOutput {
    pub audio: Vec<u8>,
    pub format: String,
    pub voice: String,
    pub played: bool,
}

pub struct Narrator {
    settings: SettingsStore,
    client: TtsClient,
    player: AudioPlayer,
    notifier: Notifier,
    history: Option<NarrationHistory>,
    active: Mutex<Option<ActiveRun>>,
    tickets: AtomicU64,
}

/// The one narration allowed to synthesize or play.
struct ActiveRun {
    ticket: u64,
    cancel: CancellationToken,
}

/// Releases the narrator however the run ends, unless `stop` has already
/// handed it on to a later run.
struct BusyGuard<'a> {
    active: &'a Mutex<Option<ActiveRun>>,
    ticket: u64,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut active = lock(self.active);
        if active.as_ref().is_some_and(|run| run.ticket == self.ticket) {
            *active = None;
        }
    }
}

impl Narrator {
    pub fn new(
        settings: SettingsStore,
        notifier: Notifier,
        history: Option<NarrationHistory>,
    ) -> Self {
        Self {
            settings,
            client: TtsClient::new(),
            player: AudioPlayer::new(),
            notifier,
            history,
            active: Mutex::new(None),
            tickets: AtomicU64::new(0),
        }
    }

    /// Speak `text` on request. Returns the synthesized audio, or `None`
    /// when nothing was synthesized (reported through the notifier).
    pub async fn speak(&self, text: &str, options: &SpeakOptions) -> Option<SpeechOutput> {
        self.run("manual", ExtractMode::Full, text, options).await
    }

    async fn run(
        &self,
        source: &str,
        mode: ExtractMode,
        text: &str,
        options: &SpeakOptions,
    ) -> Option<SpeechOutput> {
        let settings = self.settings.get();

        if settings.api_key.is_empty() {
            self.notifier
                .error(TITLE, "API key not configured. Set apiKey in the settings first.");
            return None;
        }

        if text.trim().is_empty() {
            self.notifier.error(TITLE, "No text to narrate");
            return None;
        }

        let voice = options
            .voice
            .clone()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| settings.tts_voice.clone());
        let mut record = NarrationRecord::new(source, &mode.to_string(), text, &voice);

        let Some((_busy, cancel)) = self.acquire() else {
            info!("Narration already in progress, dropping {source} request");
            record.outcome = Outcome::Busy;
            self.save(&record);
            return None;
        };

        let t0 = Instant::now();
        let synthesized = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.client.synthesize(&settings, text, options) => Some(result),
        };
        let audio = match synthesized {
            None => {
                info!("Narration stopped during synthesis");
                record.error = Some("stopped".into());
                self.save(&record);
                return None;
            }
            Some(Ok(audio)) => audio,
            Some(Err(e)) => {
                self.notifier.error("Speech synthesis failed", &e.to_string());
                record.error = Some(e.to_string());
                self.save(&record);
                return None;
            }
        };
        record.tts_latency_ms = t0.elapsed().as_millis() as i64;
        info!(
            "Synthesized {} chars in {}ms ({} bytes)",
            record.input_chars,
            record.tts_latency_ms,
            audio.len()
        );

        let mut played = false;
        record.outcome = Outcome::Synthesized;

        let auto_play = options.auto_play.unwrap_or(settings.auto_play);
        if auto_play && !cancel.is_cancelled() {
            let t1 = Instant::now();
            let playback = tokio::select! {
                result = self.player.play(audio.clone()) => result,
                _ = cancel.cancelled() => {
                    self.player.stop();
                    Ok(true)
                }
            };
            match playback {
                Ok(stopped) => {
                    played = true;
                    record.outcome = Outcome::Spoke;
                    if stopped {
                        debug!("Playback stopped early");
                    }
                }
                Err(e) => {
                    self.notifier
                        .notify(Level::Warning, "Playback failed", &e.to_string());
                    record.error = Some(e.to_string());
                }
            }
            record.playback_duration_ms = t1.elapsed().as_millis() as i64;
        }

        self.save(&record);

        Some(SpeechOutput {
            audio,
            format: settings.response_format,
            voice,
            played,
        })
    }

    /// Abort the current narration, whether synthesizing or playing, and
    /// free the narrator for the next request.
    pub fn stop(&self) {
        if let Some(run) = self.active().take() {
            run.cancel.cancel();
        }
        self.player.stop();
    }

    pub fn is_busy(&self) -> bool {
        self.active().is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.player.is_playing()
    }

    fn acquire(&self) -> Option<(BusyGuard<'_>, CancellationToken)> {
        let mut active = self.active();
        if active.is_some() {
            return None;
        }
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        *active = Some(ActiveRun {
            ticket,
            cancel: cancel.clone(),
        });
        let guard = BusyGuard {
            active: &self.active,
            ticket,
        };
        Some((guard, cancel))
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        lock(&self.active)
    }

    pub async fn test_connection(&self) -> bool {
        let settings = self.settings.get();
        if settings.api_key.is_empty() {
            self.notifier.error(TITLE, "API key not configured");
            return false;
        }

        match self.client.test_connection(&settings).await {
            Ok(()) => {
                self.notifier.success(TITLE, "Connected to the speech API");
                true
            }
            Err(e) => {
                self.notifier.error("Connection failed", &e.to_string());
                false
            }
        }
    }

    /// Fetch custom voices and store them in the settings. Failures are
    /// logged only and yield an empty list.
    pub async fn refresh_custom_voices(&self) -> Vec<CustomVoice> {
        let settings = self.settings.get();
        if settings.api_key.is_empty() {
            debug!("No API key, skipping custom voice refresh");
            return Vec::new();
        }

        match self.client.list_custom_voices(&settings).await {
            Ok(voices) => {
                if let Err(e) = self.settings.set_custom_voices(voices.clone()) {
                    warn!("Failed to store custom voices: {e}");
                }
                info!("Loaded {} custom voices", voices.len());
                voices
            }
            Err(e) => {
                warn!("Failed to load custom voices: {e}");
                Vec::new()
            }
        }
    }

    pub async fn upload_voice(&self, upload: &VoiceUpload) -> bool {
        let settings = self.settings.get();
        match self.client.upload_voice(&settings, upload).await {
            Ok(()) => {
                self.notifier
                    .success(TITLE, &format!("Voice '{}' uploaded", upload.name));
                self.refresh_custom_voices().await;
                true
            }
            Err(e) => {
                self.notifier.error("Voice upload failed", &e.to_string());
                false
            }
        }
    }

    pub async fn delete_voice(&self, uri: &str) -> bool {
        let settings = self.settings.get();
        match self.client.delete_voice(&settings, uri).await {
            Ok(()) => {
                self.notifier.success(TITLE, "Voice deleted");
                self.refresh_custom_voices().await;
                true
            }
            Err(e) => {
                self.notifier.error("Voice deletion failed", &e.to_string());
                false
            }
        }
    }

    fn save(&self, record: &NarrationRecord) {
        if let Some(history) = &self.history {
            history.save(record);
        }
    }
}

fn lock(active: &Mutex<Option<ActiveRun>>) -> MutexGuard<'_, Option<ActiveRun>> {
    active.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl Speaker for Narrator {
    async fn narrate(&self, text: String, origin: Origin, mode: ExtractMode) {
        // The dispatcher already checked the auto flag for this origin.
        let options = SpeakOptions {
            auto_play: Some(true),
            ..SpeakOptions::default()
        };
        self.run(&origin.to_string(), mode, &text, &options).await;
    }
}
