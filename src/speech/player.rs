//! Audio playback through rodio, with stop support.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rodio::{Decoder, OutputStreamBuilder, Sink};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("failed to open audio output: {0}")]
    Output(String),

    #[error("failed to decode audio: {0}")]
    Decode(String),

    #[error("playback task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Plays one encoded clip at a time. The output stream is opened on the
/// blocking playback thread and lives only as long as the clip.
#[derive(Clone, Default)]
pub struct AudioPlayer {
    stop_flag: Arc<AtomicBool>,
    active_sink: Arc<Mutex<Option<Sink>>>,
}

impl AudioPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and play `audio` (mp3, wav, ogg or flac) until it ends or
    /// `stop` is called. Returns `true` when stopped early.
    pub async fn play(&self, audio: Vec<u8>) -> Result<bool, PlayerError> {
        self.stop_flag.store(false, Ordering::Relaxed);
        let stop_flag = self.stop_flag.clone();
        let active_sink = self.active_sink.clone();

        tokio::task::spawn_blocking(move || -> Result<bool, PlayerError> {
            let mut stream = OutputStreamBuilder::open_default_stream()
                .map_err(|e| PlayerError::Output(e.to_string()))?;
            stream.log_on_drop(false);

            let source =
                Decoder::new(Cursor::new(audio)).map_err(|e| PlayerError::Decode(e.to_string()))?;

            // rodio 0.21: Sink::connect_new takes &Mixer
            let sink = Sink::connect_new(stream.mixer());
            sink.append(source);
            *lock(&active_sink) = Some(sink);
            debug!("Playback started");

            let stopped = loop {
                let done = lock(&active_sink).as_ref().is_none_or(Sink::empty);
                if done {
                    break false;
                }

                if stop_flag.load(Ordering::Relaxed) {
                    if let Some(sink) = lock(&active_sink).take() {
                        sink.stop();
                    }
                    break true;
                }

                std::thread::sleep(Duration::from_millis(50));
            };

            *lock(&active_sink) = None;
            Ok(stopped)
        })
        .await?
    }

    /// Stop the current clip immediately. No-op when idle.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(sink) = lock(&self.active_sink).take() {
            sink.stop();
            info!("Playback stopped");
        }
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.active_sink).is_some()
    }
}

fn lock(sink: &Mutex<Option<Sink>>) -> MutexGuard<'_, Option<Sink>> {
    sink.lock().unwrap_or_else(|e| e.into_inner())
}
