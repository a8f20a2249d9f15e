//! User-facing notifications via notify-rust (D-Bus), mirrored to the log.

use notify_rust::Notification;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Success,
    Warning,
    Error,
}

pub struct Notifier {
    enabled: bool,
}

impl Notifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn notify(&self, level: Level, title: &str, body: &str) {
        match level {
            Level::Error => error!("[{title}] {body}"),
            Level::Warning => warn!("[{title}] {body}"),
            Level::Success => info!("[{title}] {body}"),
        }

        if !self.enabled {
            return;
        }

        debug!("Notification: {title}");

        if let Err(e) = Notification::new()
            .summary(title)
            .body(body)
            .icon("audio-speakers")
            .timeout(3000)
            .show()
        {
            warn!("Failed to show notification: {e}");
        }
    }

    pub fn error(&self, title: &str, body: &str) {
        self.notify(Level::Error, title, body);
    }

    pub fn success(&self, title: &str, body: &str) {
        self.notify(Level::Success, title, body);
    }
}
