//! Session lifecycle: pick one listening strategy and own its state.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dispatcher::{NarrationDispatcher, SettleDelays, Speaker};
use super::observer::ChatLogObserver;
use super::source::{ChatLog, RenderedMessages};
use crate::api::{self, ApiState};
use crate::config::Config;
use crate::settings::SettingsStore;
use crate::speech::Narrator;

/// How messages reach the dispatcher. Exactly one per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenStrategy {
    /// Host pushes render events to the HTTP API.
    EventFeed(SocketAddr),
    /// Poll the host's chat log.
    ChatLog(Option<PathBuf>),
}

impl fmt::Display for ListenStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EventFeed(addr) => write!(f, "event feed on http://{addr}"),
            Self::ChatLog(Some(path)) => write!(f, "chat log {}", path.display()),
            Self::ChatLog(None) => write!(f, "chat log (no path configured)"),
        }
    }
}

pub struct NarrationListener {
    strategy: ListenStrategy,
    dispatcher: Arc<NarrationDispatcher>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl NarrationListener {
    /// Start listening, narrating through `narrator`.
    ///
    /// The event feed is used when the server is enabled and its address
    /// binds; otherwise the chat log is watched.
    pub async fn start(config: &Config, settings: SettingsStore, narrator: Arc<Narrator>) -> Self {
        let speaker: Arc<dyn Speaker> = narrator.clone();
        Self::start_with(config, settings, narrator, speaker).await
    }

    async fn start_with(
        config: &Config,
        settings: SettingsStore,
        narrator: Arc<Narrator>,
        speaker: Arc<dyn Speaker>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let delays = SettleDelays::from(&config.listener);

        if config.server.enabled {
            let addr = config.server.addr();
            match TcpListener::bind(&addr).await {
                Ok(listener) => {
                    let bound = match listener.local_addr() {
                        Ok(a) => a,
                        Err(e) => {
                            warn!("Event feed bound on {addr} but address unknown: {e}");
                            SocketAddr::from(([127, 0, 0, 1], config.server.port))
                        }
                    };

                    let messages = Arc::new(RenderedMessages::new());
                    let dispatcher =
                        NarrationDispatcher::new(settings.clone(), messages.clone(), speaker, delays);
                    let state = ApiState {
                        dispatcher: dispatcher.clone(),
                        messages,
                        narrator,
                        settings,
                    };
                    let task = tokio::spawn(api::serve(listener, state, cancel.clone()));

                    let strategy = ListenStrategy::EventFeed(bound);
                    info!("Listening via {strategy}");
                    return Self {
                        strategy,
                        dispatcher,
                        cancel,
                        task: Some(task),
                    };
                }
                Err(e) => {
                    warn!("Cannot bind event feed on {addr}: {e}, falling back to chat log");
                }
            }
        } else {
            info!("Event server disabled");
        }

        let path = config.chat_log.path.clone();
        let log = ChatLog::new(path.clone().unwrap_or_default());
        let dispatcher = NarrationDispatcher::new(settings, Arc::new(log.clone()), speaker, delays);
        let observer = ChatLogObserver::new(
            log,
            dispatcher.clone(),
            config.listener.clone(),
            Duration::from_millis(config.chat_log.poll_interval_ms),
        );
        let task = tokio::spawn(observer.run(cancel.clone()));

        let strategy = ListenStrategy::ChatLog(path);
        info!("Listening via {strategy}");
        Self {
            strategy,
            dispatcher,
            cancel,
            task: Some(task),
        }
    }

    pub fn strategy(&self) -> &ListenStrategy {
        &self.strategy
    }

    /// Forget which messages were narrated; keep listening.
    pub fn reset(&self) {
        self.dispatcher.reset();
    }

    /// Stop listening and drop all pending narration timers.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        self.dispatcher.shutdown();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!("Listener task ended abnormally: {e}");
            }
        }
        info!("Stopped listening via {}", self.strategy);
    }
}

impl Drop for NarrationListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
