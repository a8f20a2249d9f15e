//! Fallback listening: watch the host's chat log for added messages.
//!
//! Used when the host cannot deliver render events. Each message appended
//! to the log waits out a settle delay, then goes through a shared debounce
//! so a burst of changes produces a single dispatch.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::dispatcher::NarrationDispatcher;
use super::source::{ChatLog, MessageId};
use super::timer::DelayedTask;
use crate::config::ListenerConfig;

pub struct ChatLogObserver {
    log: ChatLog,
    dispatcher: Arc<NarrationDispatcher>,
    config: ListenerConfig,
    poll_interval: Duration,
}

impl ChatLogObserver {
    pub fn new(
        log: ChatLog,
        dispatcher: Arc<NarrationDispatcher>,
        config: ListenerConfig,
        poll_interval: Duration,
    ) -> Self {
        Self {
            log,
            dispatcher,
            config,
            // `interval` panics on a zero period.
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Watch until `cancel` fires. Returns early, silently, when the log
    /// never shows up within the retry budget.
    pub async fn run(self, cancel: CancellationToken) {
        if !self.wait_for_log(&cancel).await {
            return;
        }

        // Messages already in the log are history, not additions.
        let mut seen = self.log.read().map(|m| m.len()).unwrap_or(0);
        info!(
            "Watching chat log {} ({seen} existing messages)",
            self.log.path().display()
        );

        let debounce = Arc::new(Mutex::new(DelayedTask::new()));
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll.tick() => {
                    let messages = match self.log.read() {
                        Ok(m) => m,
                        Err(e) => {
                            debug!("Chat log unreadable: {e}");
                            continue;
                        }
                    };

                    if messages.len() < seen {
                        info!("Chat log shrank ({seen} → {}), resyncing", messages.len());
                        seen = messages.len();
                        self.dispatcher.reset();
                        continue;
                    }

                    for index in seen..messages.len() {
                        self.schedule(index, &debounce, &cancel);
                    }
                    seen = messages.len();
                }
            }
        }

        lock(&debounce).cancel();
        debug!("Chat log observer stopped");
    }

    async fn wait_for_log(&self, cancel: &CancellationToken) -> bool {
        let max = self.config.max_retries;
        let mut attempts = 0;

        while !self.log.exists() {
            attempts += 1;
            if attempts >= max {
                info!(
                    "Chat log {} not found after {max} attempts, not watching (probably no chat open)",
                    self.log.path().display()
                );
                return false;
            }
            debug!(
                "Chat log {} not found, retrying ({attempts}/{max})",
                self.log.path().display()
            );

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.config.retry_interval()) => {}
            }
        }

        true
    }

    /// Settle, then hand the message to the shared debounce.
    fn schedule(&self, index: usize, debounce: &Arc<Mutex<DelayedTask>>, cancel: &CancellationToken) {
        let settle = self.config.observer_settle();
        let wait = self.config.observer_debounce();
        let debounce = debounce.clone();
        let cancel = cancel.clone();
        let log = self.log.clone();
        let dispatcher = self.dispatcher.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(settle) => {
                    lock(&debounce).arm(wait, move || handle_added(&log, &dispatcher, index));
                }
            }
        });
    }
}

fn handle_added(log: &ChatLog, dispatcher: &Arc<NarrationDispatcher>, index: usize) {
    let message = match log.read() {
        Ok(messages) => messages.into_iter().nth(index),
        Err(e) => {
            debug!("Chat log unreadable: {e}");
            return;
        }
    };

    let Some(message) = message else {
        debug!("Chat message {index} disappeared before narration");
        return;
    };

    let origin = message.origin();
    dispatcher.observed(MessageId::from(index), origin, message.mes);
}

fn lock(task: &Mutex<DelayedTask>) -> std::sync::MutexGuard<'_, DelayedTask> {
    task.lock().unwrap_or_else(|e| e.into_inner())
}
