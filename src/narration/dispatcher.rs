//! Decides once per message whether it gets narrated.
//!
//! Per origin: Idle → Pending(id) → Settling(id) → Idle. A new event for an
//! origin re-arms that origin's settle timer (last event wins); the two
//! origins never touch each other's timers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::source::{MessageEvent, MessageId, MessageSource, Origin};
use super::timer::DelayedTask;
use crate::config::ListenerConfig;
use crate::extract::{extract, ExtractMode};
use crate::settings::{Settings, SettingsStore};

/// Downstream speech. Implementations report their own failures; nothing
/// comes back into the dispatcher.
#[async_trait]
pub trait Speaker: Send + Sync {
    async fn narrate(&self, text: String, origin: Origin, mode: ExtractMode);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleDelays {
    pub character: Duration,
    pub user: Duration,
}

impl SettleDelays {
    pub fn for_origin(&self, origin: Origin) -> Duration {
        match origin {
            Origin::Character => self.character,
            Origin::User => self.user,
        }
    }
}

impl Default for SettleDelays {
    fn default() -> Self {
        Self::from(&ListenerConfig::default())
    }
}

impl From<&ListenerConfig> for SettleDelays {
    fn from(config: &ListenerConfig) -> Self {
        Self {
            character: config.character_delay(),
            user: config.user_delay(),
        }
    }
}

pub fn auto_narration_enabled(settings: &Settings, origin: Origin) -> bool {
    match origin {
        Origin::Character => settings.auto_play,
        Origin::User => settings.auto_play_user,
    }
}

#[derive(Default)]
struct DispatchState {
    last_dispatched: HashMap<Origin, MessageId>,
    /// Chat-log path only: messages already handled.
    processed: HashSet<MessageId>,
    timers: HashMap<Origin, DelayedTask>,
}

pub struct NarrationDispatcher {
    settings: SettingsStore,
    source: Arc<dyn MessageSource>,
    speaker: Arc<dyn Speaker>,
    delays: SettleDelays,
    state: Mutex<DispatchState>,
}

impl NarrationDispatcher {
    pub fn new(
        settings: SettingsStore,
        source: Arc<dyn MessageSource>,
        speaker: Arc<dyn Speaker>,
        delays: SettleDelays,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            source,
            speaker,
            delays,
            state: Mutex::new(DispatchState::default()),
        })
    }

    /// A host "message rendered" event.
    pub fn notify(self: &Arc<Self>, event: MessageEvent) {
        let MessageEvent { id, origin } = event;
        debug!("{origin} message rendered: {id}");

        if !auto_narration_enabled(&self.settings.get(), origin) {
            debug!("Auto narration disabled for {origin} messages");
            return;
        }

        let mut state = self.state();
        if state.last_dispatched.get(&origin) == Some(&id) {
            debug!("{origin} message {id} already narrated, skipping");
            return;
        }

        let delay = self.delays.for_origin(origin);
        let dispatcher = Arc::downgrade(self);
        state
            .timers
            .entry(origin)
            .or_default()
            .arm(delay, move || settle(dispatcher, id, origin));
    }

    /// A message noticed in the chat log. Each id is handled at most once.
    pub fn observed(self: &Arc<Self>, id: MessageId, origin: Origin, text: String) {
        if !self.state().processed.insert(id.clone()) {
            return;
        }

        if text.is_empty() {
            return;
        }

        if !auto_narration_enabled(&self.settings.get(), origin) {
            debug!("Auto narration disabled for {origin} messages");
            return;
        }

        info!("Chat log: new {origin} message {id}");
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.process_message(&text, origin).await;
        });
    }

    /// Extract the speakable part of `text` and hand it to the speaker.
    pub async fn process_message(&self, text: &str, origin: Origin) {
        if text.is_empty() {
            info!("{origin} message is empty");
            return;
        }

        let markers = self.settings.get().markers();
        let preview: String = text.chars().take(100).collect();
        debug!(
            "Processing {origin} message (start={:?}, end={:?}): {preview}",
            markers.start, markers.end
        );

        let extraction = extract(text, &markers);
        match (extraction.mode, extraction.text) {
            (ExtractMode::Skip, _) | (_, None) => {
                info!("{origin} message: markers set but nothing matched, not narrating");
            }
            (mode, Some(speak)) => {
                info!("{origin} message: narrating {mode} text ({} chars)", speak.chars().count());
                self.speaker.narrate(speak, origin, mode).await;
            }
        }
    }

    /// Forget which messages were narrated. Pending timers keep running.
    pub fn reset(&self) {
        let mut state = self.state();
        state.last_dispatched.clear();
        state.processed.clear();
        info!("Narration state reset");
    }

    /// Cancel all pending settle timers.
    pub fn shutdown(&self) {
        for timer in self.state().timers.values_mut() {
            timer.cancel();
        }
    }

    pub fn last_dispatched(&self, origin: Origin) -> Option<MessageId> {
        self.state().last_dispatched.get(&origin).cloned()
    }

    pub fn is_pending(&self, origin: Origin) -> bool {
        self.state().timers.get(&origin).is_some_and(DelayedTask::is_pending)
    }

    fn state(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Settle timer fired for `id`.
fn settle(dispatcher: Weak<NarrationDispatcher>, id: MessageId, origin: Origin) {
    let Some(dispatcher) = dispatcher.upgrade() else {
        return;
    };

    {
        let mut state = dispatcher.state();
        if state.last_dispatched.get(&origin) == Some(&id) {
            debug!("{origin} message {id} narrated during settle delay, skipping");
            return;
        }
        // Marked before any await so a duplicate event is rejected at once.
        state.last_dispatched.insert(origin, id.clone());
    }

    tokio::spawn(async move {
        let text = dispatcher.source.message_text(&id);
        dispatcher.source.release(&id);
        let Some(text) = text else {
            info!("{origin} message {id} not found or empty");
            return;
        };
        dispatcher.process_message(&text, origin).await;
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::narration::source::RenderedMessages;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub(crate) struct RecordingSpeaker {
        pub calls: Mutex<Vec<(Origin, String, ExtractMode)>>,
    }

    impl RecordingSpeaker {
        pub fn calls(&self) -> Vec<(Origin, String, ExtractMode)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Speaker for RecordingSpeaker {
        async fn narrate(&self, text: String, origin: Origin, mode: ExtractMode) {
            self.calls.lock().unwrap().push((origin, text, mode));
        }
    }

    struct CountingSource {
        inner: RenderedMessages,
        reads: AtomicUsize,
    }

    impl MessageSource for CountingSource {
        fn message_text(&self, id: &MessageId) -> Option<String> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.message_text(id)
        }

        fn release(&self, id: &MessageId) {
            self.inner.release(id);
        }
    }

    struct Harness {
        dispatcher: Arc<NarrationDispatcher>,
        settings: SettingsStore,
        source: Arc<CountingSource>,
        speaker: Arc<RecordingSpeaker>,
    }

    impl Harness {
        fn new() -> Self {
            let settings = SettingsStore::in_memory(Settings::default());
            let source = Arc::new(CountingSource {
                inner: RenderedMessages::new(),
                reads: AtomicUsize::new(0),
            });
            let speaker = Arc::new(RecordingSpeaker::default());
            let dispatcher = NarrationDispatcher::new(
                settings.clone(),
                source.clone(),
                speaker.clone(),
                SettleDelays::default(),
            );
            Self {
                dispatcher,
                settings,
                source,
                speaker,
            }
        }

        fn render(&self, id: &str, text: &str) {
            self.source.inner.upsert(MessageId::from(id), text.into());
        }

        fn reads(&self) -> usize {
            self.source.reads.load(Ordering::SeqCst)
        }
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_events_dispatch_once() {
        let h = Harness::new();
        h.render("5", "Hello there");

        h.dispatcher.notify(MessageEvent::new("5", Origin::Character));
        advance(300).await;
        h.dispatcher.notify(MessageEvent::new("5", Origin::Character));
        advance(1100).await;

        assert_eq!(
            h.speaker.calls(),
            vec![(Origin::Character, "Hello there".into(), ExtractMode::Full)]
        );
        assert_eq!(h.dispatcher.last_dispatched(Origin::Character), Some(MessageId::from("5")));

        // Already dispatched: dropped without arming a timer.
        h.dispatcher.notify(MessageEvent::new("5", Origin::Character));
        assert!(!h.dispatcher.is_pending(Origin::Character));
        advance(2000).await;
        assert_eq!(h.speaker.calls().len(), 1);
        assert_eq!(h.reads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn settled_render_is_released() {
        let h = Harness::new();
        h.render("3", "Read once");
        h.render("4", "Still waiting");

        h.dispatcher.notify(MessageEvent::new("3", Origin::Character));
        advance(1100).await;

        assert_eq!(h.speaker.calls().len(), 1);
        assert_eq!(h.source.inner.len(), 1);
        assert_eq!(h.source.inner.message_text(&MessageId::from("3")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn settle_delay_waits_for_late_render() {
        let h = Harness::new();
        h.render("1", "draft");

        h.dispatcher.notify(MessageEvent::new("1", Origin::Character));
        advance(900).await;
        assert!(h.speaker.calls().is_empty());
        assert!(h.dispatcher.is_pending(Origin::Character));

        h.render("1", "draft, now expanded");
        advance(200).await;
        assert_eq!(h.speaker.calls()[0].1, "draft, now expanded");
    }

    #[tokio::test(start_paused = true)]
    async fn newer_event_replaces_pending_one() {
        let h = Harness::new();
        h.render("1", "first");
        h.render("2", "second");

        h.dispatcher.notify(MessageEvent::new("1", Origin::Character));
        advance(500).await;
        h.dispatcher.notify(MessageEvent::new("2", Origin::Character));
        advance(700).await;
        assert!(h.speaker.calls().is_empty());

        advance(400).await;
        let texts: Vec<String> = h.speaker.calls().into_iter().map(|c| c.1).collect();
        assert_eq!(texts, vec!["second".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn origins_are_independent() {
        let h = Harness::new();
        h.settings.update(json!({ "autoPlayUser": true })).unwrap();
        h.render("10", "character line");
        h.render("11", "user line");

        h.dispatcher.notify(MessageEvent::new("10", Origin::Character));
        advance(200).await;
        h.dispatcher.notify(MessageEvent::new("11", Origin::User));

        // User delay (500ms) elapses first; the character timer is untouched.
        advance(550).await;
        assert_eq!(
            h.speaker.calls(),
            vec![(Origin::User, "user line".into(), ExtractMode::Full)]
        );
        assert!(h.dispatcher.is_pending(Origin::Character));

        advance(300).await;
        assert_eq!(h.speaker.calls().len(), 2);
        assert_eq!(h.speaker.calls()[1].0, Origin::Character);

        // Same id under the other origin is tracked separately.
        h.render("10", "character line");
        h.dispatcher.notify(MessageEvent::new("10", Origin::User));
        advance(600).await;
        assert_eq!(h.speaker.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_origin_never_reaches_extraction() {
        let h = Harness::new();
        h.render("3", "user text");

        // autoPlayUser defaults to false.
        h.dispatcher.notify(MessageEvent::new("3", Origin::User));
        assert!(!h.dispatcher.is_pending(Origin::User));

        h.settings.update(json!({ "autoPlay": false })).unwrap();
        h.dispatcher.notify(MessageEvent::new("3", Origin::Character));

        advance(3000).await;
        assert!(h.speaker.calls().is_empty());
        assert_eq!(h.reads(), 0);
        assert_eq!(h.dispatcher.last_dispatched(Origin::User), None);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_text_is_dropped_but_marked() {
        let h = Harness::new();

        h.dispatcher.notify(MessageEvent::new("404", Origin::Character));
        advance(1100).await;
        assert!(h.speaker.calls().is_empty());
        assert_eq!(h.reads(), 1);

        h.render("404", "appeared later");
        h.dispatcher.notify(MessageEvent::new("404", Origin::Character));
        advance(1100).await;
        assert!(h.speaker.calls().is_empty());
        assert_eq!(h.reads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn markers_select_spoken_text() {
        let h = Harness::new();
        h.settings
            .update(json!({ "textStart": "<speak>", "textEnd": "</speak>" }))
            .unwrap();
        h.render("1", "ignore this <speak>read this</speak> ignore too");
        h.render("2", "no markers at all");

        h.dispatcher.notify(MessageEvent::new("1", Origin::Character));
        advance(1100).await;
        h.dispatcher.notify(MessageEvent::new("2", Origin::Character));
        advance(1100).await;

        assert_eq!(
            h.speaker.calls(),
            vec![(Origin::Character, "read this".into(), ExtractMode::Marked)]
        );
        assert_eq!(h.reads(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_allows_renarration() {
        let h = Harness::new();
        h.render("1", "again");

        h.dispatcher.notify(MessageEvent::new("1", Origin::Character));
        advance(1100).await;
        h.dispatcher.reset();
        assert_eq!(h.dispatcher.last_dispatched(Origin::Character), None);

        h.dispatcher.notify(MessageEvent::new("1", Origin::Character));
        advance(1100).await;
        assert_eq!(h.speaker.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_timers() {
        let h = Harness::new();
        h.render("1", "never spoken");

        h.dispatcher.notify(MessageEvent::new("1", Origin::Character));
        h.dispatcher.shutdown();
        advance(2000).await;
        assert!(h.speaker.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn observed_messages_are_handled_once() {
        let h = Harness::new();

        h.dispatcher
            .observed(MessageId::from("0"), Origin::Character, "\"Hi\" she said".into());
        h.dispatcher
            .observed(MessageId::from("0"), Origin::Character, "\"Hi\" she said".into());
        h.dispatcher
            .observed(MessageId::from("1"), Origin::User, "user words".into());
        advance(10).await;

        assert_eq!(
            h.speaker.calls(),
            vec![(Origin::Character, "\"Hi\" she said".into(), ExtractMode::Full)]
        );
    }
}
