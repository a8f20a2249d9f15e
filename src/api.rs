//! HTTP API for tavern-narrator.
//!
//! Carries the host event feed (render events and message bodies) and the
//! control surface (manual speak, stop, settings, voices). Runs on port 8768
//! (configurable) using axum.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::narration::{MessageEvent, MessageId, NarrationDispatcher, Origin, RenderedMessages};
use crate::settings::{CustomVoice, Settings, SettingsStore};
use crate::speech::{Narrator, SpeakOptions, PRESET_VOICES};

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<NarrationDispatcher>,
    pub messages: Arc<RenderedMessages>,
    pub narrator: Arc<Narrator>,
    pub settings: SettingsStore,
}

// --- Request/Response types ---

#[derive(Deserialize)]
struct RenderedEvent {
    id: MessageId,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct MessageBody {
    text: String,
}

#[derive(Deserialize)]
struct SpeakRequest {
    text: String,
    #[serde(flatten)]
    options: SpeakOptions,
}

#[derive(Serialize)]
struct StatusResponse {
    listening: &'static str,
    narrating: bool,
    playing: bool,
    auto_play: bool,
    auto_play_user: bool,
    character_pending: bool,
    user_pending: bool,
    last_character: Option<MessageId>,
    last_user: Option<MessageId>,
    rendered_messages: usize,
}

#[derive(Serialize)]
struct PresetVoice {
    id: &'static str,
    name: &'static str,
}

#[derive(Serialize)]
struct VoicesResponse {
    model: String,
    current: String,
    presets: Vec<PresetVoice>,
    custom: Vec<CustomVoice>,
}

#[derive(Serialize)]
struct SimpleResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl SimpleResponse {
    fn ok(status: &str) -> Self {
        Self {
            status: status.into(),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            error: Some(message.into()),
        }
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(SimpleResponse::err(message))).into_response()
}

/// Build the axum router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/events/{event}", post(handle_event))
        .route("/messages/{id}", put(handle_put_message).delete(handle_delete_message))
        .route("/speak", post(handle_speak))
        .route("/stop", post(handle_stop))
        .route("/settings", get(handle_get_settings).post(handle_update_settings))
        .route("/settings/reset", post(handle_reset_settings))
        .route("/voices", get(handle_voices))
        .route("/voices/refresh", post(handle_refresh_voices))
        .route("/listener/reset", post(handle_listener_reset))
        .with_state(state)
}

/// Serve on an already-bound listener until `cancel` fires.
pub async fn serve(listener: TcpListener, state: ApiState, cancel: CancellationToken) {
    let app = router(state);
    let shutdown = async move { cancel.cancelled().await };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        warn!("API server error: {e}");
    }
    debug!("API server stopped");
}

// --- Handlers ---

async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let settings = state.settings.get();
    Json(StatusResponse {
        listening: "event_feed",
        narrating: state.narrator.is_busy(),
        playing: state.narrator.is_playing(),
        auto_play: settings.auto_play,
        auto_play_user: settings.auto_play_user,
        character_pending: state.dispatcher.is_pending(Origin::Character),
        user_pending: state.dispatcher.is_pending(Origin::User),
        last_character: state.dispatcher.last_dispatched(Origin::Character),
        last_user: state.dispatcher.last_dispatched(Origin::User),
        rendered_messages: state.messages.len(),
    })
}

async fn handle_event(
    State(state): State<ApiState>,
    Path(event): Path<String>,
    Json(req): Json<RenderedEvent>,
) -> Response {
    let origin = match event.as_str() {
        "character_message_rendered" => Origin::Character,
        "user_message_rendered" => Origin::User,
        other => {
            return (
                StatusCode::NOT_FOUND,
                Json(SimpleResponse::err(format!("Unknown event: {other}"))),
            )
                .into_response();
        }
    };

    if let Some(text) = req.text {
        state.messages.upsert(req.id.clone(), text);
    }
    state.dispatcher.notify(MessageEvent::new(req.id, origin));

    Json(SimpleResponse::ok("accepted")).into_response()
}

async fn handle_put_message(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<MessageBody>,
) -> Json<SimpleResponse> {
    state.messages.upsert(MessageId::from(id), body.text);
    Json(SimpleResponse::ok("stored"))
}

async fn handle_delete_message(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Json<SimpleResponse> {
    match state.messages.remove(&MessageId::from(id)) {
        Some(_) => Json(SimpleResponse::ok("deleted")),
        None => Json(SimpleResponse::ok("unknown")),
    }
}

async fn handle_speak(State(state): State<ApiState>, Json(req): Json<SpeakRequest>) -> Response {
    if req.text.trim().is_empty() {
        return bad_request("empty text");
    }

    let preview: String = req.text.chars().take(80).collect();
    info!(
        "HTTP /speak: \"{}{}\" ({} chars)",
        preview.replace('\n', " "),
        if req.text.chars().count() > 80 { "..." } else { "" },
        req.text.chars().count(),
    );

    // Fire-and-forget; failures surface through the notifier.
    let narrator = state.narrator.clone();
    tokio::spawn(async move {
        narrator.speak(&req.text, &req.options).await;
    });

    Json(SimpleResponse::ok("speaking")).into_response()
}

async fn handle_stop(State(state): State<ApiState>) -> Json<SimpleResponse> {
    state.narrator.stop();
    Json(SimpleResponse::ok("stopped"))
}

async fn handle_get_settings(State(state): State<ApiState>) -> Json<Settings> {
    Json(state.settings.get().redacted())
}

async fn handle_update_settings(
    State(state): State<ApiState>,
    Json(patch): Json<Value>,
) -> Response {
    match state.settings.update(patch) {
        Ok(settings) => Json(settings.redacted()).into_response(),
        Err(e) => bad_request(e.to_string()),
    }
}

async fn handle_reset_settings(State(state): State<ApiState>) -> Response {
    match state.settings.reset() {
        Ok(settings) => Json(settings.redacted()).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(SimpleResponse::err(e.to_string())),
        )
            .into_response(),
    }
}

async fn handle_voices(State(state): State<ApiState>) -> Json<VoicesResponse> {
    let settings = state.settings.get();
    Json(VoicesResponse {
        model: settings.tts_model,
        current: settings.tts_voice,
        presets: PRESET_VOICES
            .iter()
            .map(|&(id, name)| PresetVoice { id, name })
            .collect(),
        custom: settings.custom_voices,
    })
}

async fn handle_refresh_voices(State(state): State<ApiState>) -> Json<Vec<CustomVoice>> {
    Json(state.narrator.refresh_custom_voices().await)
}

async fn handle_listener_reset(State(state): State<ApiState>) -> Json<SimpleResponse> {
    state.dispatcher.reset();
    Json(SimpleResponse::ok("reset"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ExtractMode;
    use crate::narration::dispatcher::tests::RecordingSpeaker;
    use crate::narration::dispatcher::SettleDelays;
    use crate::notifier::Notifier;
    use serde_json::json;
    use std::time::Duration;

    struct TestServer {
        base: String,
        http: reqwest::Client,
        speaker: Arc<RecordingSpeaker>,
        settings: SettingsStore,
        cancel: CancellationToken,
    }

    impl TestServer {
        async fn start() -> Self {
            let settings = SettingsStore::in_memory(Settings {
                api_key: "sk-secret".into(),
                ..Settings::default()
            });
            let messages = Arc::new(RenderedMessages::new());
            let speaker = Arc::new(RecordingSpeaker::default());
            let dispatcher = NarrationDispatcher::new(
                settings.clone(),
                messages.clone(),
                speaker.clone(),
                SettleDelays {
                    character: Duration::from_millis(100),
                    user: Duration::from_millis(50),
                },
            );
            let narrator = Arc::new(Narrator::new(settings.clone(), Notifier::new(false), None));
            let state = ApiState {
                dispatcher,
                messages,
                narrator,
                settings: settings.clone(),
            };

            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            let cancel = CancellationToken::new();
            tokio::spawn(serve(listener, state, cancel.clone()));

            Self {
                base,
                http: reqwest::Client::new(),
                speaker,
                settings,
                cancel,
            }
        }

        async fn post(&self, path: &str, body: Value) -> reqwest::Response {
            self.http
                .post(format!("{}{path}", self.base))
                .json(&body)
                .send()
                .await
                .unwrap()
        }

        async fn get(&self, path: &str) -> Value {
            self.http
                .get(format!("{}{path}", self.base))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap()
        }
    }

    async fn wait(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test]
    async fn render_events_are_narrated_once() {
        let server = TestServer::start().await;

        let event = json!({ "id": 4, "text": "*waves* \"Hello, traveler.\"" });
        let resp = server.post("/events/character_message_rendered", event.clone()).await;
        assert!(resp.status().is_success());
        server.post("/events/character_message_rendered", event).await;
        wait(300).await;

        assert_eq!(
            server.speaker.calls(),
            vec![(
                Origin::Character,
                "*waves* \"Hello, traveler.\"".into(),
                ExtractMode::Full
            )]
        );

        // Same id sent as a string is the same message.
        server
            .post("/events/character_message_rendered", json!({ "id": "4" }))
            .await;
        wait(200).await;
        assert_eq!(server.speaker.calls().len(), 1);
        server.cancel.cancel();
    }

    #[tokio::test]
    async fn message_text_can_arrive_separately() {
        let server = TestServer::start().await;
        server
            .settings
            .update(json!({ "textStart": "\"", "textEnd": "\"" }))
            .unwrap();

        server
            .post("/events/character_message_rendered", json!({ "id": "m1" }))
            .await;
        let resp = server
            .http
            .put(format!("{}/messages/m1", server.base))
            .json(&json!({ "text": "She nods. \"Follow me.\" Then silence." }))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
        wait(300).await;

        assert_eq!(
            server.speaker.calls(),
            vec![(Origin::Character, "Follow me.".into(), ExtractMode::Marked)]
        );
        server.cancel.cancel();
    }

    #[tokio::test]
    async fn user_events_follow_settings_flag() {
        let server = TestServer::start().await;

        server
            .post("/events/user_message_rendered", json!({ "id": 1, "text": "hi" }))
            .await;
        wait(200).await;
        assert!(server.speaker.calls().is_empty());

        let resp = server.post("/settings", json!({ "autoPlayUser": true })).await;
        assert!(resp.status().is_success());
        server
            .post("/events/user_message_rendered", json!({ "id": 1, "text": "hi" }))
            .await;
        wait(200).await;
        assert_eq!(server.speaker.calls(), vec![(Origin::User, "hi".into(), ExtractMode::Full)]);
        server.cancel.cancel();
    }

    #[tokio::test]
    async fn unknown_event_is_rejected() {
        let server = TestServer::start().await;
        let resp = server
            .post("/events/message_deleted", json!({ "id": 1 }))
            .await;
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
        server.cancel.cancel();
    }

    #[tokio::test]
    async fn settings_are_redacted_and_validated() {
        let server = TestServer::start().await;

        let settings = server.get("/settings").await;
        assert_eq!(settings["apiKey"], "********");
        assert_eq!(settings["ttsVoice"], "alex");

        let resp = server.post("/settings", json!({ "sampleRate": "fast" })).await;
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

        let resp = server.post("/settings", json!({ "ttsVoice": "diana" })).await;
        let updated: Value = resp.json().await.unwrap();
        assert_eq!(updated["ttsVoice"], "diana");

        server.post("/settings/reset", json!({})).await;
        assert_eq!(server.settings.get(), Settings::default());
        server.cancel.cancel();
    }

    #[tokio::test]
    async fn listener_reset_allows_renarration() {
        let server = TestServer::start().await;
        let event = json!({ "id": 9, "text": "again" });

        server.post("/events/character_message_rendered", event.clone()).await;
        wait(200).await;
        server.post("/listener/reset", json!({})).await;
        server.post("/events/character_message_rendered", event).await;
        wait(200).await;

        assert_eq!(server.speaker.calls().len(), 2);
        server.cancel.cancel();
    }

    #[tokio::test]
    async fn status_and_voices_report_state() {
        let server = TestServer::start().await;
        server
            .post("/events/character_message_rendered", json!({ "id": 2, "text": "x" }))
            .await;

        let status = server.get("/status").await;
        assert_eq!(status["listening"], "event_feed");
        assert_eq!(status["playing"], false);
        assert_eq!(status["character_pending"], true);
        assert_eq!(status["rendered_messages"], 1);

        wait(200).await;
        let status = server.get("/status").await;
        assert_eq!(status["last_character"], "2");
        assert_eq!(status["character_pending"], false);

        let voices = server.get("/voices").await;
        assert_eq!(voices["presets"].as_array().unwrap().len(), 8);
        assert_eq!(voices["presets"][0]["id"], "alex");
        assert_eq!(voices["current"], "alex");
        server.cancel.cancel();
    }

    #[tokio::test]
    async fn empty_speak_is_rejected() {
        let server = TestServer::start().await;
        let resp = server.post("/speak", json!({ "text": "  " })).await;
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        server.cancel.cancel();
    }
}
