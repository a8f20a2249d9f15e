//! narrator-hook: forwards one host render event to tavern-narrator.
//!
//! Reads `{"event": "...", "id": ..., "text": "..."}` from stdin and posts
//! it to the running service's event feed. Exits silently when the service
//! is down. Logs all events to ~/.narrator-hook-history/YYYY-MM-DD.jsonl.

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_API: &str = "http://127.0.0.1:8768";

const EVENTS: &[&str] = &["character_message_rendered", "user_message_rendered"];

// --- Event JSON from the host ---

#[derive(Deserialize)]
struct HookEvent {
    event: Option<String>,
    /// String or number; passed through untouched.
    id: Option<Value>,
    text: Option<String>,
}

#[derive(Serialize)]
struct RenderedEvent<'a> {
    id: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

// --- History record ---

#[derive(Serialize)]
struct HistoryRecord {
    timestamp: String,
    event: String,
    action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text_chars: Option<usize>,
    duration_ms: u64,
    api_up: bool,
}

fn history_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".narrator-hook-history")
}

fn save_record(record: &HistoryRecord) {
    let dir = history_dir();
    let _ = fs::create_dir_all(&dir);

    // Date from timestamp (first 10 chars: YYYY-MM-DD)
    let date = &record.timestamp[..10];
    let path = dir.join(format!("{date}.jsonl"));

    if let Ok(json) = serde_json::to_string(record) {
        if let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{json}");
        }
    }
}

fn now_timestamp() -> String {
    chrono::Local::now()
        .format("%Y-%m-%dT%H:%M:%S%.3f")
        .to_string()
}

fn elapsed_ms(t0: Instant) -> u64 {
    u64::try_from(t0.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let t0 = Instant::now();

    let mut input = String::new();
    if std::io::stdin().read_to_string(&mut input).is_err() {
        return;
    }

    let Ok(event) = serde_json::from_str::<HookEvent>(&input) else {
        return;
    };
    let (Some(event_name), Some(id)) = (event.event, event.id) else {
        return;
    };

    let api = std::env::var("TAVERN_NARRATOR_URL").unwrap_or_else(|_| DEFAULT_API.into());
    let text_chars = event.text.as_ref().map(|t| t.chars().count());
    let record = |action: &str, detail: Option<String>, api_up: bool| HistoryRecord {
        timestamp: now_timestamp(),
        event: event_name.clone(),
        action: action.into(),
        detail,
        text_chars,
        duration_ms: elapsed_ms(t0),
        api_up,
    };

    if !EVENTS.contains(&event_name.as_str()) {
        save_record(&record("ignored", Some("unknown event".into()), false));
        return;
    }

    // Short timeouts: the host must never wait on narration
    let client = Client::builder()
        .connect_timeout(Duration::from_millis(300))
        .timeout(Duration::from_secs(3))
        .build()
        .unwrap_or_else(|_| Client::new());

    // Quick connectivity check; exit cleanly if the service is down
    if client.get(format!("{api}/status")).send().await.is_err() {
        save_record(&record("skipped", Some("service unreachable".into()), false));
        return;
    }

    let body = RenderedEvent {
        id: &id,
        text: event.text.as_deref(),
    };
    let result = client
        .post(format!("{api}/events/{event_name}"))
        .json(&body)
        .send()
        .await;

    match result {
        Ok(resp) if resp.status().is_success() => {
            save_record(&record("forwarded", Some(format!("id={id}")), true));
        }
        Ok(resp) => {
            let detail = format!("HTTP {}", resp.status());
            save_record(&record("rejected", Some(detail), true));
        }
        Err(e) => {
            save_record(&record("failed", Some(e.to_string()), true));
        }
    }
}
