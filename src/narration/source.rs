//! Where message text comes from: host pushes or the host's chat log.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

/// Opaque host message id. The host may send it as a JSON string or number;
/// both forms normalize to the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<usize> for MessageId {
    fn from(index: usize) -> Self {
        Self(index.to_string())
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Unsigned(u64),
            Signed(i64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Unsigned(n) => Self(n.to_string()),
            Raw::Signed(n) => Self(n.to_string()),
            Raw::Text(s) => Self(s),
        })
    }
}

/// Who authored a message. Each origin has its own auto-narration flag and
/// settle delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Character,
    User,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Character => write!(f, "character"),
            Self::User => write!(f, "user"),
        }
    }
}

/// A "message became available" notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub id: MessageId,
    pub origin: Origin,
}

impl MessageEvent {
    pub fn new(id: impl Into<MessageId>, origin: Origin) -> Self {
        Self {
            id: id.into(),
            origin,
        }
    }
}

/// Read access to the current rendered text of a message.
pub trait MessageSource: Send + Sync {
    /// `None` when the message is unknown or has no text.
    fn message_text(&self, id: &MessageId) -> Option<String>;

    /// Called once the dispatcher has taken its read of `id`.
    fn release(&self, _id: &MessageId) {}
}

/// Most renders kept at once; the oldest id is evicted beyond this.
const RENDERED_CAPACITY: usize = 256;

/// Rendered message bodies pushed by the host. Later pushes for the same id
/// overwrite earlier ones, so a read after the settle delay sees the most
/// complete render. Entries are dropped once read for narration.
pub struct RenderedMessages {
    inner: Mutex<Rendered>,
    capacity: usize,
}

#[derive(Default)]
struct Rendered {
    texts: HashMap<MessageId, String>,
    order: VecDeque<MessageId>,
}

impl Default for RenderedMessages {
    fn default() -> Self {
        Self::with_capacity(RENDERED_CAPACITY)
    }
}

impl RenderedMessages {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Rendered::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn upsert(&self, id: MessageId, text: String) {
        let mut rendered = self.lock();
        if rendered.texts.insert(id.clone(), text).is_none() {
            rendered.order.push_back(id);
        }
        while rendered.order.len() > self.capacity {
            if let Some(oldest) = rendered.order.pop_front() {
                debug!("Evicting unread render of message {oldest}");
                rendered.texts.remove(&oldest);
            }
        }
    }

    pub fn remove(&self, id: &MessageId) -> Option<String> {
        let mut rendered = self.lock();
        let text = rendered.texts.remove(id)?;
        rendered.order.retain(|known| known != id);
        Some(text)
    }

    pub fn len(&self) -> usize {
        self.lock().texts.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Rendered> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MessageSource for RenderedMessages {
    fn message_text(&self, id: &MessageId) -> Option<String> {
        self.lock().texts.get(id).filter(|text| !text.is_empty()).cloned()
    }

    fn release(&self, id: &MessageId) {
        self.remove(id);
    }
}

/// One message line of a SillyTavern-style JSONL chat log.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChatMessage {
    pub name: String,
    pub is_user: bool,
    pub mes: String,
}

impl ChatMessage {
    pub fn origin(&self) -> Origin {
        if self.is_user {
            Origin::User
        } else {
            Origin::Character
        }
    }
}

/// The host's chat log on disk. Message ids are zero-based indexes into the
/// message lines, skipping the metadata header line.
#[derive(Debug, Clone)]
pub struct ChatLog {
    path: PathBuf,
}

impl ChatLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// All messages currently in the log.
    pub fn read(&self) -> std::io::Result<Vec<ChatMessage>> {
        let contents = fs::read_to_string(&self.path)?;
        Ok(parse_chat_log(&contents))
    }
}

impl MessageSource for ChatLog {
    fn message_text(&self, id: &MessageId) -> Option<String> {
        let index: usize = id.as_str().parse().ok()?;
        let messages = match self.read() {
            Ok(m) => m,
            Err(e) => {
                debug!("Chat log {} unreadable: {e}", self.path.display());
                return None;
            }
        };
        messages
            .into_iter()
            .nth(index)
            .map(|m| m.mes)
            .filter(|text| !text.is_empty())
    }
}

/// Parse JSONL chat content. Lines without a `mes` field (the metadata
/// header) and unparseable lines are not messages.
pub fn parse_chat_log(contents: &str) -> Vec<ChatMessage> {
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<serde_json::Value>(line) {
            Ok(value) if value.get("mes").is_some() => serde_json::from_value(value).ok(),
            Ok(_) => None,
            Err(e) => {
                debug!("Skipping malformed chat line: {e}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAT: &str = r#"{"user_name":"You","character_name":"Seraphina","chat_metadata":{}}
{"name":"Seraphina","is_user":false,"mes":"*smiles* \"Welcome back.\""}
{"name":"You","is_user":true,"mes":"Hi!"}
"#;

    #[test]
    fn message_id_accepts_numbers_and_strings() {
        let from_number: MessageId = serde_json::from_str("12").unwrap();
        let from_string: MessageId = serde_json::from_str("\"12\"").unwrap();
        let negative: MessageId = serde_json::from_str("-3").unwrap();
        assert_eq!(from_number, from_string);
        assert_eq!(from_number, MessageId::from(12usize));
        assert_eq!(negative.as_str(), "-3");
        assert!(serde_json::from_str::<MessageId>("true").is_err());
    }

    #[test]
    fn rendered_messages_keep_latest_render() {
        let store = RenderedMessages::new();
        let id = MessageId::from("7");
        store.upsert(id.clone(), "partial".into());
        store.upsert(id.clone(), "partial and complete".into());
        assert_eq!(store.message_text(&id).as_deref(), Some("partial and complete"));

        store.upsert(MessageId::from("8"), String::new());
        assert_eq!(store.message_text(&MessageId::from("8")), None);
        assert_eq!(store.message_text(&MessageId::from("9")), None);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn rendered_messages_evict_oldest_beyond_capacity() {
        let store = RenderedMessages::with_capacity(2);
        store.upsert(MessageId::from("1"), "one".into());
        store.upsert(MessageId::from("2"), "two".into());
        store.upsert(MessageId::from("1"), "one again".into());
        store.upsert(MessageId::from("3"), "three".into());

        assert_eq!(store.len(), 2);
        assert_eq!(store.message_text(&MessageId::from("1")), None);
        assert_eq!(store.message_text(&MessageId::from("3")).as_deref(), Some("three"));

        store.release(&MessageId::from("2"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn parses_chat_log_skipping_header() {
        let messages = parse_chat_log(CHAT);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].origin(), Origin::Character);
        assert_eq!(messages[1].origin(), Origin::User);
        assert_eq!(messages[1].mes, "Hi!");
    }

    #[test]
    fn chat_log_serves_text_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.jsonl");
        fs::write(&path, CHAT).unwrap();

        let log = ChatLog::new(&path);
        assert!(log.exists());
        assert_eq!(log.message_text(&MessageId::from(1usize)).as_deref(), Some("Hi!"));
        assert_eq!(log.message_text(&MessageId::from(2usize)), None);
        assert_eq!(log.message_text(&MessageId::from("abc")), None);

        let missing = ChatLog::new(dir.path().join("missing.jsonl"));
        assert!(!missing.exists());
        assert_eq!(missing.message_text(&MessageId::from(0usize)), None);
    }
}
