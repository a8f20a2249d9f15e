//! Speech output for narration.
//!
//! Architecture:
//! 1. `client`: HTTP calls to the speech API (synthesis and voice management)
//! 2. `player`: rodio playback with stop
//! 3. `narrator`: the `Speaker` used by the dispatcher, plus manual speak
//! 4. `history`: per-day JSONL narration records

pub mod client;
pub mod history;
pub mod narrator;
pub mod player;

pub use client::{SpeakOptions, VoiceUpload, PRESET_VOICES};
pub use history::NarrationHistory;
pub use narrator::Narrator;
