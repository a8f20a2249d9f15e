//! Speakable-text extraction from chat messages.
//!
//! A message is narrated either in full (no markers configured), as the
//! concatenation of the segments found between the configured start/end
//! markers, or not at all (markers configured but nothing matched).

use regex::Regex;
use serde::Serialize;
use tracing::warn;

/// How a message should be narrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractMode {
    Marked,
    Full,
    Skip,
}

impl std::fmt::Display for ExtractMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Marked => write!(f, "marked"),
            Self::Full => write!(f, "full"),
            Self::Skip => write!(f, "skip"),
        }
    }
}

/// Result of [`extract`]. `text` is `None` exactly when `mode` is `Skip`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Extraction {
    pub text: Option<String>,
    pub mode: ExtractMode,
}

impl Extraction {
    fn full(message: &str) -> Self {
        Self {
            text: Some(message.to_string()),
            mode: ExtractMode::Full,
        }
    }

    fn skip() -> Self {
        Self {
            text: None,
            mode: ExtractMode::Skip,
        }
    }
}

/// Start/end delimiters around speakable text. Never trimmed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Markers {
    pub start: String,
    pub end: String,
}

impl Markers {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Both markers must be non-empty for extraction to apply.
    pub fn is_configured(&self) -> bool {
        !self.start.is_empty() && !self.end.is_empty()
    }
}

/// Decide which part of `message` should be spoken.
pub fn extract(message: &str, markers: &Markers) -> Extraction {
    if !markers.is_configured() {
        return Extraction::full(message);
    }

    let segments = if markers.start == markers.end {
        symmetric_segments(message, &markers.start)
    } else {
        delimited_segments(message, &markers.start, &markers.end)
    };

    if segments.is_empty() {
        return Extraction::skip();
    }

    Extraction {
        text: Some(segments.join(" ")),
        mode: ExtractMode::Marked,
    }
}

/// Same marker on both sides (e.g. `"`): every occurrence flips in/out.
///
/// Splitting on the marker puts the inside text at odd indices. An odd part
/// that is also the last part was opened but never closed, so it is dropped.
fn symmetric_segments<'a>(message: &'a str, marker: &str) -> Vec<&'a str> {
    let parts: Vec<&str> = message.split(marker).collect();
    let closed = parts.len().saturating_sub(1);

    parts
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 2 == 1 && *i < closed)
        .map(|(_, part)| part.trim())
        .filter(|part| !part.is_empty())
        .collect()
}

/// Distinct start/end markers: leftmost-first, non-greedy, single-line spans.
fn delimited_segments<'a>(message: &'a str, start: &str, end: &str) -> Vec<&'a str> {
    let pattern = format!("{}(.*?){}", regex::escape(start), regex::escape(end));
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(e) => {
            // Escaped literals always compile unless the pattern blows the size limit.
            warn!("Marker pattern rejected: {e}");
            return Vec::new();
        }
    };

    re.captures_iter(message)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|text| !text.is_empty())
        .collect()
}
