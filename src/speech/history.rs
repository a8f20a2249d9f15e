//! Narration history and reporting.
//!
//! Stores one JSONL record per narration attempt at
//! ~/.tavern-narrator-history/{date}.jsonl.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Synthesized and played.
    Spoke,
    /// Synthesized without playback.
    Synthesized,
    /// Dropped because another narration was in flight.
    Busy,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrationRecord {
    pub timestamp: String,
    /// `character`, `user` or `manual`.
    pub source: String,
    pub mode: String,
    pub input_chars: usize,
    pub voice: String,
    pub outcome: Outcome,
    pub tts_latency_ms: i64,
    pub playback_duration_ms: i64,
    pub error: Option<String>,
}

impl NarrationRecord {
    pub fn new(source: &str, mode: &str, text: &str, voice: &str) -> Self {
        Self {
            timestamp: Local::now().to_rfc3339(),
            source: source.to_string(),
            mode: mode.to_string(),
            input_chars: text.chars().count(),
            voice: voice.to_string(),
            outcome: Outcome::Failed,
            tts_latency_ms: 0,
            playback_duration_ms: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NarrationHistory {
    dir: PathBuf,
}

impl NarrationHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.tavern-narrator-history`, or `None` without a home directory.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".tavern-narrator-history"))
    }

    fn file(&self, date: &str) -> PathBuf {
        self.dir.join(format!("{date}.jsonl"))
    }

    pub fn save(&self, record: &NarrationRecord) {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!("Failed to create narration history dir: {e}");
            return;
        }

        let date = Local::now().format("%Y-%m-%d").to_string();
        let mut file = match fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file(&date))
        {
            Ok(f) => f,
            Err(e) => {
                warn!("Failed to open narration history file: {e}");
                return;
            }
        };

        match serde_json::to_string(record) {
            Ok(line) => {
                if let Err(e) = writeln!(file, "{line}") {
                    warn!("Failed to write narration record: {e}");
                }
            }
            Err(e) => warn!("Failed to serialize narration record: {e}"),
        }
    }

    pub fn load(&self, date: &str) -> Vec<NarrationRecord> {
        let Ok(contents) = fs::read_to_string(self.file(date)) else {
            return Vec::new();
        };

        contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    pub fn list_dates(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut dates: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.strip_suffix(".jsonl").map(str::to_string)
            })
            .collect();
        dates.sort();
        dates
    }

    pub fn report(&self, date: &str) -> String {
        let records = self.load(date);
        if records.is_empty() {
            return format!("No narrations for {date}.");
        }

        let total = records.len();
        let count = |outcome: Outcome| records.iter().filter(|r| r.outcome == outcome).count();
        let synthesized: Vec<&NarrationRecord> = records
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Spoke | Outcome::Synthesized))
            .collect();
        let avg_tts = if synthesized.is_empty() {
            0.0
        } else {
            synthesized.iter().map(|r| r.tts_latency_ms as f64).sum::<f64>()
                / synthesized.len() as f64
        };
        let chars: usize = synthesized.iter().map(|r| r.input_chars).sum();

        let mut by_source = BTreeMap::new();
        for r in &records {
            *by_source.entry(r.source.as_str()).or_insert(0) += 1;
        }

        let mut report = format!(
            "# Narration Report for {date}\n\n\
            - Total attempts: {total}\n\
            - Spoken: {}\n\
            - Synthesized only: {}\n\
            - Dropped (busy): {}\n\
            - Failed: {}\n\
            - Characters synthesized: {chars}\n\
            - Avg TTS latency: {avg_tts:.0}ms\n\n\
            ## Sources\n",
            count(Outcome::Spoke),
            count(Outcome::Synthesized),
            count(Outcome::Busy),
            count(Outcome::Failed),
        );

        for (source, n) in &by_source {
            report.push_str(&format!("- {source}: {n}\n"));
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(source: &str, outcome: Outcome, latency: i64) -> NarrationRecord {
        NarrationRecord {
            outcome,
            tts_latency_ms: latency,
            ..NarrationRecord::new(source, "full", "hello", "alex")
        }
    }

    #[test]
    fn saves_and_loads_todays_records() {
        let dir = tempfile::tempdir().unwrap();
        let history = NarrationHistory::new(dir.path().join("history"));
        history.save(&record("character", Outcome::Spoke, 300));
        history.save(&record("user", Outcome::Busy, 0));

        let today = Local::now().format("%Y-%m-%d").to_string();
        assert_eq!(history.list_dates(), vec![today.clone()]);

        let records = history.load(&today);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].outcome, Outcome::Spoke);
        assert_eq!(records[0].input_chars, 5);
        assert_eq!(records[1].source, "user");
    }

    #[test]
    fn report_summarizes_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let history = NarrationHistory::new(dir.path());
        history.save(&record("character", Outcome::Spoke, 200));
        history.save(&record("character", Outcome::Synthesized, 400));
        history.save(&record("manual", Outcome::Failed, 0));

        let today = Local::now().format("%Y-%m-%d").to_string();
        let report = history.report(&today);
        assert!(report.contains("Total attempts: 3"));
        assert!(report.contains("Spoken: 1"));
        assert!(report.contains("Failed: 1"));
        assert!(report.contains("Characters synthesized: 10"));
        assert!(report.contains("Avg TTS latency: 300ms"));
        assert!(report.contains("- character: 2"));
        assert!(report.contains("- manual: 1"));
    }

    #[test]
    fn missing_history_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let history = NarrationHistory::new(dir.path().join("absent"));
        assert!(history.list_dates().is_empty());
        assert_eq!(history.report("2024-01-01"), "No narrations for 2024-01-01.");
    }
}
