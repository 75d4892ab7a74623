use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde::Serialize;

use crate::metadata::{MetadataError, OutcomeSink};
use crate::pipeline::events::PageOutcome;

pub const OUTCOMES_FILE: &str = "outcomes.jsonl";

/// Appends one JSON object per outcome to `<state_dir>/outcomes.jsonl`.
pub struct JsonlSink {
    tool_version: String,
    config_hash: String,
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

#[derive(Serialize)]
struct OutcomeRecord<'a> {
    #[serde(flatten)]
    outcome: &'a PageOutcome,
    timestamp: String,
    tool_version: &'a str,
    config_hash: &'a str,
}

impl JsonlSink {
    pub fn new(
        tool_version: &str,
        config_hash: &str,
        state_dir: &Path,
    ) -> Result<Self, MetadataError> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(OUTCOMES_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            tool_version: tool_version.to_string(),
            config_hash: config_hash.to_string(),
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&self) -> MutexGuard<'_, BufWriter<File>> {
        self.writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl OutcomeSink for JsonlSink {
    fn record_outcome(&self, outcome: &PageOutcome) -> Result<(), MetadataError> {
        let record = OutcomeRecord {
            outcome,
            timestamp: Utc::now().to_rfc3339(),
            tool_version: &self.tool_version,
            config_hash: &self.config_hash,
        };
        let mut guard = self.writer();
        serde_json::to_writer(&mut *guard, &record)?;
        guard.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&self) -> Result<(), MetadataError> {
        self.writer().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::ContentSource;

    fn outcome(row: usize, success: bool) -> PageOutcome {
        PageOutcome {
            row,
            url: format!("https://example.com/{row}"),
            title: "Example".to_string(),
            success,
            message: if success { "converted" } else { "not cached" }.to_string(),
            source: success.then_some(ContentSource::DirectFetch),
            path: None,
        }
    }

    #[test]
    fn appends_one_line_per_outcome() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = JsonlSink::new("0.1.0", "abc123", dir.path()).expect("sink");
        sink.record_outcome(&outcome(0, true)).expect("record");
        sink.record_outcome(&outcome(1, false)).expect("record");
        sink.flush().expect("flush");
        drop(sink);

        let reopened = JsonlSink::new("0.1.0", "abc123", dir.path()).expect("sink");
        reopened.record_outcome(&outcome(2, true)).expect("record");
        reopened.flush().expect("flush");

        let text = std::fs::read_to_string(reopened.path()).expect("read");
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).expect("json"))
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["source"], "DirectFetch");
        assert_eq!(lines[1]["message"], "not cached");
        assert!(lines[1]["source"].is_null());
        assert_eq!(lines[2]["config_hash"], "abc123");
        assert!(lines[2]["timestamp"].as_str().is_some());
    }
}
