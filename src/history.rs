//! # History Store
//!
//! Reads the browser's visit history from a private snapshot and detects
//! visits that happened since the last poll.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::parsers::browser::VisitRecord;
use crate::parsers::sqlite_db;
use crate::pipeline::workers::Worker;
use crate::snapshot::{SnapshotError, SourceSnapshot};

#[derive(Debug, Clone)]
pub struct HistoryStore {
    history_path: PathBuf,
    temp_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResult {
    pub records: Vec<VisitRecord>,
    /// Newest visit time examined; feed it back into the next poll.
    pub watermark: i64,
}

impl HistoryStore {
    pub fn new(history_path: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            history_path: history_path.into(),
            temp_dir: temp_dir.into(),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.history_path.clone(), cfg.temp_dir.clone())
    }

    pub fn history_path(&self) -> &Path {
        &self.history_path
    }

    /// The `limit` most recent visits, newest first.
    pub fn snapshot(&self, limit: usize) -> Result<Vec<VisitRecord>, SnapshotError> {
        let snap = SourceSnapshot::take(&self.history_path, &self.temp_dir, "history")?;
        let conn = snap.open()?;
        let records = sqlite_db::read_recent_visits(&conn, limit)?;
        debug!("history snapshot returned {} records", records.len());
        Ok(records)
    }

    /// Visits newer than `watermark` whose URL is not in `seen`.
    ///
    /// Without a watermark, the current maximum visit time becomes the
    /// watermark and nothing is returned, so startup never replays history.
    pub fn poll_new(
        &self,
        watermark: Option<i64>,
        seen: &HashSet<String>,
    ) -> Result<PollResult, SnapshotError> {
        let snap = SourceSnapshot::take(&self.history_path, &self.temp_dir, "history_poll")?;
        let conn = snap.open()?;

        let Some(watermark) = watermark else {
            let max = sqlite_db::max_visit_time(&conn)?.unwrap_or(0);
            debug!("history watermark established at {max}");
            return Ok(PollResult {
                records: Vec::new(),
                watermark: max,
            });
        };

        let examined = sqlite_db::read_visits_since(&conn, watermark)?;
        let next_watermark = examined
            .iter()
            .map(|r| r.visit_time_raw)
            .fold(watermark, i64::max);

        let mut emitted = HashSet::new();
        let records = examined
            .into_iter()
            .filter(|r| !seen.contains(&r.url) && emitted.insert(r.url.clone()))
            .collect();

        Ok(PollResult {
            records,
            watermark: next_watermark,
        })
    }
}

#[derive(Debug, Clone)]
pub enum HistoryEvent {
    NewRecords(Vec<VisitRecord>),
    /// A poll failed; the monitor keeps running and retries.
    Error { reason: String, message: String },
}

/// Background poller that emits newly visited URLs.
pub struct HistoryMonitor {
    store: HistoryStore,
    interval: Duration,
    seen: HashSet<String>,
}

impl HistoryMonitor {
    pub fn new(store: HistoryStore, interval: Duration, seen: HashSet<String>) -> Self {
        Self {
            store,
            interval,
            seen,
        }
    }

    pub fn spawn(self, tx: Sender<HistoryEvent>) -> Worker {
        let HistoryMonitor {
            store,
            interval,
            mut seen,
        } = self;
        Worker::spawn("history-monitor", move |token| {
            info!("history monitor started (interval {:?})", interval);
            let mut watermark = None;
            while !token.is_stopped() {
                match store.poll_new(watermark, &seen) {
                    Ok(result) => {
                        watermark = Some(result.watermark);
                        if !result.records.is_empty() {
                            seen.extend(result.records.iter().map(|r| r.url.clone()));
                            info!("history monitor found {} new records", result.records.len());
                            if tx.send(HistoryEvent::NewRecords(result.records)).is_err() {
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        warn!("history poll failed: {err}");
                        let event = HistoryEvent::Error {
                            reason: err.reason().to_string(),
                            message: err.to_string(),
                        };
                        if tx.send(event).is_err() {
                            break;
                        }
                        if !token.sleep(Duration::from_secs(1)) {
                            break;
                        }
                        continue;
                    }
                }
                if !token.sleep(interval) {
                    break;
                }
            }
            info!("history monitor stopped");
        })
    }
}
