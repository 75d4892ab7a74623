//! # Pipeline Events
//!
//! Everything a conversion run reports leaves through these events.

use std::path::PathBuf;

use serde::Serialize;

use crate::acquire::ContentSource;

/// One row handed to the conversion pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingItem {
    /// Unique within a run; URLs may repeat across rows.
    pub row: usize,
    pub title: String,
    pub url: String,
}

impl PendingItem {
    pub fn new(row: usize, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            row,
            title: title.into(),
            url: url.into(),
        }
    }
}

/// Final outcome for one row.
#[derive(Debug, Clone, Serialize)]
pub struct PageOutcome {
    pub row: usize,
    pub url: String,
    pub title: String,
    pub success: bool,
    pub message: String,
    pub source: Option<ContentSource>,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub converted: usize,
    pub already_existing: usize,
    pub failed: usize,
    pub from_cache: usize,
    pub from_fetch: usize,
    /// Files written during this run.
    pub written: Vec<PathBuf>,
    pub completed_normally: bool,
}

impl RunSummary {
    pub(crate) fn record(&mut self, outcome: &PageOutcome) {
        if !outcome.success {
            self.failed += 1;
            return;
        }
        match outcome.source {
            Some(source) => {
                self.converted += 1;
                match source {
                    ContentSource::Cache => self.from_cache += 1,
                    ContentSource::DirectFetch => self.from_fetch += 1,
                }
                if let Some(path) = &outcome.path {
                    self.written.push(path.clone());
                }
            }
            None => self.already_existing += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Progress { percent: u8, status: String },
    PageFinished(PageOutcome),
    /// Terminal event; `normal` is false when the run was stopped early.
    Finished { normal: bool, summary: RunSummary },
}
