pub mod jsonl;

use std::path::Path;

use thiserror::Error;

use crate::config::Config;
use crate::pipeline::events::PageOutcome;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Ledger of per-row conversion outcomes.
pub trait OutcomeSink: Send + Sync {
    fn record_outcome(&self, outcome: &PageOutcome) -> Result<(), MetadataError>;
    fn flush(&self) -> Result<(), MetadataError>;
}

/// Sink used when the outcome ledger is disabled.
pub struct DryRunSink;

impl OutcomeSink for DryRunSink {
    fn record_outcome(&self, _outcome: &PageOutcome) -> Result<(), MetadataError> {
        Ok(())
    }
    fn flush(&self) -> Result<(), MetadataError> {
        Ok(())
    }
}

pub fn build_sink(
    cfg: &Config,
    config_hash: &str,
    state_dir: &Path,
) -> Result<Box<dyn OutcomeSink>, MetadataError> {
    if !cfg.outcome_log {
        return Ok(Box::new(DryRunSink));
    }
    Ok(Box::new(jsonl::JsonlSink::new(
        env!("CARGO_PKG_VERSION"),
        config_hash,
        state_dir,
    )?))
}
