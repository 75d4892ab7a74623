//! # Conversion Pipeline
//!
//! Turns history rows into Markdown files. Rows are processed in fixed-size
//! batches: each batch is registered with the [`AcquisitionCoordinator`], the
//! pipeline waits a bounded time for deliveries (converting each as it
//! arrives), and whatever is still outstanding is reported "not cached".
//! The pipeline never blocks on a single URL beyond the batch wait.

pub mod events;
mod limiter;
pub mod workers;

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender, unbounded};
use tracing::{debug, info, warn};

use crate::acquire::{AcquisitionCoordinator, AcquisitionEvent, ContentSource};
use crate::config::Config;
use crate::constants::STOP_CHECK_INTERVAL_MS;
use crate::metadata::OutcomeSink;
use crate::output::{self, ProcessedUrls};

use events::{PageOutcome, PendingItem, PipelineEvent, RunSummary};
use limiter::ProgressThrottle;
use workers::{StopToken, Worker};

pub const ALREADY_EXISTS: &str = "already exists";
pub const NOT_CACHED: &str = "not cached";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub save_dir: PathBuf,
    pub batch_size: usize,
    pub batch_wait: Duration,
    pub progress_every: usize,
}

impl PipelineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            save_dir: cfg.save_dir.clone(),
            batch_size: cfg.batch_size,
            batch_wait: cfg.batch_wait(),
            progress_every: cfg.progress_every,
        }
    }
}

#[derive(Clone)]
pub struct ConversionPipeline {
    coordinator: AcquisitionCoordinator,
    processed: ProcessedUrls,
    settings: PipelineSettings,
    ledger: Option<Arc<dyn OutcomeSink>>,
}

/// Per-run bookkeeping: outcome emission, progress and the summary.
struct RunState<'a> {
    events: &'a Sender<PipelineEvent>,
    ledger: Option<&'a dyn OutcomeSink>,
    throttle: ProgressThrottle,
    summary: RunSummary,
}

impl RunState<'_> {
    fn finish(&mut self, outcome: PageOutcome) {
        if let Some(ledger) = self.ledger {
            if let Err(err) = ledger.record_outcome(&outcome) {
                warn!("failed to record outcome for row {}: {err}", outcome.row);
            }
        }
        self.summary.record(&outcome);
        let _ = self.events.send(PipelineEvent::PageFinished(outcome));
        if let Some(percent) = self.throttle.record() {
            self.progress(percent);
        }
    }

    fn flush_progress(&mut self) {
        if let Some(percent) = self.throttle.flush() {
            self.progress(percent);
        }
    }

    fn progress(&self, percent: u8) {
        let status = format!(
            "{}/{} processed",
            self.throttle.completed(),
            self.summary.total
        );
        let _ = self.events.send(PipelineEvent::Progress { percent, status });
    }
}

impl ConversionPipeline {
    pub fn new(
        coordinator: AcquisitionCoordinator,
        processed: ProcessedUrls,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            coordinator,
            processed,
            settings,
            ledger: None,
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn OutcomeSink>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn processed(&self) -> &ProcessedUrls {
        &self.processed
    }

    /// Run the conversion on its own worker thread.
    pub fn spawn(
        &self,
        items: Vec<PendingItem>,
        events: Sender<PipelineEvent>,
        stop_flag: Arc<AtomicBool>,
    ) -> Worker {
        let pipeline = self.clone();
        Worker::spawn_with_flag("conversion", stop_flag, move |token| {
            pipeline.run(items, &events, &token);
        })
    }

    /// Convert `items`, reporting through `events`. Always ends with
    /// [`PipelineEvent::Finished`].
    pub fn run(
        &self,
        items: Vec<PendingItem>,
        events: &Sender<PipelineEvent>,
        token: &StopToken,
    ) -> RunSummary {
        let total = items.len();
        let mut state = RunState {
            events,
            ledger: self.ledger.as_deref(),
            throttle: ProgressThrottle::new(total, self.settings.progress_every),
            summary: RunSummary {
                total,
                ..RunSummary::default()
            },
        };
        info!("converting {total} pages into {}", self.settings.save_dir.display());

        let (acq_tx, acq_rx) = unbounded::<AcquisitionEvent>();
        let mut stopped = false;
        for (index, batch) in items.chunks(self.settings.batch_size.max(1)).enumerate() {
            if token.is_stopped() {
                stopped = true;
                break;
            }
            for stale in acq_rx.try_iter() {
                debug!("dropping late acquisition event {stale:?}");
            }
            debug!("batch {index}: {} items", batch.len());
            stopped = !self.run_batch(batch, &acq_tx, &acq_rx, token, &mut state);
            state.flush_progress();
            if stopped {
                break;
            }
        }
        if total == 0 {
            state.flush_progress();
        }

        if let Some(ledger) = state.ledger {
            if let Err(err) = ledger.flush() {
                warn!("failed to flush outcome ledger: {err}");
            }
        }
        let mut summary = state.summary;
        summary.completed_normally = !stopped;
        info!(
            "conversion {}: {} converted ({} cache, {} fetch), {} already existed, {} failed",
            if stopped { "stopped" } else { "finished" },
            summary.converted,
            summary.from_cache,
            summary.from_fetch,
            summary.already_existing,
            summary.failed
        );
        let _ = events.send(PipelineEvent::Finished {
            normal: !stopped,
            summary: summary.clone(),
        });
        summary
    }

    /// Returns `false` if the batch was cut short by a stop request.
    fn run_batch(
        &self,
        batch: &[PendingItem],
        acq_tx: &Sender<AcquisitionEvent>,
        acq_rx: &crossbeam_channel::Receiver<AcquisitionEvent>,
        token: &StopToken,
        state: &mut RunState<'_>,
    ) -> bool {
        let mut pending: HashMap<String, Vec<&PendingItem>> = HashMap::new();
        for item in batch {
            let path = output::output_path(&self.settings.save_dir, &item.title, &item.url);
            if path.exists() || self.processed.contains(&item.url) {
                state.finish(outcome(item, true, ALREADY_EXISTS, None, Some(path)));
                continue;
            }
            pending.entry(item.url.clone()).or_default().push(item);
        }
        if pending.is_empty() {
            return true;
        }

        let urls: Vec<String> = pending.keys().cloned().collect();
        self.coordinator.register_batch(&urls, acq_tx);

        let deadline = Instant::now() + self.settings.batch_wait;
        let tick = Duration::from_millis(STOP_CHECK_INTERVAL_MS);
        let mut unresolved: HashSet<String> = HashSet::new();
        let mut completed = true;
        while pending.len() > unresolved.len() {
            if token.is_stopped() {
                completed = false;
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match acq_rx.recv_timeout(remaining.min(tick)) {
                Ok(AcquisitionEvent::Delivered { url, html, source }) => {
                    let Some(items) = pending.remove(&url) else {
                        debug!("dropping delivery for {url}: not pending");
                        continue;
                    };
                    unresolved.remove(&url);
                    for item in items {
                        state.finish(self.convert(item, &html, source));
                    }
                }
                Ok(AcquisitionEvent::Unresolved { url }) => {
                    if pending.contains_key(&url) {
                        unresolved.insert(url);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let mut leftovers: Vec<&PendingItem> = Vec::new();
        for (url, items) in pending.drain() {
            self.coordinator.unregister(&url);
            leftovers.extend(items);
        }
        if !completed {
            return false;
        }
        leftovers.sort_by_key(|item| item.row);
        for item in leftovers {
            state.finish(outcome(item, false, NOT_CACHED, None, None));
        }
        true
    }

    fn convert(&self, item: &PendingItem, html: &str, source: ContentSource) -> PageOutcome {
        let written = panic::catch_unwind(AssertUnwindSafe(|| {
            output::write_markdown(&self.settings.save_dir, &item.title, &item.url, source, html)
        }));
        match written {
            Ok(Ok(path)) => {
                self.processed.insert(item.url.clone());
                outcome(item, true, &format!("saved from {source}"), Some(source), Some(path))
            }
            Ok(Err(err)) => {
                warn!("conversion failed for {}: {err}", item.url);
                outcome(item, false, &err.to_string(), Some(source), None)
            }
            Err(_) => {
                warn!("conversion fault for {}", item.url);
                outcome(item, false, "conversion fault", Some(source), None)
            }
        }
    }
}

fn outcome(
    item: &PendingItem,
    success: bool,
    message: &str,
    source: Option<ContentSource>,
    path: Option<PathBuf>,
) -> PageOutcome {
    PageOutcome {
        row: item.row,
        url: item.url.clone(),
        title: item.title.clone(),
        success,
        message: message.to_string(),
        source,
        path,
    }
}
