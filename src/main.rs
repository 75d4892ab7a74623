use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use crossbeam_channel::{RecvTimeoutError, bounded, unbounded};
use tracing::{info, warn};

use histmark::acquire::AcquisitionCoordinator;
use histmark::config::Config;
use histmark::constants::{CHANNEL_CAPACITY, STOP_CHECK_INTERVAL_MS};
use histmark::cookies::CookieVault;
use histmark::fetch::{FetchPolicy, HttpFetcher, PageFetcher};
use histmark::history::{HistoryEvent, HistoryMonitor, HistoryStore};
use histmark::output::ProcessedUrls;
use histmark::parsers::browser::VisitRecord;
use histmark::pipeline::events::{PendingItem, PipelineEvent, RunSummary};
use histmark::pipeline::workers::Worker;
use histmark::pipeline::{ConversionPipeline, PipelineSettings};
use histmark::upload::IndexUploader;
use histmark::{cli, config, logging, metadata, util};

fn main() -> Result<()> {
    logging::init_logging();

    let cli_opts = cli::parse();
    let loaded = config::load_config(cli_opts.config.as_deref())?;
    let mut cfg = loaded.config;
    cli_opts.apply(&mut cfg);

    if cli_opts.check {
        let report = util::check_source_access(&cfg);
        println!("{}", report.message);
        if !report.ok {
            bail!("history is not accessible ({})", report.reason);
        }
        return Ok(());
    }

    util::ensure_output_dir(&cfg.save_dir)?;
    info!(
        "starting history={} save_dir={} limit={} monitor={} config_hash={}",
        cfg.history_path.display(),
        cfg.save_dir.display(),
        cfg.record_limit,
        cfg.monitor_enabled,
        loaded.config_hash
    );

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!("failed to install Ctrl+C handler: {err}");
    }

    let fetcher: Option<Arc<dyn PageFetcher>> = if cfg.fetch_fallback {
        let vault = CookieVault::from_config(&cfg);
        match HttpFetcher::new(&cfg, Some(vault), FetchPolicy::from_config(&cfg)) {
            Ok(f) => Some(Arc::new(f)),
            Err(err) => {
                warn!("fallback fetch disabled: {err}");
                None
            }
        }
    } else {
        None
    };

    let coordinator = AcquisitionCoordinator::from_config(&cfg, fetcher);
    let cache_worker = coordinator.start(cancel.clone());

    let processed = ProcessedUrls::load(&cfg.save_dir);
    let ledger = metadata::build_sink(&cfg, &loaded.config_hash, &cfg.state_dir())?;
    let pipeline = ConversionPipeline::new(
        coordinator,
        processed.clone(),
        PipelineSettings::from_config(&cfg),
    )
    .with_ledger(Arc::from(ledger));

    let uploader = if cfg.index.enabled {
        match IndexUploader::from_config(&cfg) {
            Ok(u) => Some(u),
            Err(err) => {
                warn!("upload disabled: {err}");
                None
            }
        }
    } else {
        None
    };

    let store = HistoryStore::from_config(&cfg);
    let records = match store.snapshot(cfg.record_limit) {
        Ok(records) => records,
        Err(err) => {
            println!("cannot read history: {err}");
            println!("{}", err.remediation());
            shutdown(&cfg, vec![cache_worker]);
            bail!("history is not accessible ({})", err.reason());
        }
    };
    info!("history snapshot: {} records", records.len());

    let mut seen: HashSet<String> = processed.to_set();
    seen.extend(records.iter().map(|r| r.url.clone()));

    let mut next_row = 0;
    let items = to_items(&records, &mut next_row);
    let summary = drive_conversion(&cfg, &pipeline, items, &cancel);
    report(&summary);
    upload_written(uploader.as_ref(), &summary);

    let mut workers = vec![cache_worker];
    if cfg.monitor_enabled && !cancel.load(Ordering::SeqCst) {
        let (history_tx, history_rx) = bounded(CHANNEL_CAPACITY);
        let monitor = HistoryMonitor::new(store, cfg.poll_interval(), seen).spawn(history_tx);
        info!("monitoring history every {:?}; Ctrl+C to stop", cfg.poll_interval());

        let tick = Duration::from_millis(STOP_CHECK_INTERVAL_MS);
        while !cancel.load(Ordering::SeqCst) {
            match history_rx.recv_timeout(tick) {
                Ok(HistoryEvent::NewRecords(mut records)) => {
                    // Whatever arrived during the previous run is queued behind it.
                    records.extend(history_rx.try_iter().filter_map(|e| match e {
                        HistoryEvent::NewRecords(r) => Some(r),
                        HistoryEvent::Error { .. } => None,
                    }).flatten());
                    let items = to_items(&records, &mut next_row);
                    let summary = drive_conversion(&cfg, &pipeline, items, &cancel);
                    report(&summary);
                    upload_written(uploader.as_ref(), &summary);
                }
                Ok(HistoryEvent::Error { reason, message }) => {
                    warn!("history poll failed ({reason}): {message}");
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        workers.push(monitor);
    }

    shutdown(&cfg, workers);
    info!("histmark finished");
    Ok(())
}

fn to_items(records: &[VisitRecord], next_row: &mut usize) -> Vec<PendingItem> {
    records
        .iter()
        .map(|r| {
            let item = PendingItem::new(*next_row, r.title.clone(), r.url.clone());
            *next_row += 1;
            item
        })
        .collect()
}

/// Run one conversion on a worker and print its per-row outcomes.
fn drive_conversion(
    cfg: &Config,
    pipeline: &ConversionPipeline,
    items: Vec<PendingItem>,
    cancel: &Arc<AtomicBool>,
) -> RunSummary {
    let (tx, rx) = unbounded();
    let worker = pipeline.spawn(items, tx, cancel.clone());
    let tick = Duration::from_millis(STOP_CHECK_INTERVAL_MS);
    let mut summary = RunSummary::default();
    loop {
        match rx.recv_timeout(tick) {
            Ok(PipelineEvent::Progress { percent, status }) => {
                info!("progress {percent}% ({status})");
            }
            Ok(PipelineEvent::PageFinished(outcome)) => {
                let mark = if outcome.success { "ok " } else { "err" };
                println!("[{mark}] #{} {} ({})", outcome.row, outcome.url, outcome.message);
            }
            Ok(PipelineEvent::Finished { normal, summary: s }) => {
                if !normal {
                    warn!("conversion stopped before completion");
                }
                summary = s;
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                if cancel.load(Ordering::SeqCst) || !worker.is_running() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    worker.shutdown(cfg.stop_grace());
    summary
}

fn report(summary: &RunSummary) {
    println!(
        "{} rows: {} converted ({} from cache, {} by direct fetch), {} already existed, {} failed",
        summary.total,
        summary.converted,
        summary.from_cache,
        summary.from_fetch,
        summary.already_existing,
        summary.failed
    );
}

fn upload_written(uploader: Option<&IndexUploader>, summary: &RunSummary) {
    let Some(uploader) = uploader else {
        return;
    };
    if summary.written.is_empty() {
        return;
    }
    let outcomes = uploader.upload_files(&summary.written);
    let failed: Vec<_> = outcomes.iter().filter(|o| !o.success).collect();
    println!(
        "uploaded {} of {} files",
        outcomes.len() - failed.len(),
        outcomes.len()
    );
    for outcome in failed {
        println!("  upload failed: {} ({})", outcome.path.display(), outcome.message);
    }
}

fn shutdown(cfg: &Config, workers: Vec<Worker>) {
    for worker in workers {
        let name = worker.name().to_string();
        let outcome = worker.shutdown(cfg.stop_grace());
        info!("worker {name}: {outcome:?}");
    }
}
