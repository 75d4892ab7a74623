mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;

use histmark::acquire::AcquisitionCoordinator;
use histmark::fetch::PageFetcher;
use histmark::history::{HistoryMonitor, HistoryStore};
use histmark::output::ProcessedUrls;
use histmark::pipeline::events::{PendingItem, PipelineEvent};
use histmark::pipeline::workers::ShutdownOutcome;
use histmark::pipeline::{ConversionPipeline, PipelineSettings};

use common::{Fixture, ScriptedFetcher, create_history};

#[test]
fn stop_mid_batch_finishes_abnormally() {
    let mut fx = Fixture::new();
    fx.cfg.batch_wait_ms = 30_000;
    let fetcher = Arc::new(ScriptedFetcher {
        delay: Duration::from_secs(2),
        ..ScriptedFetcher::default()
    });
    let fetcher_dyn: Arc<dyn PageFetcher> = fetcher.clone();
    let coordinator = AcquisitionCoordinator::from_config(&fx.cfg, Some(fetcher_dyn));
    let pipeline = ConversionPipeline::new(
        coordinator.clone(),
        ProcessedUrls::default(),
        PipelineSettings::from_config(&fx.cfg),
    );

    let items: Vec<PendingItem> = (0..30)
        .map(|i| PendingItem::new(i, format!("Slow {i}"), format!("https://slow.test/{i}")))
        .collect();
    let cancel = Arc::new(AtomicBool::new(false));
    let (tx, rx) = unbounded();
    let worker = pipeline.spawn(items, tx, cancel.clone());

    std::thread::sleep(Duration::from_millis(200));
    let stopped_at = Instant::now();
    cancel.store(true, Ordering::SeqCst);

    let mut finished = None;
    let mut percents = Vec::new();
    while let Ok(event) = rx.recv_timeout(Duration::from_secs(5)) {
        match event {
            PipelineEvent::Finished { normal, summary } => {
                assert!(!summary.completed_normally);
                finished = Some(normal);
                break;
            }
            PipelineEvent::Progress { percent, .. } => percents.push(percent),
            PipelineEvent::PageFinished(_) => {}
        }
    }
    assert_eq!(finished, Some(false));
    assert!(stopped_at.elapsed() < Duration::from_secs(3));
    assert!(!percents.contains(&100));
    assert_eq!(worker.shutdown(Duration::from_secs(3)), ShutdownOutcome::Joined);
    assert!(coordinator.watched().is_empty());
}

#[test]
fn finished_conversions_leave_shared_cancel_flag_clear() {
    let fx = Fixture::new();
    let cancel = Arc::new(AtomicBool::new(false));
    let coordinator = AcquisitionCoordinator::from_config(&fx.cfg, None);
    let monitor = coordinator.start(cancel.clone());
    let pipeline = ConversionPipeline::new(
        coordinator,
        ProcessedUrls::default(),
        PipelineSettings::from_config(&fx.cfg),
    );

    for _ in 0..2 {
        let (tx, rx) = unbounded();
        let worker = pipeline.spawn(Vec::new(), tx, cancel.clone());
        let finished = rx
            .iter()
            .find_map(|e| match e {
                PipelineEvent::Finished { normal, .. } => Some(normal),
                _ => None,
            });
        assert_eq!(finished, Some(true));
        assert_eq!(worker.shutdown(Duration::from_secs(3)), ShutdownOutcome::Joined);
        assert!(!cancel.load(Ordering::SeqCst));
    }

    assert!(monitor.is_running());
    assert_eq!(monitor.shutdown(Duration::from_secs(3)), ShutdownOutcome::Joined);
    assert!(!cancel.load(Ordering::SeqCst));
}

#[test]
fn cache_monitor_stops_within_grace() {
    let fx = Fixture::new();
    let coordinator = AcquisitionCoordinator::from_config(&fx.cfg, None);
    let worker = coordinator.start(Arc::new(AtomicBool::new(false)));
    std::thread::sleep(Duration::from_millis(100));
    assert!(worker.is_running());

    let started = Instant::now();
    assert_eq!(worker.shutdown(Duration::from_secs(3)), ShutdownOutcome::Joined);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[test]
fn history_monitor_stops_during_long_interval() {
    let fx = Fixture::new();
    create_history(&fx.cfg.history_path, &[("https://a.test/", "A", 100)]);
    let store = HistoryStore::from_config(&fx.cfg);
    let (tx, _rx) = unbounded();
    let worker = HistoryMonitor::new(store, Duration::from_secs(600), HashSet::new()).spawn(tx);
    std::thread::sleep(Duration::from_millis(200));

    let started = Instant::now();
    assert_eq!(worker.shutdown(Duration::from_secs(3)), ShutdownOutcome::Joined);
    assert!(started.elapsed() < Duration::from_secs(3));
    let leftovers = std::fs::read_dir(&fx.cfg.temp_dir).map(|d| d.count()).unwrap_or(0);
    assert_eq!(leftovers, 0);
}
