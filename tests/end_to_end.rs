mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crossbeam_channel::unbounded;

use histmark::acquire::{AcquisitionCoordinator, ContentSource};
use histmark::fetch::PageFetcher;
use histmark::history::HistoryStore;
use histmark::metadata;
use histmark::output::ProcessedUrls;
use histmark::pipeline::events::{PageOutcome, PendingItem, PipelineEvent};
use histmark::pipeline::workers::StopToken;
use histmark::pipeline::{ALREADY_EXISTS, ConversionPipeline, NOT_CACHED, PipelineSettings};

use common::{Fixture, ScriptedFetcher, cache_blob, create_history};

const URL_A: &str = "https://cached.test/article";
const URL_B: &str = "https://fetched.test/post";
const URL_C: &str = "https://gone.test/missing";

fn history_items(fx: &Fixture) -> Vec<PendingItem> {
    create_history(
        &fx.cfg.history_path,
        &[
            (URL_C, "Gone page", 13_300_000_000_000_000),
            (URL_B, "Fetched page", 13_300_000_000_000_100),
            (URL_A, "Cached page", 13_300_000_000_000_200),
        ],
    );
    let records = HistoryStore::from_config(&fx.cfg)
        .snapshot(fx.cfg.record_limit)
        .expect("history");
    records
        .iter()
        .enumerate()
        .map(|(row, r)| PendingItem::new(row, r.title.clone(), r.url.clone()))
        .collect()
}

fn build_pipeline(fx: &Fixture, fetcher: Arc<ScriptedFetcher>) -> ConversionPipeline {
    let fetcher: Arc<dyn PageFetcher> = fetcher;
    let coordinator = AcquisitionCoordinator::from_config(&fx.cfg, Some(fetcher));
    ConversionPipeline::new(
        coordinator,
        ProcessedUrls::load(&fx.cfg.save_dir),
        PipelineSettings::from_config(&fx.cfg),
    )
}

fn collect(rx: &crossbeam_channel::Receiver<PipelineEvent>) -> (Vec<PageOutcome>, Vec<u8>, Option<bool>) {
    let mut outcomes = Vec::new();
    let mut percents = Vec::new();
    let mut finished = None;
    for event in rx.try_iter() {
        match event {
            PipelineEvent::PageFinished(o) => outcomes.push(o),
            PipelineEvent::Progress { percent, .. } => percents.push(percent),
            PipelineEvent::Finished { normal, .. } => finished = Some(normal),
        }
    }
    outcomes.sort_by_key(|o| o.row);
    (outcomes, percents, finished)
}

fn token() -> StopToken {
    StopToken::new(Arc::new(AtomicBool::new(false)))
}

#[test]
fn cached_fetched_and_missing_pages() {
    let fx = Fixture::new();
    fx.cache_file("a1/f_00012a", &cache_blob(URL_A, "Recovered from cache. "));
    let items = history_items(&fx);
    assert_eq!(items[0].url, URL_A);

    let fetcher = ScriptedFetcher::with_pages(&[(
        URL_B,
        "<html><body><p>Fetched <strong>live</strong> copy</p></body></html>",
    )]);
    let pipeline = build_pipeline(&fx, fetcher.clone());
    let (tx, rx) = unbounded();
    let summary = pipeline.run(items, &tx, &token());

    let (outcomes, percents, finished) = collect(&rx);
    assert_eq!(finished, Some(true));
    assert_eq!(outcomes.len(), 3);

    assert_eq!(outcomes[0].url, URL_A);
    assert!(outcomes[0].success);
    assert_eq!(outcomes[0].source, Some(ContentSource::Cache));
    assert_eq!(outcomes[1].url, URL_B);
    assert!(outcomes[1].success);
    assert_eq!(outcomes[1].source, Some(ContentSource::DirectFetch));
    assert_eq!(outcomes[2].url, URL_C);
    assert!(!outcomes[2].success);
    assert_eq!(outcomes[2].message, NOT_CACHED);

    assert_eq!(percents.last(), Some(&100));
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.iter().filter(|p| **p == 100).count(), 1);
    assert_eq!((summary.from_cache, summary.from_fetch, summary.failed), (1, 1, 1));

    let cached = std::fs::read_to_string(fx.cfg.save_dir.join("Cached page.md")).expect("md");
    assert!(cached.starts_with(&format!("# Cached page\n\nURL: {URL_A}\nSource: cache\n")));
    assert!(cached.contains("Recovered from cache."));
    let fetched = std::fs::read_to_string(fx.cfg.save_dir.join("Fetched page.md")).expect("md");
    assert!(fetched.contains("Source: direct fetch"));
    assert!(fetched.contains("**live**"));
    assert!(!fx.cfg.save_dir.join("Gone page.md").exists());
}

#[test]
fn rerun_reports_already_exists_without_fetching() {
    let fx = Fixture::new();
    let items = history_items(&fx);
    let fetcher = ScriptedFetcher::with_pages(&[
        (URL_A, "<p>a</p>"),
        (URL_B, "<p>b</p>"),
        (URL_C, "<p>c</p>"),
    ]);

    let first = build_pipeline(&fx, fetcher.clone());
    let (tx, _rx) = unbounded();
    let summary = first.run(items.clone(), &tx, &token());
    assert_eq!(summary.from_fetch, 3);
    let calls_after_first = fetcher.calls();

    // A fresh session rebuilds the processed set from the files on disk.
    let second = build_pipeline(&fx, fetcher.clone());
    assert_eq!(second.processed().len(), 3);
    let (tx, rx) = unbounded();
    let started = std::time::Instant::now();
    second.run(items, &tx, &token());
    assert!(started.elapsed() < Duration::from_secs(2));

    let (outcomes, percents, finished) = collect(&rx);
    assert_eq!(finished, Some(true));
    assert!(outcomes.iter().all(|o| o.success && o.message == ALREADY_EXISTS));
    assert_eq!(percents.last(), Some(&100));
    assert_eq!(fetcher.calls(), calls_after_first);
}

#[test]
fn cache_monitor_and_registration_deliver_once() {
    let fx = Fixture::new();
    fx.cache_file("b2/f_0000ff", &cache_blob(URL_A, "Only one copy please. "));
    let fetcher = ScriptedFetcher::with_pages(&[]);
    let fetcher_dyn: Arc<dyn PageFetcher> = fetcher.clone();
    let coordinator = AcquisitionCoordinator::from_config(&fx.cfg, Some(fetcher_dyn));
    let monitor = coordinator.start(Arc::new(AtomicBool::new(false)));
    let pipeline = ConversionPipeline::new(
        coordinator,
        ProcessedUrls::default(),
        PipelineSettings::from_config(&fx.cfg),
    );

    let (tx, rx) = unbounded();
    let summary = pipeline.run(vec![PendingItem::new(0, "Once", URL_A)], &tx, &token());
    assert_eq!(summary.from_cache, 1);
    let (outcomes, _, _) = collect(&rx);
    assert_eq!(outcomes.len(), 1);
    assert_eq!(fetcher.calls(), 0);
    monitor.shutdown(Duration::from_secs(3));
}

#[test]
fn outcome_ledger_records_every_row() {
    let mut fx = Fixture::new();
    fx.cfg.batch_wait_ms = 200;
    let items = history_items(&fx);
    let fetcher = ScriptedFetcher::with_pages(&[(URL_B, "<p>b</p>")]);
    let ledger = metadata::build_sink(&fx.cfg, "cafebabe", &fx.cfg.state_dir()).expect("sink");
    let pipeline = build_pipeline(&fx, fetcher).with_ledger(Arc::from(ledger));

    let (tx, _rx) = unbounded();
    pipeline.run(items, &tx, &token());

    let ledger_path = fx.cfg.state_dir().join("outcomes.jsonl");
    let lines: Vec<serde_json::Value> = std::fs::read_to_string(ledger_path)
        .expect("ledger")
        .lines()
        .map(|l| serde_json::from_str(l).expect("json"))
        .collect();
    assert_eq!(lines.len(), 3);
    assert!(lines.iter().all(|l| l["config_hash"] == "cafebabe"));
    assert_eq!(lines.iter().filter(|l| l["success"] == true).count(), 1);
    // The state directory never counts as output.
    assert_eq!(ProcessedUrls::load(&fx.cfg.save_dir).len(), 1);
}

#[test]
fn untitled_rows_keep_separate_files_across_runs() {
    let fx = Fixture::new();
    create_history(
        &fx.cfg.history_path,
        &[
            ("https://untitled.test/one", "", 13_300_000_000_000_000),
            ("https://untitled.test/two", "   ", 13_300_000_000_000_100),
        ],
    );
    let records = HistoryStore::from_config(&fx.cfg)
        .snapshot(fx.cfg.record_limit)
        .expect("history");
    let items: Vec<PendingItem> = records
        .iter()
        .enumerate()
        .map(|(row, r)| PendingItem::new(row, r.title.clone(), r.url.clone()))
        .collect();
    let fetcher = ScriptedFetcher::with_pages(&[
        ("https://untitled.test/one", "<p>first page</p>"),
        ("https://untitled.test/two", "<p>second page</p>"),
    ]);

    let (tx, _rx) = unbounded();
    let first = build_pipeline(&fx, fetcher.clone()).run(items.clone(), &tx, &token());
    assert_eq!(first.converted, 2);
    let mut written = first.written.clone();
    written.sort();
    written.dedup();
    assert_eq!(written.len(), 2);
    let bodies: Vec<String> = written
        .iter()
        .map(|p| std::fs::read_to_string(p).expect("md"))
        .collect();
    assert!(bodies.iter().any(|b| b.contains("first page")));
    assert!(bodies.iter().any(|b| b.contains("second page")));

    let second = build_pipeline(&fx, fetcher).run(items, &tx, &token());
    assert_eq!(second.already_existing, 2);
    assert_eq!(second.converted, 0);
}

#[test]
fn slow_fallback_fetches_fit_inside_batch_wait() {
    let mut fx = Fixture::new();
    fx.cfg.batch_wait_ms = 1500;
    let urls: Vec<String> = (0..20).map(|i| format!("https://slow.test/{i}")).collect();
    let fetcher = Arc::new(ScriptedFetcher {
        pages: urls.iter().map(|u| (u.clone(), "<p>slow</p>".to_string())).collect(),
        delay: Duration::from_millis(200),
        ..ScriptedFetcher::default()
    });
    let pipeline = build_pipeline(&fx, fetcher.clone());
    let items: Vec<PendingItem> = urls
        .iter()
        .enumerate()
        .map(|(row, u)| PendingItem::new(row, format!("Slow {row}"), u.clone()))
        .collect();

    let (tx, _rx) = unbounded();
    let summary = pipeline.run(items, &tx, &token());
    assert_eq!(summary.from_fetch, 20);
    assert_eq!(summary.failed, 0);
    assert_eq!(fetcher.calls(), 20);
}
