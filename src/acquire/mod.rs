//! # Acquisition Coordinator
//!
//! Owns the set of wanted URLs and recovers their HTML, first from the browser
//! cache and then, as a fallback, by re-fetching the page. Each registration
//! is delivered at most once, to the channel that registered it.
//!
//! Per URL: `Unregistered -> Watched -> (Delivered | Abandoned)`; a delivered
//! or abandoned URL may be registered again to start a new cycle.

pub mod watch;

use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Sender, select};
use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::constants::{DEFAULT_FETCH_WORKERS, STOP_CHECK_INTERVAL_MS};
use crate::fetch::PageFetcher;
use crate::pipeline::workers::{StopToken, Worker};
use crate::scanner::{CacheScanner, collect_cache_files};

/// How a page's HTML was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContentSource {
    Cache,
    DirectFetch,
}

impl ContentSource {
    pub fn label(&self) -> &'static str {
        match self {
            ContentSource::Cache => "cache",
            ContentSource::DirectFetch => "direct fetch",
        }
    }
}

impl std::fmt::Display for ContentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone)]
pub enum AcquisitionEvent {
    Delivered {
        url: String,
        html: String,
        source: ContentSource,
    },
    /// Cache and fallback fetch both came up empty; the URL stays watched.
    Unresolved { url: String },
}

pub type Registrant = Sender<AcquisitionEvent>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Watch {
    registrant: Registrant,
    generation: u64,
}

/// URLs currently awaiting delivery, each with its registrant.
///
/// Every registration gets a fresh generation number, so work started for an
/// earlier registration of the same URL can tell that it is stale.
#[derive(Default)]
pub struct WatchSet {
    inner: Mutex<HashMap<String, Watch>>,
    next_generation: AtomicU64,
}

impl WatchSet {
    /// Watch `url` for `registrant`, replacing any earlier registration.
    /// Returns the generation of this registration.
    pub fn register(&self, url: &str, registrant: Registrant) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner).insert(
            url.to_string(),
            Watch {
                registrant,
                generation,
            },
        );
        generation
    }

    pub fn unregister(&self, url: &str) -> bool {
        lock(&self.inner).remove(url).is_some()
    }

    /// Remove the URL and hand back its registrant, if it was watched.
    pub fn take(&self, url: &str) -> Option<Registrant> {
        lock(&self.inner).remove(url).map(|w| w.registrant)
    }

    /// Whether `url` is still watched under the registration `generation`.
    pub fn is_current(&self, url: &str, generation: u64) -> bool {
        lock(&self.inner)
            .get(url)
            .is_some_and(|w| w.generation == generation)
    }

    pub fn contains(&self, url: &str) -> bool {
        lock(&self.inner).contains_key(url)
    }

    pub fn urls(&self) -> Vec<String> {
        lock(&self.inner).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }

    /// Tell the registrant that `url` could not be acquired, unless the URL
    /// was abandoned or registered again since `generation` was handed out.
    fn report_unresolved(&self, url: &str, generation: u64) -> bool {
        let inner = lock(&self.inner);
        match inner.get(url) {
            Some(w) if w.generation == generation => {
                let _ = w.registrant.try_send(AcquisitionEvent::Unresolved {
                    url: url.to_string(),
                });
                true
            }
            _ => false,
        }
    }
}

struct Shared {
    watch: WatchSet,
    scanner: CacheScanner,
    fetcher: Option<Arc<dyn PageFetcher>>,
    fetch_workers: usize,
    roots: Vec<(PathBuf, bool)>,
    index: Mutex<BTreeSet<PathBuf>>,
    indexed: AtomicBool,
    /// The cache monitor's stop flag, once it has been started.
    stop_flag: OnceCell<Arc<AtomicBool>>,
    /// Set when the cache monitor exits.
    stopped: AtomicBool,
}

#[derive(Clone)]
pub struct AcquisitionCoordinator {
    shared: Arc<Shared>,
}

impl AcquisitionCoordinator {
    pub fn new(
        scanner: CacheScanner,
        roots: Vec<(PathBuf, bool)>,
        fetcher: Option<Arc<dyn PageFetcher>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                watch: WatchSet::default(),
                scanner,
                fetcher,
                fetch_workers: DEFAULT_FETCH_WORKERS,
                roots,
                index: Mutex::new(BTreeSet::new()),
                indexed: AtomicBool::new(false),
                stop_flag: OnceCell::new(),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn from_config(cfg: &Config, fetcher: Option<Arc<dyn PageFetcher>>) -> Self {
        let fetcher = if cfg.fetch_fallback { fetcher } else { None };
        Self::new(CacheScanner::from_config(cfg), cfg.cache_roots(), fetcher)
            .with_fetch_workers(cfg.fetch_workers)
    }

    /// Cap on concurrent fallback fetches per batch. Call before sharing the
    /// coordinator; clones made earlier keep the old value.
    pub fn with_fetch_workers(mut self, workers: usize) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.fetch_workers = workers.max(1),
            None => warn!("coordinator already shared; keeping {} fetch workers", self.shared.fetch_workers),
        }
        self
    }

    pub fn register_url(&self, url: &str, registrant: &Registrant) {
        self.register_batch(&[url.to_string()], registrant);
    }

    /// Watch `urls` for `registrant` and start a quick look for them: an
    /// incremental scan of the indexed cache files (testing only these URLs),
    /// then a fallback fetch for whatever the cache did not yield.
    pub fn register_batch(&self, urls: &[String], registrant: &Registrant) {
        let fresh: Vec<(String, u64)> = urls
            .iter()
            .map(|url| (url.clone(), self.shared.watch.register(url, registrant.clone())))
            .collect();
        if fresh.is_empty() {
            return;
        }
        debug!("registered {} urls ({} watched)", fresh.len(), self.shared.watch.len());

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("acquire-batch".to_string())
            .spawn(move || shared.acquire_batch(fresh));
        if let Err(err) = spawned {
            warn!("failed to start acquisition for batch: {err}");
        }
    }

    /// Hand `html` to the URL's registrant; a no-op unless the URL is watched.
    pub fn deliver(&self, url: &str, html: String, source: ContentSource) -> bool {
        self.shared.deliver(url, html, source)
    }

    /// Give up on a URL without delivering anything.
    pub fn unregister(&self, url: &str) -> bool {
        self.shared.watch.unregister(url)
    }

    pub fn is_watched(&self, url: &str) -> bool {
        self.shared.watch.contains(url)
    }

    pub fn watched(&self) -> Vec<String> {
        self.shared.watch.urls()
    }

    /// Test one cache file against every watched URL.
    pub fn process_path(&self, path: &Path) -> usize {
        self.shared.process_path(path)
    }

    /// Walk every cache root and test all files against the watched URLs.
    pub fn full_scan(&self, token: &StopToken) -> usize {
        self.shared.full_scan(token)
    }

    /// Run the long-lived cache monitor: filesystem listener, one full scan,
    /// then service change events until stopped.
    pub fn start(&self, stop_flag: Arc<AtomicBool>) -> Worker {
        if self.shared.stop_flag.set(stop_flag.clone()).is_err() {
            warn!("cache monitor started twice; batch work follows the first stop flag");
        }
        let shared = self.shared.clone();
        Worker::spawn_with_flag("cache-monitor", stop_flag, move |token| {
            let (fs_tx, fs_rx) = crossbeam_channel::unbounded::<PathBuf>();
            // Held so the channel never disconnects when no watcher could start.
            let _keepalive = fs_tx.clone();
            let watcher = match watch::build_watcher(&shared.roots, fs_tx) {
                Ok(w) => Some(w),
                Err(err) => {
                    warn!("cache watcher unavailable, relying on scans only: {err}");
                    None
                }
            };

            let delivered = shared.full_scan(&token);
            info!("initial cache scan delivered {delivered} pages");

            let ticker = crossbeam_channel::tick(Duration::from_millis(STOP_CHECK_INTERVAL_MS));
            while !token.is_stopped() {
                select! {
                    recv(fs_rx) -> msg => {
                        if let Ok(path) = msg {
                            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                                shared.process_path(&path)
                            }));
                            if outcome.is_err() {
                                warn!("cache monitor fault while scanning {}", path.display());
                            }
                        }
                    }
                    recv(ticker) -> _ => {}
                }
            }

            drop(watcher);
            shared.stopped.store(true, Ordering::Release);
            info!("cache monitor stopped");
        })
    }
}

impl Shared {
    fn deliver(&self, url: &str, html: String, source: ContentSource) -> bool {
        let Some(registrant) = self.watch.take(url) else {
            debug!("dropping {source} content for unwatched {url}");
            return false;
        };
        let event = AcquisitionEvent::Delivered {
            url: url.to_string(),
            html,
            source,
        };
        if registrant.send(event).is_err() {
            debug!("registrant for {url} is gone");
        }
        true
    }

    fn process_path(&self, path: &Path) -> usize {
        lock(&self.index).insert(path.to_path_buf());
        let urls = self.watch.urls();
        self.deliver_hits(path, &urls)
    }

    fn deliver_hits(&self, path: &Path, urls: &[String]) -> usize {
        if urls.is_empty() {
            return 0;
        }
        self.scanner
            .scan_file(path, urls)
            .into_iter()
            .filter(|hit| self.deliver(&hit.url, hit.html.clone(), ContentSource::Cache))
            .count()
    }

    fn full_scan(&self, token: &StopToken) -> usize {
        let files = collect_cache_files(&self.roots, &|| token.is_stopped());
        debug!("full cache scan over {} files", files.len());
        {
            let mut index = lock(&self.index);
            index.extend(files.iter().cloned());
        }
        self.indexed.store(true, Ordering::Release);

        let mut delivered = 0;
        for path in &files {
            if token.is_stopped() {
                break;
            }
            let urls = self.watch.urls();
            if urls.is_empty() {
                break;
            }
            delivered += self.deliver_hits(path, &urls);
        }
        delivered
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
            || self
                .stop_flag
                .get()
                .is_some_and(|f| f.load(Ordering::Relaxed))
    }

    fn indexed_files(&self) -> Vec<PathBuf> {
        if !self.indexed.swap(true, Ordering::AcqRel) {
            let files = collect_cache_files(&self.roots, &|| self.is_stopped());
            lock(&self.index).extend(files);
        }
        lock(&self.index).iter().cloned().collect()
    }

    fn acquire_batch(&self, registered: Vec<(String, u64)>) {
        let mut pending = registered;
        let mut urls: Vec<String> = pending.iter().map(|(u, _)| u.clone()).collect();
        for path in self.indexed_files() {
            if self.is_stopped() {
                debug!("batch acquisition stopped during cache scan");
                return;
            }
            let before = pending.len();
            pending.retain(|(u, g)| self.watch.is_current(u, *g));
            if pending.is_empty() {
                return;
            }
            if pending.len() != before {
                urls = pending.iter().map(|(u, _)| u.clone()).collect();
            }
            self.deliver_hits(&path, &urls);
        }
        pending.retain(|(u, g)| self.watch.is_current(u, *g));
        if pending.is_empty() || self.is_stopped() {
            return;
        }

        let Some(fetcher) = &self.fetcher else {
            debug!("{} urls not in cache; fallback fetch disabled", pending.len());
            return;
        };
        self.fetch_pending(fetcher.as_ref(), pending);
    }

    /// Fetch `pending` on up to `fetch_workers` threads pulling from a shared
    /// queue. URLs abandoned or registered again in the meantime are skipped.
    fn fetch_pending(&self, fetcher: &dyn PageFetcher, pending: Vec<(String, u64)>) {
        let workers = self.fetch_workers.clamp(1, pending.len());
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<(String, u64)>();
        for job in pending {
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        thread::scope(|scope| {
            for i in 0..workers {
                let job_rx = job_rx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("fetch-{i}"))
                    .spawn_scoped(scope, move || {
                        for (url, generation) in job_rx.iter() {
                            if self.is_stopped() {
                                break;
                            }
                            if !self.watch.is_current(&url, generation) {
                                continue;
                            }
                            match fetcher.fetch(&url) {
                                Some(html) => {
                                    self.deliver(&url, html, ContentSource::DirectFetch);
                                }
                                None => {
                                    self.watch.report_unresolved(&url, generation);
                                }
                            }
                        }
                    });
                if let Err(err) = spawned {
                    warn!("failed to start fetch worker {i}: {err}");
                }
            }
        });
    }
}
