//! # Pipeline Workers
//!
//! A long-running activity runs on its own thread behind a [`Worker`]. The
//! thread receives a [`StopToken`] and must check it at least once a second;
//! results leave the thread only through channels.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::constants::STOP_CHECK_INTERVAL_MS;

/// Cooperative cancellation handle passed into worker bodies.
#[derive(Debug, Clone)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
    /// Observed but never written; stopping this token leaves it untouched.
    parent: Option<Arc<AtomicBool>>,
}

impl StopToken {
    pub fn new(flag: Arc<AtomicBool>) -> Self {
        Self { flag, parent: None }
    }

    /// A token with its own flag that also reports stopped once `parent` is set.
    pub fn linked(parent: Arc<AtomicBool>) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(parent),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
            || self
                .parent
                .as_ref()
                .is_some_and(|p| p.load(Ordering::Relaxed))
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Sleep for `total`, waking at least once a second to check the flag.
    /// Returns `false` if a stop was requested before the time elapsed.
    pub fn sleep(&self, total: Duration) -> bool {
        let slice = Duration::from_millis(STOP_CHECK_INTERVAL_MS);
        let deadline = Instant::now() + total;
        loop {
            if self.is_stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(slice));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Joined,
    /// The thread did not finish within the grace period and was left behind.
    Detached,
}

/// Clears the running flag when the worker body returns or unwinds.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Worker {
    name: String,
    stop: StopToken,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<F>(name: &str, body: F) -> Self
    where
        F: FnOnce(StopToken) + Send + 'static,
    {
        Self::spawn_with_token(name, StopToken::new(Arc::new(AtomicBool::new(false))), body)
    }

    /// Spawn a worker that also stops when `parent` (e.g. the Ctrl+C flag) is
    /// set. Stopping the worker never sets `parent`.
    pub fn spawn_with_flag<F>(name: &str, parent: Arc<AtomicBool>, body: F) -> Self
    where
        F: FnOnce(StopToken) + Send + 'static,
    {
        Self::spawn_with_token(name, StopToken::linked(parent), body)
    }

    fn spawn_with_token<F>(name: &str, stop: StopToken, body: F) -> Self
    where
        F: FnOnce(StopToken) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let token = stop.clone();
        let guard_flag = running.clone();
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let _guard = RunningGuard(guard_flag);
                debug!("worker {thread_name} started");
                body(token);
                debug!("worker {thread_name} exited");
            });
        let handle = match handle {
            Ok(h) => Some(h),
            Err(err) => {
                warn!("failed to spawn worker {name}: {err}");
                running.store(false, Ordering::Release);
                None
            }
        };
        Self {
            name: name.to_string(),
            stop,
            running,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    pub fn request_stop(&self) {
        self.stop.request_stop();
    }

    /// Wait for the thread to exit on its own, without requesting a stop.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("worker {} panicked", self.name);
            }
        }
    }

    /// Request a stop, wait up to `grace`, then detach if the thread is stuck.
    pub fn shutdown(mut self, grace: Duration) -> ShutdownOutcome {
        self.stop.request_stop();
        let Some(handle) = self.handle.take() else {
            return ShutdownOutcome::Joined;
        };
        let deadline = Instant::now() + grace;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                warn!("worker {} panicked", self.name);
            }
            ShutdownOutcome::Joined
        } else {
            warn!(
                "worker {} did not stop within {:?}; detaching",
                self.name, grace
            );
            ShutdownOutcome::Detached
        }
    }
}
