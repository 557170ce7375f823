//! Pool metrics: counters and request-rate tracking for the progress
//! display and the final stats print. Everything here is advisory — no
//! scheduling decision reads these numbers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const RATE_WINDOW: Duration = Duration::from_secs(1);
const RATE_SAMPLES: usize = 4096;

/// Shared counters for one scan run. Cheap to clone behind an `Arc`; the
/// pool updates it, the progress display samples it.
pub struct ScanMetrics {
    started: Instant,
    active_workers: AtomicUsize,
    submitted: AtomicU64,
    completed: AtomicU64,
    errors: AtomicU64,
    findings: AtomicU64,
    retries: AtomicU64,
    /// Completion instants inside the sliding rate window.
    recent: Mutex<VecDeque<Instant>>,
    peak_rate: Mutex<f64>,
}

/// Point-in-time view for rendering.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub active_workers: usize,
    pub submitted: u64,
    pub completed: u64,
    pub errors: u64,
    pub findings: u64,
    pub retries: u64,
    /// Completions in the last second.
    pub instant_rate: f64,
    /// Completions per second since the run started.
    pub average_rate: f64,
    pub peak_rate: f64,
    pub elapsed_secs: f64,
}

impl Default for ScanMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            active_workers: AtomicUsize::new(0),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            findings: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::with_capacity(RATE_SAMPLES)),
            peak_rate: Mutex::new(0.0),
        }
    }

    pub fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_stopped(&self) {
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retried(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finding(&self) {
        self.findings.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one finished request (success or classified error).
    pub fn completed(&self, was_error: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if was_error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }

        let now = Instant::now();
        let mut recent = self.recent.lock().expect("metrics lock");
        recent.push_back(now);
        while recent.len() > RATE_SAMPLES {
            recent.pop_front();
        }
        while recent
            .front()
            .is_some_and(|t| now.duration_since(*t) > RATE_WINDOW)
        {
            recent.pop_front();
        }
        let instant = recent.len() as f64 / RATE_WINDOW.as_secs_f64();
        drop(recent);

        let mut peak = self.peak_rate.lock().expect("metrics lock");
        if instant > *peak {
            *peak = instant;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Instant::now();
        let elapsed = now.duration_since(self.started).as_secs_f64().max(1e-6);
        let completed = self.completed.load(Ordering::Relaxed);

        let instant_rate = {
            let mut recent = self.recent.lock().expect("metrics lock");
            while recent
                .front()
                .is_some_and(|t| now.duration_since(*t) > RATE_WINDOW)
            {
                recent.pop_front();
            }
            recent.len() as f64 / RATE_WINDOW.as_secs_f64()
        };

        MetricsSnapshot {
            active_workers: self.active_workers.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            completed,
            errors: self.errors.load(Ordering::Relaxed),
            findings: self.findings.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            instant_rate,
            average_rate: completed as f64 / elapsed,
            peak_rate: *self.peak_rate.lock().expect("metrics lock"),
            elapsed_secs: elapsed,
        }
    }
}
