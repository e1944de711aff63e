//! # Statistics Module
//!
//! Collects counters describing a run: how many requests were enqueued,
//! dispatched, succeeded, failed, retried, or dropped; the distribution of
//! response status codes; how items fared in the pipelines.
//!
//! All counters are atomics so every task updates them without locking. A
//! consistent snapshot backs both the JSON export and the `Display`
//! end-of-run summary.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

// Snapshot of the counters, taken once per report so the presentation
// paths agree with each other.
struct StatsSnapshot {
    requests_enqueued: usize,
    requests_dispatched: usize,
    requests_succeeded: usize,
    requests_failed: usize,
    requests_retried: usize,
    requests_dropped: usize,
    responses_received: usize,
    total_bytes_downloaded: usize,
    items_dispatched: usize,
    items_completed: usize,
    items_dropped: usize,
    response_status_counts: HashMap<u16, usize>,
    elapsed: Duration,
}

impl StatsSnapshot {
    fn requests_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.requests_dispatched as f64 / secs
        } else {
            0.0
        }
    }

    fn formatted_bytes(&self) -> String {
        const KB: usize = 1024;
        const MB: usize = 1024 * KB;
        const GB: usize = 1024 * MB;

        if self.total_bytes_downloaded >= GB {
            format!("{:.2} GB", self.total_bytes_downloaded as f64 / GB as f64)
        } else if self.total_bytes_downloaded >= MB {
            format!("{:.2} MB", self.total_bytes_downloaded as f64 / MB as f64)
        } else if self.total_bytes_downloaded >= KB {
            format!("{:.2} KB", self.total_bytes_downloaded as f64 / KB as f64)
        } else {
            format!("{} B", self.total_bytes_downloaded)
        }
    }
}

/// Run-wide engine counters.
#[derive(Debug, serde::Serialize)]
pub struct StatCollector {
    #[serde(skip)]
    pub start_time: Instant,

    pub requests_enqueued: AtomicUsize,
    pub requests_dispatched: AtomicUsize,
    pub requests_succeeded: AtomicUsize,
    pub requests_failed: AtomicUsize,
    pub requests_retried: AtomicUsize,
    pub requests_dropped: AtomicUsize,

    pub responses_received: AtomicUsize,
    pub response_status_counts: dashmap::DashMap<u16, usize>,
    pub total_bytes_downloaded: AtomicUsize,

    pub items_dispatched: AtomicUsize,
    pub items_completed: AtomicUsize,
    pub items_dropped: AtomicUsize,
}

impl StatCollector {
    pub(crate) fn new() -> Self {
        StatCollector {
            start_time: Instant::now(),
            requests_enqueued: AtomicUsize::new(0),
            requests_dispatched: AtomicUsize::new(0),
            requests_succeeded: AtomicUsize::new(0),
            requests_failed: AtomicUsize::new(0),
            requests_retried: AtomicUsize::new(0),
            requests_dropped: AtomicUsize::new(0),
            responses_received: AtomicUsize::new(0),
            response_status_counts: dashmap::DashMap::new(),
            total_bytes_downloaded: AtomicUsize::new(0),
            items_dispatched: AtomicUsize::new(0),
            items_completed: AtomicUsize::new(0),
            items_dropped: AtomicUsize::new(0),
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        let mut status_counts = HashMap::new();
        for entry in self.response_status_counts.iter() {
            let (key, value) = entry.pair();
            status_counts.insert(*key, *value);
        }

        StatsSnapshot {
            requests_enqueued: self.requests_enqueued.load(Ordering::SeqCst),
            requests_dispatched: self.requests_dispatched.load(Ordering::SeqCst),
            requests_succeeded: self.requests_succeeded.load(Ordering::SeqCst),
            requests_failed: self.requests_failed.load(Ordering::SeqCst),
            requests_retried: self.requests_retried.load(Ordering::SeqCst),
            requests_dropped: self.requests_dropped.load(Ordering::SeqCst),
            responses_received: self.responses_received.load(Ordering::SeqCst),
            total_bytes_downloaded: self.total_bytes_downloaded.load(Ordering::SeqCst),
            items_dispatched: self.items_dispatched.load(Ordering::SeqCst),
            items_completed: self.items_completed.load(Ordering::SeqCst),
            items_dropped: self.items_dropped.load(Ordering::SeqCst),
            response_status_counts: status_counts,
            elapsed: self.start_time.elapsed(),
        }
    }

    pub(crate) fn increment_requests_enqueued(&self) {
        self.requests_enqueued.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_dispatched(&self) {
        self.requests_dispatched.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_succeeded(&self) {
        self.requests_succeeded.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_retried(&self) {
        self.requests_retried.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_dropped(&self) {
        self.requests_dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn add_requests_dropped(&self, count: usize) {
        self.requests_dropped.fetch_add(count, Ordering::SeqCst);
    }

    pub(crate) fn record_response(&self, status: u16, body_len: usize) {
        self.responses_received.fetch_add(1, Ordering::SeqCst);
        *self.response_status_counts.entry(status).or_insert(0) += 1;
        self.total_bytes_downloaded
            .fetch_add(body_len, Ordering::SeqCst);
    }

    pub(crate) fn increment_items_dispatched(&self) {
        self.items_dispatched.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_items_completed(&self) {
        self.items_completed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_items_dropped(&self) {
        self.items_dropped.fetch_add(1, Ordering::SeqCst);
    }

    /// Serializes the counters as JSON.
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Serializes the counters as pretty-printed JSON.
    pub fn to_json_string_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for StatCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StatCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();

        writeln!(f, "\nRun Statistics")?;
        writeln!(f, "--------------")?;
        writeln!(f, "  duration : {:?}", snapshot.elapsed)?;
        writeln!(f, "  speed    : {:.2} req/s", snapshot.requests_per_second())?;
        writeln!(
            f,
            "  requests : enqueued: {}, dispatched: {}, ok: {}, fail: {}, retry: {}, drop: {}",
            snapshot.requests_enqueued,
            snapshot.requests_dispatched,
            snapshot.requests_succeeded,
            snapshot.requests_failed,
            snapshot.requests_retried,
            snapshot.requests_dropped
        )?;
        writeln!(
            f,
            "  response : received: {}, downloaded: {}",
            snapshot.responses_received,
            snapshot.formatted_bytes()
        )?;
        writeln!(
            f,
            "  items    : dispatched: {}, completed: {}, dropped: {}",
            snapshot.items_dispatched, snapshot.items_completed, snapshot.items_dropped
        )?;

        let status_string = if snapshot.response_status_counts.is_empty() {
            "none".to_string()
        } else {
            let mut entries: Vec<_> = snapshot.response_status_counts.iter().collect();
            entries.sort_by_key(|(code, _)| **code);
            entries
                .iter()
                .map(|(code, count)| format!("{}: {}", code, count))
                .collect::<Vec<String>>()
                .join(", ")
        };

        writeln!(f, "  status   : {}", status_string)
    }
}
