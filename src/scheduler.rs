//! # Scheduler Module
//!
//! Priority queue and admission control for outbound requests.
//!
//! ## Overview
//!
//! The `Scheduler` accepts request submissions from any producer and hands
//! them to the engine's worker pool in priority order. Ordering is a
//! min-heap keyed on `(priority, sequence)`: lower priority values dispatch
//! first, and submissions with equal priority leave in FIFO order thanks to
//! the monotonic sequence number.
//!
//! ## Backpressure
//!
//! Capacity is a semaphore sized `pending_requests + concurrent_requests`.
//! A submission takes one permit and the permit travels with the queued
//! request until its dispatch completes, so producers suspend once the
//! ready queue plus the in-flight set reach capacity. `ready_queue_max_size`
//! caps the pending share when it is configured smaller.
//!
//! ## Shutdown
//!
//! `close` is idempotent: it stops intake (later submits fail with
//! `ShutdownInProgress`), wakes blocked submitters and idle workers, and
//! leaves in-flight dispatches to the engine's close timeout. Whatever is
//! still queued afterwards is dropped with a diagnostic by `drain`.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, trace};

use crate::config::SchedulerConfig;
use crate::error::EngineError;
use crate::request::Request;

/// A request admitted to the queue, carrying its capacity permit.
pub(crate) struct QueuedRequest {
    pub(crate) priority: i32,
    pub(crate) seq: u64,
    pub(crate) request: Request,
    // Released when the entry is dropped, i.e. when its dispatch finishes.
    #[allow(dead_code)]
    pub(crate) permit: OwnedSemaphorePermit,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

pub struct Scheduler {
    heap: Mutex<BinaryHeap<Reverse<QueuedRequest>>>,
    notify: Notify,
    capacity: Arc<Semaphore>,
    total_permits: usize,
    seq: AtomicU64,
    closed: AtomicBool,
}

impl Scheduler {
    pub(crate) fn new(config: &SchedulerConfig) -> Arc<Self> {
        let pending = config.pending_requests.min(config.ready_queue_max_size);
        let permits = pending + config.concurrent_requests;
        info!(
            concurrent_requests = config.concurrent_requests,
            pending_requests = pending,
            "scheduler created"
        );
        Arc::new(Scheduler {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            capacity: Arc::new(Semaphore::new(permits)),
            total_permits: permits,
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Schedules a request. Suspends while the queue is at capacity and
    /// returns once the request is accepted. Fails with
    /// [`EngineError::ShutdownInProgress`] after `close`.
    pub async fn submit(&self, request: Request) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::ShutdownInProgress);
        }

        let permit = Arc::clone(&self.capacity)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::ShutdownInProgress)?;

        // Close may have raced with the capacity wait.
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::ShutdownInProgress);
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        trace!(
            id = request.meta.id,
            priority = request.priority,
            seq,
            "request queued"
        );
        self.heap.lock().push(Reverse(QueuedRequest {
            priority: request.priority,
            seq,
            request,
            permit,
        }));
        self.notify.notify_one();
        Ok(())
    }

    /// Takes the next request in `(priority, seq)` order, suspending until
    /// one is available. Returns `None` once the scheduler is closed.
    pub(crate) async fn take_next(&self) -> Option<QueuedRequest> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before the empty-check so a submit landing
            // in between cannot be lost.
            notified.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(Reverse(entry)) = self.heap.lock().pop() {
                return Some(entry);
            }
            notified.await;
        }
    }

    /// Stops intake. Idempotent; blocked submitters fail with
    /// `ShutdownInProgress` and idle workers observe the terminal state.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("scheduler close called again; already closed");
            return;
        }
        info!(queued = self.len(), "scheduler closed to new work");
        self.capacity.close();
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drops everything still queued, logging each request. Returns how
    /// many were dropped.
    pub(crate) fn drain(&self) -> usize {
        let mut heap = self.heap.lock();
        let count = heap.len();
        for Reverse(entry) in heap.drain() {
            debug!(
                id = entry.request.meta.id,
                url = %entry.request.url,
                "queued request dropped during shutdown"
            );
        }
        count
    }

    /// Requests that hold a capacity permit: queued, plus taken but not yet
    /// settled. Zero means nothing submitted is outstanding.
    pub(crate) fn outstanding(&self) -> usize {
        self.total_permits
            .saturating_sub(self.capacity.available_permits())
    }

    /// Number of queued (not yet taken) requests.
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use url::Url;

    fn request(priority: i32) -> Request {
        Request::get(Url::parse("https://example.com/x").unwrap()).priority(priority)
    }

    fn scheduler(concurrent: usize, pending: usize) -> Arc<Scheduler> {
        Scheduler::new(&SchedulerConfig {
            concurrent_requests: concurrent,
            pending_requests: pending,
            ..SchedulerConfig::default()
        })
    }

    #[tokio::test]
    async fn takes_lowest_priority_first() {
        let scheduler = scheduler(4, 16);
        scheduler.submit(request(5)).await.unwrap();
        scheduler.submit(request(1)).await.unwrap();
        scheduler.submit(request(3)).await.unwrap();

        let first = scheduler.take_next().await.unwrap();
        let second = scheduler.take_next().await.unwrap();
        let third = scheduler.take_next().await.unwrap();
        assert_eq!(
            (first.priority, second.priority, third.priority),
            (1, 3, 5)
        );
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let scheduler = scheduler(4, 16);
        for _ in 0..5 {
            scheduler.submit(request(7)).await.unwrap();
        }
        let mut seqs = Vec::new();
        for _ in 0..5 {
            seqs.push(scheduler.take_next().await.unwrap().seq);
        }
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
    }

    #[tokio::test]
    async fn take_next_waits_for_submission() {
        let scheduler = scheduler(1, 1);
        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.take_next().await.map(|e| e.priority) })
        };
        tokio::task::yield_now().await;
        scheduler.submit(request(2)).await.unwrap();
        assert_eq!(waiter.await.unwrap(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn submit_blocks_at_capacity_until_dispatch_completes() {
        // 1 worker slot + 1 pending slot = capacity 2.
        let scheduler = scheduler(1, 1);
        scheduler.submit(request(0)).await.unwrap();
        scheduler.submit(request(0)).await.unwrap();

        let blocked = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.submit(request(0)).await })
        };
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished(), "third submit should be throttled");

        // Completing one dispatch releases its permit.
        let entry = scheduler.take_next().await.unwrap();
        drop(entry);
        blocked.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_rejects_submissions_and_wakes_workers() {
        let scheduler = scheduler(2, 2);
        scheduler.close();
        assert!(matches!(
            scheduler.submit(request(0)).await,
            Err(EngineError::ShutdownInProgress)
        ));
        assert!(scheduler.take_next().await.is_none());
        // Idempotent.
        scheduler.close();
        assert!(scheduler.is_closed());
    }

    #[tokio::test]
    async fn close_unblocks_throttled_submitters() {
        let scheduler = scheduler(1, 0);
        scheduler.submit(request(0)).await.unwrap();
        let blocked = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.submit(request(0)).await })
        };
        tokio::task::yield_now().await;
        scheduler.close();
        assert!(matches!(
            tokio::time::timeout(Duration::from_secs(1), blocked)
                .await
                .unwrap()
                .unwrap(),
            Err(EngineError::ShutdownInProgress)
        ));
    }

    #[tokio::test]
    async fn drain_reports_dropped_requests() {
        let scheduler = scheduler(4, 8);
        for _ in 0..3 {
            scheduler.submit(request(0)).await.unwrap();
        }
        scheduler.close();
        assert_eq!(scheduler.drain(), 3);
        assert!(scheduler.is_empty());
    }
}
