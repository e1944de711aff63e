//! # Rate Limiter Module
//!
//! Per-group pacing and adaptation for outbound dispatches.
//!
//! ## Overview
//!
//! Requests are grouped by a configurable key (default: the URL host). Each
//! group enforces a minimum interval between dispatches: `acquire` computes
//! how long the caller must wait relative to the group's last dispatch and
//! suspends for exactly that long. Waiters on the same group are serialized
//! through the group's pacing mutex; unrelated groups never contend.
//!
//! ## Adaptation
//!
//! With an adaptive block configured, each group's interval follows an
//! EWMA + AIMD discipline driven by request outcomes:
//!
//! - `Retry-After` on a 429/503 response raises the interval to the server's
//!   value (capped at [`RETRY_AFTER_CAP`]) and resets the success streak.
//! - A failure trigger (configured status or transport kind) multiplies the
//!   interval by `increase_factor` and resets the streak.
//! - A streak of `success_threshold` successes subtracts `decrease_step`.
//!
//! The interval always stays within `[min_interval, max_interval]`. Response
//! latency is smoothed into an EWMA exposed for diagnostics; it does not
//! itself move the interval.
//!
//! Idle groups are evicted after `cleanup_timeout`, both from a timer task
//! and opportunistically during acquires.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::{AdaptiveConfig, RateLimitConfig, RetryConfig};
use crate::error::TransportKind;
use crate::request::Request;

/// Ceiling applied to server-provided `Retry-After` values.
pub const RETRY_AFTER_CAP: Duration = Duration::from_secs(600);

/// Group key used when rate limiting is disabled but a global interval is
/// still configured.
const SHARED_GROUP: &str = "*";

/// Maps a request to its rate-limit group and that group's base interval.
pub type GroupBy = Arc<dyn Fn(&Request) -> (String, Duration) + Send + Sync>;

/// What one dispatch looked like, reported back to the limiter.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub latency: Duration,
    pub status: Option<u16>,
    pub retry_after: Option<Duration>,
    pub error: Option<TransportKind>,
}

impl RequestOutcome {
    pub fn from_status(status: u16, retry_after: Option<Duration>, latency: Duration) -> Self {
        RequestOutcome {
            latency,
            status: Some(status),
            retry_after,
            error: None,
        }
    }

    pub fn from_transport(kind: TransportKind, latency: Duration) -> Self {
        RequestOutcome {
            latency,
            status: None,
            retry_after: None,
            error: Some(kind),
        }
    }
}

/// Diagnostic view of one group's adaptation state.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSnapshot {
    pub interval: Duration,
    pub successes: u32,
    pub ewma_latency: Duration,
}

// Trigger sets resolved once at construction, honoring inherit_retry_triggers.
struct AdaptiveSettings {
    config: AdaptiveConfig,
    trigger_statuses: std::collections::HashSet<u16>,
    trigger_kinds: std::collections::HashSet<TransportKind>,
}

struct Pacing {
    last_dispatch: Option<Instant>,
}

struct GroupState {
    interval: Duration,
    successes: u32,
    ewma_latency: Duration,
    last_activity: Instant,
}

struct Group {
    // Held across the pacing sleep so same-group waiters queue up in order.
    pacing: tokio::sync::Mutex<Pacing>,
    // Short-held; outcome recording must never wait behind a sleeper.
    state: parking_lot::Mutex<GroupState>,
}

pub struct RateLimiter {
    enabled: bool,
    default_interval: Duration,
    cleanup_timeout: Duration,
    adaptive: Option<AdaptiveSettings>,
    group_by: GroupBy,
    groups: DashMap<String, Arc<Group>>,
    last_sweep: parking_lot::Mutex<Instant>,
}

impl RateLimiter {
    /// Builds a limiter from the rate-limit block. The retry block supplies
    /// trigger sets when `inherit_retry_triggers` is on.
    pub fn new(config: &RateLimitConfig, retry: &RetryConfig, group_by: Option<GroupBy>) -> Self {
        let adaptive = config.adaptive.as_ref().map(|adaptive| {
            let (trigger_statuses, trigger_kinds) = if adaptive.inherit_retry_triggers {
                (retry.statuses.clone(), retry.kinds.clone())
            } else {
                (adaptive.trigger_statuses.clone(), adaptive.trigger_kinds.clone())
            };
            AdaptiveSettings {
                config: adaptive.clone(),
                trigger_statuses,
                trigger_kinds,
            }
        });

        let default_interval = config.default_interval;
        let group_by = group_by.unwrap_or_else(|| default_group_by(default_interval));

        RateLimiter {
            enabled: config.enabled,
            default_interval,
            cleanup_timeout: config.cleanup_timeout,
            adaptive,
            group_by,
            groups: DashMap::new(),
            last_sweep: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Waits until the request's group allows another dispatch, then reserves
    /// the slot. Returns the group key for the matching
    /// [`record_outcome`](Self::record_outcome) call.
    pub async fn acquire(&self, request: &Request) -> String {
        self.maybe_sweep();

        let (key, base, per_dispatch) = self.resolve(request);

        // Fast path: nothing to pace.
        if base.is_zero() && per_dispatch.is_none() && self.adaptive.is_none() {
            return key;
        }

        let group = self.group(&key, base);

        // A per-request interval override applies to this dispatch only; the
        // group's stored (possibly adapted) interval is untouched.
        let effective = per_dispatch.unwrap_or_else(|| group.state.lock().interval);

        let mut pacing = group.pacing.lock().await;
        let now = Instant::now();
        let wait = match pacing.last_dispatch {
            Some(last) => (last + effective).duration_since(now),
            None => Duration::ZERO,
        };
        let dispatch_at = now + wait;
        pacing.last_dispatch = Some(dispatch_at);
        group.state.lock().last_activity = dispatch_at;

        if !wait.is_zero() {
            trace!(group = %key, wait = ?wait, "rate limit wait");
            tokio::time::sleep(wait).await;
        }
        drop(pacing);

        key
    }

    /// Feeds a dispatch outcome back into the group's adaptation state.
    /// A no-op in fixed mode apart from refreshing the activity clock.
    pub fn record_outcome(&self, key: &str, outcome: RequestOutcome) {
        let Some(group) = self.groups.get(key) else {
            return;
        };
        let mut state = group.state.lock();
        state.last_activity = Instant::now();

        let Some(adaptive) = &self.adaptive else {
            return;
        };
        let bounds = (adaptive.config.min_interval, adaptive.config.max_interval);

        if adaptive.config.respect_retry_after {
            if let (Some(retry_after), Some(status)) = (outcome.retry_after, outcome.status) {
                if status == 429 || status == 503 {
                    let retry_after = retry_after.min(RETRY_AFTER_CAP);
                    let raised = state.interval.max(retry_after);
                    state.interval = raised.clamp(bounds.0, bounds.1);
                    state.successes = 0;
                    debug!(
                        group = %key,
                        interval = ?state.interval,
                        "interval raised to server Retry-After"
                    );
                    return;
                }
            }
        }

        let is_failure = outcome
            .status
            .map(|s| adaptive.trigger_statuses.contains(&s))
            .unwrap_or(false)
            || outcome
                .error
                .map(|k| adaptive.trigger_kinds.contains(&k))
                .unwrap_or(false);

        if is_failure {
            let increased = mul_duration(state.interval, adaptive.config.increase_factor);
            state.interval = increased.clamp(bounds.0, bounds.1);
            state.successes = 0;
            debug!(group = %key, interval = ?state.interval, "interval increased on failure");
            return;
        }

        state.successes += 1;
        if state.successes >= adaptive.config.success_threshold {
            let decreased = state.interval.saturating_sub(adaptive.config.decrease_step);
            state.interval = decreased.clamp(bounds.0, bounds.1);
            state.successes = 0;
            debug!(group = %key, interval = ?state.interval, "interval decreased after success streak");
        }
        state.ewma_latency = if state.ewma_latency.is_zero() {
            outcome.latency
        } else {
            let alpha = adaptive.config.ewma_alpha;
            let smoothed = alpha * outcome.latency.as_secs_f64()
                + (1.0 - alpha) * state.ewma_latency.as_secs_f64();
            Duration::from_secs_f64(smoothed)
        };
    }

    /// Evicts groups idle for longer than `cleanup_timeout`.
    pub(crate) fn sweep(&self) {
        let now = Instant::now();
        let timeout = self.cleanup_timeout;
        self.groups.retain(|key, group| {
            let state = group.state.lock();
            let keep = now.duration_since(state.last_activity) < timeout;
            if !keep {
                debug!(group = %key, "rate limit group evicted after idle timeout");
            }
            keep
        });
    }

    /// Spawns the periodic eviction sweep, stopped by `token`.
    pub(crate) fn spawn_sweeper(
        self: &Arc<Self>,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let period = limiter.cleanup_timeout.max(Duration::from_secs(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => limiter.sweep(),
                }
            }
        })
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn group_snapshot(&self, key: &str) -> Option<GroupSnapshot> {
        self.groups.get(key).map(|group| {
            let state = group.state.lock();
            GroupSnapshot {
                interval: state.interval,
                successes: state.successes,
                ewma_latency: state.ewma_latency,
            }
        })
    }

    fn resolve(&self, request: &Request) -> (String, Duration, Option<Duration>) {
        if !self.enabled {
            // No grouping, but a non-zero default interval still paces
            // everything through one shared gate.
            return (SHARED_GROUP.to_string(), self.default_interval, None);
        }
        let (mut key, mut base) = (self.group_by)(request);
        let mut per_dispatch = None;
        if let Some(group_override) = &request.meta.group {
            key = group_override.key.clone();
            if let Some(interval) = group_override.interval {
                per_dispatch = Some(interval);
            }
        }
        if base.is_zero() {
            base = self.default_interval;
        }
        (key, base, per_dispatch)
    }

    fn group(&self, key: &str, base: Duration) -> Arc<Group> {
        if let Some(group) = self.groups.get(key) {
            return group.value().clone();
        }
        let initial = match &self.adaptive {
            Some(adaptive) => base.clamp(adaptive.config.min_interval, adaptive.config.max_interval),
            None => base,
        };
        let created = Arc::new(Group {
            pacing: tokio::sync::Mutex::new(Pacing { last_dispatch: None }),
            state: parking_lot::Mutex::new(GroupState {
                interval: initial,
                successes: 0,
                ewma_latency: Duration::ZERO,
                last_activity: Instant::now(),
            }),
        });
        self.groups
            .entry(key.to_string())
            .or_insert_with(|| {
                trace!(group = %key, interval = ?initial, "rate limit group created");
                created
            })
            .value()
            .clone()
    }

    fn maybe_sweep(&self) {
        let mut last = self.last_sweep.lock();
        if last.elapsed() >= self.cleanup_timeout {
            *last = Instant::now();
            drop(last);
            self.sweep();
        }
    }
}

fn default_group_by(default_interval: Duration) -> GroupBy {
    Arc::new(move |request: &Request| {
        let host = request.url.host_str().unwrap_or("unknown").to_string();
        (host, default_interval)
    })
}

fn mul_duration(d: Duration, factor: f64) -> Duration {
    // Bounded well below Duration::MAX so a runaway factor cannot panic
    // the constructor; callers clamp to their configured maximum anyway.
    Duration::from_secs_f64((d.as_secs_f64() * factor).min(1e9))
}
