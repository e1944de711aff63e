//! # Configuration
//!
//! One plain struct per configuration block, each with a `Default` impl that
//! matches the documented defaults. [`Config::from_env`] layers environment
//! variables over those defaults; [`Config::validate`] rejects values the
//! engine cannot run with.
//!
//! All intervals are [`Duration`]s; environment values are seconds expressed
//! as floats.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::env;
use crate::error::{ConfigError, TransportKind};

/// TLS verification policy for the HTTP session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsConfig {
    /// Verify server certificates against the system roots.
    Verify,
    /// Accept any certificate.
    NoVerify,
    /// Verify against a CA bundle at the given path.
    CaBundle(PathBuf),
}

/// Session-level proxy: one URL for everything, or one per URL scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyConfig {
    Url(String),
    PerScheme(HashMap<String, String>),
}

impl ProxyConfig {
    /// The proxy URL to use for a target with the given scheme.
    pub fn for_scheme(&self, scheme: &str) -> Option<&str> {
        match self {
            ProxyConfig::Url(url) => Some(url),
            ProxyConfig::PerScheme(map) => map.get(scheme).map(String::as_str),
        }
    }
}

/// Forced HTTP adapter choice. Absent means the default adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpBackend {
    Reqwest,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Per-request deadline applied by the adapter.
    pub timeout: Duration,
    pub tls: TlsConfig,
    pub proxy: Option<ProxyConfig>,
    pub http_backend: Option<HttpBackend>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            timeout: Duration::from_secs(60),
            tls: TlsConfig::Verify,
            proxy: None,
            http_backend: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker count: the maximum number of concurrent dispatches.
    pub concurrent_requests: usize,
    /// Backpressure slack: how many ready requests may queue beyond the
    /// in-flight set before submitters suspend.
    pub pending_requests: usize,
    /// How long close waits for in-flight dispatches before cancelling.
    pub close_timeout: Duration,
    /// Hard cap on queued items.
    pub ready_queue_max_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            concurrent_requests: 64,
            pending_requests: 1,
            close_timeout: Duration::from_secs(30),
            ready_queue_max_size: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Total runtime cap. `None` runs until drained or signalled.
    pub timeout: Option<Duration>,
    /// Grace period between graceful shutdown start and forced cancellation.
    pub shutdown_timeout: Duration,
    /// Drain poll period.
    pub shutdown_check_interval: Duration,
    /// Severity at which hitting `timeout` is logged.
    pub timeout_log_level: tracing::Level,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            timeout: None,
            shutdown_timeout: Duration::from_secs(30),
            shutdown_check_interval: Duration::from_millis(100),
            timeout_log_level: tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Fail (true) or warn (false) when an item has no registered pipeline.
    pub strict: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig { strict: true }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Minimum interval between dispatches in one group.
    pub default_interval: Duration,
    /// Idle groups older than this are evicted.
    pub cleanup_timeout: Duration,
    /// When set, groups adapt their interval with EWMA + AIMD.
    pub adaptive: Option<AdaptiveConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            enabled: false,
            default_interval: Duration::ZERO,
            cleanup_timeout: Duration::from_secs(60),
            adaptive: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub min_interval: Duration,
    pub max_interval: Duration,
    /// Multiplies the interval on a failure trigger.
    pub increase_factor: f64,
    /// Subtracted from the interval after a success streak.
    pub decrease_step: Duration,
    /// Consecutive successes required before the interval decreases.
    pub success_threshold: u32,
    /// Smoothing factor for the latency EWMA, in (0, 1].
    pub ewma_alpha: f64,
    /// Honor `Retry-After` on 429/503 responses.
    pub respect_retry_after: bool,
    /// Use the retry middleware's trigger sets instead of the ones below.
    pub inherit_retry_triggers: bool,
    pub trigger_statuses: HashSet<u16>,
    pub trigger_kinds: HashSet<TransportKind>,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        AdaptiveConfig {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            increase_factor: 2.0,
            decrease_step: Duration::from_millis(50),
            success_threshold: 5,
            ewma_alpha: 0.3,
            respect_retry_after: true,
            inherit_retry_triggers: true,
            trigger_statuses: [429, 500, 502, 503, 504].into_iter().collect(),
            trigger_kinds: [TransportKind::Timeout].into_iter().collect(),
        }
    }
}

/// Backoff strategy applied between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Constant,
    Linear,
    Exponential,
    ExponentialJitter,
}

impl Backoff {
    /// Delay before re-submitting a request whose `attempt` retries have
    /// already been used (0 on the first failure).
    pub fn delay(self, base: Duration, max: Duration, attempt: u32) -> Duration {
        let exp = |a: u32| -> Duration {
            let factor = 2f64.powi(a.min(63) as i32);
            let secs = (base.as_secs_f64() * factor).min(max.as_secs_f64());
            Duration::from_secs_f64(secs)
        };
        match self {
            Backoff::Constant => base,
            Backoff::Linear => base.saturating_mul(attempt).min(max),
            Backoff::Exponential => exp(attempt),
            Backoff::ExponentialJitter => {
                let d = exp(attempt).as_secs_f64();
                let jitter = rand::Rng::gen_range(&mut rand::thread_rng(), 0.0..=d / 2.0);
                Duration::from_secs_f64(d / 2.0 + jitter)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub enabled: bool,
    /// Maximum retry attempts per request.
    pub attempts: u32,
    pub backoff: Backoff,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Response statuses that trigger a retry.
    pub statuses: HashSet<u16>,
    /// Transport failure kinds that trigger a retry.
    pub kinds: HashSet<TransportKind>,
    /// Priority of the retry middleware in the exception phase.
    pub priority: i32,
    /// Raise a request-stop after re-enqueueing so later exception
    /// middlewares and the errback never observe the failed attempt.
    pub stop_processing: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            enabled: false,
            attempts: 3,
            backoff: Backoff::ExponentialJitter,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            statuses: [500, 502, 503, 504, 522, 524, 408, 429].into_iter().collect(),
            kinds: [TransportKind::Timeout, TransportKind::Connect]
                .into_iter()
                .collect(),
            priority: 100,
            stop_processing: true,
        }
    }
}

/// Top-level configuration combining every block.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub session: SessionConfig,
    pub scheduler: SchedulerConfig,
    pub execution: ExecutionConfig,
    pub pipeline: PipelineConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
}

impl Config {
    /// Loads configuration from the environment over the defaults.
    ///
    /// Keys are snake-uppercased paths into the blocks
    /// (`SCHEDULER_CONCURRENT_REQUESTS`, `RATE_LIMIT_DEFAULT_INTERVAL`,
    /// `ADAPTIVE_INCREASE_FACTOR`, `RETRY_BACKOFF`, ...). Malformed values
    /// fail with a [`ConfigError`] naming the key.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        env::apply(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.concurrent_requests == 0 {
            return Err(ConfigError::NotPositive {
                key: "scheduler.concurrent_requests",
            });
        }
        if self.scheduler.ready_queue_max_size == 0 {
            return Err(ConfigError::NotPositive {
                key: "scheduler.ready_queue_max_size",
            });
        }
        if let Some(adaptive) = &self.rate_limit.adaptive {
            if adaptive.ewma_alpha <= 0.0 || adaptive.ewma_alpha > 1.0 {
                return Err(ConfigError::InvalidValue {
                    key: "adaptive.ewma_alpha".into(),
                    value: adaptive.ewma_alpha.to_string(),
                    expected: "a float in (0, 1]",
                });
            }
            if adaptive.increase_factor < 1.0 {
                return Err(ConfigError::InvalidValue {
                    key: "adaptive.increase_factor".into(),
                    value: adaptive.increase_factor.to_string(),
                    expected: "a float >= 1.0",
                });
            }
            if adaptive.min_interval > adaptive.max_interval {
                return Err(ConfigError::InvalidValue {
                    key: "adaptive.min_interval".into(),
                    value: format!("{:?}", adaptive.min_interval),
                    expected: "an interval <= adaptive.max_interval",
                });
            }
        }
        Ok(())
    }
}
