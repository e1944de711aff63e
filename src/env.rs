//! Environment-variable configuration loading.
//!
//! Keys are snake-uppercased paths into the [`Config`](crate::config::Config)
//! blocks. Parsing is best-effort in the sense that unset keys keep their
//! defaults, but a key that is set to a malformed value is an explicit
//! [`ConfigError`] rather than a silent fallback.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{AdaptiveConfig, Backoff, Config, HttpBackend, ProxyConfig, TlsConfig};
use crate::error::{ConfigError, TransportKind};

/// Applies process environment variables onto `config`.
pub(crate) fn apply(config: &mut Config) -> Result<(), ConfigError> {
    apply_from(config, &|key| std::env::var(key).ok())
}

/// Applies variables from an arbitrary source. Split out so tests can feed
/// a map instead of mutating the process environment.
pub(crate) fn apply_from(
    config: &mut Config,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    let env = Env { lookup };

    // session
    if let Some(v) = env.secs("SESSION_TIMEOUT")? {
        config.session.timeout = v;
    }
    if let Some(v) = env.raw("SESSION_SSL") {
        config.session.tls = match v.to_ascii_lowercase().as_str() {
            "true" | "on" | "yes" | "1" => TlsConfig::Verify,
            "false" | "off" | "no" | "0" => TlsConfig::NoVerify,
            _ => TlsConfig::CaBundle(PathBuf::from(v)),
        };
    }
    if let Some(v) = env.raw("SESSION_PROXY") {
        config.session.proxy = Some(parse_proxy("SESSION_PROXY", &v)?);
    }
    if let Some(v) = env.raw("SESSION_HTTP_BACKEND") {
        config.session.http_backend = Some(match v.to_ascii_lowercase().as_str() {
            "reqwest" => HttpBackend::Reqwest,
            _ => {
                return Err(invalid("SESSION_HTTP_BACKEND", &v, "one of: reqwest"));
            }
        });
    }

    // scheduler
    if let Some(v) = env.usize("SCHEDULER_CONCURRENT_REQUESTS")? {
        config.scheduler.concurrent_requests = v;
    }
    if let Some(v) = env.usize("SCHEDULER_PENDING_REQUESTS")? {
        config.scheduler.pending_requests = v;
    }
    if let Some(v) = env.secs("SCHEDULER_CLOSE_TIMEOUT")? {
        config.scheduler.close_timeout = v;
    }
    if let Some(v) = env.usize("SCHEDULER_READY_QUEUE_MAX_SIZE")? {
        config.scheduler.ready_queue_max_size = v;
    }

    // execution
    if let Some(v) = env.secs("EXECUTION_TIMEOUT")? {
        config.execution.timeout = Some(v);
    }
    if let Some(v) = env.secs("EXECUTION_SHUTDOWN_TIMEOUT")? {
        config.execution.shutdown_timeout = v;
    }
    if let Some(v) = env.secs("EXECUTION_SHUTDOWN_CHECK_INTERVAL")? {
        config.execution.shutdown_check_interval = v;
    }
    if let Some(v) = env.raw("EXECUTION_LOG_LEVEL") {
        config.execution.timeout_log_level = parse_level("EXECUTION_LOG_LEVEL", &v)?;
    }

    // pipeline
    if let Some(v) = env.bool("PIPELINE_STRICT")? {
        config.pipeline.strict = v;
    }

    // rate limit
    if let Some(v) = env.bool("RATE_LIMIT_ENABLED")? {
        config.rate_limit.enabled = v;
    }
    if let Some(v) = env.secs("RATE_LIMIT_DEFAULT_INTERVAL")? {
        config.rate_limit.default_interval = v;
    }
    if let Some(v) = env.secs("RATE_LIMIT_CLEANUP_TIMEOUT")? {
        config.rate_limit.cleanup_timeout = v;
    }

    // adaptive
    match env.bool("ADAPTIVE_ENABLED")? {
        Some(true) => {
            config.rate_limit.adaptive.get_or_insert_with(AdaptiveConfig::default);
        }
        Some(false) => config.rate_limit.adaptive = None,
        None => {}
    }
    if let Some(adaptive) = config.rate_limit.adaptive.as_mut() {
        if let Some(v) = env.secs("ADAPTIVE_MIN_INTERVAL")? {
            adaptive.min_interval = v;
        }
        if let Some(v) = env.secs("ADAPTIVE_MAX_INTERVAL")? {
            adaptive.max_interval = v;
        }
        if let Some(v) = env.f64("ADAPTIVE_INCREASE_FACTOR")? {
            adaptive.increase_factor = v;
        }
        if let Some(v) = env.secs("ADAPTIVE_DECREASE_STEP")? {
            adaptive.decrease_step = v;
        }
        if let Some(v) = env.u32("ADAPTIVE_SUCCESS_THRESHOLD")? {
            adaptive.success_threshold = v;
        }
        if let Some(v) = env.f64("ADAPTIVE_EWMA_ALPHA")? {
            adaptive.ewma_alpha = v;
        }
        if let Some(v) = env.bool("ADAPTIVE_RESPECT_RETRY_AFTER")? {
            adaptive.respect_retry_after = v;
        }
        if let Some(v) = env.bool("ADAPTIVE_INHERIT_RETRY_TRIGGERS")? {
            adaptive.inherit_retry_triggers = v;
        }
        if let Some(v) = env.status_set("ADAPTIVE_TRIGGER_STATUSES")? {
            adaptive.trigger_statuses = v;
        }
        if let Some(v) = env.kind_set("ADAPTIVE_TRIGGER_KINDS")? {
            adaptive.trigger_kinds = v;
        }
    }

    // retry
    if let Some(v) = env.bool("RETRY_ENABLED")? {
        config.retry.enabled = v;
    }
    if let Some(v) = env.u32("RETRY_ATTEMPTS")? {
        config.retry.attempts = v;
    }
    if let Some(v) = env.raw("RETRY_BACKOFF") {
        config.retry.backoff = parse_backoff("RETRY_BACKOFF", &v)?;
    }
    if let Some(v) = env.secs("RETRY_BASE_DELAY")? {
        config.retry.base_delay = v;
    }
    if let Some(v) = env.secs("RETRY_MAX_DELAY")? {
        config.retry.max_delay = v;
    }
    if let Some(v) = env.status_set("RETRY_STATUSES")? {
        config.retry.statuses = v;
    }
    if let Some(v) = env.kind_set("RETRY_KINDS")? {
        config.retry.kinds = v;
    }
    if let Some(v) = env.i32("RETRY_MIDDLEWARE_PRIORITY")? {
        config.retry.priority = v;
    }
    if let Some(v) = env.bool("RETRY_STOP_PROCESSING")? {
        config.retry.stop_processing = v;
    }

    Ok(())
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(
        &self,
        key: &str,
        expected: &'static str,
        cast: impl Fn(&str) -> Option<T>,
    ) -> Result<Option<T>, ConfigError> {
        match self.raw(key) {
            None => Ok(None),
            Some(v) => cast(v.trim())
                .map(Some)
                .ok_or_else(|| invalid(key, &v, expected)),
        }
    }

    fn bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        self.parse(key, "a boolean (true/false/on/off/yes/no/1/0)", |v| {
            match v.to_ascii_lowercase().as_str() {
                "true" | "on" | "yes" | "y" | "ok" | "1" => Some(true),
                "false" | "off" | "no" | "n" | "0" => Some(false),
                _ => None,
            }
        })
    }

    fn f64(&self, key: &str) -> Result<Option<f64>, ConfigError> {
        self.parse(key, "a float", |v| v.parse().ok())
    }

    fn secs(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        self.parse(key, "a non-negative number of seconds", |v| {
            let secs: f64 = v.parse().ok()?;
            (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
        })
    }

    fn usize(&self, key: &str) -> Result<Option<usize>, ConfigError> {
        self.parse(key, "a non-negative integer", |v| v.parse().ok())
    }

    fn u32(&self, key: &str) -> Result<Option<u32>, ConfigError> {
        self.parse(key, "a non-negative integer", |v| v.parse().ok())
    }

    fn i32(&self, key: &str) -> Result<Option<i32>, ConfigError> {
        self.parse(key, "an integer", |v| v.parse().ok())
    }

    fn status_set(&self, key: &str) -> Result<Option<HashSet<u16>>, ConfigError> {
        self.parse(key, "a comma-separated list of status codes", |v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<u16>().ok())
                .collect()
        })
    }

    fn kind_set(&self, key: &str) -> Result<Option<HashSet<TransportKind>>, ConfigError> {
        self.parse(
            key,
            "a comma-separated list of: connect, timeout, protocol",
            |v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| match s.to_ascii_lowercase().as_str() {
                        "connect" => Some(TransportKind::Connect),
                        "timeout" => Some(TransportKind::Timeout),
                        "protocol" => Some(TransportKind::Protocol),
                        _ => None,
                    })
                    .collect()
            },
        )
    }
}

fn invalid(key: &str, value: &str, expected: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        expected,
    }
}

fn parse_level(key: &str, value: &str) -> Result<tracing::Level, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "trace" => Ok(tracing::Level::TRACE),
        "debug" => Ok(tracing::Level::DEBUG),
        "info" => Ok(tracing::Level::INFO),
        "warn" | "warning" => Ok(tracing::Level::WARN),
        "error" => Ok(tracing::Level::ERROR),
        _ => Err(invalid(key, value, "one of: trace, debug, info, warn, error")),
    }
}

fn parse_backoff(key: &str, value: &str) -> Result<Backoff, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "constant" => Ok(Backoff::Constant),
        "linear" => Ok(Backoff::Linear),
        "exponential" => Ok(Backoff::Exponential),
        "exponential_jitter" => Ok(Backoff::ExponentialJitter),
        _ => Err(invalid(
            key,
            value,
            "one of: constant, linear, exponential, exponential_jitter",
        )),
    }
}

/// A proxy value is a plain URL, or a JSON object mapping URL schemes to
/// proxy URLs (`{"http": "...", "https": "..."}`).
fn parse_proxy(key: &str, value: &str) -> Result<ProxyConfig, ConfigError> {
    if value.trim_start().starts_with('{') {
        let map: std::collections::HashMap<String, String> = serde_json::from_str(value)
            .map_err(|_| invalid(key, value, "a proxy URL or a JSON scheme map"))?;
        Ok(ProxyConfig::PerScheme(map))
    } else {
        Ok(ProxyConfig::Url(value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn apply_vars(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = Config::default();
        apply_from(&mut config, &move |key| map.get(key).cloned())?;
        Ok(config)
    }

    #[test]
    fn unset_keys_keep_defaults() {
        let config = apply_vars(&[]).unwrap();
        assert_eq!(config.scheduler.concurrent_requests, 64);
        assert!(!config.retry.enabled);
    }

    #[test]
    fn scheduler_and_retry_overrides() {
        let config = apply_vars(&[
            ("SCHEDULER_CONCURRENT_REQUESTS", "8"),
            ("SCHEDULER_PENDING_REQUESTS", "32"),
            ("RETRY_ENABLED", "true"),
            ("RETRY_ATTEMPTS", "5"),
            ("RETRY_BACKOFF", "linear"),
            ("RETRY_BASE_DELAY", "0.25"),
            ("RETRY_STATUSES", "500, 503"),
        ])
        .unwrap();
        assert_eq!(config.scheduler.concurrent_requests, 8);
        assert_eq!(config.scheduler.pending_requests, 32);
        assert!(config.retry.enabled);
        assert_eq!(config.retry.attempts, 5);
        assert_eq!(config.retry.backoff, Backoff::Linear);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.retry.statuses, [500, 503].into_iter().collect());
    }

    #[test]
    fn adaptive_block_materializes_when_enabled() {
        let config = apply_vars(&[
            ("RATE_LIMIT_ENABLED", "on"),
            ("RATE_LIMIT_DEFAULT_INTERVAL", "0.5"),
            ("ADAPTIVE_ENABLED", "1"),
            ("ADAPTIVE_INCREASE_FACTOR", "3.0"),
            ("ADAPTIVE_SUCCESS_THRESHOLD", "10"),
        ])
        .unwrap();
        assert!(config.rate_limit.enabled);
        assert_eq!(config.rate_limit.default_interval, Duration::from_millis(500));
        let adaptive = config.rate_limit.adaptive.expect("adaptive block");
        assert_eq!(adaptive.increase_factor, 3.0);
        assert_eq!(adaptive.success_threshold, 10);
    }

    #[test]
    fn malformed_value_names_the_key() {
        let err = apply_vars(&[("SCHEDULER_CONCURRENT_REQUESTS", "many")]).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("SCHEDULER_CONCURRENT_REQUESTS"), "{message}");
    }

    #[test]
    fn ssl_value_accepts_bool_or_path() {
        let config = apply_vars(&[("SESSION_SSL", "false")]).unwrap();
        assert_eq!(config.session.tls, TlsConfig::NoVerify);
        let config = apply_vars(&[("SESSION_SSL", "/etc/ssl/corp.pem")]).unwrap();
        assert_eq!(
            config.session.tls,
            TlsConfig::CaBundle(PathBuf::from("/etc/ssl/corp.pem"))
        );
    }

    #[test]
    fn proxy_accepts_url_or_scheme_map() {
        let config = apply_vars(&[("SESSION_PROXY", "http://proxy:3128")]).unwrap();
        assert_eq!(
            config.session.proxy,
            Some(ProxyConfig::Url("http://proxy:3128".into()))
        );
        let config =
            apply_vars(&[("SESSION_PROXY", r#"{"https": "http://sec-proxy:3128"}"#)]).unwrap();
        match config.session.proxy.unwrap() {
            ProxyConfig::PerScheme(map) => {
                assert_eq!(map.get("https").unwrap(), "http://sec-proxy:3128");
            }
            other => panic!("expected scheme map, got {other:?}"),
        }
    }
}
