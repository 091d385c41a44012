use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::FetchError;
use crate::fetcher::exponential_backoff;

/// Cache lifetime used when nothing is configured.
pub const DEFAULT_CACHE_LIFETIME: Duration = Duration::from_millis(4000);

/// Lifetime of entries written by `mutate_cache` when the client sets no cache lifetime.
pub const DEFAULT_MUTATE_LIFETIME: Duration = Duration::from_millis(8000);

/// Base interval fed to the error retry policy.
pub const DEFAULT_ERROR_RETRY_INTERVAL: Duration = Duration::from_millis(2000);

/// A duration that never elapses.
pub const UNBOUNDED: Duration = Duration::MAX;

/// Input to an error retry policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext<'a> {
    pub error: &'a FetchError,
    pub key: &'a str,
    /// Consecutive failures for `key`, including this one.
    pub retry_attempt: u32,
    pub error_retry_interval: Duration,
}

/// What to do after a fetch fails.
///
/// The policy returns the delay after which the key is invalidated (and so refetched by any
/// active store). Returning `None` or a zero delay stops automatic retries for this failure.
#[derive(Clone, Default)]
pub enum ErrorRetry {
    /// Randomized exponential backoff, see [`exponential_backoff`].
    #[default]
    Backoff,
    /// Never retry automatically.
    Disabled,
    Custom(Arc<dyn Fn(&RetryContext<'_>) -> Option<Duration> + Send + Sync>),
}

impl ErrorRetry {
    pub fn custom(f: impl Fn(&RetryContext<'_>) -> Option<Duration> + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    /// Delay before the next attempt, if any.
    pub fn delay(&self, ctx: &RetryContext<'_>) -> Option<Duration> {
        match self {
            Self::Backoff => Some(exponential_backoff(ctx)),
            Self::Disabled => None,
            Self::Custom(f) => f(ctx),
        }
        .filter(|delay| !delay.is_zero())
    }
}

impl fmt::Debug for ErrorRetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backoff => f.write_str("Backoff"),
            Self::Disabled => f.write_str("Disabled"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

// `error_retry = false` in a config file disables retries; `true` keeps the default backoff.
impl<'de> Deserialize<'de> for ErrorRetry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let enabled = bool::deserialize(deserializer)?;
        Ok(if enabled { Self::Backoff } else { Self::Disabled })
    }
}

/// Configuration for query behavior.
///
/// Every field is optional: client-level settings are the base, per-call settings override
/// them field by field (see [`merged_over`](Self::merged_over)), and
/// [`resolve`](Self::resolve) fills in the defaults.
///
/// Durations deserialize from integer milliseconds:
///
/// ```
/// use std::time::Duration;
/// use querykit::config::QuerySettings;
///
/// let settings: QuerySettings = serde_json::from_str(
///     r#"{ "dedupe_time_ms": 30, "cache_lifetime_ms": 60000, "revalidate_on_focus": true }"#,
/// ).unwrap();
///
/// assert_eq!(settings.dedupe_time, Some(Duration::from_millis(30)));
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    /// Window after a fetch during which the cached result is reused without a request.
    #[serde(rename = "dedupe_time_ms", deserialize_with = "millis")]
    pub dedupe_time: Option<Duration>,

    /// How long a fetched result stays visible as a placeholder.
    #[serde(rename = "cache_lifetime_ms", deserialize_with = "millis")]
    pub cache_lifetime: Option<Duration>,

    pub revalidate_on_focus: Option<bool>,

    pub revalidate_on_reconnect: Option<bool>,

    /// Period of background refetching while a store is active. Zero disables it.
    #[serde(rename = "revalidate_interval_ms", deserialize_with = "millis")]
    pub revalidate_interval: Option<Duration>,

    #[serde(rename = "error_retry_interval_ms", deserialize_with = "millis")]
    pub error_retry_interval: Option<Duration>,

    #[serde(rename = "error_retry")]
    pub on_error_retry: Option<ErrorRetry>,
}

impl QuerySettings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn dedupe_time(mut self, value: Duration) -> Self {
        self.dedupe_time = Some(value);
        self
    }

    #[must_use]
    pub fn cache_lifetime(mut self, value: Duration) -> Self {
        self.cache_lifetime = Some(value);
        self
    }

    #[must_use]
    pub fn revalidate_on_focus(mut self, value: bool) -> Self {
        self.revalidate_on_focus = Some(value);
        self
    }

    #[must_use]
    pub fn revalidate_on_reconnect(mut self, value: bool) -> Self {
        self.revalidate_on_reconnect = Some(value);
        self
    }

    #[must_use]
    pub fn revalidate_interval(mut self, value: Duration) -> Self {
        self.revalidate_interval = Some(value);
        self
    }

    #[must_use]
    pub fn error_retry_interval(mut self, value: Duration) -> Self {
        self.error_retry_interval = Some(value);
        self
    }

    #[must_use]
    pub fn on_error_retry(mut self, value: ErrorRetry) -> Self {
        self.on_error_retry = Some(value);
        self
    }

    /// Returns `self` with unset fields taken from `base`.
    #[must_use]
    pub fn merged_over(&self, base: &Self) -> Self {
        Self {
            dedupe_time: self.dedupe_time.or(base.dedupe_time),
            cache_lifetime: self.cache_lifetime.or(base.cache_lifetime),
            revalidate_on_focus: self.revalidate_on_focus.or(base.revalidate_on_focus),
            revalidate_on_reconnect: self.revalidate_on_reconnect.or(base.revalidate_on_reconnect),
            revalidate_interval: self.revalidate_interval.or(base.revalidate_interval),
            error_retry_interval: self.error_retry_interval.or(base.error_retry_interval),
            on_error_retry: self
                .on_error_retry
                .clone()
                .or_else(|| base.on_error_retry.clone()),
        }
    }

    /// Applies defaults.
    ///
    /// The cache lifetime is raised to the dedupe window when shorter: an entry must stay
    /// visible for at least as long as it suppresses refetches.
    pub fn resolve(&self) -> ResolvedSettings {
        let dedupe_time = self.dedupe_time.unwrap_or(UNBOUNDED);
        let cache_lifetime = self
            .cache_lifetime
            .unwrap_or(DEFAULT_CACHE_LIFETIME)
            .max(dedupe_time);

        ResolvedSettings {
            dedupe_time,
            cache_lifetime,
            revalidate_on_focus: self.revalidate_on_focus.unwrap_or(false),
            revalidate_on_reconnect: self.revalidate_on_reconnect.unwrap_or(false),
            revalidate_interval: self.revalidate_interval.filter(|d| !d.is_zero()),
            error_retry_interval: self
                .error_retry_interval
                .unwrap_or(DEFAULT_ERROR_RETRY_INTERVAL),
            on_error_retry: self.on_error_retry.clone().unwrap_or_default(),
        }
    }
}

/// Settings with every default applied.
#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    pub dedupe_time: Duration,
    pub cache_lifetime: Duration,
    pub revalidate_on_focus: bool,
    pub revalidate_on_reconnect: bool,
    pub revalidate_interval: Option<Duration>,
    pub error_retry_interval: Duration,
    pub on_error_retry: ErrorRetry,
}

/// Client-level configuration, loadable from a config file.
///
/// ```
/// use querykit::config::ClientConfig;
///
/// let config: ClientConfig = serde_json::from_str(
///     r#"{ "base_url": "https://api.example.com", "dedupe_time_ms": 5000, "error_retry": false }"#,
/// ).unwrap();
///
/// assert_eq!(config.base_url, "https://api.example.com");
/// assert!(config.settings.on_error_retry.is_some());
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Prefix for every request path. Required.
    pub base_url: String,

    #[serde(flatten)]
    pub settings: QuerySettings,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            settings: QuerySettings::default(),
        }
    }
}

fn millis<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_resolution() {
        let resolved = QuerySettings::default().resolve();
        assert_eq!(resolved.dedupe_time, UNBOUNDED);
        // Clamped up to the unbounded dedupe window.
        assert_eq!(resolved.cache_lifetime, UNBOUNDED);
        assert!(!resolved.revalidate_on_focus);
        assert!(!resolved.revalidate_on_reconnect);
        assert!(resolved.revalidate_interval.is_none());
        assert_eq!(resolved.error_retry_interval, DEFAULT_ERROR_RETRY_INTERVAL);
        assert!(matches!(resolved.on_error_retry, ErrorRetry::Backoff));
    }

    #[test]
    fn test_cache_lifetime_clamped_to_dedupe() {
        let resolved = QuerySettings::new()
            .dedupe_time(Duration::from_secs(10))
            .cache_lifetime(Duration::from_secs(1))
            .resolve();
        assert_eq!(resolved.cache_lifetime, Duration::from_secs(10));

        let resolved = QuerySettings::new()
            .dedupe_time(Duration::from_millis(30))
            .resolve();
        assert_eq!(resolved.cache_lifetime, DEFAULT_CACHE_LIFETIME);
    }

    #[test]
    fn test_merge_prefers_call_settings() {
        let client = QuerySettings::new()
            .dedupe_time(Duration::from_secs(1))
            .revalidate_on_focus(true);
        let call = QuerySettings::new()
            .dedupe_time(Duration::from_secs(5))
            .on_error_retry(ErrorRetry::Disabled);

        let merged = call.merged_over(&client);
        assert_eq!(merged.dedupe_time, Some(Duration::from_secs(5)));
        assert_eq!(merged.revalidate_on_focus, Some(true));
        assert!(matches!(merged.on_error_retry, Some(ErrorRetry::Disabled)));
    }

    #[test]
    fn test_zero_interval_disables() {
        let resolved = QuerySettings::new()
            .revalidate_interval(Duration::ZERO)
            .resolve();
        assert!(resolved.revalidate_interval.is_none());
    }

    #[test]
    fn test_retry_policy_delays() {
        let error = FetchError::http(500, "boom");
        let ctx = RetryContext {
            error: &error,
            key: "k",
            retry_attempt: 1,
            error_retry_interval: Duration::from_millis(100),
        };

        assert!(ErrorRetry::Disabled.delay(&ctx).is_none());
        assert!(ErrorRetry::Backoff.delay(&ctx).is_some());
        assert_eq!(
            ErrorRetry::custom(|_| Some(Duration::from_millis(7))).delay(&ctx),
            Some(Duration::from_millis(7))
        );
        assert!(ErrorRetry::custom(|_| Some(Duration::ZERO)).delay(&ctx).is_none());
    }

    #[test]
    fn test_deserialize_settings() {
        let settings: QuerySettings = serde_json::from_str(
            r#"{
                "dedupe_time_ms": 30,
                "cache_lifetime_ms": 30,
                "revalidate_interval_ms": 1000,
                "revalidate_on_reconnect": true,
                "error_retry": false
            }"#,
        )
        .expect("settings should deserialize");

        assert_eq!(settings.dedupe_time, Some(Duration::from_millis(30)));
        assert_eq!(settings.cache_lifetime, Some(Duration::from_millis(30)));
        assert_eq!(settings.revalidate_interval, Some(Duration::from_secs(1)));
        assert_eq!(settings.revalidate_on_reconnect, Some(true));
        assert!(settings.revalidate_on_focus.is_none());
        assert!(matches!(settings.on_error_retry, Some(ErrorRetry::Disabled)));
    }
}
