use crate::exception::{matches_any, ErrorKind};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 180;
pub const DEFAULT_RETRY_BACKOFF_MAX_SECS: u64 = 600;
pub const DEFAULT_TIME_LIMIT_SECS: u64 = 300;

/// Exponential backoff setting of a retry policy.
///
/// A zero factor behaves like `Disabled`. Any other factor is normalised with
/// `trunc(max(1, factor))`, so negative or fractional factors fall back to the
/// plain doubling schedule.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "BackoffRepr", into = "BackoffRepr")]
pub enum Backoff {
    #[default]
    Disabled,
    Enabled,
    Factor(f64),
}

impl Backoff {
    /// Integer multiplier for `multiplier * 2^n`, `None` when backoff is off.
    pub fn multiplier(&self) -> Option<u64> {
        match *self {
            Backoff::Disabled => None,
            Backoff::Enabled => Some(1),
            Backoff::Factor(f) if f == 0.0 => None,
            Backoff::Factor(f) => Some(f.max(1.0).trunc() as u64),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.multiplier().is_some()
    }
}

impl From<bool> for Backoff {
    fn from(enabled: bool) -> Self {
        if enabled {
            Backoff::Enabled
        } else {
            Backoff::Disabled
        }
    }
}

impl From<f64> for Backoff {
    fn from(factor: f64) -> Self {
        Backoff::Factor(factor)
    }
}

impl From<i64> for Backoff {
    fn from(factor: i64) -> Self {
        Backoff::Factor(factor as f64)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum BackoffRepr {
    Flag(bool),
    Factor(f64),
}

impl From<BackoffRepr> for Backoff {
    fn from(repr: BackoffRepr) -> Self {
        match repr {
            BackoffRepr::Flag(flag) => Backoff::from(flag),
            BackoffRepr::Factor(factor) => Backoff::Factor(factor),
        }
    }
}

impl From<Backoff> for BackoffRepr {
    fn from(backoff: Backoff) -> Self {
        match backoff {
            Backoff::Disabled => BackoffRepr::Flag(false),
            Backoff::Enabled => BackoffRepr::Flag(true),
            Backoff::Factor(factor) => BackoffRepr::Factor(factor),
        }
    }
}

/// Options forwarded to every automatic retry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryKwargs {
    pub max_retries: Option<u32>,
    pub countdown: Option<u64>,
}

/// Retry behaviour attached to a registered task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Error kinds retried automatically
    pub autoretry_for: Vec<ErrorKind>,
    /// Error kinds never retried automatically; wins over `autoretry_for`
    pub dont_autoretry_for: Vec<ErrorKind>,
    /// `None` retries forever
    pub max_retries: Option<u32>,
    pub retry_kwargs: RetryKwargs,
    pub retry_backoff: Backoff,
    /// Ceiling for computed backoff delays, in seconds
    pub retry_backoff_max: u64,
    pub retry_jitter: bool,
    /// Countdown used when neither the caller nor backoff supplies one
    pub default_retry_delay: u64,
    /// Hard execution limit in seconds, `None` for no limit
    pub time_limit: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            autoretry_for: Vec::new(),
            dont_autoretry_for: Vec::new(),
            max_retries: Some(DEFAULT_MAX_RETRIES),
            retry_kwargs: RetryKwargs::default(),
            retry_backoff: Backoff::Disabled,
            retry_backoff_max: DEFAULT_RETRY_BACKOFF_MAX_SECS,
            retry_jitter: true,
            default_retry_delay: DEFAULT_RETRY_DELAY_SECS,
            time_limit: Some(DEFAULT_TIME_LIMIT_SECS),
        }
    }
}

impl RetryPolicy {
    /// Whether an error of `kind` should be retried without the task asking
    pub fn should_autoretry(&self, kind: &ErrorKind) -> bool {
        if matches_any(kind, &self.dont_autoretry_for) {
            return false;
        }
        matches_any(kind, &self.autoretry_for)
    }

    /// Effective policy of a task registered on top of `self`.
    ///
    /// Every field set in `overrides` replaces the base value; unset fields
    /// are inherited.
    pub fn merge(&self, overrides: &PolicyOverrides) -> RetryPolicy {
        RetryPolicy {
            autoretry_for: overrides
                .autoretry_for
                .clone()
                .unwrap_or_else(|| self.autoretry_for.clone()),
            dont_autoretry_for: overrides
                .dont_autoretry_for
                .clone()
                .unwrap_or_else(|| self.dont_autoretry_for.clone()),
            max_retries: overrides.max_retries.unwrap_or(self.max_retries),
            retry_kwargs: overrides
                .retry_kwargs
                .clone()
                .unwrap_or_else(|| self.retry_kwargs.clone()),
            retry_backoff: overrides.retry_backoff.unwrap_or(self.retry_backoff),
            retry_backoff_max: overrides
                .retry_backoff_max
                .unwrap_or(self.retry_backoff_max),
            retry_jitter: overrides.retry_jitter.unwrap_or(self.retry_jitter),
            default_retry_delay: overrides
                .default_retry_delay
                .unwrap_or(self.default_retry_delay),
            time_limit: overrides.time_limit.unwrap_or(self.time_limit),
        }
    }
}

/// Per-field overrides applied on top of a base [`RetryPolicy`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOverrides {
    pub autoretry_for: Option<Vec<ErrorKind>>,
    pub dont_autoretry_for: Option<Vec<ErrorKind>>,
    pub max_retries: Option<Option<u32>>,
    pub retry_kwargs: Option<RetryKwargs>,
    pub retry_backoff: Option<Backoff>,
    pub retry_backoff_max: Option<u64>,
    pub retry_jitter: Option<bool>,
    pub default_retry_delay: Option<u64>,
    pub time_limit: Option<Option<u64>>,
}

impl PolicyOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn autoretry_for<K: Into<ErrorKind>>(mut self, kinds: impl IntoIterator<Item = K>) -> Self {
        self.autoretry_for = Some(kinds.into_iter().map(Into::into).collect());
        self
    }

    pub fn dont_autoretry_for<K: Into<ErrorKind>>(
        mut self,
        kinds: impl IntoIterator<Item = K>,
    ) -> Self {
        self.dont_autoretry_for = Some(kinds.into_iter().map(Into::into).collect());
        self
    }

    pub fn max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn retry_kwargs(mut self, retry_kwargs: RetryKwargs) -> Self {
        self.retry_kwargs = Some(retry_kwargs);
        self
    }

    pub fn retry_backoff(mut self, backoff: impl Into<Backoff>) -> Self {
        self.retry_backoff = Some(backoff.into());
        self
    }

    pub fn retry_backoff_max(mut self, seconds: u64) -> Self {
        self.retry_backoff_max = Some(seconds);
        self
    }

    pub fn retry_jitter(mut self, jitter: bool) -> Self {
        self.retry_jitter = Some(jitter);
        self
    }

    pub fn default_retry_delay(mut self, seconds: u64) -> Self {
        self.default_retry_delay = Some(seconds);
        self
    }

    pub fn time_limit(mut self, seconds: Option<u64>) -> Self {
        self.time_limit = Some(seconds);
        self
    }
}
