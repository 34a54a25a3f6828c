use crate::revoked::RevocationRegistry;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use task_queue_broker::{ExchangeKind, ExchangeSpec, ParseQueueTypeError, QueueSpec, QueueType};
use task_queue_core::{
    Backoff, RetryPolicy, RetrySchedule, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF_MAX_SECS,
    DEFAULT_RETRY_DELAY_SECS, DEFAULT_TIME_LIMIT_SECS,
};
use thiserror::Error;

/// Invalid worker configuration, fatal at startup
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("broker_url configuration is empty")]
    EmptyBrokerUrl,

    #[error("No valid broker URLs found in configuration")]
    NoValidBrokerUrls,

    #[error("delayed_delivery.queue_type is not configured")]
    MissingQueueType,

    #[error("{0}")]
    InvalidQueueType(#[from] ParseQueueTypeError),
}

/// One URL with `;` separators, or a list of URLs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BrokerUrls {
    One(String),
    Many(Vec<String>),
}

impl BrokerUrls {
    /// First configured URL, used to pick the transport driver
    pub fn first(&self) -> Option<&str> {
        match self {
            BrokerUrls::One(urls) => urls.split(';').map(str::trim).find(|u| !u.is_empty()),
            BrokerUrls::Many(urls) => urls.iter().map(|u| u.trim()).find(|u| !u.is_empty()),
        }
    }
}

impl Default for BrokerUrls {
    fn default() -> Self {
        BrokerUrls::One("amqp://guest@localhost//".to_string())
    }
}

impl From<&str> for BrokerUrls {
    fn from(urls: &str) -> Self {
        BrokerUrls::One(urls.to_string())
    }
}

/// Distinct broker URLs in configuration order
pub fn validate_broker_urls(broker_url: &BrokerUrls) -> Result<Vec<String>, ConfigError> {
    let candidates: Vec<&str> = match broker_url {
        BrokerUrls::One(urls) if urls.trim().is_empty() => return Err(ConfigError::EmptyBrokerUrl),
        BrokerUrls::Many(urls) if urls.is_empty() => return Err(ConfigError::EmptyBrokerUrl),
        BrokerUrls::One(urls) => urls.split(';').collect(),
        BrokerUrls::Many(urls) => urls.iter().map(String::as_str).collect(),
    };

    let mut valid: Vec<String> = Vec::new();
    for url in candidates.into_iter().map(str::trim).filter(|u| !u.is_empty()) {
        if !valid.iter().any(|v| v == url) {
            valid.push(url.to_string());
        }
    }

    if valid.is_empty() {
        return Err(ConfigError::NoValidBrokerUrls);
    }
    Ok(valid)
}

pub fn validate_queue_type(queue_type: Option<&str>) -> Result<QueueType, ConfigError> {
    match queue_type.map(str::trim) {
        None | Some("") => Err(ConfigError::MissingQueueType),
        Some(value) => Ok(value.parse::<QueueType>()?),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    /// Defaults to the queue name
    pub exchange: Option<String>,
    pub exchange_kind: ExchangeKind,
    /// Defaults to the queue name
    pub routing_key: Option<String>,
    pub queue_type: Option<QueueType>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            name: "default".to_string(),
            exchange: None,
            exchange_kind: ExchangeKind::Topic,
            routing_key: None,
            queue_type: None,
        }
    }
}

impl QueueConfig {
    pub fn to_spec(&self) -> QueueSpec {
        let exchange = ExchangeSpec::new(
            self.exchange.clone().unwrap_or_else(|| self.name.clone()),
            self.exchange_kind,
        );
        let routing_key = self.routing_key.clone().unwrap_or_else(|| self.name.clone());
        let spec = QueueSpec::new(self.name.clone(), exchange, routing_key);

        match self.queue_type {
            Some(queue_type) => spec.argument("x-queue-type", queue_type.as_str()),
            None => spec,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayedDeliveryConfig {
    pub queue_type: Option<String>,
    /// Retries per broker URL before giving up on it
    pub max_retries: u32,
    pub retry_interval_secs: f64,
    pub retry_interval_max_secs: f64,
}

impl Default for DelayedDeliveryConfig {
    fn default() -> Self {
        DelayedDeliveryConfig {
            queue_type: Some(QueueType::Quorum.as_str().to_string()),
            max_retries: 3,
            retry_interval_secs: 1.0,
            retry_interval_max_secs: 30.0,
        }
    }
}

impl DelayedDeliveryConfig {
    pub fn schedule(&self) -> RetrySchedule {
        let start = Duration::try_from_secs_f64(self.retry_interval_secs)
            .unwrap_or(Duration::from_secs(1));
        let max = Duration::try_from_secs_f64(self.retry_interval_max_secs)
            .unwrap_or(Duration::from_secs(30));
        RetrySchedule::new(Some(self.max_retries), start, max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RevokedConfig {
    pub expires_secs: u64,
    pub max_entries: usize,
    /// How often task admission purges expired entries
    pub purge_interval_secs: u64,
}

impl Default for RevokedConfig {
    fn default() -> Self {
        RevokedConfig {
            expires_secs: 10800,
            max_entries: 50000,
            purge_interval_secs: 1,
        }
    }
}

impl RevokedConfig {
    pub fn build_registry(&self) -> RevocationRegistry {
        RevocationRegistry::new(Duration::from_secs(self.expires_secs))
            .with_max_entries(self.max_entries)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

/// Policy every registered task starts from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDefaults {
    pub max_retries: Option<u32>,
    pub default_retry_delay_secs: u64,
    pub retry_backoff: Backoff,
    pub retry_backoff_max_secs: u64,
    pub retry_jitter: bool,
    pub time_limit_secs: Option<u64>,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        TaskDefaults {
            max_retries: Some(DEFAULT_MAX_RETRIES),
            default_retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            retry_backoff: Backoff::Disabled,
            retry_backoff_max_secs: DEFAULT_RETRY_BACKOFF_MAX_SECS,
            retry_jitter: true,
            time_limit_secs: Some(DEFAULT_TIME_LIMIT_SECS),
        }
    }
}

impl TaskDefaults {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            default_retry_delay: self.default_retry_delay_secs,
            retry_backoff: self.retry_backoff,
            retry_backoff_max: self.retry_backoff_max_secs,
            retry_jitter: self.retry_jitter,
            time_limit: self.time_limit_secs,
            ..RetryPolicy::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub broker_url: BrokerUrls,
    pub worker_id: Option<String>,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub graceful_shutdown_timeout_secs: u64,
    pub queues: Vec<QueueConfig>,
    pub delayed_delivery: DelayedDeliveryConfig,
    pub revoked: RevokedConfig,
    pub task_defaults: TaskDefaults,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            broker_url: BrokerUrls::default(),
            worker_id: None,
            concurrency: 4,
            poll_interval_ms: 100,
            graceful_shutdown_timeout_secs: 60,
            queues: vec![QueueConfig::default()],
            delayed_delivery: DelayedDeliveryConfig::default(),
            revoked: RevokedConfig::default(),
            task_defaults: TaskDefaults::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: WorkerConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn queue_specs(&self) -> Vec<QueueSpec> {
        self.queues.iter().map(QueueConfig::to_spec).collect()
    }

    pub fn generate_worker_id(&self) -> String {
        use std::process;
        use uuid::Uuid;

        if let Some(id) = &self.worker_id {
            return id.clone();
        }

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let pid = process::id();
        let random = Uuid::new_v4().simple().to_string();

        format!("{}-{}-{}", hostname, pid, &random[..8])
    }
}
