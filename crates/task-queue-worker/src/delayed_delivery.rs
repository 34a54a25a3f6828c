//! Startup step that prepares broker-side delayed delivery.
//!
//! Brokers without native scheduling get the level exchange/queue topology
//! from [`task_queue_broker::topology`]. When setup succeeds the worker turns
//! on its [`DelayedDeliveryPublisher`], and retries with a countdown then wait
//! inside the broker instead of inside the worker.
//!
//! [`DelayedDeliveryPublisher`]: task_queue_broker::DelayedDeliveryPublisher

use crate::config::{validate_broker_urls, validate_queue_type, BrokerUrls, ConfigError, DelayedDeliveryConfig};
use std::sync::Arc;
use std::time::Duration;
use task_queue_broker::{
    bind_queue_to_delayed_delivery_exchange, declare_delayed_delivery_topology,
    detect_quorum_queues, BindOutcome, BrokerConnection, BrokerError, Connection, QueueSpec,
    QueueType,
};
use task_queue_core::{retry_over_time, Intervals};
use tracing::{debug, error, info, warn};

pub struct DelayedDelivery {
    connector: Arc<dyn BrokerConnection>,
    config: DelayedDeliveryConfig,
}

impl DelayedDelivery {
    pub fn new(connector: Arc<dyn BrokerConnection>, config: DelayedDeliveryConfig) -> Self {
        DelayedDelivery { connector, config }
    }

    /// Whether the step runs for this worker: only when quorum queues are
    /// consumed over an AMQP broker.
    pub fn include_if(broker_url: &str, queues: &[QueueSpec]) -> bool {
        detect_quorum_queues(queues, broker_url).0
    }

    /// Set up delayed delivery on every configured broker URL.
    ///
    /// Returns whether at least one broker is ready. Only configuration errors
    /// are returned as errors; broker failures are logged and leave the worker
    /// without delayed delivery.
    pub async fn start(&self, broker_url: &BrokerUrls, queues: &[QueueSpec]) -> Result<bool, ConfigError> {
        let (urls, queue_type) = match self.validate(broker_url) {
            Ok(validated) => validated,
            Err(e) => {
                critical!("Configuration validation failed: {}", e);
                return Err(e);
            }
        };

        let schedule = self.config.schedule();
        let mut failures = 0;

        for url in &urls {
            let result = retry_over_time(
                move || self.setup_delayed_delivery(url, queue_type, queues),
                BrokerError::is_connection_error,
                |e, intervals, retries| self.on_retry(e, intervals, retries),
                &schedule,
            )
            .await;

            if let Err(e) = result {
                warn!(broker_url = %url, "Failed to setup delayed delivery for {}: {}", url, e);
                failures += 1;
            }
        }

        if failures == urls.len() {
            critical!(
                "Failed to setup delayed delivery for all broker URLs. \
                 Native delayed delivery will not be available."
            );
            return Ok(false);
        }

        Ok(true)
    }

    fn validate(&self, broker_url: &BrokerUrls) -> Result<(Vec<String>, QueueType), ConfigError> {
        let urls = validate_broker_urls(broker_url)?;
        let queue_type = validate_queue_type(self.config.queue_type.as_deref())?;
        Ok((urls, queue_type))
    }

    async fn setup_delayed_delivery(
        &self,
        url: &str,
        queue_type: QueueType,
        queues: &[QueueSpec],
    ) -> Result<(), BrokerError> {
        let connection = self.connector.connect(url).await?;
        debug!(
            "Setting up delayed delivery for broker {} with queue type {}",
            url, queue_type
        );

        let result = self
            .declare_and_bind(connection.as_ref(), url, queue_type, queues)
            .await;

        if let Err(e) = connection.close().await {
            debug!("Failed to close connection to {}: {}", url, e);
        }
        result
    }

    async fn declare_and_bind(
        &self,
        connection: &dyn Connection,
        url: &str,
        queue_type: QueueType,
        queues: &[QueueSpec],
    ) -> Result<(), BrokerError> {
        if let Err(e) = declare_delayed_delivery_topology(connection, queue_type).await {
            warn!(broker_url = %url, "Failed to declare exchanges and queues for {}: {}", url, e);
            return Err(e);
        }

        if let Err(e) = self.bind_queues(connection, queues).await {
            warn!(broker_url = %url, "Failed to bind queues for {}: {}", url, e);
            return Err(e);
        }

        Ok(())
    }

    async fn bind_queues(&self, connection: &dyn Connection, queues: &[QueueSpec]) -> Result<(), BrokerError> {
        if queues.is_empty() {
            warn!("No queues found to bind for delayed delivery");
            return Ok(());
        }

        for queue in queues {
            debug!("Binding queue {} to delayed delivery exchange", queue.name);
            match bind_queue_to_delayed_delivery_exchange(connection, queue).await {
                Ok(BindOutcome::Bound { routing_key }) => {
                    info!(queue = %queue.name, "Bound queue {} with routing key {}", queue.name, routing_key);
                }
                Ok(BindOutcome::SkippedDirect) => {
                    warn!(
                        queue = %queue.name,
                        "Exchange {} is a direct exchange and native delayed delivery do not support direct exchanges.\n\
                         ETA tasks published to this exchange will block the worker until the ETA arrives.",
                        queue.exchange.name
                    );
                }
                Ok(BindOutcome::SkippedFanout) => {}
                Err(e) => {
                    error!(queue = %queue.name, "Failed to bind queue {}: {}", queue.name, e);
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    fn on_retry(&self, e: &BrokerError, intervals: &mut Intervals, retries: u32) -> Duration {
        let interval = intervals.next().unwrap_or(self.config.schedule().interval_max);
        warn!(
            attempt = retries + 1,
            "Retrying delayed delivery setup (attempt {}/{}) after error: {}. Next retry in {:.2}s",
            retries + 1,
            self.config.max_retries,
            e,
            interval.as_secs_f64()
        );
        interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::capture_logs;
    use task_queue_broker::{ExchangeKind, ExchangeSpec, MemoryTransport};

    fn topic_queue(name: &str) -> QueueSpec {
        QueueSpec::new(name, ExchangeSpec::topic(name), name)
    }

    fn setup(transport: &MemoryTransport, config: DelayedDeliveryConfig) -> DelayedDelivery {
        DelayedDelivery::new(Arc::new(transport.clone()), config)
    }

    fn classic(max_retries: u32) -> DelayedDeliveryConfig {
        DelayedDeliveryConfig {
            queue_type: Some("classic".to_string()),
            max_retries,
            ..DelayedDeliveryConfig::default()
        }
    }

    #[test]
    fn test_include_if() {
        let plain = vec![topic_queue("tasks")];
        let quorum = vec![topic_queue("tasks").argument("x-queue-type", "quorum")];

        assert!(!DelayedDelivery::include_if("amqp://", &plain));
        assert!(DelayedDelivery::include_if("amqp://", &quorum));
        assert!(!DelayedDelivery::include_if("redis://", &quorum));
    }

    #[tokio::test]
    async fn test_topic_exchange() {
        let (logs, _guard) = capture_logs();
        let transport = MemoryTransport::new();

        let ready = setup(&transport, classic(3))
            .start(&"amqp://".into(), &[topic_queue("tasks")])
            .await
            .unwrap();

        assert!(ready);
        assert!(logs.records().is_empty());
        let topology = transport.topology();
        assert_eq!(topology.queues.len(), 28);
        assert!(topology.exchanges.contains_key("tq_delayed_delivery"));
    }

    #[tokio::test]
    async fn test_direct_exchange() {
        let (logs, _guard) = capture_logs();
        let transport = MemoryTransport::new();
        let queue = QueueSpec::new(
            "tasks",
            ExchangeSpec::new("tasks", ExchangeKind::Direct),
            "tasks",
        );

        setup(&transport, classic(3))
            .start(&"amqp://".into(), &[queue])
            .await
            .unwrap();

        assert_eq!(
            logs.warnings(),
            vec![
                "Exchange tasks is a direct exchange and native delayed delivery do not support direct exchanges.\n\
                 ETA tasks published to this exchange will block the worker until the ETA arrives."
                    .to_string()
            ]
        );
        assert_eq!(logs.records().len(), 1);
    }

    #[tokio::test]
    async fn test_fanout_exchange() {
        let (logs, _guard) = capture_logs();
        let transport = MemoryTransport::new();
        let queue = QueueSpec::new("fan", ExchangeSpec::new("fan", ExchangeKind::Fanout), "fan");

        setup(&transport, classic(3))
            .start(&"amqp://".into(), &[queue])
            .await
            .unwrap();

        assert!(logs.records().is_empty());
    }

    #[tokio::test]
    async fn test_no_queues() {
        let (logs, _guard) = capture_logs();
        let transport = MemoryTransport::new();

        setup(&transport, classic(3)).start(&"amqp://".into(), &[]).await.unwrap();

        assert_eq!(logs.warnings(), vec!["No queues found to bind for delayed delivery".to_string()]);
        assert!(logs.criticals().is_empty());
    }

    #[tokio::test]
    async fn test_configuration_validation_error() {
        let (logs, _guard) = capture_logs();
        let transport = MemoryTransport::new();

        let err = setup(&transport, classic(3))
            .start(&"".into(), &[topic_queue("tasks")])
            .await
            .unwrap_err();

        assert_eq!(err, ConfigError::EmptyBrokerUrl);
        let records = logs.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].critical);
        assert!(records[0].message.contains("Configuration validation failed"));
        assert_eq!(transport.connect_attempts(""), 0);
    }

    #[tokio::test]
    async fn test_invalid_queue_type() {
        let (logs, _guard) = capture_logs();
        let transport = MemoryTransport::new();
        let config = DelayedDeliveryConfig {
            queue_type: Some("invalid".to_string()),
            ..DelayedDeliveryConfig::default()
        };

        let err = setup(&transport, config)
            .start(&"amqp://".into(), &[topic_queue("tasks")])
            .await
            .unwrap_err();

        assert!(matches!(err, ConfigError::InvalidQueueType(_)));
        assert_eq!(logs.criticals().len(), 1);
        assert_eq!(transport.connect_attempts("amqp://"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_brokers_exhaust_retries() {
        let (logs, _guard) = capture_logs();
        let transport = MemoryTransport::new();
        transport.set_unreachable("amqp://a");
        transport.set_unreachable("amqp://b");

        let ready = setup(&transport, classic(2))
            .start(&"amqp://a;amqp://b".into(), &[topic_queue("tasks")])
            .await
            .unwrap();

        assert!(!ready);
        // first try plus two retries per URL
        assert_eq!(transport.connect_attempts("amqp://a"), 3);
        assert_eq!(transport.connect_attempts("amqp://b"), 3);

        let warnings = logs.warnings();
        let (retries, per_url): (Vec<&String>, Vec<&String>) =
            warnings.iter().partition(|w| w.starts_with("Retrying delayed delivery setup"));
        assert_eq!(retries.len(), 4);
        assert!(retries[0].contains("attempt 1/2"));
        assert!(retries[1].contains("attempt 2/2"));
        assert!(retries[0].contains("Connection refused"));
        assert!(retries[0].ends_with("Next retry in 1.00s"));
        assert!(retries[1].ends_with("Next retry in 2.00s"));

        assert_eq!(per_url.len(), 2);
        assert!(per_url[0].starts_with("Failed to setup delayed delivery for amqp://a"));
        assert!(per_url[1].starts_with("Failed to setup delayed delivery for amqp://b"));

        assert_eq!(
            logs.criticals(),
            vec!["Failed to setup delayed delivery for all broker URLs. Native delayed delivery will not be available.".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unreachable_brokers_without_retries() {
        let (logs, _guard) = capture_logs();
        let transport = MemoryTransport::new();
        transport.set_unreachable("amqp://a");
        transport.set_unreachable("amqp://b");

        setup(&transport, classic(0))
            .start(&"amqp://a;amqp://b".into(), &[topic_queue("tasks")])
            .await
            .unwrap();

        assert_eq!(logs.warnings().len(), 2);
        assert_eq!(logs.criticals().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_reachable_broker_is_enough() {
        let (logs, _guard) = capture_logs();
        let transport = MemoryTransport::new();
        transport.set_unreachable("amqp://a");

        let ready = setup(&transport, classic(1))
            .start(&"amqp://a;amqp://b".into(), &[topic_queue("tasks")])
            .await
            .unwrap();

        assert!(ready);
        assert!(logs.criticals().is_empty());
        assert_eq!(transport.connect_attempts("amqp://b"), 1);
        assert_eq!(transport.topology().queues.len(), 28);
    }

    #[tokio::test]
    async fn test_declare_error() {
        let (logs, _guard) = capture_logs();
        let transport = MemoryTransport::new();
        transport.fail_declarations(true);

        setup(&transport, classic(3))
            .start(&"amqp://".into(), &[topic_queue("tasks")])
            .await
            .unwrap();

        // not a connection error, so no retries
        assert_eq!(transport.connect_attempts("amqp://"), 1);
        let warnings = logs.warnings();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].starts_with("Failed to declare exchanges and queues for amqp://"));
        assert_eq!(logs.criticals().len(), 1);
    }

    #[tokio::test]
    async fn test_bind_error() {
        let (logs, _guard) = capture_logs();
        let transport = MemoryTransport::new();
        transport.fail_bind("tasks");

        setup(&transport, classic(3))
            .start(&"amqp://".into(), &[topic_queue("tasks")])
            .await
            .unwrap();

        assert_eq!(logs.errors().len(), 1);
        assert!(logs.errors()[0].starts_with("Failed to bind queue tasks"));
        let warnings = logs.warnings();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].starts_with("Failed to bind queues for amqp://"));
        assert_eq!(logs.criticals().len(), 1);
    }
}
