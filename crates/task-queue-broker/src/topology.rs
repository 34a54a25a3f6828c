//! Broker topology that emulates delayed delivery.
//!
//! Each of the 28 levels owns a topic exchange and a queue whose messages
//! expire after 2^level seconds and are dead-lettered to the next lower level.
//! The countdown of a message is encoded in binary in its routing key, one
//! dotted segment per level (most significant first), so a message waits
//! exactly in the levels whose bit is set before reaching the delivery
//! exchange, which routes it to the application queues.

use crate::connection::{driver_type, Connection};
use crate::entity::{ExchangeKind, ExchangeSpec, QueueSpec, QueueType};
use crate::error::{BrokerError, Result};
use task_queue_core::DeliveryInfo;
use tracing::debug;

pub const MAX_NUMBER_OF_BITS_TO_USE: u32 = 28;
pub const MAX_LEVEL: u32 = MAX_NUMBER_OF_BITS_TO_USE - 1;
pub const DELAYED_DELIVERY_EXCHANGE: &str = "tq_delayed_delivery";

pub fn level_name(level: u32) -> String {
    format!("tq_delayed_{}", level)
}

/// Exchange ETA messages are published to
pub fn entry_exchange() -> String {
    level_name(MAX_LEVEL)
}

/// Routing pattern selecting messages whose bit for `level` equals `bit`
fn level_routing_key(level: u32, bit: char) -> String {
    format!("{}{}.#", "*.".repeat((MAX_LEVEL - level) as usize), bit)
}

/// Declare every level exchange/queue plus the delivery exchange.
pub async fn declare_delayed_delivery_topology(
    connection: &dyn Connection,
    queue_type: QueueType,
) -> Result<()> {
    for level in (0..=MAX_LEVEL).rev() {
        let exchange = ExchangeSpec::topic(level_name(level));
        connection.declare_exchange(&exchange).await?;

        let dead_letter_exchange = if level > 0 {
            level_name(level - 1)
        } else {
            DELAYED_DELIVERY_EXCHANGE.to_string()
        };

        let mut queue = QueueSpec::new(level_name(level), exchange, level_routing_key(level, '1'))
            .argument("x-queue-type", queue_type.as_str())
            .argument("x-overflow", "reject-publish")
            .argument("x-message-ttl", (1u64 << level) * 1000)
            .argument("x-dead-letter-exchange", dead_letter_exchange);
        if queue_type == QueueType::Quorum {
            queue = queue.argument("x-dead-letter-strategy", "at-least-once");
        }

        connection.declare_queue(&queue).await?;
        connection
            .bind_queue(&queue.name, &queue.exchange.name, &queue.routing_key)
            .await?;
    }

    // Messages whose bit is clear skip straight to the next level.
    for level in (1..=MAX_LEVEL).rev() {
        connection
            .bind_exchange(
                &level_name(level - 1),
                &level_name(level),
                &level_routing_key(level, '0'),
            )
            .await?;
    }

    let delivery = ExchangeSpec::topic(DELAYED_DELIVERY_EXCHANGE);
    connection.declare_exchange(&delivery).await?;
    connection
        .bind_exchange(DELAYED_DELIVERY_EXCHANGE, &level_name(0), &level_routing_key(0, '0'))
        .await?;

    debug!("Declared {} delayed delivery levels", MAX_NUMBER_OF_BITS_TO_USE);
    Ok(())
}

/// Result of binding an application queue to the delivery exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    Bound { routing_key: String },
    /// Direct exchanges cannot match the encoded routing keys
    SkippedDirect,
    /// Fanout exchanges need no delayed routing
    SkippedFanout,
}

pub async fn bind_queue_to_delayed_delivery_exchange(
    connection: &dyn Connection,
    queue: &QueueSpec,
) -> Result<BindOutcome> {
    match queue.exchange.kind {
        ExchangeKind::Direct => return Ok(BindOutcome::SkippedDirect),
        ExchangeKind::Fanout => return Ok(BindOutcome::SkippedFanout),
        ExchangeKind::Topic | ExchangeKind::Headers => {}
    }

    let routing_key = if queue.routing_key.starts_with('#') {
        queue.routing_key.clone()
    } else {
        format!("#.{}", queue.routing_key)
    };

    connection
        .bind_exchange(&queue.exchange.name, DELAYED_DELIVERY_EXCHANGE, &routing_key)
        .await?;
    connection
        .bind_queue(&queue.name, &queue.exchange.name, &routing_key)
        .await?;

    Ok(BindOutcome::Bound { routing_key })
}

/// Destination that makes the level queues hold a message for `countdown`
/// seconds before it reaches the queues bound under `routing_key`.
pub fn delayed_delivery_info(countdown: u64, routing_key: &str) -> Result<DeliveryInfo> {
    Ok(DeliveryInfo {
        exchange: entry_exchange(),
        routing_key: calculate_routing_key(countdown, routing_key)?,
    })
}

/// Routing key encoding `countdown` seconds in front of `routing_key`
pub fn calculate_routing_key(countdown: u64, routing_key: &str) -> Result<String> {
    if countdown < 1 || countdown >= 1u64 << MAX_NUMBER_OF_BITS_TO_USE {
        return Err(BrokerError::InvalidCountdown(countdown));
    }

    let bits = format!("{:0width$b}", countdown, width = MAX_NUMBER_OF_BITS_TO_USE as usize);
    let dotted: Vec<String> = bits.chars().map(String::from).collect();
    Ok(format!("{}.{}", dotted.join("."), routing_key))
}

/// Whether any queue uses quorum semantics on an AMQP broker.
///
/// Returns the name of the first quorum queue found.
pub fn detect_quorum_queues(queues: &[QueueSpec], broker_url: &str) -> (bool, Option<String>) {
    if driver_type(broker_url) != "amqp" {
        return (false, None);
    }

    queues
        .iter()
        .find(|q| q.queue_type() == Some(QueueType::Quorum.as_str()))
        .map_or((false, None), |q| (true, Some(q.name.clone())))
}
