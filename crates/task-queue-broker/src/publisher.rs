//! Publishing through the delayed-delivery levels.
//!
//! Once the level topology is declared, messages with a countdown are sent to
//! the top level exchange with the countdown encoded in their routing key, so
//! the broker holds them instead of the consuming worker.

use crate::topology::{delayed_delivery_info, MAX_NUMBER_OF_BITS_TO_USE};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use task_queue_core::{Enqueuer, PublishError, TaskMessage};
use tracing::debug;

pub struct DelayedDeliveryPublisher {
    inner: Arc<dyn Enqueuer>,
    default_routing_key: String,
    enabled: AtomicBool,
}

impl DelayedDeliveryPublisher {
    /// Starts disabled; messages pass through untouched until [`enable`].
    ///
    /// [`enable`]: DelayedDeliveryPublisher::enable
    pub fn new(inner: Arc<dyn Enqueuer>, default_routing_key: impl Into<String>) -> Self {
        DelayedDeliveryPublisher {
            inner,
            default_routing_key: default_routing_key.into(),
            enabled: AtomicBool::new(false),
        }
    }

    /// Route delayed messages through the level exchanges from now on
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn route(&self, message: &mut TaskMessage) {
        let delay = match (message.countdown, message.eta) {
            (Some(countdown), _) => countdown,
            (None, Some(eta)) => (eta - Utc::now()).num_seconds().max(0) as u64,
            (None, None) => return,
        };
        // Too short or too long for the levels: the consumer waits instead.
        if delay < 1 || delay >= 1u64 << MAX_NUMBER_OF_BITS_TO_USE {
            debug!("Publishing {}[{}] without delayed delivery", message.task, message.id);
            return;
        }

        let routing_key = message
            .routing_key
            .as_deref()
            .unwrap_or(self.default_routing_key.as_str());
        message.delivery = delayed_delivery_info(delay, routing_key).ok();
    }
}

#[async_trait]
impl Enqueuer for DelayedDeliveryPublisher {
    async fn publish(&self, mut message: TaskMessage) -> Result<(), PublishError> {
        if self.is_enabled() {
            self.route(&mut message);
        }
        self.inner.publish(message).await
    }
}
