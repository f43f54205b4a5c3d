// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module binds a [`ConsumerCore`] to a broker transport. It owns the
//! consumer's Start/Stop state machine and turns every processing outcome into
//! the matching physical operation:
//!
//! - success: ack
//! - failure without retry: reject without requeue, the main queue dead-letters
//!   it to the DLQ
//! - failure with retry: ack, then republish to the retry queue with the next
//!   attempt number and a random expiration

use crate::{
    configs::Configs,
    consumer::{ConsumeOutcome, ConsumerCore, MessageHandler},
    envelope::{FailedEnvelope, HeaderValue, MessageEnvelope},
    errors::AmqpError,
    hosting::HostedConsumer,
    topology::{
        AmqpTopology, AMQP_HEADERS_ATTEMPT, AMQP_HEADERS_BORN, AMQP_HEADERS_GUID, RETRY_ROUTE,
    },
    transport::{AmqpTransport, DeliveryHandler, InboundDelivery, LapinTransport, MessageProperties},
};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::de::DeserializeOwned;
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

const DEFAULT_RETRY_DELAY_CEILING: Duration = Duration::from_secs(60);

struct ConsumerInner<T, H> {
    core: ConsumerCore<T, H>,
    transport: Arc<dyn AmqpTransport>,
    retry_delay_ceiling: Duration,
}

/// A consumer bound to one exchange, reading its main queue.
///
/// The transport is exclusively owned by this consumer.
pub struct RabbitMQConsumer<T, H> {
    inner: Arc<ConsumerInner<T, H>>,
    consumer_tag: Mutex<Option<String>>,
}

impl<T, H> RabbitMQConsumer<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T> + 'static,
{
    /// Creates a consumer over an existing transport.
    ///
    /// Nothing is declared and nothing is consumed until [`start`](Self::start).
    pub fn new(core: ConsumerCore<T, H>, transport: Arc<dyn AmqpTransport>) -> Self {
        RabbitMQConsumer {
            inner: Arc::new(ConsumerInner {
                core,
                transport,
                retry_delay_ceiling: DEFAULT_RETRY_DELAY_CEILING,
            }),
            consumer_tag: Mutex::new(None),
        }
    }

    /// Creates a consumer and opens its connection immediately.
    ///
    /// # Parameters
    /// * `cfg` - Broker settings and retry delay ceiling
    /// * `core` - The consumer core, built with the handler and observers
    pub async fn connect(cfg: &Configs, core: ConsumerCore<T, H>) -> Result<Self, AmqpError> {
        let transport = LapinTransport::connect_new(cfg.clone()).await?;

        Ok(RabbitMQConsumer::new(core, Arc::new(transport))
            .with_retry_delay_ceiling(cfg.retry_delay_ceiling()))
    }

    /// Sets the upper bound of the random delay applied to retried messages.
    ///
    /// Must be called before the consumer is shared.
    pub fn with_retry_delay_ceiling(mut self, ceiling: Duration) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.retry_delay_ceiling = ceiling,
            None => warn!("consumer already shared, retry delay ceiling unchanged"),
        }
        self
    }

    pub fn queue_name(&self) -> &str {
        self.inner.core.queue_name()
    }

    pub fn exchange_name(&self) -> &str {
        &self.inner.core.settings().exchange_name
    }

    /// Whether the consumer holds a subscription on a live connection.
    pub async fn is_connected(&self) -> bool {
        self.consumer_tag.lock().await.is_some() && self.inner.transport.is_connected().await
    }

    /// Declares the topology and starts consuming the main queue.
    ///
    /// No-op when a subscription exists and the connection is alive. When the
    /// connection was lost, a fresh one is opened before anything is declared.
    pub async fn start(&self) -> Result<(), AmqpError> {
        let mut consumer_tag = self.consumer_tag.lock().await;
        let connected = self.inner.transport.is_connected().await;

        if consumer_tag.is_some() && connected {
            debug!(queue = self.queue_name(), "consumer already started");
            return Ok(());
        }

        let queue = self.queue_name();
        for observer in self.inner.core.observers() {
            observer.on_starting(queue);
        }

        if !connected {
            debug!(queue, "opening a new connection");
            self.inner.transport.connect().await?;
        }

        AmqpTopology::tiered(self.exchange_name(), queue)
            .install(self.inner.transport.as_ref())
            .await?;

        let handler: Arc<dyn DeliveryHandler> = self.inner.clone();
        let tag = self.inner.transport.consume(queue, handler).await?;
        *consumer_tag = Some(tag);

        for observer in self.inner.core.observers() {
            observer.on_started(queue);
        }

        Ok(())
    }

    /// Cancels the subscription. No-op when not started.
    pub async fn stop(&self) -> Result<(), AmqpError> {
        let Some(tag) = self.consumer_tag.lock().await.take() else {
            debug!(queue = self.queue_name(), "consumer already stopped");
            return Ok(());
        };

        let queue = self.queue_name();
        for observer in self.inner.core.observers() {
            observer.on_stopping(queue);
        }

        if self.inner.transport.is_connected().await {
            self.inner.transport.cancel(&tag).await?;
        }

        for observer in self.inner.core.observers() {
            observer.on_stopped(queue);
        }

        Ok(())
    }

    /// Stops the consumer, then closes the channel and the connection.
    pub async fn dispose(&self) -> Result<(), AmqpError> {
        let stopped = self.stop().await;
        self.inner.transport.close().await?;
        stopped
    }
}

impl<T, H> ConsumerInner<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T> + 'static,
{
    fn envelope(&self, delivery: &InboundDelivery) -> MessageEnvelope {
        let headers = &delivery.headers;

        let attempt = headers
            .get(AMQP_HEADERS_ATTEMPT)
            .and_then(HeaderValue::as_i64)
            .unwrap_or(1);
        let born_on = headers
            .get(AMQP_HEADERS_BORN)
            .and_then(HeaderValue::as_i64)
            .unwrap_or_else(|| Utc::now().timestamp());
        let correlation_id = headers
            .get(AMQP_HEADERS_GUID)
            .and_then(HeaderValue::as_bytes)
            .and_then(|bytes| Uuid::from_slice_le(bytes).ok())
            .unwrap_or_else(Uuid::new_v4);

        MessageEnvelope::new(
            attempt,
            born_on,
            correlation_id,
            delivery.delivery_tag,
            String::from_utf8_lossy(&delivery.body),
            headers.clone(),
        )
    }

    async fn retry(&self, delivery: &InboundDelivery, failure: &FailedEnvelope) -> Result<(), AmqpError> {
        let envelope = failure.envelope();

        let mut headers = envelope.headers().clone();
        headers.insert(
            AMQP_HEADERS_ATTEMPT.to_owned(),
            HeaderValue::LongLongInt(envelope.attempt_number().saturating_add(1)),
        );
        headers.insert(AMQP_HEADERS_BORN.to_owned(), HeaderValue::LongLongInt(envelope.born_on()));
        headers.insert(
            AMQP_HEADERS_GUID.to_owned(),
            HeaderValue::Bytes(envelope.correlation_id().to_bytes_le().to_vec()),
        );

        let props = MessageProperties {
            headers,
            expiration_ms: Some(retry_delay_ms(self.retry_delay_ceiling)),
        };

        self.transport.ack(delivery.delivery_tag).await?;
        self.transport
            .publish(
                &self.core.settings().exchange_name,
                RETRY_ROUTE,
                &delivery.body,
                &props,
            )
            .await
    }
}

#[async_trait]
impl<T, H> DeliveryHandler for ConsumerInner<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T> + 'static,
{
    async fn on_delivery(&self, delivery: InboundDelivery) -> Result<(), AmqpError> {
        let envelope = self.envelope(&delivery);

        match self.core.consume_internal(&delivery.body, Some(envelope)).await? {
            ConsumeOutcome::Processed(_) => self.transport.ack(delivery.delivery_tag).await,

            ConsumeOutcome::Failed(failure) if failure.retry() => {
                warn!(
                    queue = self.core.queue_name(),
                    attempt = failure.attempt_number(),
                    "error whiling handling msg, sending to retry"
                );
                self.retry(&delivery, &failure).await
            }

            ConsumeOutcome::Failed(failure) => {
                error!(
                    queue = self.core.queue_name(),
                    attempt = failure.attempt_number(),
                    error = failure.error().to_string(),
                    "no more attempts, sending to dlq"
                );
                self.transport.reject(delivery.delivery_tag).await
            }
        }
    }
}

/// Uniform random delay in `[0, ceiling)`, in milliseconds.
fn retry_delay_ms(ceiling: Duration) -> u64 {
    let ceiling = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
    if ceiling == 0 {
        return 0;
    }

    rand::thread_rng().gen_range(0..ceiling)
}

#[async_trait]
impl<T, H> HostedConsumer for RabbitMQConsumer<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T> + 'static,
{
    fn queue_name(&self) -> &str {
        RabbitMQConsumer::queue_name(self)
    }

    async fn is_connected(&self) -> bool {
        RabbitMQConsumer::is_connected(self).await
    }

    async fn start(&self) -> Result<(), AmqpError> {
        RabbitMQConsumer::start(self).await
    }

    async fn stop(&self) -> Result<(), AmqpError> {
        RabbitMQConsumer::stop(self).await
    }

    async fn dispose(&self) -> Result<(), AmqpError> {
        RabbitMQConsumer::dispose(self).await
    }
}
