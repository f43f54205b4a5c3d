// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! `AmqpTransport` is the seam between the retry/envelope engine and the
//! broker. It exposes the physical primitives the engine needs: liveness,
//! (re)connection, topology declaration, publish, ack/reject, and the
//! registration of a delivery callback.
//!
//! `LapinTransport` implements it on top of a single `lapin` connection and
//! channel, exclusively owned by one producer or consumer.

use crate::{
    channel::new_amqp_channel,
    configs::Configs,
    envelope::{HeaderValue, Headers},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    topology::{AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties, Channel, Connection, ExchangeKind,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, error};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

const REPLY_SUCCESS: u16 = 200;

/// One physical delivery, as handed over by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub headers: Headers,
}

impl From<Delivery> for InboundDelivery {
    fn from(delivery: Delivery) -> Self {
        let headers = delivery
            .properties
            .headers()
            .as_ref()
            .map(headers_from_field_table)
            .unwrap_or_default();

        InboundDelivery {
            delivery_tag: delivery.delivery_tag,
            body: delivery.data,
            headers,
        }
    }
}

/// Properties attached to an outbound message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub headers: Headers,
    /// Per-message expiration, in milliseconds.
    pub expiration_ms: Option<u64>,
}

/// Callback invoked for every delivery of a subscription.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn on_delivery(&self, delivery: InboundDelivery) -> Result<(), AmqpError>;
}

/// Physical broker operations used by producers and consumers.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpTransport: Send + Sync {
    /// Whether both the connection and the channel are open.
    async fn is_connected(&self) -> bool;

    /// Opens a fresh connection and channel, replacing any previous ones.
    async fn connect(&self) -> Result<(), AmqpError>;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        props: &MessageProperties,
    ) -> Result<(), AmqpError>;

    /// Acknowledges a single delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Rejects a single delivery without requeue, so the broker dead-letters it.
    async fn reject(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Starts consuming `queue`, returning the subscription's consumer tag.
    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Closes the channel, then the connection. No-op when never connected.
    async fn close(&self) -> Result<(), AmqpError>;
}

struct AmqpState {
    conn: Arc<Connection>,
    channel: Arc<Channel>,
}

/// `lapin`-backed transport.
pub struct LapinTransport {
    cfg: Configs,
    state: RwLock<Option<AmqpState>>,
}

impl LapinTransport {
    /// Creates a transport that connects lazily, on the first `connect` call.
    pub fn new(cfg: Configs) -> LapinTransport {
        LapinTransport {
            cfg,
            state: RwLock::new(None),
        }
    }

    /// Creates a transport and connects it immediately.
    pub async fn connect_new(cfg: Configs) -> Result<LapinTransport, AmqpError> {
        let transport = LapinTransport::new(cfg);
        transport.connect().await?;
        Ok(transport)
    }

    async fn channel(&self) -> Result<Arc<Channel>, AmqpError> {
        match self.state.read().await.as_ref() {
            Some(state) => Ok(state.channel.clone()),
            None => {
                error!("no amqp channel available");
                Err(AmqpError::ChannelError)
            }
        }
    }
}

#[async_trait]
impl AmqpTransport for LapinTransport {
    async fn is_connected(&self) -> bool {
        self.state
            .read()
            .await
            .as_ref()
            .is_some_and(|s| s.conn.status().connected() && s.channel.status().connected())
    }

    async fn connect(&self) -> Result<(), AmqpError> {
        let (conn, channel) = new_amqp_channel(&self.cfg).await?;
        *self.state.write().await = Some(AmqpState { conn, channel });
        Ok(())
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        match channel
            .exchange_declare(
                &def.name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        let mut args = BTreeMap::new();
        if let Some(exchange) = &def.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.clone())),
            );
        }
        if let Some(key) = &def.dead_letter_routing_key {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.clone())),
            );
        }

        match channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::from(args),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        match channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        props: &MessageProperties,
    ) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(2)
            .with_headers(headers_to_field_table(&props.headers));

        if let Some(expiration) = props.expiration_ms {
            properties = properties.with_expiration(ShortString::from(expiration.to_string()));
        }

        match channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        match channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn reject(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        match channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: false,
                },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String, AmqpError> {
        let channel = self.channel().await?;
        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());

        let mut consumer = match channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let sequential = self.cfg.rabbitmq.sequential_deliveries;

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        let inbound = InboundDelivery::from(delivery);

                        if sequential {
                            dispatch(handler.as_ref(), inbound).await;
                        } else {
                            let handler = handler.clone();
                            tokio::spawn(async move {
                                dispatch(handler.as_ref(), inbound).await;
                            });
                        }
                    }

                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }

            debug!("consumer stream closed");
        });

        Ok(consumer_tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        match channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to cancel the consumer");
                Err(AmqpError::CancelConsumerError(consumer_tag.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let Some(state) = self.state.write().await.take() else {
            return Ok(());
        };

        let mut result = Ok(());

        if let Err(err) = state.channel.close(REPLY_SUCCESS, "OK").await {
            error!(error = err.to_string(), "error to close the channel");
            result = Err(AmqpError::CloseError("channel".to_owned()));
        }

        if let Err(err) = state.conn.close(REPLY_SUCCESS, "OK").await {
            error!(error = err.to_string(), "error to close the connection");
            result = result.and(Err(AmqpError::CloseError("connection".to_owned())));
        }

        result
    }
}

async fn dispatch(handler: &dyn DeliveryHandler, delivery: InboundDelivery) {
    if let Err(err) = handler.on_delivery(delivery).await {
        error!(error = err.to_string(), "error consume msg");
    }
}

/// Converts the header bag to an AMQP field table.
///
/// Binary values travel as long strings, the encoding most AMQP clients use
/// for byte arrays.
pub(crate) fn headers_to_field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in headers {
        let amqp_value = match value {
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v.clone())),
            HeaderValue::Bytes(v) => AMQPValue::LongString(LongString::from(v.clone())),
        };

        btree.insert(ShortString::from(key.clone()), amqp_value);
    }

    FieldTable::from(btree)
}

/// Converts an AMQP field table to the header bag.
///
/// Integer types widen to `i64`. Long strings that are not valid UTF-8 are
/// kept as raw bytes. Other value types are dropped.
pub(crate) fn headers_from_field_table(table: &FieldTable) -> Headers {
    let mut headers = Headers::new();

    for (key, value) in table.inner() {
        let header = match value {
            AMQPValue::ShortShortInt(v) => Some(HeaderValue::LongLongInt(i64::from(*v))),
            AMQPValue::ShortShortUInt(v) => Some(HeaderValue::LongLongInt(i64::from(*v))),
            AMQPValue::ShortInt(v) => Some(HeaderValue::LongLongInt(i64::from(*v))),
            AMQPValue::ShortUInt(v) => Some(HeaderValue::LongLongInt(i64::from(*v))),
            AMQPValue::LongInt(v) => Some(HeaderValue::LongLongInt(i64::from(*v))),
            AMQPValue::LongUInt(v) => Some(HeaderValue::LongLongInt(i64::from(*v))),
            AMQPValue::LongLongInt(v) => Some(HeaderValue::LongLongInt(*v)),
            AMQPValue::ShortString(v) => Some(HeaderValue::LongString(v.as_str().to_owned())),
            AMQPValue::LongString(v) => Some(match std::str::from_utf8(v.as_bytes()) {
                Ok(s) => HeaderValue::LongString(s.to_owned()),
                Err(_) => HeaderValue::Bytes(v.as_bytes().to_vec()),
            }),
            AMQPValue::ByteArray(v) => Some(HeaderValue::Bytes(v.as_slice().to_vec())),
            _ => None,
        };

        if let Some(header) = header {
            headers.insert(key.as_str().to_owned(), header);
        }
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{ByteArray, LongInt};

    #[test]
    fn integer_headers_widen_to_i64() {
        let mut btree = BTreeMap::new();
        btree.insert(ShortString::from("x-attempt"), AMQPValue::LongInt(LongInt::from(42)));
        btree.insert(ShortString::from("x-born"), AMQPValue::LongLongInt(1_013_673_600));

        let headers = headers_from_field_table(&FieldTable::from(btree));

        assert_eq!(headers.get("x-attempt"), Some(&HeaderValue::LongLongInt(42)));
        assert_eq!(headers.get("x-born"), Some(&HeaderValue::LongLongInt(1_013_673_600)));
    }

    #[test]
    fn binary_headers_keep_their_bytes() {
        let guid = Uuid::new_v4();
        let mut btree = BTreeMap::new();
        btree.insert(
            ShortString::from("x-guid"),
            AMQPValue::LongString(LongString::from(guid.as_bytes().to_vec())),
        );
        btree.insert(
            ShortString::from("x-raw"),
            AMQPValue::ByteArray(ByteArray::from(vec![0xff, 0xfe])),
        );
        btree.insert(ShortString::from("x-flag"), AMQPValue::Boolean(true));

        let headers = headers_from_field_table(&FieldTable::from(btree));

        assert_eq!(
            headers.get("x-guid").and_then(HeaderValue::as_bytes),
            Some(&guid.as_bytes()[..])
        );
        assert_eq!(headers.get("x-raw"), Some(&HeaderValue::Bytes(vec![0xff, 0xfe])));
        assert!(!headers.contains_key("x-flag"));
    }

    #[test]
    fn outbound_headers_use_amqp_types() {
        let mut headers = Headers::new();
        headers.insert("x-attempt".to_owned(), HeaderValue::LongLongInt(2));
        headers.insert("x-guid".to_owned(), HeaderValue::Bytes(vec![1, 2, 3]));
        headers.insert("traceparent".to_owned(), HeaderValue::LongString("00-ab".to_owned()));

        let table = headers_to_field_table(&headers);

        assert_eq!(
            table.inner().get("x-attempt"),
            Some(&AMQPValue::LongLongInt(2))
        );
        assert_eq!(
            table.inner().get("x-guid"),
            Some(&AMQPValue::LongString(LongString::from(vec![1u8, 2, 3])))
        );
        assert_eq!(headers_from_field_table(&table).get("traceparent"), headers.get("traceparent"));
    }

    #[tokio::test]
    async fn close_without_connection_is_a_no_op() {
        let transport = LapinTransport::new(Configs::default());

        assert!(!transport.is_connected().await);
        assert_eq!(transport.close().await, Ok(()));
    }

    #[tokio::test]
    async fn primitives_fail_without_a_channel() {
        let transport = LapinTransport::new(Configs::default());

        assert_eq!(transport.ack(1).await, Err(AmqpError::ChannelError));
        assert_eq!(
            transport
                .publish("ex", "DEFAULT", b"{}", &MessageProperties::default())
                .await,
            Err(AmqpError::ChannelError)
        );
    }
}
