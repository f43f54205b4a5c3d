// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module provides the producer side: it serializes a message, stamps
//! the envelope headers (first attempt, origin timestamp, fresh correlation
//! id), propagates the OpenTelemetry context and publishes to the exchange's
//! default route. Retries are a consumer concern and never happen here.

use crate::{
    configs::Configs,
    envelope::{HeaderValue, Headers, OutgoingMessage},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    observer::ProducerObserver,
    otel,
    topology::{AMQP_HEADERS_ATTEMPT, AMQP_HEADERS_BORN, AMQP_HEADERS_GUID, DEFAULT_ROUTE},
    transport::{AmqpTransport, LapinTransport, MessageProperties},
};
use chrono::Utc;
use opentelemetry::Context;
use serde::Serialize;
use serde_json::Value;
use std::{marker::PhantomData, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

/// Publisher of messages of type `T` to one exchange.
///
/// The connection is opened on the first publish and reopened by a later
/// publish if it was lost. The transport is exclusively owned by this
/// publisher.
pub struct RabbitMQPublisher<T> {
    transport: Arc<dyn AmqpTransport>,
    exchange_name: String,
    observers: Vec<Arc<dyn ProducerObserver>>,
    connecting: Mutex<()>,
    _message: PhantomData<fn(&T)>,
}

impl<T> RabbitMQPublisher<T>
where
    T: Serialize + Sync,
{
    /// Creates a new RabbitMQ publisher.
    ///
    /// # Parameters
    /// * `transport` - The broker transport, connected or not
    /// * `exchange_name` - The exchange every message is published to
    pub fn new(transport: Arc<dyn AmqpTransport>, exchange_name: &str) -> Self {
        RabbitMQPublisher {
            transport,
            exchange_name: exchange_name.to_owned(),
            observers: vec![],
            connecting: Mutex::new(()),
            _message: PhantomData,
        }
    }

    /// Creates a publisher over a lazily connected `lapin` transport.
    pub fn from_configs(cfg: &Configs, exchange_name: &str) -> Self {
        RabbitMQPublisher::new(Arc::new(LapinTransport::new(cfg.clone())), exchange_name)
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProducerObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    /// Publishes `message` with the current OpenTelemetry context.
    ///
    /// # Returns
    /// The correlation id stamped on the message
    pub async fn produce(&self, message: &T) -> Result<Uuid, AmqpError> {
        let ctx = Context::current();
        self.produce_with_context(&ctx, message).await
    }

    /// Publishes `message`, propagating `ctx` in the message headers.
    pub async fn produce_with_context(&self, ctx: &Context, message: &T) -> Result<Uuid, AmqpError> {
        let body = to_canonical_json(message)?;
        let correlation_id = Uuid::new_v4();

        let mut headers = Headers::new();
        otel::inject_context(ctx, &mut headers);
        headers.insert(AMQP_HEADERS_ATTEMPT.to_owned(), HeaderValue::LongLongInt(1));
        headers.insert(
            AMQP_HEADERS_BORN.to_owned(),
            HeaderValue::LongLongInt(Utc::now().timestamp()),
        );
        headers.insert(
            AMQP_HEADERS_GUID.to_owned(),
            HeaderValue::Bytes(correlation_id.to_bytes_le().to_vec()),
        );

        let outgoing = OutgoingMessage {
            message: String::from_utf8_lossy(&body).into_owned(),
            correlation_id,
            headers,
        };

        for observer in &self.observers {
            observer.on_sending(&self.exchange_name, &outgoing);
        }

        self.ensure_connected().await?;

        let props = MessageProperties {
            headers: outgoing.headers.clone(),
            expiration_ms: None,
        };
        self.transport
            .publish(&self.exchange_name, DEFAULT_ROUTE, &body, &props)
            .await?;

        for observer in &self.observers {
            observer.on_sent(&self.exchange_name, &outgoing);
        }

        Ok(correlation_id)
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.is_connected().await
    }

    /// Closes the channel, then the connection. No-op when never connected.
    pub async fn dispose(&self) -> Result<(), AmqpError> {
        self.transport.close().await
    }

    async fn ensure_connected(&self) -> Result<(), AmqpError> {
        let _connecting = self.connecting.lock().await;

        if self.transport.is_connected().await {
            return Ok(());
        }

        debug!(exchange = self.exchange_name, "connecting publisher");
        self.transport.connect().await?;
        self.transport
            .declare_exchange(&ExchangeDefinition::new(&self.exchange_name).durable())
            .await
    }
}

/// Serializes `message` as JSON with sorted keys and without null fields.
fn to_canonical_json<T: Serialize>(message: &T) -> Result<Vec<u8>, AmqpError> {
    let mut value = match serde_json::to_value(message) {
        Ok(v) => v,
        Err(err) => {
            error!(error = err.to_string(), "error serializing message");
            return Err(AmqpError::SerializePayloadError(err.to_string()));
        }
    };

    strip_nulls(&mut value);

    serde_json::to_vec(&value).map_err(|err| AmqpError::SerializePayloadError(err.to_string()))
}

fn strip_nulls(value: &mut Value) {
    match value {
        Value::Object(fields) => {
            fields.retain(|_, v| !v.is_null());
            fields.values_mut().for_each(strip_nulls);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_nulls),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockAmqpTransport;
    use mockall::Sequence;
    use serde::ser::Error as _;
    use std::sync::Mutex as StdMutex;

    #[derive(Serialize)]
    struct BasicPayload {
        #[serde(rename = "Foo")]
        foo: String,
        #[serde(rename = "Bar")]
        bar: Option<String>,
        #[serde(rename = "Nested")]
        nested: Vec<Inner>,
    }

    #[derive(Serialize)]
    struct Inner {
        #[serde(rename = "Zed")]
        zed: i32,
        #[serde(rename = "Alpha")]
        alpha: Option<i32>,
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("cannot serialize"))
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: StdMutex<Vec<(String, Uuid)>>,
    }

    impl ProducerObserver for RecordingObserver {
        fn on_sending(&self, _exchange: &str, message: &OutgoingMessage) {
            self.events
                .lock()
                .unwrap()
                .push(("sending".to_owned(), message.correlation_id()));
        }

        fn on_sent(&self, _exchange: &str, message: &OutgoingMessage) {
            self.events
                .lock()
                .unwrap()
                .push(("sent".to_owned(), message.correlation_id()));
        }
    }

    fn payload() -> BasicPayload {
        BasicPayload {
            foo: "bar".to_owned(),
            bar: None,
            nested: vec![Inner { zed: 1, alpha: None }],
        }
    }

    #[test]
    fn canonical_json_omits_nulls_and_sorts_fields() {
        let body = to_canonical_json(&payload()).unwrap();

        assert_eq!(
            String::from_utf8(body).unwrap(),
            r#"{"Foo":"bar","Nested":[{"Zed":1}]}"#
        );
    }

    #[test]
    fn serialization_failure_is_reported() {
        let result = to_canonical_json(&Unserializable);

        assert!(matches!(result, Err(AmqpError::SerializePayloadError(_))));
    }

    #[tokio::test]
    async fn produce_stamps_the_first_attempt() {
        let mut transport = MockAmqpTransport::new();
        transport.expect_is_connected().returning(|| true);
        let published = Arc::new(StdMutex::new(vec![]));
        let sink = published.clone();
        transport
            .expect_publish()
            .withf(|exchange, key, _, _| exchange == "basic-thing" && key == DEFAULT_ROUTE)
            .times(1)
            .returning(move |_, _, body, props| {
                sink.lock().unwrap().push((body.to_vec(), props.clone()));
                Ok(())
            });
        let publisher = RabbitMQPublisher::new(Arc::new(transport), "basic-thing");
        let before = Utc::now().timestamp();

        let id = publisher.produce(&payload()).await.unwrap();

        let published = published.lock().unwrap();
        let (body, props) = &published[0];
        assert_eq!(body, br#"{"Foo":"bar","Nested":[{"Zed":1}]}"#);
        assert_eq!(props.expiration_ms, None);
        assert_eq!(props.headers.get(AMQP_HEADERS_ATTEMPT), Some(&HeaderValue::LongLongInt(1)));
        assert!(props
            .headers
            .get(AMQP_HEADERS_BORN)
            .and_then(HeaderValue::as_i64)
            .is_some_and(|born| born >= before));
        assert_eq!(
            props.headers.get(AMQP_HEADERS_GUID),
            Some(&HeaderValue::Bytes(id.to_bytes_le().to_vec()))
        );
    }

    #[tokio::test]
    async fn produce_connects_lazily_once() {
        let mut transport = MockAmqpTransport::new();
        let mut seq = Sequence::new();
        transport
            .expect_is_connected()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| false);
        transport
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        transport
            .expect_declare_exchange()
            .withf(|def| def.name() == "basic-thing")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        transport
            .expect_publish()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));
        transport
            .expect_is_connected()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| true);
        transport
            .expect_publish()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));
        let publisher = RabbitMQPublisher::new(Arc::new(transport), "basic-thing");

        let first = publisher.produce(&payload()).await.unwrap();
        let second = publisher.produce(&payload()).await.unwrap();

        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn connection_failure_reaches_the_caller() {
        let mut transport = MockAmqpTransport::new();
        transport.expect_is_connected().returning(|| false);
        transport
            .expect_connect()
            .returning(|| Err(AmqpError::ConnectionError));
        transport.expect_publish().never();
        let observer = Arc::new(RecordingObserver::default());
        let publisher = RabbitMQPublisher::new(Arc::new(transport), "basic-thing")
            .with_observer(observer.clone());

        let result = publisher.produce(&payload()).await;

        assert_eq!(result, Err(AmqpError::ConnectionError));
        let events = observer.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "sending");
    }

    #[tokio::test]
    async fn hooks_wrap_the_publish() {
        let mut transport = MockAmqpTransport::new();
        transport.expect_is_connected().returning(|| true);
        transport.expect_publish().returning(|_, _, _, _| Ok(()));
        let observer = Arc::new(RecordingObserver::default());
        let publisher = RabbitMQPublisher::new(Arc::new(transport), "basic-thing")
            .with_observer(observer.clone());

        let id = publisher.produce(&payload()).await.unwrap();

        assert_eq!(
            *observer.events.lock().unwrap(),
            vec![("sending".to_owned(), id), ("sent".to_owned(), id)]
        );
    }

    #[tokio::test]
    async fn publish_failure_skips_the_sent_hook() {
        let mut transport = MockAmqpTransport::new();
        transport.expect_is_connected().returning(|| true);
        transport
            .expect_publish()
            .returning(|_, _, _, _| Err(AmqpError::PublishingError));
        let observer = Arc::new(RecordingObserver::default());
        let publisher = RabbitMQPublisher::new(Arc::new(transport), "basic-thing")
            .with_observer(observer.clone());

        assert_eq!(
            publisher.produce(&payload()).await,
            Err(AmqpError::PublishingError)
        );
        assert_eq!(observer.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dispose_closes_the_transport() {
        let mut transport = MockAmqpTransport::new();
        transport.expect_close().times(1).returning(|| Ok(()));
        let publisher = RabbitMQPublisher::<Inner>::new(Arc::new(transport), "basic-thing");

        assert!(publisher.dispose().await.is_ok());
    }
}
