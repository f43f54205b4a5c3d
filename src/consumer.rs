// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer Core
//!
//! This module provides the broker-independent part of message consumption:
//! payload parsing, invocation of the application handler, classification of
//! the outcome and the retry decision.
//!
//! The core never acknowledges anything itself. It returns a
//! [`ConsumeOutcome`] which the transport layer turns into an ack, a reject or
//! an ack followed by a republish to the retry queue.

use crate::{
    configs::ConsumerSettings,
    envelope::{FailedEnvelope, MessageEnvelope},
    errors::{AmqpError, ConsumeError},
    observer::ConsumerObserver,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use std::{marker::PhantomData, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error};

/// Application logic for messages of type `T`.
///
/// Handlers may be invoked concurrently with themselves unless the transport
/// is configured for sequential deliveries.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync {
    /// Processes one message.
    ///
    /// Return [`ConsumeError::Permanent`] when the message can never succeed.
    /// Any other error is retried up to the configured maximum attempts.
    async fn consume(&self, message: T, envelope: &MessageEnvelope) -> Result<(), ConsumeError>;
}

/// Decides whether a failed message is retried.
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, failure: &FailedEnvelope) -> bool;
}

/// Default policy: permanent failures never retry, transient failures retry
/// while the attempt number is below the maximum (forever when unset).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaxAttemptsPolicy {
    pub maximum_attempts: Option<i64>,
}

impl MaxAttemptsPolicy {
    pub fn new(maximum_attempts: Option<i64>) -> Self {
        MaxAttemptsPolicy { maximum_attempts }
    }
}

impl RetryPolicy for MaxAttemptsPolicy {
    fn should_retry(&self, failure: &FailedEnvelope) -> bool {
        !failure.error().is_permanent()
            && self
                .maximum_attempts
                .is_none_or(|max| failure.attempt_number() < max)
    }
}

/// Result of processing one delivery.
#[derive(Debug)]
pub enum ConsumeOutcome {
    Processed(MessageEnvelope),
    Failed(FailedEnvelope),
}

/// Parses, dispatches and classifies deliveries for one consumer.
pub struct ConsumerCore<T, H> {
    settings: ConsumerSettings,
    handler: H,
    policy: Arc<dyn RetryPolicy>,
    observers: Vec<Arc<dyn ConsumerObserver>>,
    _message: PhantomData<fn() -> T>,
}

impl<T, H> ConsumerCore<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T>,
{
    /// Creates a core using [`MaxAttemptsPolicy`] with the settings' limit.
    pub fn new(settings: ConsumerSettings, handler: H) -> Self {
        let policy = Arc::new(MaxAttemptsPolicy::new(settings.maximum_attempts));

        ConsumerCore {
            settings,
            handler,
            policy,
            observers: vec![],
            _message: PhantomData,
        }
    }

    /// Replaces the retry policy.
    pub fn with_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ConsumerObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    pub fn queue_name(&self) -> &str {
        &self.settings.queue_name
    }

    pub(crate) fn observers(&self) -> &[Arc<dyn ConsumerObserver>] {
        &self.observers
    }

    /// Processes one raw delivery.
    ///
    /// The handler runs to completion before this returns. Handler errors and
    /// panics never propagate: they become [`ConsumeOutcome::Failed`] with the
    /// retry decision already set. A payload that does not parse into `T` is a
    /// permanent failure.
    ///
    /// # Returns
    /// The outcome, or `AmqpError::MissingEnvelope` when no envelope is given
    pub async fn consume_internal(
        &self,
        raw: &[u8],
        envelope: Option<MessageEnvelope>,
    ) -> Result<ConsumeOutcome, AmqpError> {
        let Some(envelope) = envelope else {
            error!("delivery without envelope");
            return Err(AmqpError::MissingEnvelope);
        };

        let queue = self.queue_name();
        for observer in &self.observers {
            observer.on_received(queue, &envelope);
        }

        match self.process(raw, &envelope).await {
            Ok(()) => {
                debug!("message successfully processed");
                for observer in &self.observers {
                    observer.on_processed(queue, &envelope);
                }

                Ok(ConsumeOutcome::Processed(envelope))
            }
            Err(err) => {
                let mut failure = FailedEnvelope::new(envelope, err);
                let retry = self.policy.should_retry(&failure);
                failure.set_retry(retry);

                for observer in &self.observers {
                    observer.on_failed(queue, &failure);
                }

                Ok(ConsumeOutcome::Failed(failure))
            }
        }
    }

    async fn process(&self, raw: &[u8], envelope: &MessageEnvelope) -> Result<(), ConsumeError> {
        let message = serde_json::from_slice::<T>(raw)
            .map_err(|err| ConsumeError::permanent_with_source("failed to parse message", err))?;

        match AssertUnwindSafe(self.handler.consume(message, envelope))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(queue = self.queue_name(), "message handler panicked");
                Err(ConsumeError::transient("message handler panicked"))
            }
        }
    }
}
