// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Reliable Messaging Layer
//!
//! Two families of errors live here:
//!
//! - `AmqpError` covers infrastructure failures: connection, channel, topology
//!   declaration, publishing and acknowledgement. These are surfaced to the
//!   caller of `produce`/`start`.
//! - `ConsumeError` is the failure taxonomy a message handler returns. It decides
//!   whether a failed message goes back through the retry queue or straight to
//!   the dead-letter queue.

use std::error::Error as StdError;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant provides specific context about what operation failed.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel, or no channel is currently open
    #[error("failure to create a channel")]
    ChannelError,

    /// Error closing the channel or the connection
    #[error("failure to close `{0}`")]
    CloseError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer subscription
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing an outbound payload
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// A delivery reached the consumer core without its envelope
    #[error("message envelope is required")]
    MissingEnvelope,

    /// Configuration could not be loaded or is incomplete
    #[error("invalid configuration `{0}`")]
    ConfigurationError(String),

    /// The hosted consumer could not be resolved
    #[error("failure to resolve consumer `{0}`")]
    ConsumerResolutionError(String),
}

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Failure returned by a message handler.
///
/// `Permanent` failures are never retried. Everything else counts as transient
/// and is retried until the configured maximum attempts is reached.
#[derive(Error, Debug)]
pub enum ConsumeError {
    /// This attempt failed but a later one might succeed.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The message can never be processed, regardless of attempts.
    #[error("permanent failure: {message}")]
    Permanent {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Any other handler error. Treated as transient.
    #[error(transparent)]
    Other(BoxError),
}

impl ConsumeError {
    pub fn transient(message: impl Into<String>) -> Self {
        ConsumeError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ConsumeError::Permanent {
            message: message.into(),
            source: None,
        }
    }

    /// Builds a permanent failure that keeps `source` as its inner cause.
    pub fn permanent_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        ConsumeError::Permanent {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn other<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        ConsumeError::Other(Box::new(err))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, ConsumeError::Permanent { .. })
    }

    /// Short name of the failure kind, used as a log and metric attribute.
    pub fn kind(&self) -> &'static str {
        match self {
            ConsumeError::Transient(_) => "transient",
            ConsumeError::Permanent { .. } => "permanent",
            ConsumeError::Other(_) => "other",
        }
    }
}
