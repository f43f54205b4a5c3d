// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! Metadata carried alongside every in-flight message: attempt number, origin
//! timestamp, correlation id and the raw header bag. The envelope travels as
//! broker headers, never inside the payload body.

use crate::errors::ConsumeError;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Open key-value bag sent as broker message headers.
pub type Headers = BTreeMap<String, HeaderValue>;

/// Transport-independent header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    LongLongInt(i64),
    LongString(String),
    Bytes(Vec<u8>),
}

impl HeaderValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::LongLongInt(v) => Some(*v),
            HeaderValue::LongString(v) => v.parse().ok(),
            HeaderValue::Bytes(_) => None,
        }
    }

    /// Raw bytes of a string or binary header.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            HeaderValue::LongString(v) => Some(v.as_bytes()),
            HeaderValue::Bytes(v) => Some(v),
            HeaderValue::LongLongInt(_) => None,
        }
    }
}

/// Envelope of one physical delivery, as seen by the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    attempt_number: i64,
    born_on: i64,
    correlation_id: Uuid,
    delivery_id: u64,
    message: String,
    headers: Headers,
}

impl MessageEnvelope {
    /// Creates an envelope. `attempt_number` is clamped to at least 1.
    pub fn new(
        attempt_number: i64,
        born_on: i64,
        correlation_id: Uuid,
        delivery_id: u64,
        message: impl Into<String>,
        headers: Headers,
    ) -> Self {
        MessageEnvelope {
            attempt_number: attempt_number.max(1),
            born_on,
            correlation_id,
            delivery_id,
            message: message.into(),
            headers,
        }
    }

    pub fn attempt_number(&self) -> i64 {
        self.attempt_number
    }

    /// Epoch seconds of the first publish. Unchanged across retries.
    pub fn born_on(&self) -> i64 {
        self.born_on
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Broker delivery tag. Only valid for the current physical delivery.
    pub fn delivery_id(&self) -> u64 {
        self.delivery_id
    }

    /// The message body decoded as text.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// Failure context built when a handler (or payload parsing) fails.
///
/// The retry decision is the only part set after construction, by the
/// consumer's retry policy.
#[derive(Debug)]
pub struct FailedEnvelope {
    envelope: MessageEnvelope,
    error: ConsumeError,
    retry: bool,
}

impl FailedEnvelope {
    pub fn new(envelope: MessageEnvelope, error: ConsumeError) -> Self {
        FailedEnvelope {
            envelope,
            error,
            retry: false,
        }
    }

    pub fn envelope(&self) -> &MessageEnvelope {
        &self.envelope
    }

    pub fn error(&self) -> &ConsumeError {
        &self.error
    }

    pub fn attempt_number(&self) -> i64 {
        self.envelope.attempt_number
    }

    pub fn retry(&self) -> bool {
        self.retry
    }

    pub(crate) fn set_retry(&mut self, retry: bool) {
        self.retry = retry;
    }
}

/// A serialized outbound message, handed to producer hooks.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub(crate) message: String,
    pub(crate) correlation_id: Uuid,
    pub(crate) headers: Headers,
}

impl OutgoingMessage {
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}
