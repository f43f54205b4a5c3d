// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Observability Hooks
//!
//! Observers are notified synchronously, in-process, at every step of the
//! producer and consumer lifecycles. They observe the protocol and never drive
//! its decisions. When several observers are registered their relative order is
//! not part of the contract.

use crate::envelope::{FailedEnvelope, MessageEnvelope, OutgoingMessage};

/// Hooks fired by a consumer. Every method defaults to a no-op.
pub trait ConsumerObserver: Send + Sync {
    fn on_starting(&self, _queue: &str) {}

    fn on_started(&self, _queue: &str) {}

    fn on_stopping(&self, _queue: &str) {}

    fn on_stopped(&self, _queue: &str) {}

    fn on_received(&self, _queue: &str, _envelope: &MessageEnvelope) {}

    fn on_processed(&self, _queue: &str, _envelope: &MessageEnvelope) {}

    /// Fired after the retry decision has been made.
    fn on_failed(&self, _queue: &str, _failure: &FailedEnvelope) {}
}

/// Hooks fired by a producer. Every method defaults to a no-op.
pub trait ProducerObserver: Send + Sync {
    fn on_sending(&self, _exchange: &str, _message: &OutgoingMessage) {}

    fn on_sent(&self, _exchange: &str, _message: &OutgoingMessage) {}
}
