// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reliable RabbitMQ Messaging
//!
//! A producer and a consumer for RabbitMQ with broker-native retries: every
//! consumer owns a main queue, a retry queue that delays failed messages
//! through per-message expiration, and a dead-letter queue for messages that
//! ran out of attempts or can never succeed.

mod otel;

pub mod channel;
pub mod configs;
pub mod consumer;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod hosting;
pub mod observer;
pub mod publisher;
pub mod queue;
pub mod telemetry;
pub mod topology;
pub mod transport;
