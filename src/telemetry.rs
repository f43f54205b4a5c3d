// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Telemetry Observer
//!
//! `TracingObserver` plugs into both the consumer and the producer hooks and
//! reports what happens through `tracing` logs, OpenTelemetry counters and
//! OpenTelemetry spans. Consumer spans are parented on the trace context the
//! producer injected into the message headers.

use crate::{
    envelope::{FailedEnvelope, MessageEnvelope, OutgoingMessage},
    observer::{ConsumerObserver, ProducerObserver},
    otel,
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    metrics::Counter,
    trace::{Span, SpanKind, Status, Tracer},
    KeyValue,
};
use std::{borrow::Cow, collections::HashMap, sync::Mutex};
use tracing::{error, info, warn};

const METER_NAME: &str = "rabbitmq-reliable";
const OUTCOME_PERMANENT: &str = "permanent error";
const OUTCOME_TRANSIENT: &str = "transient error";

// metric and span names
const CONSUME: &str = "mq_consume";
const CONSUME_SUCCESS: &str = "mq_consume_success";
const CONSUME_FAILURE: &str = "mq_consume_failure";
const PRODUCE: &str = "mq-produce";

/// Logs, counts and traces consumer and producer activity.
pub struct TracingObserver {
    tracer: BoxedTracer,
    consume_success: Counter<u64>,
    consume_failure: Counter<u64>,
    produce: Counter<u64>,
    spans: Mutex<HashMap<(String, u64), BoxedSpan>>,
}

impl Default for TracingObserver {
    fn default() -> Self {
        TracingObserver::new()
    }
}

impl TracingObserver {
    pub fn new() -> Self {
        let meter = global::meter(METER_NAME);

        TracingObserver {
            tracer: global::tracer("amqp consumer"),
            consume_success: meter.u64_counter(CONSUME_SUCCESS).build(),
            consume_failure: meter.u64_counter(CONSUME_FAILURE).build(),
            produce: meter.u64_counter(PRODUCE).build(),
            spans: Mutex::new(HashMap::new()),
        }
    }

    fn take_span(&self, queue: &str, delivery_id: u64) -> Option<BoxedSpan> {
        self.spans
            .lock()
            .ok()
            .and_then(|mut spans| spans.remove(&(queue.to_owned(), delivery_id)))
    }

    #[cfg(test)]
    fn open_spans(&self) -> usize {
        self.spans.lock().map(|spans| spans.len()).unwrap_or_default()
    }
}

impl ConsumerObserver for TracingObserver {
    fn on_starting(&self, queue: &str) {
        info!(queue, "mq consumer starting");
    }

    fn on_started(&self, queue: &str) {
        info!(queue, "mq consumer started");
    }

    fn on_stopping(&self, queue: &str) {
        info!(queue, "mq consumer stopping");
    }

    fn on_stopped(&self, queue: &str) {
        info!(queue, "mq consumer stopped");
    }

    fn on_received(&self, queue: &str, envelope: &MessageEnvelope) {
        info!(
            queue,
            born = envelope.born_on(),
            attempt = envelope.attempt_number(),
            "mq message incoming"
        );

        let (_, span) = otel::new_span(
            envelope.headers(),
            &self.tracer,
            CONSUME,
            vec![
                KeyValue::new("queue", queue.to_owned()),
                KeyValue::new("born", envelope.born_on()),
                KeyValue::new("json", envelope.message().to_owned()),
                KeyValue::new("attempt", envelope.attempt_number()),
            ],
        );

        if let Ok(mut spans) = self.spans.lock() {
            spans.insert((queue.to_owned(), envelope.delivery_id()), span);
        }
    }

    fn on_processed(&self, queue: &str, envelope: &MessageEnvelope) {
        info!(
            queue,
            born = envelope.born_on(),
            attempt = envelope.attempt_number(),
            "mq message success"
        );

        self.consume_success.add(
            1,
            &[
                KeyValue::new("queue", queue.to_owned()),
                KeyValue::new("outcome", "success"),
            ],
        );

        if let Some(mut span) = self.take_span(queue, envelope.delivery_id()) {
            span.set_status(Status::Ok);
            span.end();
        }
    }

    fn on_failed(&self, queue: &str, failure: &FailedEnvelope) {
        let envelope = failure.envelope();
        let outcome = if failure.retry() {
            OUTCOME_TRANSIENT
        } else {
            OUTCOME_PERMANENT
        };

        if failure.retry() {
            warn!(
                queue,
                born = envelope.born_on(),
                attempt = envelope.attempt_number(),
                error = failure.error().to_string(),
                "mq {}",
                outcome
            );
        } else {
            error!(
                queue,
                born = envelope.born_on(),
                attempt = envelope.attempt_number(),
                error = failure.error().to_string(),
                "mq {}",
                outcome
            );
        }

        self.consume_failure.add(
            1,
            &[
                KeyValue::new("queue", queue.to_owned()),
                KeyValue::new("outcome", outcome),
            ],
        );

        if let Some(mut span) = self.take_span(queue, envelope.delivery_id()) {
            span.record_error(failure.error());
            span.set_status(Status::Error {
                description: Cow::from(outcome),
            });
            span.end();
        }
    }
}

impl ProducerObserver for TracingObserver {
    fn on_sending(&self, exchange: &str, _message: &OutgoingMessage) {
        info!(exchange, "mq message sending");
    }

    fn on_sent(&self, exchange: &str, message: &OutgoingMessage) {
        info!(exchange, correlation_id = %message.correlation_id(), "mq message sent");

        let attributes = [
            KeyValue::new("exchange", exchange.to_owned()),
            KeyValue::new("json", message.message().to_owned()),
        ];

        self.produce.add(1, &attributes[..1]);

        let mut span = self
            .tracer
            .span_builder(PRODUCE)
            .with_kind(SpanKind::Producer)
            .with_attributes(attributes)
            .start(&self.tracer);
        span.end();
    }
}
