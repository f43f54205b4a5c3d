// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Utilities for propagating trace context through message headers and for
//! opening consumer spans parented on the producer's context.

use crate::envelope::{HeaderValue, Headers};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context, KeyValue,
};
use std::borrow::Cow;
use tracing::error;

/// Writes trace context entries into outgoing headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    /// Sets a trace context key-value pair in the message headers.
    fn set(&mut self, key: &str, value: String) {
        self.headers
            .insert(key.to_lowercase(), HeaderValue::LongString(value));
    }
}

/// Reads trace context entries from incoming headers.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a Headers,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a Headers) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    /// Gets a trace context value from the message headers.
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| match header_value {
            HeaderValue::LongString(value) => Some(value.as_str()),
            HeaderValue::Bytes(value) => std::str::from_utf8(value)
                .map_err(|e| error!("Error decoding header value {:?}", e))
                .ok(),
            HeaderValue::LongLongInt(_) => None,
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Injects `ctx` into `headers` through the global text map propagator.
pub(crate) fn inject_context(ctx: &Context, headers: &mut Headers) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector::new(headers))
    });
}

/// Creates a new span for message processing, parented on the context found
/// in `headers`.
///
/// # Returns
/// A tuple containing the extracted context and the new span
pub(crate) fn new_span(
    headers: &Headers,
    tracer: &BoxedTracer,
    name: &str,
    attributes: Vec<KeyValue>,
) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .with_attributes(attributes)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injector_lowercases_keys() {
        let mut headers = Headers::new();

        HeaderInjector::new(&mut headers).set("TraceParent", "00-abc".to_owned());

        assert_eq!(
            headers.get("traceparent"),
            Some(&HeaderValue::LongString("00-abc".to_owned()))
        );
    }

    #[test]
    fn extractor_reads_text_and_utf8_bytes_only() {
        let mut headers = Headers::new();
        headers.insert("traceparent".to_owned(), HeaderValue::LongString("00-abc".to_owned()));
        headers.insert("tracestate".to_owned(), HeaderValue::Bytes(b"k=v".to_vec()));
        headers.insert("x-attempt".to_owned(), HeaderValue::LongLongInt(1));

        let extractor = HeaderExtractor::new(&headers);

        assert_eq!(extractor.get("traceparent"), Some("00-abc"));
        assert_eq!(extractor.get("tracestate"), Some("k=v"));
        assert_eq!(extractor.get("x-attempt"), None);
        assert_eq!(extractor.keys().len(), 3);
    }
}
