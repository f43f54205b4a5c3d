// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Every producer and consumer is bound to exactly one direct exchange. The
//! exchange carries all three tiers of a consumer's topology, routed by the
//! fixed keys in [`crate::topology`].

/// Definition of a RabbitMQ direct exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
}

impl ExchangeDefinition {
    /// Creates a new, non-durable exchange definition with the given name.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            durable: false,
            delete: false,
        }
    }

    /// Makes the exchange durable, persisting across broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
