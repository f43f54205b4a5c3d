// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module owns the wire contract shared by producers and consumers and
//! the three-tier queue topology declared for every consumer:
//!
//! - Main queue, bound under [`DEFAULT_ROUTE`], dead-letters to [`DLQ_ROUTE`].
//! - Retry queue, bound under [`RETRY_ROUTE`], dead-letters back to
//!   [`DEFAULT_ROUTE`]. A message published here with a per-message expiration
//!   is returned to the main queue by the broker once it expires.
//! - Dead-letter queue, bound under [`DLQ_ROUTE`]. Terminal.
//!
//! Declarations are idempotent and safe to repeat.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::AmqpTransport,
};
use tracing::debug;

/// Routing key of the main queue
pub const DEFAULT_ROUTE: &str = "DEFAULT";
/// Routing key of the retry queue
pub const RETRY_ROUTE: &str = "T1_RETRY";
/// Routing key of the dead-letter queue
pub const DLQ_ROUTE: &str = "T2_DLQ";

/// Header carrying the attempt number (integer, starts at 1)
pub const AMQP_HEADERS_ATTEMPT: &str = "x-attempt";
/// Header carrying the epoch seconds of the first publish
pub const AMQP_HEADERS_BORN: &str = "x-born";
/// Header carrying the 16 bytes of the correlation id
pub const AMQP_HEADERS_GUID: &str = "x-guid";

/// Constant for the queue argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the queue argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

/// Name of the retry queue that belongs to `queue`.
pub fn retry_queue_name(queue: &str) -> String {
    format!("{queue}_{RETRY_ROUTE}")
}

/// Name of the dead-letter queue that belongs to `queue`.
pub fn dlq_name(queue: &str) -> String {
    format!("{queue}_{DLQ_ROUTE}")
}

/// A set of exchanges, queues and bindings to install through a transport.
#[derive(Debug, Clone, Default)]
pub struct AmqpTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    /// Builds the three-tier topology of one consumer.
    ///
    /// # Parameters
    /// * `exchange` - The exchange the consumer is bound to
    /// * `queue` - The consumer's main queue name
    pub fn tiered(exchange: &str, queue: &str) -> AmqpTopology {
        let retry = retry_queue_name(queue);
        let dlq = dlq_name(queue);

        AmqpTopology::new()
            .exchange(ExchangeDefinition::new(exchange).durable())
            .queue(
                QueueDefinition::new(queue)
                    .durable()
                    .dead_letter(exchange, DLQ_ROUTE),
            )
            .queue_binding(
                QueueBinding::new(queue)
                    .exchange(exchange)
                    .routing_key(DEFAULT_ROUTE),
            )
            .queue(
                QueueDefinition::new(&retry)
                    .durable()
                    .dead_letter(exchange, DEFAULT_ROUTE),
            )
            .queue_binding(
                QueueBinding::new(&retry)
                    .exchange(exchange)
                    .routing_key(RETRY_ROUTE),
            )
            .queue(QueueDefinition::new(&dlq).durable())
            .queue_binding(QueueBinding::new(&dlq).exchange(exchange).routing_key(DLQ_ROUTE))
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition to the topology.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology through `transport`.
    ///
    /// Exchanges are declared first, then queues, then bindings.
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError on the first failing declaration
    pub async fn install(&self, transport: &dyn AmqpTransport) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);
            transport.declare_exchange(exch).await?;
        }

        for queue in &self.queues {
            debug!("creating queue: {}", queue.name);
            transport.declare_queue(queue).await?;
        }

        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            transport.bind_queue(binding).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockAmqpTransport;
    use mockall::Sequence;

    #[test]
    fn tiered_topology_routes_failures_between_tiers() {
        let topology = AmqpTopology::tiered("basic-thing", "app-basic-thing");

        assert_eq!(topology.exchanges, vec![ExchangeDefinition::new("basic-thing").durable()]);
        assert_eq!(
            topology.queues,
            vec![
                QueueDefinition::new("app-basic-thing")
                    .durable()
                    .dead_letter("basic-thing", "T2_DLQ"),
                QueueDefinition::new("app-basic-thing_T1_RETRY")
                    .durable()
                    .dead_letter("basic-thing", "DEFAULT"),
                QueueDefinition::new("app-basic-thing_T2_DLQ").durable(),
            ]
        );

        let keys: Vec<(&str, &str)> = topology
            .queues_binding
            .iter()
            .map(|b| (b.queue_name.as_str(), b.routing_key.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("app-basic-thing", "DEFAULT"),
                ("app-basic-thing_T1_RETRY", "T1_RETRY"),
                ("app-basic-thing_T2_DLQ", "T2_DLQ"),
            ]
        );
    }

    #[tokio::test]
    async fn install_declares_exchanges_then_queues_then_bindings() {
        let mut transport = MockAmqpTransport::new();
        let mut seq = Sequence::new();

        transport
            .expect_declare_exchange()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        transport
            .expect_declare_queue()
            .times(3)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        transport
            .expect_bind_queue()
            .times(3)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let result = AmqpTopology::tiered("ex", "q").install(&transport).await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn install_stops_on_first_failure() {
        let mut transport = MockAmqpTransport::new();
        transport.expect_declare_exchange().returning(|_| Ok(()));
        transport
            .expect_declare_queue()
            .times(1)
            .returning(|def| Err(AmqpError::DeclareQueueError(def.name.clone())));
        transport.expect_bind_queue().never();

        let result = AmqpTopology::tiered("ex", "q").install(&transport).await;

        assert_eq!(result, Err(AmqpError::DeclareQueueError("q".to_owned())));
    }
}
