// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! Queue definitions, queue-to-exchange bindings and the derivation of a
//! consumer's queue name from its application name and exchange name.

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// A queue may name a dead-letter target: the exchange and routing key the
/// broker re-routes a message to when it is rejected without requeue or when
/// its per-message expiration elapses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is created with standard settings (non-durable, non-exclusive, etc.)
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Routes dead-lettered messages to `exchange` under `routing_key`.
    ///
    /// # Parameters
    /// * `exchange` - The dead-letter exchange
    /// * `routing_key` - The routing key used when dead-lettering
    ///
    /// # Returns
    /// Self for method chaining
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = Some(routing_key.to_owned());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    /// These should be set using the `exchange` and `routing_key` methods.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

/// Derives a consumer's queue name from its application and exchange names.
///
/// The two names are joined with `-`, then converted to lower kebab-case: a
/// dash is inserted before every capital that starts a word (`Ab`), and
/// before every capital or digit that follows a lowercase letter. Existing
/// separators are kept as they are, so `MyApp` and `Orders` give
/// `my-app--orders`.
///
/// ```
/// use rabbitmq_reliable::queue::queue_name;
///
/// assert_eq!(queue_name("PascalCase", "basic-thing"), "pascal-case-basic-thing");
/// ```
pub fn queue_name(app_name: &str, exchange_name: &str) -> String {
    to_kebab_case(&format!("{app_name}-{exchange_name}"))
}

fn to_kebab_case(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let mut out = String::with_capacity(value.len() + 8);

    for (idx, ch) in chars.iter().enumerate() {
        if idx > 0 {
            let prev = chars[idx - 1];
            let next = chars.get(idx + 1);

            let starts_word = ch.is_ascii_uppercase() && next.is_some_and(|n| n.is_ascii_lowercase());
            let after_lower = prev.is_ascii_lowercase() && (ch.is_ascii_uppercase() || ch.is_ascii_digit());

            if starts_word || after_lower {
                out.push('-');
            }
        }
        out.push(*ch);
    }

    out.trim().to_lowercase()
}
