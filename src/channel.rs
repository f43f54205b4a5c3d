// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels. It
//! establishes a connection to the RabbitMQ server described by the
//! configuration and opens one channel on it.

use crate::{configs::Configs, errors::AmqpError};
use lapin::{options::BasicQosOptions, types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, error};

/// Creates a new AMQP connection and channel for communication with RabbitMQ.
///
/// When `rabbitmq.prefetch` is configured, the channel QoS is set before it is
/// returned.
///
/// # Parameters
/// * `cfg` - Configuration containing RabbitMQ connection details like host, port, credentials, etc.
///
/// # Returns
/// * `Result<(Arc<Connection>, Arc<Channel>), AmqpError>` -
///   A tuple containing the connection and channel on success, or an error on failure.
pub async fn new_amqp_channel(cfg: &Configs) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app.name.clone()));

    let conn = match Connection::connect(&cfg.amqp_uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError {})
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    let channel = match conn.create_channel().await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError {})
        }
    }?;

    if let Some(prefetch) = cfg.rabbitmq.prefetch {
        if let Err(err) = channel.basic_qos(prefetch, BasicQosOptions::default()).await {
            error!(error = err.to_string(), "error to configure qos");
            return Err(AmqpError::QoSDeclarationError(err.to_string()));
        }
    }

    debug!("channel created");
    Ok((Arc::new(conn), Arc::new(channel)))
}
