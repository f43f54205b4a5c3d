// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Hosting
//!
//! Runs one consumer as a supervised background task. The loop starts the
//! consumer whenever it reports not connected, so a broker that is down at
//! process startup (or restarts later) is picked up again without restarting
//! the host. Start failures are logged and never end the loop.

use crate::{configs::Configs, errors::AmqpError};
use async_trait::async_trait;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info, warn};

const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// A consumer the hosting loop can supervise.
#[async_trait]
pub trait HostedConsumer: Send + Sync {
    fn queue_name(&self) -> &str;

    async fn is_connected(&self) -> bool;

    async fn start(&self) -> Result<(), AmqpError>;

    async fn stop(&self) -> Result<(), AmqpError>;

    /// Releases the consumer's connection.
    async fn dispose(&self) -> Result<(), AmqpError>;
}

/// Background service that keeps one consumer running.
pub struct ConsumerHostingService {
    consumer: Option<Arc<dyn HostedConsumer>>,
    interval: Duration,
}

impl ConsumerHostingService {
    /// Resolves the hosted consumer.
    ///
    /// A resolution failure is logged and leaves the service idle instead of
    /// failing the host.
    pub async fn new<F, C>(resolver: F) -> Self
    where
        F: Future<Output = Result<C, AmqpError>>,
        C: HostedConsumer + 'static,
    {
        let consumer = match resolver.await {
            Ok(consumer) => Some(Arc::new(consumer) as Arc<dyn HostedConsumer>),
            Err(err) => {
                error!(error = err.to_string(), "failure to resolve the hosted consumer");
                None
            }
        };

        ConsumerHostingService {
            consumer,
            interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }

    /// Resolves the hosted consumer, pausing `rabbitmq.reconnect_interval_secs`
    /// between two connection checks.
    pub async fn from_configs<F, C>(cfg: &Configs, resolver: F) -> Self
    where
        F: Future<Output = Result<C, AmqpError>>,
        C: HostedConsumer + 'static,
    {
        Self::new(resolver).await.with_interval(cfg.reconnect_interval())
    }

    /// Sets the pause between two connection checks.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Whether the consumer could not be resolved.
    pub fn is_degraded(&self) -> bool {
        self.consumer.is_none()
    }

    /// Supervises the consumer until `shutdown` turns true or its sender is
    /// dropped, then stops and disposes it.
    ///
    /// A start in progress is never interrupted: shutdown is observed between
    /// iterations and during the pause.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let Some(consumer) = &self.consumer else {
            warn!("no hosted consumer, waiting for shutdown");
            wait_for_shutdown(&mut shutdown).await;
            return;
        };

        let queue = consumer.queue_name();
        info!(queue, "hosting service running");

        while !shutdown_requested(&shutdown) {
            if !consumer.is_connected().await {
                match consumer.start().await {
                    Ok(()) => info!(queue, "consumer connected"),
                    Err(err) => warn!(queue, error = ?err, "failure to start the consumer, retrying later"),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        info!(queue, "hosting service stopping");

        if let Err(err) = consumer.stop().await {
            warn!(queue, error = err.to_string(), "failure to stop the consumer");
        }

        if let Err(err) = consumer.dispose().await {
            warn!(queue, error = err.to_string(), "failure to dispose the consumer");
        }
    }

    /// Runs the service on a background task.
    pub fn spawn(self) -> HostingHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(async move { self.run(stop_rx).await });

        HostingHandle { stop_tx, join }
    }
}

/// Handle of a spawned hosting service.
pub struct HostingHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl HostingHandle {
    /// Requests shutdown and waits until the consumer is stopped and disposed.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);

        if let Err(err) = self.join.await {
            error!(error = err.to_string(), "hosting task failed");
        }
    }
}

fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // a dropped sender also means shutdown
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const INTERVAL: Duration = Duration::from_millis(5);

    #[derive(Default)]
    struct FakeConsumer {
        connected: Arc<AtomicBool>,
        failures_left: AtomicUsize,
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
        disposes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl HostedConsumer for FakeConsumer {
        fn queue_name(&self) -> &str {
            "app-thing"
        }

        async fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn start(&self) -> Result<(), AmqpError> {
            self.starts.fetch_add(1, Ordering::SeqCst);

            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(AmqpError::ConnectionError);
            }

            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), AmqpError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn dispose(&self) -> Result<(), AmqpError> {
            self.disposes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn eventually(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn start_failures_are_retried_until_connected() {
        let consumer = FakeConsumer {
            failures_left: AtomicUsize::new(2),
            ..Default::default()
        };
        let (starts, connected) = (consumer.starts.clone(), consumer.connected.clone());

        let handle = ConsumerHostingService::new(async { Ok::<_, AmqpError>(consumer) })
            .await
            .with_interval(INTERVAL)
            .spawn();

        eventually(|| connected.load(Ordering::SeqCst)).await;
        tokio::time::sleep(INTERVAL * 4).await;
        handle.shutdown().await;

        assert_eq!(starts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn shutdown_stops_then_disposes() {
        let consumer = FakeConsumer::default();
        let (stops, disposes, starts) = (
            consumer.stops.clone(),
            consumer.disposes.clone(),
            consumer.starts.clone(),
        );

        let handle = ConsumerHostingService::new(async { Ok::<_, AmqpError>(consumer) })
            .await
            .with_interval(INTERVAL)
            .spawn();

        eventually(|| starts.load(Ordering::SeqCst) == 1).await;
        handle.shutdown().await;

        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(disposes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_pause() {
        let consumer = FakeConsumer::default();
        let starts = consumer.starts.clone();

        let handle = ConsumerHostingService::new(async { Ok::<_, AmqpError>(consumer) })
            .await
            .with_interval(Duration::from_secs(3600))
            .spawn();

        eventually(|| starts.load(Ordering::SeqCst) == 1).await;

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reconnect_interval_comes_from_configs() {
        let cfg = Configs::from_toml(
            r#"
            [rabbitmq]
            reconnect_interval_secs = 3
            "#,
        )
        .unwrap();

        let service =
            ConsumerHostingService::from_configs(&cfg, async { Ok::<_, AmqpError>(FakeConsumer::default()) })
                .await;

        assert_eq!(service.interval, Duration::from_secs(3));
        assert!(!service.is_degraded());

        let defaults = ConsumerHostingService::from_configs(&Configs::default(), async {
            Ok::<_, AmqpError>(FakeConsumer::default())
        })
        .await;
        assert_eq!(defaults.interval, DEFAULT_RECONNECT_INTERVAL);
    }

    #[tokio::test]
    async fn resolution_failure_degrades_without_panicking() {
        let service = ConsumerHostingService::new(async {
            Err::<FakeConsumer, _>(AmqpError::ConsumerResolutionError("app-thing".to_owned()))
        })
        .await;
        assert!(service.is_degraded());

        let (stop_tx, stop_rx) = watch::channel(false);
        let running = tokio::spawn(async move { service.run(stop_rx).await });
        stop_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_sender_ends_the_loop() {
        let consumer = FakeConsumer::default();
        let disposes = consumer.disposes.clone();
        let service = ConsumerHostingService::new(async { Ok::<_, AmqpError>(consumer) })
            .await
            .with_interval(INTERVAL);

        let (stop_tx, stop_rx) = watch::channel(false);
        drop(stop_tx);
        service.run(stop_rx).await;

        assert_eq!(disposes.load(Ordering::SeqCst), 1);
    }
}
