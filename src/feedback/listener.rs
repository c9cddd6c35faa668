//! Feedback listener lifecycle.
//!
//! Composes the Kafka consumer, the broker worker pool and the
//! invalid-token handler, wires them to a shared stop signal and pending
//! counter, and runs the graceful shutdown sequence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::PgPool;
use tracing::{info, warn};

use crate::config::FeedbackConfig;
use crate::error::Result;
use crate::feedback::broker::Broker;
use crate::feedback::consumer::FeedbackConsumer;
use crate::feedback::invalid_token::InvalidTokenHandler;
use crate::metrics::Metrics;
use crate::pending::PendingWork;
use crate::shutdown::ShutdownHandler;

/// Consumes push feedback from the queue and routes it through the broker
/// to the invalid-token handler.
pub struct Listener {
    consumer: Arc<FeedbackConsumer>,
    // Taken by the first `start()`.
    pipeline: Mutex<Option<(Broker, InvalidTokenHandler)>>,
    pending: Arc<PendingWork>,
    database: PgPool,
    shutdown: ShutdownHandler,
    shutdown_timeout: Duration,
    stopped: AtomicBool,
}

impl Listener {
    /// Create and wire a listener from configuration.
    pub fn new(config: &FeedbackConfig, metrics: Metrics) -> Result<Self> {
        let shutdown = ShutdownHandler::new();
        let pending = PendingWork::new();

        let consumer = Arc::new(FeedbackConsumer::new(
            &config.queue,
            pending.clone(),
            shutdown.subscribe(),
            metrics.clone(),
        )?);

        let broker = Broker::new(
            consumer.messages_channel(),
            pending.clone(),
            config.broker.workers,
            metrics.clone(),
        );

        let handler = InvalidTokenHandler::new(
            &config.invalid_token,
            broker.invalid_token_channel(),
            pending.clone(),
            metrics,
        )?;
        let database = handler.pool();

        Ok(Self {
            consumer,
            pipeline: Mutex::new(Some((broker, handler))),
            pending,
            database,
            shutdown,
            shutdown_timeout: config.shutdown_timeout(),
            stopped: AtomicBool::new(false),
        })
    }

    /// Handle to the shared pending-work counter.
    pub fn pending(&self) -> Arc<PendingWork> {
        self.pending.clone()
    }

    /// Read-only handle to the listener's stop signal.
    pub fn stop_signal(&self) -> tokio::sync::watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Cloneable handle to the invalid-token database pool.
    pub fn database_pool(&self) -> PgPool {
        self.database.clone()
    }

    /// Spawn the consumer loop, the broker workers and the handler.
    ///
    /// Idempotent; later calls are no-ops.
    pub fn start(&self) {
        let Some((broker, handler)) = self.pipeline.lock().expect("pipeline lock").take() else {
            return;
        };

        info!("starting the feedback listener");

        let consumer = self.consumer.clone();
        tokio::spawn(async move {
            consumer.consume_loop().await;
        });

        broker.start();
        tokio::spawn(handler.run());
    }

    /// Start the pipeline and block until a termination signal arrives or
    /// the stop signal fires, then run the shutdown sequence.
    pub async fn run(&self) {
        self.start();
        self.shutdown.wait_for_signal().await;
        self.stop().await;
    }

    /// Stop the listener: fire the stop signal, run consumer cleanup and
    /// wait (bounded) for in-flight messages to drain. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.trigger();
        self.consumer.cleanup();
        self.graceful_shutdown().await;
    }

    async fn graceful_shutdown(&self) {
        info!(
            timeout_secs = self.shutdown_timeout.as_secs(),
            "listener is waiting for in-flight feedback to drain"
        );

        if self.pending.wait_timeout(self.shutdown_timeout).await {
            warn!(
                outstanding = self.pending.count(),
                "exited listener because of graceful shutdown timeout"
            );
        } else {
            info!("exited listener gracefully");
        }
    }
}
