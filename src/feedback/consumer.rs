//! Kafka consumer for push feedback topics.
//!
//! Reads feedback records from the configured topics and publishes them on a
//! bounded in-process channel for the broker workers. The pending-work
//! counter is incremented before each publish; whoever finishes with the
//! message decrements it.

use std::sync::Arc;

use rdkafka::Message;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::Result;
use crate::feedback::message::FeedbackMessage;
use crate::metrics::Metrics;
use crate::pending::PendingWork;

/// Consumes feedback records from Kafka and feeds the broker.
pub struct FeedbackConsumer {
    consumer: StreamConsumer,
    messages_tx: async_channel::Sender<FeedbackMessage>,
    messages_rx: async_channel::Receiver<FeedbackMessage>,
    pending: Arc<PendingWork>,
    stop: watch::Receiver<bool>,
    metrics: Metrics,
}

impl FeedbackConsumer {
    /// Create a consumer subscribed to the configured topics.
    ///
    /// Offsets are committed manually on [`FeedbackConsumer::cleanup`];
    /// redelivery after an unclean stop is the at-least-once recovery path.
    pub fn new(
        config: &QueueConfig,
        pending: Arc<PendingWork>,
        stop: watch::Receiver<bool>,
        metrics: Metrics,
    ) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group)
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .create()?;

        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;
        info!(topics = ?config.topics, group = %config.group, "subscribed to feedback topics");

        let (messages_tx, messages_rx) = async_channel::bounded(config.channel_size.max(1));

        Ok(Self {
            consumer,
            messages_tx,
            messages_rx,
            pending,
            stop,
            metrics,
        })
    }

    /// Cloneable receiver of feedback messages for the broker workers.
    pub fn messages_channel(&self) -> async_channel::Receiver<FeedbackMessage> {
        self.messages_rx.clone()
    }

    /// Handle to the shared pending-work counter.
    pub fn pending(&self) -> Arc<PendingWork> {
        self.pending.clone()
    }

    /// Poll the queue until the stop signal fires, publishing each record.
    ///
    /// Every published message is preceded by exactly one pending-work
    /// increment. Publication blocks when the channel is full; that
    /// back-pressure is the queue's regulator.
    pub async fn consume_loop(&self) {
        let mut stop = self.stop.clone();

        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                _ = stop.changed() => {
                    info!("feedback consumer stopping");
                    break;
                }
                result = self.consumer.recv() => match result {
                    Ok(record) => {
                        let Some(payload) = record.payload() else {
                            debug!(topic = record.topic(), "skipping record with empty payload");
                            continue;
                        };

                        let message = FeedbackMessage {
                            topic: record.topic().to_string(),
                            payload: payload.to_vec(),
                        };

                        self.pending.add(1);
                        self.metrics.record_feedback_received();
                        self.metrics.set_feedback_pending(self.pending.count());

                        if self.messages_tx.send(message).await.is_err() {
                            // Channel closed by cleanup while we were
                            // publishing; nothing downstream will see it.
                            self.pending.done();
                            break;
                        }

                        if let Err(e) = self.consumer.store_offset_from_message(&record) {
                            warn!(error = %e, topic = record.topic(), "failed to store offset");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "feedback queue read error");
                    }
                },
            }
        }
    }

    /// Close the messages channel and commit acknowledged positions.
    ///
    /// Idempotent; safe to call while `consume_loop` is still unwinding.
    pub fn cleanup(&self) {
        self.messages_tx.close();

        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            // A consumer that never stored an offset has nothing to commit.
            debug!(error = %e, "offset commit on cleanup");
        }
    }
}
