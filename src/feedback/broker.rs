//! Feedback broker: classification and fan-out.
//!
//! A fixed pool of workers reads raw feedback messages, parses the topic,
//! decodes the per-platform payload and routes invalid-token events to the
//! handler channel.
//!
//! Exactly one pending-work decrement happens per message: the broker
//! decrements on every discard path, and handing an event to the handler
//! transfers that duty downstream.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::feedback::message::{
    ApnsFeedback, FeedbackMessage, GcmFeedback, InvalidTokenEvent, Platform, TopicId, parse_topic,
};
use crate::metrics::Metrics;
use crate::pending::PendingWork;

/// Routes feedback messages to the invalid-token handler.
pub struct Broker {
    messages: async_channel::Receiver<FeedbackMessage>,
    invalid_token_tx: async_channel::Sender<InvalidTokenEvent>,
    invalid_token_rx: async_channel::Receiver<InvalidTokenEvent>,
    pending: Arc<PendingWork>,
    workers: usize,
    metrics: Metrics,
}

impl Broker {
    /// Create a broker bound to the consumer's messages channel.
    pub fn new(
        messages: async_channel::Receiver<FeedbackMessage>,
        pending: Arc<PendingWork>,
        workers: usize,
        metrics: Metrics,
    ) -> Self {
        // Rendezvous-sized so handler latency propagates back to the
        // workers and from there to the consumer.
        let (invalid_token_tx, invalid_token_rx) = async_channel::bounded(1);

        Self {
            messages,
            invalid_token_tx,
            invalid_token_rx,
            pending,
            workers,
            metrics,
        }
    }

    /// Receiver side of the invalid-token output channel.
    pub fn invalid_token_channel(&self) -> async_channel::Receiver<InvalidTokenEvent> {
        self.invalid_token_rx.clone()
    }

    /// Spawn the worker pool.
    ///
    /// Workers exit once the messages channel is closed and drained; the
    /// last worker to exit closes the invalid-token channel, which lets the
    /// handler drain and stop.
    pub fn start(self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.workers.max(1));

        for worker in 0..self.workers.max(1) {
            let messages = self.messages.clone();
            let invalid_token_tx = self.invalid_token_tx.clone();
            let pending = self.pending.clone();
            let metrics = self.metrics.clone();

            handles.push(tokio::spawn(async move {
                while let Ok(message) = messages.recv().await {
                    process_message(&message, &invalid_token_tx, &pending, &metrics).await;
                }
                debug!(worker, "broker worker exiting");
            }));
        }

        handles
    }
}

/// Decode and classify one message, returning the invalid-token event when
/// the feedback is actionable.
fn classify(topic_id: &TopicId, payload: &[u8]) -> Result<Option<InvalidTokenEvent>> {
    let token = match topic_id.platform {
        Platform::Gcm => {
            let feedback: GcmFeedback = serde_json::from_slice(payload)?;
            feedback.is_invalid_token().then(|| feedback.from)
        }
        Platform::Apns => {
            let feedback: ApnsFeedback = serde_json::from_slice(payload)?;
            feedback.is_invalid_token().then(|| feedback.device_token)
        }
    };

    Ok(token.map(|token| InvalidTokenEvent {
        game: topic_id.game.clone(),
        platform: topic_id.platform,
        token,
    }))
}

async fn process_message(
    message: &FeedbackMessage,
    invalid_token_tx: &async_channel::Sender<InvalidTokenEvent>,
    pending: &PendingWork,
    metrics: &Metrics,
) {
    let topic_id = match parse_topic(&message.topic) {
        Ok(id) => id,
        Err(e) => {
            warn!(topic = %message.topic, error = %e, "discarding message from unparseable topic");
            metrics.record_feedback_discarded("topic");
            pending.done();
            return;
        }
    };

    let event = match classify(&topic_id, &message.payload) {
        Ok(event) => event,
        Err(Error::Json(e)) => {
            warn!(
                topic = %message.topic,
                game = %topic_id.game,
                platform = %topic_id.platform,
                error = %e,
                "discarding undecodable feedback payload"
            );
            metrics.record_feedback_discarded("decode");
            pending.done();
            return;
        }
        Err(e) => {
            warn!(topic = %message.topic, error = %e, "discarding feedback");
            metrics.record_feedback_discarded("classify");
            pending.done();
            return;
        }
    };

    match event {
        Some(event) if event.token.is_empty() => {
            warn!(
                game = %event.game,
                platform = %event.platform,
                "discarding invalid-token feedback with empty token"
            );
            metrics.record_feedback_discarded("empty_token");
            pending.done();
        }
        Some(event) => {
            metrics.record_invalid_token(event.platform.as_str());
            // Handover: the handler now owns the pending decrement.
            if invalid_token_tx.send(event).await.is_err() {
                warn!("invalid-token handler is gone; dropping event");
                pending.done();
            }
        }
        None => {
            // Non-actionable feedback.
            metrics.record_feedback_processed();
            pending.done();
        }
    }
}
