//! Invalid-token handler: batched deletion of undeliverable device tokens.
//!
//! Events are buffered and flushed when either the batch size or the flush
//! interval is reached. Each flush issues one DELETE per `(game, platform)`
//! table with the token list bound as a parameter. Failed statements are
//! retried with doubling backoff; after exhaustion the batch is dropped and
//! the queue's at-least-once redelivery is the recovery path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, error, info, warn};

use crate::config::InvalidTokenConfig;
use crate::error::Result;
use crate::feedback::message::{InvalidTokenEvent, is_valid_game};
use crate::metrics::Metrics;
use crate::pending::PendingWork;

/// Initial backoff before the first delete retry; doubles per attempt.
const INITIAL_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Consumes invalid-token events and deletes the tokens from the per-game
/// user-device tables.
pub struct InvalidTokenHandler {
    events: async_channel::Receiver<InvalidTokenEvent>,
    pool: PgPool,
    pending: Arc<PendingWork>,
    buffer_size: usize,
    flush_interval: Duration,
    max_retries: u32,
    metrics: Metrics,
}

impl InvalidTokenHandler {
    /// Create a handler bound to the broker's invalid-token output.
    ///
    /// The database pool connects lazily; connectivity failures surface on
    /// the first flush and go through the retry path.
    pub fn new(
        config: &InvalidTokenConfig,
        events: async_channel::Receiver<InvalidTokenEvent>,
        pending: Arc<PendingWork>,
        metrics: Metrics,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(&config.database_url)?;

        Ok(Self {
            events,
            pool,
            pending,
            buffer_size: config.buffer_size.max(1),
            flush_interval: config.flush_interval().max(Duration::from_millis(10)),
            max_retries: config.max_retries,
            metrics,
        })
    }

    /// Cloneable handle to the underlying database pool.
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    /// Run until the input channel is closed and drained, then flush the
    /// remainder and return.
    pub async fn run(self) {
        let mut buffer: Vec<InvalidTokenEvent> = Vec::with_capacity(self.buffer_size);
        let mut ticker = interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Ok(event) => {
                        buffer.push(event);
                        if buffer.len() >= self.buffer_size {
                            self.flush(&mut buffer).await;
                        }
                    }
                    // Closed and drained: flush what is left and stop.
                    Err(_) => break,
                },
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer).await;
                    }
                }
            }
        }

        if !buffer.is_empty() {
            self.flush(&mut buffer).await;
        }
        info!("invalid-token handler stopped");
    }

    /// Flush the buffered events, one DELETE per `(game, platform)` group,
    /// then retire one pending-work unit per event regardless of outcome.
    async fn flush(&self, buffer: &mut Vec<InvalidTokenEvent>) {
        let events = std::mem::take(buffer);
        let total = events.len();

        for (table, tokens) in group_by_table(&events) {
            self.delete_tokens(&table, &tokens).await;
        }

        for _ in 0..total {
            self.pending.done();
        }
        self.metrics.set_feedback_pending(self.pending.count());
        for _ in 0..total {
            self.metrics.record_feedback_processed();
        }
    }

    /// Issue one DELETE with retries and doubling backoff. After the last
    /// attempt the batch is dropped; redelivery will bring the tokens back.
    async fn delete_tokens(&self, table: &str, tokens: &[String]) {
        let statement = delete_statement(table);
        let mut backoff = INITIAL_RETRY_BACKOFF;

        for attempt in 0..=self.max_retries {
            match sqlx::query(&statement)
                .bind(tokens)
                .execute(&self.pool)
                .await
            {
                Ok(result) => {
                    debug!(
                        table,
                        tokens = tokens.len(),
                        deleted = result.rows_affected(),
                        "deleted invalid tokens"
                    );
                    self.metrics.record_tokens_deleted(result.rows_affected());
                    return;
                }
                Err(e) if attempt < self.max_retries => {
                    warn!(
                        table,
                        error = %e,
                        retry = attempt + 1,
                        max_retries = self.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "invalid-token delete failed, retrying"
                    );
                    self.metrics.record_delete_retry();
                    sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    error!(
                        table,
                        error = %e,
                        tokens = tokens.len(),
                        "dropping invalid-token batch after retry exhaustion"
                    );
                    self.metrics.record_delete_batch_dropped();
                }
            }
        }
    }
}

#[cfg(test)]
impl InvalidTokenHandler {
    /// Create a handler over an externally built pool for testing.
    pub(crate) fn with_pool(
        pool: PgPool,
        config: &InvalidTokenConfig,
        events: async_channel::Receiver<InvalidTokenEvent>,
        pending: Arc<PendingWork>,
        metrics: Metrics,
    ) -> Self {
        Self {
            events,
            pool,
            pending,
            buffer_size: config.buffer_size.max(1),
            flush_interval: config.flush_interval().max(Duration::from_millis(10)),
            max_retries: config.max_retries,
            metrics,
        }
    }
}

/// Group events by target table, skipping events whose game name is not a
/// safe table-name component.
fn group_by_table(events: &[InvalidTokenEvent]) -> HashMap<String, Vec<String>> {
    let mut groups: HashMap<String, Vec<String>> = HashMap::new();

    for event in events {
        if !is_valid_game(&event.game) {
            warn!(game = %event.game, "skipping event with unsafe game name");
            continue;
        }
        groups
            .entry(event.table())
            .or_default()
            .push(event.token.clone());
    }

    groups
}

/// The DELETE statement for a validated table name. Tokens are bound as a
/// single array parameter.
fn delete_statement(table: &str) -> String {
    format!(r#"DELETE FROM "{table}" WHERE token = ANY($1)"#)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::message::Platform;

    fn event(game: &str, platform: Platform, token: &str) -> InvalidTokenEvent {
        InvalidTokenEvent {
            game: game.to_string(),
            platform,
            token: token.to_string(),
        }
    }

    fn test_handler(
        buffer_size: usize,
        flush_interval: u64,
        max_retries: u32,
    ) -> (
        InvalidTokenHandler,
        async_channel::Sender<InvalidTokenEvent>,
        Arc<PendingWork>,
    ) {
        let (tx, rx) = async_channel::bounded(16);
        let pending = PendingWork::new();
        let config = InvalidTokenConfig {
            database_url: String::new(),
            buffer_size,
            flush_interval,
            max_retries,
        };
        // Unreachable database with a short acquire timeout: statements fail
        // fast through the retry path.
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(100))
            .connect_lazy("postgres://pushgate@127.0.0.1:1/void")
            .unwrap();
        let handler = InvalidTokenHandler::with_pool(
            pool,
            &config,
            rx,
            pending.clone(),
            Metrics::new().unwrap(),
        );
        (handler, tx, pending)
    }

    #[test]
    fn test_delete_statement() {
        assert_eq!(
            delete_statement("sniper_gcm"),
            r#"DELETE FROM "sniper_gcm" WHERE token = ANY($1)"#
        );
    }

    #[test]
    fn test_group_by_table() {
        let events = vec![
            event("sniper", Platform::Gcm, "AAAA"),
            event("sniper", Platform::Gcm, "BBBB"),
            event("sniper", Platform::Apns, "abcd"),
            event("warheroes", Platform::Gcm, "DDDD"),
        ];

        let groups = group_by_table(&events);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups["sniper_gcm"], vec!["AAAA", "BBBB"]);
        assert_eq!(groups["sniper_apns"], vec!["abcd"]);
        assert_eq!(groups["warheroes_gcm"], vec!["DDDD"]);
    }

    #[test]
    fn test_group_by_table_skips_unsafe_game_names() {
        let events = vec![
            event("sniper;drop table users", Platform::Gcm, "AAAA"),
            event("sniper", Platform::Gcm, "BBBB"),
        ];

        let groups = group_by_table(&events);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups["sniper_gcm"], vec!["BBBB"]);
    }

    #[test]
    fn test_group_by_table_keeps_duplicates() {
        // Deletion is idempotent; duplicates within a batch are harmless.
        let events = vec![
            event("sniper", Platform::Gcm, "AAAA"),
            event("sniper", Platform::Gcm, "AAAA"),
        ];

        let groups = group_by_table(&events);
        assert_eq!(groups["sniper_gcm"].len(), 2);
    }

    #[tokio::test]
    async fn test_pending_decremented_even_when_deletes_fail() {
        // max_retries = 0 so the unreachable database drops the batch
        // immediately; the handler must still retire every event.
        let (handler, tx, pending) = test_handler(2, 60, 0);
        let handle = tokio::spawn(handler.run());

        pending.add(2);
        tx.send(event("sniper", Platform::Gcm, "AAAA")).await.unwrap();
        tx.send(event("sniper", Platform::Gcm, "BBBB")).await.unwrap();

        assert!(
            !pending.wait_timeout(Duration::from_secs(5)).await,
            "handler must decrement pending for dropped batches"
        );

        tx.close();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_drains_remaining_events_on_close() {
        let (handler, tx, pending) = test_handler(100, 60, 0);

        pending.add(3);
        for token in ["AAAA", "BBBB", "CCCC"] {
            tx.send(event("sniper", Platform::Gcm, token)).await.unwrap();
        }
        tx.close();

        // Buffer bound (100) and interval (60 s) are both out of reach; the
        // close-and-drain path has to flush the remainder.
        tokio::time::timeout(Duration::from_secs(5), handler.run())
            .await
            .unwrap();
        assert_eq!(pending.count(), 0);
    }

    #[tokio::test]
    async fn test_flush_on_interval() {
        let (handler, tx, pending) = test_handler(100, 1, 0);
        let handle = tokio::spawn(handler.run());

        pending.add(1);
        tx.send(event("sniper", Platform::Gcm, "AAAA")).await.unwrap();

        // Well below the buffer bound; only the interval can flush.
        assert!(
            !pending.wait_timeout(Duration::from_secs(5)).await,
            "interval flush must retire buffered events"
        );

        tx.close();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
