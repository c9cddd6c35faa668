//! APNs push queue: a bounded worker pool over a pool of clients.
//!
//! Workers read notifications from an unbuffered push channel, borrow a
//! client from the pool (returning it immediately, the HTTP/2 transport
//! multiplexes), send, and publish the response with per-message metadata.
//! Transport failures are logged and publish nothing; the at-most
//! `concurrent_workers` in-flight bound and the blocking `push` call are
//! the back-pressure surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::config::ApnsConfig;
use crate::error::{Error, PushError, Result};
use crate::metrics::Metrics;
use crate::push::apns::{ApnsClient, Notification, ProviderToken};

/// APNs response paired with the notification it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseWithMetadata {
    /// HTTP status returned by APNs.
    pub status_code: u16,
    /// Rejection reason; empty on success.
    pub reason: String,
    /// The apns-id response header.
    pub apns_id: String,
    /// Whether APNs accepted the notification.
    pub sent: bool,
    /// Device token copied from the inbound notification.
    pub device_token: String,
}

/// Pushes notifications to APNs through a pooled worker set.
pub struct ApnsPushQueue {
    config: ApnsConfig,
    push_tx: async_channel::Sender<Notification>,
    push_rx: async_channel::Receiver<Notification>,
    response_tx: async_channel::Sender<ResponseWithMetadata>,
    response_rx: async_channel::Receiver<ResponseWithMetadata>,
    configured: AtomicBool,
    closed: AtomicBool,
    metrics: Metrics,
}

impl ApnsPushQueue {
    /// Create an unconfigured queue. Call [`ApnsPushQueue::configure`]
    /// before pushing.
    pub fn new(config: ApnsConfig, metrics: Metrics) -> Self {
        // Rendezvous-sized channels: `push` blocks until a worker accepts,
        // and workers block until the response is consumed.
        let (push_tx, push_rx) = async_channel::bounded(1);
        let (response_tx, response_rx) = async_channel::bounded(1);

        Self {
            config,
            push_tx,
            push_rx,
            response_tx,
            response_rx,
            configured: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    /// Load the signing key, build the client pool and spawn the workers.
    ///
    /// A key that cannot be read or parsed returns an error and leaves the
    /// queue unconfigured.
    pub async fn configure(&self) -> Result<()> {
        let token = Arc::new(
            ProviderToken::from_key_file(
                &self.config.auth_key_path,
                &self.config.key_id,
                &self.config.team_id,
            )
            .await?,
        );

        let pool_size = self.config.connection_pool_size.max(1);
        let mut clients = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            clients.push(ApnsClient::new(self.config.base_url(), token.clone())?);
        }
        debug!(
            pool_size,
            production = self.config.is_production(),
            "APNs clients configured"
        );

        self.spawn_workers(clients, self.config.concurrent_workers.max(1));
        Ok(())
    }

    fn spawn_workers(&self, clients: Vec<ApnsClient>, workers: usize) {
        let pool_size = clients.len().max(1);
        let (clients_tx, clients_rx) = async_channel::bounded(pool_size);
        for client in clients {
            clients_tx
                .try_send(Arc::new(client))
                .expect("client pool channel sized to fit every client");
        }

        for worker in 0..workers {
            let push_rx = self.push_rx.clone();
            let response_tx = self.response_tx.clone();
            let clients = clients_rx.clone();
            let clients_tx = clients_tx.clone();
            let metrics = self.metrics.clone();

            tokio::spawn(async move {
                push_worker(worker, push_rx, response_tx, clients, clients_tx, metrics).await;
            });
        }

        self.configured.store(true, Ordering::Release);
        info!(workers, "APNs push queue started");
    }

    /// Whether `configure` completed successfully.
    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Receiver of push responses. Cloneable; a slow reader blocks the
    /// workers, which is the intended back-pressure.
    pub fn responses(&self) -> async_channel::Receiver<ResponseWithMetadata> {
        self.response_rx.clone()
    }

    /// Publish a notification, blocking until a worker accepts it.
    pub async fn push(&self, notification: Notification) -> Result<()> {
        if self.is_closed() {
            return Err(Error::QueueClosed);
        }

        self.metrics.record_push_dispatched();
        self.push_tx
            .send(notification)
            .await
            .map_err(|_| Error::QueueClosed)
    }

    /// Close the push channel, then the response channel, and mark the
    /// queue closed. Workers drain what they already accepted.
    pub fn close(&self) {
        self.push_tx.close();
        self.response_tx.close();
        self.closed.store(true, Ordering::Release);
        info!("APNs push queue closed");
    }
}

/// Leading characters of a device token, for log context.
fn token_prefix(token: &str) -> &str {
    match token.char_indices().nth(8) {
        Some((idx, _)) => &token[..idx],
        None => token,
    }
}

async fn push_worker(
    worker: usize,
    push_rx: async_channel::Receiver<Notification>,
    response_tx: async_channel::Sender<ResponseWithMetadata>,
    clients: async_channel::Receiver<Arc<ApnsClient>>,
    clients_tx: async_channel::Sender<Arc<ApnsClient>>,
    metrics: Metrics,
) {
    while let Ok(notification) = push_rx.recv().await {
        let Ok(client) = clients.recv().await else {
            break;
        };
        // Clients are concurrency-safe; return the borrow immediately. The
        // pool channel is sized to hold every client, so this cannot fail.
        let _ = clients_tx.try_send(client.clone());

        metrics.record_push_worker_busy();
        match client.send(&notification).await {
            Err(e) => {
                // No response from the service: log and drop, publish nothing.
                warn!(
                    worker,
                    error = %PushError::new("transport", e.to_string()),
                    device_token_prefix = token_prefix(&notification.device_token),
                    "push send failed"
                );
                metrics.record_push_transport_failure();
            }
            Ok(response) => {
                metrics.record_push_response(response.status_code);
                let sent = response.sent();
                let metadata = ResponseWithMetadata {
                    status_code: response.status_code,
                    reason: response.reason,
                    apns_id: response.apns_id,
                    sent,
                    device_token: notification.device_token,
                };
                if response_tx.send(metadata).await.is_err() {
                    debug!(worker, "response channel closed; dropping response");
                }
            }
        }
        metrics.record_push_worker_idle();
    }
    debug!(worker, "push worker exiting");
}

#[cfg(test)]
impl ApnsPushQueue {
    /// Configure the queue over pre-built clients, bypassing key loading.
    pub(crate) fn configure_with_clients(&self, clients: Vec<ApnsClient>) {
        self.spawn_workers(clients, self.config.concurrent_workers.max(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant, SystemTime};
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(pool_size: usize, workers: usize) -> ApnsConfig {
        ApnsConfig {
            auth_key_path: String::new(),
            key_id: "KEY123".to_string(),
            team_id: "TEAM456".to_string(),
            environment: "development".to_string(),
            topic: "com.example.game".to_string(),
            connection_pool_size: pool_size,
            concurrent_workers: workers,
        }
    }

    fn notification(device_token: &str) -> Notification {
        Notification {
            device_token: device_token.to_string(),
            topic: "com.example.game".to_string(),
            payload: serde_json::json!({"aps": {"alert": "hi"}}),
        }
    }

    async fn mock_clients(uri: &str, count: usize) -> Vec<ApnsClient> {
        let token = Arc::new(ProviderToken::mock("KEY", "TEAM"));
        token
            .prime("test-token", SystemTime::now() + Duration::from_secs(3600))
            .await;
        (0..count)
            .map(|_| ApnsClient::mock(uri, token.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_configure_fails_without_key_file() {
        let queue = ApnsPushQueue::new(test_config(2, 3), Metrics::new().unwrap());
        assert!(queue.configure().await.is_err());
        assert!(!queue.is_configured());
    }

    #[tokio::test]
    async fn test_push_after_close_is_rejected() {
        let queue = ApnsPushQueue::new(test_config(2, 3), Metrics::new().unwrap());
        queue.close();

        let result = queue.push(notification("aabbcc")).await;
        assert!(matches!(result, Err(Error::QueueClosed)));
    }

    #[tokio::test]
    async fn test_close_closes_response_channel() {
        let queue = ApnsPushQueue::new(test_config(2, 3), Metrics::new().unwrap());
        let responses = queue.responses();

        queue.close();
        assert!(queue.is_closed());
        assert!(responses.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_pushes_produce_responses_with_metadata() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"/3/device/.+"))
            .respond_with(ResponseTemplate::new(200).insert_header("apns-id", "7-XYZ"))
            .mount(&mock_server)
            .await;

        let queue = ApnsPushQueue::new(test_config(2, 3), Metrics::new().unwrap());
        queue.configure_with_clients(mock_clients(&mock_server.uri(), 2).await);
        assert!(queue.is_configured());

        let responses = queue.responses();
        queue.push(notification("device-0001")).await.unwrap();

        let metadata = tokio::time::timeout(Duration::from_secs(5), responses.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(metadata.status_code, 200);
        assert_eq!(metadata.apns_id, "7-XYZ");
        assert!(metadata.sent);
        assert!(metadata.reason.is_empty());
        assert_eq!(metadata.device_token, "device-0001");
    }

    #[tokio::test]
    async fn test_rejection_reason_is_forwarded() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"/3/device/.+"))
            .respond_with(ResponseTemplate::new(410).set_body_json(serde_json::json!({
                "reason": "Unregistered"
            })))
            .mount(&mock_server)
            .await;

        let queue = ApnsPushQueue::new(test_config(1, 1), Metrics::new().unwrap());
        queue.configure_with_clients(mock_clients(&mock_server.uri(), 1).await);

        let responses = queue.responses();
        queue.push(notification("gone-device")).await.unwrap();

        let metadata = responses.recv().await.unwrap();
        assert_eq!(metadata.status_code, 410);
        assert_eq!(metadata.reason, "Unregistered");
        assert!(!metadata.sent);
        assert_eq!(metadata.device_token, "gone-device");
    }

    #[tokio::test]
    async fn test_transport_failures_publish_nothing() {
        // Nothing listens on this address; every send is a transport error.
        let queue = ApnsPushQueue::new(test_config(1, 2), Metrics::new().unwrap());
        queue.configure_with_clients(mock_clients("http://127.0.0.1:1", 1).await);

        let responses = queue.responses();
        queue.push(notification("unreachable-1")).await.unwrap();
        queue.push(notification("unreachable-2")).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), responses.recv()).await;
        assert!(outcome.is_err(), "transport failures must not produce responses");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ten_pushes_bounded_by_worker_count() {
        const DELAY: Duration = Duration::from_millis(100);

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"/3/device/.+"))
            .respond_with(ResponseTemplate::new(200).set_delay(DELAY))
            .mount(&mock_server)
            .await;

        // Pool of 2 clients, 3 workers.
        let queue = Arc::new(ApnsPushQueue::new(test_config(2, 3), Metrics::new().unwrap()));
        queue.configure_with_clients(mock_clients(&mock_server.uri(), 2).await);

        let responses = queue.responses();
        let started = Instant::now();

        let pusher = queue.clone();
        let producer = tokio::spawn(async move {
            for i in 0..10 {
                pusher.push(notification(&format!("device-{i:04}"))).await.unwrap();
            }
        });

        let mut received = Vec::with_capacity(10);
        for _ in 0..10 {
            let metadata = tokio::time::timeout(Duration::from_secs(10), responses.recv())
                .await
                .unwrap()
                .unwrap();
            received.push(metadata);
        }
        producer.await.unwrap();

        assert_eq!(received.len(), 10);
        assert!(received.iter().all(|r| r.sent));

        // With 3 workers and a 100 ms send, 10 notifications need at least
        // four sequential rounds; anything faster would mean more than 3
        // sends were in flight at once.
        assert!(
            started.elapsed() >= DELAY * 3,
            "elapsed {:?} implies the worker bound was exceeded",
            started.elapsed()
        );

        queue.close();
    }
}
