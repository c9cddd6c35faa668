//! Prometheus metrics for operational visibility.
//!
//! No device tokens, user identifiers, or payload content are exposed;
//! only aggregate counts and operational statistics.

use prometheus::{Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

/// All metrics for the pushgate server.
#[derive(Clone)]
pub struct Metrics {
    /// The Prometheus registry containing all metrics.
    pub registry: Registry,

    // === Feedback Listener Metrics ===
    /// Total number of feedback messages read from the queue.
    pub feedback_received_total: IntCounter,

    /// Total number of feedback messages fully processed.
    pub feedback_processed_total: IntCounter,

    /// Total number of feedback messages discarded, by reason.
    pub feedback_discarded_total: IntCounterVec,

    /// Current number of in-flight feedback messages.
    pub feedback_pending: IntGauge,

    /// Total number of invalid-token events routed to the handler.
    pub invalid_tokens_total: IntCounterVec,

    /// Total number of token rows deleted.
    pub tokens_deleted_total: IntCounter,

    /// Total number of delete statement retries.
    pub delete_retries_total: IntCounter,

    /// Total number of batches dropped after retry exhaustion.
    pub delete_batches_dropped_total: IntCounter,

    // === Push Queue Metrics ===
    /// Total number of notifications accepted by the push queue.
    pub push_dispatched_total: IntCounter,

    /// Total number of push responses, by status code.
    pub push_responses_total: IntCounterVec,

    /// Total number of pushes dropped on transport failure.
    pub push_transport_failures_total: IntCounter,

    /// Number of push workers currently occupied by a send.
    pub push_workers_busy: IntGauge,

    // === Server Metrics ===
    /// Timestamp when the server started (Unix seconds).
    pub server_start_time_seconds: Gauge,

    /// Server version information.
    pub server_info: IntGaugeVec,
}

impl Metrics {
    /// Create a new metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let feedback_received_total = IntCounter::with_opts(Opts::new(
            "pushgate_feedback_received_total",
            "Total number of feedback messages read from the queue",
        ))?;
        registry.register(Box::new(feedback_received_total.clone()))?;

        let feedback_processed_total = IntCounter::with_opts(Opts::new(
            "pushgate_feedback_processed_total",
            "Total number of feedback messages fully processed",
        ))?;
        registry.register(Box::new(feedback_processed_total.clone()))?;

        let feedback_discarded_total = IntCounterVec::new(
            Opts::new(
                "pushgate_feedback_discarded_total",
                "Total number of feedback messages discarded",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(feedback_discarded_total.clone()))?;

        let feedback_pending = IntGauge::with_opts(Opts::new(
            "pushgate_feedback_pending",
            "Current number of in-flight feedback messages",
        ))?;
        registry.register(Box::new(feedback_pending.clone()))?;

        let invalid_tokens_total = IntCounterVec::new(
            Opts::new(
                "pushgate_invalid_tokens_total",
                "Total number of invalid-token events routed to the handler",
            ),
            &["platform"],
        )?;
        registry.register(Box::new(invalid_tokens_total.clone()))?;

        let tokens_deleted_total = IntCounter::with_opts(Opts::new(
            "pushgate_tokens_deleted_total",
            "Total number of token rows deleted",
        ))?;
        registry.register(Box::new(tokens_deleted_total.clone()))?;

        let delete_retries_total = IntCounter::with_opts(Opts::new(
            "pushgate_delete_retries_total",
            "Total number of delete statement retries",
        ))?;
        registry.register(Box::new(delete_retries_total.clone()))?;

        let delete_batches_dropped_total = IntCounter::with_opts(Opts::new(
            "pushgate_delete_batches_dropped_total",
            "Total number of delete batches dropped after retry exhaustion",
        ))?;
        registry.register(Box::new(delete_batches_dropped_total.clone()))?;

        let push_dispatched_total = IntCounter::with_opts(Opts::new(
            "pushgate_push_dispatched_total",
            "Total number of notifications accepted by the push queue",
        ))?;
        registry.register(Box::new(push_dispatched_total.clone()))?;

        let push_responses_total = IntCounterVec::new(
            Opts::new(
                "pushgate_push_responses_total",
                "Total number of push responses by status code",
            ),
            &["status"],
        )?;
        registry.register(Box::new(push_responses_total.clone()))?;

        let push_transport_failures_total = IntCounter::with_opts(Opts::new(
            "pushgate_push_transport_failures_total",
            "Total number of pushes dropped on transport failure",
        ))?;
        registry.register(Box::new(push_transport_failures_total.clone()))?;

        let push_workers_busy = IntGauge::with_opts(Opts::new(
            "pushgate_push_workers_busy",
            "Number of push workers currently occupied by a send",
        ))?;
        registry.register(Box::new(push_workers_busy.clone()))?;

        let server_start_time_seconds = Gauge::with_opts(Opts::new(
            "pushgate_server_start_time_seconds",
            "Unix timestamp when the server started",
        ))?;
        registry.register(Box::new(server_start_time_seconds.clone()))?;

        let server_info = IntGaugeVec::new(
            Opts::new("pushgate_server_info", "Server version and build information"),
            &["version"],
        )?;
        registry.register(Box::new(server_info.clone()))?;

        Ok(Self {
            registry,
            feedback_received_total,
            feedback_processed_total,
            feedback_discarded_total,
            feedback_pending,
            invalid_tokens_total,
            tokens_deleted_total,
            delete_retries_total,
            delete_batches_dropped_total,
            push_dispatched_total,
            push_responses_total,
            push_transport_failures_total,
            push_workers_busy,
            server_start_time_seconds,
            server_info,
        })
    }

    /// Initialize server startup metrics.
    pub fn init_server_info(&self, version: &str) {
        self.server_start_time_seconds.set(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        );
        self.server_info.with_label_values(&[version]).set(1);
    }

    /// Record a feedback message read from the queue.
    pub fn record_feedback_received(&self) {
        self.feedback_received_total.inc();
    }

    /// Record a fully processed feedback message.
    pub fn record_feedback_processed(&self) {
        self.feedback_processed_total.inc();
    }

    /// Record a discarded feedback message.
    pub fn record_feedback_discarded(&self, reason: &str) {
        self.feedback_discarded_total
            .with_label_values(&[reason])
            .inc();
    }

    /// Update the in-flight feedback gauge.
    pub fn set_feedback_pending(&self, pending: usize) {
        self.feedback_pending.set(pending as i64);
    }

    /// Record an invalid-token event routed to the handler.
    pub fn record_invalid_token(&self, platform: &str) {
        self.invalid_tokens_total
            .with_label_values(&[platform])
            .inc();
    }

    /// Record deleted token rows.
    pub fn record_tokens_deleted(&self, count: u64) {
        self.tokens_deleted_total.inc_by(count);
    }

    /// Record a delete statement retry.
    pub fn record_delete_retry(&self) {
        self.delete_retries_total.inc();
    }

    /// Record a batch dropped after retry exhaustion.
    pub fn record_delete_batch_dropped(&self) {
        self.delete_batches_dropped_total.inc();
    }

    /// Record a notification accepted by the push queue.
    pub fn record_push_dispatched(&self) {
        self.push_dispatched_total.inc();
    }

    /// Record a push response by status code.
    pub fn record_push_response(&self, status: u16) {
        self.push_responses_total
            .with_label_values(&[&status.to_string()])
            .inc();
    }

    /// Record a push dropped on transport failure.
    pub fn record_push_transport_failure(&self) {
        self.push_transport_failures_total.inc();
    }

    /// Mark a push worker as occupied by a send.
    pub fn record_push_worker_busy(&self) {
        self.push_workers_busy.inc();
    }

    /// Mark a push worker as idle again.
    pub fn record_push_worker_idle(&self) {
        self.push_workers_busy.dec();
    }

    /// Gather all metrics for export.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
