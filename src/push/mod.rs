//! APNs push clients and the pooled push queue.

pub mod apns;
pub mod queue;

pub use apns::{ApnsClient, ApnsResponse, Notification, ProviderToken};
pub use queue::{ApnsPushQueue, ResponseWithMetadata};
