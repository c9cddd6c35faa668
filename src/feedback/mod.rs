//! Feedback listener pipeline.
//!
//! Consumer, broker and invalid-token handler cooperating over bounded
//! channels with a shared pending-work counter.

pub mod broker;
pub mod consumer;
pub mod invalid_token;
pub mod listener;
pub mod message;

pub use broker::Broker;
pub use consumer::FeedbackConsumer;
pub use invalid_token::InvalidTokenHandler;
pub use listener::Listener;
pub use message::{FeedbackMessage, InvalidTokenEvent, Platform};
