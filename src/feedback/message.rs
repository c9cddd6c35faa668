//! Feedback message model and classification.
//!
//! Feedback topics follow the naming scheme `push-<game>-<platform>-feedbacks`.
//! Payloads decode to a per-platform variant; each variant knows which of its
//! error codes mean the device token is permanently undeliverable.

use std::fmt;

use serde::Deserialize;

use crate::error::{Error, Result};

/// GCM error codes that identify a permanently invalid device token.
const GCM_INVALID_TOKEN_ERRORS: [&str; 5] = [
    "DEVICE_UNREGISTERED",
    "BAD_REGISTRATION",
    "INVALID_REGISTRATION",
    "MISMATCH_SENDER_ID",
    "NOT_REGISTERED",
];

/// APNs rejection reasons that identify a permanently invalid device token.
const APNS_INVALID_TOKEN_REASONS: [&str; 2] = ["BadDeviceToken", "Unregistered"];

/// Push provider family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Gcm,
    Apns,
}

impl Platform {
    /// The platform segment as it appears in topic and table names.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Gcm => "gcm",
            Platform::Apns => "apns",
        }
    }

    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "gcm" => Some(Platform::Gcm),
            "apns" => Some(Platform::Apns),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw feedback record read from the queue, not yet decoded.
#[derive(Debug, Clone)]
pub struct FeedbackMessage {
    /// Topic the record was read from.
    pub topic: String,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

/// The `(game, platform)` pair extracted from a feedback topic name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicId {
    pub game: String,
    pub platform: Platform,
}

/// Returns true if `game` is usable as a table-name component.
#[must_use]
pub fn is_valid_game(game: &str) -> bool {
    !game.is_empty()
        && game
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Parse a topic of the form `push-<game>-<platform>-feedbacks`.
///
/// `<game>` may itself contain dashes; the platform is the last segment
/// before the `-feedbacks` suffix.
pub fn parse_topic(topic: &str) -> Result<TopicId> {
    let unmatched = || Error::Topic(topic.to_string());

    let inner = topic
        .strip_prefix("push-")
        .and_then(|rest| rest.strip_suffix("-feedbacks"))
        .ok_or_else(unmatched)?;

    let (game, platform_segment) = inner.rsplit_once('-').ok_or_else(unmatched)?;
    let platform = Platform::from_segment(platform_segment).ok_or_else(unmatched)?;

    if !is_valid_game(game) {
        return Err(unmatched());
    }

    Ok(TopicId {
        game: game.to_string(),
        platform,
    })
}

/// GCM feedback payload. Extra fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct GcmFeedback {
    /// Device registration token the feedback refers to.
    pub from: String,
    /// GCM error code.
    pub error: String,
}

impl GcmFeedback {
    /// Whether the error code marks the token as permanently undeliverable.
    #[must_use]
    pub fn is_invalid_token(&self) -> bool {
        GCM_INVALID_TOKEN_ERRORS.contains(&self.error.as_str())
    }

    /// The device token the feedback refers to.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.from
    }
}

/// APNs feedback payload. Extra fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ApnsFeedback {
    /// Device token the feedback refers to.
    #[serde(rename = "deviceToken")]
    pub device_token: String,
    /// APNs rejection reason.
    pub reason: String,
    /// HTTP status reported by APNs.
    #[serde(rename = "statusCode")]
    pub status_code: i64,
}

impl ApnsFeedback {
    /// Whether the reason marks the token as permanently undeliverable.
    #[must_use]
    pub fn is_invalid_token(&self) -> bool {
        APNS_INVALID_TOKEN_REASONS.contains(&self.reason.as_str())
    }

    /// The device token the feedback refers to.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.device_token
    }
}

/// A device token reported as permanently undeliverable, routed to the
/// invalid-token handler for removal from the `<game>_<platform>` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTokenEvent {
    pub game: String,
    pub platform: Platform,
    pub token: String,
}

impl InvalidTokenEvent {
    /// The user-device table this event targets.
    #[must_use]
    pub fn table(&self) -> String {
        format!("{}_{}", self.game, self.platform)
    }
}
