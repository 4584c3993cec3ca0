use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a participant as known to the signaling service.
pub type UserId = String;

/// Opaque identifier scoping every signaling message of one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh id: 16 random bytes rendered as upper-case hex.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Media kind of a call, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    #[default]
    Voice,
    Video,
}

impl CallType {
    pub fn is_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Voice => f.write_str("voice"),
            Self::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Why a call left the live states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EndCallReason {
    /// We declined or cancelled before the call was answered.
    LocalDeclined,
    /// We hung up a negotiating or ongoing call.
    LocalEnded,
    /// The peer declined.
    RemoteDeclined,
    /// The peer hung up.
    RemoteEnded,
    /// The session failed; carries the error description.
    Failed(String),
}
