//! Call-related error types.

use thiserror::Error;

use crate::request::SignalingError;

/// Errors returned by call engine commands.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("invalid call state: {0}")]
    InvalidState(String),

    #[error("no active call")]
    NoActiveCall,

    #[error("no authenticated local user")]
    NotAuthenticated,

    #[error("invalid call target: {0}")]
    InvalidTarget(String),

    #[error("another call is already in progress")]
    CallInProgress,

    #[error("call was torn down before it was set up")]
    Aborted,

    #[error("call engine stopped")]
    EngineStopped,

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),
}

/// Failures of local capture or of the peer connection.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media access denied: {0}")]
    PermissionDenied(String),

    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("invalid ice candidate: {0}")]
    InvalidCandidate(String),

    #[error("peer connection closed")]
    Closed,

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),
}
