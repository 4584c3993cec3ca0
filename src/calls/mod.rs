//! Call session negotiation.
//!
//! This module drives two-party audio/video calls: initiation, acceptance or
//! decline, session description and ICE candidate exchange, timeouts and
//! teardown. At most one call is active per engine.
//!
//! # Architecture
//!
//! - [`CallEngine`]: single-writer actor owning the [`CallSession`] record
//! - [`CallState`] & [`CallSession`]: call state machine and session record
//! - [`SignalingCommand`] & [`CallSignal`]: outbound and inbound hub messages
//! - [`CallSignalHandler`]: feeds push events from the signaling client into the engine
//! - [`CallTimers`]: outgoing call timeout and delayed reset after errors
//! - [`media`]: local capture and peer connection seams, with a webrtc-rs implementation
//!
//! # Call flow
//!
//! The caller acquires media, announces the call with `InitiateCall` and
//! waits up to 30 seconds. Once the callee answers (`AcceptCall`) the caller
//! sends an offer, the callee replies with an answer and both sides trickle
//! ICE candidates scoped to the call id.

mod engine;
mod error;
mod handler;
pub mod media;
mod signaling;
mod state;
mod timer;
mod transport;

pub use engine::{
    CallEngine, CallEngineDeps, IdentityProvider, NoopRingtone, RingtonePlayer, StaticIdentity,
};
pub use error::{CallError, MediaError};
pub use handler::CallSignalHandler;
pub use media::{
    LocalStream, LocalTrack, MediaDevices, PeerConnection, PeerConnectionFactory,
    PeerConnectionState, PeerEvent, PeerEventReceiver, RemoteStream, RemoteTrack,
    SyntheticMediaDevices, TrackKind, WebRtcPeerConnectionFactory,
};
pub use signaling::{CallSignal, SignalingChannel, SignalingCommand};
pub use state::{
    CallSession, CallSnapshot, CallState, CallTransition, InvalidTransition, SessionMedia,
};
pub use timer::{CallTimers, TimerFired, TimerKind, TimerNotify};
pub use transport::{IceCandidate, SdpType, SessionDescription};
