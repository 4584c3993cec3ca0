//! Local capture and peer connection seams.
//!
//! The engine never touches WebRTC directly. It acquires a [`LocalStream`]
//! from [`MediaDevices`], creates a [`PeerConnection`] through a
//! [`PeerConnectionFactory`] and consumes the [`PeerEvent`]s the connection
//! reports on its channel.
//!
//! - [`SyntheticMediaDevices`]: silent sample tracks for headless clients
//! - [`WebRtcPeerConnectionFactory`]: webrtc-rs backed peer connections

mod devices;
mod webrtc;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use ::webrtc::track::track_local::TrackLocal;
use ::webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub use self::devices::{SyntheticMediaDevices, pump_silence};
pub use self::webrtc::{WebRtcPeerConnection, WebRtcPeerConnectionFactory};

use super::error::MediaError;
use super::transport::{IceCandidate, SessionDescription};
use crate::config::IceServerConfig;
use crate::types::call::CallType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// One captured track. Clones share the enabled/stopped flags.
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    rtp: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, rtp: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            id: rtp.id().to_string(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
            rtp,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Disabled tracks stay attached but produce no samples.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// The sample track handed to the peer connection.
    pub fn rtp_track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.rtp
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Captured audio and optional video for one call.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks_of(kind).next().is_some()
    }

    /// Flips every track of `kind`. Returns how many tracks were touched.
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> usize {
        let mut count = 0;
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
            count += 1;
        }
        count
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(LocalTrack::is_stopped)
    }
}

/// An inbound track announced by the peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// The first inbound track group of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// States that end a live call.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Events reported by a peer connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    StateChanged(PeerConnectionState),
}

pub type PeerEventReceiver = mpsc::UnboundedReceiver<PeerEvent>;

/// Local capture (camera and microphone).
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Audio always, plus video for video calls.
    async fn acquire(&self, call_type: CallType) -> Result<LocalStream, MediaError>;
}

/// One negotiated connection to the remote peer.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), MediaError>;

    /// Creates an offer and installs it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    /// Creates an answer to the applied remote offer and installs it locally.
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_remote_description(&self, description: SessionDescription)
    -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    async fn close(&self) -> Result<(), MediaError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> Result<(Arc<dyn PeerConnection>, PeerEventReceiver), MediaError>;
}
