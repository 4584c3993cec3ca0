//! Call state machine implementation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::media::{LocalStream, PeerConnection, RemoteStream, RemoteTrack};
use super::transport::IceCandidate;
use crate::types::call::{CallDirection, CallId, CallType, UserId};

/// Current state of the call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum CallState {
    /// No call. Only reachable through a reset.
    #[default]
    Idle,
    /// Outgoing call: announced to the callee, waiting for an answer.
    InitiatingOutgoing,
    /// Incoming call: ringing locally.
    ReceivingIncoming,
    /// Accepted, exchanging session descriptions.
    Negotiating,
    /// Both descriptions applied, media flowing.
    Ongoing,
    /// Failed. A delayed reset follows.
    Error,
    /// Finished normally. A reset follows immediately.
    Ended,
}

impl CallState {
    /// States in which the call is still being set up or running.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::InitiatingOutgoing | Self::ReceivingIncoming | Self::Negotiating | Self::Ongoing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error | Self::Ended)
    }

    /// Before the callee has agreed to the call.
    pub fn is_unanswered(&self) -> bool {
        matches!(self, Self::InitiatingOutgoing | Self::ReceivingIncoming)
    }
}

/// State transitions for calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    OutgoingStarted,
    IncomingReceived,
    RemoteAccepted,
    LocalAnswered,
    DescriptionsExchanged,
    Failed,
    Ended,
}

/// Resources owned by a live session. Present together or not at all.
pub struct SessionMedia {
    pub local_stream: LocalStream,
    pub peer_connection: Arc<dyn PeerConnection>,
}

impl std::fmt::Debug for SessionMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMedia")
            .field("local_stream", &self.local_stream)
            .finish_non_exhaustive()
    }
}

/// The single call session record of an engine.
#[derive(Debug, Default)]
pub struct CallSession {
    pub call_id: Option<CallId>,
    pub call_type: CallType,
    pub state: CallState,
    pub direction: Option<CallDirection>,
    pub initiator: Option<UserId>,
    pub receiver: Option<UserId>,
    /// The other party. Re-pointed to the accepter once known.
    pub target_user: Option<UserId>,
    pub media: Option<SessionMedia>,
    pub remote_stream: Option<RemoteStream>,
    pub is_local_audio_muted: bool,
    pub is_local_video_muted: bool,
    pub error: Option<String>,
    /// Bumped on every reset.
    pub generation: u64,
    /// Remote candidates waiting for a remote description.
    pub pending_candidates: Vec<IceCandidate>,
    pub has_remote_description: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_outgoing(
        &mut self,
        call_id: CallId,
        local_user: UserId,
        target_user: UserId,
        call_type: CallType,
    ) -> Result<(), InvalidTransition> {
        self.apply_transition(CallTransition::OutgoingStarted)?;
        self.call_id = Some(call_id);
        self.call_type = call_type;
        self.direction = Some(CallDirection::Outgoing);
        self.initiator = Some(local_user);
        self.receiver = Some(target_user.clone());
        self.target_user = Some(target_user);
        self.created_at = Some(Utc::now());
        Ok(())
    }

    pub fn start_incoming(
        &mut self,
        call_id: CallId,
        initiator: UserId,
        local_user: UserId,
        call_type: CallType,
    ) -> Result<(), InvalidTransition> {
        self.apply_transition(CallTransition::IncomingReceived)?;
        self.call_id = Some(call_id);
        self.call_type = call_type;
        self.direction = Some(CallDirection::Incoming);
        self.target_user = Some(initiator.clone());
        self.initiator = Some(initiator);
        self.receiver = Some(local_user);
        self.created_at = Some(Utc::now());
        Ok(())
    }

    /// Whether `call_id` names the current call.
    pub fn is_current(&self, call_id: &CallId) -> bool {
        self.call_id.as_ref() == Some(call_id)
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == Some(CallDirection::Outgoing)
    }

    /// Our own identity in this call.
    pub fn local_user(&self) -> Option<&UserId> {
        match self.direction? {
            CallDirection::Outgoing => self.initiator.as_ref(),
            CallDirection::Incoming => self.receiver.as_ref(),
        }
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let new_state = match (self.state, transition) {
            (CallState::Idle, CallTransition::OutgoingStarted) => CallState::InitiatingOutgoing,
            (CallState::Idle, CallTransition::IncomingReceived) => CallState::ReceivingIncoming,
            (CallState::InitiatingOutgoing, CallTransition::RemoteAccepted) => {
                CallState::Negotiating
            }
            (CallState::ReceivingIncoming, CallTransition::LocalAnswered) => {
                CallState::Negotiating
            }
            (CallState::Negotiating, CallTransition::DescriptionsExchanged) => {
                self.connected_at = Some(Utc::now());
                CallState::Ongoing
            }
            (current, CallTransition::Failed) if current.is_live() => CallState::Error,
            (current, CallTransition::Ended) if current.is_live() => CallState::Ended,
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.state = new_state;
        Ok(())
    }

    /// Records an inbound track. Only the first stream group is kept.
    pub fn add_remote_track(&mut self, track: RemoteTrack) -> bool {
        match &mut self.remote_stream {
            None => {
                self.remote_stream = Some(RemoteStream {
                    id: track.stream_id.clone(),
                    tracks: vec![track],
                });
                true
            }
            Some(stream) if stream.id == track.stream_id => {
                if stream.tracks.iter().any(|t| t.id == track.id) {
                    return false;
                }
                stream.tracks.push(track);
                true
            }
            Some(_) => false,
        }
    }

    /// Returns to `Idle`, handing back the resources the caller must release.
    pub fn reset(&mut self) -> Option<SessionMedia> {
        let media = self.media.take();
        let generation = self.generation.wrapping_add(1);
        *self = Self {
            generation,
            ..Self::default()
        };
        media
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.call_id.clone(),
            call_type: self.call_type,
            state: self.state,
            direction: self.direction,
            initiator: self.initiator.clone(),
            receiver: self.receiver.clone(),
            target_user: self.target_user.clone(),
            has_local_stream: self.media.is_some(),
            has_peer_connection: self.media.is_some(),
            remote_stream: self.remote_stream.clone(),
            is_local_audio_muted: self.is_local_audio_muted,
            is_local_video_muted: self.is_local_video_muted,
            error: self.error.clone(),
            created_at: self.created_at,
            connected_at: self.connected_at,
        }
    }
}

/// Read-only view of the session published to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct CallSnapshot {
    pub call_id: Option<CallId>,
    pub call_type: CallType,
    pub state: CallState,
    pub direction: Option<CallDirection>,
    pub initiator: Option<UserId>,
    pub receiver: Option<UserId>,
    pub target_user: Option<UserId>,
    pub has_local_stream: bool,
    pub has_peer_connection: bool,
    pub remote_stream: Option<RemoteStream>,
    pub is_local_audio_muted: bool,
    pub is_local_video_muted: bool,
    pub error: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
