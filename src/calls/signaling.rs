//! Call signaling message definitions.
//!
//! Outbound messages are hub invocations (`target` is the method name),
//! inbound messages are push events. Every message carries the `callId` it
//! belongs to so stale or foreign deliveries can be dropped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::transport::{IceCandidate, SessionDescription};
use crate::request::SignalingError;
use crate::types::call::{CallId, CallType, UserId};

/// Messages the engine sends to the remote peer through the signaling service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "target", content = "arguments")]
pub enum SignalingCommand {
    #[serde(rename_all = "camelCase")]
    InitiateCall {
        call_id: CallId,
        initiator: UserId,
        #[serde(rename = "type")]
        call_type: CallType,
        target_user: UserId,
    },
    #[serde(rename_all = "camelCase")]
    SendOffer {
        call_id: CallId,
        peer_id: UserId,
        offer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    SendAnswer {
        call_id: CallId,
        peer_id: UserId,
        answerer_id: UserId,
        answer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    SendIceCandidate {
        call_id: CallId,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    AcceptCall {
        call_id: CallId,
        accepter: UserId,
        #[serde(default)]
        answer_sdp: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    DeclineCall {
        call_id: CallId,
        decliner_id: UserId,
        #[serde(default)]
        is_busy: bool,
    },
    #[serde(rename_all = "camelCase")]
    EndCall { call_id: CallId, ender_id: UserId },
}

impl SignalingCommand {
    /// Hub method name used on the wire.
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::InitiateCall { .. } => "InitiateCall",
            Self::SendOffer { .. } => "SendOffer",
            Self::SendAnswer { .. } => "SendAnswer",
            Self::SendIceCandidate { .. } => "SendIceCandidate",
            Self::AcceptCall { .. } => "AcceptCall",
            Self::DeclineCall { .. } => "DeclineCall",
            Self::EndCall { .. } => "EndCall",
        }
    }

    pub fn call_id(&self) -> &CallId {
        match self {
            Self::InitiateCall { call_id, .. }
            | Self::SendOffer { call_id, .. }
            | Self::SendAnswer { call_id, .. }
            | Self::SendIceCandidate { call_id, .. }
            | Self::AcceptCall { call_id, .. }
            | Self::DeclineCall { call_id, .. }
            | Self::EndCall { call_id, .. } => call_id,
        }
    }

    /// The invocation arguments, without the method name.
    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        Ok(value["arguments"].take())
    }
}

/// Push events the signaling service delivers to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "target", content = "arguments")]
pub enum CallSignal {
    #[serde(rename_all = "camelCase")]
    IncomingCall {
        call_id: CallId,
        initiator: UserId,
        #[serde(rename = "type")]
        call_type: CallType,
        target_user: UserId,
    },
    #[serde(rename_all = "camelCase")]
    ReceiveOffer {
        call_id: CallId,
        offer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    ReceiveAnswer {
        call_id: CallId,
        answer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    ReceiveIceCandidate {
        call_id: CallId,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    CallAccepted { call_id: CallId, accepter: UserId },
    #[serde(rename_all = "camelCase")]
    CallDeclined {
        call_id: CallId,
        decliner_id: UserId,
        #[serde(default)]
        is_busy: bool,
    },
    #[serde(rename_all = "camelCase")]
    CallEnded { call_id: CallId, ender_id: UserId },
    #[serde(rename_all = "camelCase")]
    UserBusy {
        #[serde(default)]
        call_id: Option<CallId>,
    },
    #[serde(rename_all = "camelCase")]
    CallError {
        message: String,
        #[serde(default)]
        call_id: Option<CallId>,
    },
}

impl CallSignal {
    /// Event names the engine subscribes to.
    pub const EVENT_NAMES: [&'static str; 9] = [
        "IncomingCall",
        "ReceiveOffer",
        "ReceiveAnswer",
        "ReceiveIceCandidate",
        "CallAccepted",
        "CallDeclined",
        "CallEnded",
        "UserBusy",
        "CallError",
    ];

    /// Builds a typed signal from a push event's name and arguments.
    pub fn from_event(event: &str, arguments: &Value) -> Result<Self, serde_json::Error> {
        let arguments = if arguments.is_null() {
            Value::Object(Default::default())
        } else {
            arguments.clone()
        };
        serde_json::from_value(serde_json::json!({
            "target": event,
            "arguments": arguments,
        }))
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::IncomingCall { .. } => "IncomingCall",
            Self::ReceiveOffer { .. } => "ReceiveOffer",
            Self::ReceiveAnswer { .. } => "ReceiveAnswer",
            Self::ReceiveIceCandidate { .. } => "ReceiveIceCandidate",
            Self::CallAccepted { .. } => "CallAccepted",
            Self::CallDeclined { .. } => "CallDeclined",
            Self::CallEnded { .. } => "CallEnded",
            Self::UserBusy { .. } => "UserBusy",
            Self::CallError { .. } => "CallError",
        }
    }

    /// The call this signal is scoped to. `UserBusy` and `CallError` may omit it.
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Self::IncomingCall { call_id, .. }
            | Self::ReceiveOffer { call_id, .. }
            | Self::ReceiveAnswer { call_id, .. }
            | Self::ReceiveIceCandidate { call_id, .. }
            | Self::CallAccepted { call_id, .. }
            | Self::CallDeclined { call_id, .. }
            | Self::CallEnded { call_id, .. } => Some(call_id),
            Self::UserBusy { call_id } | Self::CallError { call_id, .. } => call_id.as_ref(),
        }
    }
}

/// Outbound half of the signaling service as seen by the engine.
///
/// Resolves once the service has accepted the message for delivery.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send_command(&self, command: SignalingCommand) -> Result<(), SignalingError>;
}
