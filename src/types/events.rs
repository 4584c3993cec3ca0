use crate::calls::{CallState, RemoteTrack};
use crate::types::call::{CallId, CallType, EndCallReason, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct Connected;

#[derive(Debug, Clone)]
pub struct Disconnected;

#[derive(Debug, Clone)]
pub struct Reconnecting {
    pub attempt: u32,
    pub delay: Duration,
}

/// Emitted once the bounded reconnect budget is exhausted.
#[derive(Debug, Clone)]
pub struct ConnectionFailed {
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct CallStateChanged {
    pub call_id: Option<CallId>,
    pub from: CallState,
    pub to: CallState,
}

#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub initiator: UserId,
    pub call_type: CallType,
}

#[derive(Debug, Clone)]
pub struct CallFinished {
    pub call_id: CallId,
    pub reason: EndCallReason,
}

#[derive(Debug, Clone)]
pub struct RemoteTrackAdded {
    pub call_id: CallId,
    pub track: RemoteTrack,
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus that provides separate broadcast channels for each event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Signaling connection events
    (connected, Arc<Connected>),
    (disconnected, Arc<Disconnected>),
    (reconnecting, Arc<Reconnecting>),
    (connection_failed, Arc<ConnectionFailed>),

    // Call events
    (call_state_changed, Arc<CallStateChanged>),
    (incoming_call, Arc<IncomingCall>),
    (call_finished, Arc<CallFinished>),
    (remote_track_added, Arc<RemoteTrackAdded>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends on a broadcast channel, ignoring the "no receivers" case.
pub(crate) fn emit<T>(sender: &broadcast::Sender<Arc<T>>, event: T) {
    let _ = sender.send(Arc::new(event));
}
