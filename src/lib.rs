pub mod types {
    pub mod call;
    pub mod events;
}

pub mod calls;
pub mod client;
pub mod config;
pub mod handlers;
pub mod keepalive;
pub mod request;
pub mod transport;

pub use calls::{CallEngine, CallEngineDeps, CallError, CallSignalHandler, CallState};
pub use client::{ConnectionState, SignalingClient};
pub use config::ClientConfig;
pub use types::call::{CallId, CallType, EndCallReason, UserId};
pub use types::events::EventBus;
