use crate::client::{ConnectionState, SignalingClient};
use crate::transport::Transport;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use thiserror::Error;
use tokio::time::timeout;

/// One JSON text frame on the signaling websocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    /// Client to hub method call.
    #[serde(rename_all = "camelCase")]
    Invocation {
        invocation_id: String,
        target: String,
        arguments: Value,
    },
    /// Hub acknowledgement of an invocation. `error` is set on rejection.
    #[serde(rename_all = "camelCase")]
    Completion {
        invocation_id: String,
        #[serde(default)]
        error: Option<String>,
    },
    /// Hub push event.
    Event {
        target: String,
        #[serde(default)]
        arguments: Value,
    },
    Ping,
}

/// Custom error types for signaling requests.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling request timed out")]
    Timeout,
    #[error("signaling client is not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection lost before {0} was acknowledged")]
    Disconnected(String),
    #[error("hub rejected {method}: {message}")]
    ServerError { method: String, message: String },
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SignalingError {
    /// Failures where the message never left this client.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Transport(_))
    }
}

impl SignalingClient {
    /// Generates a new unique invocation ID.
    pub fn generate_invocation_id(&self) -> String {
        self.id_counter.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Invokes `method` on the hub and waits for its completion.
    ///
    /// While disconnected this waits (bounded) for the in-flight connect
    /// attempt. A send that fails because the connection was not ready is
    /// retried once after the connection comes back.
    pub async fn send(&self, method: &str, payload: Value) -> Result<(), SignalingError> {
        if !self.is_connected() {
            self.wait_until_connected().await?;
        }
        match self.invoke(method, &payload).await {
            Err(e) if e.is_retryable() => {
                warn!(target: "Signaling/Request", "{method} failed ({e}), retrying once");
                self.wait_until_connected().await?;
                self.invoke(method, &payload).await
            }
            result => result,
        }
    }

    async fn wait_until_connected(&self) -> Result<(), SignalingError> {
        let mut state = self.connection_state.subscribe();
        match timeout(
            self.config.connect_wait(),
            state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            _ => Err(SignalingError::NotConnected),
        }
    }

    async fn invoke(&self, method: &str, payload: &Value) -> Result<(), SignalingError> {
        let transport = self
            .transport
            .lock()
            .await
            .clone()
            .ok_or(SignalingError::NotConnected)?;

        let invocation_id = self.generate_invocation_id();
        let text = serde_json::to_string(&Frame::Invocation {
            invocation_id: invocation_id.clone(),
            target: method.to_string(),
            arguments: payload.clone(),
        })?;

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.response_waiters.insert(invocation_id.clone(), tx);

        debug!(target: "Signaling/Request", "--> {method} ({invocation_id})");
        if let Err(e) = transport.send_text(&text).await {
            self.response_waiters.remove(&invocation_id);
            self.mark_transport_broken(&transport).await;
            return Err(SignalingError::Transport(e.to_string()));
        }

        match timeout(self.config.request_timeout(), rx).await {
            Ok(Ok(None)) => Ok(()),
            Ok(Ok(Some(message))) => Err(SignalingError::ServerError {
                method: method.to_string(),
                message,
            }),
            Ok(Err(_)) => Err(SignalingError::Disconnected(method.to_string())),
            Err(_) => {
                self.response_waiters.remove(&invocation_id);
                Err(SignalingError::Timeout)
            }
        }
    }

    /// Handles a completion frame by forwarding it to the waiting invocation.
    pub(crate) fn handle_completion(&self, invocation_id: &str, error: Option<String>) -> bool {
        match self.response_waiters.remove(invocation_id) {
            Some((_, waiter)) => {
                if waiter.send(error).is_err() {
                    warn!(target: "Signaling/Request", "Waiter for invocation {invocation_id} was dropped.");
                }
                true
            }
            None => false,
        }
    }

    /// Drops a transport whose writes fail so the run loop reconnects.
    pub(crate) async fn mark_transport_broken(&self, failed: &Arc<dyn Transport>) {
        let is_current = self
            .transport
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| Arc::ptr_eq(t, failed));
        if is_current {
            self.connection_state
                .send_replace(ConnectionState::Disconnected);
            failed.disconnect().await;
        }
    }
}
