use crate::client::SignalingClient;
use crate::request::Frame;
use crate::transport::Transport;
use log::{debug, warn};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

impl SignalingClient {
    fn next_keepalive_interval(&self) -> Duration {
        let min = self.config.keepalive_min_secs.saturating_mul(1000);
        let max = self.config.keepalive_max_secs.saturating_mul(1000).max(min);
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    /// Pings the hub at a randomized interval for as long as `transport` is
    /// the live connection. A failed write tears the connection down so the
    /// run loop reconnects.
    pub(crate) async fn keepalive_loop(self: Arc<Self>, transport: Arc<dyn Transport>) {
        let ping = match serde_json::to_string(&Frame::Ping) {
            Ok(ping) => ping,
            Err(e) => {
                warn!(target: "Signaling/Keepalive", "Failed to encode ping: {e}");
                return;
            }
        };

        loop {
            let interval = self.next_keepalive_interval();

            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let is_current = self
                        .transport
                        .lock()
                        .await
                        .as_ref()
                        .is_some_and(|t| Arc::ptr_eq(t, &transport));
                    if !is_current {
                        debug!(target: "Signaling/Keepalive", "Connection replaced, exiting keepalive loop.");
                        return;
                    }

                    if let Err(e) = transport.send_text(&ping).await {
                        warn!(target: "Signaling/Keepalive", "Keepalive ping failed: {e}. Forcing reconnect.");
                        self.mark_transport_broken(&transport).await;
                        return;
                    }
                    debug!(target: "Signaling/Keepalive", "Sent keepalive ping");
                },
                _ = self.shutdown_notifier.notified() => {
                    debug!(target: "Signaling/Keepalive", "Shutdown signaled, exiting keepalive loop.");
                    return;
                }
            }
        }
    }
}
