use crate::config::SignalingConfig;
use crate::handlers::router::EventRouter;
use crate::handlers::traits::{EventHandler, FnEventHandler};
use crate::request::{Frame, SignalingError};
use crate::transport::{Transport, TransportEvent, TransportFactory};
use crate::calls::{SignalingChannel, SignalingCommand};
use crate::types::events::{self, ConnectionFailed, EventBus, Reconnecting};
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, error, info, trace, warn};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, RwLock, mpsc, oneshot, watch};
use tokio::time::sleep;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is already connected")]
    AlreadyConnected,
    #[error("client is already connecting")]
    AlreadyConnecting,
    #[error("client is not connected")]
    NotConnected,
}

/// Connection lifecycle of the signaling websocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Persistent connection to the signaling hub.
///
/// `run` keeps the websocket alive with bounded exponential-backoff
/// reconnects. Outbound invocations go through [`SignalingClient::send`];
/// push events are routed sequentially, in arrival order, to the handlers
/// registered with [`SignalingClient::register_handler`].
pub struct SignalingClient {
    pub(crate) config: SignalingConfig,
    transport_factory: Arc<dyn TransportFactory>,
    pub(crate) transport: Mutex<Option<Arc<dyn Transport>>>,
    transport_events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    pub(crate) connection_state: watch::Sender<ConnectionState>,

    is_connecting: AtomicBool,
    is_running: AtomicBool,
    expected_disconnect: AtomicBool,
    pub(crate) shutdown_notifier: Notify,
    reconnect_errors: AtomicU32,

    pub(crate) id_counter: AtomicU64,
    pub(crate) response_waiters: DashMap<String, oneshot::Sender<Option<String>>>,

    router: RwLock<EventRouter>,
    event_bus: Arc<EventBus>,
}

impl SignalingClient {
    pub fn new(
        config: SignalingConfig,
        transport_factory: Arc<dyn TransportFactory>,
        event_bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            transport_factory,
            transport: Mutex::new(None),
            transport_events: Mutex::new(None),
            connection_state: watch::Sender::new(ConnectionState::Disconnected),
            is_connecting: AtomicBool::new(false),
            is_running: AtomicBool::new(false),
            expected_disconnect: AtomicBool::new(false),
            shutdown_notifier: Notify::new(),
            reconnect_errors: AtomicU32::new(0),
            id_counter: AtomicU64::new(1),
            response_waiters: DashMap::new(),
            router: RwLock::new(EventRouter::new()),
            event_bus,
        })
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn is_connected(&self) -> bool {
        *self.connection_state.borrow() == ConnectionState::Connected
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection_state.subscribe()
    }

    /// Subscribes `handler` to every event name it declares.
    pub async fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        self.router.write().await.register(handler);
    }

    /// Subscribes a closure to a single push event.
    pub async fn on_event<F>(&self, event: &'static str, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register_handler(Arc::new(FnEventHandler::new(event, callback)))
            .await;
    }

    pub async fn run(self: &Arc<Self>) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!("Signaling client `run` called while already running.");
            return;
        }
        while self.is_running.load(Ordering::Relaxed) {
            self.expected_disconnect.store(false, Ordering::Relaxed);

            match self.connect().await {
                Err(e) => error!("Failed to connect to signaling hub: {e}"),
                Ok(()) => {
                    if let Err(e) = self.read_messages_loop().await {
                        warn!("Message loop exited with an error: {e}");
                    } else if self.expected_disconnect.load(Ordering::Relaxed) {
                        debug!("Message loop exited gracefully (expected disconnect).");
                    } else {
                        info!("Message loop exited gracefully.");
                    }
                    self.cleanup_connection_state().await;
                }
            }

            if !self.is_running.load(Ordering::Relaxed) {
                break;
            }

            let attempt = self.reconnect_errors.fetch_add(1, Ordering::SeqCst) + 1;
            let max_attempts = self.config.max_reconnect_attempts;
            if max_attempts > 0 && attempt > max_attempts {
                error!("Giving up on the signaling hub after {max_attempts} reconnect attempts.");
                events::emit(
                    &self.event_bus.connection_failed,
                    ConnectionFailed {
                        attempts: max_attempts,
                    },
                );
                self.is_running.store(false, Ordering::Relaxed);
                break;
            }

            let delay = self.config.reconnect_delay(attempt);
            info!("Will attempt to reconnect in {delay:?} (attempt {attempt})");
            events::emit(
                &self.event_bus.reconnecting,
                Reconnecting { attempt, delay },
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown_notifier.notified() => {}
            }
        }
        self.connection_state
            .send_replace(ConnectionState::Disconnected);
        info!("Signaling client run loop has shut down.");
    }

    pub async fn connect(self: &Arc<Self>) -> Result<(), anyhow::Error> {
        if self.is_connecting.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyConnecting.into());
        }

        let _guard = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::Relaxed);
        });

        if self.is_connected() {
            return Err(ClientError::AlreadyConnected.into());
        }

        self.connection_state
            .send_replace(ConnectionState::Connecting);

        let (transport, transport_events) = match self
            .transport_factory
            .create_transport(&self.config.endpoint())
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                self.connection_state
                    .send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        *self.transport.lock().await = Some(transport.clone());
        *self.transport_events.lock().await = Some(transport_events);
        self.reconnect_errors.store(0, Ordering::Relaxed);
        self.connection_state
            .send_replace(ConnectionState::Connected);
        info!("Connected to signaling hub.");
        events::emit(&self.event_bus.connected, events::Connected);

        tokio::spawn(self.clone().keepalive_loop(transport));
        Ok(())
    }

    pub async fn disconnect(&self) {
        info!("Disconnecting signaling client intentionally.");
        self.expected_disconnect.store(true, Ordering::Relaxed);
        self.is_running.store(false, Ordering::Relaxed);
        self.shutdown_notifier.notify_waiters();

        let transport = self.transport.lock().await.clone();
        if let Some(transport) = transport {
            transport.disconnect().await;
        }
        self.cleanup_connection_state().await;
    }

    async fn cleanup_connection_state(&self) {
        *self.transport.lock().await = None;
        *self.transport_events.lock().await = None;
        self.connection_state
            .send_replace(ConnectionState::Disconnected);
        // Dropping the senders fails every in-flight invocation.
        self.response_waiters.clear();
    }

    async fn read_messages_loop(self: &Arc<Self>) -> Result<(), anyhow::Error> {
        info!(target: "Signaling", "Starting message processing loop...");

        let mut transport_events = self
            .transport_events
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("Cannot start message loop: not connected"))?;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_notifier.notified() => {
                    info!(target: "Signaling", "Shutdown signaled in message loop. Exiting message loop.");
                    return Ok(());
                },
                event = transport_events.recv() => match event {
                    Some(TransportEvent::MessageReceived(text)) => self.handle_frame(&text).await,
                    Some(TransportEvent::Connected) => {
                        trace!(target: "Signaling", "Transport reported connected.");
                    }
                    Some(TransportEvent::Disconnected) | None => {
                        if self.expected_disconnect.load(Ordering::Relaxed) {
                            return Ok(());
                        }
                        info!("Transport disconnected unexpectedly.");
                        events::emit(&self.event_bus.disconnected, events::Disconnected);
                        return Err(anyhow::anyhow!("transport disconnected"));
                    }
                },
            }
        }
    }

    /// Decodes one inbound text frame and acts on it.
    pub(crate) async fn handle_frame(&self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "Signaling/Recv", "Dropping malformed frame: {e}");
                return;
            }
        };

        match frame {
            Frame::Completion {
                invocation_id,
                error,
            } => {
                if !self.handle_completion(&invocation_id, error) {
                    debug!(target: "Signaling/Recv", "Completion for unknown invocation {invocation_id}");
                }
            }
            Frame::Event { target, arguments } => {
                debug!(target: "Signaling/Recv", "<-- {target}");
                if !self.router.read().await.dispatch(&target, &arguments).await {
                    warn!(target: "Signaling/Recv", "Unhandled event: {target}");
                }
            }
            Frame::Ping => trace!(target: "Signaling/Recv", "Ping from hub"),
            Frame::Invocation { target, .. } => {
                warn!(target: "Signaling/Recv", "Ignoring hub invocation of {target}");
            }
        }
    }
}

#[async_trait]
impl SignalingChannel for SignalingClient {
    async fn send_command(&self, command: SignalingCommand) -> Result<(), SignalingError> {
        let payload = command.payload()?;
        self.send(command.method_name(), payload).await
    }
}
