#![allow(dead_code)]

use async_trait::async_trait;
use peercall::calls::media::SyntheticMediaDevices;
use peercall::calls::{
    CallEngine, CallEngineDeps, CallSignal, CallSnapshot, IceCandidate, LocalStream,
    MediaDevices, MediaError, NoopRingtone, PeerConnection, PeerConnectionFactory, PeerEvent,
    PeerEventReceiver, RemoteTrack, SessionDescription, SignalingChannel, SignalingCommand,
    StaticIdentity, TrackKind,
};
use peercall::config::{CallEngineConfig, IceServerConfig};
use peercall::request::SignalingError;
use peercall::{CallId, CallState, CallType, EventBus, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// In-memory stand-in for the signaling hub: routes each command to the
/// other party of its call as the matching push event.
#[derive(Default)]
pub struct Hub {
    engines: Mutex<HashMap<UserId, CallEngine>>,
    calls: Mutex<HashMap<CallId, (UserId, UserId)>>,
    log: Mutex<Vec<(UserId, SignalingCommand)>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn join(self: &Arc<Self>, user: &str) -> Party {
        let devices = Arc::new(RecordingDevices::default());
        let peers = Arc::new(MockPeerFactory::new(user));
        let config = CallEngineConfig {
            ice_servers: Vec::new(),
            ..CallEngineConfig::default()
        };
        let engine = CallEngine::spawn(
            config,
            CallEngineDeps {
                signaling: Arc::new(HubChannel {
                    user: user.to_string(),
                    hub: self.clone(),
                }),
                media_devices: devices.clone(),
                peer_factory: peers.clone(),
                identity: Arc::new(StaticIdentity::new(user)),
                ringtone: Arc::new(NoopRingtone),
                event_bus: Arc::new(EventBus::new()),
            },
        );
        self.engines
            .lock()
            .unwrap()
            .insert(user.to_string(), engine.clone());
        Party {
            user: user.to_string(),
            engine,
            devices,
            peers,
        }
    }

    /// Commands sent by `user`, in order.
    pub fn sent_by(&self, user: &str) -> Vec<SignalingCommand> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(from, _)| from == user)
            .map(|(_, command)| command.clone())
            .collect()
    }

    /// Method names sent by `user`, without candidate trickling.
    pub fn methods_by(&self, user: &str) -> Vec<&'static str> {
        self.sent_by(user)
            .iter()
            .map(SignalingCommand::method_name)
            .filter(|m| *m != "SendIceCandidate")
            .collect()
    }

    pub fn deliver(&self, user: &str, signal: CallSignal) {
        let engine = self.engines.lock().unwrap().get(user).cloned();
        if let Some(engine) = engine {
            engine.deliver_signal(signal);
        }
    }

    fn other_party(&self, call_id: &CallId, me: &str) -> Option<UserId> {
        let calls = self.calls.lock().unwrap();
        let (initiator, target) = calls.get(call_id)?;
        Some(if initiator == me {
            target.clone()
        } else {
            initiator.clone()
        })
    }

    fn route(&self, from: &str, command: SignalingCommand) {
        self.log
            .lock()
            .unwrap()
            .push((from.to_string(), command.clone()));

        match command {
            SignalingCommand::InitiateCall {
                call_id,
                initiator,
                call_type,
                target_user,
            } => {
                self.calls
                    .lock()
                    .unwrap()
                    .insert(call_id.clone(), (initiator.clone(), target_user.clone()));
                self.deliver(
                    &target_user.clone(),
                    CallSignal::IncomingCall {
                        call_id,
                        initiator,
                        call_type,
                        target_user,
                    },
                );
            }
            SignalingCommand::SendOffer {
                call_id,
                peer_id,
                offer,
            } => self.deliver(&peer_id, CallSignal::ReceiveOffer { call_id, offer }),
            SignalingCommand::SendAnswer {
                call_id,
                peer_id,
                answer,
                ..
            } => self.deliver(&peer_id, CallSignal::ReceiveAnswer { call_id, answer }),
            SignalingCommand::SendIceCandidate { call_id, candidate } => {
                if let Some(peer) = self.other_party(&call_id, from) {
                    self.deliver(&peer, CallSignal::ReceiveIceCandidate { call_id, candidate });
                }
            }
            SignalingCommand::AcceptCall {
                call_id, accepter, ..
            } => {
                if let Some(peer) = self.other_party(&call_id, from) {
                    self.deliver(&peer, CallSignal::CallAccepted { call_id, accepter });
                }
            }
            SignalingCommand::DeclineCall {
                call_id,
                decliner_id,
                is_busy,
            } => {
                if let Some(peer) = self.other_party(&call_id, from) {
                    self.deliver(
                        &peer,
                        CallSignal::CallDeclined {
                            call_id,
                            decliner_id,
                            is_busy,
                        },
                    );
                }
            }
            SignalingCommand::EndCall { call_id, ender_id } => {
                if let Some(peer) = self.other_party(&call_id, from) {
                    self.deliver(&peer, CallSignal::CallEnded { call_id, ender_id });
                }
            }
        }
    }
}

struct HubChannel {
    user: UserId,
    hub: Arc<Hub>,
}

#[async_trait]
impl SignalingChannel for HubChannel {
    async fn send_command(&self, command: SignalingCommand) -> Result<(), SignalingError> {
        self.hub.route(&self.user, command);
        Ok(())
    }
}

/// One participant wired to the hub.
pub struct Party {
    pub user: UserId,
    pub engine: CallEngine,
    pub devices: Arc<RecordingDevices>,
    pub peers: Arc<MockPeerFactory>,
}

impl Party {
    pub fn snapshot(&self) -> CallSnapshot {
        self.engine.snapshot()
    }

    pub async fn wait_for_state(&self, state: CallState) {
        let mut rx = self.engine.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.state == state))
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "{} never reached {state:?}, stuck in {:?}",
                    self.user,
                    self.engine.snapshot().state
                )
            })
            .unwrap();
    }

    pub fn peer(&self) -> Arc<MockPeer> {
        self.peers.last().expect("no peer connection created")
    }
}

/// Places a call from `caller` to `callee` and waits until both are `Ongoing`.
pub async fn connect_call(caller: &Party, callee: &Party, call_type: CallType) -> CallId {
    let call_id = caller
        .engine
        .initiate_call(callee.user.clone(), call_type)
        .await
        .expect("initiate");
    callee.wait_for_state(CallState::ReceivingIncoming).await;
    callee.engine.answer_call().await.expect("answer");
    caller.wait_for_state(CallState::Ongoing).await;
    callee.wait_for_state(CallState::Ongoing).await;
    call_id
}

/// Polls `condition` until it holds or a few seconds pass.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}

/// Synthetic capture that remembers every stream it handed out.
#[derive(Default)]
pub struct RecordingDevices {
    inner: SyntheticMediaDevices,
    streams: Mutex<Vec<LocalStream>>,
    deny: AtomicBool,
}

impl RecordingDevices {
    pub fn deny_access(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    pub fn streams(&self) -> Vec<LocalStream> {
        self.streams.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaDevices for RecordingDevices {
    async fn acquire(&self, call_type: CallType) -> Result<LocalStream, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied(
                "microphone access denied".to_string(),
            ));
        }
        let stream = self.inner.acquire(call_type).await?;
        self.streams.lock().unwrap().push(stream.clone());
        Ok(stream)
    }
}

/// Peer connection double that records every operation in order.
pub struct MockPeer {
    label: String,
    ops: Mutex<Vec<String>>,
    events: mpsc::UnboundedSender<PeerEvent>,
    closed: AtomicBool,
    fail_negotiation: bool,
}

impl MockPeer {
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn candidate(&self) -> String {
        format!("candidate:1 1 UDP 2130706431 10.0.0.1 5000 typ host ufrag {}", self.label)
    }

    fn record(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }

    fn gather(&self) {
        self.emit(PeerEvent::LocalCandidate(
            IceCandidate::new(self.candidate())
                .with_sdp_mid("0")
                .with_sdp_m_line_index(0),
        ));
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), MediaError> {
        self.record(format!("add_local_stream:{}", stream.tracks().len()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.record("create_offer".to_string());
        if self.fail_negotiation {
            return Err(MediaError::Negotiation("no common codec".to_string()));
        }
        self.gather();
        Ok(SessionDescription::offer(format!("v=0 offer from {}", self.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.record("create_answer".to_string());
        if self.fail_negotiation {
            return Err(MediaError::Negotiation("no common codec".to_string()));
        }
        self.gather();
        Ok(SessionDescription::answer(format!("v=0 answer from {}", self.label)))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.record(format!("set_remote:{}", description.sdp));
        self.emit(PeerEvent::RemoteTrack(RemoteTrack {
            id: format!("audio-of-{}", description.sdp),
            stream_id: "remote-stream".to_string(),
            kind: TrackKind::Audio,
        }));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.record(format!("add_candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.record("close".to_string());
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockPeerFactory {
    label: String,
    peers: Mutex<Vec<Arc<MockPeer>>>,
    fail_negotiation: AtomicBool,
}

impl MockPeerFactory {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            peers: Mutex::new(Vec::new()),
            fail_negotiation: AtomicBool::new(false),
        }
    }

    /// Peer connections created from now on fail to produce offers and answers.
    pub fn fail_negotiation(&self) {
        self.fail_negotiation.store(true, Ordering::SeqCst);
    }

    pub fn last(&self) -> Option<Arc<MockPeer>> {
        self.peers.lock().unwrap().last().cloned()
    }

    pub fn count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServerConfig],
    ) -> Result<(Arc<dyn PeerConnection>, PeerEventReceiver), MediaError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(MockPeer {
            label: self.label.clone(),
            ops: Mutex::new(Vec::new()),
            events: tx,
            closed: AtomicBool::new(false),
            fail_negotiation: self.fail_negotiation.load(Ordering::SeqCst),
        });
        self.peers.lock().unwrap().push(peer.clone());
        Ok((peer, rx))
    }
}
