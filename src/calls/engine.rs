//! The call session engine.
//!
//! All session mutations happen on one actor task that drains a single input
//! queue: user commands, inbound signals, peer connection events, results of
//! suspending media work and timer expiries. Suspending work runs on spawned
//! tasks which post their result back tagged with the session generation it
//! was started under; the actor drops anything from an older generation.
//!
//! Outbound signaling goes through one ordered queue drained by a single
//! sender task, so the remote peer sees commands in the order they were issued.
//! Peer connection operations of a session are serialized the same way, which
//! keeps buffered candidates behind the remote description they depend on.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::error::{CallError, MediaError};
use super::media::{
    LocalStream, MediaDevices, PeerConnection, PeerConnectionFactory, PeerEvent,
    PeerEventReceiver, TrackKind,
};
use super::signaling::{CallSignal, SignalingChannel, SignalingCommand};
use super::state::{CallSession, CallSnapshot, CallState, CallTransition, SessionMedia};
use super::timer::{CallTimers, TimerFired, TimerKind, TimerNotify};
use super::transport::{IceCandidate, SdpType, SessionDescription};
use crate::config::{CallEngineConfig, IceServerConfig};
use crate::request::SignalingError;
use crate::types::call::{CallId, CallType, EndCallReason, UserId};
use crate::types::events::{
    self, CallFinished, CallStateChanged, EventBus, IncomingCall, RemoteTrackAdded,
};

/// Resolves the authenticated local user.
pub trait IdentityProvider: Send + Sync {
    fn local_user(&self) -> Option<UserId>;
}

/// A fixed identity, for clients that authenticate once at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    user: Option<UserId>,
}

impl StaticIdentity {
    pub fn new(user: impl Into<UserId>) -> Self {
        Self {
            user: Some(user.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self { user: None }
    }
}

impl IdentityProvider for StaticIdentity {
    fn local_user(&self) -> Option<UserId> {
        self.user.clone()
    }
}

/// The ringing cue for incoming calls.
pub trait RingtonePlayer: Send + Sync {
    fn start_ringing(&self);
    fn stop_ringing(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRingtone;

impl RingtonePlayer for NoopRingtone {
    fn start_ringing(&self) {
        debug!(target: "Call/Ringtone", "Ringing");
    }

    fn stop_ringing(&self) {
        debug!(target: "Call/Ringtone", "Ringing stopped");
    }
}

/// External collaborators of the engine.
pub struct CallEngineDeps {
    pub signaling: Arc<dyn SignalingChannel>,
    pub media_devices: Arc<dyn MediaDevices>,
    pub peer_factory: Arc<dyn PeerConnectionFactory>,
    pub identity: Arc<dyn IdentityProvider>,
    pub ringtone: Arc<dyn RingtonePlayer>,
    pub event_bus: Arc<EventBus>,
}

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum Command {
    Initiate {
        target_user: UserId,
        call_type: CallType,
        reply: Reply<CallId>,
    },
    Answer {
        reply: Reply<()>,
    },
    Decline {
        reply: Reply<()>,
    },
    End {
        reply: Reply<()>,
    },
    ToggleMute {
        kind: TrackKind,
        reply: Reply<bool>,
    },
    LocalStream {
        reply: oneshot::Sender<Option<LocalStream>>,
    },
}

struct PreparedMedia {
    media: SessionMedia,
    events: PeerEventReceiver,
}

enum PeerOp {
    SetRemoteDescription(SessionDescription),
    CreateOffer,
    CreateAnswer,
    AddCandidate(IceCandidate),
}

enum PeerOpDone {
    RemoteDescriptionSet(SdpType),
    OfferCreated(SessionDescription),
    AnswerCreated(SessionDescription),
}

enum EngineInput {
    Command(Command),
    Signal(CallSignal),
    MediaReady {
        generation: u64,
        result: Result<PreparedMedia, MediaError>,
    },
    Peer {
        generation: u64,
        event: PeerEvent,
    },
    PeerOp {
        generation: u64,
        result: Result<PeerOpDone, MediaError>,
    },
    Timer(TimerFired),
    SendFailed {
        generation: u64,
        command: SignalingCommand,
        error: SignalingError,
    },
    Shutdown,
}

struct Outbound {
    generation: u64,
    command: SignalingCommand,
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct CallEngine {
    inbox: mpsc::UnboundedSender<EngineInput>,
    snapshot: watch::Receiver<CallSnapshot>,
    event_bus: Arc<EventBus>,
}

impl CallEngine {
    /// Starts the engine on the current tokio runtime.
    pub fn spawn(config: CallEngineConfig, deps: CallEngineDeps) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::default());
        let weak_inbox = inbox_tx.downgrade();

        tokio::spawn(outbound_loop(
            deps.signaling.clone(),
            outbound_rx,
            weak_inbox.clone(),
        ));

        let timer_inbox = weak_inbox.clone();
        let notify: TimerNotify = Arc::new(move |fired| {
            post(&timer_inbox, EngineInput::Timer(fired));
        });

        let event_bus = deps.event_bus.clone();
        let actor = EngineActor {
            config,
            deps,
            session: CallSession::new(),
            timers: CallTimers::new(notify),
            inbox: weak_inbox,
            outbound: outbound_tx,
            snapshot_tx,
            published_state: CallState::Idle,
            published_call_id: None,
            pending_setup: None,
            peer_link: None,
            ringing: false,
        };
        tokio::spawn(actor.run(inbox_rx));

        Self {
            inbox: inbox_tx,
            snapshot: snapshot_rx,
            event_bus,
        }
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(EngineInput::Command(build(tx)))
            .map_err(|_| CallError::EngineStopped)?;
        rx.await.map_err(|_| CallError::EngineStopped)?
    }

    /// Calls `target_user`. Resolves once local media is ready and the call
    /// has been announced.
    pub async fn initiate_call(
        &self,
        target_user: impl Into<UserId>,
        call_type: CallType,
    ) -> Result<CallId, CallError> {
        let target_user = target_user.into();
        self.request(|reply| Command::Initiate {
            target_user,
            call_type,
            reply,
        })
        .await
    }

    /// Accepts the ringing incoming call.
    pub async fn answer_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Answer { reply }).await
    }

    /// Rejects a ringing call or cancels an outgoing one.
    pub async fn decline_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Decline { reply }).await
    }

    /// Hangs up, or cancels an unanswered call.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::End { reply }).await
    }

    /// Returns whether audio is now muted.
    pub async fn toggle_audio_mute(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleMute {
            kind: TrackKind::Audio,
            reply,
        })
        .await
    }

    /// Returns whether video is now muted.
    pub async fn toggle_video_mute(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleMute {
            kind: TrackKind::Video,
            reply,
        })
        .await
    }

    /// The captured stream of the current call, if any.
    pub async fn local_stream(&self) -> Option<LocalStream> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(EngineInput::Command(Command::LocalStream { reply }))
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Feeds an inbound signal. Signals are processed in delivery order.
    pub fn deliver_signal(&self, signal: CallSignal) {
        if self.inbox.send(EngineInput::Signal(signal)).is_err() {
            debug!(target: "Call/Engine", "Engine stopped, dropping signal");
        }
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    /// A receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Hangs up any live call and stops the actor.
    pub fn shutdown(&self) {
        let _ = self.inbox.send(EngineInput::Shutdown);
    }
}

fn post(inbox: &mpsc::WeakUnboundedSender<EngineInput>, input: EngineInput) -> bool {
    match inbox.upgrade() {
        Some(tx) => tx.send(input).is_ok(),
        None => false,
    }
}

/// Stops capture now and closes the connection in the background.
fn release_media(media: SessionMedia) {
    media.local_stream.stop();
    let pc = media.peer_connection;
    tokio::spawn(async move {
        if let Err(e) = pc.close().await {
            warn!(target: "Call/Engine", "Failed to close peer connection: {e}");
        }
    });
}

async fn outbound_loop(
    signaling: Arc<dyn SignalingChannel>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    inbox: mpsc::WeakUnboundedSender<EngineInput>,
) {
    while let Some(Outbound {
        generation,
        command,
    }) = queue.recv().await
    {
        debug!(target: "Call/Outbound", "--> {} for {}", command.method_name(), command.call_id());
        if let Err(error) = signaling.send_command(command.clone()).await {
            warn!(
                target: "Call/Outbound",
                "Failed to send {} for {}: {error}",
                command.method_name(),
                command.call_id()
            );
            post(
                &inbox,
                EngineInput::SendFailed {
                    generation,
                    command,
                    error,
                },
            );
        }
    }
    debug!(target: "Call/Outbound", "Outbound queue closed");
}

async fn prepare_media(
    devices: Arc<dyn MediaDevices>,
    factory: Arc<dyn PeerConnectionFactory>,
    call_type: CallType,
    ice_servers: Vec<IceServerConfig>,
) -> Result<PreparedMedia, MediaError> {
    let local_stream = devices.acquire(call_type).await?;
    let (peer_connection, events) = match factory.create(&ice_servers).await {
        Ok(created) => created,
        Err(e) => {
            local_stream.stop();
            return Err(e);
        }
    };
    let media = SessionMedia {
        local_stream,
        peer_connection,
    };
    if let Err(e) = media.peer_connection.add_local_stream(&media.local_stream).await {
        release_media(media);
        return Err(e);
    }
    Ok(PreparedMedia { media, events })
}

async fn forward_peer_events(
    mut events: PeerEventReceiver,
    generation: u64,
    inbox: mpsc::WeakUnboundedSender<EngineInput>,
) {
    while let Some(event) = events.recv().await {
        if !post(&inbox, EngineInput::Peer { generation, event }) {
            break;
        }
    }
}

/// Runs one session's peer connection operations in order. Stops after the
/// first failure; the session is torn down at that point anyway.
async fn peer_op_worker(
    pc: Arc<dyn PeerConnection>,
    mut ops: mpsc::UnboundedReceiver<PeerOp>,
    generation: u64,
    inbox: mpsc::WeakUnboundedSender<EngineInput>,
) {
    while let Some(op) = ops.recv().await {
        let result = match op {
            PeerOp::AddCandidate(candidate) => {
                if let Err(e) = pc.add_ice_candidate(candidate).await {
                    warn!(target: "Call/Engine", "Failed to apply remote candidate: {e}");
                }
                continue;
            }
            PeerOp::SetRemoteDescription(description) => {
                let sdp_type = description.sdp_type;
                pc.set_remote_description(description)
                    .await
                    .map(|_| PeerOpDone::RemoteDescriptionSet(sdp_type))
            }
            PeerOp::CreateOffer => pc.create_offer().await.map(PeerOpDone::OfferCreated),
            PeerOp::CreateAnswer => pc.create_answer().await.map(PeerOpDone::AnswerCreated),
        };
        let failed = result.is_err();
        if !post(&inbox, EngineInput::PeerOp { generation, result }) || failed {
            break;
        }
    }
}

/// A reply held until local media is ready.
enum PendingSetup {
    Initiate(Reply<CallId>),
    Answer(Reply<()>),
}

impl PendingSetup {
    fn fail(self, error: CallError) {
        match self {
            Self::Initiate(reply) => {
                let _ = reply.send(Err(error));
            }
            Self::Answer(reply) => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

/// Tasks bound to the session's peer connection.
struct PeerLink {
    ops: mpsc::UnboundedSender<PeerOp>,
    worker: JoinHandle<()>,
    forwarder: JoinHandle<()>,
}

impl PeerLink {
    fn abort(self) {
        self.worker.abort();
        self.forwarder.abort();
    }
}

struct EngineActor {
    config: CallEngineConfig,
    deps: CallEngineDeps,
    session: CallSession,
    timers: CallTimers,
    inbox: mpsc::WeakUnboundedSender<EngineInput>,
    outbound: mpsc::UnboundedSender<Outbound>,
    snapshot_tx: watch::Sender<CallSnapshot>,
    published_state: CallState,
    published_call_id: Option<CallId>,
    pending_setup: Option<PendingSetup>,
    peer_link: Option<PeerLink>,
    ringing: bool,
}

impl EngineActor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<EngineInput>) {
        info!(target: "Call/Engine", "Call engine started");

        while let Some(input) = inbox.recv().await {
            match input {
                EngineInput::Command(command) => self.handle_command(command),
                EngineInput::Signal(signal) => self.handle_signal(signal),
                EngineInput::MediaReady { generation, result } => {
                    self.on_media_ready(generation, result)
                }
                EngineInput::Peer { generation, event } => self.on_peer_event(generation, event),
                EngineInput::PeerOp { generation, result } => self.on_peer_op(generation, result),
                EngineInput::Timer(fired) => self.on_timer(fired),
                EngineInput::SendFailed {
                    generation,
                    command,
                    error,
                } => self.on_send_failed(generation, command, error),
                EngineInput::Shutdown => break,
            }
        }

        if self.session.state.is_live() {
            self.hang_up();
        } else if self.session.state != CallState::Idle {
            self.reset();
        }
        info!(target: "Call/Engine", "Call engine stopped");
    }

    // ---- commands ----

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initiate {
                target_user,
                call_type,
                reply,
            } => self.initiate(target_user, call_type, reply),
            Command::Answer { reply } => self.answer(reply),
            Command::Decline { reply } => {
                let _ = reply.send(self.decline());
            }
            Command::End { reply } => {
                let _ = reply.send(self.end());
            }
            Command::ToggleMute { kind, reply } => {
                let _ = reply.send(self.toggle_mute(kind));
            }
            Command::LocalStream { reply } => {
                let stream = self.session.media.as_ref().map(|m| m.local_stream.clone());
                let _ = reply.send(stream);
            }
        }
    }

    fn initiate(&mut self, target_user: UserId, call_type: CallType, reply: Reply<CallId>) {
        if self.session.state != CallState::Idle {
            let _ = reply.send(Err(CallError::CallInProgress));
            return;
        }
        let Some(local_user) = self.deps.identity.local_user() else {
            let _ = reply.send(Err(CallError::NotAuthenticated));
            return;
        };
        let target_user = target_user.trim().to_string();
        if target_user.is_empty() {
            let _ = reply.send(Err(CallError::InvalidTarget("empty target".into())));
            return;
        }
        if target_user == local_user {
            let _ = reply.send(Err(CallError::InvalidTarget(
                "cannot call yourself".into(),
            )));
            return;
        }

        let call_id = CallId::generate();
        if let Err(e) =
            self.session
                .start_outgoing(call_id.clone(), local_user, target_user.clone(), call_type)
        {
            let _ = reply.send(Err(e.into()));
            return;
        }
        info!(target: "Call/Engine", "Starting {call_type} call {call_id} to {target_user}");

        self.timers
            .start_outgoing_timeout(self.session.generation, self.config.outgoing_timeout());
        self.pending_setup = Some(PendingSetup::Initiate(reply));
        self.spawn_media_setup();
        self.publish();
    }

    fn answer(&mut self, reply: Reply<()>) {
        match self.session.state {
            CallState::Idle => {
                let _ = reply.send(Err(CallError::NoActiveCall));
                return;
            }
            CallState::ReceivingIncoming
                if self.session.call_id.is_some() && self.session.initiator.is_some() => {}
            state => {
                let _ = reply.send(Err(CallError::InvalidState(format!(
                    "cannot answer in state {state:?}"
                ))));
                return;
            }
        }
        if let Err(e) = self.session.apply_transition(CallTransition::LocalAnswered) {
            let _ = reply.send(Err(e.into()));
            return;
        }
        info!(target: "Call/Engine", "Answering call {:?}", self.session.call_id);

        self.stop_ringing();
        self.pending_setup = Some(PendingSetup::Answer(reply));
        self.spawn_media_setup();
        self.publish();
    }

    /// Same as `end`: unanswered calls are declined, answered ones ended.
    fn decline(&mut self) -> Result<(), CallError> {
        self.end()
    }

    fn end(&mut self) -> Result<(), CallError> {
        match self.session.state {
            CallState::Idle => Err(CallError::NoActiveCall),
            state if state.is_terminal() => {
                self.reset();
                Ok(())
            }
            _ => {
                self.hang_up();
                Ok(())
            }
        }
    }

    /// Local teardown of a live call: decline if unanswered, end otherwise.
    fn hang_up(&mut self) {
        if self.session.state.is_unanswered() {
            self.send_decline(false);
            self.finish(EndCallReason::LocalDeclined);
        } else {
            self.end_answered_call();
            self.finish(EndCallReason::LocalEnded);
        }
    }

    fn toggle_mute(&mut self, kind: TrackKind) -> Result<bool, CallError> {
        let Some(media) = &self.session.media else {
            return Err(CallError::InvalidState("no local stream".into()));
        };
        let muted = match kind {
            TrackKind::Audio => !self.session.is_local_audio_muted,
            TrackKind::Video => !self.session.is_local_video_muted,
        };
        media.local_stream.set_enabled(kind, !muted);
        match kind {
            TrackKind::Audio => self.session.is_local_audio_muted = muted,
            TrackKind::Video => self.session.is_local_video_muted = muted,
        }
        debug!(target: "Call/Engine", "Local {kind} muted: {muted}");
        self.publish();
        Ok(muted)
    }

    // ---- inbound signals ----

    fn handle_signal(&mut self, signal: CallSignal) {
        debug!(
            target: "Call/Engine",
            "<-- {} for {:?} in {:?}",
            signal.event_name(),
            signal.call_id(),
            self.session.state
        );

        match signal {
            CallSignal::IncomingCall {
                call_id,
                initiator,
                call_type,
                ..
            } => self.on_incoming_call(call_id, initiator, call_type),
            CallSignal::CallAccepted { call_id, accepter } => {
                self.on_call_accepted(call_id, accepter)
            }
            CallSignal::ReceiveOffer { call_id, offer } => self.on_remote_offer(call_id, offer),
            CallSignal::ReceiveAnswer { call_id, answer } => {
                self.on_remote_answer(call_id, answer)
            }
            CallSignal::ReceiveIceCandidate { call_id, candidate } => {
                self.on_remote_candidate(call_id, candidate)
            }
            CallSignal::CallDeclined {
                call_id,
                decliner_id,
                is_busy,
            } => {
                if !self.is_live_call(&call_id) {
                    return;
                }
                if is_busy {
                    self.fail_session(format!("{decliner_id} is busy"));
                } else {
                    info!(target: "Call/Engine", "Call {call_id} declined by {decliner_id}");
                    self.finish(EndCallReason::RemoteDeclined);
                }
            }
            CallSignal::CallEnded { call_id, ender_id } => {
                if !self.is_live_call(&call_id) {
                    return;
                }
                info!(target: "Call/Engine", "Call {call_id} ended by {ender_id}");
                self.finish(EndCallReason::RemoteEnded);
            }
            CallSignal::UserBusy { call_id } => {
                let applies = self.session.state == CallState::InitiatingOutgoing
                    && call_id.as_ref().is_none_or(|id| self.session.is_current(id));
                if applies {
                    self.fail_session("User is busy".to_string());
                }
            }
            CallSignal::CallError { message, call_id } => {
                let applies = self.session.state.is_live()
                    && call_id.as_ref().is_none_or(|id| self.session.is_current(id));
                if applies {
                    self.fail_session(message);
                } else {
                    warn!(target: "Call/Engine", "Signaling error outside a call: {message}");
                }
            }
        }
    }

    fn is_live_call(&self, call_id: &CallId) -> bool {
        self.session.state.is_live() && self.session.is_current(call_id)
    }

    fn on_incoming_call(&mut self, call_id: CallId, initiator: UserId, call_type: CallType) {
        let Some(local_user) = self.deps.identity.local_user() else {
            warn!(target: "Call/Engine", "Ignoring incoming call {call_id}: not authenticated");
            return;
        };

        if self.session.state != CallState::Idle {
            if self.session.is_current(&call_id) {
                debug!(target: "Call/Engine", "Duplicate IncomingCall for {call_id}");
                return;
            }
            info!(target: "Call/Engine", "Busy, declining call {call_id} from {initiator}");
            self.send(SignalingCommand::DeclineCall {
                call_id,
                decliner_id: local_user,
                is_busy: true,
            });
            return;
        }

        if let Err(e) = self.session.start_incoming(
            call_id.clone(),
            initiator.clone(),
            local_user,
            call_type,
        ) {
            warn!(target: "Call/Engine", "Cannot accept incoming call {call_id}: {e}");
            return;
        }
        info!(target: "Call/Engine", "Incoming {call_type} call {call_id} from {initiator}");

        self.start_ringing();
        events::emit(
            &self.deps.event_bus.incoming_call,
            IncomingCall {
                call_id,
                initiator,
                call_type,
            },
        );
        self.publish();
    }

    fn on_call_accepted(&mut self, call_id: CallId, accepter: UserId) {
        if self.session.state != CallState::InitiatingOutgoing || !self.session.is_current(&call_id)
        {
            debug!(target: "Call/Engine", "Ignoring CallAccepted for {call_id}");
            return;
        }
        self.timers.cancel_outgoing_timeout();
        info!(target: "Call/Engine", "Call {call_id} accepted by {accepter}");

        self.session.receiver = Some(accepter.clone());
        self.session.target_user = Some(accepter);
        if let Err(e) = self.session.apply_transition(CallTransition::RemoteAccepted) {
            warn!(target: "Call/Engine", "{e}");
            return;
        }
        if !self.queue_peer_op(PeerOp::CreateOffer) {
            self.fail_session("Call accepted before local media was ready".to_string());
            return;
        }
        self.publish();
    }

    fn on_remote_offer(&mut self, call_id: CallId, offer: SessionDescription) {
        if !self.is_live_call(&call_id)
            || self.session.state != CallState::Negotiating
            || self.session.is_outgoing()
        {
            warn!(target: "Call/Engine", "Ignoring offer for {call_id} in {:?}", self.session.state);
            return;
        }
        if self.session.has_remote_description {
            warn!(target: "Call/Engine", "Ignoring repeated offer for {call_id}");
            return;
        }
        if self.peer_link.is_none() {
            self.fail_session("Offer received before local media was ready".to_string());
            return;
        }
        self.apply_remote_description(offer);
        self.queue_peer_op(PeerOp::CreateAnswer);
    }

    fn on_remote_answer(&mut self, call_id: CallId, answer: SessionDescription) {
        if !self.is_live_call(&call_id)
            || self.session.state != CallState::Negotiating
            || !self.session.is_outgoing()
        {
            warn!(target: "Call/Engine", "Ignoring answer for {call_id} in {:?}", self.session.state);
            return;
        }
        if self.session.has_remote_description {
            warn!(target: "Call/Engine", "Ignoring repeated answer for {call_id}");
            return;
        }
        self.apply_remote_description(answer);
    }

    /// Queues the description, then every candidate that arrived before it.
    fn apply_remote_description(&mut self, description: SessionDescription) {
        self.session.has_remote_description = true;
        self.queue_peer_op(PeerOp::SetRemoteDescription(description));

        let pending = std::mem::take(&mut self.session.pending_candidates);
        if !pending.is_empty() {
            debug!(target: "Call/Engine", "Flushing {} buffered candidates", pending.len());
        }
        for candidate in pending {
            self.queue_peer_op(PeerOp::AddCandidate(candidate));
        }
    }

    fn on_remote_candidate(&mut self, call_id: CallId, candidate: IceCandidate) {
        if !self.is_live_call(&call_id) {
            debug!(target: "Call/Engine", "Dropping candidate for {call_id}");
            return;
        }
        let ready = self.peer_link.is_some() && self.session.has_remote_description;
        if ready || (self.peer_link.is_some() && !self.config.buffer_early_candidates) {
            self.queue_peer_op(PeerOp::AddCandidate(candidate));
        } else {
            debug!(target: "Call/Engine", "Buffering early candidate for {call_id}");
            self.session.pending_candidates.push(candidate);
        }
    }

    // ---- async completions ----

    fn spawn_media_setup(&self) {
        let generation = self.session.generation;
        let call_type = self.session.call_type;
        let devices = self.deps.media_devices.clone();
        let factory = self.deps.peer_factory.clone();
        let ice_servers = self.config.ice_servers.clone();
        let inbox = self.inbox.clone();

        tokio::spawn(async move {
            let result = prepare_media(devices, factory, call_type, ice_servers).await;
            let Some(tx) = inbox.upgrade() else {
                if let Ok(prepared) = result {
                    release_media(prepared.media);
                }
                return;
            };
            if let Err(mpsc::error::SendError(EngineInput::MediaReady {
                result: Ok(prepared),
                ..
            })) = tx.send(EngineInput::MediaReady { generation, result })
            {
                release_media(prepared.media);
            }
        });
    }

    fn on_media_ready(&mut self, generation: u64, result: Result<PreparedMedia, MediaError>) {
        let expected = generation == self.session.generation
            && self.pending_setup.is_some()
            && self.session.media.is_none();
        if !expected {
            debug!(target: "Call/Engine", "Discarding media from generation {generation}");
            if let Ok(prepared) = result {
                release_media(prepared.media);
            }
            return;
        }
        let Some(pending) = self.pending_setup.take() else {
            return;
        };

        let prepared = match result {
            Ok(prepared) => prepared,
            Err(e) => {
                let message = format!("Media setup failed: {e}");
                if !self.session.is_outgoing() {
                    self.send_decline(false);
                }
                self.fail_session(message);
                pending.fail(CallError::Media(e));
                return;
            }
        };
        self.attach_media(prepared);
        self.publish();

        let (Some(call_id), Some(local_user)) =
            (self.session.call_id.clone(), self.session.local_user().cloned())
        else {
            pending.fail(CallError::Aborted);
            return;
        };
        match pending {
            PendingSetup::Initiate(reply) => {
                let Some(target_user) = self.session.target_user.clone() else {
                    let _ = reply.send(Err(CallError::Aborted));
                    return;
                };
                self.send(SignalingCommand::InitiateCall {
                    call_id: call_id.clone(),
                    initiator: local_user,
                    call_type: self.session.call_type,
                    target_user,
                });
                let _ = reply.send(Ok(call_id));
            }
            PendingSetup::Answer(reply) => {
                self.send(SignalingCommand::AcceptCall {
                    call_id,
                    accepter: local_user,
                    answer_sdp: None,
                });
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn attach_media(&mut self, prepared: PreparedMedia) {
        let generation = self.session.generation;
        let (ops, ops_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(peer_op_worker(
            prepared.media.peer_connection.clone(),
            ops_rx,
            generation,
            self.inbox.clone(),
        ));
        let forwarder = tokio::spawn(forward_peer_events(
            prepared.events,
            generation,
            self.inbox.clone(),
        ));

        self.session.media = Some(prepared.media);
        self.peer_link = Some(PeerLink {
            ops,
            worker,
            forwarder,
        });
    }

    fn queue_peer_op(&self, op: PeerOp) -> bool {
        match &self.peer_link {
            Some(link) => link.ops.send(op).is_ok(),
            None => false,
        }
    }

    fn on_peer_event(&mut self, generation: u64, event: PeerEvent) {
        if generation != self.session.generation {
            return;
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if !self.session.state.is_live() {
                    return;
                }
                if let Some(call_id) = self.session.call_id.clone() {
                    self.send(SignalingCommand::SendIceCandidate { call_id, candidate });
                }
            }
            PeerEvent::RemoteTrack(track) => {
                if self.session.add_remote_track(track.clone())
                    && let Some(call_id) = self.session.call_id.clone()
                {
                    events::emit(
                        &self.deps.event_bus.remote_track_added,
                        RemoteTrackAdded { call_id, track },
                    );
                    self.publish();
                }
            }
            PeerEvent::StateChanged(state) => {
                info!(target: "Call/Engine", "Peer connection {state}");
                if state.is_fatal() && self.session.state.is_live() {
                    self.fail_session(format!("Peer connection {state}"));
                }
            }
        }
    }

    fn on_peer_op(&mut self, generation: u64, result: Result<PeerOpDone, MediaError>) {
        if generation != self.session.generation || !self.session.state.is_live() {
            debug!(target: "Call/Engine", "Discarding peer result from generation {generation}");
            return;
        }
        let done = match result {
            Ok(done) => done,
            Err(e) => {
                self.end_answered_call();
                self.fail_session(format!("Negotiation failed: {e}"));
                return;
            }
        };
        if self.session.state != CallState::Negotiating {
            return;
        }
        let Some(call_id) = self.session.call_id.clone() else {
            return;
        };

        match done {
            PeerOpDone::OfferCreated(offer) => {
                if let Some(peer_id) = self.session.target_user.clone() {
                    self.send(SignalingCommand::SendOffer {
                        call_id,
                        peer_id,
                        offer,
                    });
                }
            }
            PeerOpDone::AnswerCreated(answer) => {
                let (Some(peer_id), Some(answerer_id)) = (
                    self.session.target_user.clone(),
                    self.session.local_user().cloned(),
                ) else {
                    return;
                };
                self.send(SignalingCommand::SendAnswer {
                    call_id,
                    peer_id,
                    answerer_id,
                    answer,
                });
                self.mark_ongoing();
            }
            PeerOpDone::RemoteDescriptionSet(SdpType::Answer) => self.mark_ongoing(),
            PeerOpDone::RemoteDescriptionSet(SdpType::Offer) => {}
        }
    }

    fn mark_ongoing(&mut self) {
        if let Err(e) = self
            .session
            .apply_transition(CallTransition::DescriptionsExchanged)
        {
            warn!(target: "Call/Engine", "{e}");
            return;
        }
        info!(target: "Call/Engine", "Call {:?} is ongoing", self.session.call_id);
        self.publish();
    }

    fn on_timer(&mut self, fired: TimerFired) {
        if fired.generation != self.session.generation {
            return;
        }
        match fired.kind {
            TimerKind::OutgoingTimeout => {
                if self.session.state == CallState::InitiatingOutgoing {
                    info!(target: "Call/Engine", "Call {:?} was not answered", self.session.call_id);
                    // Nothing to decline until InitiateCall has gone out.
                    if !matches!(self.pending_setup, Some(PendingSetup::Initiate(_))) {
                        self.send_decline(false);
                    }
                    self.fail_session("No answer".to_string());
                }
            }
            TimerKind::Reset => {
                if self.session.state == CallState::Error {
                    self.reset();
                }
            }
        }
    }

    fn on_send_failed(&mut self, generation: u64, command: SignalingCommand, error: SignalingError) {
        if generation != self.session.generation || !self.is_live_call(command.call_id()) {
            return;
        }
        self.fail_session(format!("Failed to send {}: {error}", command.method_name()));
    }

    // ---- teardown ----

    fn send(&self, command: SignalingCommand) {
        let outbound = Outbound {
            generation: self.session.generation,
            command,
        };
        if let Err(e) = self.outbound.send(outbound) {
            warn!(target: "Call/Engine", "Outbound queue closed, dropping {}", e.0.command.method_name());
        }
    }

    fn send_decline(&self, is_busy: bool) {
        if let (Some(call_id), Some(decliner_id)) =
            (self.session.call_id.clone(), self.session.local_user().cloned())
        {
            self.send(SignalingCommand::DeclineCall {
                call_id,
                decliner_id,
                is_busy,
            });
        }
    }

    /// Tells the peer an answered call is over before a local failure tears it down.
    fn end_answered_call(&self) {
        if !self.session.state.is_live() || self.session.state.is_unanswered() {
            return;
        }
        if let (Some(call_id), Some(ender_id)) =
            (self.session.call_id.clone(), self.session.local_user().cloned())
        {
            self.send(SignalingCommand::EndCall { call_id, ender_id });
        }
    }

    fn start_ringing(&mut self) {
        if !self.ringing {
            self.ringing = true;
            self.deps.ringtone.start_ringing();
        }
    }

    fn stop_ringing(&mut self) {
        if self.ringing {
            self.ringing = false;
            self.deps.ringtone.stop_ringing();
        }
    }

    fn call_finished(&self, reason: EndCallReason) {
        if let Some(call_id) = self.session.call_id.clone() {
            events::emit(
                &self.deps.event_bus.call_finished,
                CallFinished { call_id, reason },
            );
        }
    }

    /// Moves a live call to `Error` and schedules the reset.
    fn fail_session(&mut self, message: String) {
        if !self.session.state.is_live() {
            return;
        }
        warn!(target: "Call/Engine", "Call {:?} failed: {message}", self.session.call_id);

        self.timers.cancel_outgoing_timeout();
        self.stop_ringing();
        let pending = self.pending_setup.take();
        if let Err(e) = self.session.apply_transition(CallTransition::Failed) {
            warn!(target: "Call/Engine", "{e}");
        } else {
            self.session.error = Some(message.clone());
            self.call_finished(EndCallReason::Failed(message));
            self.timers
                .schedule_reset(self.session.generation, self.config.error_reset_delay());
            self.publish();
        }
        if let Some(pending) = pending {
            pending.fail(CallError::Aborted);
        }
    }

    /// Moves a live call to `Ended` and resets right away.
    fn finish(&mut self, reason: EndCallReason) {
        if !self.session.state.is_live() {
            return;
        }
        if let Err(e) = self.session.apply_transition(CallTransition::Ended) {
            warn!(target: "Call/Engine", "{e}");
            return;
        }
        self.call_finished(reason);
        self.publish();
        self.reset();
    }

    /// The only way back to `Idle`. Releases everything the session owns.
    fn reset(&mut self) {
        debug!(target: "Call/Engine", "Resetting session {:?}", self.session.call_id);

        self.timers.cancel_all();
        self.stop_ringing();
        if let Some(pending) = self.pending_setup.take() {
            pending.fail(CallError::Aborted);
        }
        if let Some(link) = self.peer_link.take() {
            link.abort();
        }
        if let Some(media) = self.session.reset() {
            release_media(media);
        }
        self.publish();
    }

    fn publish(&mut self) {
        let snapshot = self.session.snapshot();
        if snapshot.state != self.published_state {
            let call_id = snapshot
                .call_id
                .clone()
                .or_else(|| self.published_call_id.clone());
            debug!(
                target: "Call/Engine",
                "State {:?} -> {:?} ({call_id:?})",
                self.published_state,
                snapshot.state
            );
            events::emit(
                &self.deps.event_bus.call_state_changed,
                CallStateChanged {
                    call_id,
                    from: self.published_state,
                    to: snapshot.state,
                },
            );
            self.published_state = snapshot.state;
        }
        self.published_call_id = snapshot.call_id.clone();
        self.snapshot_tx.send_replace(snapshot);
    }
}
