use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use peercall::calls::media::{SyntheticMediaDevices, WebRtcPeerConnectionFactory, pump_silence};
use peercall::calls::{CallEngine, CallEngineDeps, CallSignalHandler, NoopRingtone, StaticIdentity};
use peercall::transport::TokioWebSocketTransportFactory;
use peercall::{CallState, CallType, ClientConfig, EventBus, SignalingClient};
use std::path::PathBuf;
use std::sync::Arc;

// Command line softphone over the synthetic media source.
//
// Usage:
//   cargo run -- --user alice                              # wait for calls
//   cargo run -- --user alice --auto-answer                # answer every call
//   cargo run -- --user alice --call bob --video           # place a video call
//   cargo run -- --config peercall.json --token $TOKEN     # settings from a file

#[derive(Parser, Debug)]
#[command(version, about = "Two-party call client for a peercall signaling hub")]
struct Args {
    /// Signaling hub websocket URL.
    #[arg(long)]
    url: Option<String>,

    /// Bearer token sent as the `access_token` query parameter.
    #[arg(long, env = "PEERCALL_TOKEN")]
    token: Option<String>,

    /// Identity of the local user.
    #[arg(long, short)]
    user: String,

    /// JSON configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Call this user once connected.
    #[arg(long)]
    call: Option<String>,

    /// Place a video call instead of a voice call.
    #[arg(long)]
    video: bool,

    /// Answer incoming calls automatically.
    #[arg(long)]
    auto_answer: bool,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let mut config = match &args.config {
        Some(path) => match ClientConfig::from_json_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("{e}");
                return;
            }
        },
        None => ClientConfig::default(),
    };
    if let Some(url) = &args.url {
        config.signaling.url = url.clone();
    }
    if args.token.is_some() {
        config.signaling.access_token = args.token.clone();
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {e}");
            return;
        }
    };

    rt.block_on(run(args, config));
}

async fn run(args: Args, config: ClientConfig) {
    let event_bus = Arc::new(EventBus::new());
    let client = SignalingClient::new(
        config.signaling.clone(),
        Arc::new(TokioWebSocketTransportFactory::new()),
        event_bus.clone(),
    );

    let engine = CallEngine::spawn(
        config.calls.clone(),
        CallEngineDeps {
            signaling: client.clone(),
            media_devices: Arc::new(SyntheticMediaDevices::new()),
            peer_factory: Arc::new(WebRtcPeerConnectionFactory::new()),
            identity: Arc::new(StaticIdentity::new(args.user.clone())),
            ringtone: Arc::new(NoopRingtone),
            event_bus: event_bus.clone(),
        },
    );
    client
        .register_handler(Arc::new(CallSignalHandler::new(engine.clone())))
        .await;

    spawn_call_observer(engine.clone(), args.auto_answer);

    let runner = client.clone();
    tokio::spawn(async move { runner.run().await });

    if let Some(target) = args.call.clone() {
        let call_type = if args.video {
            CallType::Video
        } else {
            CallType::Voice
        };
        match engine.initiate_call(target.clone(), call_type).await {
            Ok(call_id) => info!("Calling {target} ({call_id})"),
            Err(e) => error!("Failed to call {target}: {e}"),
        }
    }

    let mut connection_failed = event_bus.connection_failed.subscribe();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {e}");
            }
            info!("Shutting down");
        }
        _ = connection_failed.recv() => {
            error!("Signaling hub unreachable, shutting down");
        }
    }

    engine.shutdown();
    // Let the hang-up reach the hub before the socket closes.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    client.disconnect().await;
}

/// Logs call progress, feeds silence into new local streams and answers
/// incoming calls when asked to.
fn spawn_call_observer(engine: CallEngine, auto_answer: bool) {
    let mut incoming = engine.events().incoming_call.subscribe();
    let answering = engine.clone();
    tokio::spawn(async move {
        while let Ok(call) = incoming.recv().await {
            info!(
                "Incoming {} call from {} ({})",
                call.call_type, call.initiator, call.call_id
            );
            if auto_answer
                && let Err(e) = answering.answer_call().await
            {
                warn!("Failed to answer {}: {e}", call.call_id);
            }
        }
    });

    let mut snapshots = engine.subscribe();
    tokio::spawn(async move {
        let mut last_state = CallState::Idle;
        let mut pumping = false;
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            if snapshot.state != last_state {
                info!("Call state: {last_state:?} -> {:?}", snapshot.state);
                if let Some(error) = &snapshot.error {
                    warn!("Call error: {error}");
                }
                last_state = snapshot.state;
            }

            if snapshot.has_local_stream && !pumping {
                if let Some(stream) = engine.local_stream().await {
                    pumping = true;
                    tokio::spawn(pump_silence(stream));
                }
            } else if !snapshot.has_local_stream {
                pumping = false;
            }
        }
    });
}
