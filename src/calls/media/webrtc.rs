//! webrtc-rs backed peer connections.
//!
//! Each [`WebRtcPeerConnection`] wraps one `RTCPeerConnection` built with the
//! default codecs and interceptors. Callbacks registered on the connection
//! translate into [`PeerEvent`]s on an unbounded channel so the engine can
//! consume them in order.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{
    LocalStream, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent,
    PeerEventReceiver, RemoteTrack, TrackKind,
};
use crate::calls::error::MediaError;
use crate::calls::transport::{IceCandidate, SdpType, SessionDescription};
use crate::config::IceServerConfig;

/// Builds peer connections with the default codec set.
#[derive(Debug, Default, Clone)]
pub struct WebRtcPeerConnectionFactory;

impl WebRtcPeerConnectionFactory {
    pub fn new() -> Self {
        Self
    }

    fn create_api() -> Result<webrtc::api::API, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }
}

fn to_rtc_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| {
            #[allow(clippy::needless_update)]
            RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            }
        })
        .collect()
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
        _ => None,
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerConnectionFactory {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> Result<(Arc<dyn PeerConnection>, PeerEventReceiver), MediaError> {
        let api = Self::create_api()?;
        let config = RTCConfiguration {
            ice_servers: to_rtc_ice_servers(ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);
        let (tx, rx) = mpsc::unbounded_channel();

        let candidate_tx = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!(target: "Call/WebRTC", "ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!(target: "Call/WebRTC", "Failed to serialize local candidate: {e}"),
                }
            })
        }));

        let track_tx = tx.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let tx = track_tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    _ => TrackKind::Audio,
                };
                let remote = RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                };
                info!(target: "Call/WebRTC", "Remote {} track {} in stream {}", remote.kind, remote.id, remote.stream_id);
                let _ = tx.send(PeerEvent::RemoteTrack(remote));

                // Nothing renders inbound media here; keep the receiver drained.
                tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
            })
        }));

        let state_tx = tx;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                debug!(target: "Call/WebRTC", "Peer connection state: {state}");
                if let Some(state) = map_state(state) {
                    let _ = tx.send(PeerEvent::StateChanged(state));
                }
            })
        }));

        Ok((Arc::new(WebRtcPeerConnection { pc }), rx))
    }
}

pub struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcPeerConnection {
    fn to_rtc_description(
        description: SessionDescription,
    ) -> Result<RTCSessionDescription, MediaError> {
        let rtc = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
            SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
        };
        Ok(rtc)
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), MediaError> {
        for track in stream.tracks() {
            let sender = self
                .pc
                .add_track(Arc::clone(track.rtp_track()) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;

            // RTCP has to be read for the interceptors to work.
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        let rtc = Self::to_rtc_description(description)?;
        self.pc.set_remote_description(rtc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        if candidate.candidate.is_empty() {
            return Err(MediaError::InvalidCandidate("empty candidate line".into()));
        }
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.pc.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::media::{MediaDevices, SyntheticMediaDevices};
    use crate::types::call::CallType;

    #[test]
    fn test_ice_servers_keep_turn_credentials() {
        let servers = vec![
            IceServerConfig::stun("stun:stun.l.google.com:19302"),
            IceServerConfig {
                urls: vec!["turn:turn.example.com:3478".into()],
                username: Some("user".into()),
                credential: Some("secret".into()),
            },
        ];
        let rtc = to_rtc_ice_servers(&servers);

        assert_eq!(rtc.len(), 2);
        assert!(rtc[0].username.is_empty());
        assert_eq!(rtc[1].username, "user");
        assert_eq!(rtc[1].credential, "secret");
    }

    #[test]
    fn test_unspecified_state_is_dropped() {
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), None);
        assert_eq!(
            map_state(RTCPeerConnectionState::Failed),
            Some(PeerConnectionState::Failed)
        );
    }

    #[tokio::test]
    async fn test_local_offer_answer_exchange() {
        let factory = WebRtcPeerConnectionFactory::new();
        let devices = SyntheticMediaDevices::new();

        let (caller, _caller_events) = factory.create(&[]).await.unwrap();
        let (callee, _callee_events) = factory.create(&[]).await.unwrap();
        caller
            .add_local_stream(&devices.acquire(CallType::Video).await.unwrap())
            .await
            .unwrap();
        callee
            .add_local_stream(&devices.acquire(CallType::Video).await.unwrap())
            .await
            .unwrap();

        let offer = caller.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        callee.set_remote_description(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        caller.set_remote_description(answer).await.unwrap();

        caller.close().await.unwrap();
        callee.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_candidate_is_rejected() {
        let (pc, _events) = WebRtcPeerConnectionFactory::new().create(&[]).await.unwrap();
        let err = pc.add_ice_candidate(IceCandidate::new("")).await.unwrap_err();
        assert!(matches!(err, MediaError::InvalidCandidate(_)));
        pc.close().await.unwrap();
    }
}
