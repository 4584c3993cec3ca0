//! Synthetic capture for clients without camera or microphone access.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use rand::RngCore;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{LocalStream, LocalTrack, MediaDevices, TrackKind};
use crate::calls::error::MediaError;
use crate::types::call::CallType;

/// A single 20 ms Opus frame of silence.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const AUDIO_FRAME: Duration = Duration::from_millis(20);

/// Produces sample tracks with the codecs a real capture pipeline would use.
///
/// Audio is Opus at 48 kHz stereo, video is VP8. Nothing is written to the
/// tracks unless [`pump_silence`] is driving them.
#[derive(Debug, Default, Clone)]
pub struct SyntheticMediaDevices;

impl SyntheticMediaDevices {
    pub fn new() -> Self {
        Self
    }
}

fn new_stream_id() -> String {
    let mut bytes = [0u8; 4];
    rand::rng().fill_bytes(&mut bytes);
    format!("stream-{}", hex::encode(bytes))
}

#[async_trait]
impl MediaDevices for SyntheticMediaDevices {
    async fn acquire(&self, call_type: CallType) -> Result<LocalStream, MediaError> {
        let stream_id = new_stream_id();

        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            format!("audio-{stream_id}"),
            stream_id.clone(),
        ));
        let mut tracks = vec![LocalTrack::new(TrackKind::Audio, audio)];

        if call_type.is_video() {
            let video = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                format!("video-{stream_id}"),
                stream_id.clone(),
            ));
            tracks.push(LocalTrack::new(TrackKind::Video, video));
        }

        debug!(target: "Call/Media", "Acquired synthetic {call_type} stream {stream_id}");
        Ok(LocalStream::new(stream_id, tracks))
    }
}

/// Writes silent Opus frames to every enabled audio track until the stream stops.
pub async fn pump_silence(stream: LocalStream) {
    let mut ticker = tokio::time::interval(AUDIO_FRAME);
    info!(target: "Call/Media", "Pumping silence into stream {}", stream.id());

    loop {
        ticker.tick().await;
        if stream.is_stopped() {
            break;
        }
        for track in stream.tracks_of(TrackKind::Audio) {
            if !track.is_enabled() {
                continue;
            }
            let sample = Sample {
                data: OPUS_SILENCE.to_vec().into(),
                duration: AUDIO_FRAME,
                ..Default::default()
            };
            if let Err(e) = track.rtp_track().write_sample(&sample).await {
                debug!(target: "Call/Media", "Dropping silent frame on {}: {e}", track.id());
            }
        }
    }

    debug!(target: "Call/Media", "Silence pump for {} finished", stream.id());
}
