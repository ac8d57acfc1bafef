//! WHIP media channel: an Opus-in-RTP uplink negotiated with a single
//! HTTP POST.
//!
//! The offer is created locally, ICE gathering runs to completion so the
//! SDP carries every candidate, and the endpoint answers in the POST
//! response body. A server-issued session id may come back in the
//! `X-Session-ID` header.

use parking_lot::Mutex;
use reqwest::StatusCode;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet as RtpPacket;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::audio::{CHANNELS, OPUS_BITRATE, WIRE_SAMPLE_RATE};
use crate::error::ClientError;

/// Opus payload type (dynamic, typically 111)
const OPUS_PAYLOAD_TYPE: u8 = 111;
/// RTP clock rate for Opus is always 48000
const OPUS_CLOCK_RATE: u32 = 48000;
/// Opus frame duration on the wire
const OPUS_FRAME_MS: u32 = 20;
/// Input samples per Opus frame at the wire rate
const SAMPLES_PER_OPUS_FRAME: usize = (WIRE_SAMPLE_RATE as usize * OPUS_FRAME_MS as usize) / 1000;
/// RTP timestamp advance per packet, in 48kHz clock units
const RTP_TIMESTAMP_STEP: u32 = OPUS_CLOCK_RATE * OPUS_FRAME_MS / 1000;

const SESSION_ID_HEADER: &str = "X-Session-ID";

/// A POST answered with 405 still proves the endpoint is reachable; some
/// WHIP gateways reject probe requests by method only.
pub fn status_indicates_reachable(status: StatusCode) -> bool {
    status.is_success() || status == StatusCode::METHOD_NOT_ALLOWED
}

/// Capability probe against the WHIP endpoint.
pub async fn probe_endpoint(http: &reqwest::Client, url: &str) -> Result<(), ClientError> {
    let response = http
        .post(url)
        .header("Content-Type", "application/sdp")
        .body("")
        .send()
        .await
        .map_err(|e| ClientError::Transport(format!("WHIP probe failed: {}", e)))?;

    let status = response.status();
    if status_indicates_reachable(status) {
        Ok(())
    } else {
        Err(ClientError::Negotiation(format!(
            "WHIP endpoint probe returned {}",
            status
        )))
    }
}

/// Outbound Opus track. Accumulates wire-rate PCM16, encodes 20ms Opus
/// frames and writes them as RTP.
pub struct OutboundAudioTrack {
    track: Arc<TrackLocalStaticRTP>,
    encoder: Mutex<opus::Encoder>,
    pending: Mutex<Vec<i16>>,
    sequence_number: Mutex<u16>,
    timestamp: Mutex<u32>,
    ssrc: u32,
}

impl OutboundAudioTrack {
    pub fn new(track_id: &str, stream_id: &str) -> Result<Self, ClientError> {
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: CHANNELS,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            track_id.to_string(),
            stream_id.to_string(),
        ));

        let mut encoder =
            opus::Encoder::new(WIRE_SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
                .map_err(|e| ClientError::Negotiation(format!("Failed to create Opus encoder: {}", e)))?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(OPUS_BITRATE))
            .map_err(|e| ClientError::Negotiation(format!("Failed to set bitrate: {}", e)))?;
        encoder
            .set_inband_fec(true)
            .map_err(|e| ClientError::Negotiation(format!("Failed to enable FEC: {}", e)))?;

        Ok(Self {
            track,
            encoder: Mutex::new(encoder),
            pending: Mutex::new(Vec::with_capacity(SAMPLES_PER_OPUS_FRAME * 4)),
            sequence_number: Mutex::new(0),
            timestamp: Mutex::new(rand::random::<u32>()),
            ssrc: rand::random::<u32>(),
        })
    }

    pub fn track(&self) -> Arc<TrackLocalStaticRTP> {
        self.track.clone()
    }

    /// Queue wire-rate PCM16 and send every complete Opus frame.
    pub async fn send_pcm(&self, samples: &[i16]) -> Result<(), ClientError> {
        // Encode and build packets without holding locks across await
        let packets = {
            let mut pending = self.pending.lock();
            pending.extend_from_slice(samples);

            let mut encoder = self.encoder.lock();
            let mut seq = self.sequence_number.lock();
            let mut ts = self.timestamp.lock();
            let mut packets = Vec::new();

            while pending.len() >= SAMPLES_PER_OPUS_FRAME {
                let frame: Vec<i16> = pending.drain(..SAMPLES_PER_OPUS_FRAME).collect();
                let mut output = vec![0u8; 256];
                let len = encoder
                    .encode(&frame, &mut output)
                    .map_err(|e| ClientError::Negotiation(format!("Opus encoding failed: {}", e)))?;
                output.truncate(len);

                packets.push(RtpPacket {
                    header: webrtc::rtp::header::Header {
                        version: 2,
                        padding: false,
                        extension: false,
                        marker: false,
                        payload_type: OPUS_PAYLOAD_TYPE,
                        sequence_number: *seq,
                        timestamp: *ts,
                        ssrc: self.ssrc,
                        ..Default::default()
                    },
                    payload: bytes::Bytes::from(output),
                });

                *seq = seq.wrapping_add(1);
                *ts = ts.wrapping_add(RTP_TIMESTAMP_STEP);
            }

            packets
        }; // locks released here

        for packet in &packets {
            self.track
                .write_rtp(packet)
                .await
                .map_err(|e| ClientError::Transport(format!("Failed to write RTP packet: {}", e)))?;
        }

        Ok(())
    }
}

/// Register the Opus voice codec ahead of the defaults.
fn create_media_engine() -> Result<MediaEngine, ClientError> {
    let mut m = MediaEngine::default();

    m.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: CHANNELS,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: OPUS_PAYLOAD_TYPE,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )
    .map_err(|e| ClientError::Negotiation(format!("Failed to register Opus codec: {}", e)))?;

    m.register_default_codecs()
        .map_err(|e| ClientError::Negotiation(format!("Failed to register codecs: {}", e)))?;

    Ok(m)
}

/// An established WHIP media session.
pub struct MediaSession {
    peer_connection: Arc<RTCPeerConnection>,
    track: Arc<OutboundAudioTrack>,
}

impl MediaSession {
    /// Negotiate with the WHIP endpoint. Returns the session and the
    /// server-issued session id, if the endpoint provided one.
    pub async fn connect(
        http: &reqwest::Client,
        endpoint: &str,
        ice_servers: &[String],
        session_id: &str,
    ) -> Result<(Self, Option<String>), ClientError> {
        let mut m = create_media_engine()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)
            .map_err(|e| ClientError::Negotiation(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| ClientError::Negotiation(format!("Failed to create peer connection: {}", e)))?,
        );

        let track = Arc::new(OutboundAudioTrack::new("audio", "voicelink")?);
        peer_connection
            .add_track(track.track() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| ClientError::Negotiation(format!("Failed to add audio track: {}", e)))?;

        let offer = peer_connection
            .create_offer(None)
            .await
            .map_err(|e| ClientError::Negotiation(format!("Failed to create offer: {}", e)))?;

        // Gather every ICE candidate before shipping the SDP; WHIP has no
        // trickle path on this endpoint
        let mut gather_complete = peer_connection.gathering_complete_promise().await;
        peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| ClientError::Negotiation(format!("Failed to set local description: {}", e)))?;
        let _ = gather_complete.recv().await;

        let local_desc = peer_connection
            .local_description()
            .await
            .ok_or_else(|| ClientError::Negotiation("No local description after gathering".to_string()))?;

        let response = http
            .post(endpoint)
            .header("Content-Type", "application/sdp")
            .header(SESSION_ID_HEADER, session_id)
            .body(local_desc.sdp)
            .send()
            .await
            .map_err(|e| ClientError::Transport(format!("WHIP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Negotiation(format!(
                "WHIP endpoint returned {}",
                status
            )));
        }

        let server_session_id = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let answer_sdp = response
            .text()
            .await
            .map_err(|e| ClientError::Transport(format!("Failed to read WHIP answer: {}", e)))?;

        let answer = RTCSessionDescription::answer(answer_sdp)
            .map_err(|e| ClientError::Negotiation(format!("Invalid SDP answer: {}", e)))?;

        peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| ClientError::Negotiation(format!("Failed to set remote description: {}", e)))?;

        tracing::info!("WHIP media session established");
        Ok((Self { peer_connection, track }, server_session_id))
    }

    /// Send one captured frame over the media channel.
    pub async fn send_frame(&self, samples: &[i16]) -> Result<(), ClientError> {
        self.track.send_pcm(samples).await
    }

    /// Close the peer connection in the background.
    pub fn close(&self) {
        let pc = self.peer_connection.clone();
        tokio::spawn(async move {
            if let Err(e) = pc.close().await {
                tracing::warn!("Failed to close peer connection: {}", e);
            }
        });
    }
}
