//! Peer connections backed by webrtc-rs
//!
//! Enabled with the `webrtc-rs` feature. Capture code feeds Opus samples into
//! `LocalAudioTrack`; remote audio arrives as `RemoteAudioTrack`.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};
use crate::media::*;

fn rtc_error(e: webrtc::Error) -> Error {
    Error::PeerConnection(e.to_string())
}

// ============================================================================
// Tracks
// ============================================================================

pub struct LocalAudioTrack {
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl LocalAudioTrack {
    pub fn new(id: &str) -> Self {
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            id.to_owned(),
            "huddle".to_owned(),
        );
        Self {
            track: Arc::new(track),
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }

    /// Samples written while disabled or after stop are dropped.
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if !self.is_enabled() || !self.is_live() {
            return Ok(());
        }
        self.track.write_sample(sample).await.map_err(rtc_error)
    }
}

impl AudioTrack for LocalAudioTrack {
    fn id(&self) -> String {
        self.track.id().to_string()
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub struct RemoteAudioTrack {
    track: Arc<TrackRemote>,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl RemoteAudioTrack {
    pub fn remote(&self) -> Arc<TrackRemote> {
        self.track.clone()
    }
}

impl AudioTrack for RemoteAudioTrack {
    fn id(&self) -> String {
        self.track.id().to_string()
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

// ============================================================================
// Peer connection
// ============================================================================

pub struct WebrtcPeer {
    pc: Arc<RTCPeerConnection>,
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(rtc_error)
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

#[async_trait]
impl PeerConnection for WebrtcPeer {
    async fn add_track(&self, track: Arc<dyn AudioTrack>) -> Result<()> {
        let Some(local) = track.as_any().downcast_ref::<LocalAudioTrack>() else {
            return Err(Error::PeerConnection(
                "track was not captured for webrtc-rs".to_string(),
            ));
        };
        let local: Arc<dyn TrackLocal + Send + Sync> = local.track.clone();
        self.pc.add_track(local).await.map_err(rtc_error)?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(rtc_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.map_err(rtc_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(rtc_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(rtc_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(rtc_error)
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(rtc_error)
    }
}

#[derive(Default)]
pub struct WebrtcPeerFactory;

#[async_trait]
impl PeerConnectionFactory for WebrtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[String],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(rtc_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(rtc_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(rtc_error)?);

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => tracing::warn!("Dropping local ICE candidate: {}", e),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let _ = tx.send(PeerEvent::StateChanged(connection_state(state)));
            Box::pin(async {})
        }));

        let tx = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let remote: Arc<dyn AudioTrack> = Arc::new(RemoteAudioTrack {
                track,
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
            });
            let _ = tx.send(PeerEvent::RemoteTrack(remote));
            Box::pin(async {})
        }));

        Ok(Arc::new(WebrtcPeer { pc }))
    }
}
