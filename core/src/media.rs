//! Media capture, playback and peer-connection seams
//!
//! The call state machine drives these traits; platform code supplies the
//! implementations (see `webrtc_peer` for the webrtc-rs one).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

// ============================================================================
// Negotiation payloads
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description in the browser JSON shape: `{"type": "offer", "sdp": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

// ============================================================================
// Tracks and devices
// ============================================================================

pub trait AudioTrack: Send + Sync {
    fn id(&self) -> String;

    fn is_enabled(&self) -> bool;

    /// Disabled tracks stay attached and send silence.
    fn set_enabled(&self, enabled: bool);

    fn stop(&self);

    fn is_live(&self) -> bool;

    fn as_any(&self) -> &dyn std::any::Any;
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Fails with `Error::Microphone` when permission is denied or no device exists.
    async fn capture_microphone(&self) -> Result<Arc<dyn AudioTrack>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    /// The environment refused to start playback without a user gesture.
    AutoplayBlocked,
    Failed(String),
}

#[async_trait]
pub trait AudioOutput: Send + Sync {
    fn attach(&self, track: Arc<dyn AudioTrack>);

    fn detach(&self);

    async fn play(&self) -> std::result::Result<(), PlaybackError>;
}

// ============================================================================
// Peer connection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

pub enum PeerEvent {
    IceCandidate(IceCandidate),
    RemoteTrack(Arc<dyn AudioTrack>),
    StateChanged(ConnectionState),
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::IceCandidate(c) => write!(f, "IceCandidate({})", c.candidate),
            PeerEvent::RemoteTrack(t) => write!(f, "RemoteTrack({})", t.id()),
            PeerEvent::StateChanged(s) => write!(f, "StateChanged({:?})", s),
        }
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: Arc<dyn AudioTrack>) -> Result<()>;

    /// Creates an offer and installs it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Creates an answer and installs it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// The connection reports local candidates, remote tracks and state changes on `events`.
    async fn create(
        &self,
        ice_servers: &[String],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>>;
}

pub(crate) fn description_from_signal(data: &serde_json::Value) -> Result<SessionDescription> {
    serde_json::from_value(data.clone())
        .map_err(|e| Error::PeerConnection(format!("Malformed session description: {}", e)))
}

pub(crate) fn candidate_from_signal(data: &serde_json::Value) -> Result<IceCandidate> {
    serde_json::from_value(data.clone())
        .map_err(|e| Error::PeerConnection(format!("Malformed ICE candidate: {}", e)))
}
