//! Fakes shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use huddle_core::memory::{MemoryBackend, MemoryRelay};
use huddle_core::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ============================================================================
// Media
// ============================================================================

pub struct FakeTrack {
    id: String,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl FakeTrack {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        })
    }
}

impl AudioTrack for FakeTrack {
    fn id(&self) -> String {
        self.id.clone()
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

#[derive(Default)]
pub struct FakeMedia {
    pub deny: AtomicBool,
    captured: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeMedia {
    pub fn captured(&self) -> Vec<Arc<FakeTrack>> {
        self.captured.lock().clone()
    }
}

#[async_trait]
impl MediaDevices for FakeMedia {
    async fn capture_microphone(&self) -> Result<Arc<dyn AudioTrack>> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(Error::Microphone("Permission denied".to_string()));
        }
        let mut captured = self.captured.lock();
        let track = FakeTrack::new(&format!("mic-{}", captured.len() + 1));
        captured.push(track.clone());
        Ok(track)
    }
}

#[derive(Default)]
pub struct FakeAudio {
    pub blocked: AtomicBool,
    attached: Mutex<Option<String>>,
    plays: AtomicUsize,
}

impl FakeAudio {
    pub fn attached(&self) -> Option<String> {
        self.attached.lock().clone()
    }

    pub fn plays(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioOutput for FakeAudio {
    fn attach(&self, track: Arc<dyn AudioTrack>) {
        *self.attached.lock() = Some(track.id());
    }

    fn detach(&self) {
        *self.attached.lock() = None;
    }

    async fn play(&self) -> std::result::Result<(), PlaybackError> {
        if self.blocked.load(Ordering::SeqCst) {
            return Err(PlaybackError::AutoplayBlocked);
        }
        self.plays.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Peer connections
// ============================================================================

/// Connects as soon as it holds both a local and a remote description.
pub struct FakePeer {
    name: String,
    events: mpsc::UnboundedSender<PeerEvent>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    tracks: Mutex<Vec<Arc<dyn AudioTrack>>>,
    applied: Mutex<Vec<String>>,
    rejected: AtomicUsize,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl FakePeer {
    pub fn emit_candidate(&self, candidate: &str) {
        let _ = self.events.send(PeerEvent::IceCandidate(IceCandidate {
            candidate: candidate.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }));
    }

    pub fn fail(&self) {
        let _ = self
            .events
            .send(PeerEvent::StateChanged(ConnectionState::Failed));
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().clone()
    }

    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn track_count(&self) -> usize {
        self.tracks.lock().len()
    }

    pub fn remote(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn maybe_connect(&self) {
        let ready = self.local.lock().is_some() && self.remote.lock().is_some();
        if ready && !self.connected.swap(true, Ordering::SeqCst) {
            let remote = FakeTrack::new(&format!("remote-of-{}", self.name));
            let _ = self.events.send(PeerEvent::RemoteTrack(remote));
            let _ = self
                .events
                .send(PeerEvent::StateChanged(ConnectionState::Connected));
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: Arc<dyn AudioTrack>) -> Result<()> {
        self.tracks.lock().push(track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = SessionDescription::offer(format!("v=0 offer from {}", self.name));
        *self.local.lock() = Some(offer.clone());
        self.maybe_connect();
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if self.remote.lock().is_none() {
            return Err(Error::PeerConnection("no remote offer".to_string()));
        }
        let answer = SessionDescription::answer(format!("v=0 answer from {}", self.name));
        *self.local.lock() = Some(answer.clone());
        self.maybe_connect();
        Ok(answer)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        *self.remote.lock() = Some(description);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.remote.lock().is_none() {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(Error::PeerConnection("remote description not set".to_string()));
        }
        self.applied.lock().push(candidate.candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakePeerFactory {
    name: String,
    created: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> usize {
        self.created.lock().len()
    }

    pub fn last(&self) -> Arc<FakePeer> {
        self.created.lock().last().cloned().expect("no peer connection created")
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        _ice_servers: &[String],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let peer = Arc::new(FakePeer {
            name: self.name.clone(),
            events,
            local: Mutex::new(None),
            remote: Mutex::new(None),
            tracks: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            rejected: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.created.lock().push(peer.clone());
        Ok(peer)
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub relay: Arc<MemoryRelay>,
    pub backend: Arc<MemoryBackend>,
}

pub struct Phone {
    pub calls: CallManager,
    pub media: Arc<FakeMedia>,
    pub peers: Arc<FakePeerFactory>,
    pub audio: Arc<FakeAudio>,
    listener: JoinHandle<()>,
}

impl Drop for Phone {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl Harness {
    pub fn new() -> Self {
        let relay = Arc::new(MemoryRelay::new());
        let backend = Arc::new(MemoryBackend::new(relay.clone()));
        Self { relay, backend }
    }

    pub async fn phone(&self, user: &str) -> Phone {
        let media = Arc::new(FakeMedia::default());
        let peers = Arc::new(FakePeerFactory::new(user));
        let audio = Arc::new(FakeAudio::default());
        let calls = CallManager::new(
            user,
            &Config::default().calls,
            CallBackends {
                calls: self.backend.clone(),
                signals: self.backend.clone(),
                relay: self.relay.clone(),
                media: media.clone(),
                peers: peers.clone(),
                audio: audio.clone(),
            },
        );
        let listener = calls.listen().await.unwrap();
        Phone {
            calls,
            media,
            peers,
            audio,
            listener,
        }
    }
}

pub async fn wait_for<F>(calls: &CallManager, what: &str, predicate: F) -> CallSnapshot
where
    F: Fn(&CallSnapshot) -> bool,
{
    let mut rx = calls.subscribe();
    let wait = async {
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if predicate(&snapshot) {
                return snapshot;
            }
            if rx.changed().await.is_err() {
                panic!("call manager dropped while waiting for {}", what);
            }
        }
    };
    match tokio::time::timeout(Duration::from_secs(5), wait).await {
        Ok(snapshot) => snapshot,
        Err(_) => panic!("timed out waiting for {}: {:?}", what, calls.snapshot()),
    }
}

pub async fn wait_phase(calls: &CallManager, phase: CallPhase) -> CallSnapshot {
    wait_for(calls, &format!("{:?}", phase), |s| s.phase == phase).await
}

/// Poll `condition` until it holds.
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Let spawned listeners drain what is already queued.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Caller and receiver in a connected call.
pub async fn connected_pair(harness: &Harness, caller: &str, receiver: &str) -> (Phone, Phone, Call) {
    let a = harness.phone(caller).await;
    let b = harness.phone(receiver).await;

    let call = a.calls.start_call(receiver).await.unwrap();
    wait_phase(&b.calls, CallPhase::Ringing).await;
    b.calls.accept_call().await.unwrap();
    wait_phase(&a.calls, CallPhase::Connected).await;
    wait_phase(&b.calls, CallPhase::Connected).await;
    (a, b, call)
}
