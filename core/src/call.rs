//! Voice call lifecycle and WebRTC negotiation
//!
//! Local phases: `Idle -> Calling (caller) | Ringing (receiver) -> Connecting
//! -> Connected`, and back to `Idle` on hangup, decline, remote termination or
//! transport failure. The terminal status (`ended`/`missed`) lives on the
//! persisted call record and is reported as `last_outcome`.
//!
//! The manager exclusively owns the call session (microphone track, peer
//! connection, pending ICE queue, signal listener). Every attempt runs under a
//! generation number; ending a call advances the generation so work resuming
//! after a suspension point can tell it was superseded.

use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::CallConfig;
use crate::error::{Error, Result};
use crate::media::*;
use crate::models::*;
use crate::relay::*;
use crate::signaling::{SignalStream, SignalingChannel};
use crate::store::{CallStore, SignalStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    Idle,
    Calling,
    Ringing,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Caller,
    Receiver,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    /// Active or incoming call record
    pub call: Option<Call>,
    pub muted: bool,
    /// Microphone track attached and enabled
    pub mic_active: bool,
    /// Remote audio is waiting for a user gesture to start playback
    pub audio_needs_interaction: bool,
    pub error: Option<String>,
    pub last_outcome: Option<CallStatus>,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            phase: CallPhase::Idle,
            call: None,
            muted: false,
            mic_active: false,
            audio_needs_interaction: false,
            error: None,
            last_outcome: None,
        }
    }
}

/// External collaborators the call manager drives.
#[derive(Clone)]
pub struct CallBackends {
    pub calls: Arc<dyn CallStore>,
    pub signals: Arc<dyn SignalStore>,
    pub relay: Arc<dyn Relay>,
    pub media: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub audio: Arc<dyn AudioOutput>,
}

struct CallSession {
    peer: Arc<dyn PeerConnection>,
    local_track: Arc<dyn AudioTrack>,
    remote_track: Option<Arc<dyn AudioTrack>>,
    events_task: JoinHandle<()>,
}

#[derive(Default)]
struct Negotiation {
    generation: u64,
    call_id: Option<CallId>,
    role: Option<Role>,
    channel: Option<SignalingChannel>,
    session: Option<CallSession>,
    listener: Option<JoinHandle<()>>,
    pending_ice: Vec<IceCandidate>,
    remote_description_set: bool,
    handled_signals: HashSet<String>,
}

impl Negotiation {
    fn begin(&mut self, generation: u64, call_id: &str, role: Role, channel: SignalingChannel) {
        self.generation = generation;
        self.call_id = Some(call_id.to_string());
        self.role = Some(role);
        self.channel = Some(channel);
    }

    fn is_for(&self, generation: u64, call_id: &str) -> bool {
        self.generation == generation && self.call_id.as_deref() == Some(call_id)
    }

    fn take_resources(&mut self) -> (Option<CallSession>, Option<JoinHandle<()>>) {
        let session = self.session.take();
        let listener = self.listener.take();
        *self = Negotiation::default();
        (session, listener)
    }
}

struct Inner {
    local_user: UserId,
    ice_servers: Vec<String>,
    backends: CallBackends,
    snapshot: watch::Sender<CallSnapshot>,
    negotiation: Mutex<Negotiation>,
    generation: AtomicU64,
    /// Calls that reached a terminal status. Redelivered rows for them never ring.
    finished: parking_lot::Mutex<HashSet<CallId>>,
}

#[derive(Clone)]
pub struct CallManager {
    inner: Arc<Inner>,
}

impl CallManager {
    pub fn new(local_user: &str, config: &CallConfig, backends: CallBackends) -> Self {
        let (snapshot, _) = watch::channel(CallSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                local_user: local_user.to_string(),
                ice_servers: config.ice_servers.clone(),
                backends,
                snapshot,
                negotiation: Mutex::new(Negotiation::default()),
                generation: AtomicU64::new(0),
                finished: parking_lot::Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn local_user(&self) -> &str {
        &self.inner.local_user
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub async fn has_session(&self) -> bool {
        self.inner.negotiation.lock().await.session.is_some()
    }

    // ========================================================================
    // Generations
    // ========================================================================

    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    /// Claim the right to end `generation`. Only the first caller wins.
    fn end_generation(&self, generation: u64) -> bool {
        self.inner
            .generation
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn cancelled(&self) -> Error {
        Error::CallCancelled("call ended while it was being set up".to_string())
    }

    // ========================================================================
    // Snapshot updates
    // ========================================================================

    fn set_idle(&self, outcome: Option<CallStatus>, error: Option<String>) {
        self.inner.snapshot.send_modify(|s| {
            if let Some(call) = &s.call {
                self.inner.finished.lock().insert(call.id.clone());
            }
            *s = CallSnapshot {
                last_outcome: outcome,
                error,
                ..CallSnapshot::default()
            };
        });
    }

    fn advance_phase(&self, from: &[CallPhase], to: CallPhase) {
        let changed = self.inner.snapshot.send_if_modified(|s| {
            if from.contains(&s.phase) {
                s.phase = to;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!("Call phase for {} is now {:?}", self.inner.local_user, to);
        }
    }

    /// Clear the outcome and error left by the previous call.
    pub fn reset(&self) {
        self.inner.snapshot.send_if_modified(|s| {
            if s.phase == CallPhase::Idle && (s.error.is_some() || s.last_outcome.is_some()) {
                s.error = None;
                s.last_outcome = None;
                true
            } else {
                false
            }
        });
    }

    // ========================================================================
    // Outgoing calls
    // ========================================================================

    pub async fn start_call(&self, receiver_id: &str) -> Result<Call> {
        if receiver_id == self.inner.local_user {
            return Err(Error::InvalidCallState("cannot call yourself".to_string()));
        }

        let mut busy_phase = None;
        let claimed = self.inner.snapshot.send_if_modified(|s| {
            if s.phase == CallPhase::Idle {
                *s = CallSnapshot {
                    phase: CallPhase::Calling,
                    ..CallSnapshot::default()
                };
                true
            } else {
                busy_phase = Some(s.phase);
                false
            }
        });
        if !claimed {
            return Err(Error::InvalidCallState(format!(
                "another call is in progress ({:?})",
                busy_phase.unwrap_or(CallPhase::Idle)
            )));
        }
        let generation = self.generation();

        let track = match self.inner.backends.media.capture_microphone().await {
            Ok(track) => track,
            Err(e) => {
                tracing::warn!("Microphone capture failed: {}", e);
                self.abort_attempt(generation, &e).await;
                return Err(e);
            }
        };
        if !self.is_current(generation) {
            track.stop();
            return Err(self.cancelled());
        }

        let created = self
            .inner
            .backends
            .calls
            .create_call(NewCall {
                caller_id: self.inner.local_user.clone(),
                receiver_id: receiver_id.to_string(),
                status: CallStatus::Calling,
            })
            .await;
        let call = match created {
            Ok(call) => call,
            Err(e) => {
                tracing::warn!("Failed to create call record: {}", e);
                track.stop();
                self.abort_attempt(generation, &e).await;
                return Err(e);
            }
        };

        if !self.is_current(generation) {
            track.stop();
            self.persist(&call.id, CallUpdate::ended(Utc::now())).await;
            return Err(self.cancelled());
        }
        tracing::info!("Calling {} (call {})", receiver_id, call.id);
        self.inner.snapshot.send_modify(|s| s.call = Some(call.clone()));

        match self.negotiate_as_caller(generation, &call, track).await {
            Ok(()) => Ok(call),
            Err(e) => {
                if !matches!(e, Error::CallCancelled(_)) {
                    self.fail_call(generation, Some(call.id.clone()), e.to_string())
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn negotiate_as_caller(
        &self,
        generation: u64,
        call: &Call,
        track: Arc<dyn AudioTrack>,
    ) -> Result<()> {
        let channel = SignalingChannel::new(
            &call.id,
            &self.inner.local_user,
            &call.receiver_id,
            self.inner.backends.signals.clone(),
        );

        let mut neg = self.inner.negotiation.lock().await;
        if !self.is_current(generation) {
            track.stop();
            return Err(self.cancelled());
        }
        neg.begin(generation, &call.id, Role::Caller, channel.clone());

        if let Err(e) = self.start_listener(&mut neg, generation, &channel).await {
            track.stop();
            return Err(e);
        }
        let peer = self.ensure_session(&mut neg, generation, track).await?;

        let offer = peer.create_offer().await?;
        if !self.is_current(generation) {
            return Err(self.cancelled());
        }
        if let Err(e) = channel.send_description(&offer).await {
            tracing::warn!("Failed to persist offer for call {}: {}", call.id, e);
        }
        Ok(())
    }

    // ========================================================================
    // Incoming calls
    // ========================================================================

    /// Watch call records addressed to or placed by the local user.
    pub async fn listen(&self) -> Result<JoinHandle<()>> {
        let mut feed = self
            .inner
            .backends
            .relay
            .subscribe(
                &calls_channel(&self.inner.local_user),
                Subscription::changes(CALLS_TABLE),
            )
            .await?;

        let manager = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(event) = feed.next().await {
                let RelayEvent::Change(change) = event else {
                    continue;
                };
                if change.kind == ChangeKind::Delete {
                    continue;
                }
                match change.decode::<Call>() {
                    Ok(call) if call.involves(&manager.inner.local_user) => {
                        manager.handle_call_change(call).await;
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Ignoring malformed call row: {}", e),
                }
            }
        }))
    }

    async fn handle_call_change(&self, call: Call) {
        let generation = self.generation();
        let snapshot = self.snapshot();
        let is_active = snapshot.call.as_ref().map_or(false, |c| c.id == call.id);

        if call.status.is_terminal() {
            self.inner.finished.lock().insert(call.id.clone());
            if is_active {
                tracing::info!("Call {} was {} by the other side", call.id, call.status.as_str());
                self.end_locally(generation, Some(call.status)).await;
            }
            return;
        }

        match call.status {
            CallStatus::Calling if call.receiver_id == self.inner.local_user => {
                if self.inner.finished.lock().contains(&call.id) {
                    tracing::debug!("Ignoring stale row for finished call {}", call.id);
                } else if snapshot.phase == CallPhase::Idle {
                    self.ring(call).await;
                } else if !is_active {
                    tracing::info!(
                        "Busy, ignoring call {} from {}",
                        call.id,
                        call.caller_id
                    );
                }
            }
            CallStatus::Connected if is_active && call.caller_id == self.inner.local_user => {
                tracing::info!("Call {} accepted by {}", call.id, call.receiver_id);
                self.inner.snapshot.send_modify(|s| s.call = Some(call.clone()));
                self.advance_phase(&[CallPhase::Calling], CallPhase::Connecting);
            }
            _ if is_active => {
                self.inner.snapshot.send_modify(|s| s.call = Some(call.clone()));
            }
            _ => {}
        }
    }

    async fn ring(&self, call: Call) {
        let claimed = self.inner.snapshot.send_if_modified(|s| {
            if s.phase == CallPhase::Idle && !self.inner.finished.lock().contains(&call.id) {
                *s = CallSnapshot {
                    phase: CallPhase::Ringing,
                    call: Some(call.clone()),
                    ..CallSnapshot::default()
                };
                true
            } else {
                false
            }
        });
        if !claimed {
            return;
        }
        let generation = self.generation();
        tracing::info!("Incoming call {} from {}", call.id, call.caller_id);

        let channel = SignalingChannel::new(
            &call.id,
            &self.inner.local_user,
            &call.caller_id,
            self.inner.backends.signals.clone(),
        );

        let mut neg = self.inner.negotiation.lock().await;
        if !self.is_current(generation) {
            return;
        }
        neg.begin(generation, &call.id, Role::Receiver, channel.clone());
        if let Err(e) = self.start_listener(&mut neg, generation, &channel).await {
            tracing::warn!("Signal listener for call {} unavailable: {}", call.id, e);
        }
    }

    pub async fn accept_call(&self) -> Result<()> {
        let mut incoming = None;
        let claimed = self.inner.snapshot.send_if_modified(|s| {
            if s.phase == CallPhase::Ringing {
                s.phase = CallPhase::Connecting;
                incoming = s.call.clone();
                true
            } else {
                false
            }
        });
        let call = match (claimed, incoming) {
            (true, Some(call)) => call,
            _ => return Err(Error::InvalidCallState("no incoming call to accept".to_string())),
        };
        let generation = self.generation();

        let track = match self.inner.backends.media.capture_microphone().await {
            Ok(track) => track,
            Err(e) => {
                tracing::warn!("Microphone capture failed, abandoning call {}: {}", call.id, e);
                if self.end_generation(generation) {
                    self.set_idle(None, Some(e.to_string()));
                    self.persist(&call.id, CallUpdate::ended(Utc::now())).await;
                    self.teardown(generation).await;
                }
                return Err(e);
            }
        };
        if !self.is_current(generation) {
            track.stop();
            return Err(self.cancelled());
        }

        self.persist(&call.id, CallUpdate::accepted(Utc::now())).await;

        match self.negotiate_as_receiver(generation, &call, track).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if !matches!(e, Error::CallCancelled(_)) {
                    self.fail_call(generation, Some(call.id.clone()), e.to_string())
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn negotiate_as_receiver(
        &self,
        generation: u64,
        call: &Call,
        track: Arc<dyn AudioTrack>,
    ) -> Result<()> {
        let mut neg = self.inner.negotiation.lock().await;
        if !self.is_current(generation) {
            track.stop();
            return Err(self.cancelled());
        }

        if !neg.is_for(generation, &call.id) {
            let channel = SignalingChannel::new(
                &call.id,
                &self.inner.local_user,
                &call.caller_id,
                self.inner.backends.signals.clone(),
            );
            neg.begin(generation, &call.id, Role::Receiver, channel);
        }
        if neg.listener.is_none() {
            if let Some(channel) = neg.channel.clone() {
                if let Err(e) = self.start_listener(&mut neg, generation, &channel).await {
                    track.stop();
                    return Err(e);
                }
            }
        }

        self.ensure_session(&mut neg, generation, track).await?;

        let Some(channel) = neg.channel.clone() else {
            return Err(Error::InvalidCallState("no signaling channel".to_string()));
        };
        match channel.latest(SignalKind::Offer).await {
            Ok(Some(offer)) => {
                if !neg.remote_description_set && neg.handled_signals.insert(offer.id.clone()) {
                    self.answer_offer(&mut neg, generation, &offer).await?;
                }
            }
            Ok(None) => tracing::debug!("No offer stored yet for call {}", call.id),
            Err(e) => tracing::warn!("Failed to fetch offer for call {}: {}", call.id, e),
        }
        Ok(())
    }

    pub async fn decline_call(&self) -> Result<()> {
        let generation = self.generation();
        let snapshot = self.snapshot();
        match snapshot.phase {
            CallPhase::Idle => return Ok(()),
            CallPhase::Ringing => {}
            other => {
                return Err(Error::InvalidCallState(format!(
                    "cannot decline while {:?}",
                    other
                )))
            }
        }
        if !self.end_generation(generation) {
            return Ok(());
        }

        self.set_idle(Some(CallStatus::Missed), None);
        if let Some(call) = snapshot.call {
            tracing::info!("Declined call {} from {}", call.id, call.caller_id);
            self.persist(&call.id, CallUpdate::missed(Utc::now())).await;
        }
        self.teardown(generation).await;
        Ok(())
    }

    // ========================================================================
    // Ending calls
    // ========================================================================

    /// End the current call from any non-idle phase. Calling it again is a no-op.
    pub async fn hang_up(&self) -> Result<()> {
        let generation = self.generation();
        let snapshot = self.snapshot();
        match snapshot.phase {
            CallPhase::Idle => return Ok(()),
            CallPhase::Ringing => return self.decline_call().await,
            _ => {}
        }
        if !self.end_generation(generation) {
            return Ok(());
        }

        self.set_idle(Some(CallStatus::Ended), None);
        if let Some(call) = snapshot.call {
            tracing::info!("Hanging up call {}", call.id);
            self.persist(&call.id, CallUpdate::ended(Utc::now())).await;
        }
        self.teardown(generation).await;
        Ok(())
    }

    async fn end_locally(&self, generation: u64, outcome: Option<CallStatus>) {
        if self.end_generation(generation) {
            self.set_idle(outcome, None);
            self.teardown(generation).await;
        }
    }

    async fn abort_attempt(&self, generation: u64, error: &Error) {
        if self.end_generation(generation) {
            self.set_idle(None, Some(error.to_string()));
            self.teardown(generation).await;
        }
    }

    /// Negotiation or transport failure: record the call as ended and tear down.
    async fn fail_call(&self, generation: u64, call_id: Option<CallId>, reason: String) {
        if !self.end_generation(generation) {
            return;
        }
        tracing::warn!("Call failed: {}", reason);
        self.set_idle(Some(CallStatus::Ended), Some(reason));
        if let Some(call_id) = call_id {
            self.persist(&call_id, CallUpdate::ended(Utc::now())).await;
        }
        self.teardown(generation).await;
    }

    fn spawn_failure(&self, generation: u64, reason: String) {
        let manager = self.clone();
        let call_id = self.snapshot().call.map(|c| c.id);
        tokio::spawn(async move {
            manager.fail_call(generation, call_id, reason).await;
        });
    }

    async fn persist(&self, call_id: &str, update: CallUpdate) {
        let status = update.status;
        if let Err(e) = self.inner.backends.calls.update_call(call_id, update).await {
            tracing::warn!(
                "Failed to mark call {} as {}: {}",
                call_id,
                status.as_str(),
                e
            );
        }
    }

    /// Release everything owned by `generation`'s negotiation.
    async fn teardown(&self, generation: u64) {
        let (session, listener) = {
            let mut neg = self.inner.negotiation.lock().await;
            if neg.generation != generation {
                (None, None)
            } else {
                neg.take_resources()
            }
        };

        if let Some(listener) = listener {
            listener.abort();
        }
        if let Some(session) = session {
            session.events_task.abort();
            session.local_track.stop();
            if let Some(remote) = session.remote_track {
                remote.stop();
            }
            if let Err(e) = session.peer.close().await {
                tracing::warn!("Failed to close peer connection: {}", e);
            }
        }
        self.inner.backends.audio.detach();
    }

    // ========================================================================
    // Session
    // ========================================================================

    async fn start_listener(
        &self,
        neg: &mut Negotiation,
        generation: u64,
        channel: &SignalingChannel,
    ) -> Result<()> {
        if neg.listener.is_some() {
            return Ok(());
        }
        let stream = channel
            .incoming(self.inner.backends.relay.as_ref())
            .await?;
        let manager = self.clone();
        neg.listener = Some(tokio::spawn(async move {
            manager.pump_signals(generation, stream).await;
        }));
        Ok(())
    }

    /// Create the peer connection for the current call unless one exists.
    async fn ensure_session(
        &self,
        neg: &mut Negotiation,
        generation: u64,
        track: Arc<dyn AudioTrack>,
    ) -> Result<Arc<dyn PeerConnection>> {
        if let Some(session) = &neg.session {
            if !Arc::ptr_eq(&session.local_track, &track) {
                track.stop();
            }
            return Ok(session.peer.clone());
        }
        let Some(channel) = neg.channel.clone() else {
            track.stop();
            return Err(Error::InvalidCallState("no signaling channel".to_string()));
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = match self
            .inner
            .backends
            .peers
            .create(&self.inner.ice_servers, events_tx)
            .await
        {
            Ok(peer) => peer,
            Err(e) => {
                track.stop();
                return Err(e);
            }
        };
        if let Err(e) = peer.add_track(track.clone()).await {
            track.stop();
            let _ = peer.close().await;
            return Err(e);
        }

        let muted = self.inner.snapshot.borrow().muted;
        track.set_enabled(!muted);

        let manager = self.clone();
        let events_task = tokio::spawn(async move {
            manager.pump_peer_events(generation, channel, events_rx).await;
        });

        neg.session = Some(CallSession {
            peer: peer.clone(),
            local_track: track.clone(),
            remote_track: None,
            events_task,
        });
        self.inner
            .snapshot
            .send_modify(|s| s.mic_active = track.is_live() && track.is_enabled());

        Ok(peer)
    }

    async fn pump_peer_events(
        &self,
        generation: u64,
        channel: SignalingChannel,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        while let Some(event) = events.recv().await {
            if !self.is_current(generation) {
                break;
            }
            match event {
                PeerEvent::IceCandidate(candidate) => {
                    if let Err(e) = channel.send_candidate(&candidate).await {
                        tracing::warn!(
                            "Failed to persist ICE candidate for call {}: {}",
                            channel.call_id(),
                            e
                        );
                    }
                }
                PeerEvent::RemoteTrack(track) => {
                    self.attach_remote_track(generation, track).await;
                }
                PeerEvent::StateChanged(ConnectionState::Connected) => {
                    tracing::info!("Media connected for call {}", channel.call_id());
                    self.advance_phase(
                        &[CallPhase::Calling, CallPhase::Connecting],
                        CallPhase::Connected,
                    );
                }
                PeerEvent::StateChanged(ConnectionState::Failed) => {
                    self.spawn_failure(generation, "connection failed".to_string());
                    break;
                }
                PeerEvent::StateChanged(state) => {
                    tracing::debug!("Peer connection for call {} is {:?}", channel.call_id(), state);
                }
            }
        }
    }

    async fn attach_remote_track(&self, generation: u64, track: Arc<dyn AudioTrack>) {
        {
            let mut neg = self.inner.negotiation.lock().await;
            if neg.generation != generation || !self.is_current(generation) {
                track.stop();
                return;
            }
            let Some(session) = neg.session.as_mut() else {
                track.stop();
                return;
            };
            if let Some(previous) = session.remote_track.replace(track.clone()) {
                previous.stop();
            }
        }

        self.inner.backends.audio.attach(track);
        self.play_remote_audio().await;
    }

    async fn play_remote_audio(&self) -> bool {
        match self.inner.backends.audio.play().await {
            Ok(()) => {
                self.inner
                    .snapshot
                    .send_if_modified(|s| std::mem::replace(&mut s.audio_needs_interaction, false));
                true
            }
            Err(PlaybackError::AutoplayBlocked) => {
                tracing::info!("Remote audio is waiting for user interaction");
                self.inner
                    .snapshot
                    .send_if_modified(|s| !std::mem::replace(&mut s.audio_needs_interaction, true));
                false
            }
            Err(PlaybackError::Failed(reason)) => {
                tracing::warn!("Remote audio playback failed: {}", reason);
                self.inner
                    .snapshot
                    .send_if_modified(|s| !std::mem::replace(&mut s.audio_needs_interaction, true));
                false
            }
        }
    }

    /// Retry remote playback from a user gesture. Returns whether audio is playing.
    pub async fn retry_audio(&self) -> bool {
        if !self.has_session().await {
            return false;
        }
        self.play_remote_audio().await
    }

    // ========================================================================
    // Signals
    // ========================================================================

    async fn pump_signals(&self, generation: u64, mut stream: SignalStream) {
        while let Some(signal) = stream.next().await {
            if !self.is_current(generation) {
                break;
            }
            if let Err(e) = self.handle_signal(generation, signal).await {
                match e {
                    Error::CallCancelled(_) => break,
                    e => {
                        self.spawn_failure(generation, e.to_string());
                        break;
                    }
                }
            }
        }
    }

    async fn handle_signal(&self, generation: u64, signal: Signal) -> Result<()> {
        let mut neg = self.inner.negotiation.lock().await;
        if !self.is_current(generation) || !neg.is_for(generation, &signal.call_id) {
            return Ok(());
        }
        if !neg.handled_signals.insert(signal.id.clone()) {
            return Ok(());
        }

        match signal.signal_type {
            SignalKind::Offer => {
                if neg.role != Some(Role::Receiver) || neg.remote_description_set {
                    return Ok(());
                }
                if neg.session.is_none() {
                    // Not accepted yet; acceptance reads the stored offer.
                    neg.handled_signals.remove(&signal.id);
                    return Ok(());
                }
                self.answer_offer(&mut neg, generation, &signal).await
            }
            SignalKind::Answer => {
                if neg.role != Some(Role::Caller) || neg.remote_description_set {
                    return Ok(());
                }
                let Some(peer) = neg.session.as_ref().map(|s| s.peer.clone()) else {
                    return Ok(());
                };
                let answer = description_from_signal(&signal.signal_data)?;
                peer.set_remote_description(answer).await?;
                neg.remote_description_set = true;
                self.drain_pending_ice(&mut neg, &peer).await;
                self.advance_phase(&[CallPhase::Calling], CallPhase::Connecting);
                Ok(())
            }
            SignalKind::IceCandidate => {
                let candidate = match candidate_from_signal(&signal.signal_data) {
                    Ok(candidate) => candidate,
                    Err(e) => {
                        tracing::warn!("Ignoring ICE candidate {}: {}", signal.id, e);
                        return Ok(());
                    }
                };
                let ready = neg
                    .session
                    .as_ref()
                    .filter(|_| neg.remote_description_set)
                    .map(|s| s.peer.clone());
                match ready {
                    Some(peer) => {
                        if let Err(e) = peer.add_ice_candidate(candidate).await {
                            tracing::warn!("Failed to apply ICE candidate {}: {}", signal.id, e);
                        }
                    }
                    None => neg.pending_ice.push(candidate),
                }
                Ok(())
            }
        }
    }

    async fn answer_offer(&self, neg: &mut Negotiation, generation: u64, offer: &Signal) -> Result<()> {
        let Some(peer) = neg.session.as_ref().map(|s| s.peer.clone()) else {
            return Err(Error::InvalidCallState("no peer connection".to_string()));
        };
        let Some(channel) = neg.channel.clone() else {
            return Err(Error::InvalidCallState("no signaling channel".to_string()));
        };

        let description = description_from_signal(&offer.signal_data)?;
        peer.set_remote_description(description).await?;
        neg.remote_description_set = true;
        self.drain_pending_ice(neg, &peer).await;

        let answer = peer.create_answer().await?;
        if !self.is_current(generation) {
            return Err(self.cancelled());
        }
        if let Err(e) = channel.send_description(&answer).await {
            tracing::warn!("Failed to persist answer for call {}: {}", offer.call_id, e);
        }
        Ok(())
    }

    /// Apply candidates buffered before the remote description, once each, in arrival order.
    async fn drain_pending_ice(&self, neg: &mut Negotiation, peer: &Arc<dyn PeerConnection>) {
        let pending = std::mem::take(&mut neg.pending_ice);
        if !pending.is_empty() {
            tracing::debug!("Applying {} buffered ICE candidates", pending.len());
        }
        for candidate in pending {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to apply buffered ICE candidate: {}", e);
            }
        }
    }

    // ========================================================================
    // Mute
    // ========================================================================

    /// Flip the mute flag. Outbound tracks are disabled, not removed.
    pub async fn toggle_mute(&self) -> bool {
        let mut muted = false;
        self.inner.snapshot.send_modify(|s| {
            s.muted = !s.muted;
            muted = s.muted;
        });

        let neg = self.inner.negotiation.lock().await;
        let mic_active = match &neg.session {
            Some(session) => {
                session.local_track.set_enabled(!muted);
                session.local_track.is_live() && session.local_track.is_enabled()
            }
            None => false,
        };
        drop(neg);

        self.inner.snapshot.send_modify(|s| s.mic_active = mic_active);
        muted
    }
}
