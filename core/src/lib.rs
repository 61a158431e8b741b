//! Huddle Core Library
//!
//! Realtime state for a chat client: online presence, typing indicators,
//! one-to-one voice calls and the conversation list with unread counters.
//! Provides: relay and store seams, their hosted and in-process backends,
//! and the components built on them.

pub mod call;
pub mod config;
pub mod conversations;
pub mod error;
pub mod media;
pub mod memory;
pub mod models;
pub mod presence;
pub mod realtime;
pub mod relay;
pub mod rest;
pub mod signaling;
pub mod storage;
pub mod store;
pub mod typing;

#[cfg(feature = "webrtc-rs")]
pub mod webrtc_peer;

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use call::*;
pub use config::*;
pub use conversations::*;
pub use error::*;
pub use media::*;
pub use models::*;
pub use presence::*;
pub use relay::*;
pub use signaling::*;
pub use store::*;
pub use typing::*;

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to `default_filter`.
/// Does nothing if a global subscriber is already set.
pub fn init_logging(default_filter: &str) {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Everything a client talks to outside its own process.
#[derive(Clone)]
pub struct ClientBackends {
    pub relay: Arc<dyn Relay>,
    pub calls: Arc<dyn CallStore>,
    pub signals: Arc<dyn SignalStore>,
    pub profiles: Arc<dyn ProfileStore>,
    pub messages: Arc<dyn MessageStore>,
    pub media: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub audio: Arc<dyn AudioOutput>,
}

impl ClientBackends {
    /// REST tables and the realtime websocket of the hosted backend.
    pub async fn hosted(
        config: &Config,
        media: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
        audio: Arc<dyn AudioOutput>,
    ) -> Result<Self> {
        let rest = Arc::new(rest::RestStore::new(&config.backend)?);
        if !rest.check_health().await? {
            tracing::warn!("Backend at {} did not answer the health check", config.backend.rest_url);
        }
        let relay = Arc::new(realtime::RealtimeRelay::connect(&config.backend, &config.realtime).await?);

        Ok(Self {
            relay,
            calls: rest.clone(),
            signals: rest.clone(),
            profiles: rest.clone(),
            messages: rest,
            media,
            peers,
            audio,
        })
    }
}

/// Main client instance
pub struct ChatClient {
    user_id: UserId,
    backends: ClientBackends,
    presence: Arc<PresenceTracker>,
    activity: ActivityObserver,
    typing: TypingNotifier,
    typing_registry: Arc<TypingRegistry>,
    calls: CallManager,
    conversations: Arc<ConversationAggregator>,
    tick_interval: std::time::Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatClient {
    pub fn new(user_id: &str, username: &str, config: &Config, backends: ClientBackends) -> Self {
        let presence = Arc::new(PresenceTracker::new(config.presence.online_threshold()));
        let activity = ActivityObserver::new(
            user_id,
            config.presence.online_threshold(),
            backends.profiles.clone(),
            backends.relay.clone(),
        )
        .with_tracker(presence.clone());

        let typing = TypingNotifier::new(
            user_id,
            username,
            backends.relay.clone(),
            config.typing.clone(),
        );
        let typing_registry = Arc::new(TypingRegistry::new(user_id, config.typing.expiry()));

        let calls = CallManager::new(
            user_id,
            &config.calls,
            CallBackends {
                calls: backends.calls.clone(),
                signals: backends.signals.clone(),
                relay: backends.relay.clone(),
                media: backends.media.clone(),
                peers: backends.peers.clone(),
                audio: backends.audio.clone(),
            },
        );

        let conversations = Arc::new(
            ConversationAggregator::new(user_id, backends.messages.clone())
                .with_profiles(backends.profiles.clone()),
        );

        Self {
            user_id: user_id.to_string(),
            backends,
            presence,
            activity,
            typing,
            typing_registry,
            calls,
            conversations,
            tick_interval: config.presence.tick_interval(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn activity(&self) -> &ActivityObserver {
        &self.activity
    }

    pub fn typing(&self) -> &TypingNotifier {
        &self.typing
    }

    pub fn typing_registry(&self) -> &Arc<TypingRegistry> {
        &self.typing_registry
    }

    pub fn calls(&self) -> &CallManager {
        &self.calls
    }

    pub fn conversations(&self) -> &Arc<ConversationAggregator> {
        &self.conversations
    }

    /// Subscribe to every relay channel, start the presence tick and load conversations.
    pub async fn start(&self) -> Result<()> {
        let relay = self.backends.relay.clone();
        let mut tasks = vec![
            self.presence.listen(relay.clone(), &self.user_id).await?,
            self.presence.spawn_ticker(self.tick_interval),
            self.typing_registry.listen(relay.clone()).await?,
            self.calls.listen().await?,
            self.conversations.listen(relay).await?,
            self.conversations.follow_typing(self.typing_registry.clone()),
        ];

        if let Err(e) = self.conversations.load().await {
            tracing::warn!("Failed to load conversations: {}", e);
        }
        self.activity.record_activity().await;

        self.tasks.lock().append(&mut tasks);
        tracing::info!("Client for {} started", self.user_id);
        Ok(())
    }

    /// End any call, announce typing stops and cancel every listener.
    pub async fn shutdown(&self) {
        if let Err(e) = self.calls.hang_up().await {
            tracing::warn!("Failed to hang up during shutdown: {}", e);
        }
        self.typing.shutdown().await;
        self.typing_registry.clear();
        self.conversations.close_conversation();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        tracing::info!("Client for {} shut down", self.user_id);
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
