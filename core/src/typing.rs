//! Typing indicators for the public feed and private conversations
//!
//! Senders broadcast `typing` on the first keystroke, repeat it on a fixed
//! interval while input continues and broadcast `stop_typing` on blur, send or
//! inactivity. Receivers keep an entry per (scope, sender) that expires on its
//! own unless refreshed, so a lost `stop_typing` only delays removal.

use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::TypingConfig;
use crate::error::Result;
use crate::models::UserId;
use crate::relay::*;

pub const TYPING_EVENT: &str = "typing";
pub const STOP_TYPING_EVENT: &str = "stop_typing";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypingScope {
    /// The shared public feed
    Public,
    /// The private conversation with this user
    Private(UserId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicTypingPayload {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateTypingPayload {
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    pub receiver_id: UserId,
}

// ============================================================================
// Sender side
// ============================================================================

struct Broadcaster {
    user_id: UserId,
    username: String,
    relay: Arc<dyn Relay>,
}

impl Broadcaster {
    async fn send(&self, scope: &TypingScope, event: &str) {
        let (channel, payload) = match scope {
            TypingScope::Public => (
                PUBLIC_TYPING_CHANNEL,
                serde_json::to_value(PublicTypingPayload {
                    user_id: self.user_id.clone(),
                    username: self.username.clone(),
                }),
            ),
            TypingScope::Private(peer) => (
                PRIVATE_TYPING_CHANNEL,
                serde_json::to_value(PrivateTypingPayload {
                    sender_id: self.user_id.clone(),
                    sender_username: (event == TYPING_EVENT).then(|| self.username.clone()),
                    receiver_id: peer.clone(),
                }),
            ),
        };

        let result = match payload {
            Ok(payload) => self.relay.broadcast(channel, event, payload).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            tracing::warn!("Failed to broadcast {} on {}: {}", event, channel, e);
        }
    }
}

struct TypingSession {
    id: u64,
    last_keystroke: Arc<Mutex<Instant>>,
    task: Option<JoinHandle<()>>,
}

impl Drop for TypingSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

type Sessions = Arc<Mutex<HashMap<TypingScope, TypingSession>>>;

/// Owns one broadcast loop per scope the local user is typing in.
pub struct TypingNotifier {
    broadcaster: Arc<Broadcaster>,
    config: TypingConfig,
    sessions: Sessions,
    next_session: AtomicU64,
}

impl TypingNotifier {
    pub fn new(user_id: &str, username: &str, relay: Arc<dyn Relay>, config: TypingConfig) -> Self {
        Self {
            broadcaster: Arc::new(Broadcaster {
                user_id: user_id.to_string(),
                username: username.to_string(),
                relay,
            }),
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_session: AtomicU64::new(1),
        }
    }

    /// Call on every keystroke in `scope`.
    pub fn keystroke(&self, scope: TypingScope) {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get(&scope) {
            *session.last_keystroke.lock() = Instant::now();
            return;
        }

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let last_keystroke = Arc::new(Mutex::new(Instant::now()));
        let task = tokio::spawn(run_session(
            id,
            scope.clone(),
            self.broadcaster.clone(),
            last_keystroke.clone(),
            self.config.clone(),
            self.sessions.clone(),
        ));

        sessions.insert(
            scope,
            TypingSession {
                id,
                last_keystroke,
                task: Some(task),
            },
        );
    }

    /// Call on blur or send.
    pub async fn stop(&self, scope: &TypingScope) {
        let session = self.sessions.lock().remove(scope);
        if session.is_some() {
            drop(session);
            self.broadcaster.send(scope, STOP_TYPING_EVENT).await;
        }
    }

    pub fn is_active(&self, scope: &TypingScope) -> bool {
        self.sessions.lock().contains_key(scope)
    }

    /// Cancel every broadcast loop and announce the stop in each scope.
    pub async fn shutdown(&self) {
        let scopes: Vec<TypingScope> = {
            let mut sessions = self.sessions.lock();
            sessions.drain().map(|(scope, _)| scope).collect()
        };
        for scope in scopes {
            self.broadcaster.send(&scope, STOP_TYPING_EVENT).await;
        }
    }
}

impl Drop for TypingNotifier {
    fn drop(&mut self) {
        self.sessions.lock().clear();
    }
}

async fn run_session(
    id: u64,
    scope: TypingScope,
    broadcaster: Arc<Broadcaster>,
    last_keystroke: Arc<Mutex<Instant>>,
    config: TypingConfig,
    sessions: Sessions,
) {
    let inactivity = config.inactivity_timeout();
    // First tick fires immediately: the initial broadcast.
    let mut ticker = tokio::time::interval(config.broadcast_interval());

    loop {
        let deadline = *last_keystroke.lock() + inactivity;
        tokio::select! {
            _ = ticker.tick() => {
                broadcaster.send(&scope, TYPING_EVENT).await;
            }
            _ = tokio::time::sleep_until(deadline) => {
                if Instant::now() < *last_keystroke.lock() + inactivity {
                    continue;
                }
                {
                    let mut sessions = sessions.lock();
                    if sessions.get(&scope).map(|s| s.id) == Some(id) {
                        if let Some(mut session) = sessions.remove(&scope) {
                            // Detach rather than abort: this task is the session.
                            session.task.take();
                        }
                    }
                }
                broadcaster.send(&scope, STOP_TYPING_EVENT).await;
                break;
            }
        }
    }
}

// ============================================================================
// Receiver side
// ============================================================================

struct TypingEntry {
    id: u64,
    display_name: String,
    timer: JoinHandle<()>,
}

impl Drop for TypingEntry {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

type Entries = Arc<Mutex<HashMap<TypingScope, HashMap<UserId, TypingEntry>>>>;

/// Who is typing where, as seen by the local user.
pub struct TypingRegistry {
    local_user: UserId,
    expiry: Duration,
    entries: Entries,
    version: Arc<watch::Sender<u64>>,
    next_entry: AtomicU64,
}

impl TypingRegistry {
    pub fn new(local_user: &str, expiry: Duration) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            local_user: local_user.to_string(),
            expiry,
            entries: Arc::new(Mutex::new(HashMap::new())),
            version: Arc::new(version),
            next_entry: AtomicU64::new(1),
        }
    }

    /// Insert or refresh an entry; it expires after the configured window unless refreshed again.
    pub fn on_typing(&self, scope: TypingScope, sender_id: &str, display_name: &str) {
        let id = self.next_entry.fetch_add(1, Ordering::Relaxed);
        let timer = {
            let entries = self.entries.clone();
            let version = self.version.clone();
            let scope = scope.clone();
            let sender = sender_id.to_string();
            let expiry = self.expiry;
            tokio::spawn(async move {
                tokio::time::sleep(expiry).await;
                let removed = {
                    let mut entries = entries.lock();
                    remove_entry(&mut entries, &scope, &sender, Some(id))
                };
                if let Some(entry) = removed {
                    // Dropping aborts this timer; there is no await left.
                    drop(entry);
                    version.send_modify(|v| *v += 1);
                }
            })
        };

        let previous = self.entries.lock().entry(scope).or_default().insert(
            sender_id.to_string(),
            TypingEntry {
                id,
                display_name: display_name.to_string(),
                timer,
            },
        );
        if previous.is_none() {
            self.version.send_modify(|v| *v += 1);
        }
    }

    pub fn on_stop(&self, scope: &TypingScope, sender_id: &str) {
        let removed = remove_entry(&mut self.entries.lock(), scope, sender_id, None);
        if removed.is_some() {
            self.version.send_modify(|v| *v += 1);
        }
    }

    /// (user id, display name) pairs typing in `scope`, ordered by name.
    pub fn typing_users(&self, scope: &TypingScope) -> Vec<(UserId, String)> {
        let entries = self.entries.lock();
        let mut users: Vec<(UserId, String)> = entries
            .get(scope)
            .map(|users| {
                users
                    .iter()
                    .map(|(id, entry)| (id.clone(), entry.display_name.clone()))
                    .collect()
            })
            .unwrap_or_default();
        users.sort_by(|a, b| a.1.cmp(&b.1));
        users
    }

    pub fn is_typing(&self, scope: &TypingScope, user_id: &str) -> bool {
        self.entries
            .lock()
            .get(scope)
            .map_or(false, |users| users.contains_key(user_id))
    }

    /// Bumped whenever an entry appears or disappears.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn clear(&self) {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        if !drained.is_empty() {
            drop(drained);
            self.version.send_modify(|v| *v += 1);
        }
    }

    pub async fn listen(self: &Arc<Self>, relay: Arc<dyn Relay>) -> Result<JoinHandle<()>> {
        let public = relay
            .subscribe(PUBLIC_TYPING_CHANNEL, Subscription::Broadcast)
            .await?
            .map(|event| (false, event));
        let private = relay
            .subscribe(PRIVATE_TYPING_CHANNEL, Subscription::Broadcast)
            .await?
            .map(|event| (true, event));

        let registry = self.clone();
        Ok(tokio::spawn(async move {
            let mut events = futures::stream::select(public, private);
            while let Some((is_private, event)) = events.next().await {
                if let RelayEvent::Broadcast { event, payload } = event {
                    registry.handle_broadcast(is_private, &event, payload);
                }
            }
        }))
    }

    fn handle_broadcast(&self, is_private: bool, event: &str, payload: serde_json::Value) {
        let typing = match event {
            TYPING_EVENT => true,
            STOP_TYPING_EVENT => false,
            _ => return,
        };

        let (scope, sender, name) = if is_private {
            match serde_json::from_value::<PrivateTypingPayload>(payload) {
                Ok(p) => {
                    if p.receiver_id != self.local_user {
                        return;
                    }
                    let name = p.sender_username.unwrap_or_else(|| p.sender_id.clone());
                    (TypingScope::Private(p.sender_id.clone()), p.sender_id, name)
                }
                Err(e) => {
                    tracing::warn!("Ignoring malformed private typing event: {}", e);
                    return;
                }
            }
        } else {
            match serde_json::from_value::<PublicTypingPayload>(payload) {
                Ok(p) => (TypingScope::Public, p.user_id, p.username),
                Err(e) => {
                    tracing::warn!("Ignoring malformed public typing event: {}", e);
                    return;
                }
            }
        };

        if sender == self.local_user {
            return;
        }

        if typing {
            self.on_typing(scope, &sender, &name);
        } else {
            self.on_stop(&scope, &sender);
        }
    }
}

impl Drop for TypingRegistry {
    fn drop(&mut self) {
        self.entries.lock().clear();
    }
}

fn remove_entry(
    entries: &mut HashMap<TypingScope, HashMap<UserId, TypingEntry>>,
    scope: &TypingScope,
    sender_id: &str,
    only_id: Option<u64>,
) -> Option<TypingEntry> {
    let users = entries.get_mut(scope)?;
    if let Some(id) = only_id {
        if users.get(sender_id).map(|e| e.id) != Some(id) {
            return None;
        }
    }
    let removed = users.remove(sender_id);
    if users.is_empty() {
        entries.remove(scope);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRelay;
    use futures::FutureExt;

    fn drain(stream: &mut RelayStream) -> Vec<String> {
        let mut events = Vec::new();
        while let Some(Some(event)) = stream.next().now_or_never() {
            if let RelayEvent::Broadcast { event, .. } = event {
                events.push(event);
            }
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_repeats_then_stops_on_inactivity() {
        let relay = Arc::new(MemoryRelay::new());
        let mut feed = relay
            .subscribe(PUBLIC_TYPING_CHANNEL, Subscription::Broadcast)
            .await
            .unwrap();
        let notifier = TypingNotifier::new("alice", "Alice", relay.clone(), TypingConfig::default());

        notifier.keystroke(TypingScope::Public);
        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(drain(&mut feed), vec![TYPING_EVENT, TYPING_EVENT]);
        assert!(notifier.is_active(&TypingScope::Public));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(drain(&mut feed), vec![STOP_TYPING_EVENT]);
        assert!(!notifier.is_active(&TypingScope::Public));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(drain(&mut feed).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keystrokes_extend_session() {
        let relay = Arc::new(MemoryRelay::new());
        let mut feed = relay
            .subscribe(PRIVATE_TYPING_CHANNEL, Subscription::Broadcast)
            .await
            .unwrap();
        let notifier = TypingNotifier::new("alice", "Alice", relay.clone(), TypingConfig::default());
        let scope = TypingScope::Private("bob".to_string());

        notifier.keystroke(scope.clone());
        tokio::time::sleep(Duration::from_millis(1000)).await;
        notifier.keystroke(scope.clone());
        tokio::time::sleep(Duration::from_millis(900)).await;
        notifier.keystroke(scope.clone());
        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert!(notifier.is_active(&scope));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            drain(&mut feed),
            vec![TYPING_EVENT, TYPING_EVENT, TYPING_EVENT, STOP_TYPING_EVENT]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_stop_cancels_loop() {
        let relay = Arc::new(MemoryRelay::new());
        let mut feed = relay
            .subscribe(PRIVATE_TYPING_CHANNEL, Subscription::Broadcast)
            .await
            .unwrap();
        let notifier = TypingNotifier::new("alice", "Alice", relay.clone(), TypingConfig::default());
        let scope = TypingScope::Private("bob".to_string());

        notifier.keystroke(scope.clone());
        tokio::task::yield_now().await;
        notifier.stop(&scope).await;
        notifier.stop(&scope).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(drain(&mut feed), vec![TYPING_EVENT, STOP_TYPING_EVENT]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_entry_expires_without_refresh() {
        let registry = TypingRegistry::new("bob", Duration::from_millis(2500));
        let scope = TypingScope::Public;

        registry.on_typing(scope.clone(), "alice", "Alice");
        tokio::time::sleep(Duration::from_millis(2000)).await;
        registry.on_typing(scope.clone(), "alice", "Alice");
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert!(registry.is_typing(&scope, "alice"));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!registry.is_typing(&scope, "alice"));
        assert!(registry.typing_users(&scope).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_stop_removes_immediately() {
        let registry = TypingRegistry::new("bob", Duration::from_millis(2500));
        let scope = TypingScope::Private("alice".to_string());
        let version = registry.subscribe();

        registry.on_typing(scope.clone(), "alice", "Alice");
        registry.on_typing(TypingScope::Public, "carol", "Carol");
        registry.on_stop(&scope, "alice");

        assert!(!registry.is_typing(&scope, "alice"));
        assert_eq!(
            registry.typing_users(&TypingScope::Public),
            vec![("carol".to_string(), "Carol".to_string())]
        );
        assert_eq!(*version.borrow(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_filters_private_events() {
        let relay = Arc::new(MemoryRelay::new());
        let registry = Arc::new(TypingRegistry::new("bob", Duration::from_millis(2500)));
        let handle = registry.listen(relay.clone()).await.unwrap();

        let alice = TypingNotifier::new("alice", "Alice", relay.clone(), TypingConfig::default());
        let bob = TypingNotifier::new("bob", "Bob", relay.clone(), TypingConfig::default());
        alice.keystroke(TypingScope::Private("bob".to_string()));
        alice.keystroke(TypingScope::Private("carol".to_string()));
        bob.keystroke(TypingScope::Public);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            registry.typing_users(&TypingScope::Private("alice".to_string())),
            vec![("alice".to_string(), "Alice".to_string())]
        );
        assert!(registry.typing_users(&TypingScope::Public).is_empty());

        alice.stop(&TypingScope::Private("bob".to_string())).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!registry.is_typing(&TypingScope::Private("alice".to_string()), "alice"));
        handle.abort();
    }
}
