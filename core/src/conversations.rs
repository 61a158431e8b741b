//! Conversation list and unread counters
//!
//! Summaries are kept most-recent first. The total unread count always equals
//! the sum of the per-conversation counts: both change under the same lock.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::models::*;
use crate::relay::*;
use crate::store::{MessageStore, ProfileStore};
use crate::typing::{TypingRegistry, TypingScope};

#[derive(Default)]
struct State {
    summaries: Vec<ConversationSummary>,
    total_unread: u32,
    open_peer: Option<UserId>,
    hidden: HashMap<UserId, DateTime<Utc>>,
    seen: HashSet<String>,
}

impl State {
    fn position(&self, peer_id: &str) -> Option<usize> {
        self.summaries.iter().position(|s| s.peer_id == peer_id)
    }

    fn is_hidden(&self, message: &PrivateMessage, peer_id: &str) -> bool {
        self.hidden
            .get(peer_id)
            .map_or(false, |cutoff| message.created_at <= *cutoff)
    }

    /// Fold one message into the summaries. Returns true when the peer's summary is new.
    fn apply(&mut self, local_user: &str, message: &PrivateMessage) -> bool {
        let peer_id = message.counterpart(local_user).to_string();
        let counts_unread = message.receiver_id == local_user
            && !message.read
            && self.open_peer.as_deref() != Some(peer_id.as_str());

        let (index, created) = match self.position(&peer_id) {
            Some(index) => (index, false),
            None => {
                self.summaries.push(ConversationSummary::new(&peer_id));
                (self.summaries.len() - 1, true)
            }
        };

        let summary = &mut self.summaries[index];
        if summary
            .last_message_time
            .map_or(true, |at| message.created_at >= at)
        {
            summary.last_message = Some(message.preview());
            summary.last_message_time = Some(message.created_at);
        }
        if counts_unread {
            summary.unread_count += 1;
            self.total_unread += 1;
        }

        self.sort();
        created
    }

    fn clear_unread(&mut self, peer_id: &str) -> u32 {
        let Some(index) = self.position(peer_id) else {
            return 0;
        };
        let cleared = std::mem::take(&mut self.summaries[index].unread_count);
        self.total_unread = self.total_unread.saturating_sub(cleared);
        cleared
    }

    fn remove(&mut self, peer_id: &str) {
        if let Some(index) = self.position(peer_id) {
            let summary = self.summaries.remove(index);
            self.total_unread = self.total_unread.saturating_sub(summary.unread_count);
        }
    }

    fn sort(&mut self) {
        // Stable: ties keep their current order.
        self.summaries
            .sort_by(|a, b| b.last_message_time.cmp(&a.last_message_time));
    }
}

pub struct ConversationAggregator {
    local_user: UserId,
    store: Arc<dyn MessageStore>,
    profiles: Option<Arc<dyn ProfileStore>>,
    state: Mutex<State>,
    version: watch::Sender<u64>,
}

impl ConversationAggregator {
    pub fn new(local_user: &str, store: Arc<dyn MessageStore>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            local_user: local_user.to_string(),
            store,
            profiles: None,
            state: Mutex::new(State::default()),
            version,
        }
    }

    /// Fill in peer names, colors and avatars from profiles.
    pub fn with_profiles(mut self, profiles: Arc<dyn ProfileStore>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn summaries(&self) -> Vec<ConversationSummary> {
        self.state.lock().summaries.clone()
    }

    pub fn summary(&self, peer_id: &str) -> Option<ConversationSummary> {
        let state = self.state.lock();
        state.position(peer_id).map(|i| state.summaries[i].clone())
    }

    pub fn total_unread(&self) -> u32 {
        self.state.lock().total_unread
    }

    pub fn open_peer(&self) -> Option<UserId> {
        self.state.lock().open_peer.clone()
    }

    /// Bumped on every change to the list or the counters.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn notify(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    /// Rebuild every summary from the store.
    pub async fn load(&self) -> Result<()> {
        let hidden = self.store.hidden_conversations(&self.local_user).await?;
        let messages = self.store.messages_involving(&self.local_user).await?;

        let peers: Vec<UserId> = {
            let mut state = self.state.lock();
            let open_peer = state.open_peer.take();
            *state = State {
                open_peer,
                hidden: hidden
                    .into_iter()
                    .map(|h| (h.hidden_user_id, h.created_at))
                    .collect(),
                ..State::default()
            };

            for message in &messages {
                let peer_id = message.counterpart(&self.local_user).to_string();
                if state.is_hidden(message, &peer_id) {
                    continue;
                }
                state.seen.insert(message.id.clone());
                state.apply(&self.local_user, message);
            }
            state.summaries.iter().map(|s| s.peer_id.clone()).collect()
        };

        tracing::info!(
            "Loaded {} conversations for {}",
            peers.len(),
            self.local_user
        );
        self.notify();

        for peer_id in peers {
            self.enrich(&peer_id).await;
        }
        Ok(())
    }

    /// Fold in a sent or received message. Returns false if it was ignored.
    pub async fn record_message(&self, message: PrivateMessage) -> bool {
        if message.receiver_id == self.local_user {
            self.record_incoming(message).await
        } else {
            self.record_outgoing(message).await
        }
    }

    /// A message from a peer. Counts as unread unless its conversation is open.
    pub async fn record_incoming(&self, message: PrivateMessage) -> bool {
        if message.receiver_id != self.local_user {
            return false;
        }
        self.record(message).await
    }

    /// A message the local user sent. Never changes the unread counts.
    pub async fn record_outgoing(&self, message: PrivateMessage) -> bool {
        if message.sender_id != self.local_user {
            return false;
        }
        self.record(message).await
    }

    async fn record(&self, message: PrivateMessage) -> bool {
        let peer_id = message.counterpart(&self.local_user).to_string();
        let incoming = message.receiver_id == self.local_user;

        let (created, is_open) = {
            let mut state = self.state.lock();
            if state.is_hidden(&message, &peer_id) || !state.seen.insert(message.id.clone()) {
                return false;
            }
            let created = state.apply(&self.local_user, &message);
            (created, state.open_peer.as_deref() == Some(peer_id.as_str()))
        };
        self.notify();

        if incoming && is_open {
            if let Err(e) = self.store.mark_read(&self.local_user, &peer_id).await {
                tracing::warn!("Failed to mark messages from {} read: {}", peer_id, e);
            }
        }
        if created {
            self.enrich(&peer_id).await;
        }
        true
    }

    /// Make `peer_id` the open conversation, clear its unread count and return its history.
    pub async fn open_conversation(&self, peer_id: &str) -> Result<Vec<PrivateMessage>> {
        let cutoff = {
            let mut state = self.state.lock();
            state.open_peer = Some(peer_id.to_string());
            state.clear_unread(peer_id);
            state.hidden.get(peer_id).copied()
        };
        self.notify();

        if let Err(e) = self.store.mark_read(&self.local_user, peer_id).await {
            tracing::warn!("Failed to mark messages from {} read: {}", peer_id, e);
        }
        self.store.history(&self.local_user, peer_id, cutoff).await
    }

    pub fn close_conversation(&self) {
        let closed = self.state.lock().open_peer.take();
        if closed.is_some() {
            self.notify();
        }
    }

    /// Hide the conversation for the local user only. Later messages bring it back.
    pub async fn hide_conversation(&self, peer_id: &str) -> Result<()> {
        let hidden = self
            .store
            .hide_conversation(&self.local_user, peer_id, Utc::now())
            .await?;

        {
            let mut state = self.state.lock();
            state.hidden.insert(peer_id.to_string(), hidden.created_at);
            state.remove(peer_id);
            if state.open_peer.as_deref() == Some(peer_id) {
                state.open_peer = None;
            }
        }
        tracing::info!("Hid conversation with {}", peer_id);
        self.notify();
        Ok(())
    }

    pub fn set_typing(&self, peer_id: &str, typing: bool) {
        let changed = {
            let mut state = self.state.lock();
            match state.position(peer_id) {
                Some(i) if state.summaries[i].is_typing != typing => {
                    state.summaries[i].is_typing = typing;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.notify();
        }
    }

    /// Copy private typing state from `registry` onto the summaries.
    pub fn sync_typing(&self, registry: &TypingRegistry) {
        let peers: Vec<UserId> = self
            .state
            .lock()
            .summaries
            .iter()
            .map(|s| s.peer_id.clone())
            .collect();
        for peer_id in peers {
            let typing = registry.is_typing(&TypingScope::Private(peer_id.clone()), &peer_id);
            self.set_typing(&peer_id, typing);
        }
    }

    pub fn follow_typing(self: &Arc<Self>, registry: Arc<TypingRegistry>) -> JoinHandle<()> {
        let aggregator = self.clone();
        let mut changes = registry.subscribe();
        tokio::spawn(async move {
            aggregator.sync_typing(&registry);
            while changes.changed().await.is_ok() {
                aggregator.sync_typing(&registry);
            }
        })
    }

    /// Follow message inserts for the local user.
    pub async fn listen(self: &Arc<Self>, relay: Arc<dyn Relay>) -> Result<JoinHandle<()>> {
        let mut feed = relay
            .subscribe(
                &messages_channel(&self.local_user),
                Subscription::changes(MESSAGES_TABLE),
            )
            .await?;

        let aggregator = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(event) = feed.next().await {
                let RelayEvent::Change(change) = event else {
                    continue;
                };
                if change.kind != ChangeKind::Insert {
                    continue;
                }
                match change.decode::<PrivateMessage>() {
                    Ok(message) => {
                        aggregator.record_message(message).await;
                    }
                    Err(e) => tracing::warn!("Ignoring malformed message row: {}", e),
                }
            }
        }))
    }

    async fn enrich(&self, peer_id: &str) {
        let Some(profiles) = &self.profiles else {
            return;
        };
        let profile = match profiles.get_profile(peer_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!("No profile for {}: {}", peer_id, e);
                return;
            }
        };

        {
            let mut state = self.state.lock();
            let Some(i) = state.position(peer_id) else {
                return;
            };
            let summary = &mut state.summaries[i];
            summary.peer_name = Some(profile.username);
            summary.peer_color = profile.color;
            summary.peer_avatar = profile.avatar_url;
        }
        self.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRelay;
    use crate::storage::SqliteStore;
    use chrono::Duration;
    use serde_json::json;

    fn msg(id: &str, from: &str, to: &str, text: &str, at: DateTime<Utc>) -> PrivateMessage {
        PrivateMessage {
            id: id.to_string(),
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            message: Some(text.to_string()),
            image_url: None,
            created_at: at,
            read: false,
        }
    }

    fn unread_sum(aggregator: &ConversationAggregator) -> u32 {
        aggregator.summaries().iter().map(|s| s.unread_count).sum()
    }

    fn setup() -> (Arc<SqliteStore>, Arc<ConversationAggregator>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let aggregator = Arc::new(ConversationAggregator::new("bob", store.clone()));
        (store, aggregator)
    }

    #[tokio::test]
    async fn test_incoming_message_counts_then_clears_on_open() {
        let (store, aggregator) = setup();
        let hello = msg("m1", "alice", "bob", "hello", Utc::now());
        store.save_message(&hello).await.unwrap();

        assert!(aggregator.record_message(hello).await);

        let summary = aggregator.summary("alice").unwrap();
        assert_eq!(summary.unread_count, 1);
        assert_eq!(summary.last_message.as_deref(), Some("hello"));
        assert_eq!(aggregator.total_unread(), 1);

        let history = aggregator.open_conversation("alice").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(aggregator.summary("alice").unwrap().unread_count, 0);
        assert_eq!(aggregator.total_unread(), 0);
        assert!(store.history("bob", "alice", None).await.unwrap()[0].read);
    }

    #[tokio::test]
    async fn test_open_conversation_does_not_count() {
        let (store, aggregator) = setup();
        aggregator.open_conversation("alice").await.unwrap();

        let m = msg("m1", "alice", "bob", "hi", Utc::now());
        store.save_message(&m).await.unwrap();
        aggregator.record_message(m).await;

        assert_eq!(aggregator.summary("alice").unwrap().unread_count, 0);
        assert_eq!(aggregator.total_unread(), 0);
        assert!(store.history("bob", "alice", None).await.unwrap()[0].read);

        aggregator.close_conversation();
        aggregator
            .record_message(msg("m2", "alice", "bob", "there?", Utc::now()))
            .await;
        assert_eq!(aggregator.total_unread(), 1);
    }

    #[tokio::test]
    async fn test_direction_is_checked() {
        let (_store, aggregator) = setup();
        let now = Utc::now();

        assert!(!aggregator.record_incoming(msg("1", "bob", "alice", "a", now)).await);
        assert!(!aggregator.record_outgoing(msg("2", "alice", "bob", "b", now)).await);
        assert!(!aggregator.record_message(msg("3", "alice", "carol", "c", now)).await);
        assert!(aggregator.summaries().is_empty());

        assert!(aggregator.record_outgoing(msg("4", "bob", "alice", "d", now)).await);
        assert_eq!(aggregator.summary("alice").unwrap().unread_count, 0);
        assert!(aggregator.record_incoming(msg("5", "alice", "bob", "e", now)).await);
        assert_eq!(aggregator.total_unread(), 1);
    }

    #[tokio::test]
    async fn test_total_matches_sum_of_counts() {
        let (_store, aggregator) = setup();
        let now = Utc::now();

        aggregator.record_message(msg("1", "alice", "bob", "a", now)).await;
        aggregator
            .record_message(msg("2", "carol", "bob", "b", now + Duration::seconds(1)))
            .await;
        aggregator
            .record_message(msg("3", "alice", "bob", "c", now + Duration::seconds(2)))
            .await;
        aggregator
            .record_message(msg("4", "bob", "carol", "d", now + Duration::seconds(3)))
            .await;
        // Duplicate delivery
        aggregator.record_message(msg("3", "alice", "bob", "c", now)).await;

        assert_eq!(aggregator.total_unread(), 3);
        assert_eq!(aggregator.total_unread(), unread_sum(&aggregator));

        aggregator.open_conversation("alice").await.unwrap();
        assert_eq!(aggregator.total_unread(), 1);
        assert_eq!(aggregator.total_unread(), unread_sum(&aggregator));
    }

    #[tokio::test]
    async fn test_most_recent_first() {
        let (_store, aggregator) = setup();
        let now = Utc::now();

        aggregator.record_message(msg("1", "alice", "bob", "a", now)).await;
        aggregator
            .record_message(msg("2", "carol", "bob", "b", now + Duration::seconds(1)))
            .await;
        let order: Vec<_> = aggregator.summaries().into_iter().map(|s| s.peer_id).collect();
        assert_eq!(order, vec!["carol", "alice"]);

        aggregator
            .record_message(msg("3", "bob", "alice", "c", now + Duration::seconds(2)))
            .await;
        let first = &aggregator.summaries()[0];
        assert_eq!(first.peer_id, "alice");
        assert_eq!(first.last_message.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_hide_uses_cutoff() {
        let (store, aggregator) = setup();
        let before = Utc::now() - Duration::minutes(1);
        let old = msg("1", "alice", "bob", "old", before);
        store.save_message(&old).await.unwrap();
        aggregator.record_message(old).await;

        aggregator.hide_conversation("alice").await.unwrap();
        assert!(aggregator.summary("alice").is_none());
        assert_eq!(aggregator.total_unread(), 0);

        let fresh = msg("2", "alice", "bob", "new", Utc::now() + Duration::seconds(1));
        store.save_message(&fresh).await.unwrap();
        aggregator.record_message(fresh).await;

        let history = aggregator.open_conversation("alice").await.unwrap();
        assert_eq!(history.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), vec!["2"]);

        aggregator.load().await.unwrap();
        assert_eq!(aggregator.summary("alice").unwrap().last_message.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_load_rebuilds_from_store() {
        let (store, _) = setup();
        let now = Utc::now();
        store.save_message(&msg("1", "alice", "bob", "a", now)).await.unwrap();
        store
            .save_message(&msg("2", "alice", "bob", "b", now + Duration::seconds(1)))
            .await
            .unwrap();
        let mut read = msg("3", "carol", "bob", "c", now + Duration::seconds(2));
        read.read = true;
        store.save_message(&read).await.unwrap();
        store.save_profile(&Profile {
            id: "alice".to_string(),
            username: "Alice".to_string(),
            color: Some("#ff0000".to_string()),
            avatar_url: None,
            last_seen: None,
        })
        .unwrap();

        let aggregator = Arc::new(
            ConversationAggregator::new("bob", store.clone()).with_profiles(store.clone()),
        );
        aggregator.load().await.unwrap();
        drop(store);

        assert_eq!(aggregator.total_unread(), 2);
        let alice = aggregator.summary("alice").unwrap();
        assert_eq!(alice.unread_count, 2);
        assert_eq!(alice.peer_name.as_deref(), Some("Alice"));
        assert_eq!(aggregator.summaries()[0].peer_id, "carol");
    }

    #[tokio::test]
    async fn test_listen_follows_inserts() {
        let (_store, aggregator) = setup();
        let relay = Arc::new(MemoryRelay::new());
        relay.set_duplicate_delivery(true);
        let _task = aggregator.listen(relay.clone()).await.unwrap();
        let mut version = aggregator.subscribe();

        relay.publish_change(RowChange {
            kind: ChangeKind::Insert,
            table: MESSAGES_TABLE.to_string(),
            record: json!({
                "id": "m1",
                "sender_id": "alice",
                "receiver_id": "bob",
                "message": null,
                "image_url": "https://cdn/x.png",
                "created_at": Utc::now(),
            }),
            old_record: None,
        });
        relay.publish_change(RowChange {
            kind: ChangeKind::Insert,
            table: MESSAGES_TABLE.to_string(),
            record: json!({
                "id": "m2",
                "sender_id": "alice",
                "receiver_id": "carol",
                "message": "not for bob",
                "created_at": Utc::now(),
            }),
            old_record: None,
        });

        version.changed().await.unwrap();
        tokio::task::yield_now().await;
        let summary = aggregator.summary("alice").unwrap();
        assert_eq!(summary.last_message.as_deref(), Some(IMAGE_PREVIEW));
        assert_eq!(aggregator.total_unread(), 1);
        assert!(aggregator.summary("carol").is_none());
    }
}
