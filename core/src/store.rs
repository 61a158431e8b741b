//! Persisted record stores backing the core components
//!
//! The relational backend owns these tables; the core only reads and appends
//! through the traits below. `RestStore` talks to the hosted backend,
//! `SqliteStore` keeps a local copy and `MemoryBackend` serves tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::*;

#[async_trait]
pub trait CallStore: Send + Sync {
    async fn create_call(&self, call: NewCall) -> Result<Call>;

    async fn update_call(&self, call_id: &str, update: CallUpdate) -> Result<Call>;

    async fn get_call(&self, call_id: &str) -> Result<Option<Call>>;
}

#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn insert_signal(&self, signal: NewSignal) -> Result<Signal>;

    /// Most recently created signal of `kind` for the call.
    async fn latest_signal(&self, call_id: &str, kind: SignalKind) -> Result<Option<Signal>>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>>;

    async fn update_last_seen(&self, user_id: &str, at: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save_message(&self, message: &PrivateMessage) -> Result<()>;

    /// Messages exchanged between `user_id` and `peer_id`, oldest first,
    /// restricted to those created strictly after `after`.
    async fn history(
        &self,
        user_id: &str,
        peer_id: &str,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<PrivateMessage>>;

    /// Every message sent or received by `user_id`, oldest first.
    async fn messages_involving(&self, user_id: &str) -> Result<Vec<PrivateMessage>>;

    /// Mark messages from `peer_id` to `user_id` read. Returns how many changed.
    async fn mark_read(&self, user_id: &str, peer_id: &str) -> Result<u32>;

    async fn hidden_conversations(&self, user_id: &str) -> Result<Vec<HiddenConversation>>;

    /// Insert or refresh the cutoff for (`user_id`, `peer_id`).
    async fn hide_conversation(
        &self,
        user_id: &str,
        peer_id: &str,
        at: DateTime<Utc>,
    ) -> Result<HiddenConversation>;
}
