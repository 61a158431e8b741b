//! Realtime relay abstraction: broadcast events and row-change feeds

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

// ============================================================================
// Channel names
// ============================================================================

pub const PRIVATE_TYPING_CHANNEL: &str = "private-typing-indicator";
pub const PUBLIC_TYPING_CHANNEL: &str = "public-typing-indicator";
pub const ONLINE_ACTIVITY_CHANNEL: &str = "public-online-activity";

pub const CALLS_TABLE: &str = "voice_calls";
pub const SIGNALS_TABLE: &str = "webrtc_signals";
pub const PROFILES_TABLE: &str = "profiles";
pub const MESSAGES_TABLE: &str = "private_messages";
pub const HIDDEN_TABLE: &str = "hidden_conversations";

pub fn calls_channel(user_id: &str) -> String {
    format!("voice-calls-{}", user_id)
}

pub fn signals_channel(call_id: &str, user_id: &str) -> String {
    format!("webrtc-signals-{}-{}", call_id, user_id)
}

pub fn messages_channel(user_id: &str) -> String {
    format!("private-messages-{}", user_id)
}

pub fn profiles_channel(user_id: &str) -> String {
    format!("profiles-{}", user_id)
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    Broadcast,
    Changes {
        table: String,
        /// `column=eq.value`, or every row of the table when `None`
        filter: Option<String>,
    },
}

impl Subscription {
    pub fn changes(table: &str) -> Self {
        Subscription::Changes {
            table: table.to_string(),
            filter: None,
        }
    }

    pub fn changes_where(table: &str, column: &str, value: &str) -> Self {
        Subscription::Changes {
            table: table.to_string(),
            filter: Some(format!("{}=eq.{}", column, value)),
        }
    }

    /// Whether a broadcast or row change belongs to this subscription.
    pub fn matches(&self, event: &RelayEvent) -> bool {
        match (self, event) {
            (Subscription::Broadcast, RelayEvent::Broadcast { .. }) => true,
            (Subscription::Changes { table, filter }, RelayEvent::Change(change)) => {
                if change.table != *table {
                    return false;
                }
                match filter {
                    Some(filter) => filter_matches(filter, &change.record),
                    None => true,
                }
            }
            _ => false,
        }
    }
}

fn filter_matches(filter: &str, record: &serde_json::Value) -> bool {
    let Some((column, expected)) = filter.split_once("=eq.") else {
        tracing::warn!("Unsupported relay filter: {}", filter);
        return false;
    };

    match record.get(column) {
        Some(serde_json::Value::String(s)) => s == expected,
        Some(other) => other.to_string() == expected,
        None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub kind: ChangeKind,
    pub table: String,
    pub record: serde_json::Value,
    pub old_record: Option<serde_json::Value>,
}

impl RowChange {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.record.clone())?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Broadcast {
        event: String,
        payload: serde_json::Value,
    },
    Change(RowChange),
}

pub type RelayStream = BoxStream<'static, RelayEvent>;

/// Turn an mpsc receiver into a relay stream. The stream ends when every sender is dropped.
pub fn receiver_stream(rx: mpsc::UnboundedReceiver<RelayEvent>) -> RelayStream {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    })
    .boxed()
}

// ============================================================================
// Relay
// ============================================================================

/// Publish/subscribe transport. Delivery is at-least-once per subscriber;
/// no ordering is promised across channels.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn broadcast(&self, channel: &str, event: &str, payload: serde_json::Value) -> Result<()>;

    async fn subscribe(&self, channel: &str, subscription: Subscription) -> Result<RelayStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(table: &str, record: serde_json::Value) -> RelayEvent {
        RelayEvent::Change(RowChange {
            kind: ChangeKind::Insert,
            table: table.to_string(),
            record,
            old_record: None,
        })
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(calls_channel("u1"), "voice-calls-u1");
        assert_eq!(signals_channel("c9", "u1"), "webrtc-signals-c9-u1");
    }

    #[test]
    fn test_filtered_subscription() {
        let sub = Subscription::changes_where(SIGNALS_TABLE, "call_id", "c1");

        assert!(sub.matches(&change(SIGNALS_TABLE, json!({ "call_id": "c1" }))));
        assert!(!sub.matches(&change(SIGNALS_TABLE, json!({ "call_id": "c2" }))));
        assert!(!sub.matches(&change(CALLS_TABLE, json!({ "call_id": "c1" }))));
        assert!(!sub.matches(&RelayEvent::Broadcast {
            event: "typing".to_string(),
            payload: json!({}),
        }));
    }

    #[test]
    fn test_filter_on_numeric_column() {
        let sub = Subscription::changes_where(MESSAGES_TABLE, "thread", "7");
        assert!(sub.matches(&change(MESSAGES_TABLE, json!({ "thread": 7 }))));
    }
}
