//! Data models for Huddle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = String;
pub type CallId = String;

/// Preview shown in a conversation summary for a message that only carries an image.
pub const IMAGE_PREVIEW: &str = "[image]";

// ============================================================================
// Calls
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Calling,
    Ringing,
    Connecting,
    /// Set by the receiver on acceptance. Media may still be negotiating.
    Connected,
    Ended,
    Missed,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::Missed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Calling => "calling",
            CallStatus::Ringing => "ringing",
            CallStatus::Connecting => "connecting",
            CallStatus::Connected => "connected",
            CallStatus::Ended => "ended",
            CallStatus::Missed => "missed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub id: CallId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub status: CallStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Call {
    pub fn involves(&self, user_id: &str) -> bool {
        self.caller_id == user_id || self.receiver_id == user_id
    }

    /// The participant that is not `user_id`.
    pub fn other_party(&self, user_id: &str) -> &str {
        if self.caller_id == user_id {
            &self.receiver_id
        } else {
            &self.caller_id
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCall {
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub status: CallStatus,
}

/// Partial update of a call record. Unset fields are left untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallUpdate {
    pub status: CallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallUpdate {
    pub fn accepted(at: DateTime<Utc>) -> Self {
        Self {
            status: CallStatus::Connected,
            started_at: Some(at),
            ended_at: None,
        }
    }

    pub fn ended(at: DateTime<Utc>) -> Self {
        Self {
            status: CallStatus::Ended,
            started_at: None,
            ended_at: Some(at),
        }
    }

    pub fn missed(at: DateTime<Utc>) -> Self {
        Self {
            status: CallStatus::Missed,
            started_at: None,
            ended_at: Some(at),
        }
    }

    pub fn apply_to(&self, call: &mut Call) {
        call.status = self.status;
        if self.started_at.is_some() {
            call.started_at = self.started_at;
        }
        if self.ended_at.is_some() {
            call.ended_at = self.ended_at;
        }
    }
}

// ============================================================================
// Signals
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice_candidate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub call_id: CallId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub signal_type: SignalKind,
    /// Session description or ICE candidate, in browser JSON shape
    pub signal_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSignal {
    pub call_id: CallId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub signal_type: SignalKind,
    pub signal_data: serde_json::Value,
}

// ============================================================================
// Profiles
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

// ============================================================================
// Private messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivateMessage {
    pub id: String,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

impl PrivateMessage {
    /// Text shown as the conversation's last message.
    pub fn preview(&self) -> String {
        match self.message.as_deref() {
            Some(text) if !text.trim().is_empty() => text.to_string(),
            _ if self.image_url.is_some() => IMAGE_PREVIEW.to_string(),
            _ => String::new(),
        }
    }

    /// The participant that is not `user_id`.
    pub fn counterpart(&self, user_id: &str) -> &str {
        if self.sender_id == user_id {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiddenConversation {
    pub user_id: UserId,
    pub hidden_user_id: UserId,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Conversation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub peer_id: UserId,
    pub peer_name: Option<String>,
    pub peer_color: Option<String>,
    pub peer_avatar: Option<String>,
    pub last_message: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub unread_count: u32,
    pub is_typing: bool,
}

impl ConversationSummary {
    pub fn new(peer_id: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            peer_name: None,
            peer_color: None,
            peer_avatar: None,
            last_message: None,
            last_message_time: None,
            unread_count: 0,
            is_typing: false,
        }
    }
}
