//! In-process relay and backend
//!
//! `MemoryRelay` fans broadcasts and row changes out to subscribers the way the
//! hosted realtime service does. `MemoryBackend` stores calls, signals and
//! profiles and publishes a row change for every write, so several clients
//! sharing one backend observe each other exactly as they would in production.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::models::*;
use crate::relay::*;
use crate::store::{CallStore, ProfileStore, SignalStore};

// ============================================================================
// Relay
// ============================================================================

struct Subscriber {
    channel: String,
    subscription: Subscription,
    sender: mpsc::UnboundedSender<RelayEvent>,
}

#[derive(Default)]
pub struct MemoryRelay {
    subscribers: Mutex<Vec<Subscriber>>,
    duplicate_delivery: AtomicBool,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver every event twice, as an at-least-once transport may.
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.duplicate_delivery.store(enabled, Ordering::SeqCst);
    }

    /// Row changes reach every subscriber whose table and filter match, on any channel.
    pub fn publish_change(&self, change: RowChange) {
        self.deliver(None, RelayEvent::Change(change));
    }

    /// Live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|s| s.channel == channel && !s.sender.is_closed())
            .count()
    }

    fn deliver(&self, channel: Option<&str>, event: RelayEvent) {
        let copies = if self.duplicate_delivery.load(Ordering::SeqCst) { 2 } else { 1 };
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.sender.is_closed());

        for sub in subscribers.iter() {
            if channel.map_or(false, |c| c != sub.channel) {
                continue;
            }
            if !sub.subscription.matches(&event) {
                continue;
            }
            for _ in 0..copies {
                let _ = sub.sender.send(event.clone());
            }
        }
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn broadcast(&self, channel: &str, event: &str, payload: serde_json::Value) -> Result<()> {
        self.deliver(
            Some(channel),
            RelayEvent::Broadcast {
                event: event.to_string(),
                payload,
            },
        );
        Ok(())
    }

    async fn subscribe(&self, channel: &str, subscription: Subscription) -> Result<RelayStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber {
            channel: channel.to_string(),
            subscription,
            sender: tx,
        });
        Ok(receiver_stream(rx))
    }
}

// ============================================================================
// Backend
// ============================================================================

pub struct MemoryBackend {
    relay: Arc<MemoryRelay>,
    calls: Mutex<HashMap<CallId, Call>>,
    signals: Mutex<Vec<Signal>>,
    profiles: Mutex<HashMap<UserId, Profile>>,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new(relay: Arc<MemoryRelay>) -> Self {
        Self {
            relay,
            calls: Mutex::new(HashMap::new()),
            signals: Mutex::new(Vec::new()),
            profiles: Mutex::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn relay(&self) -> Arc<MemoryRelay> {
        self.relay.clone()
    }

    /// Make every subsequent write fail, as an unreachable backend would.
    pub fn set_fail_writes(&self, enabled: bool) {
        self.fail_writes.store(enabled, Ordering::SeqCst);
    }

    pub fn insert_profile(&self, profile: Profile) {
        self.profiles.lock().insert(profile.id.clone(), profile);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().values().cloned().collect()
    }

    pub fn call(&self, call_id: &str) -> Option<Call> {
        self.calls.lock().get(call_id).cloned()
    }

    pub fn signals(&self, call_id: &str) -> Vec<Signal> {
        self.signals
            .lock()
            .iter()
            .filter(|s| s.call_id == call_id)
            .cloned()
            .collect()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Store("backend unavailable".to_string()));
        }
        Ok(())
    }

    fn publish<T: Serialize>(&self, kind: ChangeKind, table: &str, record: &T, old: Option<&T>) -> Result<()> {
        let old_record = match old {
            Some(old) => Some(serde_json::to_value(old)?),
            None => None,
        };
        self.relay.publish_change(RowChange {
            kind,
            table: table.to_string(),
            record: serde_json::to_value(record)?,
            old_record,
        });
        Ok(())
    }
}

#[async_trait]
impl CallStore for MemoryBackend {
    async fn create_call(&self, call: NewCall) -> Result<Call> {
        self.check_writable()?;
        let call = Call {
            id: uuid::Uuid::new_v4().to_string(),
            caller_id: call.caller_id,
            receiver_id: call.receiver_id,
            status: call.status,
            started_at: None,
            ended_at: None,
        };
        self.calls.lock().insert(call.id.clone(), call.clone());
        self.publish(ChangeKind::Insert, CALLS_TABLE, &call, None)?;
        Ok(call)
    }

    async fn update_call(&self, call_id: &str, update: CallUpdate) -> Result<Call> {
        self.check_writable()?;
        let (old, call) = {
            let mut calls = self.calls.lock();
            let call = calls
                .get_mut(call_id)
                .ok_or_else(|| Error::NotFound(format!("call {}", call_id)))?;
            let old = call.clone();
            update.apply_to(call);
            (old, call.clone())
        };
        self.publish(ChangeKind::Update, CALLS_TABLE, &call, Some(&old))?;
        Ok(call)
    }

    async fn get_call(&self, call_id: &str) -> Result<Option<Call>> {
        Ok(self.call(call_id))
    }
}

#[async_trait]
impl SignalStore for MemoryBackend {
    async fn insert_signal(&self, signal: NewSignal) -> Result<Signal> {
        self.check_writable()?;
        let signal = Signal {
            id: uuid::Uuid::new_v4().to_string(),
            call_id: signal.call_id,
            sender_id: signal.sender_id,
            receiver_id: signal.receiver_id,
            signal_type: signal.signal_type,
            signal_data: signal.signal_data,
            created_at: Utc::now(),
        };
        self.signals.lock().push(signal.clone());
        self.publish(ChangeKind::Insert, SIGNALS_TABLE, &signal, None)?;
        Ok(signal)
    }

    async fn latest_signal(&self, call_id: &str, kind: SignalKind) -> Result<Option<Signal>> {
        // Insertion order is the causal order within a call.
        Ok(self
            .signals
            .lock()
            .iter()
            .rev()
            .find(|s| s.call_id == call_id && s.signal_type == kind)
            .cloned())
    }
}

#[async_trait]
impl ProfileStore for MemoryBackend {
    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        Ok(self.profiles.lock().get(user_id).cloned())
    }

    async fn update_last_seen(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.check_writable()?;
        let (old, profile) = {
            let mut profiles = self.profiles.lock();
            let profile = profiles.entry(user_id.to_string()).or_insert_with(|| Profile {
                id: user_id.to_string(),
                username: user_id.to_string(),
                color: None,
                avatar_url: None,
                last_seen: None,
            });
            let old = profile.clone();
            if profile.last_seen.map_or(true, |seen| seen < at) {
                profile.last_seen = Some(at);
            }
            (old, profile.clone())
        };
        self.publish(ChangeKind::Update, PROFILES_TABLE, &profile, Some(&old))?;
        Ok(())
    }
}
