//! Online presence derived from last-activity timestamps
//!
//! Classification is a pure function of `now - last_seen`. The tracker keeps
//! the newest timestamp per user from two independent inputs (activity
//! broadcasts and profile row changes) and re-evaluates on a fixed tick, so a
//! user drops to offline from the passage of time alone.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::models::{Profile, UserId};
use crate::relay::*;
use crate::store::ProfileStore;

pub const ACTIVITY_EVENT: &str = "activity";

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Online,
    Offline,
}

/// Online iff `now - last_seen <= threshold`. A timestamp ahead of `now` counts as online.
pub fn classify(last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>, threshold: Duration) -> Presence {
    let Some(last_seen) = last_seen else {
        return Presence::Offline;
    };

    match (now - last_seen).to_std() {
        Ok(elapsed) if elapsed > threshold => Presence::Offline,
        _ => Presence::Online,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPayload {
    pub user_id: UserId,
    pub last_seen: DateTime<Utc>,
}

// ============================================================================
// Tracker
// ============================================================================

pub struct PresenceTracker {
    threshold: Duration,
    clock: Clock,
    last_seen: Mutex<HashMap<UserId, DateTime<Utc>>>,
    online: watch::Sender<BTreeSet<UserId>>,
}

impl PresenceTracker {
    pub fn new(threshold: Duration) -> Self {
        Self::with_clock(threshold, system_clock())
    }

    pub fn with_clock(threshold: Duration, clock: Clock) -> Self {
        let (online, _) = watch::channel(BTreeSet::new());
        Self {
            threshold,
            clock,
            last_seen: Mutex::new(HashMap::new()),
            online,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Record a timestamp for `user_id`. Older or equal timestamps are ignored,
    /// so the same update arriving on both paths is counted once.
    pub fn apply(&self, user_id: &str, at: DateTime<Utc>) -> bool {
        let changed = {
            let mut last_seen = self.last_seen.lock();
            match last_seen.get(user_id) {
                Some(existing) if *existing >= at => false,
                _ => {
                    last_seen.insert(user_id.to_string(), at);
                    true
                }
            }
        };

        if changed {
            self.refresh();
        }
        changed
    }

    pub fn last_seen(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.last_seen.lock().get(user_id).copied()
    }

    pub fn status(&self, user_id: &str) -> Presence {
        classify(self.last_seen(user_id), (self.clock)(), self.threshold)
    }

    pub fn online_users(&self) -> BTreeSet<UserId> {
        let now = (self.clock)();
        self.last_seen
            .lock()
            .iter()
            .filter(|(_, at)| classify(Some(**at), now, self.threshold) == Presence::Online)
            .map(|(user, _)| user.clone())
            .collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<BTreeSet<UserId>> {
        self.online.subscribe()
    }

    /// Re-evaluate every user against the clock and publish the online set if it changed.
    pub fn refresh(&self) {
        let online = self.online_users();
        self.online.send_if_modified(|current| {
            if *current != online {
                *current = online;
                true
            } else {
                false
            }
        });
    }

    pub fn spawn_ticker(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                tracker.refresh();
            }
        })
    }

    /// Feed the tracker from activity broadcasts and profile row changes.
    pub async fn listen(self: &Arc<Self>, relay: Arc<dyn Relay>, local_user: &str) -> Result<JoinHandle<()>> {
        let activity = relay
            .subscribe(ONLINE_ACTIVITY_CHANNEL, Subscription::Broadcast)
            .await?;
        let profiles = relay
            .subscribe(&profiles_channel(local_user), Subscription::changes(PROFILES_TABLE))
            .await?;

        let tracker = self.clone();
        Ok(tokio::spawn(async move {
            let mut events = futures::stream::select(activity, profiles);
            while let Some(event) = events.next().await {
                tracker.handle_event(event);
            }
        }))
    }

    fn handle_event(&self, event: RelayEvent) {
        match event {
            RelayEvent::Broadcast { event, payload } if event == ACTIVITY_EVENT => {
                match serde_json::from_value::<ActivityPayload>(payload) {
                    Ok(activity) => {
                        self.apply(&activity.user_id, activity.last_seen);
                    }
                    Err(e) => tracing::warn!("Ignoring malformed activity broadcast: {}", e),
                }
            }
            RelayEvent::Change(change) => match change.decode::<Profile>() {
                Ok(Profile {
                    id,
                    last_seen: Some(at),
                    ..
                }) => {
                    self.apply(&id, at);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Ignoring malformed profile change: {}", e),
            },
            _ => {}
        }
    }
}

// ============================================================================
// Local activity
// ============================================================================

/// Reports local user activity, at most once per threshold window, on both the
/// durable path (profile store) and the fast path (activity broadcast).
pub struct ActivityObserver {
    user_id: UserId,
    threshold: Duration,
    clock: Clock,
    profiles: Arc<dyn ProfileStore>,
    relay: Arc<dyn Relay>,
    tracker: Option<Arc<PresenceTracker>>,
    last_reported: Mutex<Option<DateTime<Utc>>>,
}

impl ActivityObserver {
    pub fn new(
        user_id: &str,
        threshold: Duration,
        profiles: Arc<dyn ProfileStore>,
        relay: Arc<dyn Relay>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            threshold,
            clock: system_clock(),
            profiles,
            relay,
            tracker: None,
            last_reported: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Also apply local reports to `tracker` so the local user shows online at once.
    pub fn with_tracker(mut self, tracker: Arc<PresenceTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Call on click, pointer move or key press. Returns whether a report went out.
    pub async fn record_activity(&self) -> bool {
        let now = (self.clock)();
        {
            let mut last = self.last_reported.lock();
            if let Some(previous) = *last {
                let due = match (now - previous).to_std() {
                    Ok(elapsed) => elapsed > self.threshold,
                    Err(_) => false,
                };
                if !due {
                    return false;
                }
            }
            *last = Some(now);
        }

        if let Some(tracker) = &self.tracker {
            tracker.apply(&self.user_id, now);
        }

        if let Err(e) = self.profiles.update_last_seen(&self.user_id, now).await {
            tracing::warn!("Failed to store last_seen for {}: {}", self.user_id, e);
        }

        let payload = ActivityPayload {
            user_id: self.user_id.clone(),
            last_seen: now,
        };
        match serde_json::to_value(&payload) {
            Ok(payload) => {
                if let Err(e) = self
                    .relay
                    .broadcast(ONLINE_ACTIVITY_CHANNEL, ACTIVITY_EVENT, payload)
                    .await
                {
                    tracing::warn!("Failed to broadcast activity for {}: {}", self.user_id, e);
                }
            }
            Err(e) => tracing::warn!("Failed to encode activity payload: {}", e),
        }

        true
    }
}
