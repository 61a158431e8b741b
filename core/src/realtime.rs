//! Realtime relay over the hosted websocket service
//!
//! Speaks the Phoenix channel protocol (vsn 1.0.0, JSON frames): one
//! `phx_join` per topic, `broadcast` frames for ephemeral events,
//! `postgres_changes` frames for row notifications and a periodic heartbeat
//! on the `phoenix` topic.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use url::Url;

use crate::config::{BackendConfig, RealtimeConfig};
use crate::error::{Error, Result};
use crate::relay::*;

const PROTOCOL_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

pub fn socket_url(config: &BackendConfig) -> Result<Url> {
    let mut url = Url::parse(&config.realtime_url)?;
    url.query_pairs_mut()
        .append_pair("apikey", &config.api_key)
        .append_pair("vsn", PROTOCOL_VERSION);
    Ok(url)
}

pub fn topic_for(channel: &str) -> String {
    format!("realtime:{}", channel)
}

pub fn join_frame(topic: &str, subscription: &Subscription, reference: u64) -> Frame {
    let changes = match subscription {
        Subscription::Broadcast => vec![],
        Subscription::Changes { table, filter } => {
            let mut change = json!({ "event": "*", "schema": "public", "table": table });
            if let Some(filter) = filter {
                change["filter"] = json!(filter);
            }
            vec![change]
        }
    };

    Frame {
        topic: topic.to_string(),
        event: "phx_join".to_string(),
        payload: json!({
            "config": {
                "broadcast": { "self": false, "ack": false },
                "presence": { "key": "" },
                "postgres_changes": changes,
            }
        }),
        reference: Some(reference.to_string()),
    }
}

pub fn broadcast_frame(topic: &str, event: &str, payload: Value, reference: u64) -> Frame {
    Frame {
        topic: topic.to_string(),
        event: "broadcast".to_string(),
        payload: json!({ "type": "broadcast", "event": event, "payload": payload }),
        reference: Some(reference.to_string()),
    }
}

pub fn leave_frame(topic: &str, reference: u64) -> Frame {
    Frame {
        topic: topic.to_string(),
        event: "phx_leave".to_string(),
        payload: json!({}),
        reference: Some(reference.to_string()),
    }
}

pub fn heartbeat_frame(reference: u64) -> Frame {
    Frame {
        topic: "phoenix".to_string(),
        event: "heartbeat".to_string(),
        payload: json!({}),
        reference: Some(reference.to_string()),
    }
}

#[derive(Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    kind: ChangeKind,
    table: String,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
}

/// Relay events carried by an inbound frame, if any.
pub fn decode_event(frame: &Frame) -> Option<RelayEvent> {
    match frame.event.as_str() {
        "broadcast" => {
            let event = frame.payload.get("event")?.as_str()?.to_string();
            let payload = frame.payload.get("payload").cloned().unwrap_or(Value::Null);
            Some(RelayEvent::Broadcast { event, payload })
        }
        "postgres_changes" => {
            let data = frame.payload.get("data")?.clone();
            match serde_json::from_value::<ChangeData>(data) {
                Ok(data) => Some(RelayEvent::Change(RowChange {
                    kind: data.kind,
                    table: data.table,
                    record: data.record.unwrap_or(Value::Null),
                    old_record: data.old_record,
                })),
                Err(e) => {
                    tracing::warn!("Ignoring malformed change on {}: {}", frame.topic, e);
                    None
                }
            }
        }
        _ => None,
    }
}

// ============================================================================
// Client
// ============================================================================

struct Subscriber {
    topic: String,
    subscription: Subscription,
    sender: mpsc::UnboundedSender<RelayEvent>,
}

type Subscribers = Arc<Mutex<Vec<Subscriber>>>;
type Joined = Arc<Mutex<HashSet<String>>>;

/// Held by the stream of a row subscription. Dropping it leaves the topic.
struct TopicLease {
    topic: String,
    outbound: mpsc::UnboundedSender<String>,
    joined: Joined,
    subscribers: Subscribers,
    next_ref: Arc<AtomicU64>,
}

impl Drop for TopicLease {
    fn drop(&mut self) {
        self.joined.lock().remove(&self.topic);
        self.subscribers.lock().retain(|s| s.topic != self.topic);

        let frame = leave_frame(&self.topic, self.next_ref.fetch_add(1, Ordering::Relaxed));
        match serde_json::to_string(&frame) {
            Ok(text) => {
                // The socket may already be gone.
                let _ = self.outbound.send(text);
            }
            Err(e) => tracing::warn!("Failed to encode leave for {}: {}", self.topic, e),
        }
        tracing::debug!("Left {}", self.topic);
    }
}

/// A relay stream that keeps `lease` alive until it is dropped or ends.
fn leased_stream(rx: mpsc::UnboundedReceiver<RelayEvent>, lease: TopicLease) -> RelayStream {
    futures::stream::unfold((receiver_stream(rx), lease), |(mut stream, lease)| async move {
        stream.next().await.map(|event| (event, (stream, lease)))
    })
    .boxed()
}

pub struct RealtimeRelay {
    outbound: mpsc::UnboundedSender<String>,
    subscribers: Subscribers,
    joined: Joined,
    next_ref: Arc<AtomicU64>,
    connected: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RealtimeRelay {
    pub async fn connect(backend: &BackendConfig, realtime: &RealtimeConfig) -> Result<Self> {
        let url = socket_url(backend)?;
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();
        tracing::info!("Connected to realtime relay at {}", backend.realtime_url);

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let next_ref = Arc::new(AtomicU64::new(1));

        // Receive task
        let receive = {
            let subscribers = subscribers.clone();
            let connected = connected.clone();
            tokio::spawn(async move {
                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(WsMessage::Text(text)) => match serde_json::from_str::<Frame>(&text) {
                            Ok(frame) => route(&subscribers, &frame),
                            Err(e) => tracing::warn!("Ignoring unreadable frame: {}", e),
                        },
                        Ok(WsMessage::Close(_)) => {
                            tracing::warn!("Realtime relay closed the connection");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!("Realtime connection error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }
                connected.store(false, Ordering::SeqCst);
            })
        };

        // Send task
        let send = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if write.send(WsMessage::Text(msg)).await.is_err() {
                    break;
                }
            }
        });

        // Heartbeat task
        let heartbeat = {
            let tx = tx.clone();
            let next_ref = next_ref.clone();
            let period = realtime.heartbeat_interval();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let frame = heartbeat_frame(next_ref.fetch_add(1, Ordering::Relaxed));
                    let Ok(text) = serde_json::to_string(&frame) else {
                        continue;
                    };
                    if tx.send(text).is_err() {
                        break;
                    }
                }
            })
        };

        Ok(Self {
            outbound: tx,
            subscribers,
            joined: Arc::new(Mutex::new(HashSet::new())),
            next_ref,
            connected,
            tasks: Mutex::new(vec![receive, send, heartbeat]),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn next_ref(&self) -> u64 {
        self.next_ref.fetch_add(1, Ordering::Relaxed)
    }

    fn send_frame(&self, frame: &Frame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        self.outbound
            .send(text)
            .map_err(|e| Error::WebSocket(e.to_string()))
    }

    /// Join `topic` once; row subscriptions on an already joined channel get their own topic.
    fn join(&self, channel: &str, subscription: &Subscription) -> Result<String> {
        let base = topic_for(channel);
        let topic = {
            let mut joined = self.joined.lock();
            match subscription {
                Subscription::Broadcast if joined.contains(&base) => return Ok(base),
                Subscription::Broadcast => base,
                Subscription::Changes { .. } => {
                    let mut topic = base.clone();
                    let mut n = 1;
                    while joined.contains(&topic) {
                        n += 1;
                        topic = format!("{}-{}", base, n);
                    }
                    topic
                }
            }
        };

        self.send_frame(&join_frame(&topic, subscription, self.next_ref()))?;
        self.joined.lock().insert(topic.clone());
        tracing::debug!("Joined {}", topic);
        Ok(topic)
    }

    pub async fn disconnect(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.subscribers.lock().clear();
        self.connected.store(false, Ordering::SeqCst);
    }
}

fn route(subscribers: &Subscribers, frame: &Frame) {
    let Some(event) = decode_event(frame) else {
        if frame.event == "phx_reply" && frame.payload["status"] == "error" {
            tracing::warn!("Relay rejected {}: {}", frame.topic, frame.payload["response"]);
        }
        return;
    };

    let mut subscribers = subscribers.lock();
    subscribers.retain(|s| !s.sender.is_closed());
    for sub in subscribers.iter() {
        if sub.topic == frame.topic && sub.subscription.matches(&event) {
            let _ = sub.sender.send(event.clone());
        }
    }
}

#[async_trait]
impl Relay for RealtimeRelay {
    async fn broadcast(&self, channel: &str, event: &str, payload: Value) -> Result<()> {
        let topic = self.join(channel, &Subscription::Broadcast)?;
        self.send_frame(&broadcast_frame(&topic, event, payload, self.next_ref()))
    }

    /// Broadcast topics are shared and stay joined. Each row subscription owns
    /// its topic and leaves it when the returned stream is dropped.
    async fn subscribe(&self, channel: &str, subscription: Subscription) -> Result<RelayStream> {
        let topic = self.join(channel, &subscription)?;
        let owns_topic = matches!(subscription, Subscription::Changes { .. });
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber {
            topic: topic.clone(),
            subscription,
            sender: tx,
        });

        if !owns_topic {
            return Ok(receiver_stream(rx));
        }
        let lease = TopicLease {
            topic,
            outbound: self.outbound.clone(),
            joined: self.joined.clone(),
            subscribers: self.subscribers.clone(),
            next_ref: self.next_ref.clone(),
        };
        Ok(leased_stream(rx, lease))
    }
}

impl Drop for RealtimeRelay {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_socket_url_carries_key_and_version() {
        let url = socket_url(&Config::default().backend).unwrap();
        assert_eq!(url.path(), "/realtime/v1/websocket");
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(query.contains(&("apikey".to_string(), "change-this-anon-key".to_string())));
        assert!(query.contains(&("vsn".to_string(), "1.0.0".to_string())));
    }

    #[test]
    fn test_join_frame_lists_row_filter() {
        let sub = Subscription::changes_where(SIGNALS_TABLE, "call_id", "c1");
        let frame = join_frame(&topic_for("webrtc-signals-c1-bob"), &sub, 7);
        assert_eq!(frame.topic, "realtime:webrtc-signals-c1-bob");
        assert_eq!(frame.reference.as_deref(), Some("7"));
        let changes = &frame.payload["config"]["postgres_changes"][0];
        assert_eq!(changes["table"], SIGNALS_TABLE);
        assert_eq!(changes["filter"], "call_id=eq.c1");

        let frame = join_frame("realtime:private-typing", &Subscription::Broadcast, 8);
        assert_eq!(frame.payload["config"]["postgres_changes"], json!([]));
    }

    #[test]
    fn test_decode_broadcast_frame() {
        let frame: Frame = serde_json::from_value(json!({
            "topic": "realtime:public-online-activity",
            "event": "broadcast",
            "payload": {
                "type": "broadcast",
                "event": "activity",
                "payload": { "userId": "alice", "lastSeen": "2024-03-01T12:00:00Z" }
            },
            "ref": null
        }))
        .unwrap();

        match decode_event(&frame) {
            Some(RelayEvent::Broadcast { event, payload }) => {
                assert_eq!(event, "activity");
                assert_eq!(payload["userId"], "alice");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_change_frame() {
        let frame: Frame = serde_json::from_value(json!({
            "topic": "realtime:voice-calls-bob",
            "event": "postgres_changes",
            "payload": {
                "ids": [1],
                "data": {
                    "type": "UPDATE",
                    "schema": "public",
                    "table": "voice_calls",
                    "record": { "id": "c1", "status": "ended" },
                    "old_record": { "id": "c1" },
                    "commit_timestamp": "2024-03-01T12:00:00Z"
                }
            },
            "ref": null
        }))
        .unwrap();

        match decode_event(&frame) {
            Some(RelayEvent::Change(change)) => {
                assert_eq!(change.kind, ChangeKind::Update);
                assert_eq!(change.table, CALLS_TABLE);
                assert_eq!(change.record["status"], "ended");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_replies_carry_no_event() {
        let frame = Frame {
            topic: "phoenix".to_string(),
            event: "phx_reply".to_string(),
            payload: json!({ "status": "ok", "response": {} }),
            reference: Some("1".to_string()),
        };
        assert!(decode_event(&frame).is_none());
    }

    #[tokio::test]
    async fn test_dropping_row_stream_leaves_topic() {
        let (outbound, mut sent) = mpsc::unbounded_channel();
        let joined: Joined = Arc::new(Mutex::new(HashSet::new()));
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        let topic = topic_for("webrtc-signals-c1-bob");
        joined.lock().insert(topic.clone());
        joined.lock().insert(topic_for("voice-calls-bob"));

        let (tx, rx) = mpsc::unbounded_channel();
        subscribers.lock().push(Subscriber {
            topic: topic.clone(),
            subscription: Subscription::changes_where(SIGNALS_TABLE, "call_id", "c1"),
            sender: tx,
        });
        let mut stream = leased_stream(
            rx,
            TopicLease {
                topic: topic.clone(),
                outbound,
                joined: joined.clone(),
                subscribers: subscribers.clone(),
                next_ref: Arc::new(AtomicU64::new(42)),
            },
        );

        let change = serde_json::from_value::<Frame>(json!({
            "topic": &topic,
            "event": "postgres_changes",
            "payload": { "data": {
                "type": "INSERT",
                "table": SIGNALS_TABLE,
                "record": { "call_id": "c1" }
            }},
            "ref": null
        }))
        .unwrap();
        route(&subscribers, &change);
        assert!(matches!(stream.next().await, Some(RelayEvent::Change(_))));
        assert!(sent.try_recv().is_err());

        drop(stream);

        let frame: Frame = serde_json::from_str(&sent.try_recv().unwrap()).unwrap();
        assert_eq!(frame, leave_frame(&topic, 42));
        assert_eq!(frame.event, "phx_leave");
        assert!(!joined.lock().contains(&topic));
        assert!(joined.lock().contains(&topic_for("voice-calls-bob")));
        assert!(subscribers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_route_delivers_by_topic() {
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (other_tx, mut other_rx) = mpsc::unbounded_channel();
        subscribers.lock().push(Subscriber {
            topic: "realtime:private-typing".to_string(),
            subscription: Subscription::Broadcast,
            sender: tx,
        });
        subscribers.lock().push(Subscriber {
            topic: "realtime:public-typing".to_string(),
            subscription: Subscription::Broadcast,
            sender: other_tx,
        });

        let frame = broadcast_frame("realtime:private-typing", "typing", json!({ "senderId": "a" }), 1);
        route(&subscribers, &frame);

        assert!(matches!(rx.try_recv(), Ok(RelayEvent::Broadcast { .. })));
        assert!(other_rx.try_recv().is_err());
    }
}
