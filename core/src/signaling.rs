//! Call signaling channel: offer/answer/ICE envelopes over the signal log
//!
//! Outbound signals are appended to the persisted log; the relay's insert
//! notifications deliver them to the other participant. Delivery is
//! at-least-once, so the inbound side drops repeats by signal id.

use futures::stream::{BoxStream, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Result;
use crate::media::{IceCandidate, SdpKind, SessionDescription};
use crate::models::*;
use crate::relay::*;
use crate::store::SignalStore;

pub type SignalStream = BoxStream<'static, Signal>;

#[derive(Clone)]
pub struct SignalingChannel {
    call_id: CallId,
    local_user: UserId,
    remote_user: UserId,
    signals: Arc<dyn SignalStore>,
}

impl SignalingChannel {
    pub fn new(call_id: &str, local_user: &str, remote_user: &str, signals: Arc<dyn SignalStore>) -> Self {
        Self {
            call_id: call_id.to_string(),
            local_user: local_user.to_string(),
            remote_user: remote_user.to_string(),
            signals,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Signals for this call, addressed to the local user, not sent by it.
    pub fn accepts(&self, signal: &Signal) -> bool {
        signal.call_id == self.call_id
            && signal.receiver_id == self.local_user
            && signal.sender_id != self.local_user
    }

    pub async fn send(&self, kind: SignalKind, data: serde_json::Value) -> Result<Signal> {
        let signal = self
            .signals
            .insert_signal(NewSignal {
                call_id: self.call_id.clone(),
                sender_id: self.local_user.clone(),
                receiver_id: self.remote_user.clone(),
                signal_type: kind,
                signal_data: data,
            })
            .await?;

        tracing::debug!("Sent {} for call {}", kind.as_str(), self.call_id);
        Ok(signal)
    }

    pub async fn send_description(&self, description: &SessionDescription) -> Result<Signal> {
        let kind = match description.kind {
            SdpKind::Offer => SignalKind::Offer,
            SdpKind::Answer => SignalKind::Answer,
        };
        self.send(kind, serde_json::to_value(description)?).await
    }

    pub async fn send_candidate(&self, candidate: &IceCandidate) -> Result<Signal> {
        self.send(SignalKind::IceCandidate, serde_json::to_value(candidate)?)
            .await
    }

    /// Most recent persisted signal of `kind` sent to the local user.
    pub async fn latest(&self, kind: SignalKind) -> Result<Option<Signal>> {
        let signal = self.signals.latest_signal(&self.call_id, kind).await?;
        Ok(signal.filter(|s| self.accepts(s)))
    }

    /// Inbound signals, each delivered once, in relay order.
    pub async fn incoming(&self, relay: &dyn Relay) -> Result<SignalStream> {
        let feed = relay
            .subscribe(
                &signals_channel(&self.call_id, &self.local_user),
                Subscription::changes_where(SIGNALS_TABLE, "call_id", &self.call_id),
            )
            .await?;

        let channel = self.clone();
        let mut seen = HashSet::new();
        Ok(feed
            .filter_map(move |event| {
                let signal = match event {
                    RelayEvent::Change(change) if change.kind == ChangeKind::Insert => {
                        match change.decode::<Signal>() {
                            Ok(signal) => Some(signal),
                            Err(e) => {
                                tracing::warn!("Ignoring malformed signal row: {}", e);
                                None
                            }
                        }
                    }
                    _ => None,
                };
                let signal = signal.filter(|s| channel.accepts(s) && seen.insert(s.id.clone()));
                futures::future::ready(signal)
            })
            .boxed())
    }
}
