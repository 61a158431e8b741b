//! REST client for the hosted relational backend
//!
//! Tables are exposed PostgREST-style under `/rest/v1/<table>`: filters are
//! query parameters (`id=eq.<id>`), writes ask for the stored row back with
//! `Prefer: return=representation`.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::models::*;
use crate::relay::*;
use crate::store::{CallStore, MessageStore, ProfileStore, SignalStore};

const RETURN_ROWS: &str = "return=representation";
const UPSERT_ROWS: &str = "resolution=merge-duplicates,return=representation";

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn eq(value: &str) -> String {
    format!("eq.{}", value)
}

/// `or` filter matching messages exchanged between two users in either direction.
fn conversation_filter(user_id: &str, peer_id: &str) -> String {
    format!(
        "(and(sender_id.eq.{u},receiver_id.eq.{p}),and(sender_id.eq.{p},receiver_id.eq.{u}))",
        u = user_id,
        p = peer_id
    )
}

fn involving_filter(user_id: &str) -> String {
    format!("(sender_id.eq.{u},receiver_id.eq.{u})", u = user_id)
}

fn history_query(user_id: &str, peer_id: &str, after: Option<DateTime<Utc>>) -> Vec<(String, String)> {
    let mut query = vec![
        ("select".to_string(), "*".to_string()),
        ("or".to_string(), conversation_filter(user_id, peer_id)),
        ("order".to_string(), "created_at.asc".to_string()),
    ];
    if let Some(after) = after {
        query.push(("created_at".to_string(), format!("gt.{}", timestamp(after))));
    }
    query
}

pub struct RestStore {
    client: Client,
    base_url: String,
    api_key: String,
    access_token: Mutex<Option<String>>,
}

impl RestStore {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| Error::Http(format!("Failed to create HTTP client: {}", e)))?;
        url::Url::parse(&config.rest_url)?;

        Ok(Self {
            client,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            access_token: Mutex::new(None),
        })
    }

    /// Authenticate subsequent requests as a signed-in user instead of the anonymous key.
    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.lock() = token;
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn auth_header(&self) -> String {
        let token = self.access_token.lock();
        format!("Bearer {}", token.as_deref().unwrap_or(&self.api_key))
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, self.table_url(table))
            .header("apikey", &self.api_key)
            .header("Authorization", self.auth_header())
    }

    async fn rows<T: DeserializeOwned>(&self, table: &str, req: RequestBuilder) -> Result<Vec<T>> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Store(format!("{} on {}: {}", status, table, body)));
        }
        Ok(resp.json().await?)
    }

    async fn first<T: DeserializeOwned>(&self, table: &str, req: RequestBuilder) -> Result<Option<T>> {
        Ok(self.rows(table, req).await?.into_iter().next())
    }

    async fn single<T: DeserializeOwned>(&self, table: &str, what: &str, req: RequestBuilder) -> Result<T> {
        self.first(table, req)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} in {}", what, table)))
    }

    pub async fn check_health(&self) -> Result<bool> {
        let resp = self
            .client
            .get(format!("{}/rest/v1/", self.base_url))
            .header("apikey", &self.api_key)
            .send()
            .await;

        match resp {
            Ok(r) => Ok(r.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

#[async_trait]
impl CallStore for RestStore {
    async fn create_call(&self, call: NewCall) -> Result<Call> {
        let req = self
            .request(Method::POST, CALLS_TABLE)
            .header("Prefer", RETURN_ROWS)
            .json(&call);
        self.single(CALLS_TABLE, "created call", req).await
    }

    async fn update_call(&self, call_id: &str, update: CallUpdate) -> Result<Call> {
        let req = self
            .request(Method::PATCH, CALLS_TABLE)
            .query(&[("id", eq(call_id))])
            .header("Prefer", RETURN_ROWS)
            .json(&update);
        self.single(CALLS_TABLE, call_id, req).await
    }

    async fn get_call(&self, call_id: &str) -> Result<Option<Call>> {
        let req = self
            .request(Method::GET, CALLS_TABLE)
            .query(&[("select", "*".to_string()), ("id", eq(call_id))]);
        self.first(CALLS_TABLE, req).await
    }
}

#[async_trait]
impl SignalStore for RestStore {
    async fn insert_signal(&self, signal: NewSignal) -> Result<Signal> {
        let req = self
            .request(Method::POST, SIGNALS_TABLE)
            .header("Prefer", RETURN_ROWS)
            .json(&signal);
        self.single(SIGNALS_TABLE, "inserted signal", req).await
    }

    async fn latest_signal(&self, call_id: &str, kind: SignalKind) -> Result<Option<Signal>> {
        let req = self.request(Method::GET, SIGNALS_TABLE).query(&[
            ("select", "*".to_string()),
            ("call_id", eq(call_id)),
            ("signal_type", eq(kind.as_str())),
            ("order", "created_at.desc".to_string()),
            ("limit", "1".to_string()),
        ]);
        self.first(SIGNALS_TABLE, req).await
    }
}

#[async_trait]
impl ProfileStore for RestStore {
    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        let req = self
            .request(Method::GET, PROFILES_TABLE)
            .query(&[("select", "*".to_string()), ("id", eq(user_id))]);
        self.first(PROFILES_TABLE, req).await
    }

    async fn update_last_seen(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        let req = self
            .request(Method::PATCH, PROFILES_TABLE)
            .query(&[("id", eq(user_id))])
            .json(&json!({ "last_seen": timestamp(at) }));
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(Error::Store(format!(
                "{} updating last_seen for {}",
                resp.status(),
                user_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for RestStore {
    async fn save_message(&self, message: &PrivateMessage) -> Result<()> {
        let req = self
            .request(Method::POST, MESSAGES_TABLE)
            .header("Prefer", RETURN_ROWS)
            .json(message);
        let _: Vec<PrivateMessage> = self.rows(MESSAGES_TABLE, req).await?;
        Ok(())
    }

    async fn history(
        &self,
        user_id: &str,
        peer_id: &str,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<PrivateMessage>> {
        let req = self
            .request(Method::GET, MESSAGES_TABLE)
            .query(&history_query(user_id, peer_id, after));
        self.rows(MESSAGES_TABLE, req).await
    }

    async fn messages_involving(&self, user_id: &str) -> Result<Vec<PrivateMessage>> {
        let req = self.request(Method::GET, MESSAGES_TABLE).query(&[
            ("select", "*".to_string()),
            ("or", involving_filter(user_id)),
            ("order", "created_at.asc".to_string()),
        ]);
        self.rows(MESSAGES_TABLE, req).await
    }

    async fn mark_read(&self, user_id: &str, peer_id: &str) -> Result<u32> {
        let req = self
            .request(Method::PATCH, MESSAGES_TABLE)
            .query(&[
                ("sender_id", eq(peer_id)),
                ("receiver_id", eq(user_id)),
                ("read", eq("false")),
            ])
            .header("Prefer", RETURN_ROWS)
            .json(&json!({ "read": true }));
        let updated: Vec<PrivateMessage> = self.rows(MESSAGES_TABLE, req).await?;
        Ok(updated.len() as u32)
    }

    async fn hidden_conversations(&self, user_id: &str) -> Result<Vec<HiddenConversation>> {
        let req = self
            .request(Method::GET, HIDDEN_TABLE)
            .query(&[("select", "*".to_string()), ("user_id", eq(user_id))]);
        self.rows(HIDDEN_TABLE, req).await
    }

    async fn hide_conversation(
        &self,
        user_id: &str,
        peer_id: &str,
        at: DateTime<Utc>,
    ) -> Result<HiddenConversation> {
        let req = self
            .request(Method::POST, HIDDEN_TABLE)
            .query(&[("on_conflict", "user_id,hidden_user_id")])
            .header("Prefer", UPSERT_ROWS)
            .json(&HiddenConversation {
                user_id: user_id.to_string(),
                hidden_user_id: peer_id.to_string(),
                created_at: at,
            });
        self.single(HIDDEN_TABLE, peer_id, req).await
    }
}
