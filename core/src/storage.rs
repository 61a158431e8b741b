//! Local storage using SQLite

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

use crate::error::Result;
use crate::models::*;
use crate::store::{MessageStore, ProfileStore};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<PrivateMessage> {
    Ok(PrivateMessage {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        message: row.get(3)?,
        image_url: row.get(4)?,
        created_at: from_millis(row.get(5)?),
        read: row.get::<_, i32>(6)? != 0,
    })
}

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, message, image_url, created_at, read";

impl SqliteStore {
    pub fn new(data_dir: &str) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = Path::new(data_dir).join("huddle.db");
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS profiles (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                color TEXT,
                avatar_url TEXT,
                last_seen INTEGER
            );

            CREATE TABLE IF NOT EXISTS private_messages (
                id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                message TEXT,
                image_url TEXT,
                created_at INTEGER NOT NULL,
                read INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS hidden_conversations (
                user_id TEXT NOT NULL,
                hidden_user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, hidden_user_id)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_pair ON private_messages(sender_id, receiver_id);
            CREATE INDEX IF NOT EXISTS idx_messages_created ON private_messages(created_at);
            "#,
        )?;

        Ok(())
    }

    // ========================================================================
    // Profiles
    // ========================================================================

    pub fn save_profile(&self, profile: &Profile) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT OR REPLACE INTO profiles (id, username, color, avatar_url, last_seen)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![
                profile.id,
                profile.username,
                profile.color,
                profile.avatar_url,
                profile.last_seen.map(to_millis),
            ],
        )?;
        Ok(())
    }

    fn load_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        let conn = self.conn.lock();
        let profile = conn
            .query_row(
                "SELECT id, username, color, avatar_url, last_seen FROM profiles WHERE id = ?1",
                params![user_id],
                |row| {
                    Ok(Profile {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        color: row.get(2)?,
                        avatar_url: row.get(3)?,
                        last_seen: row.get::<_, Option<i64>>(4)?.map(from_millis),
                    })
                },
            )
            .optional()?;
        Ok(profile)
    }

    fn store_last_seen(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        // Never move last_seen backwards; duplicate reports are harmless.
        conn.execute(
            r#"INSERT INTO profiles (id, username, last_seen) VALUES (?1, ?1, ?2)
               ON CONFLICT(id) DO UPDATE
               SET last_seen = MAX(COALESCE(profiles.last_seen, 0), excluded.last_seen)"#,
            params![user_id, to_millis(at)],
        )?;
        Ok(())
    }

    // ========================================================================
    // Messages
    // ========================================================================

    fn store_message(&self, msg: &PrivateMessage) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT INTO private_messages (id, sender_id, receiver_id, message, image_url, created_at, read)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
               ON CONFLICT(id) DO UPDATE
               SET message = excluded.message,
                   image_url = excluded.image_url,
                   read = MAX(private_messages.read, excluded.read)"#,
            params![
                msg.id,
                msg.sender_id,
                msg.receiver_id,
                msg.message,
                msg.image_url,
                to_millis(msg.created_at),
                msg.read as i32,
            ],
        )?;
        Ok(())
    }

    fn load_history(
        &self,
        user_id: &str,
        peer_id: &str,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<PrivateMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r#"SELECT {}
               FROM private_messages
               WHERE ((sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1))
                 AND created_at > ?3
               ORDER BY created_at ASC"#,
            MESSAGE_COLUMNS
        ))?;

        let cutoff = after.map(to_millis).unwrap_or(i64::MIN);
        let rows = stmt.query_map(params![user_id, peer_id, cutoff], message_from_row)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    fn load_involving(&self, user_id: &str) -> Result<Vec<PrivateMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r#"SELECT {}
               FROM private_messages
               WHERE sender_id = ?1 OR receiver_id = ?1
               ORDER BY created_at ASC"#,
            MESSAGE_COLUMNS
        ))?;

        let rows = stmt.query_map(params![user_id], message_from_row)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    fn set_read(&self, user_id: &str, peer_id: &str) -> Result<u32> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE private_messages SET read = 1 WHERE sender_id = ?1 AND receiver_id = ?2 AND read = 0",
            params![peer_id, user_id],
        )?;
        Ok(changed as u32)
    }

    // ========================================================================
    // Hidden conversations
    // ========================================================================

    fn load_hidden(&self, user_id: &str) -> Result<Vec<HiddenConversation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id, hidden_user_id, created_at FROM hidden_conversations WHERE user_id = ?1",
        )?;

        let rows = stmt.query_map(params![user_id], |row| {
            Ok(HiddenConversation {
                user_id: row.get(0)?,
                hidden_user_id: row.get(1)?,
                created_at: from_millis(row.get(2)?),
            })
        })?;

        let mut hidden = Vec::new();
        for row in rows {
            hidden.push(row?);
        }
        Ok(hidden)
    }

    fn upsert_hidden(&self, user_id: &str, peer_id: &str, at: DateTime<Utc>) -> Result<HiddenConversation> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT INTO hidden_conversations (user_id, hidden_user_id, created_at)
               VALUES (?1, ?2, ?3)
               ON CONFLICT(user_id, hidden_user_id) DO UPDATE SET created_at = excluded.created_at"#,
            params![user_id, peer_id, to_millis(at)],
        )?;

        Ok(HiddenConversation {
            user_id: user_id.to_string(),
            hidden_user_id: peer_id.to_string(),
            created_at: from_millis(to_millis(at)),
        })
    }

    // ========================================================================
    // Storage management
    // ========================================================================

    pub fn clear_all(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            DELETE FROM private_messages;
            DELETE FROM hidden_conversations;
            DELETE FROM profiles;
            "#,
        )?;
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for SqliteStore {
    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        self.load_profile(user_id)
    }

    async fn update_last_seen(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.store_last_seen(user_id, at)
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn save_message(&self, message: &PrivateMessage) -> Result<()> {
        self.store_message(message)
    }

    async fn history(
        &self,
        user_id: &str,
        peer_id: &str,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<PrivateMessage>> {
        self.load_history(user_id, peer_id, after)
    }

    async fn messages_involving(&self, user_id: &str) -> Result<Vec<PrivateMessage>> {
        self.load_involving(user_id)
    }

    async fn mark_read(&self, user_id: &str, peer_id: &str) -> Result<u32> {
        self.set_read(user_id, peer_id)
    }

    async fn hidden_conversations(&self, user_id: &str) -> Result<Vec<HiddenConversation>> {
        self.load_hidden(user_id)
    }

    async fn hide_conversation(
        &self,
        user_id: &str,
        peer_id: &str,
        at: DateTime<Utc>,
    ) -> Result<HiddenConversation> {
        self.upsert_hidden(user_id, peer_id, at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn msg(id: &str, from: &str, to: &str, at: DateTime<Utc>) -> PrivateMessage {
        PrivateMessage {
            id: id.to_string(),
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            message: Some(format!("text {}", id)),
            image_url: None,
            created_at: at,
            read: false,
        }
    }

    #[tokio::test]
    async fn test_history_respects_cutoff() {
        let store = SqliteStore::in_memory().unwrap();
        let t0 = Utc::now() - Duration::minutes(10);

        store.save_message(&msg("1", "alice", "bob", t0)).await.unwrap();
        store.save_message(&msg("2", "bob", "alice", t0 + Duration::minutes(1))).await.unwrap();
        store.save_message(&msg("3", "carol", "bob", t0 + Duration::minutes(2))).await.unwrap();

        let all = store.history("bob", "alice", None).await.unwrap();
        assert_eq!(all.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), vec!["1", "2"]);

        let after = store.history("bob", "alice", Some(t0)).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, "2");
    }

    #[tokio::test]
    async fn test_mark_read_only_touches_incoming() {
        let store = SqliteStore::in_memory().unwrap();
        let t0 = Utc::now();

        store.save_message(&msg("1", "alice", "bob", t0)).await.unwrap();
        store.save_message(&msg("2", "alice", "bob", t0)).await.unwrap();
        store.save_message(&msg("3", "bob", "alice", t0)).await.unwrap();

        assert_eq!(store.mark_read("bob", "alice").await.unwrap(), 2);
        assert_eq!(store.mark_read("bob", "alice").await.unwrap(), 0);

        let history = store.history("alice", "bob", None).await.unwrap();
        let outgoing = history.iter().find(|m| m.id == "3").unwrap();
        assert!(!outgoing.read);
    }

    #[tokio::test]
    async fn test_hide_refreshes_cutoff() {
        let store = SqliteStore::in_memory().unwrap();
        let first = Utc::now() - Duration::minutes(5);
        let second = Utc::now();

        store.hide_conversation("bob", "alice", first).await.unwrap();
        store.hide_conversation("bob", "alice", second).await.unwrap();

        let hidden = store.hidden_conversations("bob").await.unwrap();
        assert_eq!(hidden.len(), 1);
        assert_eq!(hidden[0].created_at.timestamp_millis(), second.timestamp_millis());
    }

    #[tokio::test]
    async fn test_last_seen_never_moves_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().to_str().unwrap()).unwrap();
        let newer = Utc::now();
        let older = newer - Duration::minutes(3);

        store.update_last_seen("alice", newer).await.unwrap();
        store.update_last_seen("alice", older).await.unwrap();

        let profile = store.get_profile("alice").await.unwrap().unwrap();
        assert_eq!(profile.last_seen.unwrap().timestamp_millis(), newer.timestamp_millis());
    }
}
