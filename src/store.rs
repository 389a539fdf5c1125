//! SQLite persistence layer.
//!
//! Owns every durable row: chat activity state, dispatch history, scarcity
//! notices and pending captcha challenges. Cross-task correctness rests on
//! two properties of this module: primary-key constraints (one activity row
//! per chat, one dispatch row per (content, chat)) and the atomic claim on
//! pending challenges. A claim is a single `DELETE ... RETURNING` statement,
//! so exactly one caller ever observes and removes a given challenge row;
//! the response handler and the expiry sweep never read challenges any
//! other way.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors raised by the persistence layer
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// A claimed pending-challenge row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChallenge {
    /// Chat the challenge was issued in
    pub chat_id: i64,
    /// Member the challenge was issued to
    pub user_id: i64,
    /// Identifier of the challenge message
    pub message_id: i32,
    /// Expected answer token
    pub answer_id: String,
    /// Unix timestamp of row insertion
    pub inserted_at: i64,
}

/// Handle to the SQLite database
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database file and initialize the schema
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the file cannot be opened or the schema
    /// cannot be created.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            r"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database, mainly for tests
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if schema creation fails.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS chat_states (
                chat_id INTEGER PRIMARY KEY,
                last_activity INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS dispatch_history (
                content_hash TEXT NOT NULL,
                chat_id INTEGER NOT NULL,
                inserted_at INTEGER NOT NULL,
                PRIMARY KEY (content_hash, chat_id)
            );
            CREATE TABLE IF NOT EXISTS scarcity_notices (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL,
                inserted_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS pending_challenges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                answer_id TEXT NOT NULL,
                inserted_at INTEGER NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Upsert the last-activity timestamp for a chat
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn record_activity(
        &self,
        chat_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn.lock().await.execute(
            "INSERT INTO chat_states (chat_id, last_activity) VALUES (?1, ?2)
             ON CONFLICT(chat_id) DO UPDATE SET last_activity = excluded.last_activity",
            params![chat_id, at.timestamp()],
        )?;
        Ok(())
    }

    /// Chats whose last activity predates `cutoff` and that received no
    /// dispatch since `cutoff`
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn idle_chats(&self, cutoff: DateTime<Utc>) -> Result<Vec<i64>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT chat_id FROM chat_states
             WHERE last_activity < ?1
               AND NOT EXISTS (
                   SELECT 1 FROM dispatch_history
                   WHERE dispatch_history.chat_id = chat_states.chat_id
                     AND dispatch_history.inserted_at > ?1
               )",
        )?;
        let rows = stmt.query_map(params![cutoff.timestamp()], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<i64>, _>>()?)
    }

    /// Content identities already dispatched to a chat
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn dispatched_hashes(&self, chat_id: i64) -> Result<HashSet<String>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT content_hash FROM dispatch_history WHERE chat_id = ?1")?;
        let rows = stmt.query_map(params![chat_id], |row| row.get(0))?;
        Ok(rows.collect::<Result<HashSet<String>, _>>()?)
    }

    /// Record a successful dispatch. The (content, chat) primary key makes a
    /// second insert for the same pair fail.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure, including a constraint
    /// violation for a duplicate (content, chat) pair.
    pub async fn insert_dispatch(
        &self,
        content_hash: &str,
        chat_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn.lock().await.execute(
            "INSERT INTO dispatch_history (content_hash, chat_id, inserted_at)
             VALUES (?1, ?2, ?3)",
            params![content_hash, chat_id, at.timestamp()],
        )?;
        Ok(())
    }

    /// Whether a scarcity notice was recorded for the chat after `cutoff`
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn scarcity_notified_since(
        &self,
        chat_id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let notified = conn.query_row(
            "SELECT EXISTS(
                 SELECT 1 FROM scarcity_notices
                 WHERE chat_id = ?1 AND inserted_at > ?2
             )",
            params![chat_id, cutoff.timestamp()],
            |row| row.get(0),
        )?;
        Ok(notified)
    }

    /// Record a scarcity notice for the chat
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn insert_scarcity_notice(
        &self,
        chat_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn.lock().await.execute(
            "INSERT INTO scarcity_notices (chat_id, inserted_at) VALUES (?1, ?2)",
            params![chat_id, at.timestamp()],
        )?;
        Ok(())
    }

    /// Record a pending challenge. Callers must claim any existing challenge
    /// for the (chat, user) pair first; that is what keeps the pair unique.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn insert_challenge(
        &self,
        chat_id: i64,
        user_id: i64,
        message_id: i32,
        answer_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn.lock().await.execute(
            "INSERT INTO pending_challenges (chat_id, user_id, message_id, answer_id, inserted_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![chat_id, user_id, message_id, answer_id, at.timestamp()],
        )?;
        Ok(())
    }

    /// Atomically delete and return the pending challenge for (chat, user).
    /// Exactly one caller observes any given row.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn claim_challenge(
        &self,
        chat_id: i64,
        user_id: i64,
    ) -> Result<Option<PendingChallenge>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "DELETE FROM pending_challenges
             WHERE chat_id = ?1 AND user_id = ?2
             RETURNING chat_id, user_id, message_id, answer_id, inserted_at",
        )?;
        let claimed = stmt
            .query_map(params![chat_id, user_id], row_to_challenge)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(claimed.into_iter().next())
    }

    /// Atomically delete and return every pending challenge inserted before
    /// `cutoff`
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn claim_expired_challenges(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PendingChallenge>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "DELETE FROM pending_challenges
             WHERE inserted_at < ?1
             RETURNING chat_id, user_id, message_id, answer_id, inserted_at",
        )?;
        let claimed = stmt
            .query_map(params![cutoff.timestamp()], row_to_challenge)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(claimed)
    }

    /// Whether a pending challenge exists for (chat, user). Informational
    /// only; never used in place of a claim.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn has_challenge(&self, chat_id: i64, user_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let exists = conn.query_row(
            "SELECT EXISTS(
                 SELECT 1 FROM pending_challenges
                 WHERE chat_id = ?1 AND user_id = ?2
             )",
            params![chat_id, user_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }
}

fn row_to_challenge(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingChallenge> {
    Ok(PendingChallenge {
        chat_id: row.get(0)?,
        user_id: row.get(1)?,
        message_id: row.get(2)?,
        answer_id: row.get(3)?,
        inserted_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn store() -> Store {
        Store::open_in_memory().expect("in-memory store")
    }

    #[tokio::test]
    async fn test_claim_challenge_succeeds_exactly_once() {
        let store = store();
        let now = Utc::now();
        store
            .insert_challenge(10, 20, 555, "green", now)
            .await
            .expect("insert");

        let first = store.claim_challenge(10, 20).await.expect("claim");
        let challenge = first.expect("first claim returns the row");
        assert_eq!(challenge.chat_id, 10);
        assert_eq!(challenge.user_id, 20);
        assert_eq!(challenge.message_id, 555);
        assert_eq!(challenge.answer_id, "green");

        let second = store.claim_challenge(10, 20).await.expect("claim");
        assert!(second.is_none(), "second claim must observe nothing");
    }

    #[tokio::test]
    async fn test_claim_challenge_ignores_other_pairs() {
        let store = store();
        let now = Utc::now();
        store
            .insert_challenge(10, 20, 1, "red", now)
            .await
            .expect("insert");

        assert!(store.claim_challenge(10, 99).await.expect("claim").is_none());
        assert!(store.claim_challenge(99, 20).await.expect("claim").is_none());
        assert!(store.has_challenge(10, 20).await.expect("exists"));
    }

    #[tokio::test]
    async fn test_claim_expired_challenges_respects_cutoff() {
        let store = store();
        let now = Utc::now();
        let stale = now - TimeDelta::seconds(120);
        store
            .insert_challenge(1, 11, 1, "red", stale)
            .await
            .expect("insert");
        store
            .insert_challenge(2, 22, 2, "blue", stale)
            .await
            .expect("insert");
        store
            .insert_challenge(3, 33, 3, "green", now)
            .await
            .expect("insert");

        let cutoff = now - TimeDelta::seconds(60);
        let expired = store
            .claim_expired_challenges(cutoff)
            .await
            .expect("sweep claim");
        assert_eq!(expired.len(), 2);
        assert!(expired.iter().all(|c| c.inserted_at < cutoff.timestamp()));

        // The fresh challenge survives and is still claimable
        assert!(store.has_challenge(3, 33).await.expect("exists"));
        assert!(store.claim_challenge(3, 33).await.expect("claim").is_some());
    }

    #[tokio::test]
    async fn test_dispatch_history_rejects_duplicate_pair() {
        let store = store();
        let now = Utc::now();
        store
            .insert_dispatch("abc123", 7, now)
            .await
            .expect("first insert");

        let duplicate = store.insert_dispatch("abc123", 7, now).await;
        assert!(matches!(duplicate, Err(StoreError::Sqlite(_))));

        // Same content for a different chat is fine
        store
            .insert_dispatch("abc123", 8, now)
            .await
            .expect("other chat insert");
    }

    #[tokio::test]
    async fn test_idle_chats_excludes_recently_serviced() {
        let store = store();
        let now = Utc::now();
        let cutoff = now - TimeDelta::seconds(3600);
        let stale = now - TimeDelta::seconds(7200);

        store.record_activity(1, stale).await.expect("activity");
        store.record_activity(2, stale).await.expect("activity");
        store.record_activity(3, now).await.expect("activity");

        // Chat 2 was serviced within the window
        store
            .insert_dispatch("hash", 2, now)
            .await
            .expect("dispatch");

        let idle = store.idle_chats(cutoff).await.expect("idle query");
        assert_eq!(idle, vec![1]);
    }

    #[tokio::test]
    async fn test_record_activity_upserts() {
        let store = store();
        let now = Utc::now();
        let stale = now - TimeDelta::seconds(7200);
        let cutoff = now - TimeDelta::seconds(3600);

        store.record_activity(5, stale).await.expect("activity");
        assert_eq!(store.idle_chats(cutoff).await.expect("idle"), vec![5]);

        // Fresh activity moves the chat out of the idle set
        store.record_activity(5, now).await.expect("activity");
        assert!(store.idle_chats(cutoff).await.expect("idle").is_empty());
    }

    #[tokio::test]
    async fn test_scarcity_notice_window() {
        let store = store();
        let now = Utc::now();
        let cutoff = now - TimeDelta::seconds(600);

        assert!(!store
            .scarcity_notified_since(4, cutoff)
            .await
            .expect("window check"));

        store
            .insert_scarcity_notice(4, now)
            .await
            .expect("insert notice");
        assert!(store
            .scarcity_notified_since(4, cutoff)
            .await
            .expect("window check"));

        // An old notice outside the window does not count
        assert!(!store
            .scarcity_notified_since(4, now + TimeDelta::seconds(1))
            .await
            .expect("window check"));
    }
}
