//! SQLite backend for the dialogue log and affinity singleton.
//!
//! Uses a single SQLite database file with two tables:
//! - `conversations` — the append-only turn log, keyed by an autoincrement id
//! - `stats` — small key/value rows; `affinity_level` and `affinity_exp`
//!   hold the affinity singleton
//!
//! Older databases wrote `created_at` via `CURRENT_TIMESTAMP`; both that
//! format and RFC 3339 are accepted on read.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use lunavilla_core::affinity::AffinityState;
use lunavilla_core::error::StoreError;
use lunavilla_core::message::{Role, Turn, TurnId};
use lunavilla_core::store::{AffinityStore, HistoryStore};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

const LEVEL_KEY: &str = "affinity_level";
const EXP_KEY: &str = "affinity_exp";

/// A production SQLite store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    ///
    /// Pass `"sqlite::memory:"` for an in-process ephemeral database (useful for tests).
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Unavailable(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create the two tables this store owns and seed the affinity rows.
    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                role        TEXT NOT NULL,
                content     TEXT NOT NULL,
                title       TEXT DEFAULT '',
                is_memo     BOOLEAN DEFAULT 0,
                created_at  TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("conversations table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stats (
                key         TEXT PRIMARY KEY,
                value_int   INTEGER DEFAULT 0,
                value_text  TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("stats table: {e}")))?;

        sqlx::query("INSERT OR IGNORE INTO stats (key, value_int) VALUES (?1, 1), (?2, 0)")
            .bind(LEVEL_KEY)
            .bind(EXP_KEY)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("affinity seed: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    /// Parse a `Turn` from a SQLite row.
    fn row_to_turn(row: &sqlx::sqlite::SqliteRow) -> Result<Turn, StoreError> {
        let id: i64 = row
            .try_get("id")
            .map_err(|e| StoreError::QueryFailed(format!("id column: {e}")))?;
        let role: String = row
            .try_get("role")
            .map_err(|e| StoreError::QueryFailed(format!("role column: {e}")))?;
        let content: String = row
            .try_get("content")
            .map_err(|e| StoreError::QueryFailed(format!("content column: {e}")))?;
        let is_memo: Option<bool> = row.try_get("is_memo").unwrap_or(None);
        let created_at: Option<String> = row.try_get("created_at").unwrap_or(None);

        Ok(Turn {
            id: TurnId(id),
            role: Role::from_stored(&role),
            content,
            created_at: created_at
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_else(Utc::now),
            is_memo: is_memo.unwrap_or(false),
        })
    }

    async fn read_stat(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query("SELECT value_int FROM stats WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("stat {key}: {e}")))?;

        match row {
            Some(r) => r
                .try_get::<Option<i64>, _>("value_int")
                .map_err(|e| StoreError::QueryFailed(format!("value_int column: {e}"))),
            None => Ok(None),
        }
    }
}

/// Accept RFC 3339 and SQLite's `CURRENT_TIMESTAMP` format (UTC).
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

#[async_trait]
impl HistoryStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn append(&self, role: Role, content: &str) -> Result<TurnId, StoreError> {
        let result = sqlx::query(
            "INSERT INTO conversations (role, content, created_at) VALUES (?1, ?2, ?3)",
        )
        .bind(role.as_str())
        .bind(content)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::WriteFailed(format!("INSERT failed: {e}")))?;

        let id = TurnId(result.last_insert_rowid());
        debug!(turn_id = %id, role = %role, "Appended turn");
        Ok(id)
    }

    async fn recent(&self, before: TurnId, limit: usize) -> Result<Vec<Turn>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, role, content, is_memo, created_at
            FROM conversations
            WHERE id < ?1
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )
        .bind(before.0)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("recent window: {e}")))?;

        let mut turns = rows
            .iter()
            .map(Self::row_to_turn)
            .collect::<Result<Vec<_>, _>>()?;
        turns.reverse();
        Ok(turns)
    }

    async fn count(&self, role: Role) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM conversations WHERE role = ?1")
            .bind(role.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("COUNT: {e}")))?;

        let cnt: i64 = row
            .try_get("cnt")
            .map_err(|e| StoreError::QueryFailed(format!("cnt column: {e}")))?;

        Ok(cnt as usize)
    }

    async fn clear(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM conversations WHERE is_memo = 0 OR is_memo IS NULL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::WriteFailed(format!("CLEAR failed: {e}")))?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AffinityStore for SqliteStore {
    async fn load(&self) -> Result<AffinityState, StoreError> {
        let initial = AffinityState::default();
        Ok(AffinityState {
            level: self.read_stat(LEVEL_KEY).await?.unwrap_or(initial.level),
            experience: self.read_stat(EXP_KEY).await?.unwrap_or(initial.experience),
        })
    }

    async fn save(&self, state: AffinityState) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Unavailable(format!("BEGIN failed: {e}")))?;

        for (key, value) in [(LEVEL_KEY, state.level), (EXP_KEY, state.experience)] {
            sqlx::query(
                r#"
                INSERT INTO stats (key, value_int) VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET value_int = excluded.value_int
                "#,
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::WriteFailed(format!("stat {key}: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::WriteFailed(format!("COMMIT failed: {e}")))?;

        debug!(level = state.level, experience = state.experience, "Saved affinity");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn append_assigns_increasing_ids() {
        let db = test_store().await;
        let a = db.append(Role::User, "hello").await.unwrap();
        let b = db.append(Role::Companion, "hi!").await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn recent_is_oldest_first_and_excludes_before() {
        let db = test_store().await;
        db.append(Role::User, "one").await.unwrap();
        db.append(Role::Companion, "two").await.unwrap();
        db.append(Role::User, "three").await.unwrap();
        let current = db.append(Role::User, "current").await.unwrap();

        let window = db.recent(current, 10).await.unwrap();
        let contents: Vec<&str> = window.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
        assert_eq!(window[1].role, Role::Companion);
    }

    #[tokio::test]
    async fn recent_respects_limit() {
        let db = test_store().await;
        for i in 0..30 {
            db.append(Role::User, &format!("message {i}")).await.unwrap();
        }
        let current = db.append(Role::User, "now").await.unwrap();

        let window = db.recent(current, 5).await.unwrap();
        assert_eq!(window.len(), 5);
        assert_eq!(window[0].content, "message 25");
        assert_eq!(window[4].content, "message 29");
    }

    #[tokio::test]
    async fn recent_on_empty_log() {
        let db = test_store().await;
        let current = db.append(Role::User, "first ever").await.unwrap();
        assert!(db.recent(current, 20).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn count_by_role() {
        let db = test_store().await;
        db.append(Role::User, "a").await.unwrap();
        db.append(Role::Companion, "b").await.unwrap();
        db.append(Role::User, "c").await.unwrap();
        assert_eq!(db.count(Role::User).await.unwrap(), 2);
        assert_eq!(db.count(Role::Companion).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn clear_keeps_memos() {
        let db = test_store().await;
        db.append(Role::User, "chatter").await.unwrap();
        let memo = db.append(Role::User, "remember the milk").await.unwrap();
        sqlx::query("UPDATE conversations SET is_memo = 1 WHERE id = ?1")
            .bind(memo.0)
            .execute(&db.pool)
            .await
            .unwrap();

        let removed = db.clear().await.unwrap();
        assert_eq!(removed, 1);

        let next = db.append(Role::User, "after").await.unwrap();
        let window = db.recent(next, 10).await.unwrap();
        assert_eq!(window.len(), 1);
        assert!(window[0].is_memo);
    }

    #[tokio::test]
    async fn affinity_starts_at_level_one() {
        let db = test_store().await;
        assert_eq!(db.load().await.unwrap(), AffinityState::new(1, 0));
    }

    #[tokio::test]
    async fn affinity_save_and_load() {
        let db = test_store().await;
        db.save(AffinityState::new(7, 40)).await.unwrap();
        assert_eq!(db.load().await.unwrap(), AffinityState::new(7, 40));
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("luna.db");
        let url = format!("sqlite://{}", path.display());

        {
            let db = SqliteStore::new(&url).await.unwrap();
            db.append(Role::User, "persisted").await.unwrap();
            db.save(AffinityState::new(3, 20)).await.unwrap();
            db.pool.close().await;
        }

        let db = SqliteStore::new(&url).await.unwrap();
        assert_eq!(db.load().await.unwrap(), AffinityState::new(3, 20));
        assert_eq!(db.count(Role::User).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn legacy_timestamp_is_parsed() {
        let db = test_store().await;
        sqlx::query(
            "INSERT INTO conversations (role, content, created_at) VALUES ('luna', 'old', '2024-05-01 08:30:00')",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        let next = db.append(Role::User, "new").await.unwrap();

        let window = db.recent(next, 10).await.unwrap();
        assert_eq!(window[0].created_at.to_rfc3339(), "2024-05-01T08:30:00+00:00");
    }

    #[test]
    fn parse_timestamp_formats() {
        assert!(parse_timestamp("2025-01-02T03:04:05+00:00").is_some());
        assert!(parse_timestamp("2025-01-02 03:04:05").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
