//! SQLite-backed persistence for sessions and turns.
//!
//! The store exclusively owns persisted turns: the controller hands a turn
//! over only once it is finalized, and nothing here ever mutates one again.
//! Single-process use only.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::core::constants::TITLE_MAX_CHARS;
use crate::core::message::{Role, Turn, TurnStatus};

/// Errors raised by the session store.
#[derive(Debug)]
pub enum StorageError {
    /// The backing database file could not be opened or created.
    Open {
        /// Path to the database file that could not be opened.
        path: PathBuf,
        /// The underlying driver error.
        source: sqlx::Error,
    },

    /// A query against the backing database failed.
    Query(sqlx::Error),

    /// A stored row carried a value the data model rejects.
    Corrupt(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Open { path, source } => {
                write!(
                    f,
                    "failed to open history database at {}: {}",
                    path.display(),
                    source
                )
            }
            StorageError::Query(source) => write!(f, "history database query failed: {source}"),
            StorageError::Corrupt(detail) => {
                write!(f, "history database contains invalid data: {detail}")
            }
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Open { source, .. } => Some(source),
            StorageError::Query(source) => Some(source),
            StorageError::Corrupt(_) => None,
        }
    }
}

/// Session listing row: everything about a session except its turns.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMeta {
    pub id: i64,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Open (creating if necessary) the history database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|source| StorageError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// An in-memory store with the same schema, for tests. History written
    /// here is gone when the process exits.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StorageError::Query)?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|source| StorageError::Open {
                path: PathBuf::from(":memory:"),
                source,
            })?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Query)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS turns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::Query)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(session_id)")
            .execute(&self.pool)
            .await
            .map_err(StorageError::Query)?;

        Ok(())
    }

    pub async fn create_session(&self) -> Result<SessionMeta, StorageError> {
        let now = Utc::now();
        let result = sqlx::query("INSERT INTO sessions (title, created_at, updated_at) VALUES ('', ?1, ?2)")
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(StorageError::Query)?;

        Ok(SessionMeta {
            id: result.last_insert_rowid(),
            title: String::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn session(&self, id: i64) -> Result<Option<SessionMeta>, StorageError> {
        let row: Option<(i64, String, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT id, title, created_at, updated_at FROM sessions WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Query)?;

        Ok(row.map(|(id, title, created_at, updated_at)| SessionMeta {
            id,
            title,
            created_at,
            updated_at,
        }))
    }

    /// Recent sessions first, newest id breaking ties.
    pub async fn list_sessions(&self, limit: i64) -> Result<Vec<SessionMeta>, StorageError> {
        let rows: Vec<(i64, String, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT id, title, created_at, updated_at FROM sessions
             ORDER BY updated_at DESC, id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Query)?;

        Ok(rows
            .into_iter()
            .map(|(id, title, created_at, updated_at)| SessionMeta {
                id,
                title,
                created_at,
                updated_at,
            })
            .collect())
    }

    /// Returns false when no session has this id.
    pub async fn rename_session(&self, id: i64, title: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE sessions SET title = ?1 WHERE id = ?2")
            .bind(title)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(StorageError::Query)?;
        Ok(result.rows_affected() > 0)
    }

    /// Removes the session and, through the cascade, every turn it owns.
    /// Returns false when no session has this id.
    pub async fn delete_session(&self, id: i64) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(StorageError::Query)?;
        Ok(result.rows_affected() > 0)
    }

    /// Append a finalized turn and touch the owning session. The first user
    /// turn also derives the session title, all in one transaction.
    pub async fn append_turn(&self, session_id: i64, turn: &Turn) -> Result<(), StorageError> {
        debug_assert!(turn.status.is_final(), "only finalized turns are persisted");

        let mut tx = self.pool.begin().await.map_err(StorageError::Query)?;

        sqlx::query(
            "INSERT INTO turns (session_id, role, content, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(session_id)
        .bind(turn.role.as_str())
        .bind(&turn.content)
        .bind(turn.status.as_str())
        .bind(turn.created_at)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::Query)?;

        sqlx::query("UPDATE sessions SET updated_at = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Query)?;

        if turn.role.is_user() {
            let (user_turns,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM turns WHERE session_id = ?1 AND role = 'user'",
            )
            .bind(session_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(StorageError::Query)?;

            if user_turns == 1 {
                sqlx::query("UPDATE sessions SET title = ?1 WHERE id = ?2")
                    .bind(derive_title(&turn.content))
                    .bind(session_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(StorageError::Query)?;
            }
        }

        tx.commit().await.map_err(StorageError::Query)
    }

    /// Every turn of a session, oldest first.
    pub async fn list_turns(&self, session_id: i64) -> Result<Vec<Turn>, StorageError> {
        let rows: Vec<(String, String, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT role, content, status, created_at FROM turns
             WHERE session_id = ?1 ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Query)?;

        rows.into_iter()
            .map(|(role, content, status, created_at)| {
                Ok(Turn {
                    role: Role::try_from(role.as_str()).map_err(StorageError::Corrupt)?,
                    content,
                    status: TurnStatus::try_from(status.as_str()).map_err(StorageError::Corrupt)?,
                    created_at,
                })
            })
            .collect()
    }
}

/// Session title from the first user message: its first line, truncated.
pub fn derive_title(first_user_text: &str) -> String {
    let first_line = first_user_text.lines().next().unwrap_or("").trim();
    let mut title: String = first_line.chars().take(TITLE_MAX_CHARS).collect();
    if first_line.chars().count() > TITLE_MAX_CHARS {
        title.push_str("...");
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::TurnStatus;
    use tempfile::tempdir;

    fn assistant_turn(content: &str, status: TurnStatus) -> Turn {
        let mut turn = Turn::pending_assistant();
        turn.append_fragment(content);
        turn.finalize(status);
        turn
    }

    #[tokio::test]
    async fn turns_round_trip_in_order() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(&dir.path().join("history.sqlite3"))
            .await
            .unwrap();
        let session = store.create_session().await.unwrap();

        let user = Turn::user("Hello");
        let reply = assistant_turn("Hi there", TurnStatus::Complete);
        store.append_turn(session.id, &user).await.unwrap();
        store.append_turn(session.id, &reply).await.unwrap();

        let turns = store.list_turns(session.id).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].content, "Hello");
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[1].content, "Hi there");
        assert_eq!(turns[1].status, TurnStatus::Complete);
    }

    #[tokio::test]
    async fn cancelled_turns_keep_their_partial_text() {
        let store = SessionStore::open_in_memory().await.unwrap();
        let session = store.create_session().await.unwrap();

        store
            .append_turn(session.id, &Turn::user("Explain X"))
            .await
            .unwrap();
        store
            .append_turn(session.id, &assistant_turn("Expl", TurnStatus::Cancelled))
            .await
            .unwrap();

        let turns = store.list_turns(session.id).await.unwrap();
        assert_eq!(turns[1].content, "Expl");
        assert_eq!(turns[1].status, TurnStatus::Cancelled);
    }

    #[tokio::test]
    async fn deleting_a_session_removes_its_turns() {
        let store = SessionStore::open_in_memory().await.unwrap();
        let session = store.create_session().await.unwrap();
        store
            .append_turn(session.id, &Turn::user("gone soon"))
            .await
            .unwrap();

        assert!(store.delete_session(session.id).await.unwrap());
        assert!(store.session(session.id).await.unwrap().is_none());
        assert!(store.list_turns(session.id).await.unwrap().is_empty());

        // A second delete finds nothing.
        assert!(!store.delete_session(session.id).await.unwrap());
    }

    #[tokio::test]
    async fn first_user_turn_titles_the_session() {
        let store = SessionStore::open_in_memory().await.unwrap();
        let session = store.create_session().await.unwrap();

        store
            .append_turn(session.id, &Turn::user("What is the airspeed of a swallow?"))
            .await
            .unwrap();
        store
            .append_turn(session.id, &Turn::user("second message"))
            .await
            .unwrap();

        let meta = store.session(session.id).await.unwrap().unwrap();
        assert_eq!(meta.title, "What is the airspeed of a swal...");

        assert!(store.rename_session(session.id, "Swallows").await.unwrap());
        let meta = store.session(session.id).await.unwrap().unwrap();
        assert_eq!(meta.title, "Swallows");
    }

    #[tokio::test]
    async fn listings_put_recently_updated_sessions_first() {
        let store = SessionStore::open_in_memory().await.unwrap();
        let older = store.create_session().await.unwrap();
        let newer = store.create_session().await.unwrap();

        store
            .append_turn(older.id, &Turn::user("bump"))
            .await
            .unwrap();

        let sessions = store.list_sessions(10).await.unwrap();
        assert_eq!(sessions[0].id, older.id);
        assert_eq!(sessions[1].id, newer.id);
    }

    #[test]
    fn titles_truncate_on_character_boundaries() {
        assert_eq!(derive_title("short"), "short");
        assert_eq!(derive_title("multi\nline input"), "multi");
        let long = "x".repeat(40);
        let title = derive_title(&long);
        assert!(title.ends_with("..."));
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 3);
    }
}
