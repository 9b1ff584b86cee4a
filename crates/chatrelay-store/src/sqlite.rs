//! SQLite-backed store for users, sessions and the per-session message log.

use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::message_store::MessageStore;
use crate::schema::SCHEMA_SQL;
use crate::types::*;
use chatrelay_core::{Error, Result};

const DEFAULT_SESSION_TITLE: &str = "New Chat";

/// SQLite store. A single connection behind a mutex serializes writes, which
/// keeps per-session append order identical to call order.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the SQLite store.
    ///
    /// `db_dir` is the data directory. The file will be `db_dir/chatrelay.db`.
    pub fn open(db_dir: impl AsRef<Path>) -> Result<Self> {
        let db_dir = db_dir.as_ref();
        std::fs::create_dir_all(db_dir).map_err(|e| Error::Storage(e.to_string()))?;
        let db_path = db_dir.join("chatrelay.db");

        let conn = Self::create_connection(&db_path)?;
        Self::init_schema(&conn)?;

        let store = Self {
            conn: Mutex::new(conn),
        };

        info!(
            "SqliteStore initialized: {} sessions, {} messages, path={}",
            store.count_sessions()?,
            store.count_all_messages()?,
            db_path.display()
        );

        Ok(store)
    }

    fn create_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path).map_err(|e| Error::Database(e.to_string()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Users and sessions
    // ---------------------------------------------------------------

    /// Return the user with `user_id`, creating a fresh user when the id is
    /// absent or unknown.
    pub fn ensure_user(&self, user_id: Option<&str>) -> Result<User> {
        let conn = self.conn.lock();

        if let Some(id) = user_id {
            let existing = conn
                .prepare_cached("SELECT id, created_at FROM users WHERE id = ?1")
                .map_err(|e| Error::Database(e.to_string()))?
                .query_row(params![id], |row| {
                    Ok(User {
                        id: row.get(0)?,
                        created_at: row.get(1)?,
                    })
                })
                .optional()
                .map_err(|e| Error::Database(e.to_string()))?;
            if let Some(user) = existing {
                return Ok(user);
            }
        }

        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now_millis(),
        };
        conn.execute(
            "INSERT INTO users (id, created_at) VALUES (?1, ?2)",
            params![user.id, user.created_at],
        )
        .map_err(|e| Error::Storage(e.to_string()))?;
        debug!("Created user {}", user.id);
        Ok(user)
    }

    /// Create a session owned by `user_id` (the user is created if needed).
    pub fn create_session(&self, user_id: Option<&str>, title: Option<&str>) -> Result<Session> {
        let user = self.ensure_user(user_id)?;
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_SESSION_TITLE);

        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user.id,
            title: title.to_string(),
            created_at: now_millis(),
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (id, user_id, title, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![session.id, session.user_id, session.title, session.created_at],
        )
        .map_err(|e| Error::Storage(e.to_string()))?;
        debug!("Created session {} for user {}", session.id, session.user_id);
        Ok(session)
    }

    /// Get a session by ID.
    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock();
        Self::find_session(&conn, session_id)
    }

    /// Sessions of a user, newest first.
    pub fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, user_id, title, created_at FROM sessions
                 WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC",
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![user_id], Self::row_to_session)
            .map_err(|e| Error::Database(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub fn count_sessions(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))
    }

    fn find_session(conn: &Connection, session_id: &str) -> Result<Option<Session>> {
        conn.prepare_cached("SELECT id, user_id, title, created_at FROM sessions WHERE id = ?1")
            .map_err(|e| Error::Database(e.to_string()))?
            .query_row(params![session_id], Self::row_to_session)
            .optional()
            .map_err(|e| Error::Database(e.to_string()))
    }

    // ---------------------------------------------------------------
    // Message log
    // ---------------------------------------------------------------

    /// Append a turn. `created_at` never goes backwards within a session, so
    /// timestamp order and append order agree.
    pub fn append(&self, message: &NewMessage) -> Result<Turn> {
        if !message.role.is_persistable() {
            return Err(Error::InvalidInput(format!(
                "role '{}' cannot be persisted",
                message.role
            )));
        }

        let conn = self.conn.lock();
        if Self::find_session(&conn, &message.session_id)?.is_none() {
            return Err(Error::NotFound(format!("session {}", message.session_id)));
        }

        let last: Option<i64> = conn
            .prepare_cached("SELECT MAX(created_at) FROM messages WHERE session_id = ?1")
            .map_err(|e| Error::Database(e.to_string()))?
            .query_row(params![message.session_id], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))?;
        let created_at = last.map_or_else(now_millis, |t| t.max(now_millis()));

        let turn = Turn {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: message.session_id.clone(),
            role: message.role,
            content: message.content.clone(),
            provider: message.provider.clone(),
            model: message.model.clone(),
            incomplete: message.incomplete,
            created_at,
        };

        conn.prepare_cached(
            "INSERT INTO messages (id, session_id, role, provider, model, content, incomplete, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .map_err(|e| Error::Database(e.to_string()))?
        .execute(params![
            turn.id,
            turn.session_id,
            turn.role,
            turn.provider,
            turn.model,
            turn.content,
            turn.incomplete,
            turn.created_at,
        ])
        .map_err(|e| Error::Storage(e.to_string()))?;

        debug!(
            "Appended {} turn {} to session {} ({} chars)",
            turn.role,
            turn.id,
            turn.session_id,
            turn.content.len()
        );
        Ok(turn)
    }

    /// All turns of a session in append order.
    pub fn messages(&self, session_id: &str) -> Result<Vec<Turn>> {
        let conn = self.conn.lock();
        if Self::find_session(&conn, session_id)?.is_none() {
            return Err(Error::NotFound(format!("session {}", session_id)));
        }

        let mut stmt = conn
            .prepare_cached(
                "SELECT id, session_id, role, provider, model, content, incomplete, created_at
                 FROM messages WHERE session_id = ?1 ORDER BY created_at ASC, seq ASC",
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![session_id], Self::row_to_turn)
            .map_err(|e| Error::Database(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub fn count_all_messages(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))
    }

    // ---------------------------------------------------------------
    // Row Mapping Helpers
    // ---------------------------------------------------------------

    fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
        Ok(Session {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            title: row
                .get::<_, Option<String>>("title")?
                .unwrap_or_else(|| DEFAULT_SESSION_TITLE.to_string()),
            created_at: row.get("created_at")?,
        })
    }

    fn row_to_turn(row: &rusqlite::Row<'_>) -> rusqlite::Result<Turn> {
        Ok(Turn {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            role: row.get("role")?,
            content: row.get("content")?,
            provider: row.get("provider")?,
            model: row.get("model")?,
            incomplete: row.get("incomplete")?,
            created_at: row.get("created_at")?,
        })
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append_message(&self, message: NewMessage) -> Result<Turn> {
        self.append(&message)
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<Turn>> {
        self.messages(session_id)
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_store() -> (SqliteStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn test_create_session_creates_user() {
        let (store, _dir) = test_store();

        let session = store.create_session(None, None).unwrap();
        assert_eq!(session.title, "New Chat");

        let again = store.create_session(Some(&session.user_id), Some("Trip plans")).unwrap();
        assert_eq!(again.user_id, session.user_id);
        assert_eq!(again.title, "Trip plans");

        let unknown = store.create_session(Some("no-such-user"), None).unwrap();
        assert_ne!(unknown.user_id, "no-such-user");
    }

    #[test]
    fn test_list_sessions_newest_first() {
        let (store, _dir) = test_store();
        let first = store.create_session(None, Some("first")).unwrap();
        let second = store.create_session(Some(&first.user_id), Some("second")).unwrap();
        store.create_session(None, Some("someone else")).unwrap();

        let sessions = store.list_sessions(&first.user_id).unwrap();
        let ids: Vec<_> = sessions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec![second.id.as_str(), first.id.as_str()]);
    }

    #[test]
    fn test_append_and_list_preserve_order() {
        let (store, _dir) = test_store();
        let session = store.create_session(None, None).unwrap();

        store.append(&NewMessage::user(&session.id, "hi")).unwrap();
        store
            .append(&NewMessage::assistant(&session.id, "Hello!").produced_by("openai", "gpt-4o-mini"))
            .unwrap();
        store.append(&NewMessage::user(&session.id, "how are you?")).unwrap();

        let turns = store.messages(&session.id).unwrap();
        let contents: Vec<_> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["hi", "Hello!", "how are you?"]);
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[1].provider.as_deref(), Some("openai"));
        assert!(!turns[1].incomplete);
        assert!(turns.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[test]
    fn test_append_unknown_session_is_not_found() {
        let (store, _dir) = test_store();
        let result = store.append(&NewMessage::user("missing", "hi"));
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert!(matches!(store.messages("missing"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_system_role_is_rejected() {
        let (store, _dir) = test_store();
        let session = store.create_session(None, None).unwrap();
        let mut msg = NewMessage::user(&session.id, "be terse");
        msg.role = Role::System;
        assert!(matches!(store.append(&msg), Err(Error::InvalidInput(_))));
        assert!(store.messages(&session.id).unwrap().is_empty());
    }

    #[test]
    fn test_incomplete_flag_round_trips() {
        let (store, _dir) = test_store();
        let session = store.create_session(None, None).unwrap();
        store
            .append(&NewMessage::assistant(&session.id, "Partial").incomplete(true))
            .unwrap();
        let turns = store.messages(&session.id).unwrap();
        assert!(turns[0].incomplete);
    }

    #[test]
    fn test_reopen_keeps_messages() {
        let dir = TempDir::new().unwrap();
        let session_id = {
            let store = SqliteStore::open(dir.path()).unwrap();
            let session = store.create_session(None, None).unwrap();
            store.append(&NewMessage::user(&session.id, "persisted")).unwrap();
            session.id
        };
        let store = SqliteStore::open(dir.path()).unwrap();
        assert_eq!(store.messages(&session_id).unwrap()[0].content, "persisted");
    }

    #[tokio::test]
    async fn test_list_messages_is_idempotent() {
        let (store, _dir) = test_store();
        let session = store.create_session(None, None).unwrap();
        store.append_message(NewMessage::user(&session.id, "a")).await.unwrap();
        store.append_message(NewMessage::assistant(&session.id, "b")).await.unwrap();

        let first = store.list_messages(&session.id).await.unwrap();
        let second = store.list_messages(&session.id).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_concurrent_appends_keep_per_session_order() {
        let (store, _dir) = test_store();
        let store = Arc::new(store);
        let a = store.create_session(None, None).unwrap();
        let b = store.create_session(None, None).unwrap();

        let mut handles = Vec::new();
        for session_id in [a.id.clone(), b.id.clone()] {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..20 {
                    store
                        .append_message(NewMessage::user(&session_id, format!("{i}")))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for session in [&a, &b] {
            let turns = store.messages(&session.id).unwrap();
            let contents: Vec<String> = turns.into_iter().map(|t| t.content).collect();
            let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
            assert_eq!(contents, expected);
        }
    }
}
