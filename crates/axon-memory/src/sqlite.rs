//! SQLite chat store.
//!
//! Wraps a single connection in a `Mutex`; the schema is created
//! idempotently on construction so callers can point at a fresh file.

use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::Connection;
use tracing::debug;

use axon_core::types::Role;

use crate::error::{MemoryError, Result};
use crate::store::{ChatStore, SessionRecord, StoredMessage};

pub struct SqliteChatStore {
    db: Mutex<Connection>,
}

impl SqliteChatStore {
    /// Wrap an open connection, creating tables when missing.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        Self::new(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }
}

/// Initialise chat tables. Safe to call on every startup (idempotent).
fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS chat_sessions (
            user_id          TEXT NOT NULL,
            session_id       TEXT NOT NULL,
            summary          TEXT NOT NULL DEFAULT '',
            summarized_count INTEGER NOT NULL DEFAULT 0,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL,
            PRIMARY KEY (user_id, session_id)
        );
        CREATE TABLE IF NOT EXISTS chat_messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     TEXT NOT NULL,
            session_id  TEXT NOT NULL,
            role        TEXT NOT NULL,
            content     TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_chat_messages_session
            ON chat_messages(user_id, session_id, created_at, id);",
    )
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        user_id: row.get(0)?,
        session_id: row.get(1)?,
        summary: row.get(2)?,
        summarized_count: row.get::<_, i64>(3)? as usize,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn list_messages(
        &self,
        user_id: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let db = self.db.lock().unwrap();
        let sql = if limit > 0 {
            "SELECT id, role, content, created_at FROM chat_messages
             WHERE user_id = ?1 AND session_id = ?2
             ORDER BY created_at DESC, id DESC LIMIT ?3"
        } else {
            "SELECT id, role, content, created_at FROM chat_messages
             WHERE user_id = ?1 AND session_id = ?2
             ORDER BY created_at, id"
        };
        let mut stmt = db.prepare(sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            let role_str: String = row.get(1)?;
            Ok(StoredMessage {
                id: row.get(0)?,
                role: role_str.parse().unwrap_or(Role::User),
                content: row.get(2)?,
                created_at: row.get(3)?,
            })
        };
        let mut msgs: Vec<StoredMessage> = if limit > 0 {
            let rows =
                stmt.query_map(rusqlite::params![user_id, session_id, limit as i64], map_row)?;
            let mut v: Vec<_> = rows.filter_map(|r| r.ok()).collect();
            v.reverse(); // oldest first
            v
        } else {
            let rows = stmt.query_map(rusqlite::params![user_id, session_id], map_row)?;
            rows.filter_map(|r| r.ok()).collect()
        };
        debug!(count = msgs.len(), session = session_id, "loaded messages");
        msgs.shrink_to_fit();
        Ok(msgs)
    }

    async fn get_session(&self, user_id: &str, session_id: &str) -> Result<SessionRecord> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT user_id, session_id, summary, summarized_count, created_at, updated_at
             FROM chat_sessions WHERE user_id = ?1 AND session_id = ?2",
            rusqlite::params![user_id, session_id],
            row_to_session,
        ) {
            Ok(s) => Ok(s),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(MemoryError::NotFound {
                user_id: user_id.to_string(),
                session_id: session_id.to_string(),
            }),
            Err(e) => Err(MemoryError::Database(e)),
        }
    }

    async fn ensure_session(&self, user_id: &str, session_id: &str) -> Result<SessionRecord> {
        {
            let db = self.db.lock().unwrap();
            let now = chrono::Utc::now().to_rfc3339();
            db.execute(
                "INSERT OR IGNORE INTO chat_sessions
                 (user_id, session_id, summary, summarized_count, created_at, updated_at)
                 VALUES (?1, ?2, '', 0, ?3, ?3)",
                rusqlite::params![user_id, session_id, now],
            )?;
        }
        self.get_session(user_id, session_id).await
    }

    async fn append_message(
        &self,
        user_id: &str,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO chat_messages (user_id, session_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![user_id, session_id, role.to_string(), content, now],
        )?;
        Ok(())
    }

    async fn update_summary(
        &self,
        user_id: &str,
        session_id: &str,
        summary: &str,
        summarized_count: usize,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        // Summary and count go in one statement so they never diverge.
        let rows = db.execute(
            "UPDATE chat_sessions
             SET summary = ?1, summarized_count = ?2, updated_at = ?3
             WHERE user_id = ?4 AND session_id = ?5",
            rusqlite::params![summary, summarized_count as i64, now, user_id, session_id],
        )?;
        if rows == 0 {
            return Err(MemoryError::NotFound {
                user_id: user_id.to_string(),
                session_id: session_id.to_string(),
            });
        }
        Ok(())
    }
}
