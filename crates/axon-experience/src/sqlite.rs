//! SQLite experience store — whole-list snapshots keyed by (user, session).
//!
//! The memory owns the ordered entry list exclusively; the store only ever
//! sees consistent snapshots, so one JSON blob per (user, session) is the
//! honest schema.

use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::Connection;
use tracing::debug;

use crate::error::{ExperienceError, Result};
use crate::memory::ExperienceStore;
use crate::types::ExperienceEntry;

pub struct SqliteExperienceStore {
    db: Mutex<Connection>,
}

impl SqliteExperienceStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn).map_err(|e| ExperienceError::Store(e.to_string()))?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| ExperienceError::Store(e.to_string()))?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| ExperienceError::Store(e.to_string()))?;
        Self::new(conn)
    }
}

fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS experiences (
            user_id     TEXT NOT NULL,
            session_id  TEXT NOT NULL,
            entries     TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            PRIMARY KEY (user_id, session_id)
        );",
    )
}

#[async_trait]
impl ExperienceStore for SqliteExperienceStore {
    async fn load(&self, user_id: &str, session_id: &str) -> Result<Vec<ExperienceEntry>> {
        let db = self.db.lock().unwrap();
        let raw: Option<String> = match db.query_row(
            "SELECT entries FROM experiences WHERE user_id = ?1 AND session_id = ?2",
            rusqlite::params![user_id, session_id],
            |row| row.get(0),
        ) {
            Ok(s) => Some(s),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(ExperienceError::Store(e.to_string())),
        };
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save(
        &self,
        user_id: &str,
        session_id: &str,
        entries: &[ExperienceEntry],
    ) -> Result<()> {
        let json = serde_json::to_string(entries)?;
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO experiences (user_id, session_id, entries, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, session_id) DO UPDATE SET
               entries = excluded.entries, updated_at = excluded.updated_at",
            rusqlite::params![user_id, session_id, json, now],
        )
        .map_err(|e| ExperienceError::Store(e.to_string()))?;
        debug!(count = entries.len(), session = session_id, "snapshot saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_of_unknown_session_is_empty() {
        let store = SqliteExperienceStore::open_in_memory().unwrap();
        assert!(store.load("u", "s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = SqliteExperienceStore::open_in_memory().unwrap();
        let mut entry = ExperienceEntry::new("task", "solution", "success");
        entry.embedding = vec![0.5, 0.5];

        store.save("u", "s", &[entry.clone()]).await.unwrap();
        let loaded = store.load("u", "s").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, entry.id);
        assert_eq!(loaded[0].embedding, vec![0.5, 0.5]);

        // Second save overwrites the snapshot.
        store.save("u", "s", &[]).await.unwrap();
        assert!(store.load("u", "s").await.unwrap().is_empty());
    }
}
