//! SQLite persistence for known faces.
//!
//! One row per registered embedding. The `embedding` column holds the
//! little-endian f32 blob produced by `facewatch_core::codec::encode`.

use facewatch_core::{FacePersistence, PersistenceError};
use rusqlite::{params, Connection};
use std::path::Path;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS known_faces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    label TEXT NOT NULL,
    embedding BLOB NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_known_faces_label ON known_faces(label);
"#;

pub struct FaceDb {
    conn: Connection,
}

impl FaceDb {
    /// Open (or create) the database at `path` and initialize the schema.
    pub fn open(path: impl AsRef<Path>) -> rusqlite::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!(dir = %parent.display(), error = %e, "could not create database directory");
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA_SQL)?;

        tracing::info!(path = %path.display(), "face database opened");
        Ok(Self { conn })
    }

    /// In-memory database for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    /// Every persisted `(label, embedding blob)` row in insertion order.
    pub fn load_all(&self) -> rusqlite::Result<Vec<(String, Vec<u8>)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT label, embedding FROM known_faces ORDER BY id")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    }

    /// Insert all rows in one transaction.
    pub fn insert_batch(&mut self, rows: &[(String, Vec<u8>)]) -> rusqlite::Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO known_faces (label, embedding, created_at) VALUES (?1, ?2, ?3)",
            )?;
            for (label, blob) in rows {
                stmt.execute(params![label, blob, now])?;
            }
        }
        tx.commit()?;
        tracing::debug!(rows = rows.len(), "face batch persisted");
        Ok(())
    }

    /// Delete every row for `label`, returning the number removed.
    pub fn delete_label(&self, label: &str) -> rusqlite::Result<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM known_faces WHERE label = ?1", params![label])?;
        tracing::info!(label, removed, "label deleted from database");
        Ok(removed)
    }
}

impl FacePersistence for FaceDb {
    fn append_batch(&mut self, rows: &[(String, Vec<u8>)]) -> Result<(), PersistenceError> {
        self.insert_batch(rows)
            .map_err(|e| PersistenceError::new(format!("inserting {} faces", rows.len()), e))
    }
}
