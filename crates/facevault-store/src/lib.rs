//! facevault-store: SQLite persistence for the face gallery.
//!
//! One row per identity in `faces`; embeddings are stored as raw
//! little-endian `f32` bytes. Identities come from a one-row counter table
//! rather than from `MAX(id)`, so an identity reserved for an insert that
//! later fails is never handed out again, not even after a restart.

use chrono::{DateTime, Utc};
use facevault_core::{Embedding, FaceError, FaceId, GalleryBackend, GalleryEntry};
use rusqlite::{params, Connection};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS faces (
    id          INTEGER PRIMARY KEY,
    name        TEXT NOT NULL,
    encoding    BLOB NOT NULL,
    image       BLOB NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS identity_counter (
    singleton   INTEGER PRIMARY KEY CHECK (singleton = 0),
    last_id     INTEGER NOT NULL
);
INSERT OR IGNORE INTO identity_counter (singleton, last_id)
    SELECT 0, COALESCE(MAX(id), 0) FROM faces;
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt row for identity {id}: {reason}")]
    Corrupt { id: FaceId, reason: String },
}

impl From<StoreError> for FaceError {
    fn from(e: StoreError) -> Self {
        FaceError::Storage(e.to_string())
    }
}

/// Gallery backend on a SQLite database file.
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "gallery database opened");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    fn scan_rows(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, encoding, image, created_at FROM faces ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, name, encoding, image, created_at) = row?;
            entries.push(decode_row(id, name, &encoding, image, &created_at)?);
        }
        Ok(entries)
    }

    fn next_identity(&mut self) -> Result<FaceId, StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE identity_counter SET last_id = last_id + 1 WHERE singleton = 0",
            [],
        )?;
        let id = tx.query_row(
            "SELECT last_id FROM identity_counter WHERE singleton = 0",
            [],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(id)
    }

    fn insert_row(&self, entry: &GalleryEntry) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO faces (id, name, encoding, image, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.identity,
                entry.display_name,
                entry.embedding.to_le_bytes(),
                &entry.representative_image[..],
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

fn decode_row(
    id: FaceId,
    display_name: String,
    encoding: &[u8],
    image: Vec<u8>,
    created_at: &str,
) -> Result<GalleryEntry, StoreError> {
    let embedding = Embedding::from_le_bytes(encoding).ok_or_else(|| StoreError::Corrupt {
        id,
        reason: format!("encoding blob of {} bytes is not a float32 vector", encoding.len()),
    })?;
    let created_at = DateTime::parse_from_rfc3339(created_at)
        .map_err(|e| StoreError::Corrupt {
            id,
            reason: format!("created_at: {e}"),
        })?
        .with_timezone(&Utc);

    Ok(GalleryEntry {
        identity: id,
        display_name,
        embedding,
        representative_image: image.into(),
        created_at,
    })
}

impl GalleryBackend for SqliteBackend {
    fn scan(&mut self) -> Result<Vec<GalleryEntry>, FaceError> {
        Ok(self.scan_rows()?)
    }

    fn reserve_identity(&mut self) -> Result<FaceId, FaceError> {
        Ok(self.next_identity()?)
    }

    fn insert(&mut self, entry: &GalleryEntry) -> Result<(), FaceError> {
        Ok(self.insert_row(entry)?)
    }
}
