use crate::domain::models::SessionRecord;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::record_codec::{decode_stored_history, encode_stored_history};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const HISTORY_KEY: &str = "history";

/// Durable slot holding the whole session history, most recent first.
pub trait HistoryRepository: Send + Sync {
    fn load(&self) -> Result<Vec<SessionRecord>, InfraError>;
    fn save(&self, records: &[SessionRecord]) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct SqliteHistoryRepository {
    db_path: PathBuf,
}

impl SqliteHistoryRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        Connection::open(&self.db_path).map_err(InfraError::from)
    }
}

impl HistoryRepository for SqliteHistoryRepository {
    fn load(&self) -> Result<Vec<SessionRecord>, InfraError> {
        let connection = self.connect()?;
        let raw: Option<String> = connection
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![HISTORY_KEY],
                |row| row.get(0),
            )
            .optional()?;

        let Some(raw) = raw else {
            return Ok(Vec::new());
        };
        decode_stored_history(&raw, Utc::now())
    }

    fn save(&self, records: &[SessionRecord]) -> Result<(), InfraError> {
        let payload = encode_stored_history(records)?;
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO kv_store (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
               value = excluded.value,
               updated_at = excluded.updated_at",
            params![HISTORY_KEY, payload, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

/// Keeps the encoded form so tests exercise the same codec as the SQLite slot.
#[derive(Debug, Default)]
pub struct InMemoryHistoryRepository {
    payload: Mutex<Option<String>>,
}

impl InMemoryHistoryRepository {
    pub fn with_raw(raw: impl Into<String>) -> Self {
        Self {
            payload: Mutex::new(Some(raw.into())),
        }
    }
}

impl HistoryRepository for InMemoryHistoryRepository {
    fn load(&self) -> Result<Vec<SessionRecord>, InfraError> {
        let payload = self
            .payload
            .lock()
            .map_err(|error| InfraError::InvalidConfig(format!("history lock poisoned: {error}")))?;
        match payload.as_deref() {
            Some(raw) => decode_stored_history(raw, Utc::now()),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, records: &[SessionRecord]) -> Result<(), InfraError> {
        let encoded = encode_stored_history(records)?;
        let mut payload = self
            .payload
            .lock()
            .map_err(|error| InfraError::InvalidConfig(format!("history lock poisoned: {error}")))?;
        *payload = Some(encoded);
        Ok(())
    }
}
