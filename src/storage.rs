use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::queue::QueuedMessage;
use crate::{LocalId, MAX_STORE_BYTES};

const STORE_MAGIC: &[u8; 4] = b"COBX";
const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },

    #[error("lock acquisition failed")]
    LockFailed,

    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(String),
}

impl From<ciborium::de::Error<std::io::Error>> for StorageError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StorageError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Byte-durable backing store for the outbox. Every mutation must be durable
/// before it returns; silent loss here is the one unrecoverable failure mode
/// of the whole subsystem.
#[async_trait::async_trait]
pub trait QueueStorage: Send + Sync {
    async fn load_all(&self) -> Result<Vec<QueuedMessage>, StorageError>;
    async fn save(&self, message: &QueuedMessage) -> Result<(), StorageError>;
    async fn remove(&self, local_id: &LocalId) -> Result<(), StorageError>;
}

// ============================================================================
// In-memory backend (tests, ephemeral sessions)
// ============================================================================

#[derive(Default)]
pub struct MemoryStorage {
    messages: Mutex<BTreeMap<u64, QueuedMessage>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl QueueStorage for MemoryStorage {
    async fn load_all(&self) -> Result<Vec<QueuedMessage>, StorageError> {
        let messages = self.messages.lock().map_err(|_| StorageError::LockFailed)?;
        Ok(messages.values().cloned().collect())
    }

    async fn save(&self, message: &QueuedMessage) -> Result<(), StorageError> {
        let mut messages = self.messages.lock().map_err(|_| StorageError::LockFailed)?;
        messages.insert(message.seq, message.clone());
        Ok(())
    }

    async fn remove(&self, local_id: &LocalId) -> Result<(), StorageError> {
        let mut messages = self.messages.lock().map_err(|_| StorageError::LockFailed)?;
        messages.retain(|_, m| &m.local_id != local_id);
        Ok(())
    }
}

// ============================================================================
// File snapshot backend
// ============================================================================

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug)]
struct StorePayload {
    messages: Vec<QueuedMessage>,
}

/// Single-file snapshot store: CBOR payload wrapped in a checksummed
/// envelope, written atomically (temp file, fsync, rename, fsync parent).
/// Survives a crash at any point with either the old or the new snapshot
/// intact, never a torn one.
pub struct FileStorage {
    path: PathBuf,
    messages: Mutex<BTreeMap<u64, QueuedMessage>>,
}

impl FileStorage {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let messages = if path.exists() {
            let bytes = std::fs::read(&path)?;
            if bytes.is_empty() {
                return Err(StorageError::Corrupted {
                    reason: "empty file",
                });
            }
            let loaded = Self::decode(&bytes)?;
            info!(count = loaded.len(), path = %path.display(), "outbox store loaded");
            loaded.into_iter().map(|m| (m.seq, m)).collect()
        } else {
            debug!(path = %path.display(), "no outbox store on disk, starting empty");
            BTreeMap::new()
        };

        Ok(Self {
            path,
            messages: Mutex::new(messages),
        })
    }

    fn decode(bytes: &[u8]) -> Result<Vec<QueuedMessage>, StorageError> {
        if bytes.len() > MAX_STORE_BYTES {
            return Err(StorageError::StoreTooLarge {
                size: bytes.len(),
                max: MAX_STORE_BYTES,
            });
        }

        let envelope: StoreEnvelope = ciborium::from_reader(bytes)?;

        if envelope.magic != *STORE_MAGIC {
            return Err(StorageError::Corrupted {
                reason: "invalid magic bytes",
            });
        }
        if envelope.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(StorageError::FutureSchema {
                found: envelope.schema_version,
                max: CURRENT_SCHEMA_VERSION,
            });
        }
        if envelope.schema_version < CURRENT_SCHEMA_VERSION {
            return Err(StorageError::UnknownSchema(envelope.schema_version));
        }

        let actual = blake3::hash(&envelope.payload);
        if actual.as_bytes() != &envelope.checksum {
            return Err(StorageError::IntegrityCheckFailed {
                expected: hex::encode(envelope.checksum),
                actual: hex::encode(actual.as_bytes()),
            });
        }

        let payload: StorePayload = ciborium::from_reader(&envelope.payload[..])?;
        Ok(payload.messages)
    }

    fn encode(messages: &BTreeMap<u64, QueuedMessage>) -> Result<Vec<u8>, StorageError> {
        let payload = StorePayload {
            messages: messages.values().cloned().collect(),
        };
        let mut payload_bytes = Vec::new();
        ciborium::into_writer(&payload, &mut payload_bytes)?;

        let checksum = blake3::hash(&payload_bytes);
        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: *checksum.as_bytes(),
            payload: payload_bytes,
        };

        let mut envelope_bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut envelope_bytes)?;

        if envelope_bytes.len() > MAX_STORE_BYTES {
            return Err(StorageError::StoreTooLarge {
                size: envelope_bytes.len(),
                max: MAX_STORE_BYTES,
            });
        }
        Ok(envelope_bytes)
    }

    fn persist(&self, messages: &BTreeMap<u64, QueuedMessage>) -> Result<(), StorageError> {
        let encoded = Self::encode(messages)?;
        let tmp_path = self.path.with_extension("tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(&encoded)?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl QueueStorage for FileStorage {
    async fn load_all(&self) -> Result<Vec<QueuedMessage>, StorageError> {
        let messages = self.messages.lock().map_err(|_| StorageError::LockFailed)?;
        Ok(messages.values().cloned().collect())
    }

    async fn save(&self, message: &QueuedMessage) -> Result<(), StorageError> {
        let mut messages = self.messages.lock().map_err(|_| StorageError::LockFailed)?;
        let previous = messages.insert(message.seq, message.clone());
        if let Err(e) = self.persist(&messages) {
            // Keep the mirror consistent with what is actually on disk.
            match previous {
                Some(previous) => {
                    messages.insert(message.seq, previous);
                }
                None => {
                    messages.remove(&message.seq);
                }
            }
            warn!(error = %e, "outbox snapshot write failed");
            return Err(e);
        }
        Ok(())
    }

    async fn remove(&self, local_id: &LocalId) -> Result<(), StorageError> {
        let mut messages = self.messages.lock().map_err(|_| StorageError::LockFailed)?;
        let Some(seq) = messages
            .values()
            .find(|m| &m.local_id == local_id)
            .map(|m| m.seq)
        else {
            return Ok(());
        };
        let removed = messages.remove(&seq);
        if let Err(e) = self.persist(&messages) {
            if let Some(removed) = removed {
                messages.insert(seq, removed);
            }
            return Err(e);
        }
        Ok(())
    }
}

// ============================================================================
// SQLite backend
// ============================================================================

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::{QueueStorage, QueuedMessage, StorageError};
    use crate::LocalId;
    use rusqlite::{params, Connection};
    use std::path::Path;
    use tokio::sync::Mutex;
    use tracing::info;

    /// One row per queued message; the serialized message rides in a blob
    /// column, with state/seq duplicated for indexing.
    pub struct SqliteStorage {
        conn: Mutex<Connection>,
    }

    impl SqliteStorage {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
            let conn = Connection::open(path).map_err(sql_err)?;
            Self::init(conn)
        }

        pub fn in_memory() -> Result<Self, StorageError> {
            let conn = Connection::open_in_memory().map_err(sql_err)?;
            Self::init(conn)
        }

        fn init(conn: Connection) -> Result<Self, StorageError> {
            conn.execute_batch(
                r"
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = FULL;

                CREATE TABLE IF NOT EXISTS outbox_messages (
                    local_id TEXT PRIMARY KEY,
                    seq INTEGER NOT NULL UNIQUE,
                    state TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    data BLOB NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_outbox_state
                    ON outbox_messages(state);
                ",
            )
            .map_err(sql_err)?;
            info!("sqlite outbox store ready");
            Ok(Self {
                conn: Mutex::new(conn),
            })
        }
    }

    fn sql_err(e: rusqlite::Error) -> StorageError {
        StorageError::Sqlite(e.to_string())
    }

    #[async_trait::async_trait]
    impl QueueStorage for SqliteStorage {
        async fn load_all(&self) -> Result<Vec<QueuedMessage>, StorageError> {
            let conn = self.conn.lock().await;
            let mut stmt = conn
                .prepare("SELECT data FROM outbox_messages ORDER BY seq ASC")
                .map_err(sql_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, Vec<u8>>(0))
                .map_err(sql_err)?;

            let mut messages = Vec::new();
            for row in rows {
                let data = row.map_err(sql_err)?;
                let message: QueuedMessage = serde_json::from_slice(&data)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                messages.push(message);
            }
            Ok(messages)
        }

        async fn save(&self, message: &QueuedMessage) -> Result<(), StorageError> {
            let data = serde_json::to_vec(message)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;

            let conn = self.conn.lock().await;
            conn.execute(
                r"
                INSERT INTO outbox_messages (local_id, seq, state, attempts, data)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(local_id) DO UPDATE SET
                    state = excluded.state,
                    attempts = excluded.attempts,
                    data = excluded.data
                ",
                params![
                    message.local_id.as_str(),
                    i64::try_from(message.seq)
                        .map_err(|_| StorageError::Serialization("seq overflow".into()))?,
                    message.state.name(),
                    message.attempts,
                    data,
                ],
            )
            .map_err(sql_err)?;
            Ok(())
        }

        async fn remove(&self, local_id: &LocalId) -> Result<(), StorageError> {
            let conn = self.conn.lock().await;
            conn.execute(
                "DELETE FROM outbox_messages WHERE local_id = ?1",
                params![local_id.as_str()],
            )
            .map_err(sql_err)?;
            Ok(())
        }
    }
}
