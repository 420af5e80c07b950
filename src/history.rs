//! Durable per-session transcripts.
//!
//! The pool only relies on `append` and `read`. Writes for one session are
//! serialized; different sessions never wait on each other.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::{fs, io::AsyncWriteExt};
use uuid::Uuid;

use crate::error::{PeargentError, Result};
use crate::message::Turn;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append one turn. A turn is either fully stored or not stored at all.
    async fn append(&self, session_id: &str, turn: &Turn) -> Result<()>;

    /// All turns of a session in append order. Unknown sessions are empty.
    async fn read(&self, session_id: &str) -> Result<Vec<Turn>>;

    async fn sessions(&self) -> Result<Vec<String>>;

    fn create_session(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Per-session async mutexes.
#[derive(Default, Clone)]
pub struct SessionLocks {
    locks: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `session_id`.
    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // drop locks nobody holds or waits on
            locks.retain(|id, lock| id == session_id || Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(session_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    pub fn tracked(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or_default()
    }
}

/// In-process store, lost on restart.
#[derive(Default)]
pub struct InMemoryHistory {
    sessions: RwLock<HashMap<String, Vec<Turn>>>,
    order: RwLock<Vec<String>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    async fn append(&self, session_id: &str, turn: &Turn) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if !sessions.contains_key(session_id) {
            self.order.write().await.push(session_id.to_string());
        }
        sessions
            .entry(session_id.to_string())
            .or_default()
            .push(turn.clone());
        Ok(())
    }

    async fn read(&self, session_id: &str) -> Result<Vec<Turn>> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn sessions(&self) -> Result<Vec<String>> {
        Ok(self.order.read().await.clone())
    }
}

/// One JSONL file per session inside a directory.
pub struct FileHistoryStore {
    dir: PathBuf,
    locks: SessionLocks,
}

impl FileHistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: SessionLocks::new(),
        }
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(PeargentError::Storage(format!(
                "session id `{session_id}` is not usable as a file name"
            )));
        }
        Ok(self.dir.join(format!("{session_id}.jsonl")))
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn append(&self, session_id: &str, turn: &Turn) -> Result<()> {
        let path = self.path_for(session_id)?;
        let mut serialized = serde_json::to_string(turn)?;
        serialized.push('\n');

        let _guard = self.locks.acquire(session_id).await;
        fs::create_dir_all(&self.dir).await.map_err(|err| {
            PeargentError::Storage(format!("failed to create `{}`: {err}", self.dir.display()))
        })?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|err| {
                PeargentError::Storage(format!("failed to open `{}`: {err}", path.display()))
            })?;
        file.write_all(serialized.as_bytes())
            .await
            .map_err(|err| PeargentError::Storage(format!("failed to persist turn: {err}")))?;
        file.flush()
            .await
            .map_err(|err| PeargentError::Storage(format!("failed to persist turn: {err}")))
    }

    async fn read(&self, session_id: &str) -> Result<Vec<Turn>> {
        let path = self.path_for(session_id)?;
        let content = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(PeargentError::Storage(format!(
                    "failed to read transcript `{}`: {err}",
                    path.display()
                )))
            }
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|err| PeargentError::Storage(format!("invalid turn payload: {err}")))
            })
            .collect()
    }

    async fn sessions(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(PeargentError::Storage(format!("failed listing sessions: {err}"))),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(feature = "persistence")]
pub use sql::SqlHistoryStore;

#[cfg(feature = "persistence")]
mod sql {
    use async_trait::async_trait;
    use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};

    use super::HistoryStore;
    use crate::error::{PeargentError, Result};
    use crate::message::Turn;

    /// SQLite-backed store; one row per turn, ordered by insertion.
    pub struct SqlHistoryStore {
        pool: SqlitePool,
    }

    impl SqlHistoryStore {
        const INIT_STATEMENTS: [&'static str; 2] = [
            r#"
            CREATE TABLE IF NOT EXISTS turns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                payload TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS turns_by_session ON turns (session_id, id)",
        ];

        pub async fn connect(connection_url: impl AsRef<str>) -> Result<Self> {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect(connection_url.as_ref())
                .await
                .map_err(|err| {
                    PeargentError::Storage(format!(
                        "failed connecting to SQL backend `{}`: {err}",
                        connection_url.as_ref()
                    ))
                })?;

            for statement in Self::INIT_STATEMENTS {
                sqlx::query(statement)
                    .execute(&pool)
                    .await
                    .map_err(|err| PeargentError::Storage(format!("failed initializing schema: {err}")))?;
            }

            Ok(Self { pool })
        }
    }

    #[async_trait]
    impl HistoryStore for SqlHistoryStore {
        async fn append(&self, session_id: &str, turn: &Turn) -> Result<()> {
            let payload = serde_json::to_string(turn)?;
            sqlx::query("INSERT INTO turns (session_id, payload) VALUES (?, ?)")
                .bind(session_id)
                .bind(payload)
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(|err| PeargentError::Storage(format!("failed writing turn: {err}")))
        }

        async fn read(&self, session_id: &str) -> Result<Vec<Turn>> {
            let rows = sqlx::query("SELECT payload FROM turns WHERE session_id = ? ORDER BY id ASC")
                .bind(session_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|err| PeargentError::Storage(format!("failed loading turns: {err}")))?;

            rows.into_iter()
                .map(|row| {
                    let payload: String = row.try_get("payload").map_err(|err| {
                        PeargentError::Storage(format!("failed decoding turn payload: {err}"))
                    })?;
                    serde_json::from_str(&payload)
                        .map_err(|err| PeargentError::Storage(format!("invalid turn payload: {err}")))
                })
                .collect()
        }

        async fn sessions(&self) -> Result<Vec<String>> {
            let rows = sqlx::query(
                "SELECT session_id FROM turns GROUP BY session_id ORDER BY MIN(id) ASC",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|err| PeargentError::Storage(format!("failed listing sessions: {err}")))?;

            rows.into_iter()
                .map(|row| {
                    row.try_get::<String, _>("session_id").map_err(|err| {
                        PeargentError::Storage(format!("failed decoding session id: {err}"))
                    })
                })
                .collect()
        }
    }
}

/// Which backend a history config opens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    #[serde(alias = "SessionBufferHistoryStore", alias = "InMemoryHistoryStore")]
    SessionBuffer,
    #[serde(alias = "FileHistoryStore")]
    File,
    #[serde(alias = "SqliteHistoryStore")]
    Sqlite,
}

impl StoreKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "session_buffer" | "memory" => Some(StoreKind::SessionBuffer),
            "file" => Some(StoreKind::File),
            "sqlite" => Some(StoreKind::Sqlite),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default)]
    pub store_type: StoreKind,
    /// Directory for the file store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

impl HistoryConfig {
    pub const DEFAULT_DIR: &'static str = "history";
    pub const DEFAULT_DATABASE_URL: &'static str = "sqlite://history.db?mode=rwc";

    pub fn session_buffer() -> Self {
        Self::default()
    }

    pub fn file(dir: impl Into<String>) -> Self {
        Self {
            store_type: StoreKind::File,
            path: Some(dir.into()),
            database_url: None,
        }
    }

    pub fn sqlite(database_url: impl Into<String>) -> Self {
        Self {
            store_type: StoreKind::Sqlite,
            path: None,
            database_url: Some(database_url.into()),
        }
    }

    /// Build the store this config describes.
    pub async fn open(&self) -> Result<Arc<dyn HistoryStore>> {
        match self.store_type {
            StoreKind::SessionBuffer => Ok(Arc::new(InMemoryHistory::new())),
            StoreKind::File => Ok(Arc::new(FileHistoryStore::new(
                self.path.as_deref().unwrap_or(Self::DEFAULT_DIR),
            ))),
            #[cfg(feature = "persistence")]
            StoreKind::Sqlite => {
                let url = self
                    .database_url
                    .as_deref()
                    .unwrap_or(Self::DEFAULT_DATABASE_URL);
                Ok(Arc::new(SqlHistoryStore::connect(url).await?))
            }
            #[cfg(not(feature = "persistence"))]
            StoreKind::Sqlite => Err(PeargentError::Config(
                "sqlite history requires the `persistence` feature".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn in_memory_keeps_sessions_apart() {
        let store = InMemoryHistory::new();
        store.append("s1", &Turn::request("one", None)).await.unwrap();
        store.append("s2", &Turn::request("other", None)).await.unwrap();
        store.append("s1", &Turn::answer("A", "two")).await.unwrap();

        let s1 = store.read("s1").await.unwrap();
        assert_eq!(s1.len(), 2);
        assert_eq!(s1[1].content, "two");
        assert!(store.read("missing").await.unwrap().is_empty());
        assert_eq!(store.sessions().await.unwrap(), vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistoryStore::new(dir.path().join("transcripts"));
        let session = store.create_session();

        store.append(&session, &Turn::request("hello", Some("A".into()))).await.unwrap();
        store.append(&session, &Turn::answer("A", "hi")).await.unwrap();

        let loaded = store.read(&session).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].agent.as_deref(), Some("A"));
        assert_eq!(store.sessions().await.unwrap(), vec![session]);
    }

    #[tokio::test]
    async fn file_store_rejects_path_like_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistoryStore::new(dir.path());
        let err = store.append("../escape", &Turn::notice("x")).await.unwrap_err();
        assert!(matches!(err, PeargentError::Storage(_)));
    }

    #[cfg(feature = "persistence")]
    #[tokio::test]
    async fn sqlite_store_round_trip() {
        let store = SqlHistoryStore::connect("sqlite::memory:").await.unwrap();

        store.append("s1", &Turn::request("hi from db", None)).await.unwrap();
        store.append("s2", &Turn::notice("elsewhere")).await.unwrap();
        store.append("s1", &Turn::answer("A", "reply")).await.unwrap();

        let loaded = store.read("s1").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].content, "hi from db");
        assert_eq!(loaded[1].content, "reply");
        assert_eq!(store.sessions().await.unwrap(), vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn session_locks_serialize_one_session_only() {
        let locks = SessionLocks::new();
        let held = locks.acquire("s1").await;

        let blocked = tokio::time::timeout(Duration::from_millis(20), locks.acquire("s1")).await;
        assert!(blocked.is_err());

        let other = tokio::time::timeout(Duration::from_millis(20), locks.acquire("s2")).await;
        assert!(other.is_ok());
        drop(other);

        drop(held);
        let _again = locks.acquire("s1").await;
        // the idle `s2` entry was pruned on this acquire
        assert_eq!(locks.tracked(), 1);
    }

    #[test]
    fn store_kind_accepts_legacy_names() {
        let cfg: HistoryConfig = serde_json::from_str(r#"{"store_type":"SqliteHistoryStore"}"#).unwrap();
        assert_eq!(cfg.store_type, StoreKind::Sqlite);
        assert_eq!(StoreKind::parse("FILE"), Some(StoreKind::File));
        assert_eq!(StoreKind::parse("redis"), None);
    }

    #[tokio::test]
    async fn opens_configured_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryConfig::file(dir.path().to_string_lossy())
            .open()
            .await
            .unwrap();
        store.append("s", &Turn::notice("x")).await.unwrap();
        assert_eq!(store.read("s").await.unwrap().len(), 1);
    }
}
