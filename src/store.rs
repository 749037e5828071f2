//! Config Object Store
//!
//! Named JSON objects ("sharding", "backends", ...) persisted either as
//! files in a directory or as rows of a SQLite table. Callers only see
//! [`ObjectStore`] and never know which backing is in use.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::{StoreConfig, StoreKind};
use crate::error::{Error, Result};

/// Key-value store of JSON objects
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read an object; `None` if it was never written
    async fn query_object(&self, name: &str) -> Result<Option<Value>>;

    /// Create or replace an object
    async fn write_object(&self, name: &str, value: &Value) -> Result<()>;
}

fn check_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidParameter(format!("object name '{}'", name)))
    }
}

/// One `<name>.json` file per object
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl ObjectStore for FileStore {
    async fn query_object(&self, name: &str) -> Result<Option<Value>> {
        check_name(name)?;
        match tokio::fs::read(self.path_of(name)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_object(&self, name: &str, value: &Value) -> Result<()> {
        check_name(name)?;
        let body = serde_json::to_vec_pretty(value)?;

        // Write aside and rename so readers never see a torn file
        let path = self.path_of(name);
        let tmp = self.dir.join(format!(".{}.json.tmp", name));
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!("Stored object '{}' at {}", name, path.display());
        Ok(())
    }
}

/// Objects kept in a SQLite table
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS objects (
                name TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl ObjectStore for SqliteStore {
    async fn query_object(&self, name: &str) -> Result<Option<Value>> {
        check_name(name)?;
        let conn = self.conn.lock().await;
        let body: Option<String> = conn
            .query_row("SELECT body FROM objects WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?;

        match body {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn write_object(&self, name: &str, value: &Value) -> Result<()> {
        check_name(name)?;
        let body = serde_json::to_string(value)?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO objects (name, body) VALUES (?1, ?2)
            ON CONFLICT(name) DO UPDATE SET body = ?2, updated_at = CURRENT_TIMESTAMP
            "#,
            params![name, body],
        )?;
        Ok(())
    }
}

/// Build the store selected by configuration
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>> {
    match config.kind {
        StoreKind::File => {
            tracing::info!("Using file object store in {}", config.path.display());
            Ok(Arc::new(FileStore::new(&config.path)?))
        }
        StoreKind::Sqlite => {
            tracing::info!("Using SQLite object store at {}", config.path.display());
            Ok(Arc::new(SqliteStore::open(&config.path)?))
        }
    }
}
