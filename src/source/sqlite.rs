// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local persistent cache on SQLite.
//!
//! One source serves both documents and blobs:
//!
//! ```sql
//! CREATE TABLE doc_updates (
//!   seq INTEGER PRIMARY KEY AUTOINCREMENT,
//!   doc_id TEXT NOT NULL,
//!   timestamp INTEGER NOT NULL,  -- epoch millis
//!   data BLOB NOT NULL           -- one CRDT update
//! );
//! CREATE TABLE blobs (blob_key TEXT PRIMARY KEY, data BLOB NOT NULL);
//! CREATE TABLE blob_mime (blob_key TEXT PRIMARY KEY, mime TEXT NOT NULL);
//! ```
//!
//! A document is the fold of its append log. Once the log grows past the
//! compaction threshold it is replaced by a single folded entry.
//!
//! ## sqlx Any Driver Quirks
//!
//! An in-memory SQLite database lives and dies with its connection, so the
//! `:memory:` pool is pinned to one connection that never idles out.

use std::marker::PhantomData;
use std::sync::Once;
use std::time::Duration;
use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::traits::{BlobSource, DocSource, PulledDoc, RemoteUpdate, RemoteUpdates, SourceError};
use crate::blob::BlobRecord;
use crate::doc::{now_millis, CrdtDoc};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn backend(e: sqlx::Error) -> SourceError {
    SourceError::Transport(e.to_string())
}

pub struct SqliteCacheSource<D> {
    name: String,
    pool: AnyPool,
    compact_threshold: usize,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RemoteUpdate>>>,
    /// Serializes appends with compaction.
    write_lock: tokio::sync::Mutex<()>,
    _doc: PhantomData<fn() -> D>,
}

impl<D: CrdtDoc> SqliteCacheSource<D> {
    /// Open (or create) the cache at `url`, e.g. `sqlite://cache.db?mode=rwc`.
    pub async fn open(name: impl Into<String>, url: &str, compact_threshold: usize) -> Result<Self, SourceError> {
        install_drivers();
        let name = name.into();
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");

        let pool = retry("sqlite_connect", &RetryConfig::startup(), move || async move {
            let options = if in_memory {
                AnyPoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
            } else {
                AnyPoolOptions::new()
                    .max_connections(4)
                    .idle_timeout(Duration::from_secs(300))
            };
            options
                .acquire_timeout(Duration::from_secs(10))
                .connect(url)
                .await
                .map_err(backend)
        })
        .await?;

        let source = Self {
            name,
            pool,
            compact_threshold: compact_threshold.max(1),
            subscribers: Mutex::new(Vec::new()),
            write_lock: tokio::sync::Mutex::new(()),
            _doc: PhantomData,
        };
        if !in_memory {
            source.enable_wal_mode().await?;
        }
        source.init_schema().await?;
        info!(source = %source.name, url, "SQLite cache opened");
        Ok(source)
    }

    /// A throwaway cache, mostly for tests.
    pub async fn open_in_memory(name: impl Into<String>, compact_threshold: usize) -> Result<Self, SourceError> {
        Self::open(name, "sqlite::memory:", compact_threshold).await
    }

    async fn enable_wal_mode(&self) -> Result<(), SourceError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), SourceError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS doc_updates (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                data BLOB NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_doc_updates_doc ON doc_updates (doc_id, seq)",
            r#"
            CREATE TABLE IF NOT EXISTS blobs (
                blob_key TEXT PRIMARY KEY,
                data BLOB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS blob_mime (
                blob_key TEXT PRIMARY KEY,
                mime TEXT NOT NULL
            )
            "#,
        ];

        retry("sqlite_init_schema", &RetryConfig::startup(), move || async move {
            for sql in statements {
                sqlx::query(sql).execute(&self.pool).await.map_err(backend)?;
            }
            Ok::<(), SourceError>(())
        })
        .await
    }

    /// Fold the append log of `doc_id`. `None` when the cache has never seen it.
    pub async fn load(&self, doc_id: &str) -> Result<Option<D>, SourceError> {
        let rows = sqlx::query("SELECT data FROM doc_updates WHERE doc_id = ? ORDER BY seq")
            .bind(doc_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut doc = D::default();
        for row in rows {
            let data: Vec<u8> = row.try_get("data").map_err(backend)?;
            doc.apply_update(&data)
                .map_err(|e| SourceError::VersionMismatch(e.to_string()))?;
        }
        Ok(Some(doc))
    }

    /// Append-log length of `doc_id`.
    pub async fn update_count(&self, doc_id: &str) -> Result<usize, SourceError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM doc_updates WHERE doc_id = ?")
            .bind(doc_id)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        let n: i64 = row.try_get("n").map_err(backend)?;
        Ok(n as usize)
    }

    /// Replace the append log of `doc_id` with one folded entry.
    pub async fn compact(&self, doc_id: &str) -> Result<(), SourceError> {
        let _guard = self.write_lock.lock().await;
        self.compact_locked(doc_id).await
    }

    async fn compact_locked(&self, doc_id: &str) -> Result<(), SourceError> {
        let Some(doc) = self.load(doc_id).await? else {
            return Ok(());
        };
        let folded = doc
            .diff_since(None)
            .map_err(|e| SourceError::VersionMismatch(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(backend)?;
        sqlx::query("DELETE FROM doc_updates WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        sqlx::query("INSERT INTO doc_updates (doc_id, timestamp, data) VALUES (?, ?, ?)")
            .bind(doc_id)
            .bind(now_millis() as i64)
            .bind(folded.as_slice())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        tx.commit().await.map_err(backend)?;

        debug!(source = %self.name, doc_id, bytes = folded.len(), "Compacted document log");
        Ok(())
    }

    fn notify(&self, doc_id: &str, data: &[u8]) {
        let update = RemoteUpdate {
            doc_id: doc_id.to_string(),
            data: data.to_vec(),
        };
        self.subscribers
            .lock()
            .retain(|tx| tx.send(update.clone()).is_ok());
    }
}

#[async_trait]
impl<D: CrdtDoc> DocSource for SqliteCacheSource<D> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pull(&self, doc_id: &str, state_vector: &[u8]) -> Result<Option<PulledDoc>, SourceError> {
        let Some(doc) = self.load(doc_id).await? else {
            return Ok(None);
        };
        let data = doc
            .diff_since(Some(state_vector))
            .map_err(|e| SourceError::VersionMismatch(e.to_string()))?;
        Ok(Some(PulledDoc {
            data,
            state: doc.state_vector(),
        }))
    }

    async fn push(&self, doc_id: &str, data: &[u8]) -> Result<(), SourceError> {
        if data.is_empty() {
            return Ok(());
        }
        // Reject what could never be folded back.
        D::default()
            .apply_update(data)
            .map_err(|e| SourceError::VersionMismatch(e.to_string()))?;

        let _guard = self.write_lock.lock().await;
        sqlx::query("INSERT INTO doc_updates (doc_id, timestamp, data) VALUES (?, ?, ?)")
            .bind(doc_id)
            .bind(now_millis() as i64)
            .bind(data)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        if self.update_count(doc_id).await? > self.compact_threshold {
            self.compact_locked(doc_id).await?;
        }
        drop(_guard);

        self.notify(doc_id, data);
        Ok(())
    }

    async fn subscribe(&self) -> Result<RemoteUpdates, SourceError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        Ok(rx)
    }
}

#[async_trait]
impl<D: CrdtDoc> BlobSource for SqliteCacheSource<D> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<BlobRecord>, SourceError> {
        let row = sqlx::query(
            "SELECT b.data AS data, m.mime AS mime FROM blobs b LEFT JOIN blob_mime m ON m.blob_key = b.blob_key WHERE b.blob_key = ?",
        )
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        match row {
            Some(row) => {
                let data: Vec<u8> = row.try_get("data").map_err(backend)?;
                let mime: String = row
                    .try_get::<Option<String>, _>("mime")
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                Ok(Some(BlobRecord::new(key, data, mime)))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, blob: BlobRecord) -> Result<String, SourceError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        sqlx::query(
            "INSERT INTO blobs (blob_key, data) VALUES (?, ?) ON CONFLICT(blob_key) DO UPDATE SET data = excluded.data",
        )
            .bind(blob.key.as_str())
            .bind(blob.data.as_slice())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        sqlx::query(
            "INSERT INTO blob_mime (blob_key, mime) VALUES (?, ?) ON CONFLICT(blob_key) DO UPDATE SET mime = excluded.mime",
        )
            .bind(blob.key.as_str())
            .bind(blob.mime.as_str())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        Ok(blob.key)
    }

    async fn delete(&self, key: &str) -> Result<(), SourceError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        for sql in ["DELETE FROM blobs WHERE blob_key = ?", "DELETE FROM blob_mime WHERE blob_key = ?"] {
            sqlx::query(sql)
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, SourceError> {
        let rows = sqlx::query("SELECT blob_key FROM blobs ORDER BY blob_key")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("blob_key").map_err(backend))
            .collect()
    }

    async fn has(&self, key: &str) -> Result<bool, SourceError> {
        let row = sqlx::query("SELECT 1 AS present FROM blobs WHERE blob_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.is_some())
    }
}
