//! Durable record of dead-lettered jobs.
//!
//! Records are append-only. Nothing here replays them; an operator inspects
//! the store and re-pushes payloads by hand.

use crate::error::QueueError;
use crate::message::Timestamp;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// One dead-lettered job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedJobRecord {
    pub id: Uuid,
    pub connection: String,
    pub queue: String,
    /// Raw envelope body as it was when the job failed
    pub payload: String,
    pub failed_at: Timestamp,
}

impl FailedJobRecord {
    pub fn new(
        connection: impl Into<String>,
        queue: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection: connection.into(),
            queue: queue.into(),
            payload: payload.into(),
            failed_at: Timestamp::now(),
        }
    }
}

/// Append-only sink for dead-lettered jobs
#[async_trait]
pub trait FailedJobStore: Send + Sync {
    async fn log(&self, connection: &str, queue: &str, payload: &str) -> Result<(), QueueError>;
}

fn store_error(message: impl Into<String>) -> QueueError {
    QueueError::FailedJobStore {
        message: message.into(),
    }
}

// ============================================================================
// MemoryFailedJobStore
// ============================================================================

/// Failed job store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryFailedJobStore {
    records: RwLock<Vec<FailedJobRecord>>,
}

impl MemoryFailedJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the records logged so far
    pub fn records(&self) -> Vec<FailedJobRecord> {
        self.records.read().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FailedJobStore for MemoryFailedJobStore {
    async fn log(&self, connection: &str, queue: &str, payload: &str) -> Result<(), QueueError> {
        let record = FailedJobRecord::new(connection, queue, payload);
        self.records
            .write()
            .map_err(|_| store_error("record list lock was poisoned"))?
            .push(record);
        Ok(())
    }
}

// ============================================================================
// FileFailedJobStore
// ============================================================================

/// Failed job store writing one JSON record per line
#[derive(Debug)]
pub struct FileFailedJobStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileFailedJobStore {
    /// Store appending to `path`; the file and its parent directories are created on first write
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record back, oldest first
    pub async fn read_all(&self) -> Result<Vec<FailedJobRecord>, QueueError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(store_error(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|e| store_error(format!("Corrupt failed job record: {}", e)))
            })
            .collect()
    }
}

#[async_trait]
impl FailedJobStore for FileFailedJobStore {
    async fn log(&self, connection: &str, queue: &str, payload: &str) -> Result<(), QueueError> {
        let record = FailedJobRecord::new(connection, queue, payload);
        let mut line = serde_json::to_string(&record)
            .map_err(|e| store_error(format!("Failed to encode record: {}", e)))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                store_error(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| store_error(format!("Failed to open {}: {}", self.path.display(), e)))?;

        file.write_all(line.as_bytes())
            .await
            .map_err(|e| store_error(format!("Failed to write {}: {}", self.path.display(), e)))?;
        file.flush()
            .await
            .map_err(|e| store_error(format!("Failed to flush {}: {}", self.path.display(), e)))?;

        debug!(id = %record.id, path = %self.path.display(), "Failed job recorded");
        Ok(())
    }
}

#[cfg(test)]
#[path = "failed_tests.rs"]
mod tests;
