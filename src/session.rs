//! Resumable upload session records
//!
//! A session is created when the storage service answers a resumable-init
//! request and consumed exactly once, by the completion PUT.

use crate::config::SessionStoreConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

/// Target of an in-flight resumable upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumableSession {
    pub bucket: String,
    pub object_name: String,
    /// Content type declared at init, applied on completion if the PUT has none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ResumableSession {
    pub fn new(
        bucket: impl Into<String>,
        object_name: impl Into<String>,
        content_type: Option<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            object_name: object_name.into(),
            content_type,
            created_at: Utc::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        (Utc::now() - self.created_at)
            .to_std()
            .map(|age| age > ttl)
            .unwrap_or(false)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// Unknown, expired, or already consumed upload id
    #[error("no session for upload id {0}")]
    NotFound(String),

    #[error("session store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt session record {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("session store task failed: {0}")]
    Task(String),
}

/// Keyed store of resumable sessions.
///
/// `take` is an atomic read-and-delete: of any number of concurrent callers
/// for one upload id, at most one receives the session.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn put(&self, upload_id: &str, session: ResumableSession) -> Result<(), SessionError>;

    async fn take(&self, upload_id: &str) -> Result<ResumableSession, SessionError>;

    /// Drop expired records. Returns how many were removed.
    async fn cleanup_expired(&self) -> Result<usize, SessionError>;
}

/// Build the configured store.
pub async fn from_config(
    config: &SessionStoreConfig,
    ttl: Duration,
) -> Result<Arc<dyn SessionStore>, SessionError> {
    Ok(match config {
        SessionStoreConfig::Memory => Arc::new(InMemorySessionStore::new(ttl)),
        SessionStoreConfig::Filesystem { path } => {
            Arc::new(FilesystemSessionStore::new(path.clone(), ttl).await?)
        }
    })
}

/// Process-local session store.
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, ResumableSession>>,
    ttl: Duration,
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn put(&self, upload_id: &str, session: ResumableSession) -> Result<(), SessionError> {
        self.sessions.write().insert(upload_id.to_string(), session);
        Ok(())
    }

    async fn take(&self, upload_id: &str) -> Result<ResumableSession, SessionError> {
        let session = self
            .sessions
            .write()
            .remove(upload_id)
            .ok_or_else(|| SessionError::NotFound(upload_id.to_string()))?;
        if session.is_expired(self.ttl) {
            debug!("Session {} expired before completion", upload_id);
            return Err(SessionError::NotFound(upload_id.to_string()));
        }
        Ok(session)
    }

    async fn cleanup_expired(&self) -> Result<usize, SessionError> {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(self.ttl));
        Ok(before - sessions.len())
    }
}

/// One JSON record per session under a directory.
///
/// Layout:
/// ```text
/// {root}/{sha256(upload_id)}.json
/// ```
///
/// `take` renames the record to a unique claim name before reading it, so
/// only one of several concurrent completions can win the rename.
pub struct FilesystemSessionStore {
    root: PathBuf,
    ttl: Duration,
}

impl FilesystemSessionStore {
    pub async fn new(root: PathBuf, ttl: Duration) -> Result<Self, SessionError> {
        fs::create_dir_all(&root).await?;
        info!("Resumable sessions stored under {}", root.display());
        Ok(Self { root, ttl })
    }

    fn record_path(&self, upload_id: &str) -> PathBuf {
        let digest = Sha256::digest(upload_id.as_bytes());
        self.root.join(format!("{}.json", hex::encode(digest)))
    }
}

/// Name prefix of in-progress record writes
const TEMP_PREFIX: &str = ".session-";

/// Claimed records and temp files older than this were left by a process
/// that died mid-operation.
const LEFTOVER_MAX_AGE: Duration = Duration::from_secs(10 * 60);

fn is_leftover(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map_or(false, |name| {
            name.starts_with(TEMP_PREFIX) || name.contains(".claimed-")
        })
}

/// Write-to-temp + fsync + rename.
async fn atomic_write(path: &Path, data: Vec<u8>) -> Result<(), SessionError> {
    let parent = path
        .parent()
        .ok_or_else(|| SessionError::Task("record path has no parent".to_string()))?
        .to_path_buf();
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&parent)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok::<_, std::io::Error>(())
    })
    .await
    .map_err(|e| SessionError::Task(format!("spawn_blocking join failed: {}", e)))??;
    Ok(())
}

#[async_trait]
impl SessionStore for FilesystemSessionStore {
    async fn put(&self, upload_id: &str, session: ResumableSession) -> Result<(), SessionError> {
        let path = self.record_path(upload_id);
        let data = serde_json::to_vec(&session).map_err(|e| SessionError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        atomic_write(&path, data).await?;
        debug!("Stored session record {}", path.display());
        Ok(())
    }

    async fn take(&self, upload_id: &str) -> Result<ResumableSession, SessionError> {
        let path = self.record_path(upload_id);
        let claimed = path.with_extension(format!("claimed-{}", uuid::Uuid::new_v4()));

        match fs::rename(&path, &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::NotFound(upload_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let data = fs::read(&claimed).await;
        if let Err(e) = fs::remove_file(&claimed).await {
            warn!("Failed to remove claimed session {}: {}", claimed.display(), e);
        }

        let session: ResumableSession =
            serde_json::from_slice(&data?).map_err(|e| SessionError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if session.is_expired(self.ttl) {
            debug!("Session {} expired before completion", upload_id);
            return Err(SessionError::NotFound(upload_id.to_string()));
        }
        Ok(session)
    }

    async fn cleanup_expired(&self) -> Result<usize, SessionError> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_leftover(&path) {
                let age = match entry.metadata().await.and_then(|m| m.modified()) {
                    Ok(modified) => modified.elapsed().unwrap_or_default(),
                    Err(_) => continue,
                };
                if age > LEFTOVER_MAX_AGE && fs::remove_file(&path).await.is_ok() {
                    debug!("Removed leftover session file {}", path.display());
                    removed += 1;
                }
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let expired = match fs::read(&path).await {
                Ok(data) => match serde_json::from_slice::<ResumableSession>(&data) {
                    Ok(session) => session.is_expired(self.ttl),
                    Err(e) => {
                        warn!("Removing unreadable session record {}: {}", path.display(), e);
                        true
                    }
                },
                // Taken concurrently
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => return Err(e.into()),
            };
            if expired && fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
