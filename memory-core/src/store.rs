//! Durable storage of memory records.
//!
//! Every backend replaces a session's record as a whole. Two concurrent
//! upserts for the same session may land in either order, but a reader never
//! observes a mix of the two.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{Mutex, OnceCell, OwnedMutexGuard, RwLock};

use crate::error::{MemoryError, Result, StoreError};
use crate::record::MemoryRecord;

/// Trait for durable memory backends
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Write a record, replacing any prior record for the same session
    ///
    /// # Arguments
    /// * `record` - The full record to store
    async fn upsert(&self, record: &MemoryRecord) -> Result<()>;

    /// Load a session's record
    ///
    /// # Returns
    /// The stored record if one exists
    async fn get(&self, session_id: &str) -> Result<Option<MemoryRecord>>;

    /// Delete a session's record
    ///
    /// # Returns
    /// True if a record was deleted, false if none existed
    async fn delete(&self, session_id: &str) -> Result<bool>;

    /// List the sessions that have a stored record, sorted
    async fn list_sessions(&self) -> Result<Vec<String>>;
}

/// Run `store.upsert` with a deadline.
///
/// On expiry the in-flight write is dropped and [`StoreError::Timeout`] is
/// returned. Backends commit with a single swap or rename, so a dropped write
/// leaves the previous record intact.
pub async fn upsert_with_timeout(store: &dyn MemoryStore, record: &MemoryRecord, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, store.upsert(record)).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            session_id: record.session_id.clone(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
        .into()),
    }
}

/// In-memory backend for tests and single-process deployments
#[derive(Debug, Default)]
pub struct InMemoryMemoryStore {
    records: RwLock<BTreeMap<String, MemoryRecord>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn upsert(&self, record: &MemoryRecord) -> Result<()> {
        let record = record.clone();
        self.records.write().await.insert(record.session_id.clone(), record);
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<MemoryRecord>> {
        Ok(self.records.read().await.get(session_id).cloned())
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        Ok(self.records.write().await.remove(session_id).is_some())
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        Ok(self.records.read().await.keys().cloned().collect())
    }
}

/// File system backend storing one canonical JSON file per session.
///
/// Writes go to a uniquely named temp file in the same directory and are then
/// renamed over the target, so a reader sees either the old or the new record.
/// Writers for the same session are serialized by a per-session lock, which
/// is released from the lock table as soon as no writer holds or awaits it.
///
/// Temp files left behind by a cancelled write are removed when the write is
/// dropped; files orphaned by a crashed process are swept on the first write
/// once they are older than [`STALE_TEMP_AGE`].
#[derive(Debug)]
pub struct FileSystemMemoryStore {
    base_dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
    swept: OnceCell<()>,
}

const RECORD_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

/// Minimum age of an orphaned temp file before it is swept
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(60);

impl FileSystemMemoryStore {
    /// Create a new file system store
    ///
    /// # Arguments
    /// * `base_dir` - Directory holding the record files; created on first write
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            locks: DashMap::new(),
            swept: OnceCell::new(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn record_path(&self, session_id: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}.{}", encode_session_id(session_id), RECORD_EXTENSION))
    }

    async fn session_lock<'a>(&'a self, session_id: &'a str) -> SessionLock<'a> {
        let lock = self
            .locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        SessionLock {
            locks: &self.locks,
            session_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn ensure_base_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            MemoryError::from(StoreError::Unavailable {
                reason: format!("failed to create {}: {}", self.base_dir.display(), e),
            })
        })?;
        self.swept
            .get_or_init(|| async {
                let removed = self.sweep_stale_temp_files(STALE_TEMP_AGE).await;
                if removed > 0 {
                    tracing::info!(removed, dir = %self.base_dir.display(), "stale temp files removed");
                }
            })
            .await;
        Ok(())
    }

    /// Remove temp files older than `min_age`. Best effort: unreadable
    /// entries are skipped.
    async fn sweep_stale_temp_files(&self, min_age: Duration) -> usize {
        let Ok(mut entries) = fs::read_dir(&self.base_dir).await else {
            return 0;
        };
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != TEMP_EXTENSION) {
                continue;
            }
            let stale = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified.elapsed().map_or(false, |age| age >= min_age),
                Err(_) => false,
            };
            if stale && fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }
}

/// Exclusive hold on one session's files. Dropping it releases the lock and
/// prunes the table entry when nobody else holds or awaits it.
struct SessionLock<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    session_id: &'a str,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(self.session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Removes a temp file unless the write that created it completed. Covers
/// writes abandoned mid-way, such as an upsert cancelled by a timeout.
struct TempFile {
    path: PathBuf,
    armed: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn persisted(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[async_trait]
impl MemoryStore for FileSystemMemoryStore {
    async fn upsert(&self, record: &MemoryRecord) -> Result<()> {
        self.ensure_base_dir().await?;
        let json = record.to_canonical_json()?;

        let _lock = self.session_lock(&record.session_id).await;

        let path = self.record_path(&record.session_id);
        let tmp = TempFile::new(path.with_extension(format!(
            "{}.{}",
            uuid::Uuid::new_v4().simple(),
            TEMP_EXTENSION
        )));
        let write_failed = |e: std::io::Error| {
            MemoryError::from(StoreError::WriteFailed {
                session_id: record.session_id.clone(),
                reason: e.to_string(),
            })
        };

        fs::write(&tmp.path, json.as_bytes()).await.map_err(write_failed)?;
        fs::rename(&tmp.path, &path).await.map_err(write_failed)?;
        tmp.persisted();

        tracing::debug!(session_id = %record.session_id, path = %path.display(), "memory record written");
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<MemoryRecord>> {
        let path = self.record_path(session_id);
        let json = match fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::ReadFailed {
                    session_id: session_id.to_string(),
                    reason: e.to_string(),
                }
                .into())
            }
        };

        let record = MemoryRecord::from_json(&json).map_err(|e| {
            MemoryError::from(StoreError::Corrupted {
                session_id: session_id.to_string(),
                details: e.to_string(),
            })
        })?;
        Ok(Some(record))
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        let _lock = self.session_lock(session_id).await;

        match fs::remove_file(self.record_path(session_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::WriteFailed {
                session_id: session_id.to_string(),
                reason: e.to_string(),
            }
            .into()),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Unavailable { reason: e.to_string() }.into()),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MemoryError::from(StoreError::Unavailable { reason: e.to_string() }))?
        {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == RECORD_EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    if let Some(session_id) = decode_session_id(stem) {
                        sessions.push(session_id);
                    }
                }
            }
        }
        sessions.sort();
        Ok(sessions)
    }
}

// Session ids become file names: unreserved ASCII passes through, every other
// byte is written as `%XX`.
fn encode_session_id(session_id: &str) -> String {
    let mut out = String::with_capacity(session_id.len());
    for byte in session_id.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' => out.push(byte as char),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

fn decode_session_id(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
