//! Durable, crash-safe session persistence.
//!
//! One JSON document per session under the store's root directory.
//! Updates write a sibling temp file and atomically rename it over the
//! record, so a crash mid-write never leaves a session readable in a
//! half-updated state. The store is the single source of truth for
//! session state; "currently active sessions" is a [`SessionStore::list`]
//! query, not a separate registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use uuid::Uuid;

use super::{Session, SessionStatus};
use crate::errors::{SessionError, StoreError};

/// Selects sessions in [`SessionStore::list`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
}

impl SessionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
        }
    }

    fn matches(&self, session: &Session) -> bool {
        self.status.is_none_or(|s| session.status == s)
    }
}

/// Filesystem-backed session store with per-session update serialization.
pub struct SessionStore {
    root: PathBuf,
    /// One async mutex per session so concurrent transition attempts on
    /// the same session serialize; sessions never contend on each other.
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }

    fn session_lock(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("session lock registry poisoned");
        locks
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn read_record(&self, id: Uuid) -> Result<Session, StoreError> {
        let path = self.record_path(id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound { id });
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt { path, source })
    }

    /// Write the record via temp-file-then-rename so readers never observe
    /// a partial document.
    fn write_record(&self, session: &Session) -> Result<(), StoreError> {
        let path = self.record_path(session.id);
        let tmp = self.root.join(format!("{}.json.tmp", session.id));
        let bytes = serde_json::to_vec_pretty(session).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&tmp, bytes).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| StoreError::Io { path, source })
    }

    /// Persist a freshly constructed session record.
    pub async fn create(&self, session: &Session) -> Result<Uuid, StoreError> {
        let lock = self.session_lock(session.id);
        let _guard = lock.lock().await;
        self.write_record(session)?;
        tracing::info!(id = %session.id, features = session.total_features(), "session created");
        Ok(session.id)
    }

    /// Read a session snapshot. Reads need no lock: the atomic rename in
    /// [`Self::write_record`] guarantees a consistent document.
    pub async fn get(&self, id: Uuid) -> Result<Session, StoreError> {
        self.read_record(id)
    }

    /// Apply `mutate` to the session under its exclusive lock, persist the
    /// result atomically, then run `after_commit` on the new snapshot
    /// before the lock is released. If `mutate` fails, nothing is written
    /// and the stored record is untouched. A mutation that leaves the
    /// session unchanged is a no-op: no write, no revision bump, no
    /// `after_commit`.
    ///
    /// `after_commit` runs inside the per-session critical section so that
    /// persist-then-notify sequences from concurrent updates cannot
    /// interleave out of order. It must not block.
    pub async fn update<F, C>(
        &self,
        id: Uuid,
        mutate: F,
        after_commit: C,
    ) -> Result<Session, SessionError>
    where
        F: FnOnce(&mut Session) -> Result<(), SessionError>,
        C: FnOnce(&Session),
    {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let original = self.read_record(id).map_err(SessionError::Store)?;
        let mut session = original.clone();
        mutate(&mut session)?;
        if session == original {
            return Ok(original);
        }
        session.revision += 1;
        session.updated_at = Utc::now();
        self.write_record(&session).map_err(SessionError::Store)?;
        after_commit(&session);
        Ok(session)
    }

    /// Enumerate sessions matching the filter, ordered by creation time.
    pub async fn list(&self, filter: SessionFilter) -> Result<Vec<Session>, StoreError> {
        let entries = std::fs::read_dir(&self.root).map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut sessions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: self.root.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            let bytes = std::fs::read(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            let session: Session = serde_json::from_slice(&bytes)
                .map_err(|source| StoreError::Corrupt { path, source })?;
            if filter.matches(&session) {
                sessions.push(session);
            }
        }

        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }
}
