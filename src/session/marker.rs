// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the roaster-logger project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Session markers
//!
//! A marker is a small JSON file claiming that a session is active on a port.
//! Markers live in `{log_dir}/sessions/{port_id}.json`. They are only ever
//! created by a no-clobber rename of a fully written temporary file and
//! removed with a single unlink, so readers never see a partial marker.
//!
//! The marker is a weak reference: `status` trusts its presence without probing
//! the process, and `stop` only deletes it. A running session notices the
//! deletion on its next tick and stops.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::acquisition::writer::file_safe_name;
use crate::config::port::is_valid_port_id;
use crate::error::SessionError;

/// Persisted claim that a session is running
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMarker {
    pub cycle_name: String,
    pub port_id: String,
    pub started_at: DateTime<Utc>,
    pub pid: u32,
    #[serde(default)]
    pub host: Option<String>,
    /// Active segment of the cycle log
    pub log_file: PathBuf,
}

/// What `status` found on disk for one marker file
#[derive(Debug, Clone, PartialEq)]
pub enum MarkerEntry {
    Active { path: PathBuf, marker: SessionMarker },
    /// Present but unreadable; still counts as a claim until cleared
    Unreadable { path: PathBuf, reason: String },
}

impl MarkerEntry {
    pub fn path(&self) -> &Path {
        match self {
            MarkerEntry::Active { path, .. } | MarkerEntry::Unreadable { path, .. } => path,
        }
    }
}

/// Directory of session markers
#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Marker location of a port. Valid port ids map to distinct files; any
    /// other id is sanitized and never names a marker this store manages.
    pub fn path_for(&self, port_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_safe_name(port_id)))
    }

    fn marker_error(path: &Path, reason: impl ToString) -> SessionError {
        SessionError::Marker {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// Atomically publish a marker.
    ///
    /// Fails with [`SessionError::AlreadyActive`] when the port already has one.
    pub fn create(&self, marker: &SessionMarker) -> Result<PathBuf, SessionError> {
        let path = self.path_for(&marker.port_id);
        if !is_valid_port_id(&marker.port_id) {
            return Err(Self::marker_error(
                &path,
                format!("invalid port id '{}'", marker.port_id),
            ));
        }
        fs::create_dir_all(&self.dir).map_err(|e| Self::marker_error(&self.dir, e))?;

        let json = serde_json::to_vec_pretty(marker).map_err(|e| Self::marker_error(&path, e))?;
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| Self::marker_error(&path, e))?;
        tmp.write_all(&json)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| Self::marker_error(&path, e))?;

        match tmp.persist_noclobber(&path) {
            Ok(_) => {
                debug!("Created session marker {:?}", path);
                Ok(path)
            }
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                Err(SessionError::AlreadyActive {
                    port_id: marker.port_id.clone(),
                    marker: path,
                })
            }
            Err(err) => Err(Self::marker_error(&path, err.error)),
        }
    }

    /// Marker of a port, `None` when absent
    pub fn load(&self, port_id: &str) -> Result<Option<SessionMarker>, SessionError> {
        if !is_valid_port_id(port_id) {
            return Ok(None);
        }
        let path = self.path_for(port_id);
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::marker_error(&path, e)),
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|e| Self::marker_error(&path, e))
    }

    /// Whether the marker on disk is still the one `marker` describes
    pub fn owns(&self, marker: &SessionMarker) -> bool {
        match self.load(&marker.port_id) {
            Ok(Some(current)) => {
                current.port_id == marker.port_id
                    && current.pid == marker.pid
                    && current.started_at == marker.started_at
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Treating unreadable marker as released: {}", e);
                false
            }
        }
    }

    /// Every marker in the directory, sorted by path. A missing directory means
    /// no session is active.
    pub fn list(&self) -> Result<Vec<MarkerEntry>, SessionError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::marker_error(&self.dir, e)),
        };

        let mut markers = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| Self::marker_error(&self.dir, e))?.path();
            let is_marker = path.extension().is_some_and(|ext| ext == "json")
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.starts_with('.'));
            if !is_marker {
                continue;
            }
            let parsed = fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| {
                    serde_json::from_slice::<SessionMarker>(&bytes).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(marker) => markers.push(MarkerEntry::Active { path, marker }),
                // removed between listing and reading
                Err(_) if !path.exists() => {}
                Err(reason) => markers.push(MarkerEntry::Unreadable { path, reason }),
            }
        }
        markers.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(markers)
    }

    /// Delete the marker of a port. Returns whether a marker was present.
    pub fn remove(&self, port_id: &str) -> Result<bool, SessionError> {
        if !is_valid_port_id(port_id) {
            return Ok(false);
        }
        let path = self.path_for(port_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed session marker {:?}", path);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::marker_error(&path, e)),
        }
    }

    /// Delete every marker, readable or not. Returns the removed paths.
    pub fn remove_all(&self) -> Result<Vec<PathBuf>, SessionError> {
        let mut removed = Vec::new();
        for entry in self.list()? {
            let path = entry.path().to_path_buf();
            match fs::remove_file(&path) {
                Ok(()) => removed.push(path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Self::marker_error(&path, e)),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn marker(port_id: &str) -> SessionMarker {
        SessionMarker {
            cycle_name: "test".to_string(),
            port_id: port_id.to_string(),
            started_at: Utc::now(),
            pid: std::process::id(),
            host: Some("roaster-pc".to_string()),
            log_file: PathBuf::from("data/logs/test.log"),
        }
    }

    #[test]
    fn create_load_remove() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = MarkerStore::new(dir.path().join("sessions"));
        let m = marker("roaster_1");
        let path = store.create(&m)?;
        assert_eq!(path, store.path_for("roaster_1"));
        assert_eq!(store.load("roaster_1")?, Some(m.clone()));
        assert!(store.owns(&m));
        assert!(store.remove("roaster_1")?);
        assert!(!store.remove("roaster_1")?);
        assert_eq!(store.load("roaster_1")?, None);
        assert!(!store.owns(&m));
        Ok(())
    }

    #[test]
    fn second_marker_on_same_port_is_refused() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = MarkerStore::new(dir.path());
        let first = marker("p1");
        store.create(&first)?;
        let err = store.create(&marker("p1")).unwrap_err();
        assert!(matches!(err, SessionError::AlreadyActive { .. }));
        assert_eq!(store.load("p1")?, Some(first));
        store.create(&marker("p2"))?;
        assert_eq!(store.list()?.len(), 2);
        Ok(())
    }

    #[test]
    fn lookalike_port_ids_never_share_a_marker() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = MarkerStore::new(dir.path());
        let ours = marker("roaster_1");
        store.create(&ours)?;

        assert_eq!(store.load("roaster.1")?, None);
        assert!(!store.remove("roaster.1")?);
        assert!(matches!(
            store.create(&marker("roaster.1")),
            Err(SessionError::Marker { .. })
        ));
        assert_eq!(store.load("roaster_1")?, Some(ours.clone()));

        let mut other_port = ours.clone();
        other_port.port_id = "roaster.1".to_string();
        assert!(!store.owns(&other_port));
        assert!(store.owns(&ours));
        Ok(())
    }

    #[test]
    fn replaced_marker_is_not_owned() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = MarkerStore::new(dir.path());
        let mut ours = marker("p1");
        store.create(&ours)?;
        ours.pid = ours.pid.wrapping_add(1);
        assert!(!store.owns(&ours));
        Ok(())
    }

    #[test]
    fn list_tolerates_missing_dir_and_corrupt_markers() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = MarkerStore::new(dir.path().join("absent"));
        assert!(store.list()?.is_empty());
        assert!(store.remove_all()?.is_empty());

        let store = MarkerStore::new(dir.path());
        fs::write(dir.path().join("broken.json"), b"{not json")?;
        fs::write(dir.path().join("notes.txt"), b"ignored")?;
        store.create(&marker("p1"))?;

        let entries = store.list()?;
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0], MarkerEntry::Unreadable { .. }));
        assert!(matches!(entries[1], MarkerEntry::Active { .. }));

        assert_eq!(store.remove_all()?.len(), 2);
        assert!(store.list()?.is_empty());
        assert!(dir.path().join("notes.txt").exists());
        Ok(())
    }
}
