//! Durable paused-progress snapshots.
//!
//! Once a download is paused the desktop app stops reporting usable progress
//! figures (they often reset to zero), so the last good value seen while the
//! download was active is kept here and overlaid on top of server snapshots.
//! The table is persisted so a restart mid-pause still shows real progress.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PausedProgress {
    pub progress: f64,
    pub downloaded: String,
}

/// Snapshot table keyed by download id, mirrored to a JSON file.
///
/// Storage failure degrades to memory-only operation with a warning; the
/// overlay then simply does not survive a restart.
pub struct PausedProgressStore {
    path: Option<PathBuf>,
    table: Mutex<HashMap<String, PausedProgress>>,
}

impl PausedProgressStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        let table = path
            .as_deref()
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|content| match serde_json::from_str(&content) {
                Ok(table) => Some(table),
                Err(e) => {
                    tracing::warn!("Ignoring unreadable snapshot file: {}", e);
                    None
                }
            })
            .unwrap_or_default();

        Self {
            path,
            table: Mutex::new(table),
        }
    }

    pub fn get(&self, download_id: &str) -> Option<PausedProgress> {
        self.table.lock().unwrap().get(download_id).cloned()
    }

    /// Record the latest good progress for a download. A no-op when the
    /// stored value is already identical, so active-poll refreshes do not
    /// rewrite the file every tick.
    pub fn record(&self, download_id: &str, progress: f64, downloaded: &str) {
        let entry = PausedProgress {
            progress,
            downloaded: downloaded.to_string(),
        };

        {
            let mut table = self.table.lock().unwrap();
            if table.get(download_id) == Some(&entry) {
                return;
            }
            table.insert(download_id.to_string(), entry);
        }
        self.persist();
    }

    /// Drop the snapshot for a download (resumed, finished, or killed).
    pub fn remove(&self, download_id: &str) {
        let removed = self.table.lock().unwrap().remove(download_id).is_some();
        if removed {
            self.persist();
        }
    }

    /// Ids currently held, for seeding paused state after a restart.
    pub fn entries(&self) -> Vec<(String, PausedProgress)> {
        self.table
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn persist(&self) {
        let Some(path) = &self.path else { return };
        let json = {
            let table = self.table.lock().unwrap();
            match serde_json::to_string_pretty(&*table) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!("Could not serialize snapshot table: {}", e);
                    return;
                }
            }
        };
        if let Err(e) = std::fs::write(path, json) {
            tracing::warn!("Could not persist snapshot table: {}", e);
        }
    }
}
