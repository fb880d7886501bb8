//! Interruption recovery.
//!
//! On teardown the partial answer of the running turn is written to a single
//! JSON file. The next start reads it once and deletes it; the record is
//! offered back only inside the freshness window.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::document::Document;
use crate::errors::Result;

/// Persisted partial answer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryRecord {
    /// Conversation id.
    pub chat_id: String,
    /// Message id.
    pub message_id: String,
    /// Flattened text at teardown.
    pub content: String,
    /// Save time, epoch milliseconds.
    pub timestamp: i64,
    /// Turn id.
    pub query_id: String,
}

impl RecoveryRecord {
    /// Snapshot a document at `now`.
    pub fn from_document(doc: &Document, now: DateTime<Utc>) -> Self {
        Self {
            chat_id: doc.conversation_id.to_string(),
            message_id: doc.message_id.to_string(),
            content: doc.flatten(),
            timestamp: now.timestamp_millis(),
            query_id: doc.turn_id.to_string(),
        }
    }

    /// Whether the record is at most `freshness` old at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, freshness: Duration) -> bool {
        let age_ms = now.timestamp_millis() - self.timestamp;
        let window_ms = i64::try_from(freshness.as_millis()).unwrap_or(i64::MAX);
        (0..=window_ms).contains(&age_ms)
    }
}

/// Single-record file store.
#[derive(Clone, Debug)]
pub struct RecoveryStore {
    path: PathBuf,
    freshness: Duration,
}

impl RecoveryStore {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>, freshness: Duration) -> Self {
        Self {
            path: path.into(),
            freshness,
        }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `record`, replacing any previous one. Failures are logged.
    pub fn save(&self, record: &RecoveryRecord) {
        match self.write(record) {
            Ok(()) => info!(
                turn_id = %record.query_id,
                bytes = record.content.len(),
                "saved interrupted answer"
            ),
            Err(e) => warn!(path = ?self.path, error = %e, "failed to save interrupted answer"),
        }
    }

    /// Persist `record`, returning I/O and encoding errors.
    pub fn write(&self, record: &RecoveryRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(record)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// Read the record once, delete the file, and return it if fresh.
    pub fn take_fresh(&self, now: DateTime<Utc>) -> Option<RecoveryRecord> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = ?self.path, error = %e, "failed to read recovery file");
                return None;
            }
        };

        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = ?self.path, error = %e, "failed to delete recovery file");
        }

        let record: RecoveryRecord = match serde_json::from_str(&content) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "discarding malformed recovery record");
                return None;
            }
        };

        if record.is_fresh(now, self.freshness) {
            Some(record)
        } else {
            debug!(turn_id = %record.query_id, "discarding stale recovery record");
            None
        }
    }
}
