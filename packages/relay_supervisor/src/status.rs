//! Persisted supervisor status.
//!
//! The supervisor is the only writer. Readers (the `radio monitor` command,
//! dashboards) may see a stale record but never a torn one: writes go to a
//! temporary file that is renamed over the target.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::StatusError;
use crate::progress::StreamHealth;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Initializing,
    Spawning,
    Running,
    Stopped,
    Error,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SupervisorState::Initializing => "initializing",
            SupervisorState::Spawning => "spawning",
            SupervisorState::Running => "running",
            SupervisorState::Stopped => "stopped",
            SupervisorState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub state: SupervisorState,
    pub detail: Option<String>,
    /// Pid of the supervising process
    pub pid: u32,
    /// Pid of the encoder, while one is alive
    pub encoder_pid: Option<u32>,
    pub restart_attempts: u32,
    pub timestamp: DateTime<Utc>,
    pub stream_health: StreamHealth,
}

impl StatusRecord {
    /// Age of the record relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.timestamp)
    }
}

/// Destination for status records.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, record: &StatusRecord) -> Result<(), StatusError>;
}

/// Writes the status record as pretty JSON to a file.
#[derive(Debug, Clone)]
pub struct FileStatusSink {
    path: PathBuf,
}

impl FileStatusSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StatusSink for FileStatusSink {
    async fn publish(&self, record: &StatusRecord) -> Result<(), StatusError> {
        let json = serde_json::to_vec_pretty(record)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Read a status file written by [`FileStatusSink`].
///
/// Missing, unreadable or partial files all read as `None`.
pub fn read_status_file(path: &Path) -> Option<StatusRecord> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Status file {} unavailable: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(record) => Some(record),
        Err(e) => {
            debug!("Status file {} is not a valid record: {}", path.display(), e);
            None
        }
    }
}
