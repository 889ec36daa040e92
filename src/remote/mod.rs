//! Narrow interface to the content-managed repository.
//!
//! The pipeline only ever talks to the repository through [`RemoteSession`];
//! each transfer worker obtains its own session from a [`RemoteConnector`].

pub mod local;

pub use local::{LocalConnector, LocalRepository};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Tag the archival rule sets on objects it has picked up.
pub const ARCHIVE_STATUS_TAG: &str = "archive_status";
/// `archive_status` value once the object lives only on the archive tier.
pub const ARCHIVE_COMPLETED: &str = "completed_and_hot_deleted";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("authentication failed for {user}")]
    Authentication { user: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("checksum mismatch for {path}: local {local}, remote {remote}")]
    ChecksumMismatch {
        path: String,
        local: String,
        remote: String,
    },
    #[error("connection lost: {0}")]
    Connection(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata store is corrupt: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl RemoteError {
    /// Errors worth retrying: the call may succeed when repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Connection(_))
    }
}

/// Absolute, `/`-separated path inside the repository.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemotePath(String);

impl RemotePath {
    pub fn new(path: impl Into<String>) -> Self {
        let raw: String = path.into();
        let trimmed = raw.trim_end_matches('/');
        if trimmed.starts_with('/') {
            Self(trimmed.to_string())
        } else {
            Self(format!("/{trimmed}"))
        }
    }

    pub fn join(&self, segment: impl AsRef<str>) -> Self {
        let segment = segment.as_ref().trim_matches('/');
        if segment.is_empty() {
            return self.clone();
        }
        if self.0 == "/" {
            Self(format!("/{segment}"))
        } else {
            Self(format!("{}/{segment}", self.0))
        }
    }

    /// Joins a relative local path, converting its separators.
    pub fn join_relative(&self, relative: &Path) -> Self {
        relative
            .components()
            .fold(self.clone(), |acc, part| acc.join(part.as_os_str().to_string_lossy()))
    }

    pub fn parent(&self) -> Option<Self> {
        let idx = self.0.rfind('/')?;
        if self.0.len() <= 1 {
            return None;
        }
        Some(if idx == 0 {
            Self("/".to_string())
        } else {
            Self(self.0[..idx].to_string())
        })
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    /// Register a checksum with the uploaded object.
    pub checksum: bool,
    /// Compare the stored object against the local checksum after the write.
    pub verify: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            checksum: true,
            verify: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicaStatus {
    Good,
    Stale,
    Intermediate,
    WriteLocked,
}

impl fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Good => write!(f, "good"),
            Self::Stale => write!(f, "stale"),
            Self::Intermediate => write!(f, "intermediate"),
            Self::WriteLocked => write!(f, "write-locked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    pub number: u32,
    pub resource: String,
    pub status: ReplicaStatus,
}

#[derive(Debug, Clone, Default)]
pub struct RuleOutput {
    pub stdout: String,
    pub stderr: String,
}

pub type Metadata = BTreeMap<String, String>;

#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn collection_exists(&self, path: &RemotePath) -> Result<bool, RemoteError>;

    async fn create_collection(&self, path: &RemotePath) -> Result<(), RemoteError>;

    async fn object_exists(&self, path: &RemotePath) -> Result<bool, RemoteError>;

    /// Upload a file, or a folder as a collection of objects.
    async fn upload(
        &self,
        local: &Path,
        remote: &RemotePath,
        options: UploadOptions,
    ) -> Result<(), RemoteError>;

    async fn list_replicas(&self, path: &RemotePath) -> Result<Vec<Replica>, RemoteError>;

    async fn get_metadata(&self, path: &RemotePath) -> Result<Metadata, RemoteError>;

    async fn add_metadata_tag(
        &self,
        path: &RemotePath,
        key: &str,
        value: &str,
    ) -> Result<(), RemoteError>;

    async fn run_archival_rule(&self, path: &RemotePath) -> Result<RuleOutput, RemoteError>;
}

#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn RemoteSession>, RemoteError>;
}
