use std::path::PathBuf;
use thiserror::Error;

use crate::ingest::archiver::ArchiveError;
use crate::ingest::TaskStatus;
use crate::remote::RemoteError;
use crate::storage::LedgerError;

/// Everything that can stop a pipeline run.
///
/// Validation, capacity, integrity and replica-health errors are fatal by
/// construction; transient remote failures are retried before they surface
/// here as `Remote`.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("validation failed for {label}: {reason}")]
    Validation { label: String, reason: String },

    #[error("{label} needs {size} bytes but the {limit_name} is {limit} bytes")]
    Capacity {
        label: String,
        size: u64,
        limit: u64,
        limit_name: &'static str,
    },

    #[error("archive for {label} failed verification: {path}")]
    ArchiveIntegrity { label: String, path: PathBuf },

    #[error("replica {replica} of {path} reported status '{status}'")]
    ReplicaHealth {
        path: String,
        replica: u32,
        status: String,
    },

    #[error("payload for {label} is missing: {path}")]
    MissingPayload { label: String, path: PathBuf },

    #[error("illegal status transition for {label}: {from} -> {to}")]
    Transition {
        label: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("remote repository error: {0}")]
    Remote(#[from] RemoteError),

    #[error("archiver error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("run cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, IngestError>;
