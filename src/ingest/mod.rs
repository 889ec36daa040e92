pub mod archive_worker;
pub mod archiver;
pub mod budget;
pub mod classifier;
pub mod coordinator;
pub mod post_process;
pub mod queue;
pub mod transfer_worker;

pub use budget::DiskBudget;
pub use coordinator::Coordinator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::remote::RemotePath;

/// One row of the ledger: a file, folder or archive volume to ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub label: String,
    pub local_path: PathBuf,
    pub remote_path: RemotePath,
    pub kind: TaskKind,
    pub archive_path: Option<PathBuf>,
    pub size_bytes: Option<u64>,
    pub status: TaskStatus,
    /// Set on volume rows; names the task whose archive was split.
    #[serde(default)]
    pub parent: Option<String>,
    /// Set on a task whose archive was split into volume rows.
    #[serde(default)]
    pub multi_volume: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, Option<String>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Last non-fatal failure, kept for the operator.
    #[serde(default)]
    pub note: Option<String>,
}

impl Task {
    pub fn new(
        label: impl Into<String>,
        local_path: impl Into<PathBuf>,
        remote_path: RemotePath,
        kind: TaskKind,
    ) -> Self {
        Self {
            label: label.into(),
            local_path: local_path.into(),
            remote_path,
            kind,
            archive_path: None,
            size_bytes: None,
            status: TaskStatus::Pending,
            parent: None,
            multi_volume: false,
            metadata: BTreeMap::new(),
            updated_at: None,
            note: None,
        }
    }

    /// What gets sent to the remote: the archive when there is one.
    pub fn payload_path(&self) -> &Path {
        self.archive_path.as_deref().unwrap_or(&self.local_path)
    }

    /// Whether the remote side is a collection rather than a data object.
    pub fn uploads_collection(&self) -> bool {
        self.kind == TaskKind::Folder && self.archive_path.is_none()
    }

    /// Rows that are sent to the remote themselves. Split parents are not;
    /// their volumes are.
    pub fn is_remote_tracked(&self) -> bool {
        !self.multi_volume && self.kind != TaskKind::EmptyFolder
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    File,
    Folder,
    EmptyFolder,
    Volume,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Folder => write!(f, "folder"),
            Self::EmptyFolder => write!(f, "empty_folder"),
            Self::Volume => write!(f, "volume"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    QueuedArchive,
    Archived,
    QueuedUpload,
    Uploaded,
    MetadataAdded,
    SentToArchiveTier,
    ArchivedRemote,
    SkippedEmpty,
    SkippedTooLarge,
    SkippedExists,
    Invalid,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 12] = [
        Self::Pending,
        Self::QueuedArchive,
        Self::Archived,
        Self::QueuedUpload,
        Self::Uploaded,
        Self::MetadataAdded,
        Self::SentToArchiveTier,
        Self::ArchivedRemote,
        Self::SkippedEmpty,
        Self::SkippedTooLarge,
        Self::SkippedExists,
        Self::Invalid,
    ];

    /// Position along the ingest chain. Skips and `Invalid` sit past the end
    /// so nothing can ever move out of them.
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::QueuedArchive => 1,
            Self::Archived => 2,
            Self::QueuedUpload => 3,
            Self::Uploaded => 4,
            Self::MetadataAdded => 5,
            Self::SentToArchiveTier => 6,
            Self::ArchivedRemote => 7,
            Self::SkippedEmpty | Self::SkippedTooLarge | Self::SkippedExists | Self::Invalid => 8,
        }
    }

    pub fn is_skip(self) -> bool {
        matches!(
            self,
            Self::SkippedEmpty | Self::SkippedTooLarge | Self::SkippedExists
        )
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (
                Pending,
                QueuedArchive | QueuedUpload | SkippedEmpty | SkippedTooLarge | SkippedExists | Invalid
            ) | (QueuedArchive, Archived | SkippedTooLarge)
                | (Archived, QueuedUpload | Uploaded)
                | (QueuedUpload, Uploaded)
                | (Uploaded, MetadataAdded)
                | (MetadataAdded, SentToArchiveTier)
                | (SentToArchiveTier, ArchivedRemote)
        )
    }

    /// Terminal for this run: nothing more will happen to the task under
    /// the given archival setting.
    pub fn is_done(self, send_to_archive_tier: bool) -> bool {
        if self.is_skip() {
            return true;
        }
        if send_to_archive_tier {
            self == Self::ArchivedRemote
        } else {
            self.rank() >= Self::MetadataAdded.rank() && self != Self::Invalid
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::QueuedArchive => "queued_archive",
            Self::Archived => "archived",
            Self::QueuedUpload => "queued_upload",
            Self::Uploaded => "uploaded",
            Self::MetadataAdded => "metadata_added",
            Self::SentToArchiveTier => "sent_to_archive_tier",
            Self::ArchivedRemote => "archived_remote",
            Self::SkippedEmpty => "skipped_empty",
            Self::SkippedTooLarge => "skipped_too_large",
            Self::SkippedExists => "skipped_exists",
            Self::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .iter()
            .copied()
            .find(|status| status.to_string() == s)
            .ok_or_else(|| format!("Invalid task status: {s}"))
    }
}

/// Per-status counts printed at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub counts: BTreeMap<TaskStatus, usize>,
    pub incomplete: usize,
}

impl RunSummary {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>, send_to_archive_tier: bool) -> Self {
        let mut summary = RunSummary::default();
        for task in tasks {
            *summary.counts.entry(task.status).or_default() += 1;
            if !task.status.is_done(send_to_archive_tier) {
                summary.incomplete += 1;
            }
        }
        summary
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (status, count) in &self.counts {
            writeln!(f, "{status:<22} {count}")?;
        }
        write!(f, "{:<22} {}", "incomplete", self.incomplete)
    }
}
