use chrono::Utc;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::error::{IngestError, Result};
use crate::ingest::{RunSummary, Task, TaskStatus};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("ledger line {line} is corrupt: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode task: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("duplicate task label: {0}")]
    Duplicate(String),
}

/// Ordered task list persisted as JSON lines.
///
/// The file on disk is the source of truth: every persist replaces it
/// atomically, and `load` rebuilds exactly the tasks that were written.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tasks: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn from_tasks(
        path: impl Into<PathBuf>,
        tasks: impl IntoIterator<Item = Task>,
    ) -> std::result::Result<Self, LedgerError> {
        let mut ledger = Self::new(path);
        for task in tasks {
            ledger.push(task)?;
        }
        Ok(ledger)
    }

    pub fn exists(path: &Path) -> bool {
        path.is_file()
    }

    pub fn load(path: impl Into<PathBuf>) -> std::result::Result<Self, LedgerError> {
        let path = path.into();
        let reader = BufReader::new(File::open(&path)?);
        let mut ledger = Self::new(path);
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let task: Task = serde_json::from_str(&line).map_err(|source| LedgerError::Parse {
                line: idx + 1,
                source,
            })?;
            ledger.push(task)?;
        }
        info!("Loaded {} tasks from {}", ledger.len(), ledger.path.display());
        Ok(ledger)
    }

    /// Rewrites the ledger through a temp file, fsync and rename.
    pub fn persist(&self) -> std::result::Result<(), LedgerError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut writer = BufWriter::new(File::create(&tmp)?);
        for task in &self.tasks {
            serde_json::to_writer(&mut writer, task)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&tmp, &self.path)?;
        debug!("Persisted {} tasks to {}", self.tasks.len(), self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, label: &str) -> Option<&Task> {
        self.index.get(label).map(|&i| &self.tasks[i])
    }

    pub fn get_mut(&mut self, label: &str) -> Option<&mut Task> {
        self.index.get(label).map(|&i| &mut self.tasks[i])
    }

    pub fn task(&self, label: &str) -> Result<&Task> {
        self.get(label)
            .ok_or_else(|| IngestError::UnknownTask(label.to_string()))
    }

    pub fn task_mut(&mut self, label: &str) -> Result<&mut Task> {
        self.get_mut(label)
            .ok_or_else(|| IngestError::UnknownTask(label.to_string()))
    }

    pub fn push(&mut self, task: Task) -> std::result::Result<(), LedgerError> {
        if self.index.contains_key(&task.label) {
            return Err(LedgerError::Duplicate(task.label));
        }
        self.index.insert(task.label.clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    /// Moves a task along the status graph.
    pub fn transition(&mut self, label: &str, next: TaskStatus) -> Result<()> {
        let task = self.task_mut(label)?;
        if !task.status.can_transition_to(next) {
            return Err(IngestError::Transition {
                label: label.to_string(),
                from: task.status,
                to: next,
            });
        }
        if task.status != next {
            debug!(label, from = %task.status, to = %next, "Task transition");
            task.status = next;
            task.updated_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn labels_with_status(&self, status: TaskStatus) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.status == status)
            .map(|t| t.label.clone())
            .collect()
    }

    pub fn children<'a>(&'a self, parent: &'a str) -> impl Iterator<Item = &'a Task> + 'a {
        self.tasks
            .iter()
            .filter(move |t| t.parent.as_deref() == Some(parent))
    }

    /// Recomputes a split task's status as that of its least advanced
    /// volume. The parent only ever moves forward; returns the new status
    /// when it changed.
    pub fn sync_parent(&mut self, parent: &str) -> Result<Option<TaskStatus>> {
        let slowest = self
            .children(parent)
            .map(|t| t.status)
            .min_by_key(|s| s.rank());
        let Some(slowest) = slowest else {
            return Ok(None);
        };

        let task = self.task_mut(parent)?;
        if slowest.is_skip() || slowest == TaskStatus::Invalid || slowest.rank() <= task.status.rank() {
            return Ok(None);
        }
        debug!(label = parent, from = %task.status, to = %slowest, "Parent follows its volumes");
        task.status = slowest;
        task.updated_at = Some(Utc::now());
        Ok(Some(slowest))
    }

    pub fn summary(&self, send_to_archive_tier: bool) -> RunSummary {
        RunSummary::from_tasks(&self.tasks, send_to_archive_tier)
    }
}
