//! Messages exchanged between the coordinator and the worker pools.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::error::IngestError;
use crate::remote::RemotePath;

#[derive(Debug)]
pub enum WorkItem<T> {
    Task(T),
    /// One per worker; the worker reports itself stopped and exits.
    Shutdown,
}

/// FIFO work queue shared by every worker of one pool.
#[derive(Debug)]
pub struct WorkQueue<T> {
    sender: mpsc::UnboundedSender<WorkItem<T>>,
    receiver: WorkReceiver<T>,
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: WorkReceiver(Arc::new(Mutex::new(receiver))),
        }
    }

    /// Returns false once every receiver is gone.
    pub fn push(&self, job: T) -> bool {
        self.sender.send(WorkItem::Task(job)).is_ok()
    }

    pub fn shutdown(&self, workers: usize) {
        for _ in 0..workers {
            let _ = self.sender.send(WorkItem::Shutdown);
        }
    }

    pub fn receiver(&self) -> WorkReceiver<T> {
        self.receiver.clone()
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer end; clones share the same underlying queue.
#[derive(Debug)]
pub struct WorkReceiver<T>(Arc<Mutex<mpsc::UnboundedReceiver<WorkItem<T>>>>);

impl<T> Clone for WorkReceiver<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> WorkReceiver<T> {
    pub async fn next(&self) -> Option<WorkItem<T>> {
        self.0.lock().await.recv().await
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveJob {
    pub label: String,
    pub source: PathBuf,
    pub archive: PathBuf,
    /// Bytes reserved against the disk budget while the archive exists.
    pub size_bytes: u64,
    /// Split into volumes of this size instead of one archive.
    pub volume_size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ArchiveOutput {
    pub label: String,
    /// Archive files in upload order; more than one for a split archive.
    pub volumes: Vec<PathBuf>,
    pub reserved_bytes: u64,
}

#[derive(Debug)]
pub enum ArchiveEvent {
    Completed(ArchiveOutput),
    /// Compression failed; the task stays where it was.
    Failed { label: String, reason: String },
    Fatal(IngestError),
    WorkerStopped(usize),
}

#[derive(Debug, Clone)]
pub struct TransferJob {
    pub label: String,
    pub payload: PathBuf,
    pub remote_path: RemotePath,
    /// The payload is a folder uploaded as a collection.
    pub collection: bool,
}

#[derive(Debug)]
pub enum TransferEvent {
    Completed { label: String, remote_path: RemotePath },
    Failed { label: String, reason: String },
    Fatal(IngestError),
    WorkerStopped(usize),
}
