use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::archive_worker::{self, ArchiveContext};
use super::archiver::{list_volumes, remove_archive_files, Archiver};
use super::budget::DiskBudget;
use super::classifier::{load_manifest, Classifier};
use super::post_process::PostProcessor;
use super::queue::{ArchiveEvent, ArchiveJob, ArchiveOutput, TransferEvent, TransferJob, WorkQueue};
use super::transfer_worker::{self, TransferContext};
use super::{RunSummary, Task, TaskKind, TaskStatus};
use crate::error::{IngestError, Result};
use crate::remote::{RemoteConnector, RemoteSession};
use crate::storage::Ledger;
use crate::utils::{disk, format_size, Config, RetryPolicy};

/// How a not-yet-started task enters the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Archive { split: bool },
    Direct,
    TooLarge,
}

/// Work produced by planning, pushed to the queues only once planning
/// has fully succeeded.
#[derive(Debug, Default)]
struct Plan {
    archive: Vec<ArchiveJob>,
    transfer: Vec<TransferJob>,
}

/// Bookkeeping the drain loop carries between events.
#[derive(Debug, Default)]
struct DrainState {
    /// Disk budget held per task, released once its archive is gone.
    reservations: HashMap<String, u64>,
    live_archivers: HashSet<usize>,
    live_transfers: HashSet<usize>,
    transfer_workers: usize,
    transfers_stopping: bool,
}

/// Owns the ledger for a run: plans work, feeds the worker pools, folds
/// their results back into durable state and runs the post phases.
pub struct Coordinator {
    config: Arc<Config>,
    connector: Arc<dyn RemoteConnector>,
    archiver: Arc<dyn Archiver>,
    budget: Arc<DiskBudget>,
    cancel: Arc<AtomicBool>,
    retry: RetryPolicy,
}

impl Coordinator {
    pub fn new(config: Config, connector: Arc<dyn RemoteConnector>, archiver: Arc<dyn Archiver>) -> Self {
        let budget = Arc::new(DiskBudget::new(config.scratch_capacity.bytes()));
        let retry = config.retry_policy();
        Self {
            config: Arc::new(config),
            connector,
            archiver,
            budget,
            cancel: Arc::new(AtomicBool::new(false)),
            retry,
        }
    }

    pub fn budget(&self) -> Arc<DiskBudget> {
        self.budget.clone()
    }

    /// Setting the flag asks every worker to stop after its current item.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        self.run_inner().instrument(info_span!("run", %run_id)).await
    }

    async fn run_inner(&self) -> Result<RunSummary> {
        let config = &self.config;
        info!(
            "Starting ingest of {} into {}",
            config.source_root.display(),
            config.remote_root
        );
        tokio::fs::create_dir_all(&config.scratch_dir).await?;
        disk::check_scratch_capacity(&config.scratch_dir, self.budget.capacity());

        let session = self.connector.connect(&config.credentials()).await?;
        let classifier = Classifier::new(config, self.archiver.extension());

        let mut ledger = if Ledger::exists(&config.ledger_path) {
            Ledger::load(&config.ledger_path)?
        } else {
            let rows = load_manifest(&config.manifest_path())?;
            classifier.build_ledger(&rows, &config.ledger_path)?
        };

        if let Some(invalid) = ledger.tasks().iter().find(|t| t.status == TaskStatus::Invalid) {
            return Err(IngestError::Validation {
                label: invalid.label.clone(),
                reason: invalid.note.clone().unwrap_or_else(|| "marked invalid".to_string()),
            });
        }

        classifier
            .mark_existing(session.as_ref(), &mut ledger, &self.retry)
            .await?;
        check_sources(&ledger)?;
        self.measure_sizes(&mut ledger).await?;

        let mut state = DrainState::default();
        let plan = self
            .plan(&mut ledger, &classifier, session.as_ref(), &mut state)
            .await?;
        ledger.persist()?;

        if plan.archive.is_empty() && plan.transfer.is_empty() {
            info!("Nothing to archive or transfer");
        } else {
            self.drain(&mut ledger, plan, &mut state).await?;
        }

        if self.cancel.load(Ordering::SeqCst) {
            ledger.persist()?;
            return Err(IngestError::Cancelled);
        }

        PostProcessor::new(
            session.as_ref(),
            self.retry,
            config.metadata_prefix.clone(),
            config.send_to_archive_tier,
        )
        .run(&mut ledger)
        .await?;

        let summary = ledger.summary(config.send_to_archive_tier);
        info!(incomplete = summary.incomplete, "Run finished\n{}", summary);
        Ok(summary)
    }

    /// Measures every task that still needs its size, in parallel.
    async fn measure_sizes(&self, ledger: &mut Ledger) -> Result<()> {
        let pending: Vec<(String, PathBuf)> = ledger
            .tasks()
            .iter()
            .filter(|t| t.size_bytes.is_none() && !t.status.is_skip())
            .filter(|t| matches!(t.kind, TaskKind::File | TaskKind::Folder))
            .filter(|t| t.status.rank() <= TaskStatus::QueuedArchive.rank())
            .map(|t| (t.label.clone(), t.local_path.clone()))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        info!("Measuring {} payloads", pending.len());
        let paths: Vec<PathBuf> = pending.iter().map(|(_, p)| p.clone()).collect();
        let sizes = tokio::task::spawn_blocking(move || disk::measure_all(&paths))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        for ((label, _), size) in pending.into_iter().zip(sizes) {
            ledger.task_mut(&label)?.size_bytes = Some(size?);
        }
        ledger.persist()?;
        Ok(())
    }

    fn admission(&self, task: &Task) -> Result<Admission> {
        let size = task.size_bytes.unwrap_or(0);
        let max_single = self.config.max_single_archive_bytes.bytes();
        let oversized = size > max_single;

        let admission = if oversized {
            if self.config.split_oversized && self.archiver.supports_multi_volume() {
                Admission::Archive { split: true }
            } else if self.config.skip_oversized {
                return Ok(Admission::TooLarge);
            } else {
                return Err(IngestError::Capacity {
                    label: task.label.clone(),
                    size,
                    limit: max_single,
                    limit_name: "maximum single archive size",
                });
            }
        } else if task.archive_path.is_some() {
            Admission::Archive { split: false }
        } else {
            Admission::Direct
        };

        if matches!(admission, Admission::Archive { .. }) && size > self.budget.capacity() {
            return Err(IngestError::Capacity {
                label: task.label.clone(),
                size,
                limit: self.budget.capacity(),
                limit_name: "scratch capacity",
            });
        }
        Ok(admission)
    }

    /// Decides what every task needs next and reconciles the scratch
    /// directory with the ledger.
    async fn plan(
        &self,
        ledger: &mut Ledger,
        classifier: &Classifier,
        session: &dyn RemoteSession,
        state: &mut DrainState,
    ) -> Result<Plan> {
        // Every capacity problem surfaces before anything is queued.
        let mut admissions = Vec::new();
        for task in ledger.tasks() {
            if task.parent.is_none() && matches!(task.status, TaskStatus::Pending | TaskStatus::QueuedArchive) {
                admissions.push((task.label.clone(), self.admission(task)?));
            }
        }

        self.reconcile_scratch(ledger, state)?;

        let mut plan = Plan::default();
        for (label, admission) in admissions {
            match admission {
                Admission::TooLarge => {
                    let task = ledger.task(&label)?;
                    warn!(
                        label = %label,
                        "Skipping: {} exceeds the single archive limit",
                        format_size(task.size_bytes.unwrap_or(0))
                    );
                    ledger.transition(&label, TaskStatus::SkippedTooLarge)?;
                }
                Admission::Archive { split } => {
                    let task = ledger.task_mut(&label)?;
                    if task.archive_path.is_none() {
                        // Oversized file or raw folder: the remote gets the archive instead.
                        let archive = classifier.archive_path(&label);
                        if let (Some(dir), Some(name)) = (task.remote_path.parent(), archive.file_name()) {
                            task.remote_path = dir.join(name.to_string_lossy());
                        }
                        task.archive_path = Some(archive);
                    }
                    let archive = task.archive_path.clone().unwrap_or_default();
                    plan.archive.push(ArchiveJob {
                        label: label.clone(),
                        source: task.local_path.clone(),
                        archive,
                        size_bytes: task.size_bytes.unwrap_or(0),
                        volume_size: split.then(|| self.config.volume_size.bytes()),
                    });
                    ledger.transition(&label, TaskStatus::QueuedArchive)?;
                }
                Admission::Direct => {
                    let task = ledger.task(&label)?;
                    plan.transfer.push(transfer_job(task));
                    ledger.transition(&label, TaskStatus::QueuedUpload)?;
                }
            }
        }

        // Archived payloads waiting for upload, from an earlier run.
        let waiting: Vec<String> = ledger
            .tasks()
            .iter()
            .filter(|t| t.is_remote_tracked())
            .filter(|t| matches!(t.status, TaskStatus::Archived | TaskStatus::QueuedUpload))
            .filter(|t| !plan.transfer.iter().any(|j| j.label == t.label))
            .map(|t| t.label.clone())
            .collect();
        for label in waiting {
            let task = ledger.task(&label)?;
            let payload = task.payload_path().to_path_buf();
            if payload.exists() {
                plan.transfer.push(transfer_job(task));
                if task.status == TaskStatus::Archived {
                    ledger.transition(&label, TaskStatus::QueuedUpload)?;
                }
                continue;
            }
            let remote = task.remote_path.clone();
            let present = self
                .retry
                .run("object lookup", || session.object_exists(&remote))
                .await?;
            if !present {
                return Err(IngestError::MissingPayload { label, path: payload });
            }
            info!(label = %label, "Archive is gone but {} exists, marking uploaded", remote);
            ledger.transition(&label, TaskStatus::Uploaded)?;
        }

        // Split parents whose volumes all finished before the last stop.
        let parents: Vec<String> = ledger
            .tasks()
            .iter()
            .filter(|t| t.multi_volume && t.status.rank() < TaskStatus::Uploaded.rank())
            .map(|t| t.label.clone())
            .collect();
        for parent in parents {
            if ledger.sync_parent(&parent)? == Some(TaskStatus::Uploaded) {
                info!(label = %parent, "All volumes were uploaded before the last stop");
                if let Some(archive) = ledger.task(&parent)?.archive_path.clone() {
                    if let Err(e) = remove_archive_files(&archive) {
                        warn!(label = %parent, "Could not remove {}: {}", archive.display(), e);
                    }
                }
                self.release(state, &parent);
            }
        }

        info!(
            archive = plan.archive.len(),
            transfer = plan.transfer.len(),
            "Planned work; {} of scratch space free",
            format_size(self.budget.available())
        );
        Ok(plan)
    }

    /// Deletes partial and stale archives, adopts archives that are still
    /// waiting for upload, and charges unknown scratch files to the budget.
    fn reconcile_scratch(&self, ledger: &Ledger, state: &mut DrainState) -> Result<()> {
        let mut owned: HashSet<PathBuf> = HashSet::new();

        for task in ledger.tasks().iter().filter(|t| t.parent.is_none()) {
            let Some(archive) = &task.archive_path else {
                continue;
            };
            match task.status {
                TaskStatus::Pending | TaskStatus::QueuedArchive => {
                    let freed = remove_archive_files(archive)?;
                    if freed > 0 {
                        info!(label = %task.label, "Removed partial archive ({})", format_size(freed));
                    }
                }
                TaskStatus::Archived | TaskStatus::QueuedUpload => {
                    let volumes = list_volumes(archive)?;
                    let mut size = 0;
                    for volume in &volumes {
                        size += std::fs::metadata(volume)?.len();
                    }
                    let reserved = self.budget.adopt(size);
                    if reserved < size {
                        warn!(label = %task.label, "Adopted archive is larger than the free scratch budget");
                    }
                    debug!(label = %task.label, "Adopted {} of existing archive", format_size(reserved));
                    state.reservations.insert(task.label.clone(), reserved);
                    owned.extend(volumes);
                }
                _ => {
                    let freed = remove_archive_files(archive)?;
                    if freed > 0 {
                        info!(label = %task.label, "Removed uploaded archive left behind ({})", format_size(freed));
                    }
                }
            }
        }

        let mut leftover = 0;
        for (path, size) in disk::scan_scratch(&self.config.scratch_dir)? {
            if !owned.contains(&path) {
                warn!("Unknown file in scratch directory: {}", path.display());
                leftover += size;
            }
        }
        if leftover > 0 {
            let taken = self.budget.adopt(leftover);
            warn!("Scratch budget reduced by {} of unknown files", format_size(taken));
        }
        Ok(())
    }

    async fn drain(&self, ledger: &mut Ledger, plan: Plan, state: &mut DrainState) -> Result<()> {
        let archivers = if plan.archive.is_empty() {
            0
        } else {
            self.config.archiver_workers.max(1)
        };
        let transfers = self.config.transfer_workers.max(1);
        state.transfer_workers = transfers;

        let archive_queue = WorkQueue::new();
        let transfer_queue = WorkQueue::new();
        for job in plan.archive {
            archive_queue.push(job);
        }
        archive_queue.shutdown(archivers);
        for job in plan.transfer {
            transfer_queue.push(job);
        }

        let (archive_tx, mut archive_rx) = mpsc::unbounded_channel();
        let (transfer_tx, mut transfer_rx) = mpsc::unbounded_channel();

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        handles.extend(archive_worker::spawn_pool(
            archivers,
            Arc::new(ArchiveContext {
                budget: self.budget.clone(),
                archiver: self.archiver.clone(),
                poll_interval: self.config.reserve_poll_interval,
                cancel: self.cancel.clone(),
            }),
            archive_queue.receiver(),
            archive_tx,
        ));
        handles.extend(transfer_worker::spawn_pool(
            transfers,
            Arc::new(TransferContext {
                connector: self.connector.clone(),
                credentials: self.config.credentials(),
                retry: self.retry,
                cancel: self.cancel.clone(),
            }),
            transfer_queue.receiver(),
            transfer_tx,
        ));
        state.live_archivers = (0..archivers).collect();
        state.live_transfers = (0..transfers).collect();
        info!("Started {} archivers and {} transfer workers", archivers, transfers);

        if state.live_archivers.is_empty() {
            stop_transfers(&transfer_queue, state);
        }

        let mut cancel_sent = false;
        while !(state.live_archivers.is_empty() && state.live_transfers.is_empty()) {
            if self.cancel.load(Ordering::SeqCst) && !cancel_sent {
                warn!("Cancellation requested, stopping workers after their current item");
                archive_queue.shutdown(archivers);
                transfer_queue.shutdown(transfers);
                self.budget.wake_all();
                cancel_sent = true;
            }

            let outcome = tokio::select! {
                event = archive_rx.recv(), if !state.live_archivers.is_empty() => match event {
                    Some(event) => self.on_archive_event(ledger, event, &transfer_queue, state),
                    None => {
                        state.live_archivers.clear();
                        stop_transfers(&transfer_queue, state);
                        Ok(())
                    }
                },
                event = transfer_rx.recv(), if !state.live_transfers.is_empty() => match event {
                    Some(event) => self.on_transfer_event(ledger, event, state),
                    None => {
                        state.live_transfers.clear();
                        Ok(())
                    }
                },
                _ = tokio::time::sleep(self.config.result_poll_timeout) => {
                    debug!(
                        archivers = state.live_archivers.len(),
                        transfers = state.live_transfers.len(),
                        "Waiting for worker results"
                    );
                    Ok(())
                }
            };

            if let Err(e) = outcome {
                return Err(self.abort(ledger, &handles, e));
            }
        }

        join_all(handles).await;
        Ok(())
    }

    fn on_archive_event(
        &self,
        ledger: &mut Ledger,
        event: ArchiveEvent,
        transfer_queue: &WorkQueue<TransferJob>,
        state: &mut DrainState,
    ) -> Result<()> {
        match event {
            ArchiveEvent::Completed(output) => {
                let jobs = self.on_archived(ledger, output, state)?;
                ledger.persist()?;
                for job in jobs {
                    transfer_queue.push(job);
                }
                Ok(())
            }
            ArchiveEvent::Failed { label, reason } => {
                warn!(label = %label, "Archiving failed, task left for the next run: {}", reason);
                ledger.task_mut(&label)?.note = Some(reason);
                ledger.persist()?;
                Ok(())
            }
            ArchiveEvent::Fatal(e) => Err(e),
            ArchiveEvent::WorkerStopped(id) => {
                state.live_archivers.remove(&id);
                debug!("Archiver {} stopped, {} left", id, state.live_archivers.len());
                if state.live_archivers.is_empty() {
                    stop_transfers(transfer_queue, state);
                }
                Ok(())
            }
        }
    }

    /// Records a finished archive and returns the uploads it needs. A split
    /// archive gets one ledger row per volume.
    fn on_archived(
        &self,
        ledger: &mut Ledger,
        output: ArchiveOutput,
        state: &mut DrainState,
    ) -> Result<Vec<TransferJob>> {
        let ArchiveOutput {
            label,
            volumes,
            reserved_bytes,
        } = output;
        ledger.transition(&label, TaskStatus::Archived)?;
        state.reservations.insert(label.clone(), reserved_bytes);

        if volumes.len() == 1 {
            let task = ledger.task_mut(&label)?;
            task.archive_path = volumes.into_iter().next();
            task.note = None;
            let job = transfer_job(task);
            ledger.transition(&label, TaskStatus::QueuedUpload)?;
            return Ok(vec![job]);
        }

        let parent = ledger.task_mut(&label)?;
        parent.multi_volume = true;
        parent.note = None;
        let parent = parent.clone();
        let collection = parent
            .remote_path
            .parent()
            .unwrap_or_else(|| parent.remote_path.clone());
        info!(label = %label, "Archive split into {} volumes", volumes.len());

        let mut jobs = Vec::with_capacity(volumes.len());
        for volume in volumes {
            let file_name = volume
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let volume_label = format!("{label}::{file_name}");
            if ledger.get(&volume_label).is_none() {
                let mut row = Task::new(
                    &volume_label,
                    parent.local_path.clone(),
                    collection.join(&file_name),
                    TaskKind::Volume,
                );
                row.parent = Some(label.clone());
                row.metadata = parent.metadata.clone();
                row.size_bytes = Some(std::fs::metadata(&volume)?.len());
                row.archive_path = Some(volume);
                row.status = TaskStatus::Archived;
                row.updated_at = parent.updated_at;
                ledger.push(row)?;
            }
            let row = ledger.task(&volume_label)?;
            if row.status.rank() < TaskStatus::Uploaded.rank() {
                jobs.push(transfer_job(row));
                ledger.transition(&volume_label, TaskStatus::QueuedUpload)?;
            }
        }
        ledger.sync_parent(&label)?;
        Ok(jobs)
    }

    fn on_transfer_event(&self, ledger: &mut Ledger, event: TransferEvent, state: &mut DrainState) -> Result<()> {
        match event {
            TransferEvent::Completed { label, remote_path } => {
                debug!(label = %label, "Uploaded to {}", remote_path);
                self.on_uploaded(ledger, &label, state)
            }
            TransferEvent::Failed { label, reason } => {
                warn!(label = %label, "Upload failed, task left for the next run: {}", reason);
                ledger.task_mut(&label)?.note = Some(reason);
                ledger.persist()?;
                Ok(())
            }
            TransferEvent::Fatal(e) => Err(e),
            TransferEvent::WorkerStopped(id) => {
                state.live_transfers.remove(&id);
                debug!("Transfer worker {} stopped, {} left", id, state.live_transfers.len());
                Ok(())
            }
        }
    }

    fn on_uploaded(&self, ledger: &mut Ledger, label: &str, state: &mut DrainState) -> Result<()> {
        ledger.transition(label, TaskStatus::Uploaded)?;
        ledger.task_mut(label)?.note = None;
        ledger.persist()?;

        let task = ledger.task(label)?;
        let archive = task.archive_path.clone();
        let parent = task.parent.clone();

        match parent {
            None => {
                if let Some(archive) = archive {
                    if let Err(e) = remove_archive_files(&archive) {
                        warn!(label, "Could not remove {}: {}", archive.display(), e);
                    }
                    self.release(state, label);
                }
            }
            Some(parent) => {
                if let Some(volume) = archive {
                    if let Err(e) = disk::remove_files(&[volume.clone()]) {
                        warn!(label, "Could not remove {}: {}", volume.display(), e);
                    }
                }
                if ledger.sync_parent(&parent)? == Some(TaskStatus::Uploaded) {
                    info!(label = %parent, "All volumes uploaded");
                    self.release(state, &parent);
                }
                ledger.persist()?;
            }
        }
        Ok(())
    }

    fn release(&self, state: &mut DrainState, label: &str) {
        if let Some(bytes) = state.reservations.remove(label) {
            self.budget.release(bytes);
            debug!(label, "Released {} of scratch space", format_size(bytes));
        }
    }

    /// Stops everything after a fatal error and saves what is known.
    fn abort(&self, ledger: &Ledger, handles: &[JoinHandle<()>], e: IngestError) -> IngestError {
        error!("Fatal error, stopping all workers: {}", e);
        self.cancel.store(true, Ordering::SeqCst);
        self.budget.wake_all();
        for handle in handles {
            handle.abort();
        }
        if let Err(persist) = ledger.persist() {
            error!("Could not persist ledger after fatal error: {}", persist);
        }
        e
    }
}

fn stop_transfers(queue: &WorkQueue<TransferJob>, state: &mut DrainState) {
    if !state.transfers_stopping {
        debug!("Archiving drained, stopping {} transfer workers", state.transfer_workers);
        queue.shutdown(state.transfer_workers);
        state.transfers_stopping = true;
    }
}

fn transfer_job(task: &Task) -> TransferJob {
    TransferJob {
        label: task.label.clone(),
        payload: task.payload_path().to_path_buf(),
        remote_path: task.remote_path.clone(),
        collection: task.uploads_collection(),
    }
}

/// Every task that still reads its local source must find it on disk.
fn check_sources(ledger: &Ledger) -> Result<()> {
    for task in ledger.tasks() {
        let reads_source = match task.status {
            TaskStatus::Pending | TaskStatus::QueuedArchive => task.kind != TaskKind::EmptyFolder,
            TaskStatus::QueuedUpload => task.archive_path.is_none(),
            _ => false,
        };
        if reads_source && !task.local_path.exists() {
            return Err(IngestError::MissingPayload {
                label: task.label.clone(),
                path: task.local_path.clone(),
            });
        }
    }
    Ok(())
}
