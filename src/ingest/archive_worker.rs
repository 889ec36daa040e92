use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::archiver::{list_volumes, remove_archive_files, ArchiveError, Archiver};
use super::budget::DiskBudget;
use super::queue::{ArchiveEvent, ArchiveJob, ArchiveOutput, WorkItem, WorkReceiver};
use crate::error::IngestError;
use crate::utils::format_size;

/// Shared state handed to every archiver worker.
pub struct ArchiveContext {
    pub budget: Arc<DiskBudget>,
    pub archiver: Arc<dyn Archiver>,
    pub poll_interval: Duration,
    pub cancel: Arc<AtomicBool>,
}

pub fn spawn_pool(
    workers: usize,
    ctx: Arc<ArchiveContext>,
    jobs: WorkReceiver<ArchiveJob>,
    results: UnboundedSender<ArchiveEvent>,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|worker_id| {
            let ctx = ctx.clone();
            let jobs = jobs.clone();
            let results = results.clone();
            tokio::spawn(async move { worker_loop(worker_id, ctx, jobs, results).await })
        })
        .collect()
}

pub async fn worker_loop(
    worker_id: usize,
    ctx: Arc<ArchiveContext>,
    jobs: WorkReceiver<ArchiveJob>,
    results: UnboundedSender<ArchiveEvent>,
) {
    info!("Archiver {} started", worker_id);

    loop {
        if ctx.cancel.load(Ordering::SeqCst) {
            info!("Archiver {} cancelled", worker_id);
            break;
        }
        match jobs.next().await {
            Some(WorkItem::Task(job)) => {
                let event = process(worker_id, &ctx, job).await;
                let _ = results.send(event);
            }
            Some(WorkItem::Shutdown) => {
                info!("Archiver {} shutting down", worker_id);
                break;
            }
            None => {
                warn!("Archiver {} queue closed", worker_id);
                break;
            }
        }
    }

    let _ = results.send(ArchiveEvent::WorkerStopped(worker_id));
}

async fn process(worker_id: usize, ctx: &ArchiveContext, job: ArchiveJob) -> ArchiveEvent {
    let label = job.label.clone();
    match ctx
        .budget
        .reserve_waiting(&label, job.size_bytes, ctx.poll_interval, worker_id, &ctx.cancel)
        .await
    {
        Ok(()) => {}
        Err(IngestError::Cancelled) => {
            return ArchiveEvent::Failed {
                label,
                reason: "cancelled while waiting for scratch space".to_string(),
            }
        }
        Err(e) => return ArchiveEvent::Fatal(e),
    }

    let start = Instant::now();
    info!(
        worker = worker_id,
        label = %label,
        archiver = ctx.archiver.name(),
        "Compressing {}",
        job.source.display()
    );
    let compressed = match job.volume_size {
        Some(volume_size) => {
            ctx.archiver
                .compress_multi_volume(&job.source, &job.archive, volume_size)
                .await
        }
        None => ctx.archiver.compress(&job.source, &job.archive).await,
    };

    if let Err(e) = compressed {
        error!(worker = worker_id, label = %label, "Compression failed: {}", e);
        if let Err(cleanup) = remove_archive_files(&job.archive) {
            warn!("Could not remove partial archive {}: {}", job.archive.display(), cleanup);
        }
        ctx.budget.release(job.size_bytes);
        return ArchiveEvent::Failed {
            label,
            reason: e.to_string(),
        };
    }

    match ctx.archiver.verify(&job.archive, job.volume_size.is_some()).await {
        Ok(true) => {}
        Ok(false) => {
            return ArchiveEvent::Fatal(IngestError::ArchiveIntegrity {
                label,
                path: job.archive,
            })
        }
        Err(e) => return ArchiveEvent::Fatal(e.into()),
    }

    let volumes = match list_volumes(&job.archive) {
        Ok(v) if !v.is_empty() => v,
        Ok(_) => return ArchiveEvent::Fatal(ArchiveError::Missing(job.archive).into()),
        Err(e) => return ArchiveEvent::Fatal(e.into()),
    };

    info!(
        worker = worker_id,
        label = %label,
        volumes = volumes.len(),
        "Archived {} in {:?}",
        format_size(job.size_bytes),
        start.elapsed()
    );
    ArchiveEvent::Completed(ArchiveOutput {
        label,
        volumes,
        reserved_bytes: job.size_bytes,
    })
}
