use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::queue::{TransferEvent, TransferJob, WorkItem, WorkReceiver};
use crate::error::{IngestError, Result};
use crate::remote::{Credentials, RemoteConnector, RemotePath, RemoteSession, ReplicaStatus, UploadOptions};
use crate::utils::disk;
use crate::utils::RetryPolicy;

pub struct TransferContext {
    pub connector: Arc<dyn RemoteConnector>,
    pub credentials: Credentials,
    pub retry: RetryPolicy,
    pub cancel: Arc<AtomicBool>,
}

pub fn spawn_pool(
    workers: usize,
    ctx: Arc<TransferContext>,
    jobs: WorkReceiver<TransferJob>,
    results: UnboundedSender<TransferEvent>,
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
    ctx: Arc<TransferContext>,
    jobs: WorkReceiver<TransferJob>,
    results: UnboundedSender<TransferEvent>,
) {
    // Sessions are never shared between workers.
    let session = match ctx.connector.connect(&ctx.credentials).await {
        Ok(session) => session,
        Err(e) => {
            error!("Transfer worker {} could not connect: {}", worker_id, e);
            let _ = results.send(TransferEvent::Fatal(e.into()));
            let _ = results.send(TransferEvent::WorkerStopped(worker_id));
            return;
        }
    };
    info!("Transfer worker {} started", worker_id);

    loop {
        if ctx.cancel.load(Ordering::SeqCst) {
            info!("Transfer worker {} cancelled", worker_id);
            break;
        }
        match jobs.next().await {
            Some(WorkItem::Task(job)) => {
                let event = process(worker_id, &ctx, session.as_ref(), job).await;
                let _ = results.send(event);
            }
            Some(WorkItem::Shutdown) => {
                info!("Transfer worker {} shutting down", worker_id);
                break;
            }
            None => {
                warn!("Transfer worker {} queue closed", worker_id);
                break;
            }
        }
    }

    let _ = results.send(TransferEvent::WorkerStopped(worker_id));
}

async fn process(
    worker_id: usize,
    ctx: &TransferContext,
    session: &dyn RemoteSession,
    job: TransferJob,
) -> TransferEvent {
    let start = Instant::now();
    match transfer(ctx, session, &job).await {
        Ok(()) => {
            info!(
                worker = worker_id,
                label = %job.label,
                "Transferred {} to {} in {:?}",
                job.payload.display(),
                job.remote_path,
                start.elapsed()
            );
            TransferEvent::Completed {
                label: job.label,
                remote_path: job.remote_path,
            }
        }
        // Upload problems leave the task queued for the next run.
        Err(IngestError::Remote(e)) => {
            error!(worker = worker_id, label = %job.label, "Upload failed: {}", e);
            TransferEvent::Failed {
                label: job.label,
                reason: e.to_string(),
            }
        }
        Err(e) => TransferEvent::Fatal(e),
    }
}

async fn transfer(ctx: &TransferContext, session: &dyn RemoteSession, job: &TransferJob) -> Result<()> {
    if tokio::fs::metadata(&job.payload).await.is_err() {
        return Err(IngestError::MissingPayload {
            label: job.label.clone(),
            path: job.payload.clone(),
        });
    }

    if let Some(parent) = job.remote_path.parent() {
        ensure_collection(ctx, session, &parent).await?;
    }

    let objects = if job.collection {
        upload_folder(ctx, session, job).await?
    } else {
        let remote = &job.remote_path;
        let present = ctx
            .retry
            .run("object lookup", || session.object_exists(remote))
            .await?;
        if present {
            info!(label = %job.label, "{} already exists, skipping upload", remote);
        } else {
            ctx.retry
                .run("upload", || session.upload(&job.payload, remote, UploadOptions::default()))
                .await?;
        }
        vec![remote.clone()]
    };

    for object in &objects {
        check_replicas(ctx, session, object).await?;
    }
    Ok(())
}

async fn ensure_collection(ctx: &TransferContext, session: &dyn RemoteSession, path: &RemotePath) -> Result<()> {
    let exists = ctx
        .retry
        .run("collection lookup", || session.collection_exists(path))
        .await?;
    if !exists {
        debug!("Creating collection {}", path);
        ctx.retry
            .run("collection create", || session.create_collection(path))
            .await?;
    }
    Ok(())
}

/// Uploads every file of the folder that is not on the remote yet, so a
/// folder upload cut short by an earlier run is completed file by file.
/// Returns the remote object of every file.
async fn upload_folder(ctx: &TransferContext, session: &dyn RemoteSession, job: &TransferJob) -> Result<Vec<RemotePath>> {
    let files = collection_objects(&job.payload, &job.remote_path).await?;
    ensure_collection(ctx, session, &job.remote_path).await?;
    let mut collections: HashSet<RemotePath> = HashSet::from([job.remote_path.clone()]);
    let mut skipped = 0;

    for (local, remote) in &files {
        if let Some(parent) = remote.parent() {
            if collections.insert(parent.clone()) {
                ensure_collection(ctx, session, &parent).await?;
            }
        }
        let present = ctx
            .retry
            .run("object lookup", || session.object_exists(remote))
            .await?;
        if present {
            skipped += 1;
            continue;
        }
        ctx.retry
            .run("upload", || session.upload(local, remote, UploadOptions::default()))
            .await?;
    }

    if skipped > 0 {
        info!(
            label = %job.label,
            "{} of {} files were already in {}",
            skipped,
            files.len(),
            job.remote_path
        );
    }
    Ok(files.into_iter().map(|(_, remote)| remote).collect())
}

/// Every file under `folder` paired with the object it becomes under
/// `remote`.
pub(crate) async fn collection_objects(folder: &Path, remote: &RemotePath) -> io::Result<Vec<(PathBuf, RemotePath)>> {
    let root = folder.to_path_buf();
    let files = tokio::task::spawn_blocking(move || disk::list_files(&root))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
    Ok(files
        .iter()
        .map(|rel| (folder.join(rel), remote.join_relative(rel)))
        .collect())
}

async fn check_replicas(ctx: &TransferContext, session: &dyn RemoteSession, path: &RemotePath) -> Result<()> {
    let replicas = ctx
        .retry
        .run("replica query", || session.list_replicas(path))
        .await?;
    if replicas.is_empty() {
        return Err(IngestError::ReplicaHealth {
            path: path.to_string(),
            replica: 0,
            status: "missing".to_string(),
        });
    }
    for replica in replicas {
        if replica.status != ReplicaStatus::Good {
            return Err(IngestError::ReplicaHealth {
                path: path.to_string(),
                replica: replica.number,
                status: replica.status.to_string(),
            });
        }
    }
    Ok(())
}
