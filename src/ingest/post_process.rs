//! Sequential phases run after both worker pools have drained.

use tracing::{error, info, warn};

use super::transfer_worker::collection_objects;
use super::{Task, TaskStatus};
use crate::error::Result;
use crate::remote::{
    RemoteError, RemotePath, RemoteSession, ReplicaStatus, ARCHIVE_COMPLETED, ARCHIVE_STATUS_TAG,
};
use crate::storage::Ledger;
use crate::utils::RetryPolicy;

/// Stored for metadata columns with no value.
pub const MISSING_VALUE: &str = "-";

const RULE_ACCEPTED: &str = "will be tagged.";

pub struct PostProcessor<'a> {
    session: &'a dyn RemoteSession,
    retry: RetryPolicy,
    metadata_prefix: String,
    send_to_archive_tier: bool,
}

impl<'a> PostProcessor<'a> {
    pub fn new(
        session: &'a dyn RemoteSession,
        retry: RetryPolicy,
        metadata_prefix: impl Into<String>,
        send_to_archive_tier: bool,
    ) -> Self {
        Self {
            session,
            retry,
            metadata_prefix: metadata_prefix.into(),
            send_to_archive_tier,
        }
    }

    /// Runs every phase once, persisting the ledger after each.
    pub async fn run(&self, ledger: &mut Ledger) -> Result<()> {
        let tagged = self.add_metadata(ledger).await?;
        sync_parents(ledger)?;
        ledger.persist()?;
        info!("Metadata attached to {} objects", tagged);

        if !self.send_to_archive_tier {
            return Ok(());
        }

        let sent = self.trigger_archival(ledger).await?;
        sync_parents(ledger)?;
        ledger.persist()?;
        info!("Archival rule accepted {} objects", sent);

        let archived = self.poll_archival(ledger).await?;
        sync_parents(ledger)?;
        ledger.persist()?;
        info!("{} objects are on the archive tier", archived);
        Ok(())
    }

    pub async fn add_metadata(&self, ledger: &mut Ledger) -> Result<usize> {
        let mut advanced = 0;
        for label in remote_rows(ledger, TaskStatus::Uploaded) {
            let task = ledger.task(&label)?.clone();
            match self.tag_object(&task).await {
                Ok(added) => {
                    info!(label = %label, added, "Metadata added to {}", task.remote_path);
                    ledger.transition(&label, TaskStatus::MetadataAdded)?;
                    advanced += 1;
                }
                Err(e) => record_failure(ledger, &label, "adding metadata", &e)?,
            }
        }
        Ok(advanced)
    }

    async fn tag_object(&self, task: &Task) -> std::result::Result<usize, RemoteError> {
        let path = &task.remote_path;
        let existing = self
            .retry
            .run("metadata lookup", || self.session.get_metadata(path))
            .await?;
        let mut added = 0;
        for (key, value) in &task.metadata {
            let tag = format!("{}{}", self.metadata_prefix, key);
            if existing.contains_key(&tag) {
                continue;
            }
            let value = value
                .as_deref()
                .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("nan"))
                .unwrap_or(MISSING_VALUE);
            self.retry
                .run("metadata tag", || self.session.add_metadata_tag(path, &tag, value))
                .await?;
            added += 1;
        }
        Ok(added)
    }

    pub async fn trigger_archival(&self, ledger: &mut Ledger) -> Result<usize> {
        let mut advanced = 0;
        for label in remote_rows(ledger, TaskStatus::MetadataAdded) {
            let path = ledger.task(&label)?.remote_path.clone();
            let outcome = async {
                let meta = self
                    .retry
                    .run("metadata lookup", || self.session.get_metadata(&path))
                    .await?;
                if meta.contains_key(ARCHIVE_STATUS_TAG) {
                    info!(label = %label, "{} already tagged for archival", path);
                    return Ok::<_, RemoteError>(true);
                }
                let out = self
                    .retry
                    .run("archival rule", || self.session.run_archival_rule(&path))
                    .await?;
                if out.stderr.trim().is_empty() && out.stdout.contains(RULE_ACCEPTED) {
                    Ok(true)
                } else {
                    warn!(
                        label = %label,
                        "Archival rule refused {}: {}",
                        path,
                        out.stderr.trim()
                    );
                    Ok(false)
                }
            }
            .await;

            match outcome {
                Ok(true) => {
                    ledger.transition(&label, TaskStatus::SentToArchiveTier)?;
                    advanced += 1;
                }
                Ok(false) => {}
                Err(e) => record_failure(ledger, &label, "triggering archival", &e)?,
            }
        }
        Ok(advanced)
    }

    pub async fn poll_archival(&self, ledger: &mut Ledger) -> Result<usize> {
        let mut advanced = 0;
        for label in remote_rows(ledger, TaskStatus::SentToArchiveTier) {
            let task = ledger.task(&label)?.clone();
            let path = &task.remote_path;
            let outcome = async {
                // A folder sent as a collection has replicas on its files only.
                let objects: Vec<RemotePath> = if task.uploads_collection() {
                    collection_objects(&task.local_path, path)
                        .await?
                        .into_iter()
                        .map(|(_, remote)| remote)
                        .collect()
                } else {
                    vec![path.clone()]
                };
                for object in &objects {
                    let replicas = self
                        .retry
                        .run("replica query", || self.session.list_replicas(object))
                        .await?;
                    if let Some(bad) = replicas.iter().find(|r| r.status != ReplicaStatus::Good) {
                        info!(label = %label, "Replica {} of {} is {}", bad.number, object, bad.status);
                        return Ok::<_, RemoteError>(false);
                    }
                }
                let meta = self
                    .retry
                    .run("metadata lookup", || self.session.get_metadata(path))
                    .await?;
                Ok(meta.get(ARCHIVE_STATUS_TAG).map(String::as_str) == Some(ARCHIVE_COMPLETED))
            }
            .await;

            match outcome {
                Ok(true) => {
                    ledger.transition(&label, TaskStatus::ArchivedRemote)?;
                    advanced += 1;
                }
                Ok(false) => {}
                Err(e) => record_failure(ledger, &label, "polling archival status", &e)?,
            }
        }
        Ok(advanced)
    }
}

/// Labels at `status` that exist on the remote as their own object.
fn remote_rows(ledger: &Ledger, status: TaskStatus) -> Vec<String> {
    ledger
        .tasks()
        .iter()
        .filter(|t| t.status == status && t.is_remote_tracked())
        .map(|t| t.label.clone())
        .collect()
}

fn record_failure(ledger: &mut Ledger, label: &str, what: &str, e: &RemoteError) -> Result<()> {
    error!(label, "Failed {}: {}", what, e);
    ledger.task_mut(label)?.note = Some(format!("{what}: {e}"));
    Ok(())
}

pub fn sync_parents(ledger: &mut Ledger) -> Result<()> {
    let parents: Vec<String> = ledger
        .tasks()
        .iter()
        .filter(|t| t.multi_volume)
        .map(|t| t.label.clone())
        .collect();
    for parent in parents {
        ledger.sync_parent(&parent)?;
    }
    Ok(())
}
