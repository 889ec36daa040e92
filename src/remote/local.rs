use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{
    Credentials, Metadata, RemoteConnector, RemoteError, RemotePath, RemoteSession, Replica,
    ReplicaStatus, RuleOutput, UploadOptions, ARCHIVE_COMPLETED, ARCHIVE_STATUS_TAG,
};

/// Directory under the repository root that holds checksums and tags.
const CATALOG_DIR: &str = ".catalog";
const COPY_BUFFER: usize = 1 << 20;

/// Per-object bookkeeping kept beside the data.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ObjectRecord {
    checksum: Option<String>,
    #[serde(default)]
    metadata: Metadata,
}

/// Repository backed by a local (or mounted) directory tree.
///
/// Collections are directories and data objects are files. There is a
/// single replica per object; it is `good` while the registered blake3
/// checksum still matches the stored bytes.
#[derive(Debug, Clone)]
pub struct LocalRepository {
    root: PathBuf,
}

impl LocalRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn relative(path: &RemotePath) -> &str {
        path.as_str().trim_start_matches('/')
    }

    fn data_path(&self, path: &RemotePath) -> PathBuf {
        self.root.join(Self::relative(path))
    }

    fn record_path(&self, path: &RemotePath) -> PathBuf {
        let mut os = self.root.join(CATALOG_DIR).join(Self::relative(path)).into_os_string();
        os.push(".json");
        PathBuf::from(os)
    }

    fn read_record(&self, path: &RemotePath) -> Result<ObjectRecord, RemoteError> {
        match fs::read(self.record_path(path)) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ObjectRecord::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_record(&self, path: &RemotePath, record: &ObjectRecord) -> Result<(), RemoteError> {
        let target = self.record_path(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = target.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn ensure_exists(&self, path: &RemotePath) -> Result<PathBuf, RemoteError> {
        let data = self.data_path(path);
        if data.exists() {
            Ok(data)
        } else {
            Err(RemoteError::NotFound(path.to_string()))
        }
    }

    fn upload_file(
        &self,
        local: &Path,
        remote: &RemotePath,
        options: UploadOptions,
    ) -> Result<(), RemoteError> {
        let dest = self.data_path(remote);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = dest.clone().into_os_string();
        tmp.push(".ingest-partial");
        let tmp = PathBuf::from(tmp);
        let local_sum = copy_hashing(local, &tmp)?;
        fs::rename(&tmp, &dest)?;

        if options.verify {
            let remote_sum = hash_file(&dest)?;
            if remote_sum != local_sum {
                return Err(RemoteError::ChecksumMismatch {
                    path: remote.to_string(),
                    local: local_sum,
                    remote: remote_sum,
                });
            }
        }

        let mut record = self.read_record(remote)?;
        record.checksum = options.checksum.then_some(local_sum);
        self.write_record(remote, &record)?;
        debug!("Stored {} as {}", local.display(), remote);
        Ok(())
    }

    fn upload_blocking(
        &self,
        local: &Path,
        remote: &RemotePath,
        options: UploadOptions,
    ) -> Result<(), RemoteError> {
        if !local.is_dir() {
            return self.upload_file(local, remote, options);
        }
        fs::create_dir_all(self.data_path(remote))?;
        for entry in WalkDir::new(local).follow_links(false) {
            let entry = entry.map_err(io::Error::from)?;
            let relative = entry
                .path()
                .strip_prefix(local)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let target = remote.join_relative(relative);
            if entry.file_type().is_dir() {
                fs::create_dir_all(self.data_path(&target))?;
            } else if entry.file_type().is_file() {
                self.upload_file(entry.path(), &target, options)?;
            }
        }
        Ok(())
    }

    fn replicas_blocking(&self, path: &RemotePath) -> Result<Vec<Replica>, RemoteError> {
        let data = self.ensure_exists(path)?;
        let record = self.read_record(path)?;
        let status = match record.checksum {
            None => ReplicaStatus::Intermediate,
            Some(expected) if hash_file(&data)? == expected => ReplicaStatus::Good,
            Some(_) => ReplicaStatus::Stale,
        };
        Ok(vec![Replica {
            number: 0,
            resource: "local".to_string(),
            status,
        }])
    }
}

/// Runs a blocking repository call off the async workers.
async fn blocking<T, F>(repo: &LocalRepository, f: F) -> Result<T, RemoteError>
where
    T: Send + 'static,
    F: FnOnce(&LocalRepository) -> Result<T, RemoteError> + Send + 'static,
{
    let repo = repo.clone();
    tokio::task::spawn_blocking(move || f(&repo))
        .await
        .map_err(|e| RemoteError::Connection(format!("repository task failed: {e}")))?
}

#[async_trait]
impl RemoteSession for LocalRepository {
    async fn collection_exists(&self, path: &RemotePath) -> Result<bool, RemoteError> {
        Ok(tokio::fs::metadata(self.data_path(path))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false))
    }

    async fn create_collection(&self, path: &RemotePath) -> Result<(), RemoteError> {
        tokio::fs::create_dir_all(self.data_path(path)).await?;
        Ok(())
    }

    async fn object_exists(&self, path: &RemotePath) -> Result<bool, RemoteError> {
        Ok(tokio::fs::metadata(self.data_path(path))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false))
    }

    async fn upload(
        &self,
        local: &Path,
        remote: &RemotePath,
        options: UploadOptions,
    ) -> Result<(), RemoteError> {
        let local = local.to_path_buf();
        let remote = remote.clone();
        blocking(self, move |repo| repo.upload_blocking(&local, &remote, options)).await
    }

    async fn list_replicas(&self, path: &RemotePath) -> Result<Vec<Replica>, RemoteError> {
        let path = path.clone();
        blocking(self, move |repo| repo.replicas_blocking(&path)).await
    }

    async fn get_metadata(&self, path: &RemotePath) -> Result<Metadata, RemoteError> {
        self.ensure_exists(path)?;
        Ok(self.read_record(path)?.metadata)
    }

    async fn add_metadata_tag(
        &self,
        path: &RemotePath,
        key: &str,
        value: &str,
    ) -> Result<(), RemoteError> {
        self.ensure_exists(path)?;
        let mut record = self.read_record(path)?;
        record.metadata.insert(key.to_string(), value.to_string());
        self.write_record(path, &record)
    }

    async fn run_archival_rule(&self, path: &RemotePath) -> Result<RuleOutput, RemoteError> {
        self.ensure_exists(path)?;
        // No archive tier behind a plain directory: the object is archived
        // as soon as it is tagged.
        self.add_metadata_tag(path, ARCHIVE_STATUS_TAG, ARCHIVE_COMPLETED)
            .await?;
        Ok(RuleOutput {
            stdout: format!("{path} will be tagged.\n"),
            stderr: String::new(),
        })
    }
}

/// Hands out sessions on a [`LocalRepository`] rooted at a directory.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    root: PathBuf,
}

impl LocalConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl RemoteConnector for LocalConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        if credentials.user.trim().is_empty() {
            return Err(RemoteError::Authentication {
                user: credentials.user.clone(),
            });
        }
        if !tokio::fs::metadata(&self.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(RemoteError::Connection(format!(
                "repository root {} is not reachable",
                self.root.display()
            )));
        }
        info!("Connected to local repository at {} as {}", self.root.display(), credentials.user);
        Ok(Arc::new(LocalRepository::new(self.root.clone())))
    }
}

fn copy_hashing(from: &Path, to: &Path) -> io::Result<String> {
    let mut reader = fs::File::open(from)?;
    let mut writer = fs::File::create(to)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
    }
    writer.sync_all()?;
    Ok(hasher.finalize().to_hex().to_string())
}

fn hash_file(path: &Path) -> io::Result<String> {
    let mut reader = fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}
