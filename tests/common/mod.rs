#![allow(dead_code)]

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use walkdir::WalkDir;

use ingest_pipeline::ingest::archiver::{ArchiveError, Archiver};
use ingest_pipeline::ingest::DiskBudget;
use ingest_pipeline::remote::{
    Credentials, Metadata, RemoteConnector, RemoteError, RemotePath, RemoteSession, Replica,
    ReplicaStatus, RuleOutput, UploadOptions, ARCHIVE_COMPLETED, ARCHIVE_STATUS_TAG,
};
use ingest_pipeline::utils::config::RetryConfig;
use ingest_pipeline::utils::ByteSize;
use ingest_pipeline::{Config, Coordinator};

/// Repository kept entirely in memory; records every upload.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<RepoState>,
}

#[derive(Default)]
struct RepoState {
    collections: HashSet<String>,
    objects: HashMap<String, u64>,
    metadata: HashMap<String, Metadata>,
    uploads: Vec<String>,
}

impl MemoryRepository {
    pub fn uploads(&self) -> Vec<String> {
        self.state.lock().uploads.clone()
    }

    pub fn object_size(&self, path: &str) -> Option<u64> {
        self.state.lock().objects.get(path).copied()
    }

    pub fn metadata_of(&self, path: &str) -> Metadata {
        self.state.lock().metadata.get(path).cloned().unwrap_or_default()
    }

    fn add_collections(state: &mut RepoState, path: &RemotePath) {
        let mut current = path.parent();
        while let Some(p) = current {
            state.collections.insert(p.to_string());
            current = p.parent();
        }
    }

    fn exists(state: &RepoState, path: &RemotePath) -> bool {
        state.objects.contains_key(path.as_str()) || state.collections.contains(path.as_str())
    }
}

#[async_trait]
impl RemoteSession for MemoryRepository {
    async fn collection_exists(&self, path: &RemotePath) -> Result<bool, RemoteError> {
        Ok(self.state.lock().collections.contains(path.as_str()))
    }

    async fn create_collection(&self, path: &RemotePath) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        state.collections.insert(path.to_string());
        Self::add_collections(&mut state, path);
        Ok(())
    }

    async fn object_exists(&self, path: &RemotePath) -> Result<bool, RemoteError> {
        Ok(self.state.lock().objects.contains_key(path.as_str()))
    }

    async fn upload(
        &self,
        local: &Path,
        remote: &RemotePath,
        _options: UploadOptions,
    ) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        state.uploads.push(remote.to_string());
        if local.is_dir() {
            state.collections.insert(remote.to_string());
            Self::add_collections(&mut state, remote);
            for entry in WalkDir::new(local) {
                let entry = entry.map_err(std::io::Error::from)?;
                if entry.file_type().is_file() {
                    let rel = entry.path().strip_prefix(local).unwrap_or(entry.path());
                    let target = remote.join_relative(rel);
                    Self::add_collections(&mut state, &target);
                    state.objects.insert(target.to_string(), entry.metadata().map_err(std::io::Error::from)?.len());
                }
            }
        } else {
            let size = fs::metadata(local)?.len();
            Self::add_collections(&mut state, remote);
            state.objects.insert(remote.to_string(), size);
        }
        Ok(())
    }

    async fn list_replicas(&self, path: &RemotePath) -> Result<Vec<Replica>, RemoteError> {
        if !self.state.lock().objects.contains_key(path.as_str()) {
            return Err(RemoteError::NotFound(path.to_string()));
        }
        Ok(vec![Replica {
            number: 0,
            resource: "memory".into(),
            status: ReplicaStatus::Good,
        }])
    }

    async fn get_metadata(&self, path: &RemotePath) -> Result<Metadata, RemoteError> {
        let state = self.state.lock();
        if !Self::exists(&state, path) {
            return Err(RemoteError::NotFound(path.to_string()));
        }
        Ok(state.metadata.get(path.as_str()).cloned().unwrap_or_default())
    }

    async fn add_metadata_tag(&self, path: &RemotePath, key: &str, value: &str) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        if !Self::exists(&state, path) {
            return Err(RemoteError::NotFound(path.to_string()));
        }
        state
            .metadata
            .entry(path.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn run_archival_rule(&self, path: &RemotePath) -> Result<RuleOutput, RemoteError> {
        self.add_metadata_tag(path, ARCHIVE_STATUS_TAG, ARCHIVE_COMPLETED).await?;
        Ok(RuleOutput {
            stdout: format!("{path} will be tagged."),
            stderr: String::new(),
        })
    }
}

pub struct MemoryConnector(pub Arc<MemoryRepository>);

#[async_trait]
impl RemoteConnector for MemoryConnector {
    async fn connect(&self, _credentials: &Credentials) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        let session: Arc<dyn RemoteSession> = self.0.clone();
        Ok(session)
    }
}

/// Writes an archive as large as its source, so budget and cleanup paths
/// see real files. Records the free budget while it works.
#[derive(Default)]
pub struct FakeArchiver {
    pub budget: OnceCell<Arc<DiskBudget>>,
    pub observed_available: Mutex<Vec<u64>>,
    pub compress_calls: AtomicUsize,
    /// Raised once, by the next compression, as if the operator hit Ctrl-C.
    pub cancel_on_compress: Mutex<Option<Arc<AtomicBool>>>,
}

impl FakeArchiver {
    pub fn calls(&self) -> usize {
        self.compress_calls.load(Ordering::SeqCst)
    }

    fn observe(&self) {
        self.compress_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(budget) = self.budget.get() {
            self.observed_available.lock().push(budget.available());
        }
        if let Some(flag) = self.cancel_on_compress.lock().take() {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

fn source_size(source: &Path) -> u64 {
    WalkDir::new(source)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.metadata().map(|m| m.len()).unwrap_or(0))
        .sum()
}

#[async_trait]
impl Archiver for FakeArchiver {
    fn name(&self) -> &str {
        "fake"
    }

    fn extension(&self) -> &str {
        "zip"
    }

    fn supports_multi_volume(&self) -> bool {
        true
    }

    async fn compress(&self, source: &Path, archive: &Path) -> Result<(), ArchiveError> {
        self.observe();
        fs::write(archive, vec![0u8; source_size(source) as usize])?;
        Ok(())
    }

    async fn compress_multi_volume(
        &self,
        source: &Path,
        archive: &Path,
        volume_size: u64,
    ) -> Result<(), ArchiveError> {
        self.observe();
        let mut remaining = source_size(source);
        let mut n = 1;
        while remaining > volume_size {
            fs::write(archive.with_extension(format!("z{n:02}")), vec![0u8; volume_size as usize])?;
            remaining -= volume_size;
            n += 1;
        }
        fs::write(archive, vec![0u8; remaining as usize])?;
        Ok(())
    }

    async fn verify(&self, archive: &Path, _multi_volume: bool) -> Result<bool, ArchiveError> {
        Ok(archive.exists())
    }
}

/// Source, scratch and state directories plus the fakes wired together.
pub struct TestEnv {
    pub source: TempDir,
    pub scratch: TempDir,
    pub state: TempDir,
    pub repo: Arc<MemoryRepository>,
    pub archiver: Arc<FakeArchiver>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            source: TempDir::new().unwrap(),
            scratch: TempDir::new().unwrap(),
            state: TempDir::new().unwrap(),
            repo: Arc::new(MemoryRepository::default()),
            archiver: Arc::new(FakeArchiver::default()),
        }
    }

    pub fn config(&self) -> Config {
        Config {
            source_root: self.source.path().to_path_buf(),
            remote_root: "/zone/home/ingest".into(),
            scratch_dir: self.scratch.path().to_path_buf(),
            ledger_path: self.ledger_path(),
            manifest: self.state.path().join("manifest.json"),
            scratch_capacity: ByteSize(5000),
            archiver_workers: 2,
            transfer_workers: 2,
            reserve_poll_interval: Duration::from_millis(50),
            result_poll_timeout: Duration::from_millis(20),
            metadata_prefix: "NPEC_".into(),
            retry: RetryConfig {
                max_attempts: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            ..Config::default()
        }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state.path().join("in_progress.jsonl")
    }

    pub fn coordinator(&self, config: Config) -> Coordinator {
        let coordinator = Coordinator::new(
            config,
            Arc::new(MemoryConnector(self.repo.clone())),
            self.archiver.clone(),
        );
        let _ = self.archiver.budget.set(coordinator.budget());
        coordinator
    }

    pub fn write_file(&self, rel: &str, size: usize) -> PathBuf {
        let path = self.source.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, vec![1u8; size]).unwrap();
        path
    }

    pub fn write_manifest(&self, rows: serde_json::Value) {
        fs::write(
            self.state.path().join("manifest.json"),
            serde_json::to_vec_pretty(&rows).unwrap(),
        )
        .unwrap();
    }

    pub fn scratch_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(self.scratch.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        files
    }
}

pub fn row(name: &str) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "category": "Greenhouse",
        "system": "PhenoBox",
        "year": 2023,
        "crop": "maize",
        "plot": null,
    })
}
