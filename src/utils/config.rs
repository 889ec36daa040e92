use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::retry::RetryPolicy;
use super::size::ByteSize;
use crate::remote::Credentials;

/// Object size ceiling of the repository's storage backend (5 TiB).
pub const BACKEND_OBJECT_LIMIT: u64 = 5 << 40;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Folder that holds the files and folders named in the manifest
    pub source_root: PathBuf,

    /// Collection everything is ingested under
    pub remote_root: String,

    /// Scratch directory for archives
    pub scratch_dir: PathBuf,

    /// Bytes of scratch space archives may occupy at once
    pub scratch_capacity: ByteSize,

    /// Parallel archiver workers
    pub archiver_workers: usize,

    /// Parallel transfer workers, one repository session each
    pub transfer_workers: usize,

    /// Compress folders before upload
    pub compress_folders: bool,

    /// Trigger the archival rule after metadata is attached
    pub send_to_archive_tier: bool,

    /// Durable task ledger
    pub ledger_path: PathBuf,

    /// Manifest of rows to ingest, relative to `source_root` unless absolute
    pub manifest: PathBuf,

    /// Largest payload sent as a single object
    pub max_single_archive_bytes: ByteSize,

    /// Volume size when an archive has to be split
    pub volume_size: ByteSize,

    /// Split payloads above `max_single_archive_bytes` into volumes
    pub split_oversized: bool,

    /// Mark oversized payloads as skipped instead of stopping the run
    pub skip_oversized: bool,

    /// How long an archiver waits for scratch space before retrying
    #[serde(with = "duration_str")]
    pub reserve_poll_interval: Duration,

    /// Bounded wait on the result queues
    #[serde(with = "duration_str")]
    pub result_poll_timeout: Duration,

    /// Category -> remote prefix
    pub category_prefixes: BTreeMap<String, String>,

    /// Prepended to every metadata key on the remote
    pub metadata_prefix: String,

    pub repository: RepositoryConfig,

    pub archiver: ArchiverConfig,

    pub retry: RetryConfig,

    /// Optional JSON log file next to the console output
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Root directory of the local repository backend
    pub root: PathBuf,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiverConfig {
    pub zip_program: String,
    pub unzip_program: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "duration_str")]
    pub base_delay: Duration,
    #[serde(with = "duration_str")]
    pub max_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let category_prefixes = [("Greenhouse", "M5"), ("OpenField", "M6")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Self {
            source_root: PathBuf::from("."),
            remote_root: "/".to_string(),
            scratch_dir: std::env::temp_dir().join("ingest-scratch"),
            scratch_capacity: ByteSize(100 << 30),
            archiver_workers: (num_cpus::get() / 2).max(1), // Half the cores for compression
            transfer_workers: 4,
            compress_folders: true,
            send_to_archive_tier: false,
            ledger_path: PathBuf::from("in_progress.jsonl"),
            manifest: PathBuf::from("manifest.json"),
            max_single_archive_bytes: ByteSize(BACKEND_OBJECT_LIMIT),
            volume_size: ByteSize(4 << 30),
            split_oversized: true,
            skip_oversized: false,
            reserve_poll_interval: Duration::from_secs(300),
            result_poll_timeout: Duration::from_secs(10),
            category_prefixes,
            metadata_prefix: String::new(),
            repository: RepositoryConfig::default(),
            archiver: ArchiverConfig::default(),
            retry: RetryConfig::default(),
            log_file: None,
        }
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("repository"),
            user: std::env::var("USER").unwrap_or_else(|_| "ingest".to_string()),
            password: None,
        }
    }
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            zip_program: "zip".to_string(),
            unzip_program: "unzip".to_string(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
        }
    }
}

impl Config {
    /// Load config from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // A missing .env is fine
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);

        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
            }
            None => {
                if let Some(default) = default_config_file() {
                    builder = builder.add_source(config::File::from(default).required(false));
                }
            }
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("INGEST")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("failed to assemble configuration")?
            .try_deserialize()
            .context("invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.archiver_workers == 0 && self.compress_folders {
            bail!("archiver_workers must be at least 1 when compress_folders is set");
        }
        if self.transfer_workers == 0 {
            bail!("transfer_workers must be at least 1");
        }
        if self.volume_size.bytes() == 0 {
            bail!("volume_size must be positive");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.category_prefixes.is_empty() {
            bail!("category_prefixes must name at least one category");
        }
        Ok(())
    }

    pub fn manifest_path(&self) -> PathBuf {
        if self.manifest.is_absolute() {
            self.manifest.clone()
        } else {
            self.source_root.join(&self.manifest)
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            user: self.repository.user.clone(),
            password: self.repository.password.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            self.retry.base_delay,
            self.retry.max_delay,
        )
    }
}

fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("ingest").join("config.toml"))
        .filter(|path| path.exists())
}

/// Durations as humantime strings (`"5m"`, `"10s"`).
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}
