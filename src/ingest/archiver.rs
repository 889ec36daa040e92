use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::utils::config::ArchiverConfig;
use crate::utils::disk;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("no archive was produced at {0}")]
    Missing(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// External compressor driven by the archiver workers.
#[async_trait]
pub trait Archiver: Send + Sync {
    fn name(&self) -> &str;

    /// File extension of the archives, without the dot.
    fn extension(&self) -> &str;

    fn supports_multi_volume(&self) -> bool;

    async fn compress(&self, source: &Path, archive: &Path) -> Result<(), ArchiveError>;

    /// Writes numbered volumes of at most `volume_size` bytes next to
    /// `archive`; the last volume carries the archive's own name.
    async fn compress_multi_volume(
        &self,
        source: &Path,
        archive: &Path,
        volume_size: u64,
    ) -> Result<(), ArchiveError>;

    async fn verify(&self, archive: &Path, multi_volume: bool) -> Result<bool, ArchiveError>;
}

/// Every file of the archive at `archive`: split volumes (`.z01`, `.z02`,
/// ...) in order, then the archive itself.
pub fn list_volumes(archive: &Path) -> io::Result<Vec<PathBuf>> {
    let Some(stem) = archive.file_stem() else {
        return Ok(Vec::new());
    };
    let dir = match archive.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut volumes: Vec<(u32, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.file_stem() != Some(stem) || !path.is_file() {
            continue;
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if let Some(n) = volume_number(ext) {
            volumes.push((n, path));
        } else if path == archive {
            volumes.push((u32::MAX, path));
        }
    }
    volumes.sort();
    Ok(volumes.into_iter().map(|(_, p)| p).collect())
}

fn volume_number(ext: &str) -> Option<u32> {
    let digits = ext.strip_prefix('z')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Deletes an archive and all of its volumes, returning the bytes freed.
pub fn remove_archive_files(archive: &Path) -> io::Result<u64> {
    disk::remove_files(&list_volumes(archive)?)
}

/// Drives the `zip`/`unzip` command line tools.
#[derive(Debug, Clone)]
pub struct ZipArchiver {
    zip: String,
    unzip: String,
}

impl ZipArchiver {
    pub fn new(config: &ArchiverConfig) -> Self {
        Self {
            zip: config.zip_program.clone(),
            unzip: config.unzip_program.clone(),
        }
    }

    /// First line of `zip -v`, to fail early when the tool is missing.
    pub async fn check_archiver(&self) -> Result<String, ArchiveError> {
        let output = self.run(Command::new(&self.zip).arg("-v"), &self.zip).await?;
        let version = String::from_utf8_lossy(&output.stdout);
        Ok(version
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("unknown")
            .to_string())
    }

    fn compress_command(&self, source: &Path, archive: &Path, volume_size: Option<u64>) -> io::Result<Command> {
        let archive = absolute(archive)?;
        let mut cmd = Command::new(&self.zip);
        if let Some(size) = volume_size {
            cmd.arg("-s").arg(split_size_arg(size));
        }
        if source.is_dir() {
            // Store paths relative to the folder itself, keep symlinks as links.
            cmd.args(["-r", "-q", "-y"]).arg(&archive).arg(".").current_dir(source);
        } else {
            cmd.args(["-q", "-j"]).arg(&archive).arg(source);
        }
        Ok(cmd)
    }

    async fn run(&self, cmd: &mut Command, program: &str) -> Result<Output, ArchiveError> {
        let output = cmd.output().await.map_err(|source| ArchiveError::Spawn {
            program: program.to_string(),
            source,
        })?;
        if !output.status.success() {
            return Err(ArchiveError::Failed {
                program: program.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    async fn compress_inner(
        &self,
        source: &Path,
        archive: &Path,
        volume_size: Option<u64>,
    ) -> Result<(), ArchiveError> {
        // zip updates existing archives in place; always start clean.
        remove_archive_files(archive)?;
        if let Some(parent) = archive.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut cmd = self.compress_command(source, archive, volume_size)?;
        debug!("Compressing {} into {}", source.display(), archive.display());
        self.run(&mut cmd, &self.zip).await?;
        if !archive.exists() {
            return Err(ArchiveError::Missing(archive.to_path_buf()));
        }
        Ok(())
    }
}

#[async_trait]
impl Archiver for ZipArchiver {
    fn name(&self) -> &str {
        "zip"
    }

    fn extension(&self) -> &str {
        "zip"
    }

    fn supports_multi_volume(&self) -> bool {
        true
    }

    async fn compress(&self, source: &Path, archive: &Path) -> Result<(), ArchiveError> {
        self.compress_inner(source, archive, None).await
    }

    async fn compress_multi_volume(
        &self,
        source: &Path,
        archive: &Path,
        volume_size: u64,
    ) -> Result<(), ArchiveError> {
        self.compress_inner(source, archive, Some(volume_size)).await
    }

    async fn verify(&self, archive: &Path, multi_volume: bool) -> Result<bool, ArchiveError> {
        if !multi_volume {
            return self.test_archive(archive).await;
        }

        // Neither unzip nor zip -T read a split set; join it into one
        // archive next to the volumes and test that.
        let joined = joined_path(archive);
        let _ = fs::remove_file(&joined);
        let output = Command::new(&self.zip)
            .args(["-q", "-s", "0"])
            .arg(archive)
            .arg("--out")
            .arg(&joined)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ArchiveError::Spawn {
                program: self.zip.clone(),
                source,
            })?;
        let ok = if output.status.success() {
            self.test_archive(&joined).await
        } else {
            debug!(
                "{} could not join the volumes of {}: {}",
                self.zip,
                archive.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            Ok(false)
        };
        if let Err(e) = fs::remove_file(&joined) {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        ok
    }
}

impl ZipArchiver {
    async fn test_archive(&self, archive: &Path) -> Result<bool, ArchiveError> {
        let output = Command::new(&self.unzip)
            .arg("-tqq")
            .arg(archive)
            .output()
            .await
            .map_err(|source| ArchiveError::Spawn {
                program: self.unzip.clone(),
                source,
            })?;
        if !output.status.success() {
            debug!(
                "{} reported a damaged archive {}: {}",
                self.unzip,
                archive.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.status.success())
    }
}

/// Where a split set is joined for testing: `run.zip` -> `run.joined.zip`.
/// The different stem keeps it out of [`list_volumes`].
fn joined_path(archive: &Path) -> PathBuf {
    let stem = archive
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    archive.with_file_name(format!("{stem}.joined.zip"))
}

/// `zip -s` value in whole megabytes, at least one.
fn split_size_arg(volume_size: u64) -> String {
    format!("{}m", (volume_size >> 20).max(1))
}

fn absolute(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
