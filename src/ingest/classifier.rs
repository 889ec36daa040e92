use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use super::{Task, TaskKind, TaskStatus};
use crate::error::{IngestError, Result};
use crate::remote::{RemotePath, RemoteSession};
use crate::storage::Ledger;
use crate::utils::{disk, Config, RetryPolicy};

static METADATA_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("metadata key pattern is valid"));

/// SQL words the repository's catalog refuses as attribute names.
static RESERVED_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "ADD", "ALL", "ALTER", "AND", "ANY", "AS", "ASC", "BETWEEN", "BY", "CASE", "CHECK",
        "COLUMN", "COMMIT", "CONSTRAINT", "CREATE", "DATABASE", "DEFAULT", "DELETE", "DESC",
        "DISTINCT", "DROP", "ELSE", "END", "EXISTS", "FOREIGN", "FROM", "GRANT", "GROUP",
        "HAVING", "IN", "INDEX", "INNER", "INSERT", "INTO", "IS", "JOIN", "KEY", "LEFT", "LIKE",
        "LIMIT", "NOT", "NULL", "ON", "OR", "ORDER", "OUTER", "PRIMARY", "PROCEDURE",
        "REFERENCES", "REVOKE", "RIGHT", "ROLLBACK", "SELECT", "SET", "TABLE", "THEN", "TO",
        "TRIGGER", "TRUNCATE", "UNION", "UNIQUE", "UPDATE", "USER", "VALUES", "VIEW", "WHEN",
        "WHERE", "WITH",
    ]
    .into_iter()
    .collect()
});

fn allowed_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/')
}

/// One manifest row. Columns other than the named ones become metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestRow {
    pub name: String,
    pub category: String,
    pub system: String,
    #[serde(deserialize_with = "text_or_number")]
    pub year: String,
    #[serde(default = "selected_by_default")]
    pub selected: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn selected_by_default() -> bool {
    true
}

fn text_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}

impl ManifestRow {
    /// Every column becomes a tag, the path-forming ones included.
    pub fn metadata(&self) -> BTreeMap<String, Option<String>> {
        let mut metadata: BTreeMap<String, Option<String>> = self
            .extra
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::Null => None,
                    serde_json::Value::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                };
                (key.clone(), value)
            })
            .collect();
        for (key, value) in [
            ("name", &self.name),
            ("category", &self.category),
            ("system", &self.system),
            ("year", &self.year),
        ] {
            metadata.insert(key.to_string(), Some(value.clone()));
        }
        metadata
    }
}

pub fn load_manifest(path: &Path) -> Result<Vec<ManifestRow>> {
    let raw = std::fs::read(path)?;
    let rows: Vec<ManifestRow> =
        serde_json::from_slice(&raw).map_err(|e| IngestError::Validation {
            label: path.display().to_string(),
            reason: format!("manifest is not valid: {e}"),
        })?;
    info!("Manifest {} lists {} rows", path.display(), rows.len());
    Ok(rows)
}

pub fn validate_remote_path(label: &str, path: &RemotePath) -> Result<()> {
    if let Some(bad) = path.as_str().chars().find(|&c| !allowed_path_char(c)) {
        return Err(IngestError::Validation {
            label: label.to_string(),
            reason: format!("remote path {path} contains disallowed character '{bad}'"),
        });
    }
    Ok(())
}

pub fn validate_metadata_key(label: &str, key: &str) -> Result<()> {
    if !METADATA_KEY_RE.is_match(key) {
        return Err(IngestError::Validation {
            label: label.to_string(),
            reason: format!("metadata key '{key}' is not a valid identifier"),
        });
    }
    if RESERVED_WORDS.contains(key.to_ascii_uppercase().as_str()) {
        return Err(IngestError::Validation {
            label: label.to_string(),
            reason: format!("metadata key '{key}' is a reserved word"),
        });
    }
    Ok(())
}

/// Turns manifest rows into tasks with local and remote paths.
#[derive(Debug, Clone)]
pub struct Classifier {
    source_root: PathBuf,
    scratch_dir: PathBuf,
    remote_root: RemotePath,
    prefixes: BTreeMap<String, String>,
    compress_folders: bool,
    extension: String,
}

impl Classifier {
    pub fn new(config: &Config, archive_extension: &str) -> Self {
        Self {
            source_root: config.source_root.clone(),
            scratch_dir: config.scratch_dir.clone(),
            remote_root: RemotePath::new(config.remote_root.clone()),
            prefixes: config.category_prefixes.clone(),
            compress_folders: config.compress_folders,
            extension: archive_extension.to_string(),
        }
    }

    /// `{root}/{prefix}/{system}/{year}/{name}`, with the archive extension
    /// appended for folders that get compressed.
    pub fn remote_path(&self, row: &ManifestRow, kind: TaskKind) -> Result<RemotePath> {
        let prefix = self
            .prefixes
            .get(&row.category)
            .ok_or_else(|| IngestError::Validation {
                label: row.name.clone(),
                reason: format!("unknown category '{}'", row.category),
            })?;
        let collection = self.remote_root.join(prefix).join(&row.system).join(&row.year);
        let path = match kind {
            TaskKind::Folder if self.compress_folders => {
                collection.join(format!("{}.{}", row.name, self.extension))
            }
            _ => collection.join(&row.name),
        };
        validate_remote_path(&row.name, &path)?;
        Ok(path)
    }

    /// Inspects the local path and builds the task for one row.
    pub fn classify(&self, row: &ManifestRow) -> Result<Task> {
        let local_path = self.source_root.join(&row.name);
        let kind = if local_path.is_dir() {
            if disk::is_empty_dir(&local_path)? {
                TaskKind::EmptyFolder
            } else {
                TaskKind::Folder
            }
        } else if local_path.is_file() {
            TaskKind::File
        } else {
            return Err(IngestError::MissingPayload {
                label: row.name.clone(),
                path: local_path,
            });
        };

        let remote_path = self.remote_path(row, kind)?;
        let metadata = row.metadata();
        for key in metadata.keys() {
            validate_metadata_key(&row.name, key)?;
        }

        let mut task = Task::new(&row.name, local_path, remote_path, kind);
        task.metadata = metadata;
        if kind == TaskKind::Folder && self.compress_folders {
            task.archive_path = Some(self.archive_path(&row.name));
        }
        if kind == TaskKind::EmptyFolder {
            task.status = TaskStatus::SkippedEmpty;
        }
        debug!(label = %task.label, kind = %kind, "Classified as {}", task.remote_path);
        Ok(task)
    }

    pub fn archive_path(&self, name: &str) -> PathBuf {
        self.scratch_dir.join(format!("{name}.{}", self.extension))
    }

    /// Builds a fresh ledger from the selected manifest rows.
    ///
    /// A row that fails validation is recorded as `invalid`, the ledger is
    /// persisted, and the error is returned.
    pub fn build_ledger(&self, rows: &[ManifestRow], ledger_path: &Path) -> Result<Ledger> {
        let mut ledger = Ledger::new(ledger_path);
        for row in rows.iter().filter(|r| r.selected) {
            if let Some(first) = ledger.get_mut(&row.name) {
                let e = IngestError::Validation {
                    label: row.name.clone(),
                    reason: format!(
                        "listed more than once in the manifest ({} and {}/{}/{})",
                        first.remote_path, row.category, row.system, row.year
                    ),
                };
                error!("Invalid manifest row {}: {}", row.name, e);
                first.status = TaskStatus::Invalid;
                first.note = Some(e.to_string());
                ledger.persist()?;
                return Err(e);
            }
            match self.classify(row) {
                Ok(task) => ledger.push(task)?,
                Err(e @ IngestError::Validation { .. }) => {
                    error!("Invalid manifest row {}: {}", row.name, e);
                    let mut task = Task::new(
                        &row.name,
                        self.source_root.join(&row.name),
                        self.remote_root.join(&row.name),
                        TaskKind::File,
                    );
                    task.status = TaskStatus::Invalid;
                    task.note = Some(e.to_string());
                    ledger.push(task)?;
                    ledger.persist()?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
        ledger.persist()?;
        info!("Created ledger {} with {} tasks", ledger_path.display(), ledger.len());
        Ok(ledger)
    }

    /// Marks pending tasks whose target already exists as `skipped_exists`.
    pub async fn mark_existing(
        &self,
        session: &dyn RemoteSession,
        ledger: &mut Ledger,
        retry: &RetryPolicy,
    ) -> Result<usize> {
        let mut skipped = 0;
        for label in ledger.labels_with_status(TaskStatus::Pending) {
            let task = ledger.task(&label)?;
            let remote = task.remote_path.clone();
            let exists = if task.uploads_collection() {
                retry
                    .run("collection lookup", || session.collection_exists(&remote))
                    .await?
            } else {
                retry
                    .run("object lookup", || session.object_exists(&remote))
                    .await?
            };
            if exists {
                info!(label = %label, "{} already present remotely", remote);
                ledger.transition(&label, TaskStatus::SkippedExists)?;
                skipped += 1;
            }
        }
        if skipped > 0 {
            ledger.persist()?;
        }
        Ok(skipped)
    }
}
