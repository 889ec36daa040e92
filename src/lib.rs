//! Resumable ingest of local files and folders into a content-managed
//! repository, with bounded scratch space for compression.

pub mod error;
pub mod ingest;
pub mod remote;
pub mod storage;
pub mod utils;

use std::sync::Arc;

pub use error::{IngestError, Result};
pub use ingest::{Coordinator, RunSummary, Task, TaskKind, TaskStatus};
pub use utils::Config;

use ingest::archiver::ZipArchiver;
use remote::LocalConnector;

/// Coordinator wired to the zip archiver and the directory-backed repository.
pub fn build_coordinator(config: Config) -> Coordinator {
    let connector = Arc::new(LocalConnector::new(config.repository.root.clone()));
    let archiver = Arc::new(ZipArchiver::new(&config.archiver));
    Coordinator::new(config, connector, archiver)
}
