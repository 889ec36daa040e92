use rayon::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use sysinfo::Disks;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::size::format_size;

/// Size of a file, or the recursive size of a folder's regular files.
/// Symlinks are never followed or counted.
pub fn measure_size(path: &Path) -> io::Result<u64> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }

    let start = Instant::now();
    let mut total = 0u64;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(io::Error::from)?.len();
        }
    }
    info!(
        "Computed size of {} ({}) in {:?}",
        path.display(),
        format_size(total),
        start.elapsed()
    );
    Ok(total)
}

/// Measures several paths in parallel, results in input order.
pub fn measure_all(paths: &[PathBuf]) -> Vec<io::Result<u64>> {
    paths.par_iter().map(|p| measure_size(p)).collect()
}

pub fn is_empty_dir(path: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

/// Regular files below `folder`, relative to it.
pub fn list_files(folder: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(folder).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            let relative = entry
                .path()
                .strip_prefix(folder)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            files.push(relative.to_path_buf());
        }
    }
    Ok(files)
}

/// Files sitting directly in the scratch directory, with their sizes.
pub fn scan_scratch(dir: &Path) -> io::Result<Vec<(PathBuf, u64)>> {
    let mut found = Vec::new();
    if !dir.exists() {
        return Ok(found);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_file() {
            found.push((entry.path(), meta.len()));
        }
    }
    found.sort();
    Ok(found)
}

/// Deletes the given files, returning how many bytes were freed.
/// Files that are already gone count as zero.
pub fn remove_files(paths: &[PathBuf]) -> io::Result<u64> {
    let mut freed = 0;
    for path in paths {
        match fs::metadata(path) {
            Ok(meta) => {
                fs::remove_file(path)?;
                freed += meta.len();
                debug!("Removed {}", path.display());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(freed)
}

/// Free space on the volume holding `path`, if it can be determined.
pub fn available_space(path: &Path) -> Option<u64> {
    let path = path.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Warns when the configured scratch budget is larger than the disk.
pub fn check_scratch_capacity(dir: &Path, capacity: u64) {
    match available_space(dir) {
        Some(free) if free < capacity => warn!(
            "Scratch capacity {} exceeds free space {} on {}",
            format_size(capacity),
            format_size(free),
            dir.display()
        ),
        Some(free) => debug!("Scratch volume has {} free", format_size(free)),
        None => debug!("Could not determine free space for {}", dir.display()),
    }
}
