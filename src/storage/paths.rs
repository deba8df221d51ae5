//! # Storage Paths
//!
//! Directory helpers for the data and archive directories.
//!
//! A log file is written as `<name>.tmp` and renamed to `<name>` once it is
//! complete, so any `.tmp` file found on storage is an interrupted write.

use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Suffix of files that are still being written
pub const TEMP_SUFFIX: &str = ".tmp";

/// Temporary path used while `target` is being written
///
/// # Examples
///
/// ```
/// use std::path::{Path, PathBuf};
/// use gnssr_logger::storage::paths::temp_path;
///
/// let tmp = temp_path(Path::new("/data/gnssr0_2024-03-01T0930.lz4"));
/// assert_eq!(tmp, PathBuf::from("/data/gnssr0_2024-03-01T0930.lz4.tmp"));
/// ```
pub fn temp_path(target: &Path) -> PathBuf {
    let mut name = OsString::from(target.as_os_str());
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Whether `path` names an unfinished file
pub fn is_temp(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().ends_with(TEMP_SUFFIX))
        .unwrap_or(false)
}

/// Create `dir` (and parents) when it does not exist yet
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        info!("Creating directory {}", dir.display());
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Flush directory metadata so a rename survives power loss
///
/// Best effort: some platforms cannot open directories for syncing.
pub fn sync_dir(dir: &Path) {
    match File::open(dir).and_then(|d| d.sync_all()) {
        Ok(()) => {}
        Err(e) => debug!("Could not sync directory {}: {}", dir.display(), e),
    }
}

/// Regular files in `dir` whose name ends with `suffix`, sorted by name
fn files_with_suffix(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if path
            .file_name()
            .map(|name| name.to_string_lossy().ends_with(suffix))
            .unwrap_or(false)
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Finished log files in `dir` with the given extension
///
/// Temporary files never match because they end in `.tmp`.
pub fn finished_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    files_with_suffix(dir, &format!(".{}", extension))
}

/// Interrupted writes left in `dir`
pub fn stale_temp_files(dir: &Path) -> Result<Vec<PathBuf>> {
    files_with_suffix(dir, TEMP_SUFFIX)
}

/// Report lingering temporary files and optionally delete them
///
/// # Returns
///
/// * `Result<usize>` - Number of stale files found
pub fn sweep_stale_temp_files(dir: &Path, discard: bool) -> Result<usize> {
    let stale = stale_temp_files(dir)?;
    for path in &stale {
        if discard {
            match fs::remove_file(path) {
                Ok(()) => info!("Discarded incomplete file {}", path.display()),
                Err(e) => warn!("Failed to discard {}: {}", path.display(), e),
            }
        } else {
            warn!("Incomplete file left from a previous run: {}", path.display());
        }
    }
    Ok(stale.len())
}
