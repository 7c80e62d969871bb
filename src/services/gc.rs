//! Removal of stale files from the cache, temp and upload directories.

use serde_json::{Value, json};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tracing::{debug, warn};

/// Files that survive every collection.
const KEEP: [&str; 1] = [".htaccess"];

fn collect_dir(dir: &Path, cutoff: SystemTime, deleted: &mut Vec<String>) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    for entry in entries {
        let entry = entry?;
        if KEEP.iter().any(|keep| entry.file_name() == *keep) {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() || metadata.modified()? >= cutoff {
            continue;
        }
        let path = entry.path();
        match fs::remove_file(&path) {
            Ok(()) => deleted.push(path.display().to_string()),
            Err(err) => warn!("could not remove {}: {}", path.display(), err),
        }
    }
    Ok(())
}

/// Delete regular files of `dirs`, hidden ones included, that were not
/// modified in the last `timeout` seconds.
pub async fn gc_exec(dirs: Vec<PathBuf>, timeout: i64) -> io::Result<Value> {
    let age = Duration::from_secs(u64::try_from(timeout).unwrap_or(0));
    tokio::task::spawn_blocking(move || {
        let cutoff = SystemTime::now()
            .checked_sub(age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut deleted = Vec::new();
        for dir in &dirs {
            collect_dir(dir, cutoff, &mut deleted)?;
        }
        debug!("gc removed {} files", deleted.len());
        Ok(json!({ "count": deleted.len(), "deleted": deleted }))
    })
    .await
    .map_err(io::Error::other)?
}
