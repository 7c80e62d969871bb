//! Category log files under the logs directory.
//!
//! Every written line is prefixed with a `YYYY-MM-DD HH:MM:SS.ffff: `
//! timestamp. Reports are de-duplicated by the md5 of their text: the body is
//! written once, the `***** <hash> *****` marker on every occurrence.

use crate::{datetime::current_datetime_decimals, errors::ErrorReport};
use flate2::{Compression, write::GzEncoder};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// Log used by [`LogService::add_log`] when no file is named.
pub const DEFAULT_LOG: &str = "saltos.log";

#[derive(Debug, Clone)]
pub struct LogService {
    dir: PathBuf,
    max_file_size: u64,
}

impl LogService {
    pub fn new(dir: impl Into<PathBuf>, max_file_size: u64) -> Self {
        Self {
            dir: dir.into(),
            max_file_size,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append `msg` to `file`, rotating it first when it is too big.
    pub async fn add_log(&self, msg: impl Into<String>, file: &str) -> io::Result<()> {
        let this = self.clone();
        let msg = msg.into();
        let file = file.to_string();
        blocking(move || this.add_log_sync(&msg, &file)).await
    }

    /// True when `file` already contains `hash`.
    pub async fn check_log(&self, hash: &str, file: &str) -> io::Result<bool> {
        let path = self.path(file);
        let hash = hash.to_string();
        blocking(move || check_log_sync(&path, &hash)).await
    }

    /// Write `report` to `file`, skipping the body when it was logged before.
    /// Returns the report hash.
    pub async fn add_trace(&self, report: ErrorReport, file: &str) -> io::Result<String> {
        let this = self.clone();
        let file = file.to_string();
        blocking(move || this.add_trace_sync(&report, &file)).await
    }

    /// [`add_trace`](Self::add_trace) into the report's own category log.
    pub async fn file_report(&self, report: ErrorReport) -> io::Result<String> {
        let file = report.log_file();
        self.add_trace(report, &file).await
    }

    fn path(&self, file: &str) -> PathBuf {
        let file = if file.is_empty() { DEFAULT_LOG } else { file };
        self.dir.join(file)
    }

    fn add_trace_sync(&self, report: &ErrorReport, file: &str) -> io::Result<String> {
        let text = report.text();
        let hash = format!("{:x}", md5::compute(&text));
        if !check_log_sync(&self.path(file), &hash)? {
            self.add_log_sync(&text, file)?;
        }
        self.add_log_sync(&format!("***** {} *****", hash), file)?;
        Ok(hash)
    }

    fn add_log_sync(&self, msg: &str, file: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(file);
        let rotated = self.rotate_if_needed(&path)?;

        let prefix = current_datetime_decimals();
        let mut lines = msg
            .trim()
            .lines()
            .map(|line| format!("{}: {}", prefix, line))
            .collect::<Vec<_>>()
            .join("\n");
        lines.push('\n');
        let mut out = OpenOptions::new().create(true).append(true).open(&path)?;
        out.write_all(lines.as_bytes())?;

        if let Some((plain, gz)) = rotated {
            compress(&plain, &gz)?;
            fs::remove_file(&plain)?;
            info!("rotated log {} into {}", path.display(), gz.display());
        }
        Ok(())
    }

    /// Rename an oversized log to `<stem>.<n>.<ext>` with the first `n`
    /// whose `.gz` does not exist yet.
    fn rotate_if_needed(&self, path: &Path) -> io::Result<Option<(PathBuf, PathBuf)>> {
        if self.max_file_size == 0 {
            return Ok(None);
        }
        let size = match fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return Ok(None),
        };
        if size < self.max_file_size {
            return Ok(None);
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("log")
            .to_string();
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let mut next = 1;
        loop {
            let plain = self.dir.join(format!("{}.{}.{}", stem, next, ext));
            let gz = self.dir.join(format!("{}.{}.{}.gz", stem, next, ext));
            if !gz.exists() {
                debug!("rotating {} ({} bytes)", path.display(), size);
                fs::rename(path, &plain)?;
                return Ok(Some((plain, gz)));
            }
            next += 1;
        }
    }
}

fn check_log_sync(path: &Path, hash: &str) -> io::Result<bool> {
    match fs::read(path) {
        Ok(buffer) => Ok(String::from_utf8_lossy(&buffer).contains(hash)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

fn compress(input: &Path, output: &Path) -> io::Result<()> {
    let mut reader = File::open(input)?;
    let mut encoder = GzEncoder::new(File::create(output)?, Compression::fast());
    io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?.sync_all()
}

async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| io::Error::other(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Section;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[tokio::test]
    async fn lines_get_a_timestamp_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogService::new(dir.path(), 0);
        log.add_log("first\nsecond", "").await.unwrap();

        let content = fs::read_to_string(dir.path().join(DEFAULT_LOG)).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(": first"));
        // YYYY-MM-DD HH:MM:SS.ffff
        assert_eq!(lines[1].find(": second"), Some(24));
    }

    #[tokio::test]
    async fn repeated_reports_only_add_the_hash() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogService::new(dir.path(), 0);
        let report = ErrorReport::new(Section::DbError, "no such table: t").with_code("x:1");

        let first = log.file_report(report.clone()).await.unwrap();
        let second = log.file_report(report.clone()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, report.hash());

        let content = fs::read_to_string(dir.path().join("dberror.log")).unwrap();
        assert_eq!(content.matches("no such table: t").count(), 1);
        assert_eq!(content.matches(&format!("***** {} *****", first)).count(), 2);
        assert!(log.check_log(&first, "dberror.log").await.unwrap());
        assert!(!log.check_log(&first, "other.log").await.unwrap());
    }

    #[tokio::test]
    async fn oversized_logs_rotate_to_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogService::new(dir.path(), 10);
        fs::write(dir.path().join("app.log"), "0123456789abcdef\n").unwrap();
        fs::write(dir.path().join("app.1.log.gz"), b"taken").unwrap();

        log.add_log("fresh", "app.log").await.unwrap();

        let current = fs::read_to_string(dir.path().join("app.log")).unwrap();
        assert!(current.ends_with(": fresh\n"));
        assert!(!dir.path().join("app.2.log").exists());

        let mut unpacked = String::new();
        GzDecoder::new(File::open(dir.path().join("app.2.log.gz")).unwrap())
            .read_to_string(&mut unpacked)
            .unwrap();
        assert_eq!(unpacked, "0123456789abcdef\n");
    }
}
