//! Named semaphores shared by every process using the same data directory.
//!
//! Each name maps to `<dir>/<name>.sem`; holding the semaphore means holding an
//! exclusive advisory lock on that file. Locks are taken per open file
//! description, so two tasks of the same process exclude each other as well.

use crate::text::encode_bad_chars;
use fs2::FileExt;
use rand::Rng;
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::PathBuf,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SemaphoreError {
    #[error("Could not acquire the semaphore `{0}`")]
    Timeout(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct Semaphores {
    dir: PathBuf,
}

impl Semaphores {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        let safe = encode_bad_chars(name, '_', "");
        self.dir.join(format!("{}.sem", safe))
    }

    /// Wait up to `timeout` for the named semaphore.
    ///
    /// Polls the lock with random sleeps of up to a millisecond so waiting
    /// processes do not wake in lockstep.
    pub async fn acquire(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<SemaphoreGuard, SemaphoreError> {
        let dir = self.dir.clone();
        let path = self.path(name);
        let mut file = blocking(move || {
            fs::create_dir_all(&dir)?;
            OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
        })
        .await?;

        let started = Instant::now();
        loop {
            let (returned, attempt) = blocking(move || {
                let attempt = file.try_lock_exclusive();
                Ok((file, attempt))
            })
            .await?;
            file = returned;
            match attempt {
                Ok(()) => {
                    debug!("acquired semaphore {}", name);
                    return Ok(SemaphoreGuard {
                        file,
                        name: name.to_string(),
                    });
                }
                Err(err) if is_contended(&err) => {
                    if started.elapsed() >= timeout {
                        warn!("timeout waiting for semaphore {}", name);
                        return Err(SemaphoreError::Timeout(name.to_string()));
                    }
                    let pause = random_pause();
                    tokio::time::sleep(pause).await;
                }
                Err(err) => return Err(SemaphoreError::Io(err)),
            }
        }
    }
}

/// Releases the semaphore when dropped.
#[derive(Debug)]
pub struct SemaphoreGuard {
    file: File,
    name: String,
}

impl SemaphoreGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!("failed to release semaphore {}: {}", self.name, err);
        }
    }
}

/// A random sleep between 0 and 1000 microseconds.
pub fn random_pause() -> Duration {
    Duration::from_micros(rand::thread_rng().gen_range(0..=1000))
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

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
