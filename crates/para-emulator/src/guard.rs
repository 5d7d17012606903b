//! Process-wide safety interlock.
//!
//! An [`InstanceGuard`] holds an exclusive advisory lock on a lock file for
//! as long as the emulator runs, so two emulators cannot load the same
//! backend at once. [`spawn_signal_handler`] turns SIGINT/SIGTERM into a
//! cancellation every worker observes.

use chrono::Local;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("another emulator instance is already running (PID {pid}); remove {} to force start", .path.display())]
    AlreadyRunning { pid: String, path: PathBuf },
    #[error("lock file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Exclusive ownership of the lock file. Released on drop.
#[derive(Debug)]
pub struct InstanceGuard {
    file: Option<File>,
    path: PathBuf,
}

impl InstanceGuard {
    /// Take the lock or fail with the PID of the current holder.
    pub fn acquire(path: &Path, devices: usize) -> Result<Self, GuardError> {
        let io_err = |source: std::io::Error| GuardError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut file = loop {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .map_err(io_err)?;

            if file.try_lock_exclusive().is_err() {
                let mut contents = String::new();
                let _ = file.read_to_string(&mut contents);
                let pid = contents
                    .lines()
                    .next()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .unwrap_or("unknown")
                    .to_string();
                return Err(GuardError::AlreadyRunning {
                    pid,
                    path: path.to_path_buf(),
                });
            }

            if still_linked(&file, path) {
                break file;
            }
            // The previous holder unlinked this file while we were opening it.
            tracing::debug!("Lock file {} was replaced, retrying", path.display());
        };

        file.set_len(0).map_err(io_err)?;
        file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        write!(
            file,
            "{}\nStarted: {}\nDevices: {}\n",
            std::process::id(),
            Local::now().to_rfc3339(),
            devices
        )
        .map_err(io_err)?;
        file.flush().map_err(io_err)?;

        tracing::info!("Acquired instance lock {}", path.display());
        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file, then unlock it.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        // Unlink while still holding the lock, so nobody can lock the old
        // inode after we let go of it.
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove lock file {}: {}", self.path.display(), err);
        }
        if let Err(err) = FileExt::unlock(&file) {
            tracing::warn!("Failed to unlock {}: {}", self.path.display(), err);
        }
        drop(file);
        tracing::debug!("Released instance lock {}", self.path.display());
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Whether `file` is still the file at `path`.
#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> bool {
    path.exists()
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM.
pub fn spawn_signal_handler(shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = wait_for_signal() => {}
        }
        tracing::warn!("Received shutdown signal, stopping gracefully...");
        shutdown.cancel();
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(err) => {
            tracing::warn!("SIGTERM handler unavailable: {}", err);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
