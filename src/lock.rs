//! Cross-process bootstrap lock
//!
//! An exclusive marker file keyed by a hash of the daemon address. Only the
//! readiness sequence (probe, launch, scaffold) runs under it.
//!
//! The marker holds `<pid>:<seq>`, which identifies the guard that created
//! it. A guard only removes a marker still carrying its own token, and a
//! marker whose process is alive is never treated as stale.

use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Timing knobs for [`BootstrapLock::acquire`]
#[derive(Debug, Clone, Copy)]
pub struct LockTiming {
    /// Give up waiting and proceed after this long
    pub wait: Duration,
    /// Delay between attempts while contended
    pub poll: Duration,
    /// Markers older than this are treated as abandoned
    pub stale_after: Duration,
}

impl Default for LockTiming {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(5),
            poll: Duration::from_millis(100),
            stale_after: Duration::from_secs(30),
        }
    }
}

static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Held (or bypassed) bootstrap lock; releases on drop
#[derive(Debug)]
pub struct BootstrapLock {
    path: PathBuf,
    /// Marker content written by this guard; `None` when bypassed
    token: Option<String>,
}

impl BootstrapLock {
    /// Marker path for a daemon address inside `dir`
    pub fn path_for(dir: &Path, address: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(address.as_bytes()));
        dir.join(format!("devroute-{}.lock", &digest[..16]))
    }

    /// Acquire the lock, or proceed without it once `timing.wait` elapses
    pub async fn acquire(dir: &Path, address: &str, timing: LockTiming) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = Self::path_for(dir, address);
        let deadline = Instant::now() + timing.wait;
        let token = format!("{}:{}", std::process::id(), NEXT_SEQ.fetch_add(1, Ordering::Relaxed));

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", token)?;
                    debug!(path = %path.display(), token = %token, "Bootstrap lock acquired");
                    return Ok(Self {
                        path,
                        token: Some(token),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path, timing.stale_after) {
                        warn!(path = %path.display(), "Removing stale bootstrap lock");
                        match std::fs::remove_file(&path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == ErrorKind::NotFound => continue,
                            Err(e) => return Err(e),
                        }
                    }
                }
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                warn!(
                    path = %path.display(),
                    waited_ms = timing.wait.as_millis() as u64,
                    "Bootstrap lock still held, proceeding without it"
                );
                return Ok(Self { path, token: None });
            }

            tokio::time::sleep(timing.poll).await;
        }
    }

    /// False when acquisition timed out and the caller proceeded anyway
    pub fn held(&self) -> bool {
        self.token.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BootstrapLock {
    fn drop(&mut self) {
        let Some(token) = &self.token else {
            return;
        };
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim() == token => {}
            Ok(content) => {
                warn!(
                    path = %self.path.display(),
                    holder = %content.trim(),
                    "Bootstrap lock was taken over, leaving it in place"
                );
                return;
            }
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Failed to read bootstrap lock");
                }
                return;
            }
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to release bootstrap lock");
            }
        } else {
            debug!(path = %self.path.display(), "Bootstrap lock released");
        }
    }
}

/// Old enough and not held by a live process
fn is_stale(path: &Path, stale_after: Duration) -> bool {
    let old = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age > stale_after)
        .unwrap_or(false);
    if !old {
        return false;
    }

    let holder = std::fs::read_to_string(path)
        .ok()
        .and_then(|content| content.trim().split(':').next()?.parse::<u32>().ok());
    match holder {
        Some(pid) if process_alive(pid) => {
            debug!(path = %path.display(), pid, "Bootstrap lock is old but its holder is alive");
            false
        }
        _ => true,
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks for existence; EPERM still means it exists
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

/// Default directory for lock markers
pub fn default_lock_dir() -> PathBuf {
    dirs_next::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("devroute")
}
