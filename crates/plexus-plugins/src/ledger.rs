//! Pid-file ledger: one JSON file per plugin recording the pid and port of
//! a live process, so a restarted host can reconnect instead of spawning a
//! duplicate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub pid: u32,
    pub port: u16,
}

pub trait Ledger: Send + Sync {
    fn read(&self, name: &str) -> Option<LedgerEntry>;
    fn write(&self, name: &str, entry: LedgerEntry) -> std::io::Result<()>;
    fn remove(&self, name: &str);
    fn is_alive(&self, pid: u32) -> bool;
    /// Drop entries whose pid is gone. Returns how many were dropped.
    fn cleanup_all(&self) -> usize;
    /// Terminate every recorded live pid and drop all entries. Returns how
    /// many processes were signalled.
    fn shutdown_all(&self) -> usize;
}

pub struct PidFileLedger {
    dir: PathBuf,
}

const SUFFIX: &str = ".pid.json";

impl PidFileLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}{SUFFIX}"))
    }

    fn entries(&self) -> Vec<(String, Option<LedgerEntry>)> {
        let Ok(read_dir) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        read_dir
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let file_name = e.file_name().to_string_lossy().into_owned();
                let name = file_name.strip_suffix(SUFFIX)?.to_string();
                let entry = std::fs::read_to_string(e.path())
                    .ok()
                    .and_then(|s| serde_json::from_str(&s).ok());
                Some((name, entry))
            })
            .collect()
    }
}

impl Ledger for PidFileLedger {
    fn read(&self, name: &str) -> Option<LedgerEntry> {
        let path = self.path_for(name);
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(plugin = name, error = %e, "discarding unreadable pid file");
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    fn write(&self, name: &str, entry: LedgerEntry) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(name);
        let tmp = path.with_extension("tmp");
        let body = serde_json::to_vec(&entry).map_err(std::io::Error::other)?;
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &path)
    }

    fn remove(&self, name: &str) {
        match std::fs::remove_file(self.path_for(name)) {
            Ok(()) => debug!(plugin = name, "pid file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(plugin = name, error = %e, "failed to remove pid file"),
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        pid_alive(pid)
    }

    fn cleanup_all(&self) -> usize {
        let mut dropped = 0;
        for (name, entry) in self.entries() {
            let alive = entry.is_some_and(|e| pid_alive(e.pid));
            if !alive {
                self.remove(&name);
                dropped += 1;
            }
        }
        dropped
    }

    fn shutdown_all(&self) -> usize {
        let mut signalled = 0;
        for (name, entry) in self.entries() {
            if let Some(entry) = entry {
                if pid_alive(entry.pid) && send_signal(entry.pid, libc::SIGTERM) {
                    signalled += 1;
                }
            }
            self.remove(&name);
        }
        signalled
    }
}

/// Signal-0 liveness check. EPERM still means the process exists.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill with signal 0 performs only the existence/permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Send `signal` to `pid`; false if the pid is invalid or the call failed.
pub fn send_signal(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: pid is a positive single-process target; no memory is shared.
    unsafe { libc::kill(pid, signal) == 0 }
}

/// SIGTERM, wait up to `grace` for the pid to disappear, then SIGKILL.
pub async fn terminate_pid(pid: u32, grace: Duration) {
    if !pid_alive(pid) {
        return;
    }
    send_signal(pid, libc::SIGTERM);
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    warn!(pid, "process ignored SIGTERM, killing");
    send_signal(pid, libc::SIGKILL);
}
