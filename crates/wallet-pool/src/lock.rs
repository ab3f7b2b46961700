use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, PidExt, System, SystemExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{PoolError, Result};

/// Contents of a held lock: who holds it and since when (unix millis).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockOwner {
    pub pid: u32,
    pub acquired_at: u64,
}

/// Proof of acquisition handed back on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockToken {
    owner: LockOwner,
}

impl LockToken {
    pub fn owner(&self) -> LockOwner {
        self.owner
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockConfig {
    /// Age after which a lock is reclaimable even if its holder is alive.
    pub stale_after_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Total wait before giving up with [`PoolError::LockTimeout`].
    pub max_wait_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: 30_000,
            initial_backoff_ms: 50,
            max_backoff_ms: 500,
            max_wait_ms: 5_000,
        }
    }
}

impl LockConfig {
    fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        (current * 2).min(Duration::from_millis(self.max_backoff_ms))
    }
}

/// Mutual exclusion around pool read-modify-write cycles.
#[async_trait]
pub trait PoolLock: Send + Sync {
    async fn acquire(&self) -> Result<LockToken>;

    /// Release a lock taken with `acquire`. Must be called on every exit path.
    async fn release(&self, token: LockToken) -> Result<()>;

    /// Whether the current holder (if any) may be evicted.
    async fn is_stale(&self) -> Result<bool>;
}

/// Answers whether an OS process is still running.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessProbe;

impl ProcessProbe for SystemProcessProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let mut system = System::new();
        system.refresh_process(Pid::from_u32(pid))
    }
}

/// Advisory lock backed by exclusive creation of a file.
pub struct FileLock {
    path: PathBuf,
    config: LockConfig,
    probe: Arc<dyn ProcessProbe>,
    pid: u32,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>, config: LockConfig) -> Self {
        Self::with_probe(path, config, Arc::new(SystemProcessProbe))
    }

    pub fn with_probe(path: impl Into<PathBuf>, config: LockConfig, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            path: path.into(),
            config,
            probe,
            pid: std::process::id(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_create(&self) -> std::io::Result<LockToken> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().write(true).create_new(true).open(&self.path)?;
        let owner = LockOwner {
            pid: self.pid,
            acquired_at: now_millis(),
        };
        let body = serde_json::to_vec(&owner)?;
        file.write_all(&body)?;
        file.sync_all()?;
        Ok(LockToken { owner })
    }

    fn read_owner(&self) -> Result<Option<LockOwner>> {
        read_owner_at(&self.path)
    }

    fn file_age(&self) -> Option<Duration> {
        fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
    }

    fn judge(&self, owner: Option<LockOwner>) -> bool {
        let stale_after = Duration::from_millis(self.config.stale_after_ms);
        match owner {
            Some(owner) => {
                if !self.probe.is_alive(owner.pid) {
                    return true;
                }
                now_millis().saturating_sub(owner.acquired_at) >= self.config.stale_after_ms
            }
            // Unreadable contents: a writer may be mid-create, so only age counts.
            None => self.file_age().is_some_and(|age| age >= stale_after),
        }
    }

    /// Move the lock file aside, then discard it only if it still holds what
    /// was judged stale. A fresh lock taken in the meantime is put back.
    fn reclaim(&self, judged: Option<LockOwner>) -> Result<()> {
        let tombstone = self.tombstone_path();
        match fs::rename(&self.path, &tombstone) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        let taken = read_owner_at(&tombstone);
        if matches!(taken, Ok(owner) if owner == judged) {
            fs::remove_file(&tombstone)?;
            return Ok(());
        }

        // hard_link fails instead of replacing a lock created since the rename.
        let restored = fs::hard_link(&tombstone, &self.path);
        fs::remove_file(&tombstone)?;
        match restored {
            Ok(()) => {
                debug!(path = %self.path.display(), "lock changed hands before reclaim; restored");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                warn!(path = %self.path.display(), "could not restore a lock taken during reclaim");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn tombstone_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "pool.lock".to_string());
        self.path
            .with_file_name(format!("{name}.reclaim-{}", Uuid::new_v4().simple()))
    }
}

#[async_trait]
impl PoolLock for FileLock {
    async fn acquire(&self) -> Result<LockToken> {
        let started = Instant::now();
        let mut backoff = Duration::from_millis(self.config.initial_backoff_ms.max(1));

        loop {
            match self.try_create() {
                Ok(token) => {
                    debug!(path = %self.path.display(), "pool lock acquired");
                    return Ok(token);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err.into()),
            }

            if !self.path.exists() {
                continue;
            }
            let holder = self.read_owner()?;
            if self.judge(holder) {
                warn!(path = %self.path.display(), ?holder, "reclaiming stale pool lock");
                self.reclaim(holder)?;
                continue;
            }

            let waited = started.elapsed();
            if waited >= self.config.max_wait() {
                return Err(PoolError::LockTimeout {
                    path: self.path.clone(),
                    waited,
                });
            }
            tokio::time::sleep(backoff.min(self.config.max_wait() - waited)).await;
            backoff = self.config.next_backoff(backoff);
        }
    }

    async fn release(&self, token: LockToken) -> Result<()> {
        match self.read_owner()? {
            Some(owner) if owner == token.owner => {
                fs::remove_file(&self.path)?;
                debug!(path = %self.path.display(), "pool lock released");
            }
            other => warn!(
                path = %self.path.display(),
                holder = ?other,
                "pool lock no longer held by this process; leaving it"
            ),
        }
        Ok(())
    }

    async fn is_stale(&self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        let holder = self.read_owner()?;
        Ok(self.judge(holder))
    }
}

/// In-process lock with the same contract, for tests and single-process use.
pub struct MemoryLock {
    held: Mutex<Option<LockOwner>>,
    config: LockConfig,
}

impl MemoryLock {
    pub fn new(config: LockConfig) -> Self {
        Self {
            held: Mutex::new(None),
            config,
        }
    }
}

impl Default for MemoryLock {
    fn default() -> Self {
        Self::new(LockConfig::default())
    }
}

#[async_trait]
impl PoolLock for MemoryLock {
    async fn acquire(&self) -> Result<LockToken> {
        let started = Instant::now();
        let mut backoff = Duration::from_millis(self.config.initial_backoff_ms.max(1));
        loop {
            {
                let mut held = self.held.lock().await;
                if held.is_none() {
                    let owner = LockOwner {
                        pid: std::process::id(),
                        acquired_at: now_millis(),
                    };
                    *held = Some(owner);
                    return Ok(LockToken { owner });
                }
            }
            let waited = started.elapsed();
            if waited >= self.config.max_wait() {
                return Err(PoolError::LockTimeout {
                    path: PathBuf::from("memory"),
                    waited,
                });
            }
            tokio::time::sleep(backoff.min(self.config.max_wait() - waited)).await;
            backoff = self.config.next_backoff(backoff);
        }
    }

    async fn release(&self, token: LockToken) -> Result<()> {
        let mut held = self.held.lock().await;
        if *held == Some(token.owner) {
            *held = None;
        }
        Ok(())
    }

    async fn is_stale(&self) -> Result<bool> {
        Ok(false)
    }
}

fn read_owner_at(path: &Path) -> Result<Option<LockOwner>> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
