//! Advisory locks on a remote, so two runs never prune or write the same
//! VM directory at once.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, VmrepError};
use crate::storage::StorageBackend;

/// Locks older than this belong to a crashed run and are broken.
const STALE_AFTER_HOURS: i64 = 6;

/// Content of `<scope>/locks/<micros>-<nonce>.json`.
#[derive(Debug, Serialize, Deserialize)]
struct LockOwner {
    host: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

impl LockOwner {
    fn current() -> Self {
        Self {
            host: hostname(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }

    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.acquired_at > Duration::hours(STALE_AFTER_HOURS)
    }
}

#[derive(Debug)]
pub struct LockGuard {
    key: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

fn hostname() -> String {
    #[cfg(unix)]
    let host = nix::unistd::gethostname()
        .ok()
        .map(|name| name.to_string_lossy().into_owned());
    #[cfg(not(unix))]
    let host = std::env::var("COMPUTERNAME").ok();
    host.unwrap_or_else(|| "unknown".into())
}

fn lock_dir(scope: &str) -> String {
    match scope.trim_end_matches('/') {
        "" => "locks/".to_string(),
        scope => format!("{scope}/locks/"),
    }
}

fn read_owner(storage: &dyn StorageBackend, key: &str) -> Result<Option<LockOwner>> {
    Ok(storage
        .get(key)?
        .and_then(|data| serde_json::from_slice(&data).ok()))
}

/// Lock keys in `dir`, oldest first. Stale locks are broken on the way.
fn live_locks(storage: &dyn StorageBackend, dir: &str) -> Result<Vec<String>> {
    let now = Utc::now();
    let mut live = Vec::new();
    for key in storage.list(dir)? {
        if !key.ends_with(".json") {
            continue;
        }
        match read_owner(storage, &key)? {
            Some(owner) if owner.is_stale(now) => {
                warn!(lock = %key, host = %owner.host, pid = owner.pid, "breaking stale remote lock");
                if let Err(e) = storage.delete(&key) {
                    warn!(lock = %key, error = %e, "failed to break stale lock");
                }
            }
            _ => live.push(key),
        }
    }
    live.sort();
    Ok(live)
}

/// Take the lock on `scope` (a key prefix on the remote). Fails with
/// [`VmrepError::Locked`] when an older live lock exists.
pub fn acquire_lock(storage: &dyn StorageBackend, scope: &str) -> Result<LockGuard> {
    let dir = lock_dir(scope);
    let owner = LockOwner::current();
    let nonce = format!("{:032x}", rand::random::<u128>());
    let key = format!("{dir}{:020}-{nonce}.json", owner.acquired_at.timestamp_micros());
    storage.put(&key, &serde_json::to_vec(&owner)?)?;

    let locks = live_locks(storage, &dir)?;
    match locks.first() {
        Some(oldest) if *oldest != key => {
            if let Err(e) = storage.delete(&key) {
                warn!(lock = %key, error = %e, "failed to withdraw lock attempt");
            }
            let holder = match read_owner(storage, oldest)? {
                Some(owner) => format!("{oldest} (held by {} pid {})", owner.host, owner.pid),
                None => oldest.clone(),
            };
            Err(VmrepError::Locked(holder))
        }
        _ => {
            debug!(lock = %key, "acquired remote lock");
            Ok(LockGuard { key })
        }
    }
}

pub fn release_lock(storage: &dyn StorageBackend, guard: LockGuard) -> Result<()> {
    debug!(lock = %guard.key, "releasing remote lock");
    storage.delete(&guard.key)
}
