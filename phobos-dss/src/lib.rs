//! The DSS distributed lock service.
//!
//! Every mutation acquires the store's flock, reloads the JSON file from
//! disk, mutates the in-memory map, and atomically replaces the file.
//! Unlike a plain host-local advisory lock guarding host-local state, these
//! records carry `hostname` and `owner_pid` and are meant to be read from
//! any host sharing the
//! backing path -- the contract is cross-host exclusivity, not
//! just local mutual exclusion.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Error};

use phobos_api_types::{DssLock, LockType};

pub const DSS_LOCK_DB_FILENAME: &str = "dss-locks.json";
pub const DSS_LOCK_DB_LOCKFILE: &str = ".dss-locks.lck";
pub const DSS_EVENT_LOG_FILENAME: &str = "events.jsonl";

/// Result of [`DssStore::acquire`].
#[derive(Debug)]
pub enum AcquireResult {
    Ok,
    /// Someone else already holds it.
    Conflict(DssLock),
}

/// Filters for [`DssStore::clean_selective`]; an omitted filter matches all.
#[derive(Debug, Default, Clone)]
pub struct CleanFilter {
    pub hostname: Option<String>,
    pub lock_type: Option<LockType>,
    /// Matched against the `<family>:` prefix convention used for media ids.
    pub family: Option<String>,
    pub ids: Option<Vec<String>>,
}

impl CleanFilter {
    fn matches(&self, lock: &DssLock) -> bool {
        if let Some(hostname) = &self.hostname {
            if &lock.hostname != hostname {
                return false;
            }
        }
        if let Some(lock_type) = self.lock_type {
            if lock.lock_type != lock_type {
                return false;
            }
        }
        if let Some(family) = &self.family {
            if !lock.id.starts_with(&format!("{family}:")) {
                return false;
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&lock.id) {
                return false;
            }
        }
        true
    }
}

pub struct DssStore {
    database_path: PathBuf,
    lockfile_path: PathBuf,
    event_log_path: PathBuf,
}

impl DssStore {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        let base = base_dir.as_ref();
        Self {
            database_path: base.join(DSS_LOCK_DB_FILENAME),
            lockfile_path: base.join(DSS_LOCK_DB_LOCKFILE),
            event_log_path: base.join(DSS_EVENT_LOG_FILENAME),
        }
    }

    /// Append a JSON record to the DSS out-of-band event log, the channel
    /// TLC uses to log each SCSI move. Independent of the lock database
    /// and its flock -- callers may log concurrently with lock mutation.
    pub fn log_event(&self, record: &serde_json::Value) -> Result<(), Error> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&self.event_log_path)?;
        writeln!(file, "{record}")?;
        Ok(())
    }

    fn lock(&self) -> Result<std::fs::File, Error> {
        let options = proxmox_sys::fs::CreateOptions::new();
        proxmox_sys::fs::open_file_locked(&self.lockfile_path, std::time::Duration::new(10, 0), true, options)
    }

    fn load(&self) -> Result<BTreeMap<String, DssLock>, Error> {
        let content = proxmox_sys::fs::file_read_optional_string(&self.database_path)?.unwrap_or_default();
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        let list: Vec<DssLock> = serde_json::from_str(&content)?;
        Ok(list.into_iter().map(|lock| (DssLock::key(lock.lock_type, &lock.id), lock)).collect())
    }

    fn store(&self, map: &BTreeMap<String, DssLock>) -> Result<(), Error> {
        let list: Vec<&DssLock> = map.values().collect();
        let raw = serde_json::to_string_pretty(&list)?;
        let options = proxmox_sys::fs::CreateOptions::new();
        proxmox_sys::fs::replace_file(&self.database_path, raw.as_bytes(), options, true)
    }

    /// Acquire `(type, id)` for `(hostname, owner)`. Fails with
    /// [`AcquireResult::Conflict`] carrying the current holder if already
    /// taken -- the insert-or-fail semantics the state machine relies on.
    pub fn acquire(&self, lock_type: LockType, id: &str, hostname: &str, owner_pid: u32) -> Result<AcquireResult, Error> {
        let _guard = self.lock()?;
        let mut map = self.load()?;

        let key = DssLock::key(lock_type, id);
        if let Some(existing) = map.get(&key) {
            if existing.hostname == hostname && existing.owner_pid == owner_pid {
                // re-entrant acquire from the same owner behaves like a refresh
            } else {
                log::debug!("lock conflict on {} (held by {}@{})", key, existing.owner_pid, existing.hostname);
                return Ok(AcquireResult::Conflict(existing.clone()));
            }
        }

        map.insert(
            key,
            DssLock {
                lock_type,
                id: id.to_string(),
                hostname: hostname.to_string(),
                owner_pid,
                timestamp: now(),
            },
        );
        self.store(&map)?;

        Ok(AcquireResult::Ok)
    }

    /// Bump the timestamp on a lock this owner already holds.
    pub fn refresh(&self, lock_type: LockType, id: &str, hostname: &str, owner_pid: u32) -> Result<(), Error> {
        let _guard = self.lock()?;
        let mut map = self.load()?;

        let key = DssLock::key(lock_type, id);
        match map.get_mut(&key) {
            Some(lock) if lock.hostname == hostname && lock.owner_pid == owner_pid => {
                lock.timestamp = now();
            }
            Some(lock) => bail!("lock {} is held by {}@{}, not {}@{}", key, lock.owner_pid, lock.hostname, owner_pid, hostname),
            None => bail!("lock {} is not held", key),
        }

        self.store(&map)
    }

    /// Release `(type, id)`. `force` allows breaking a lock whose holder is
    /// known dead, bypassing the hostname/owner check.
    pub fn release(&self, lock_type: LockType, id: &str, hostname: &str, owner_pid: u32, force: bool) -> Result<(), Error> {
        let _guard = self.lock()?;
        let mut map = self.load()?;

        let key = DssLock::key(lock_type, id);
        match map.get(&key) {
            Some(lock) if force || (lock.hostname == hostname && lock.owner_pid == owner_pid) => {
                map.remove(&key);
            }
            Some(lock) => bail!("lock {} is held by {}@{}, not {}@{}", key, lock.owner_pid, lock.hostname, owner_pid, hostname),
            None => bail!("lock {} is not held", key),
        }

        self.store(&map)
    }

    /// Administrative: wipe every lock. Caller must have already confirmed
    /// both `global` and `force`, and that no local LRS is running --
    /// those are policy checks the daemon/CLI layer owns, not this store.
    pub fn clean_all(&self, global: bool, force: bool) -> Result<usize, Error> {
        if !global || !force {
            bail!("clean_all requires both the global and force flags");
        }
        let _guard = self.lock()?;
        let map = self.load()?;
        let count = map.len();
        self.store(&BTreeMap::new())?;
        Ok(count)
    }

    /// Remove every lock matching `filter`. With every field `None`, this
    /// is equivalent to [`Self::clean_all`] without the safety flags -- used
    /// at daemon startup to clean locks held by the local hostname.
    pub fn clean_selective(&self, filter: &CleanFilter) -> Result<usize, Error> {
        let _guard = self.lock()?;
        let mut map = self.load()?;
        let before = map.len();
        map.retain(|_, lock| !filter.matches(lock));
        let removed = before - map.len();
        log::info!("clean_selective removed {} stale lock(s)", removed);
        self.store(&map)?;
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<DssLock>, Error> {
        let _guard = self.lock()?;
        Ok(self.load()?.into_values().collect())
    }
}

fn now() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;

    fn store() -> (DssStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("phobos-dss-test-{}-{}", std::process::id(), now()));
        std::fs::create_dir_all(&dir).unwrap();
        (DssStore::new(&dir), dir)
    }

    #[test]
    fn acquire_then_conflict() {
        let (store, dir) = store();
        assert!(matches!(store.acquire(LockType::Device, "drv0", "host-a", 100).unwrap(), AcquireResult::Ok));
        match store.acquire(LockType::Device, "drv0", "host-b", 200).unwrap() {
            AcquireResult::Conflict(lock) => assert_eq!(lock.hostname, "host-a"),
            AcquireResult::Ok => panic!("expected conflict"),
        }
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn release_requires_ownership_unless_forced() {
        let (store, dir) = store();
        store.acquire(LockType::Media, "tape:VOL0001", "host-a", 100).unwrap();
        assert!(store.release(LockType::Media, "tape:VOL0001", "host-b", 999, false).is_err());
        store.release(LockType::Media, "tape:VOL0001", "host-b", 999, true).unwrap();
        assert!(store.list().unwrap().is_empty());
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn clean_selective_by_hostname() {
        let (store, dir) = store();
        store.acquire(LockType::Device, "drv0", "host-a", 1).unwrap();
        store.acquire(LockType::Device, "drv1", "host-b", 2).unwrap();

        let removed = store.clean_selective(&CleanFilter { hostname: Some("host-a".to_string()), ..Default::default() }).unwrap();
        assert_eq!(removed, 1);

        let remaining = store.list().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].hostname, "host-b");
        std::fs::remove_dir_all(dir).ok();
    }

    /// A crashed LRS leaves a device lock and a media lock under its own
    /// hostname. A restart on that same hostname cleans both; a restart
    /// under a merely similarly-named hostname cleans neither.
    #[test]
    fn stale_locks_are_cleaned_only_on_exact_hostname_match() {
        let (store, dir) = store();
        store.acquire(LockType::Device, "tape:D1", "h1", 111).unwrap();
        store.acquire(LockType::Media, "tape:T1", "h1", 111).unwrap();

        let removed = store.clean_selective(&CleanFilter { hostname: Some("h1-other".to_string()), ..Default::default() }).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(store.list().unwrap().len(), 2);

        let removed = store.clean_selective(&CleanFilter { hostname: Some("h1".to_string()), ..Default::default() }).unwrap();
        assert_eq!(removed, 2);
        assert!(store.list().unwrap().is_empty());

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn clean_all_requires_both_flags() {
        let (store, dir) = store();
        store.acquire(LockType::Device, "drv0", "host-a", 1).unwrap();
        assert!(store.clean_all(true, false).is_err());
        assert!(store.clean_all(false, true).is_err());
        assert_eq!(store.clean_all(true, true).unwrap(), 1);
        std::fs::remove_dir_all(dir).ok();
    }
}
