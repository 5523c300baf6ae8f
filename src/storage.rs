use std::{
    collections::HashMap,
    fs::{self, File},
    io::{BufReader, BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::StorageConfig,
    server::error::{LockboxError, Result, Subsystem},
};

const SNAPSHOT_FILE: &str = "lockbox.db.gz";
const WRITE_PROBE_FILE: &str = ".write-probe";

/// Concurrent key/value handle persisted as a gzip snapshot inside
/// `storage.path`. Clones share the same map.
#[derive(Clone)]
pub struct Storage {
    data: Arc<DashMap<String, ValueEntry>>,
    config: StorageConfig,
    dir: PathBuf,
    started_at: Instant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ValueEntry {
    value: String,
    expires_at: Option<u64>,
}

impl Storage {
    /// Creates the directory if needed, checks it is writable and loads the
    /// last snapshot.
    pub fn open(config: StorageConfig) -> Result<Self> {
        let dir = PathBuf::from(config.path.trim());
        let fail = |reason: String| LockboxError::construction(Subsystem::Storage, reason);

        fs::create_dir_all(&dir)
            .map_err(|err| fail(format!("cannot create {}: {err}", dir.display())))?;
        probe_writable(&dir)
            .map_err(|err| fail(format!("{} is not writable: {err}", dir.display())))?;

        let entries = load_snapshot(&dir.join(SNAPSHOT_FILE))
            .map_err(|err| fail(format!("cannot load snapshot: {err}")))?;
        let data: DashMap<String, ValueEntry> = entries.into_iter().collect();
        info!(path = %dir.display(), keys = data.len(), "storage opened");

        Ok(Self {
            data: Arc::new(data),
            config,
            dir,
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn insert(&self, key: String, value: String, seconds: u64) -> Result<()> {
        let expires_at = if seconds == 0 {
            None
        } else {
            Some(current_epoch_seconds()? + seconds)
        };

        self.data.insert(key, ValueEntry { value, expires_at });
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let now = current_epoch_seconds()?;
        if let Some(entry) = self.data.get(key) {
            if entry.is_expired(now) {
                drop(entry);
                self.data.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    pub fn delete(&self, key: &str) -> Result<Option<String>> {
        let now = current_epoch_seconds()?;
        match self.data.remove(key) {
            Some((_, entry)) if entry.is_expired(now) => Ok(None),
            Some((removed_key, _)) => Ok(Some(removed_key)),
            None => Ok(None),
        }
    }

    pub fn expires_in(&self, key: &str) -> Result<Option<u64>> {
        let now = current_epoch_seconds()?;

        if let Some(entry) = self.data.get(key) {
            match entry.expires_at {
                Some(expiry) if now < expiry => Ok(Some(expiry - now)),
                Some(_) => {
                    drop(entry);
                    self.data.remove(key);
                    Ok(None)
                }
                None => Ok(None),
            }
        } else {
            Ok(None)
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            keys: self.data.len(),
            path: self.dir.to_string_lossy().to_string(),
            uptime_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }

    /// Drops expired entries and rewrites the snapshot atomically.
    pub fn flush(&self) -> Result<()> {
        let now = current_epoch_seconds()?;
        self.data.retain(|_, entry| !entry.is_expired(now));

        let entries: HashMap<String, ValueEntry> = self
            .data
            .iter()
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect();

        let target = self.dir.join(SNAPSHOT_FILE);
        let staging = self.dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        {
            let file = File::create(&staging)?;
            let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
            serde_json::to_writer(&mut encoder, &entries)
                .map_err(|err| LockboxError::Storage(err.to_string()))?;
            encoder.finish()?.flush()?;
        }
        fs::rename(&staging, &target)?;

        debug!(path = %target.display(), keys = entries.len(), "storage flushed");
        Ok(())
    }
}

impl ValueEntry {
    fn is_expired(&self, now: u64) -> bool {
        match self.expires_at {
            Some(expiry) => now >= expiry,
            None => false,
        }
    }
}

fn probe_writable(dir: &Path) -> std::io::Result<()> {
    let probe = dir.join(WRITE_PROBE_FILE);
    File::create(&probe)?.write_all(b"ok")?;
    fs::remove_file(probe)
}

fn load_snapshot(path: &Path) -> std::io::Result<HashMap<String, ValueEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(err) => return Err(err),
    };

    let decoder = GzDecoder::new(BufReader::new(file));
    serde_json::from_reader(decoder).map_err(std::io::Error::from)
}

fn current_epoch_seconds() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub keys: usize,
    pub path: String,
    pub uptime_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    fn open_in(dir: &Path) -> Storage {
        Storage::open(StorageConfig {
            path: dir.join("db").to_string_lossy().to_string(),
        })
        .expect("storage should open")
    }

    #[test]
    fn insert_and_get_without_expire() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open_in(dir.path());
        store.insert("a".to_string(), "b".to_string(), 0)?;
        assert_eq!(store.get("a")?, Some("b".to_string()));
        Ok(())
    }

    #[test]
    fn value_expires() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open_in(dir.path());
        store.insert("a".to_string(), "b".to_string(), 1)?;
        thread::sleep(Duration::from_secs(2));
        assert_eq!(store.get("a")?, None);
        Ok(())
    }

    #[test]
    fn delete_and_expires_in_behaviour() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open_in(dir.path());
        store.insert("a".to_string(), "b".to_string(), 0)?;
        assert_eq!(store.delete("a")?, Some("a".to_string()));
        assert_eq!(store.get("a")?, None);

        store.insert("b".to_string(), "c".to_string(), 1)?;
        if let Some(ttl) = store.expires_in("b")? {
            assert!(ttl <= 1);
        } else {
            panic!("expected ttl");
        }
        thread::sleep(Duration::from_secs(2));
        assert_eq!(store.delete("b")?, None);
        assert_eq!(store.expires_in("b")?, None);
        Ok(())
    }

    #[test]
    fn flush_persists_across_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let store = open_in(dir.path());
            store.insert("kept".to_string(), "value".to_string(), 0)?;
            store.insert("ttl".to_string(), "value".to_string(), 60)?;
            store.flush()?;
        }

        let reopened = open_in(dir.path());
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get("kept")?, Some("value".to_string()));
        assert!(reopened.expires_in("ttl")?.is_some());
        Ok(())
    }

    #[test]
    fn corrupt_snapshot_fails_construction() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = dir.path().join("db");
        fs::create_dir_all(&db)?;
        fs::write(db.join(SNAPSHOT_FILE), b"definitely not gzip")?;

        let err = Storage::open(StorageConfig {
            path: db.to_string_lossy().to_string(),
        })
        .err()
        .expect("should fail");
        assert!(matches!(
            err,
            LockboxError::Construction {
                subsystem: Subsystem::Storage,
                ..
            }
        ));
        Ok(())
    }

    #[test]
    fn path_blocked_by_file_fails_construction() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"file")?;

        let err = Storage::open(StorageConfig {
            path: blocker.join("db").to_string_lossy().to_string(),
        })
        .err()
        .expect("should fail");
        assert!(matches!(
            err,
            LockboxError::Construction {
                subsystem: Subsystem::Storage,
                ..
            }
        ));
        Ok(())
    }

    #[test]
    fn stats_reflects_store_state() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open_in(dir.path());
        store.insert("a".to_string(), "value".to_string(), 0)?;
        let stats = store.stats();
        assert_eq!(stats.keys, 1);
        assert!(stats.path.ends_with("db"));
        assert!(stats.uptime_secs >= 0.0);
        Ok(())
    }
}
