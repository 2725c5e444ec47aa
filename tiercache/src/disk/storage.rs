//! Disk Storage Engine
//!
//! Persists keyed byte payloads as one file per key under a root directory
//! and keeps usage under a capacity limit with LRU sweeps. The engine is a
//! plain synchronous value: callers that share it across threads must
//! serialize access (see [`crate::cache::DiskWorker`]).

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::attributes::{AttributeStore, Attributes, SidecarAttributes};
use super::sweep::{SweepCandidate, SweepReport, eviction_order, trim_target};
use crate::core::types::validate_trim_ratio;
use crate::core::{CacheKey, DiskConfig, DiskStats, Metadata, Result};

/// Attribute holding the little-endian access stamp (ns since epoch)
const ACCESSED_ATTRIBUTE: &str = "tiercache.accessed";

/// Attribute holding caller metadata as JSON
const METADATA_ATTRIBUTE: &str = "tiercache.metadata";

/// Private directory for in-flight writes
const STAGING_DIR: &str = ".staging";

/// Private directory used by the default sidecar attribute store
const ATTRIBUTES_DIR: &str = ".attributes";

/// Length of a hex-encoded SHA-256 digest
const ENTRY_NAME_LEN: usize = 64;

/// On-disk LRU store
pub struct DiskStorage {
    root: PathBuf,
    staging: PathBuf,
    capacity_bytes: u64,
    trim_ratio: f64,
    attributes: Arc<dyn AttributeStore>,
    /// Payload sizes by entry file name
    sizes: HashMap<String, u64>,
    total_size: u64,
    /// Last access stamp handed out
    last_stamp: i64,
}

impl DiskStorage {
    /// Open (or create) a store rooted at `config.directory`.
    ///
    /// Leftover staging files from interrupted writes are deleted and size
    /// accounting is rebuilt from the files found under the root.
    pub fn open(config: &DiskConfig, attributes: Arc<dyn AttributeStore>) -> Result<Self> {
        config.validate()?;

        fs::create_dir_all(&config.directory)?;
        let staging = config.directory.join(STAGING_DIR);
        fs::create_dir_all(&staging)?;
        Self::clean_staging(&staging);

        let mut storage = Self {
            root: config.directory.clone(),
            staging,
            capacity_bytes: config.capacity_bytes,
            trim_ratio: config.trim_ratio,
            attributes,
            sizes: HashMap::new(),
            total_size: 0,
            last_stamp: 0,
        };
        storage.rescan()?;

        info!(
            root = %storage.root.display(),
            entries = storage.sizes.len(),
            total_bytes = storage.total_size,
            capacity_bytes = storage.capacity_bytes,
            "Disk storage opened"
        );

        Ok(storage)
    }

    /// Open a store whose metadata and access stamps persist in sidecar files
    pub fn open_persistent(config: &DiskConfig) -> Result<Self> {
        config.validate()?;
        let sidecar = SidecarAttributes::open(config.directory.join(ATTRIBUTES_DIR))?;
        Self::open(config, Arc::new(sidecar))
    }

    /// Remove orphaned staging files
    fn clean_staging(staging: &Path) {
        let entries = match fs::read_dir(staging) {
            Ok(e) => e,
            Err(_) => return,
        };
        let mut cleaned = 0u64;
        for entry in entries.flatten() {
            let path = entry.path();
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to clean staging file");
            } else {
                cleaned += 1;
            }
        }
        if cleaned > 0 {
            info!(dir = %staging.display(), cleaned, "Cleaned orphaned staging files");
        }
    }

    // ------------------------------------------------------------------
    // Paths
    // ------------------------------------------------------------------

    /// File name used for a key: hex SHA-256 of the key bytes
    pub fn entry_name(key: &CacheKey) -> String {
        hex::encode(Sha256::digest(key.as_str().as_bytes()))
    }

    /// Path of the payload file for `key`
    pub fn path_for_key(&self, key: &str) -> Result<PathBuf> {
        let key = CacheKey::new(key)?;
        Ok(self.root.join(Self::entry_name(&key)))
    }

    fn is_entry_name(name: &str) -> bool {
        name.len() == ENTRY_NAME_LEN
            && name
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn trim_ratio(&self) -> f64 {
        self.trim_ratio
    }

    // ------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------

    /// Payload files currently under the root
    fn scan(&self) -> io::Result<Vec<(String, PathBuf, fs::Metadata)>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(root = %self.root.display(), error = %e, "Failed to read directory entry");
                    continue;
                }
            };
            let name = match entry.file_name().into_string() {
                Ok(name) if Self::is_entry_name(&name) => name,
                _ => continue,
            };
            match entry.metadata() {
                Ok(meta) if meta.is_file() => found.push((name, entry.path(), meta)),
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Failed to stat cache entry")
                }
            }
        }
        Ok(found)
    }

    /// Rebuild the size index from the directory contents
    fn rescan(&mut self) -> io::Result<()> {
        let sizes: HashMap<String, u64> = self
            .scan()?
            .into_iter()
            .map(|(name, _, meta)| (name, meta.len()))
            .collect();
        self.total_size = sizes.values().sum();
        self.sizes = sizes;
        Ok(())
    }

    /// Stored payload size of `key`, if present
    pub fn size_of(&self, key: &str) -> Option<u64> {
        let key = CacheKey::new(key).ok()?;
        self.sizes.get(&Self::entry_name(&key)).copied()
    }

    /// Sum of all payload sizes
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn stats(&self) -> DiskStats {
        DiskStats {
            entries: self.sizes.len(),
            total_bytes: self.total_size,
            capacity_bytes: self.capacity_bytes,
            utilization: (self.total_size as f64 / self.capacity_bytes as f64) * 100.0,
        }
    }

    // ------------------------------------------------------------------
    // Access stamps
    // ------------------------------------------------------------------

    fn next_stamp(&mut self) -> i64 {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        self.last_stamp = now.max(self.last_stamp.saturating_add(1));
        self.last_stamp
    }

    fn decode_stamp(attributes: &Attributes) -> Option<i64> {
        let bytes = attributes.get(ACCESSED_ATTRIBUTE)?;
        <[u8; 8]>::try_from(bytes.as_slice())
            .ok()
            .map(i64::from_le_bytes)
    }

    fn modified_stamp(meta: &fs::Metadata) -> i64 {
        meta.modified()
            .ok()
            .and_then(|t| DateTime::<Utc>::from(t).timestamp_nanos_opt())
            .unwrap_or(0)
    }

    fn stamp_of(&self, path: &Path, meta: &fs::Metadata) -> i64 {
        self.attributes
            .get(path)
            .ok()
            .and_then(|attrs| Self::decode_stamp(&attrs))
            .unwrap_or_else(|| Self::modified_stamp(meta))
    }

    /// Refresh the access stamp of `path`, optionally dropping caller metadata
    fn touch(&mut self, path: &Path, clear_metadata: bool) -> io::Result<()> {
        let mut attrs = self.attributes.get(path)?;
        let previous = Self::decode_stamp(&attrs).unwrap_or(i64::MIN);
        let stamp = self.next_stamp().max(previous);

        if clear_metadata {
            attrs.remove(METADATA_ATTRIBUTE);
        }
        attrs.insert(ACCESSED_ATTRIBUTE.to_string(), stamp.to_le_bytes().to_vec());
        self.attributes.set(path, attrs)
    }

    /// Last access time of `key`, if present
    pub fn accessed_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let path = self.path_for_key(key)?;
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(DateTime::<Utc>::from_timestamp_nanos(
            self.stamp_of(&path, &meta),
        )))
    }

    // ------------------------------------------------------------------
    // Payloads
    // ------------------------------------------------------------------

    /// Store `data` under `key`, atomically replacing any previous payload.
    ///
    /// If staging fails the previous payload (if any) is left untouched.
    /// Once the new payload is in place, failing to record its access stamp
    /// drops the entry's attributes instead, so no metadata of the old
    /// payload stays attached. An error is returned only when that fails
    /// too; the new payload is stored either way.
    pub fn put(&mut self, key: &str, data: &[u8]) -> Result<()> {
        let key = CacheKey::new(key)?;
        let name = Self::entry_name(&key);
        let path = self.root.join(&name);

        let mut staged = NamedTempFile::new_in(&self.staging)?;
        staged.write_all(data)?;
        staged.flush()?;
        staged.persist(&path).map_err(|e| e.error)?;

        let size = data.len() as u64;
        let previous = self.sizes.insert(name, size).unwrap_or(0);
        self.total_size = self.total_size.saturating_sub(previous) + size;

        if let Err(e) = self.touch(&path, true) {
            warn!(
                key = %key,
                error = %e,
                "Failed to record access stamp; dropping attributes"
            );
            self.attributes.remove(&path)?;
        }

        debug!(key = %key, size, total = self.total_size, "Disk PUT");
        Ok(())
    }

    /// Read the payload of `key`, refreshing its access stamp on a hit
    pub fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for_key(key)?;

        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(key = %key, "Disk MISS");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self.touch(&path, false) {
            warn!(key = %key, error = %e, "Failed to refresh access stamp");
        }

        debug!(key = %key, size = data.len(), "Disk HIT");
        Ok(Some(data))
    }

    /// Whether a payload is stored under `key`
    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.path_for_key(key)?.is_file())
    }

    /// Delete one payload file and its attributes; returns the bytes freed.
    ///
    /// The payload goes first. Attributes left behind by a failed attribute
    /// removal are unreachable: metadata reads require the payload file and
    /// the next put of the same key replaces them.
    fn remove_entry(&mut self, name: &str, path: &Path) -> io::Result<Option<u64>> {
        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }

        let freed = self.sizes.remove(name);
        if let Some(size) = freed {
            self.total_size = self.total_size.saturating_sub(size);
        }

        if let Err(e) = self.attributes.remove(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove entry attributes");
        }

        Ok(freed)
    }

    /// Remove `key`; absent keys are a no-op
    pub fn remove(&mut self, key: &str) -> Result<()> {
        let key = CacheKey::new(key)?;
        let name = Self::entry_name(&key);
        let path = self.root.join(&name);

        if let Some(size) = self.remove_entry(&name, &path)? {
            debug!(key = %key, size, "Disk REMOVE");
        }
        Ok(())
    }

    /// Remove every key, attempting all of them; returns the first error
    pub fn remove_many<I, S>(&mut self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut first_error = None;
        for key in keys {
            if let Err(e) = self.remove(key.as_ref()) {
                warn!(key = %key.as_ref(), error = %e, "Failed to remove entry");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Delete every entry under the root
    pub fn remove_all(&mut self) -> Result<()> {
        let mut first_error: Option<io::Error> = None;

        for (_, path, _) in self.scan()? {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove entry");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.attributes.clear() {
            warn!(error = %e, "Failed to clear entry attributes");
            first_error.get_or_insert(e);
        }

        let before = self.sizes.len();
        self.rescan()?;
        info!(removed = before.saturating_sub(self.sizes.len()), "Disk REMOVE ALL");

        first_error.map_or(Ok(()), |e| Err(e.into()))
    }

    // ------------------------------------------------------------------
    // Sweep
    // ------------------------------------------------------------------

    /// Enumerate entries with their access stamps, resyncing size accounting
    fn collect_candidates(&mut self) -> io::Result<Vec<SweepCandidate>> {
        let scanned = self.scan()?;
        let mut sizes = HashMap::with_capacity(scanned.len());
        let mut candidates = Vec::with_capacity(scanned.len());

        for (name, path, meta) in scanned {
            let accessed_at = self.stamp_of(&path, &meta);
            sizes.insert(name, meta.len());
            candidates.push(SweepCandidate {
                path,
                size: meta.len(),
                accessed_at,
            });
        }

        self.total_size = sizes.values().sum();
        self.sizes = sizes;
        Ok(candidates)
    }

    /// Evict least recently used entries when usage exceeds `capacity_bytes`.
    ///
    /// Entries are deleted oldest first until usage drops to
    /// `capacity_bytes * trim_ratio`. Deletion failures are logged and skipped.
    pub fn sweep(&mut self, capacity_bytes: u64, trim_ratio: f64) -> Result<SweepReport> {
        validate_trim_ratio(trim_ratio)?;

        let mut candidates = self.collect_candidates()?;
        let target = trim_target(capacity_bytes, trim_ratio);
        let mut report = SweepReport {
            scanned: candidates.len(),
            size_before: self.total_size,
            target_bytes: target,
            ..Default::default()
        };

        if self.total_size <= capacity_bytes {
            report.size_after = self.total_size;
            debug!(
                total = self.total_size,
                capacity = capacity_bytes,
                "Sweep skipped: under capacity"
            );
            return Ok(report);
        }

        eviction_order(&mut candidates);

        for candidate in candidates {
            if self.total_size <= target {
                break;
            }
            let Some(name) = candidate.path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let name = name.to_string();

            match self.remove_entry(&name, &candidate.path) {
                Ok(freed) => {
                    report.removed += 1;
                    report.freed_bytes += freed.unwrap_or(candidate.size);
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        path = %candidate.path.display(),
                        error = %e,
                        "Sweep failed to remove entry, skipping"
                    );
                }
            }
        }

        report.size_after = self.total_size;
        info!(
            removed = report.removed,
            failed = report.failed,
            freed_bytes = report.freed_bytes,
            size_after = report.size_after,
            target = target,
            "Disk sweep finished"
        );

        Ok(report)
    }

    /// Sweep with the capacity and trim ratio the store was opened with
    pub fn cleanup(&mut self) -> Result<SweepReport> {
        self.sweep(self.capacity_bytes, self.trim_ratio)
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    /// Caller metadata of `key`; `None` when the entry or its metadata is absent
    pub fn metadata(&self, key: &str) -> Result<Option<Metadata>> {
        let path = self.path_for_key(key)?;
        if !path.is_file() {
            return Ok(None);
        }

        let attrs = self.attributes.get(&path)?;
        match attrs.get(METADATA_ATTRIBUTE) {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    fn write_metadata(&mut self, path: &Path, metadata: &Metadata) -> Result<()> {
        let mut attrs = self.attributes.get(path)?;
        if metadata.is_empty() {
            attrs.remove(METADATA_ATTRIBUTE);
        } else {
            attrs.insert(METADATA_ATTRIBUTE.to_string(), serde_json::to_vec(metadata)?);
        }
        self.attributes.set(path, attrs)?;
        Ok(())
    }

    /// Replace the metadata of `key`; no-op when the entry is absent
    pub fn set_metadata(&mut self, key: &str, metadata: &Metadata) -> Result<()> {
        let path = self.path_for_key(key)?;
        if !path.is_file() {
            debug!(key = %key, "Metadata SET ignored: no entry");
            return Ok(());
        }
        self.write_metadata(&path, metadata)
    }

    /// Set individual metadata values, keeping the others
    pub fn merge_metadata(&mut self, key: &str, values: &Metadata) -> Result<()> {
        let path = self.path_for_key(key)?;
        if !path.is_file() {
            debug!(key = %key, "Metadata MERGE ignored: no entry");
            return Ok(());
        }

        let mut metadata = self.metadata(key)?.unwrap_or_default();
        metadata.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.write_metadata(&path, &metadata)
    }

    /// Drop the metadata of `key`, keeping the payload
    pub fn remove_metadata(&mut self, key: &str) -> Result<()> {
        let path = self.path_for_key(key)?;
        if !path.is_file() {
            return Ok(());
        }
        self.write_metadata(&path, &Metadata::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CacheError, ErrorKind};
    use crate::disk::MemoryAttributes;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    fn open_with(dir: &Path, capacity: u64, attrs: Arc<MemoryAttributes>) -> DiskStorage {
        let config = DiskConfig::new(dir).with_capacity(capacity);
        DiskStorage::open(&config, attrs).unwrap()
    }

    fn open(dir: &Path, capacity: u64) -> DiskStorage {
        open_with(dir, capacity, Arc::new(MemoryAttributes::new()))
    }

    /// Attribute store whose writes can be made to fail
    #[derive(Default)]
    struct FaultyAttributes {
        inner: MemoryAttributes,
        fail_set: AtomicBool,
        fail_remove: AtomicBool,
    }

    impl FaultyAttributes {
        fn refuse(flag: &AtomicBool) -> io::Result<()> {
            if flag.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"));
            }
            Ok(())
        }
    }

    impl AttributeStore for FaultyAttributes {
        fn get(&self, path: &Path) -> io::Result<Attributes> {
            self.inner.get(path)
        }

        fn set(&self, path: &Path, attributes: Attributes) -> io::Result<()> {
            Self::refuse(&self.fail_set)?;
            self.inner.set(path, attributes)
        }

        fn remove(&self, path: &Path) -> io::Result<()> {
            Self::refuse(&self.fail_remove)?;
            self.inner.remove(path)
        }

        fn clear(&self) -> io::Result<()> {
            self.inner.clear()
        }
    }

    fn open_faulty(dir: &Path, capacity: u64) -> (DiskStorage, Arc<FaultyAttributes>) {
        let attrs = Arc::new(FaultyAttributes::default());
        let config = DiskConfig::new(dir).with_capacity(capacity);
        let storage = DiskStorage::open(&config, attrs.clone()).unwrap();
        (storage, attrs)
    }

    /// Bytes of payload files actually present under the root
    fn bytes_on_disk(dir: &Path) -> u64 {
        fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().metadata().unwrap())
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
            .sum()
    }

    fn meta(pairs: &[(&str, serde_json::Value)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_put_get_round_trip() {
        let dir = tempdir().unwrap();
        let mut storage = open(dir.path(), 1024 * 1024);

        storage.put("key1", b"value1").unwrap();

        assert_eq!(storage.get("key1").unwrap(), Some(b"value1".to_vec()));
        assert_eq!(storage.size_of("key1"), Some(6));
        assert_eq!(storage.total_size(), 6);
    }

    #[test]
    fn test_get_missing() {
        let dir = tempdir().unwrap();
        let mut storage = open(dir.path(), 1024);

        assert_eq!(storage.get("nope").unwrap(), None);
        assert_eq!(storage.size_of("nope"), None);
    }

    #[test]
    fn test_path_is_stable_per_key() {
        let dir = tempdir().unwrap();
        let storage = open(dir.path(), 1024);

        let a = storage.path_for_key("user:1").unwrap();
        let b = storage.path_for_key("user:1").unwrap();
        let c = storage.path_for_key("user:2").unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.parent(), Some(dir.path()));
        assert!(DiskStorage::is_entry_name(
            a.file_name().unwrap().to_str().unwrap()
        ));
    }

    #[test]
    fn test_invalid_key() {
        let dir = tempdir().unwrap();
        let mut storage = open(dir.path(), 1024);

        let err = storage.put("", b"x").unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey(_)));
        assert!(storage.get("").is_err());
    }

    #[test]
    fn test_replace_updates_accounting() {
        let dir = tempdir().unwrap();
        let mut storage = open(dir.path(), 1024);

        storage.put("k", &[1u8; 100]).unwrap();
        storage.put("k", &[2u8; 40]).unwrap();

        assert_eq!(storage.total_size(), 40);
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.get("k").unwrap(), Some(vec![2u8; 40]));
        // One payload file, nothing left in staging
        assert_eq!(storage.scan().unwrap().len(), 1);
        assert_eq!(fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut storage = open(dir.path(), 1024);

        storage.put("k", b"data").unwrap();
        storage.remove("k").unwrap();
        storage.remove("k").unwrap();
        storage.remove("never-existed").unwrap();

        assert_eq!(storage.get("k").unwrap(), None);
        assert_eq!(storage.total_size(), 0);
    }

    #[test]
    fn test_remove_many_and_all() {
        let dir = tempdir().unwrap();
        let mut storage = open(dir.path(), 1024);

        for key in ["a", "b", "c", "d"] {
            storage.put(key, key.as_bytes()).unwrap();
        }

        storage.remove_many(["a", "b", "zzz"]).unwrap();
        assert!(!storage.contains("a").unwrap());
        assert!(storage.contains("c").unwrap());
        assert_eq!(storage.total_size(), 2);

        storage.remove_all().unwrap();
        assert!(storage.is_empty());
        assert_eq!(storage.total_size(), 0);
        assert!(!storage.contains("d").unwrap());
    }

    #[test]
    fn test_accounting_survives_reopen() {
        let dir = tempdir().unwrap();
        let config = DiskConfig::new(dir.path()).with_capacity(4096);

        {
            let mut storage = DiskStorage::open_persistent(&config).unwrap();
            storage.put("a", &[0u8; 100]).unwrap();
            storage.put("b", &[0u8; 50]).unwrap();
            let mut md = Metadata::new();
            md.insert("etag".into(), json!("v1"));
            storage.set_metadata("a", &md).unwrap();
        }

        let storage = DiskStorage::open_persistent(&config).unwrap();
        assert_eq!(storage.total_size(), 150);
        assert_eq!(storage.size_of("b"), Some(50));
        assert_eq!(
            storage.metadata("a").unwrap().unwrap().get("etag"),
            Some(&json!("v1"))
        );
    }

    #[test]
    fn test_open_cleans_staging() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(STAGING_DIR)).unwrap();
        fs::write(dir.path().join(STAGING_DIR).join(".tmpabc"), b"partial").unwrap();

        let storage = open(dir.path(), 1024);

        assert_eq!(fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().count(), 0);
        assert_eq!(storage.total_size(), 0);
    }

    #[test]
    fn test_foreign_files_are_not_entries() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("README.txt"), vec![0u8; 5000]).unwrap();

        let mut storage = open(dir.path(), 100);
        assert_eq!(storage.total_size(), 0);

        storage.put("k", &[0u8; 200]).unwrap();
        storage.sweep(100, 0.5).unwrap();

        assert!(dir.path().join("README.txt").exists());
    }

    #[test]
    fn test_sweep_scenario_oldest_first() {
        let dir = tempdir().unwrap();
        let mut storage = open(dir.path(), 1000);

        for key in ["a", "b", "c", "d", "e"] {
            storage.put(key, &[7u8; 300]).unwrap();
        }
        assert_eq!(storage.total_size(), 1500);

        let report = storage.sweep(1000, 0.5).unwrap();

        assert!(storage.total_size() <= 500);
        assert!(report.removed >= 2);
        assert_eq!(report.size_before, 1500);
        assert_eq!(report.size_after, storage.total_size());
        assert_eq!(report.freed_bytes, 1500 - storage.total_size());
        assert!(storage.contains("e").unwrap(), "newest entry survives");
        for key in ["a", "b", "c", "d"] {
            assert!(!storage.contains(key).unwrap(), "{} should be evicted", key);
        }
    }

    #[test]
    fn test_sweep_honours_reads() {
        let dir = tempdir().unwrap();
        let mut storage = open(dir.path(), 1000);

        storage.put("a", &[0u8; 400]).unwrap();
        storage.put("b", &[0u8; 400]).unwrap();
        storage.put("c", &[0u8; 400]).unwrap();
        // Reading a makes b the least recently used
        storage.get("a").unwrap();

        let report = storage.sweep(1000, 0.9).unwrap();

        assert_eq!(report.removed, 1);
        assert!(!storage.contains("b").unwrap());
        assert!(storage.contains("a").unwrap());
        assert!(storage.contains("c").unwrap());
    }

    #[test]
    fn test_sweep_under_capacity_is_noop() {
        let dir = tempdir().unwrap();
        let mut storage = open(dir.path(), 1000);

        storage.put("a", &[0u8; 600]).unwrap();
        let report = storage.sweep(1000, 0.5).unwrap();

        assert!(report.is_noop());
        assert_eq!(report.scanned, 1);
        assert!(storage.contains("a").unwrap());
    }

    #[test]
    fn test_sweep_rejects_bad_ratio() {
        let dir = tempdir().unwrap();
        let mut storage = open(dir.path(), 1000);

        assert!(matches!(
            storage.sweep(1000, 1.5),
            Err(CacheError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_cleanup_uses_configured_limits() {
        let dir = tempdir().unwrap();
        let config = DiskConfig::new(dir.path())
            .with_capacity(100)
            .with_trim_ratio(0.0);
        let mut storage = DiskStorage::open(&config, Arc::new(MemoryAttributes::new())).unwrap();

        storage.put("a", &[0u8; 60]).unwrap();
        storage.put("b", &[0u8; 60]).unwrap();
        storage.cleanup().unwrap();

        assert!(storage.is_empty());
    }

    #[test]
    fn test_access_stamps_increase() {
        let dir = tempdir().unwrap();
        let mut storage = open(dir.path(), 1000);

        storage.put("a", b"1").unwrap();
        let first = storage.accessed_at("a").unwrap().unwrap();
        storage.get("a").unwrap();
        let second = storage.accessed_at("a").unwrap().unwrap();

        assert!(second > first);
        assert_eq!(storage.accessed_at("missing").unwrap(), None);
    }

    #[test]
    fn test_metadata_on_absent_key_is_noop() {
        let dir = tempdir().unwrap();
        let attrs = Arc::new(MemoryAttributes::new());
        let mut storage = open_with(dir.path(), 1000, attrs.clone());

        storage
            .set_metadata("ghost", &meta(&[("a", json!(1))]))
            .unwrap();
        storage
            .merge_metadata("ghost", &meta(&[("b", json!(2))]))
            .unwrap();
        storage.remove_metadata("ghost").unwrap();

        assert_eq!(storage.metadata("ghost").unwrap(), None);
        assert!(attrs.is_empty(), "no trace left for absent keys");
    }

    #[test]
    fn test_metadata_lifecycle() {
        let dir = tempdir().unwrap();
        let attrs = Arc::new(MemoryAttributes::new());
        let mut storage = open_with(dir.path(), 1000, attrs.clone());

        storage.put("k", b"payload").unwrap();
        assert_eq!(storage.metadata("k").unwrap(), None);

        storage
            .set_metadata("k", &meta(&[("etag", json!("abc")), ("hits", json!(1))]))
            .unwrap();
        storage
            .merge_metadata("k", &meta(&[("hits", json!(2))]))
            .unwrap();

        let md = storage.metadata("k").unwrap().unwrap();
        assert_eq!(md.get("etag"), Some(&json!("abc")));
        assert_eq!(md.get("hits"), Some(&json!(2)));

        storage.remove_metadata("k").unwrap();
        assert_eq!(storage.metadata("k").unwrap(), None);
        assert!(storage.contains("k").unwrap(), "payload kept");

        storage.set_metadata("k", &meta(&[("x", json!(true))])).unwrap();
        storage.remove("k").unwrap();
        assert_eq!(storage.metadata("k").unwrap(), None);
        assert!(attrs.is_empty());
    }

    #[test]
    fn test_replacing_payload_clears_metadata() {
        let dir = tempdir().unwrap();
        let mut storage = open(dir.path(), 1000);

        storage.put("k", b"v1").unwrap();
        storage.set_metadata("k", &meta(&[("v", json!(1))])).unwrap();
        storage.put("k", b"v2").unwrap();

        assert_eq!(storage.metadata("k").unwrap(), None);
    }

    #[test]
    fn test_stats() {
        let dir = tempdir().unwrap();
        let mut storage = open(dir.path(), 1000);

        storage.put("a", &[0u8; 250]).unwrap();
        let stats = storage.stats();

        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_bytes, 250);
        assert_eq!(stats.capacity_bytes, 1000);
        assert_eq!(stats.utilization, 25.0);
    }

    #[test]
    fn test_sweep_evicts_when_attribute_removal_fails() {
        let dir = tempdir().unwrap();
        let (mut storage, attrs) = open_faulty(dir.path(), 1000);

        for i in 0..5 {
            storage.put(&format!("k{}", i), &[0u8; 300]).unwrap();
        }
        storage
            .set_metadata("k0", &meta(&[("owner", json!("a"))]))
            .unwrap();
        attrs.fail_remove.store(true, Ordering::SeqCst);

        let report = storage.sweep(1000, 0.5).unwrap();

        assert_eq!(report.removed, 4);
        assert_eq!(report.failed, 0);
        assert_eq!(storage.total_size(), 300);
        assert_eq!(storage.total_size(), bytes_on_disk(dir.path()));
        assert!(storage.contains("k4").unwrap());
        for i in 0..4 {
            assert!(!storage.contains(&format!("k{}", i)).unwrap());
        }

        // Leftover attributes of an evicted entry stay unreachable
        assert!(storage.metadata("k0").unwrap().is_none());
        storage.put("k0", b"again").unwrap();
        assert!(storage.metadata("k0").unwrap().is_none());
        assert_eq!(storage.total_size(), bytes_on_disk(dir.path()));
    }

    #[test]
    fn test_put_drops_stale_metadata_when_stamp_fails() {
        let dir = tempdir().unwrap();
        let (mut storage, attrs) = open_faulty(dir.path(), 1024);

        storage.put("k", b"old").unwrap();
        storage
            .set_metadata("k", &meta(&[("etag", json!("v1"))]))
            .unwrap();
        attrs.fail_set.store(true, Ordering::SeqCst);

        storage.put("k", b"new").unwrap();

        assert!(storage.metadata("k").unwrap().is_none());
        assert_eq!(storage.get("k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_put_reports_unclearable_attributes() {
        let dir = tempdir().unwrap();
        let (mut storage, attrs) = open_faulty(dir.path(), 1024);

        storage.put("k", b"old").unwrap();
        attrs.fail_set.store(true, Ordering::SeqCst);
        attrs.fail_remove.store(true, Ordering::SeqCst);

        let err = storage.put("k", b"newer").unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(storage.get("k").unwrap(), Some(b"newer".to_vec()));
        assert_eq!(storage.size_of("k"), Some(5));
    }
}
