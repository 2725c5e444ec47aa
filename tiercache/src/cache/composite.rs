//! Two-tier cache coordinator
//!
//! [`TierCache`] keeps a volatile [`MemoryTier`] in front of the on-disk
//! engine. Reads try memory first and fall back to disk, decoding raw
//! bytes on the runtime's blocking pool and promoting the result into
//! memory. Writes land in memory immediately and are persisted by the
//! serialized disk worker. Disk failures never reach the caller of a
//! write; they are logged, counted and broadcast on the failure channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info};

use super::cleanup::{CleanupScheduler, count_sweep, enqueue_sweep};
use super::delivery::CompletionTarget;
use super::failure::{DiskFailure, DiskOperation, FailureReporter};
use super::fence::{FenceTicket, ReadFence};
use super::worker::DiskWorker;
use crate::core::{
    CacheCounters, CacheError, CacheStats, CleanupConfig, DiskConfig, DiskStats, MemoryCache,
    MemoryConfig, MemoryTier, Metadata, Result,
};
use crate::disk::{AttributeStore, DiskStorage, SweepReport};

/// Default capacity of the failure broadcast channel
pub const DEFAULT_FAILURE_CAPACITY: usize = 256;

/// Bytes waiting to be written by the disk worker
enum Payload {
    Ready(Vec<u8>),
    /// Produced by an encoder still running on the blocking pool
    Encoding(oneshot::Receiver<Option<Vec<u8>>>),
}

struct Inner<V> {
    memory: Option<Arc<dyn MemoryTier<V>>>,
    disk: DiskWorker,
    runtime: Handle,
    cleanup: CleanupScheduler,
    reporter: FailureReporter,
    counters: Arc<CacheCounters>,
    fence: ReadFence,
    root: PathBuf,
}

/// Composite memory + disk cache.
///
/// Cloning is cheap and every clone shares the same tiers. Operations on
/// one key issued in sequence reach the disk engine in that order.
pub struct TierCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for TierCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Builder for [`TierCache`]
pub struct TierCacheBuilder<V> {
    disk: DiskConfig,
    memory: Option<Arc<dyn MemoryTier<V>>>,
    attributes: Option<Arc<dyn AttributeStore>>,
    cleanup: CleanupConfig,
    runtime: Option<Handle>,
    failure_capacity: usize,
}

impl<V: Clone + Send + Sync + 'static> TierCacheBuilder<V> {
    fn new(disk: DiskConfig) -> Self {
        Self {
            disk,
            memory: Some(Arc::new(MemoryCache::<V>::from_config(&MemoryConfig::default()))),
            attributes: None,
            cleanup: CleanupConfig::default(),
            runtime: None,
            failure_capacity: DEFAULT_FAILURE_CAPACITY,
        }
    }

    /// Use a custom memory tier
    pub fn memory(mut self, tier: Arc<dyn MemoryTier<V>>) -> Self {
        self.memory = Some(tier);
        self
    }

    /// Use the built-in LRU sized by `config`, or no memory tier when disabled
    pub fn memory_config(mut self, config: &MemoryConfig) -> Self {
        self.memory = if config.enabled {
            Some(Arc::new(MemoryCache::<V>::from_config(config)))
        } else {
            None
        };
        self
    }

    /// Run disk-only
    pub fn without_memory(mut self) -> Self {
        self.memory = None;
        self
    }

    /// Store access stamps and metadata in `store` instead of sidecar files
    pub fn attributes(mut self, store: Arc<dyn AttributeStore>) -> Self {
        self.attributes = Some(store);
        self
    }

    pub fn cleanup(mut self, config: CleanupConfig) -> Self {
        self.cleanup = config;
        self
    }

    /// Runtime used for decoding, encoding, callbacks and the cleanup timer.
    ///
    /// Defaults to the runtime the builder is called from.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn failure_capacity(mut self, capacity: usize) -> Self {
        self.failure_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<TierCache<V>> {
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|e| CacheError::Runtime(e.to_string()))?,
        };

        let storage = match self.attributes {
            Some(store) => DiskStorage::open(&self.disk, store)?,
            None => DiskStorage::open_persistent(&self.disk)?,
        };
        let root = storage.root().to_path_buf();
        let disk = DiskWorker::spawn(storage)?;

        let counters = Arc::new(CacheCounters::default());
        let reporter = FailureReporter::new(self.failure_capacity, Arc::clone(&counters));
        let cleanup = CleanupScheduler::new(
            &self.cleanup,
            disk.clone(),
            runtime.clone(),
            reporter.clone(),
            Arc::clone(&counters),
        );

        info!(
            root = %root.display(),
            memory_tier = self.memory.is_some(),
            capacity_bytes = self.disk.capacity_bytes,
            cleanup_enabled = self.cleanup.enabled,
            "Tier cache ready"
        );

        Ok(TierCache {
            inner: Arc::new(Inner {
                memory: self.memory,
                disk,
                runtime,
                cleanup,
                reporter,
                counters,
                fence: ReadFence::default(),
                root,
            }),
        })
    }
}

impl<V: Clone + Send + Sync + 'static> TierCache<V> {
    pub fn builder(disk: DiskConfig) -> TierCacheBuilder<V> {
        TierCacheBuilder::new(disk)
    }

    /// Cache with default settings stored under `base_dir/name`
    pub fn with_name(name: &str, base_dir: impl AsRef<Path>) -> Result<Self> {
        if name.is_empty() {
            return Err(CacheError::InvalidKey(
                "cache name must not be empty".to_string(),
            ));
        }
        if name.contains(['/', '\\', '\0']) || name == "." || name == ".." {
            return Err(CacheError::InvalidKey(format!(
                "cache name is not a single path component: {:?}",
                name
            )));
        }
        Self::builder(DiskConfig::new(base_dir.as_ref().join(name))).build()
    }

    /// Directory owned by the disk engine
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn memory(&self) -> Option<&Arc<dyn MemoryTier<V>>> {
        self.inner.memory.as_ref()
    }

    /// Target that runs callbacks on the cache's runtime blocking pool
    pub fn default_target(&self) -> Arc<dyn CompletionTarget> {
        Arc::new(self.inner.runtime.clone())
    }

    // ---- reads ----

    /// Look `key` up in memory, then on disk.
    ///
    /// Disk bytes are handed to `decode` on the blocking pool; a `None`
    /// from it counts as a miss. Decoded values enter the memory tier with
    /// the cost returned by `cost`, unless a put or remove of `key` was
    /// issued while the read was in flight. In that case the value the
    /// memory tier now holds wins.
    pub async fn get<D, C>(&self, key: &str, decode: D, cost: C) -> Option<V>
    where
        D: FnOnce(Vec<u8>) -> Option<V> + Send + 'static,
        C: FnOnce(&V) -> u64,
    {
        if let Some(value) = self.inner.memory_get(key) {
            return Some(value);
        }
        let ticket = match self.inner.begin_disk_read(key) {
            Ok(ticket) => ticket,
            Err(value) => return Some(value),
        };

        let owned = key.to_string();
        let read = self.inner.disk.run(move |storage| storage.get(&owned)).await;
        let data = self.inner.disk_read_outcome(key, read)?;

        let decoded = match self.inner.runtime.spawn_blocking(move || decode(data)).await {
            Ok(value) => value,
            Err(e) => {
                self.inner.reporter.report(
                    DiskOperation::Decode,
                    Some(key),
                    CacheError::Codec(format!("decoder did not finish: {}", e)),
                );
                None
            }
        };
        self.inner.admit(ticket, key, decoded, cost)
    }

    /// Callback form of [`get`](Self::get); `completion` runs on `target`
    pub fn get_with<D, C, F>(
        &self,
        key: &str,
        decode: D,
        cost: C,
        target: Arc<dyn CompletionTarget>,
        completion: F,
    ) where
        D: FnOnce(Vec<u8>) -> Option<V> + Send + 'static,
        C: FnOnce(&V) -> u64 + Send + 'static,
        F: FnOnce(Option<V>) + Send + 'static,
    {
        let cache = self.clone();
        let key = key.to_string();
        self.inner.runtime.spawn(async move {
            let value = cache.get(&key, decode, cost).await;
            target.deliver(Box::new(move || completion(value)));
        });
    }

    /// [`get_with`](Self::get_with) delivering on the default target
    pub fn fetch<D, C, F>(&self, key: &str, decode: D, cost: C, completion: F)
    where
        D: FnOnce(Vec<u8>) -> Option<V> + Send + 'static,
        C: FnOnce(&V) -> u64 + Send + 'static,
        F: FnOnce(Option<V>) + Send + 'static,
    {
        self.get_with(key, decode, cost, self.default_target(), completion);
    }

    /// Synchronous lookup; decoding runs on the calling thread.
    ///
    /// Parks the caller while the disk worker runs the read, so it must
    /// not be called from inside an async context.
    pub fn get_blocking<D, C>(&self, key: &str, decode: D, cost: C) -> Option<V>
    where
        D: FnOnce(Vec<u8>) -> Option<V>,
        C: FnOnce(&V) -> u64,
    {
        if let Some(value) = self.inner.memory_get(key) {
            return Some(value);
        }
        let ticket = match self.inner.begin_disk_read(key) {
            Ok(ticket) => ticket,
            Err(value) => return Some(value),
        };

        let owned = key.to_string();
        let read = self.inner.disk.run_blocking(move |storage| storage.get(&owned));
        let data = self.inner.disk_read_outcome(key, read)?;
        self.inner.admit(ticket, key, decode(data), cost)
    }

    // ---- writes ----

    /// Store `value` in memory and persist already-encoded `data`
    pub fn put_data(&self, key: &str, value: V, cost: u64, data: Vec<u8>) {
        self.inner.memory_set(key, value, cost);
        self.inner.enqueue_write(key, Payload::Ready(data));
    }

    /// Store `value` in memory and persist whatever `encode` produces.
    ///
    /// Encoding runs on the blocking pool. The write keeps its place in the
    /// disk queue from the moment of this call, so later operations on the
    /// same key still observe it. An encoder returning `None` skips the
    /// disk write.
    ///
    /// The disk worker waits for the encoder once it reaches this write, so
    /// a slow encoder delays every disk operation queued after it, on any
    /// key. Encode up front and use [`put_data`](Self::put_data) when that
    /// matters.
    pub fn put_encoded<E>(&self, key: &str, value: V, cost: u64, encode: E)
    where
        E: FnOnce(&V) -> Option<Vec<u8>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.inner.memory_set(key, value.clone(), cost);
        self.inner.enqueue_write(key, Payload::Encoding(rx));
        self.inner.runtime.spawn_blocking(move || {
            let _ = tx.send(encode(&value));
        });
    }

    /// Store `value` in the memory tier only
    pub fn put_memory(&self, key: &str, value: V, cost: u64) {
        self.inner.memory_set(key, value, cost);
    }

    // ---- removal ----

    pub fn remove(&self, key: &str) {
        if let Some(memory) = &self.inner.memory {
            self.inner.fence.write(key, || memory.remove(key));
        }
        let owned = key.to_string();
        self.inner.enqueue(DiskOperation::Remove, Some(key), move |storage| {
            storage.remove(&owned)
        });
    }

    pub fn remove_many<S: AsRef<str>>(&self, keys: &[S]) {
        let keys: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
        if let Some(memory) = &self.inner.memory {
            self.inner.fence.write_many(&keys, || {
                for key in &keys {
                    memory.remove(key);
                }
            });
        }
        self.inner.enqueue(DiskOperation::Remove, None, move |storage| {
            storage.remove_many(&keys)
        });
    }

    /// Empty the memory tier now and the disk tier asynchronously
    pub fn remove_all(&self) {
        if let Some(memory) = &self.inner.memory {
            self.inner.fence.write_all(|| memory.remove_all());
        }
        self.inner
            .enqueue(DiskOperation::RemoveAll, None, |storage| storage.remove_all());
    }

    // ---- metadata ----

    /// Metadata of a disk entry; `None` when the entry or its metadata is
    /// absent, or the read failed
    pub async fn metadata(&self, key: &str) -> Option<Metadata> {
        let owned = key.to_string();
        let result = self
            .inner
            .disk
            .run(move |storage| storage.metadata(&owned))
            .await;
        self.inner.metadata_outcome(key, result)
    }

    /// Synchronous [`metadata`](Self::metadata); not for async contexts
    pub fn metadata_blocking(&self, key: &str) -> Option<Metadata> {
        let owned = key.to_string();
        let result = self
            .inner
            .disk
            .run_blocking(move |storage| storage.metadata(&owned));
        self.inner.metadata_outcome(key, result)
    }

    /// Replace the metadata of an existing entry
    pub fn set_metadata(&self, key: &str, metadata: Metadata) {
        let owned = key.to_string();
        self.inner.enqueue(DiskOperation::Metadata, Some(key), move |storage| {
            storage.set_metadata(&owned, &metadata)
        });
    }

    /// Merge `values` into the metadata of an existing entry
    pub fn merge_metadata(&self, key: &str, values: Metadata) {
        let owned = key.to_string();
        self.inner.enqueue(DiskOperation::Metadata, Some(key), move |storage| {
            storage.merge_metadata(&owned, &values)
        });
    }

    pub fn remove_metadata(&self, key: &str) {
        let owned = key.to_string();
        self.inner.enqueue(DiskOperation::Metadata, Some(key), move |storage| {
            storage.remove_metadata(&owned)
        });
    }

    // ---- disk queries ----

    pub async fn contains(&self, key: &str) -> Result<bool> {
        let owned = key.to_string();
        self.inner
            .disk
            .run(move |storage| storage.contains(&owned))
            .await?
    }

    /// Recorded disk size of `key`
    pub async fn size_of(&self, key: &str) -> Result<Option<u64>> {
        let owned = key.to_string();
        self.inner
            .disk
            .run(move |storage| storage.size_of(&owned))
            .await
    }

    /// Total bytes held by the disk tier
    pub async fn disk_size(&self) -> Result<u64> {
        self.inner.disk.run(|storage| storage.total_size()).await
    }

    pub async fn disk_stats(&self) -> Result<DiskStats> {
        self.inner.disk.run(|storage| storage.stats()).await
    }

    // ---- cleanup ----

    /// Queue one sweep with the configured capacity and trim ratio
    pub fn cleanup_disk(&self) {
        if let Err(e) = enqueue_sweep(&self.inner.disk, &self.inner.reporter, &self.inner.counters)
        {
            self.inner.reporter.report(DiskOperation::Sweep, None, e);
        }
    }

    /// Run one sweep and wait for its report
    pub async fn sweep_now(&self) -> Result<SweepReport> {
        let report = self.inner.disk.run(|storage| storage.cleanup()).await??;
        count_sweep(&report, &self.inner.counters);
        Ok(report)
    }

    pub fn cleanup_enabled(&self) -> bool {
        self.inner.cleanup.is_enabled()
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.inner.cleanup.interval()
    }

    pub fn set_cleanup_enabled(&self, enabled: bool) {
        self.inner.cleanup.set_enabled(enabled);
    }

    pub fn set_cleanup_interval(&self, interval: Duration) {
        self.inner.cleanup.set_interval(interval);
    }

    // ---- observability ----

    /// Wait until every disk operation issued before this call has finished
    pub async fn flush(&self) -> Result<()> {
        self.inner.disk.drain().await
    }

    /// Disk operations queued but not yet finished
    pub fn pending_operations(&self) -> usize {
        self.inner.disk.queued()
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<DiskFailure> {
        self.inner.reporter.subscribe()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.counters.snapshot()
    }
}

impl<V: Clone + Send + Sync + 'static> Inner<V> {
    fn memory_get(&self, key: &str) -> Option<V> {
        let value = self.memory.as_ref()?.get(key)?;
        CacheCounters::incr(&self.counters.memory_hits);
        Some(value)
    }

    fn memory_set(&self, key: &str, value: V, cost: u64) {
        if let Some(memory) = &self.memory {
            self.fence.write(key, || memory.set(key, value, cost));
        }
    }

    /// Register a disk read of `key` after a memory miss.
    ///
    /// Memory is checked once more after registering, so a put that landed
    /// between the first lookup and the registration is returned instead.
    fn begin_disk_read(&self, key: &str) -> std::result::Result<FenceTicket<'_>, V> {
        let ticket = self.fence.enter(key);
        match self.memory_get(key) {
            Some(value) => Err(value),
            None => Ok(ticket),
        }
    }

    fn disk_read_outcome(
        &self,
        key: &str,
        read: Result<Result<Option<Vec<u8>>>>,
    ) -> Option<Vec<u8>> {
        match read {
            Ok(Ok(Some(data))) => Some(data),
            Ok(Ok(None)) => {
                CacheCounters::incr(&self.counters.misses);
                None
            }
            Ok(Err(e)) | Err(e) => {
                CacheCounters::incr(&self.counters.misses);
                self.reporter.report(DiskOperation::Read, Some(key), e);
                None
            }
        }
    }

    /// Count a decoded disk read and promote it into memory.
    ///
    /// A read overtaken by a put or remove of the same key leaves memory
    /// alone and prefers whatever memory holds now.
    fn admit<C>(
        &self,
        ticket: FenceTicket<'_>,
        key: &str,
        decoded: Option<V>,
        cost: C,
    ) -> Option<V>
    where
        C: FnOnce(&V) -> u64,
    {
        match decoded {
            Some(value) => {
                CacheCounters::incr(&self.counters.disk_hits);
                let Some(memory) = &self.memory else {
                    return Some(value);
                };
                ticket.settle(|current| {
                    if current {
                        memory.set(key, value.clone(), cost(&value));
                        return Some(value);
                    }
                    debug!(key = %key, "Memory changed during disk read; not promoting");
                    Some(memory.get(key).unwrap_or(value))
                })
            }
            None => {
                debug!(key = %key, "Disk entry could not be decoded; treating as miss");
                CacheCounters::incr(&self.counters.decode_failures);
                CacheCounters::incr(&self.counters.misses);
                None
            }
        }
    }

    fn metadata_outcome(
        &self,
        key: &str,
        result: Result<Result<Option<Metadata>>>,
    ) -> Option<Metadata> {
        match result {
            Ok(Ok(metadata)) => metadata,
            Ok(Err(e)) | Err(e) => {
                self.reporter.report(DiskOperation::Metadata, Some(key), e);
                None
            }
        }
    }

    /// Queue a fire-and-forget disk job whose error goes to the failure channel
    fn enqueue<F>(&self, operation: DiskOperation, key: Option<&str>, job: F)
    where
        F: FnOnce(&mut DiskStorage) -> Result<()> + Send + 'static,
    {
        let reporter = self.reporter.clone();
        let job_key = key.map(str::to_string);
        let queued = self.disk.execute(move |storage| {
            if let Err(e) = job(storage) {
                reporter.report(operation, job_key.as_deref(), e);
            }
        });
        if let Err(e) = queued {
            self.reporter.report(operation, key, e);
        }
    }

    fn enqueue_write(&self, key: &str, payload: Payload) {
        let reporter = self.reporter.clone();
        let counters = Arc::clone(&self.counters);
        let owned = key.to_string();
        let queued = self.disk.execute(move |storage| {
            let data = match payload {
                Payload::Ready(data) => data,
                Payload::Encoding(rx) => match rx.blocking_recv() {
                    Ok(Some(data)) => data,
                    Ok(None) => {
                        debug!(key = %owned, "Encoder produced no data; skipping disk write");
                        return;
                    }
                    Err(_) => {
                        reporter.report(
                            DiskOperation::Encode,
                            Some(&owned),
                            CacheError::Codec("encoder did not finish".to_string()),
                        );
                        return;
                    }
                },
            };

            match storage.put(&owned, &data) {
                Ok(()) => CacheCounters::incr(&counters.writes),
                Err(e) => reporter.report(DiskOperation::Write, Some(&owned), e),
            }
        });
        if let Err(e) = queued {
            self.reporter.report(DiskOperation::Write, Some(key), e);
        }
    }
}
