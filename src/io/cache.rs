use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use lru::LruCache;

use super::locks::KeyLocks;
use super::{IoOps, MetadataMutator, ObjectAndMetadataMutator, ObjectMutator};
use crate::error::IoError;
use crate::keys::{MetaKey, Metadata, ObjectKey, ObjectOffset};
use crate::metrics::SharedMetrics;
use crate::object::FdsObject;

/// Read-through, write-through LRU cache of metadata and chunks.
///
/// Every write and mutation goes to the inner layer first and only then
/// updates the cache, under the blob lock, so the cache never holds a value
/// the inner layer rejected. Deletes and renames evict every cached entry of
/// the blobs involved. Scans bypass the cache.
///
/// Before serving a blob the cache asks the inner layer for failures
/// recorded against it after the fact, and drops the blob's entries when
/// there is one.
pub struct IoCache {
    inner: Arc<dyn IoOps>,
    metadata: Mutex<LruCache<MetaKey, Metadata>>,
    objects: Mutex<LruCache<ObjectKey, FdsObject>>,
    locks: KeyLocks<MetaKey>,
    metrics: SharedMetrics,
}

impl IoCache {
    pub fn new(inner: Arc<dyn IoOps>, metadata_entries: usize, object_entries: usize) -> Self {
        Self::with_metrics(inner, metadata_entries, object_entries, SharedMetrics::default())
    }

    pub fn with_metrics(
        inner: Arc<dyn IoOps>,
        metadata_entries: usize,
        object_entries: usize,
        metrics: SharedMetrics,
    ) -> Self {
        let capacity = |n: usize| NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            metadata: Mutex::new(LruCache::new(capacity(metadata_entries))),
            objects: Mutex::new(LruCache::new(capacity(object_entries))),
            locks: KeyLocks::new(),
            metrics,
        }
    }

    fn metadata_cache(&self) -> MutexGuard<'_, LruCache<MetaKey, Metadata>> {
        self.metadata.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn object_cache(&self) -> MutexGuard<'_, LruCache<ObjectKey, FdsObject>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cached_metadata(&self, key: &MetaKey) -> Option<Metadata> {
        self.metadata_cache().get(key).cloned()
    }

    fn cached_object(&self, key: &ObjectKey, max_object_size: usize) -> Option<FdsObject> {
        self.object_cache()
            .get(key)
            .filter(|o| o.max_object_size() == max_object_size)
            .cloned()
    }

    fn evict_blob(&self, blob: &MetaKey) {
        self.metadata_cache().pop(blob);
        self.evict_objects(blob, ObjectOffset::default());
    }

    fn evict_objects(&self, blob: &MetaKey, first: ObjectOffset) {
        let mut objects = self.object_cache();
        let stale: Vec<ObjectKey> = objects
            .iter()
            .map(|(k, _)| k)
            .filter(|k| k.begins_with(blob) && k.offset() >= first)
            .cloned()
            .collect();
        for key in stale {
            objects.pop(&key);
        }
    }

    async fn check_failure(&self, blob: &MetaKey) -> Result<(), IoError> {
        if let Err(e) = self.inner.take_failure(blob).await {
            self.evict_blob(blob);
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl IoOps for IoCache {
    async fn read_metadata(&self, key: &MetaKey) -> Result<Option<Metadata>, IoError> {
        self.check_failure(key).await?;
        let cached = self.cached_metadata(key);
        if cached.is_some() {
            self.metrics.cache_hit();
            return Ok(cached);
        }

        let _guard = self.locks.lock(key).await;
        let cached = self.cached_metadata(key);
        if cached.is_some() {
            self.metrics.cache_hit();
            return Ok(cached);
        }
        self.metrics.cache_miss();
        let metadata = self.inner.read_metadata(key).await?;
        if let Some(metadata) = &metadata {
            self.metadata_cache().put(key.clone(), metadata.clone());
        }
        Ok(metadata)
    }

    async fn write_metadata(&self, key: &MetaKey, metadata: Metadata) -> Result<(), IoError> {
        self.check_failure(key).await?;
        let _guard = self.locks.lock(key).await;
        self.inner.write_metadata(key, metadata.clone()).await?;
        self.metadata_cache().put(key.clone(), metadata);
        Ok(())
    }

    async fn read_object(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
    ) -> Result<Option<FdsObject>, IoError> {
        self.check_failure(key.blob()).await?;
        let cached = self.cached_object(key, max_object_size);
        if cached.is_some() {
            self.metrics.cache_hit();
            return Ok(cached);
        }

        let _guard = self.locks.lock(key.blob()).await;
        let cached = self.cached_object(key, max_object_size);
        if cached.is_some() {
            self.metrics.cache_hit();
            return Ok(cached);
        }
        self.metrics.cache_miss();
        let object = self.inner.read_object(key, max_object_size).await?;
        if let Some(object) = &object {
            self.object_cache().put(key.clone(), object.clone());
        }
        Ok(object)
    }

    async fn write_object(&self, key: &ObjectKey, object: FdsObject) -> Result<(), IoError> {
        self.check_failure(key.blob()).await?;
        let _guard = self.locks.lock(key.blob()).await;
        self.inner.write_object(key, object.clone()).await?;
        self.object_cache().put(key.clone(), object);
        Ok(())
    }

    async fn delete_blob(&self, key: &MetaKey) -> Result<(), IoError> {
        let _guard = self.locks.lock(key).await;
        let result = self.inner.delete_blob(key).await;
        self.evict_blob(key);
        result
    }

    async fn delete_objects_from(
        &self,
        blob: &MetaKey,
        first: ObjectOffset,
    ) -> Result<(), IoError> {
        let _guard = self.locks.lock(blob).await;
        let result = self.inner.delete_objects_from(blob, first).await;
        self.evict_objects(blob, first);
        result
    }

    async fn rename_blob(&self, key: &MetaKey, new_name: &str) -> Result<(), IoError> {
        self.check_failure(key).await?;
        let target = key.with_blob_name(new_name);
        let _guards = self.locks.lock_pair(key, &target).await;
        let result = self.inner.rename_blob(key, new_name).await;
        self.evict_blob(key);
        self.evict_blob(&target);
        result
    }

    async fn scan(&self, prefix: &MetaKey) -> Result<Vec<(MetaKey, Metadata)>, IoError> {
        self.inner.scan(prefix).await
    }

    async fn read_object_and_metadata(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
    ) -> Result<(Option<FdsObject>, Option<Metadata>), IoError> {
        self.check_failure(key.blob()).await?;
        let _guard = self.locks.lock(key.blob()).await;
        let object = self.cached_object(key, max_object_size);
        let metadata = self.cached_metadata(key.blob());
        if object.is_some() && metadata.is_some() {
            self.metrics.cache_hit();
            return Ok((object, metadata));
        }

        self.metrics.cache_miss();
        let (object, metadata) = self
            .inner
            .read_object_and_metadata(key, max_object_size)
            .await?;
        if let Some(object) = &object {
            self.object_cache().put(key.clone(), object.clone());
        }
        if let Some(metadata) = &metadata {
            self.metadata_cache().put(key.blob().clone(), metadata.clone());
        }
        Ok((object, metadata))
    }

    async fn mutate_metadata(
        &self,
        key: &MetaKey,
        mutator: MetadataMutator,
    ) -> Result<Metadata, IoError> {
        self.check_failure(key).await?;
        let _guard = self.locks.lock(key).await;
        let metadata = self.inner.mutate_metadata(key, mutator).await?;
        self.metadata_cache().put(key.clone(), metadata.clone());
        Ok(metadata)
    }

    async fn mutate_object(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
        mutator: ObjectMutator,
    ) -> Result<FdsObject, IoError> {
        self.check_failure(key.blob()).await?;
        let _guard = self.locks.lock(key.blob()).await;
        let object = self.inner.mutate_object(key, max_object_size, mutator).await?;
        self.object_cache().put(key.clone(), object.clone());
        Ok(object)
    }

    async fn mutate_object_and_metadata(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
        mutator: ObjectAndMetadataMutator,
    ) -> Result<(FdsObject, Metadata), IoError> {
        self.check_failure(key.blob()).await?;
        let _guard = self.locks.lock(key.blob()).await;
        let (object, metadata) = self
            .inner
            .mutate_object_and_metadata(key, max_object_size, mutator)
            .await?;
        self.object_cache().put(key.clone(), object.clone());
        self.metadata_cache()
            .put(key.blob().clone(), metadata.clone());
        Ok((object, metadata))
    }

    async fn flush(&self) -> Result<(), IoError> {
        let result = self.inner.flush().await;
        if let Err(e) = &result {
            // writes below may have been dropped; cached copies of them are stale
            if !e.is_transient() {
                self.metadata_cache().clear();
                self.object_cache().clear();
            }
        }
        result
    }

    async fn take_failure(&self, blob: &MetaKey) -> Result<(), IoError> {
        self.check_failure(blob).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::Counters;
    use crate::io::testing::{CountingIo, FlakyIo};
    use crate::io::MemoryIo;

    fn meta(value: &str) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("v".into(), value.into());
        metadata
    }

    #[tokio::test]
    async fn test_repeated_reads_hit_cache() {
        let counting = Arc::new(CountingIo::new(Arc::new(MemoryIo::new())));
        let counters = Arc::new(Counters::new());
        let cache = IoCache::with_metrics(
            counting.clone(),
            16,
            16,
            SharedMetrics::new(counters.clone()),
        );
        let key = MetaKey::new("d", "v", "a");
        cache.write_metadata(&key, meta("1")).await.unwrap();

        for _ in 0..3 {
            assert_eq!(cache.read_metadata(&key).await.unwrap(), Some(meta("1")));
        }
        assert_eq!(counting.count("read_metadata"), 0);
        assert_eq!(counters.get("cache_hits"), 3);
    }

    #[tokio::test]
    async fn test_miss_populates_cache() {
        let memory = Arc::new(MemoryIo::new());
        let key = MetaKey::new("d", "v", "a");
        memory
            .write_object(&key.object(0), FdsObject::new(vec![3u8], 4).unwrap())
            .await
            .unwrap();
        let counting = Arc::new(CountingIo::new(memory));
        let cache = IoCache::new(counting.clone(), 16, 16);

        assert!(cache.read_object(&key.object(0), 4).await.unwrap().is_some());
        assert!(cache.read_object(&key.object(0), 4).await.unwrap().is_some());
        assert_eq!(counting.count("read_object"), 1);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_cache_untouched() {
        let flaky = Arc::new(FlakyIo::new(Arc::new(MemoryIo::new())));
        let cache = IoCache::new(flaky.clone(), 16, 16);
        let key = MetaKey::new("d", "v", "a");
        cache.write_metadata(&key, meta("1")).await.unwrap();

        flaky.fail_next(1, IoError::Backend("rejected".into()));
        assert!(cache.write_metadata(&key, meta("2")).await.is_err());
        assert_eq!(cache.read_metadata(&key).await.unwrap(), Some(meta("1")));
    }

    #[tokio::test]
    async fn test_delete_and_rename_evict() {
        let memory = Arc::new(MemoryIo::new());
        let cache = IoCache::new(memory.clone(), 16, 16);
        let a = MetaKey::new("d", "v", "a");
        cache.write_metadata(&a, meta("1")).await.unwrap();
        cache
            .write_object(&a.object(0), FdsObject::new(vec![1u8], 4).unwrap())
            .await
            .unwrap();

        cache.rename_blob(&a, "b").await.unwrap();
        assert_eq!(cache.read_metadata(&a).await.unwrap(), None);
        assert_eq!(cache.read_object(&a.object(0), 4).await.unwrap(), None);

        let b = MetaKey::new("d", "v", "b");
        assert_eq!(cache.read_metadata(&b).await.unwrap(), Some(meta("1")));
        cache.delete_blob(&b).await.unwrap();
        assert_eq!(cache.read_metadata(&b).await.unwrap(), None);
        assert_eq!(cache.read_object(&b.object(0), 4).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_capacity_bounds_entries() {
        let counting = Arc::new(CountingIo::new(Arc::new(MemoryIo::new())));
        let cache = IoCache::new(counting.clone(), 2, 2);
        for name in ["a", "b", "c"] {
            cache
                .write_metadata(&MetaKey::new("d", "v", name), meta(name))
                .await
                .unwrap();
        }
        cache.read_metadata(&MetaKey::new("d", "v", "a")).await.unwrap();
        assert_eq!(counting.count("read_metadata"), 1);
    }
}
