use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use tracing::{debug, error, warn};

use super::locks::KeyLocks;
use super::{IoOps, MetadataMutator, ObjectAndMetadataMutator, ObjectMutator};
use crate::error::IoError;
use crate::keys::{MetaKey, Metadata, ObjectKey, ObjectOffset};
use crate::metrics::SharedMetrics;
use crate::object::FdsObject;

/// Write-behind layer.
///
/// Writes are acknowledged once buffered and become visible to reads through
/// this layer at once. Buffered entries reach the inner layer after the flush
/// window elapses, when the buffer exceeds its bound, or on [`IoOps::flush`].
/// The flush task keeps the layer alive, so entries still reach the inner
/// layer when every handle is dropped inside the window.
///
/// A flush that fails transiently puts its entries back for the next
/// attempt. Any other failure means the inner layer refused the writes: the
/// blob's entries are dropped and the error is returned by the next
/// operation on that blob, or by the next [`IoOps::flush`], whichever comes
/// first.
pub struct DeferredIoOps {
    state: Arc<DeferredState>,
}

struct DeferredState {
    inner: Arc<dyn IoOps>,
    pending: Mutex<Pending>,
    locks: KeyLocks<MetaKey>,
    window: Duration,
    max_pending: usize,
    metrics: SharedMetrics,
}

type BufferedBlob = (Option<Metadata>, Vec<(ObjectKey, FdsObject)>);

#[derive(Default)]
struct Pending {
    metadata: HashMap<MetaKey, Metadata>,
    objects: BTreeMap<ObjectKey, FdsObject>,
    /// Refusals from background flushes not reported yet.
    failed: HashMap<MetaKey, IoError>,
    flush_scheduled: bool,
}

impl Pending {
    fn len(&self) -> usize {
        self.metadata.len() + self.objects.len()
    }

    fn blobs(&self) -> BTreeSet<MetaKey> {
        self.metadata
            .keys()
            .cloned()
            .chain(self.objects.keys().map(|k| k.blob().clone()))
            .collect()
    }

    fn take_objects(
        &mut self,
        blob: &MetaKey,
        first: ObjectOffset,
    ) -> Vec<(ObjectKey, FdsObject)> {
        let keys: Vec<ObjectKey> = self
            .objects
            .range(blob.object(first)..)
            .map(|(k, _)| k)
            .take_while(|k| k.begins_with(blob))
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|k| self.objects.remove(&k).map(|o| (k, o)))
            .collect()
    }

    fn take_blob(&mut self, blob: &MetaKey) -> BufferedBlob {
        let objects = self.take_objects(blob, ObjectOffset::default());
        (self.metadata.remove(blob), objects)
    }

    /// Puts taken entries back unless newer ones took their place.
    fn restore(&mut self, blob: &MetaKey, (metadata, objects): BufferedBlob) {
        for (key, object) in objects {
            self.objects.entry(key).or_insert(object);
        }
        if let Some(metadata) = metadata {
            self.metadata.entry(blob.clone()).or_insert(metadata);
        }
    }
}

impl DeferredIoOps {
    pub fn new(inner: Arc<dyn IoOps>, window: Duration, max_pending: usize) -> Self {
        Self::with_metrics(inner, window, max_pending, SharedMetrics::default())
    }

    pub fn with_metrics(
        inner: Arc<dyn IoOps>,
        window: Duration,
        max_pending: usize,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            state: Arc::new(DeferredState {
                inner,
                pending: Mutex::new(Pending::default()),
                locks: KeyLocks::new(),
                window,
                max_pending: max_pending.max(1),
                metrics,
            }),
        }
    }

    /// Number of buffered metadata records and chunks.
    pub fn pending(&self) -> usize {
        self.state.pending().len()
    }
}

impl DeferredState {
    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(&self, blob: &MetaKey) -> Result<(), IoError> {
        match self.pending().failed.remove(blob) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Arranges for buffered entries to reach the inner layer: immediately
    /// once the buffer is over its bound, otherwise after the window.
    fn schedule(self: &Arc<Self>) {
        let (overflowing, start_timer) = {
            let mut pending = self.pending();
            if pending.len() == 0 {
                return;
            }
            let overflowing = pending.len() > self.max_pending;
            let start_timer = !overflowing && !pending.flush_scheduled;
            if start_timer {
                pending.flush_scheduled = true;
            }
            (overflowing, start_timer)
        };

        if overflowing {
            let state = Arc::clone(self);
            tokio::spawn(state.background_flush());
        } else if start_timer {
            let state = Arc::clone(self);
            let window = self.window;
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                state.pending().flush_scheduled = false;
                state.background_flush().await;
            });
        }
    }

    async fn background_flush(self: Arc<Self>) {
        if let Err(e) = self.flush_all().await {
            error!(error = %e, "deferred flush failed");
        }
        // every handle is gone: nothing else will make these writes durable
        if Arc::strong_count(&self) == 1 {
            if let Err(e) = self.inner.flush().await {
                error!(error = %e, "final flush of dropped deferred layer failed");
            }
        }
        // picks up entries put back after a transient failure
        self.schedule();
    }

    async fn flush_all(&self) -> Result<(), IoError> {
        let blobs = self.pending().blobs();
        if blobs.is_empty() {
            return Ok(());
        }

        let results = join_all(blobs.iter().map(|blob| self.flush_blob(blob))).await;
        let mut flushed = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(n) => flushed += n,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if flushed > 0 {
            debug!(entries = flushed, blobs = blobs.len(), "flushed deferred writes");
            self.metrics.deferred_flush(flushed);
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Flushes one blob, recording a refusal against it.
    async fn flush_blob(&self, blob: &MetaKey) -> Result<usize, IoError> {
        let _guard = self.locks.lock(blob).await;
        let result = self.flush_blob_locked(blob).await;
        if let Err(e) = &result {
            if !e.is_transient() {
                self.pending().failed.insert(blob.clone(), e.clone());
            }
        }
        result
    }

    /// Writes a blob's buffered chunks, then its metadata. The caller holds
    /// the blob lock. Entries go back into the buffer after a transient
    /// failure and are dropped after any other.
    async fn flush_blob_locked(&self, blob: &MetaKey) -> Result<usize, IoError> {
        let (metadata, objects) = self.pending().take_blob(blob);
        let count = objects.len() + usize::from(metadata.is_some());
        if count == 0 {
            return Ok(0);
        }

        let written = try_join_all(
            objects
                .iter()
                .map(|(key, object)| self.inner.write_object(key, object.clone())),
        )
        .await;
        let result = match (written, &metadata) {
            (Ok(_), Some(metadata)) => self.inner.write_metadata(blob, metadata.clone()).await,
            (Ok(_), None) => Ok(()),
            (Err(e), _) => Err(e),
        };

        match result {
            Ok(()) => Ok(count),
            Err(e) if e.is_transient() => {
                self.pending().restore(blob, (metadata, objects));
                Err(e)
            }
            Err(e) => {
                warn!(
                    blob = %blob,
                    entries = count,
                    error = %e,
                    "inner layer refused deferred writes, dropping them"
                );
                Err(e)
            }
        }
    }

    /// Current metadata as seen through the buffer. The caller holds the
    /// blob lock.
    async fn current_metadata(&self, key: &MetaKey) -> Result<Option<Metadata>, IoError> {
        let buffered = self.pending().metadata.get(key).cloned();
        match buffered {
            Some(metadata) => Ok(Some(metadata)),
            None => self.inner.read_metadata(key).await,
        }
    }

    async fn current_object(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
    ) -> Result<Option<FdsObject>, IoError> {
        let buffered = self.pending().objects.get(key).cloned();
        match buffered {
            Some(object) => Ok(Some(object)),
            None => self.inner.read_object(key, max_object_size).await,
        }
    }
}

#[async_trait]
impl IoOps for DeferredIoOps {
    async fn read_metadata(&self, key: &MetaKey) -> Result<Option<Metadata>, IoError> {
        self.state.take_failure(key)?;
        let buffered = self.state.pending().metadata.get(key).cloned();
        if buffered.is_some() {
            return Ok(buffered);
        }
        let _guard = self.state.locks.lock(key).await;
        self.state.current_metadata(key).await
    }

    async fn write_metadata(&self, key: &MetaKey, metadata: Metadata) -> Result<(), IoError> {
        super::require_complete(key)?;
        self.state.take_failure(key)?;
        {
            let _guard = self.state.locks.lock(key).await;
            self.state.pending().metadata.insert(key.clone(), metadata);
        }
        self.state.schedule();
        Ok(())
    }

    async fn read_object(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
    ) -> Result<Option<FdsObject>, IoError> {
        self.state.take_failure(key.blob())?;
        let buffered = self.state.pending().objects.get(key).cloned();
        if buffered.is_some() {
            return Ok(buffered);
        }
        let _guard = self.state.locks.lock(key.blob()).await;
        self.state.current_object(key, max_object_size).await
    }

    async fn write_object(&self, key: &ObjectKey, object: FdsObject) -> Result<(), IoError> {
        super::require_complete(key.blob())?;
        self.state.take_failure(key.blob())?;
        {
            let _guard = self.state.locks.lock(key.blob()).await;
            self.state.pending().objects.insert(key.clone(), object);
        }
        self.state.schedule();
        Ok(())
    }

    /// Deleting a blob also clears a refusal recorded against it.
    async fn delete_blob(&self, key: &MetaKey) -> Result<(), IoError> {
        let _guard = self.state.locks.lock(key).await;
        let taken = {
            let mut pending = self.state.pending();
            pending.failed.remove(key);
            pending.take_blob(key)
        };
        let had_pending = taken.0.is_some() || !taken.1.is_empty();
        let result = match self.state.inner.delete_blob(key).await {
            Err(IoError::NotFound(_)) if had_pending => Ok(()),
            result => result,
        };
        if result.is_err() {
            self.state.pending().restore(key, taken);
        }
        result
    }

    async fn delete_objects_from(
        &self,
        blob: &MetaKey,
        first: ObjectOffset,
    ) -> Result<(), IoError> {
        self.state.take_failure(blob)?;
        let _guard = self.state.locks.lock(blob).await;
        let taken = self.state.pending().take_objects(blob, first);
        let result = self.state.inner.delete_objects_from(blob, first).await;
        if result.is_err() {
            self.state.pending().restore(blob, (None, taken));
        }
        result
    }

    async fn rename_blob(&self, key: &MetaKey, new_name: &str) -> Result<(), IoError> {
        self.state.take_failure(key)?;
        let target = key.with_blob_name(new_name);
        let _guards = self.state.locks.lock_pair(key, &target).await;
        self.state.flush_blob_locked(key).await?;
        if &target != key {
            self.state.flush_blob_locked(&target).await?;
        }
        self.state.inner.rename_blob(key, new_name).await
    }

    async fn scan(&self, prefix: &MetaKey) -> Result<Vec<(MetaKey, Metadata)>, IoError> {
        let buffered = |state: &DeferredState| -> Vec<(MetaKey, Metadata)> {
            state
                .pending()
                .metadata
                .iter()
                .filter(|(k, _)| k.begins_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        let before = buffered(&self.state);
        let mut merged: BTreeMap<MetaKey, Metadata> =
            self.state.inner.scan(prefix).await?.into_iter().collect();
        merged.extend(before);
        merged.extend(buffered(&self.state));
        Ok(merged.into_iter().collect())
    }

    async fn read_object_and_metadata(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
    ) -> Result<(Option<FdsObject>, Option<Metadata>), IoError> {
        self.state.take_failure(key.blob())?;
        let _guard = self.state.locks.lock(key.blob()).await;
        let object = self.state.current_object(key, max_object_size).await?;
        let metadata = self.state.current_metadata(key.blob()).await?;
        Ok((object, metadata))
    }

    async fn mutate_metadata(
        &self,
        key: &MetaKey,
        mutator: MetadataMutator,
    ) -> Result<Metadata, IoError> {
        super::require_complete(key)?;
        self.state.take_failure(key)?;
        let updated = {
            let _guard = self.state.locks.lock(key).await;
            let current = self.state.current_metadata(key).await?;
            let updated = mutator(current)?;
            self.state
                .pending()
                .metadata
                .insert(key.clone(), updated.clone());
            updated
        };
        self.state.schedule();
        Ok(updated)
    }

    async fn mutate_object(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
        mutator: ObjectMutator,
    ) -> Result<FdsObject, IoError> {
        super::require_complete(key.blob())?;
        self.state.take_failure(key.blob())?;
        let updated = {
            let _guard = self.state.locks.lock(key.blob()).await;
            let current = self.state.current_object(key, max_object_size).await?;
            let updated = mutator(current)?;
            self.state
                .pending()
                .objects
                .insert(key.clone(), updated.clone());
            updated
        };
        self.state.schedule();
        Ok(updated)
    }

    async fn mutate_object_and_metadata(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
        mutator: ObjectAndMetadataMutator,
    ) -> Result<(FdsObject, Metadata), IoError> {
        super::require_complete(key.blob())?;
        self.state.take_failure(key.blob())?;
        let updated = {
            let _guard = self.state.locks.lock(key.blob()).await;
            let object = self.state.current_object(key, max_object_size).await?;
            let metadata = self.state.current_metadata(key.blob()).await?;
            let (object, metadata) = mutator(object, metadata)?;
            let mut pending = self.state.pending();
            pending.objects.insert(key.clone(), object.clone());
            pending.metadata.insert(key.blob().clone(), metadata.clone());
            (object, metadata)
        };
        self.state.schedule();
        Ok(updated)
    }

    /// Writes every buffered entry through, then flushes the inner layer. A
    /// refusal recorded by an earlier background flush is returned here
    /// when no operation on its blob has reported it yet.
    async fn flush(&self) -> Result<(), IoError> {
        let flushed = self.state.flush_all().await;
        let failed = std::mem::take(&mut self.state.pending().failed);
        if let Some(e) = failed.into_values().next() {
            return Err(e);
        }
        flushed?;
        self.state.inner.flush().await
    }

    async fn take_failure(&self, blob: &MetaKey) -> Result<(), IoError> {
        self.state.take_failure(blob)
    }
}
