//! Instrumented backends for unit tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::IoOps;
use crate::counters::Counters;
use crate::error::IoError;
use crate::keys::{MetaKey, Metadata, ObjectKey, ObjectOffset};
use crate::object::FdsObject;

/// Forwards to an inner backend and counts every primitive call by name.
///
/// Compound operations are left to the trait defaults, so they show up as
/// the reads and writes they are made of.
pub(crate) struct CountingIo {
    inner: Arc<dyn IoOps>,
    pub(crate) calls: Counters,
}

impl CountingIo {
    pub(crate) fn new(inner: Arc<dyn IoOps>) -> Self {
        Self {
            inner,
            calls: Counters::new(),
        }
    }

    pub(crate) fn count(&self, op: &str) -> i64 {
        self.calls.get(op)
    }
}

#[async_trait]
impl IoOps for CountingIo {
    async fn read_metadata(&self, key: &MetaKey) -> Result<Option<Metadata>, IoError> {
        self.calls.increment("read_metadata");
        self.inner.read_metadata(key).await
    }

    async fn write_metadata(&self, key: &MetaKey, metadata: Metadata) -> Result<(), IoError> {
        self.calls.increment("write_metadata");
        self.inner.write_metadata(key, metadata).await
    }

    async fn read_object(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
    ) -> Result<Option<FdsObject>, IoError> {
        self.calls.increment("read_object");
        self.inner.read_object(key, max_object_size).await
    }

    async fn write_object(&self, key: &ObjectKey, object: FdsObject) -> Result<(), IoError> {
        self.calls.increment("write_object");
        self.inner.write_object(key, object).await
    }

    async fn delete_blob(&self, key: &MetaKey) -> Result<(), IoError> {
        self.calls.increment("delete_blob");
        self.inner.delete_blob(key).await
    }

    async fn delete_objects_from(
        &self,
        blob: &MetaKey,
        first: ObjectOffset,
    ) -> Result<(), IoError> {
        self.calls.increment("delete_objects_from");
        self.inner.delete_objects_from(blob, first).await
    }

    async fn rename_blob(&self, key: &MetaKey, new_name: &str) -> Result<(), IoError> {
        self.calls.increment("rename_blob");
        self.inner.rename_blob(key, new_name).await
    }

    async fn scan(&self, prefix: &MetaKey) -> Result<Vec<(MetaKey, Metadata)>, IoError> {
        self.calls.increment("scan");
        self.inner.scan(prefix).await
    }
}

/// Injects failures in front of an inner backend.
pub(crate) struct FlakyIo {
    inner: Arc<dyn IoOps>,
    remaining: AtomicU32,
    error: Mutex<Option<IoError>>,
    metadata_write_error: Mutex<Option<IoError>>,
    calls: AtomicU32,
}

impl FlakyIo {
    pub(crate) fn new(inner: Arc<dyn IoOps>) -> Self {
        Self {
            inner,
            remaining: AtomicU32::new(0),
            error: Mutex::new(None),
            metadata_write_error: Mutex::new(None),
            calls: AtomicU32::new(0),
        }
    }

    /// The next `times` calls, of any operation, fail with `error`.
    pub(crate) fn fail_next(&self, times: u32, error: IoError) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
        self.remaining.store(times, Ordering::SeqCst);
    }

    /// Every metadata write fails with `error` from now on.
    pub(crate) fn fail_metadata_writes(&self, error: IoError) {
        *self
            .metadata_write_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn trip(&self) -> Result<(), IoError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let armed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            if let Some(error) = self.error.lock().unwrap_or_else(PoisonError::into_inner).clone() {
                return Err(error);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IoOps for FlakyIo {
    async fn read_metadata(&self, key: &MetaKey) -> Result<Option<Metadata>, IoError> {
        self.trip()?;
        self.inner.read_metadata(key).await
    }

    async fn write_metadata(&self, key: &MetaKey, metadata: Metadata) -> Result<(), IoError> {
        self.trip()?;
        let injected = self
            .metadata_write_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(error) = injected {
            return Err(error);
        }
        self.inner.write_metadata(key, metadata).await
    }

    async fn read_object(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
    ) -> Result<Option<FdsObject>, IoError> {
        self.trip()?;
        self.inner.read_object(key, max_object_size).await
    }

    async fn write_object(&self, key: &ObjectKey, object: FdsObject) -> Result<(), IoError> {
        self.trip()?;
        self.inner.write_object(key, object).await
    }

    async fn delete_blob(&self, key: &MetaKey) -> Result<(), IoError> {
        self.trip()?;
        self.inner.delete_blob(key).await
    }

    async fn delete_objects_from(
        &self,
        blob: &MetaKey,
        first: ObjectOffset,
    ) -> Result<(), IoError> {
        self.trip()?;
        self.inner.delete_objects_from(blob, first).await
    }

    async fn rename_blob(&self, key: &MetaKey, new_name: &str) -> Result<(), IoError> {
        self.trip()?;
        self.inner.rename_blob(key, new_name).await
    }

    async fn scan(&self, prefix: &MetaKey) -> Result<Vec<(MetaKey, Metadata)>, IoError> {
        self.trip()?;
        self.inner.scan(prefix).await
    }
}
