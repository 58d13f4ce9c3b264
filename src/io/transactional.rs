use std::sync::Arc;

use async_trait::async_trait;

use super::locks::KeyLocks;
use super::{
    apply_metadata_mutation, apply_object_and_metadata_mutation, apply_object_mutation, IoOps,
    MetadataMutator, ObjectAndMetadataMutator, ObjectMutator,
};
use crate::error::IoError;
use crate::keys::{MetaKey, Metadata, ObjectKey, ObjectOffset};
use crate::object::FdsObject;

/// Serializes every mutation of a blob behind a per-blob lock.
///
/// Chunk and metadata operations of the same blob share one lock, so a
/// read-modify-write is never interleaved with another write to that blob.
/// Plain reads go straight through; combined reads take the lock to observe
/// a chunk and its metadata at the same instant.
pub struct TransactionalIo {
    inner: Arc<dyn IoOps>,
    locks: KeyLocks<MetaKey>,
}

impl TransactionalIo {
    pub fn new(inner: Arc<dyn IoOps>) -> Self {
        Self {
            inner,
            locks: KeyLocks::new(),
        }
    }
}

#[async_trait]
impl IoOps for TransactionalIo {
    async fn read_metadata(&self, key: &MetaKey) -> Result<Option<Metadata>, IoError> {
        self.inner.read_metadata(key).await
    }

    async fn write_metadata(&self, key: &MetaKey, metadata: Metadata) -> Result<(), IoError> {
        let _guard = self.locks.lock(key).await;
        self.inner.write_metadata(key, metadata).await
    }

    async fn read_object(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
    ) -> Result<Option<FdsObject>, IoError> {
        self.inner.read_object(key, max_object_size).await
    }

    async fn write_object(&self, key: &ObjectKey, object: FdsObject) -> Result<(), IoError> {
        let _guard = self.locks.lock(key.blob()).await;
        self.inner.write_object(key, object).await
    }

    async fn delete_blob(&self, key: &MetaKey) -> Result<(), IoError> {
        let _guard = self.locks.lock(key).await;
        self.inner.delete_blob(key).await
    }

    async fn delete_objects_from(
        &self,
        blob: &MetaKey,
        first: ObjectOffset,
    ) -> Result<(), IoError> {
        let _guard = self.locks.lock(blob).await;
        self.inner.delete_objects_from(blob, first).await
    }

    async fn rename_blob(&self, key: &MetaKey, new_name: &str) -> Result<(), IoError> {
        let target = key.with_blob_name(new_name);
        let _guards = self.locks.lock_pair(key, &target).await;
        self.inner.rename_blob(key, new_name).await
    }

    async fn scan(&self, prefix: &MetaKey) -> Result<Vec<(MetaKey, Metadata)>, IoError> {
        self.inner.scan(prefix).await
    }

    async fn read_object_and_metadata(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
    ) -> Result<(Option<FdsObject>, Option<Metadata>), IoError> {
        let _guard = self.locks.lock(key.blob()).await;
        self.inner.read_object_and_metadata(key, max_object_size).await
    }

    async fn mutate_metadata(
        &self,
        key: &MetaKey,
        mutator: MetadataMutator,
    ) -> Result<Metadata, IoError> {
        let _guard = self.locks.lock(key).await;
        apply_metadata_mutation(self.inner.as_ref(), key, &mutator).await
    }

    async fn mutate_object(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
        mutator: ObjectMutator,
    ) -> Result<FdsObject, IoError> {
        let _guard = self.locks.lock(key.blob()).await;
        apply_object_mutation(self.inner.as_ref(), key, max_object_size, &mutator).await
    }

    async fn mutate_object_and_metadata(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
        mutator: ObjectAndMetadataMutator,
    ) -> Result<(FdsObject, Metadata), IoError> {
        let _guard = self.locks.lock(key.blob()).await;
        apply_object_and_metadata_mutation(self.inner.as_ref(), key, max_object_size, &mutator)
            .await
    }

    async fn flush(&self) -> Result<(), IoError> {
        self.inner.flush().await
    }

    async fn take_failure(&self, blob: &MetaKey) -> Result<(), IoError> {
        self.inner.take_failure(blob).await
    }
}
