//! The IO capability interface and its decorators.
//!
//! Every layer implements [`IoOps`], so layers compose in any order. The
//! canonical stack, outermost first, is
//! [`IoCache`] → [`DeferredIoOps`] → [`TransactionalIo`] → retry proxies →
//! raw backend ([`MemoryIo`] or [`FjallIo`]).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::IoError;
use crate::keys::{MetaKey, Metadata, ObjectKey, ObjectOffset};
use crate::object::FdsObject;

pub mod cache;
pub mod deferred;
pub mod fjall_store;
mod locks;
pub mod memory;
pub mod retry;
pub mod transactional;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::IoCache;
pub use deferred::DeferredIoOps;
pub use fjall_store::{Durability, FjallIo};
pub use memory::MemoryIo;
pub use retry::{retry, RecoveryHandler, RetryPolicy, RetryProxy, TimeoutHandler};
pub use transactional::TransactionalIo;

/// Computes new metadata from the current value (`None` when absent).
///
/// Mutators must be pure functions of their input: retry proxies may invoke
/// them more than once.
pub type MetadataMutator =
    Arc<dyn Fn(Option<Metadata>) -> Result<Metadata, IoError> + Send + Sync>;

/// Computes a new chunk from the current one (`None` when never written).
pub type ObjectMutator = Arc<dyn Fn(Option<FdsObject>) -> Result<FdsObject, IoError> + Send + Sync>;

/// Computes a new chunk and new blob metadata from the current pair.
pub type ObjectAndMetadataMutator = Arc<
    dyn Fn(Option<FdsObject>, Option<Metadata>) -> Result<(FdsObject, Metadata), IoError>
        + Send
        + Sync,
>;

/// IoOps is the interface every backend and every decorator of the IO stack
/// implements.
///
/// Keys passed to single-blob operations must be complete (see
/// [`MetaKey::is_complete`]). The default `mutate_*` and
/// `read_object_and_metadata` implementations are plain read-then-write
/// sequences; [`TransactionalIo`] makes them atomic per blob.
#[async_trait]
pub trait IoOps: Send + Sync {
    /// Reads the metadata of a blob.
    async fn read_metadata(&self, key: &MetaKey) -> Result<Option<Metadata>, IoError>;

    /// Replaces the metadata of a blob.
    async fn write_metadata(&self, key: &MetaKey, metadata: Metadata) -> Result<(), IoError>;

    /// Reads one chunk. `max_object_size` is the chunk size of the volume.
    async fn read_object(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
    ) -> Result<Option<FdsObject>, IoError>;

    /// Replaces one chunk.
    async fn write_object(&self, key: &ObjectKey, object: FdsObject) -> Result<(), IoError>;

    /// Removes the metadata and every chunk of a blob.
    async fn delete_blob(&self, key: &MetaKey) -> Result<(), IoError>;

    /// Removes every stored chunk of a blob at index `first` or above,
    /// leaving its metadata alone. Chunks that were never written cost
    /// nothing.
    async fn delete_objects_from(
        &self,
        blob: &MetaKey,
        first: ObjectOffset,
    ) -> Result<(), IoError>;

    /// Moves a blob, metadata and chunks, to `new_name` within the same
    /// volume. An existing blob under the new name is replaced.
    async fn rename_blob(&self, key: &MetaKey, new_name: &str) -> Result<(), IoError>;

    /// Lists the metadata of every blob matching `prefix`, in key order.
    async fn scan(&self, prefix: &MetaKey) -> Result<Vec<(MetaKey, Metadata)>, IoError>;

    /// Reads a chunk together with its blob's metadata.
    async fn read_object_and_metadata(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
    ) -> Result<(Option<FdsObject>, Option<Metadata>), IoError> {
        let object = self.read_object(key, max_object_size).await?;
        let metadata = self.read_metadata(key.blob()).await?;
        Ok((object, metadata))
    }

    /// Applies `mutator` to the current metadata and persists the result.
    async fn mutate_metadata(
        &self,
        key: &MetaKey,
        mutator: MetadataMutator,
    ) -> Result<Metadata, IoError> {
        apply_metadata_mutation(self, key, &mutator).await
    }

    /// Applies `mutator` to the current chunk and persists the result.
    async fn mutate_object(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
        mutator: ObjectMutator,
    ) -> Result<FdsObject, IoError> {
        apply_object_mutation(self, key, max_object_size, &mutator).await
    }

    /// Applies `mutator` to the current chunk and metadata and persists both.
    async fn mutate_object_and_metadata(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
        mutator: ObjectAndMetadataMutator,
    ) -> Result<(FdsObject, Metadata), IoError> {
        apply_object_and_metadata_mutation(self, key, max_object_size, &mutator).await
    }

    /// Makes every accepted write durable in the layers below.
    async fn flush(&self) -> Result<(), IoError> {
        Ok(())
    }

    /// Reports, once, a failure hit by work done for `blob` after the call
    /// that queued it returned, such as a background flush.
    async fn take_failure(&self, _blob: &MetaKey) -> Result<(), IoError> {
        Ok(())
    }
}

/// Read-only views over an [`IoOps`], available on every implementation.
#[async_trait]
pub trait IoOpsExt: IoOps {
    /// Applies `f` to the current metadata of a blob.
    async fn map_metadata<T, F>(&self, key: &MetaKey, f: F) -> Result<T, IoError>
    where
        F: FnOnce(Option<&Metadata>) -> T + Send,
        T: Send,
    {
        let metadata = self.read_metadata(key).await?;
        Ok(f(metadata.as_ref()))
    }

    /// Applies `f` to a consistent view of a chunk and its blob's metadata.
    async fn map_object_and_metadata<T, F>(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
        f: F,
    ) -> Result<T, IoError>
    where
        F: FnOnce(Option<&FdsObject>, Option<&Metadata>) -> T + Send,
        T: Send,
    {
        let (object, metadata) = self.read_object_and_metadata(key, max_object_size).await?;
        Ok(f(object.as_ref(), metadata.as_ref()))
    }
}

impl<I: IoOps + ?Sized> IoOpsExt for I {}

pub(crate) fn require_complete(key: &MetaKey) -> Result<(), IoError> {
    if key.is_complete() {
        Ok(())
    } else {
        Err(IoError::invalid(format!("{} does not name a single blob", key)))
    }
}

pub(crate) async fn apply_metadata_mutation<I: IoOps + ?Sized>(
    io: &I,
    key: &MetaKey,
    mutator: &MetadataMutator,
) -> Result<Metadata, IoError> {
    let current = io.read_metadata(key).await?;
    let updated = mutator(current)?;
    io.write_metadata(key, updated.clone()).await?;
    Ok(updated)
}

pub(crate) async fn apply_object_mutation<I: IoOps + ?Sized>(
    io: &I,
    key: &ObjectKey,
    max_object_size: usize,
    mutator: &ObjectMutator,
) -> Result<FdsObject, IoError> {
    let current = io.read_object(key, max_object_size).await?;
    let updated = mutator(current)?;
    io.write_object(key, updated.clone()).await?;
    Ok(updated)
}

/// Writes the chunk, then the metadata. When the metadata write fails the
/// previous chunk is put back before the error is returned.
pub(crate) async fn apply_object_and_metadata_mutation<I: IoOps + ?Sized>(
    io: &I,
    key: &ObjectKey,
    max_object_size: usize,
    mutator: &ObjectAndMetadataMutator,
) -> Result<(FdsObject, Metadata), IoError> {
    let object = io.read_object(key, max_object_size).await?;
    let metadata = io.read_metadata(key.blob()).await?;
    let (new_object, new_metadata) = mutator(object.clone(), metadata)?;

    io.write_object(key, new_object.clone()).await?;
    if let Err(e) = io.write_metadata(key.blob(), new_metadata.clone()).await {
        let previous = object.unwrap_or_else(|| FdsObject::empty(max_object_size));
        if let Err(restore) = io.write_object(key, previous).await {
            warn!(
                key = %key,
                error = %restore,
                "failed to restore object after metadata write failure"
            );
        }
        return Err(e);
    }
    Ok((new_object, new_metadata))
}
