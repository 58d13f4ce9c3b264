use std::sync::Arc;

use tracing::debug;

use crate::error::IoError;
use crate::inode::ROOT_FILE_ID;
use crate::io::IoOps;
use crate::persistent_counter::PersistentCounter;

const COUNTER_NAME: &str = "inode-ids";

/// Hands out file ids per volume. Ids only ever grow, across restarts too,
/// and never collide with the root directory's id.
pub struct InodeAllocator {
    counter: PersistentCounter,
}

impl InodeAllocator {
    pub async fn open(io: Arc<dyn IoOps>, domain: impl Into<String>) -> Result<Self, IoError> {
        let counter =
            PersistentCounter::open(io, domain, COUNTER_NAME, ROOT_FILE_ID as i64, false).await?;
        Ok(Self { counter })
    }

    pub async fn allocate(&self, volume: &str) -> Result<u64, IoError> {
        let id = self.counter.increment(volume).await?;
        let id = u64::try_from(id)
            .map_err(|_| IoError::Codec(format!("allocated id {} is negative", id)))?;
        debug!(volume, file_id = id, "allocated file id");
        Ok(id)
    }

    /// The most recently allocated id, or the root id when none was.
    pub async fn last_allocated(&self, volume: &str) -> Result<u64, IoError> {
        let id = self.counter.current_value(volume).await?;
        u64::try_from(id).map_err(|_| IoError::Codec(format!("stored id {} is negative", id)))
    }
}
