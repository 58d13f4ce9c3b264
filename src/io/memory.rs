use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use bytes::Bytes;

use super::{require_complete, IoOps};
use crate::error::IoError;
use crate::keys::{MetaKey, Metadata, ObjectKey, ObjectOffset};
use crate::object::FdsObject;

/// Volatile backend keeping metadata and chunks in ordered maps.
///
/// Each operation runs under one lock, so renames and deletes are atomic.
/// An optional per-volume capacity bounds the bytes of chunk data a volume
/// may hold.
#[derive(Debug, Default)]
pub struct MemoryIo {
    state: RwLock<MemoryState>,
    capacity: Option<u64>,
}

#[derive(Debug, Default)]
struct MemoryState {
    metadata: BTreeMap<MetaKey, Metadata>,
    objects: BTreeMap<ObjectKey, Bytes>,
    usage: HashMap<VolumeId, u64>,
}

type VolumeId = (String, String);

fn volume_of(key: &MetaKey) -> VolumeId {
    (
        key.domain().to_string(),
        key.volume().unwrap_or_default().to_string(),
    )
}

impl MemoryIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend refusing chunk writes that would grow a volume past
    /// `capacity` bytes.
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            state: RwLock::default(),
            capacity: Some(capacity),
        }
    }

    /// Bytes of chunk data stored for a volume.
    pub fn usage(&self, domain: &str, volume: &str) -> u64 {
        self.read()
            .usage
            .get(&(domain.to_string(), volume.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn object_count(&self) -> usize {
        self.read().objects.len()
    }

    pub fn metadata_count(&self) -> usize {
        self.read().metadata.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemoryState {
    fn object_keys(&self, blob: &MetaKey, first: ObjectOffset) -> Vec<ObjectKey> {
        self.objects
            .range(blob.object(first)..)
            .map(|(k, _)| k)
            .take_while(|k| k.begins_with(blob))
            .cloned()
            .collect()
    }

    fn remove_objects(&mut self, blob: &MetaKey, first: ObjectOffset) -> usize {
        let keys = self.object_keys(blob, first);
        let mut freed = 0u64;
        for key in &keys {
            if let Some(data) = self.objects.remove(key) {
                freed += data.len() as u64;
            }
        }
        if let Some(used) = self.usage.get_mut(&volume_of(blob)) {
            *used = used.saturating_sub(freed);
        }
        keys.len()
    }
}

#[async_trait]
impl IoOps for MemoryIo {
    async fn read_metadata(&self, key: &MetaKey) -> Result<Option<Metadata>, IoError> {
        require_complete(key)?;
        Ok(self.read().metadata.get(key).cloned())
    }

    async fn write_metadata(&self, key: &MetaKey, metadata: Metadata) -> Result<(), IoError> {
        require_complete(key)?;
        self.write().metadata.insert(key.clone(), metadata);
        Ok(())
    }

    async fn read_object(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
    ) -> Result<Option<FdsObject>, IoError> {
        require_complete(key.blob())?;
        match self.read().objects.get(key) {
            Some(data) => Ok(Some(FdsObject::new(data.clone(), max_object_size)?)),
            None => Ok(None),
        }
    }

    async fn write_object(&self, key: &ObjectKey, object: FdsObject) -> Result<(), IoError> {
        require_complete(key.blob())?;
        let mut state = self.write();
        let volume = volume_of(key.blob());
        let previous = state.objects.get(key).map_or(0, |d| d.len() as u64);
        let used = state.usage.get(&volume).copied().unwrap_or(0);
        let new_usage = used - previous.min(used) + object.limit() as u64;

        if let Some(capacity) = self.capacity {
            if new_usage > capacity && new_usage > used {
                return Err(IoError::NoSpace {
                    volume: volume.1,
                    capacity,
                });
            }
        }
        state.usage.insert(volume, new_usage);
        state.objects.insert(key.clone(), object.into_bytes());
        Ok(())
    }

    async fn delete_blob(&self, key: &MetaKey) -> Result<(), IoError> {
        require_complete(key)?;
        let mut state = self.write();
        let had_metadata = state.metadata.remove(key).is_some();
        let removed = state.remove_objects(key, ObjectOffset::default());
        if !had_metadata && removed == 0 {
            return Err(IoError::not_found(key));
        }
        Ok(())
    }

    async fn delete_objects_from(
        &self,
        blob: &MetaKey,
        first: ObjectOffset,
    ) -> Result<(), IoError> {
        require_complete(blob)?;
        self.write().remove_objects(blob, first);
        Ok(())
    }

    async fn rename_blob(&self, key: &MetaKey, new_name: &str) -> Result<(), IoError> {
        require_complete(key)?;
        let target = key.with_blob_name(new_name);
        if &target == key {
            if self.read().metadata.contains_key(key) {
                return Ok(());
            }
            return Err(IoError::not_found(key));
        }

        let mut state = self.write();
        let metadata = state
            .metadata
            .remove(key)
            .ok_or_else(|| IoError::not_found(key))?;

        state.metadata.remove(&target);
        state.remove_objects(&target, ObjectOffset::default());

        let moved: Vec<(ObjectKey, Bytes)> = state
            .object_keys(key, ObjectOffset::default())
            .into_iter()
            .filter_map(|k| state.objects.remove(&k).map(|d| (k, d)))
            .collect();
        for (k, data) in moved {
            state.objects.insert(k.with_blob(target.clone()), data);
        }
        state.metadata.insert(target, metadata);
        Ok(())
    }

    async fn scan(&self, prefix: &MetaKey) -> Result<Vec<(MetaKey, Metadata)>, IoError> {
        Ok(self
            .read()
            .metadata
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.begins_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
