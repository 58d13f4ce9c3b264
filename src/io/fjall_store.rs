use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::Deserialize;
use tracing::debug;

use super::{require_complete, IoOps};
use crate::error::IoError;
use crate::keys::{MetaKey, Metadata, ObjectKey, ObjectOffset};
use crate::object::FdsObject;

const METADATA_PARTITION: &str = "metadata";
const OBJECTS_PARTITION: &str = "objects";
const SEPARATOR: u8 = 0;

/// How hard the backend pushes each write to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    Buffer,
    Fsync,
    Fdatasync,
}

impl FromStr for Durability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buffer" => Ok(Durability::Buffer),
            "fsync" => Ok(Durability::Fsync),
            "fdatasync" => Ok(Durability::Fdatasync),
            _ => Err(format!("Unknown durability option: {}", s)),
        }
    }
}

impl From<Durability> for PersistMode {
    fn from(durability: Durability) -> Self {
        match durability {
            Durability::Buffer => PersistMode::Buffer,
            Durability::Fsync => PersistMode::SyncAll,
            Durability::Fdatasync => PersistMode::SyncData,
        }
    }
}

/// Persistent backend on a fjall keyspace.
///
/// Metadata lives in one partition, bincode encoded; chunks live in another.
/// Keys are the key components joined by a zero byte, object keys carrying
/// the chunk index big endian so a blob's chunks are contiguous and ordered.
#[derive(Clone)]
pub struct FjallIo {
    keyspace: Keyspace,
    metadata: PartitionHandle,
    objects: PartitionHandle,
    durability: Option<Durability>,
}

impl std::fmt::Debug for FjallIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FjallIo")
            .field("durability", &self.durability)
            .finish_non_exhaustive()
    }
}

impl FjallIo {
    pub fn open(path: impl AsRef<Path>, durability: Option<Durability>) -> Result<Self, IoError> {
        let keyspace = Config::new(path.as_ref()).open()?;
        let metadata =
            keyspace.open_partition(METADATA_PARTITION, PartitionCreateOptions::default())?;
        let objects =
            keyspace.open_partition(OBJECTS_PARTITION, PartitionCreateOptions::default())?;
        debug!(path = %path.as_ref().display(), ?durability, "opened fjall keyspace");
        Ok(Self {
            keyspace,
            metadata,
            objects,
            durability,
        })
    }

    /// Number of metadata records and of stored chunks.
    pub fn num_keys(&self) -> Result<(usize, usize), IoError> {
        Ok((self.metadata.len()?, self.objects.len()?))
    }

    pub fn disk_space(&self) -> u64 {
        self.keyspace.disk_space()
    }

    fn persist(&self) -> Result<(), IoError> {
        if let Some(durability) = self.durability {
            self.keyspace.persist(durability.into())?;
        }
        Ok(())
    }

    fn object_keys(&self, blob: &MetaKey) -> Result<Vec<Vec<u8>>, IoError> {
        let mut keys = Vec::new();
        for item in self.objects.prefix(objects_prefix(blob)?) {
            let (key, _) = item?;
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    fn delete_sync(&self, key: &MetaKey) -> Result<(), IoError> {
        let meta_key = encode_meta_key(key)?;
        let had_metadata = self.metadata.get(&meta_key)?.is_some();
        let objects = self.object_keys(key)?;
        if !had_metadata && objects.is_empty() {
            return Err(IoError::not_found(key));
        }

        let mut batch = self.keyspace.batch();
        batch.remove(&self.metadata, meta_key);
        for object in objects {
            batch.remove(&self.objects, object);
        }
        batch.commit()?;
        self.persist()
    }

    fn delete_objects_from_sync(
        &self,
        blob: &MetaKey,
        first: ObjectOffset,
    ) -> Result<(), IoError> {
        let start = encode_object_key(&blob.object(first))?;
        let end = encode_object_key(&blob.object(u64::MAX))?;
        let mut batch = self.keyspace.batch();
        let mut removed = 0usize;
        for item in self.objects.range(start..=end) {
            let (key, _) = item?;
            batch.remove(&self.objects, key.to_vec());
            removed += 1;
        }
        if removed == 0 {
            return Ok(());
        }
        batch.commit()?;
        debug!(blob = %blob, first = %first, removed, "deleted chunks");
        self.persist()
    }

    fn rename_sync(&self, key: &MetaKey, target: &MetaKey) -> Result<(), IoError> {
        let source_key = encode_meta_key(key)?;
        let target_key = encode_meta_key(target)?;
        let metadata = self
            .metadata
            .get(&source_key)?
            .ok_or_else(|| IoError::not_found(key))?;
        if source_key == target_key {
            return Ok(());
        }

        let source_prefix = objects_prefix(key)?;
        let target_prefix = objects_prefix(target)?;

        let mut batch = self.keyspace.batch();
        for stale in self.object_keys(target)? {
            batch.remove(&self.objects, stale);
        }
        for item in self.objects.prefix(&source_prefix) {
            let (object_key, value) = item?;
            let mut moved = target_prefix.clone();
            moved.extend_from_slice(&object_key[source_prefix.len()..]);
            batch.insert(&self.objects, moved, value);
            batch.remove(&self.objects, object_key.to_vec());
        }
        batch.insert(&self.metadata, target_key, metadata);
        batch.remove(&self.metadata, source_key);
        batch.commit()?;
        self.persist()
    }

    fn scan_sync(&self, prefix: &MetaKey) -> Result<Vec<(MetaKey, Metadata)>, IoError> {
        let mut found = Vec::new();
        for item in self.metadata.prefix(encode_prefix(prefix)?) {
            let (key, value) = item?;
            let key = decode_meta_key(&key)?;
            if key.begins_with(prefix) {
                found.push((key, decode_metadata(&value)?));
            }
        }
        Ok(found)
    }
}

/// Runs a keyspace call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, IoError>
where
    F: FnOnce() -> Result<T, IoError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| IoError::Backend(format!("blocking task failed: {}", e)))?
}

fn push_component(buf: &mut Vec<u8>, component: &str) -> Result<(), IoError> {
    if component.as_bytes().contains(&SEPARATOR) {
        return Err(IoError::invalid(format!(
            "key component {:?} contains a zero byte",
            component
        )));
    }
    buf.extend_from_slice(component.as_bytes());
    Ok(())
}

/// Encodes the populated components of a key. A trailing separator follows
/// the domain and the volume so prefixes never match a longer sibling name;
/// the blob name is left open for name-prefix matching.
fn encode_prefix(key: &MetaKey) -> Result<Vec<u8>, IoError> {
    let mut buf = Vec::new();
    push_component(&mut buf, key.domain())?;
    buf.push(SEPARATOR);
    if let Some(volume) = key.volume() {
        push_component(&mut buf, volume)?;
        buf.push(SEPARATOR);
        if let Some(blob_name) = key.blob_name() {
            push_component(&mut buf, blob_name)?;
        }
    }
    Ok(buf)
}

fn encode_meta_key(key: &MetaKey) -> Result<Vec<u8>, IoError> {
    require_complete(key)?;
    encode_prefix(key)
}

fn objects_prefix(blob: &MetaKey) -> Result<Vec<u8>, IoError> {
    let mut buf = encode_meta_key(blob)?;
    buf.push(SEPARATOR);
    Ok(buf)
}

fn encode_object_key(key: &ObjectKey) -> Result<Vec<u8>, IoError> {
    let mut buf = objects_prefix(key.blob())?;
    buf.extend_from_slice(&key.offset().value().to_be_bytes());
    Ok(buf)
}

fn decode_meta_key(raw: &[u8]) -> Result<MetaKey, IoError> {
    let mut parts = raw.splitn(3, |b| *b == SEPARATOR);
    let mut next = || -> Result<String, IoError> {
        let part = parts
            .next()
            .ok_or_else(|| IoError::Codec("truncated metadata key".into()))?;
        String::from_utf8(part.to_vec())
            .map_err(|e| IoError::Codec(format!("metadata key is not utf-8: {}", e)))
    };
    let domain = next()?;
    let volume = next()?;
    let blob_name = next()?;
    Ok(MetaKey::new(domain, volume, blob_name))
}

fn encode_metadata(metadata: &Metadata) -> Result<Vec<u8>, IoError> {
    Ok(bincode::encode_to_vec(metadata, bincode::config::standard())?)
}

fn decode_metadata(raw: &[u8]) -> Result<Metadata, IoError> {
    let (metadata, _) = bincode::decode_from_slice(raw, bincode::config::standard())?;
    Ok(metadata)
}

#[async_trait]
impl IoOps for FjallIo {
    async fn read_metadata(&self, key: &MetaKey) -> Result<Option<Metadata>, IoError> {
        let raw_key = encode_meta_key(key)?;
        let this = self.clone();
        blocking(move || match this.metadata.get(raw_key)? {
            Some(value) => Ok(Some(decode_metadata(&value)?)),
            None => Ok(None),
        })
        .await
    }

    async fn write_metadata(&self, key: &MetaKey, metadata: Metadata) -> Result<(), IoError> {
        let raw_key = encode_meta_key(key)?;
        let value = encode_metadata(&metadata)?;
        let this = self.clone();
        blocking(move || {
            this.metadata.insert(raw_key, value)?;
            this.persist()
        })
        .await
    }

    async fn read_object(
        &self,
        key: &ObjectKey,
        max_object_size: usize,
    ) -> Result<Option<FdsObject>, IoError> {
        let raw_key = encode_object_key(key)?;
        let this = self.clone();
        blocking(move || match this.objects.get(raw_key)? {
            Some(value) => Ok(Some(FdsObject::new(value.to_vec(), max_object_size)?)),
            None => Ok(None),
        })
        .await
    }

    async fn write_object(&self, key: &ObjectKey, object: FdsObject) -> Result<(), IoError> {
        let raw_key = encode_object_key(key)?;
        let this = self.clone();
        blocking(move || {
            this.objects.insert(raw_key, object.as_bytes().as_ref())?;
            this.persist()
        })
        .await
    }

    async fn delete_blob(&self, key: &MetaKey) -> Result<(), IoError> {
        require_complete(key)?;
        let key = key.clone();
        let this = self.clone();
        blocking(move || this.delete_sync(&key)).await
    }

    async fn delete_objects_from(
        &self,
        blob: &MetaKey,
        first: ObjectOffset,
    ) -> Result<(), IoError> {
        require_complete(blob)?;
        let blob = blob.clone();
        let this = self.clone();
        blocking(move || this.delete_objects_from_sync(&blob, first)).await
    }

    async fn rename_blob(&self, key: &MetaKey, new_name: &str) -> Result<(), IoError> {
        require_complete(key)?;
        let target = key.with_blob_name(new_name);
        let key = key.clone();
        let this = self.clone();
        blocking(move || this.rename_sync(&key, &target)).await
    }

    async fn scan(&self, prefix: &MetaKey) -> Result<Vec<(MetaKey, Metadata)>, IoError> {
        let prefix = prefix.clone();
        let this = self.clone();
        blocking(move || this.scan_sync(&prefix)).await
    }

    async fn flush(&self) -> Result<(), IoError> {
        let this = self.clone();
        blocking(move || {
            this.keyspace.persist(PersistMode::SyncAll)?;
            Ok(())
        })
        .await
    }
}
