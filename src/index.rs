use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::debug;

use crate::error::IoError;
use crate::export::ExportResolver;
use crate::inode::{Inode, InodeMetadata};
use crate::io::IoOps;
use crate::keys::{MetaKey, Metadata};

const LINK_TARGET_FIELD: &str = "file_id";

/// A named child of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub metadata: InodeMetadata,
}

/// Computes new attributes of a node from its stored record. Must leave the
/// links alone.
pub type AttributeUpdate = Arc<dyn Fn(&InodeMetadata) -> InodeMetadata + Send + Sync>;

/// Directory structure over inode records.
#[async_trait]
pub trait InodeIndex: Send + Sync {
    /// Stores the nodes and registers every link in their link maps. Links
    /// the previous version of a node had and the new one lacks are dropped.
    async fn index(&self, export_id: u32, nodes: &[InodeMetadata]) -> Result<(), IoError>;

    async fn lookup(&self, parent: &Inode, name: &str) -> Result<Option<InodeMetadata>, IoError>;

    /// Children of `parent` in ascending name order.
    async fn list(&self, parent: &Inode) -> Result<Vec<DirectoryEntry>, IoError>;

    /// Drops the node's record and every link to it. `NotFound` when the
    /// node has no record.
    async fn remove(&self, inode: &Inode) -> Result<(), IoError>;

    async fn get(&self, inode: &Inode) -> Result<Option<InodeMetadata>, IoError>;

    /// Applies `update` to the node's stored record in one atomic step and
    /// returns the result. `NotFound` when the node has no record.
    async fn update_attributes(
        &self,
        inode: &Inode,
        update: AttributeUpdate,
    ) -> Result<InodeMetadata, IoError>;
}

/// Index keeping one metadata record per node (`inode:{id}`) and one entry
/// per link (`link:{parent}/{name}`) in the export's volume.
///
/// A link entry only counts while the node's record still lists that link,
/// so an entry left behind by an interrupted update is never visible.
pub struct SimpleInodeIndex {
    io: Arc<dyn IoOps>,
    domain: String,
    resolver: Arc<dyn ExportResolver>,
}

pub(crate) fn validate_name(name: &str) -> Result<(), IoError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(IoError::invalid(format!("invalid file name {:?}", name)));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(IoError::invalid(format!(
            "file name {:?} contains a reserved character",
            name
        )));
    }
    Ok(())
}

impl SimpleInodeIndex {
    pub fn new(
        io: Arc<dyn IoOps>,
        domain: impl Into<String>,
        resolver: Arc<dyn ExportResolver>,
    ) -> Self {
        Self {
            io,
            domain: domain.into(),
            resolver,
        }
    }

    fn volume(&self, export_id: u32) -> Result<String, IoError> {
        self.resolver
            .volume_name(export_id)
            .ok_or_else(|| IoError::not_found(format!("export {}", export_id)))
    }

    fn record_key(&self, volume: &str, file_id: u64) -> MetaKey {
        MetaKey::new(self.domain.as_str(), volume, format!("inode:{}", file_id))
    }

    fn link_key(&self, volume: &str, parent: u64, name: &str) -> MetaKey {
        MetaKey::new(
            self.domain.as_str(),
            volume,
            format!("link:{}/{}", parent, name),
        )
    }

    async fn read_record(
        &self,
        volume: &str,
        file_id: u64,
    ) -> Result<Option<InodeMetadata>, IoError> {
        match self.io.read_metadata(&self.record_key(volume, file_id)).await? {
            Some(metadata) => Ok(Some(InodeMetadata::from_metadata(&metadata)?)),
            None => Ok(None),
        }
    }

    /// Record of the node a link entry points at, if it still lists the link.
    async fn resolve_link(
        &self,
        volume: &str,
        parent: u64,
        name: &str,
        entry: &Metadata,
    ) -> Result<Option<InodeMetadata>, IoError> {
        let file_id = parse_target(entry)?;
        let node = self.read_record(volume, file_id).await?;
        Ok(node.filter(|n| n.name_in(parent) == Some(name)))
    }

    /// Deletes a link entry unless it has been pointed at another node.
    async fn unregister(
        &self,
        volume: &str,
        parent: u64,
        name: &str,
        file_id: u64,
    ) -> Result<(), IoError> {
        let key = self.link_key(volume, parent, name);
        let current = self.io.read_metadata(&key).await?;
        let ours = match &current {
            Some(entry) => parse_target(entry)? == file_id,
            None => false,
        };
        if ours {
            match self.io.delete_blob(&key).await {
                Ok(()) | Err(IoError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            debug!(volume, parent, name, file_id, "unregistered link");
        }
        Ok(())
    }

    async fn index_one(&self, volume: &str, node: &InodeMetadata) -> Result<(), IoError> {
        for name in node.links().values() {
            validate_name(name)?;
        }
        let previous = self.read_record(volume, node.file_id()).await?;

        // timestamps may have moved on since the caller read the node
        let record = node.clone();
        self.io
            .mutate_metadata(
                &self.record_key(volume, node.file_id()),
                Arc::new(move |current: Option<Metadata>| -> Result<Metadata, IoError> {
                    match current {
                        Some(stored) => record
                            .with_latest_times(&InodeMetadata::from_metadata(&stored)?)
                            .to_metadata(),
                        None => record.to_metadata(),
                    }
                }),
            )
            .await?;

        try_join_all(node.links().iter().map(|(parent, name)| async move {
            let mut entry = Metadata::new();
            entry.insert(LINK_TARGET_FIELD.to_string(), node.file_id().to_string());
            self.io
                .write_metadata(&self.link_key(volume, *parent, name), entry)
                .await
        }))
        .await?;

        if let Some(previous) = previous {
            for (parent, name) in previous.links() {
                if node.name_in(*parent) != Some(name.as_str()) {
                    self.unregister(volume, *parent, name, node.file_id()).await?;
                }
            }
        }
        debug!(volume, file_id = node.file_id(), links = node.links().len(), "indexed node");
        Ok(())
    }
}

fn parse_target(entry: &Metadata) -> Result<u64, IoError> {
    let raw = entry
        .get(LINK_TARGET_FIELD)
        .ok_or_else(|| IoError::Codec("link entry has no target".into()))?;
    raw.parse()
        .map_err(|e| IoError::Codec(format!("link target {:?}: {}", raw, e)))
}

#[async_trait]
impl InodeIndex for SimpleInodeIndex {
    async fn index(&self, export_id: u32, nodes: &[InodeMetadata]) -> Result<(), IoError> {
        let volume = self.volume(export_id)?;
        for node in nodes {
            self.index_one(&volume, node).await?;
        }
        Ok(())
    }

    async fn lookup(&self, parent: &Inode, name: &str) -> Result<Option<InodeMetadata>, IoError> {
        let volume = self.volume(parent.export_id())?;
        let key = self.link_key(&volume, parent.file_id(), name);
        match self.io.read_metadata(&key).await? {
            Some(entry) => {
                self.resolve_link(&volume, parent.file_id(), name, &entry)
                    .await
            }
            None => Ok(None),
        }
    }

    async fn list(&self, parent: &Inode) -> Result<Vec<DirectoryEntry>, IoError> {
        let volume = self.volume(parent.export_id())?;
        let link_prefix = format!("link:{}/", parent.file_id());
        let prefix = MetaKey::blob_prefix(
            self.domain.as_str(),
            volume.as_str(),
            link_prefix.as_str(),
        );
        let entries = self.io.scan(&prefix).await?;

        let resolved = try_join_all(entries.iter().map(|(key, entry)| {
            let name = key
                .blob_name()
                .and_then(|b| b.strip_prefix(link_prefix.as_str()))
                .unwrap_or_default();
            let volume = volume.as_str();
            async move {
                let node = self
                    .resolve_link(volume, parent.file_id(), name, entry)
                    .await?;
                Ok::<_, IoError>(node.map(|metadata| DirectoryEntry {
                    name: name.to_string(),
                    metadata,
                }))
            }
        }))
        .await?;
        Ok(resolved.into_iter().flatten().collect())
    }

    async fn remove(&self, inode: &Inode) -> Result<(), IoError> {
        let volume = self.volume(inode.export_id())?;
        let node = self
            .read_record(&volume, inode.file_id())
            .await?
            .ok_or_else(|| IoError::not_found(format!("inode {}", inode)))?;

        for (parent, name) in node.links() {
            self.unregister(&volume, *parent, name, node.file_id()).await?;
        }
        self.io
            .delete_blob(&self.record_key(&volume, inode.file_id()))
            .await?;
        debug!(volume = %volume, file_id = inode.file_id(), "removed node");
        Ok(())
    }

    async fn get(&self, inode: &Inode) -> Result<Option<InodeMetadata>, IoError> {
        let volume = self.volume(inode.export_id())?;
        self.read_record(&volume, inode.file_id()).await
    }

    async fn update_attributes(
        &self,
        inode: &Inode,
        update: AttributeUpdate,
    ) -> Result<InodeMetadata, IoError> {
        let volume = self.volume(inode.export_id())?;
        let target = *inode;
        let stored = self
            .io
            .mutate_metadata(
                &self.record_key(&volume, inode.file_id()),
                Arc::new(move |current: Option<Metadata>| -> Result<Metadata, IoError> {
                    let stored = current
                        .ok_or_else(|| IoError::not_found(format!("inode {}", target)))?;
                    let node = InodeMetadata::from_metadata(&stored)?;
                    let updated = update(&node);
                    if updated.file_id() != node.file_id() || updated.links() != node.links() {
                        return Err(IoError::invalid(format!(
                            "attribute update of {} must not touch its links",
                            target
                        )));
                    }
                    updated.to_metadata()
                }),
            )
            .await?;
        InodeMetadata::from_metadata(&stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{Export, StaticExportResolver};
    use crate::inode::{NodeType, ROOT_FILE_ID};
    use crate::io::{MemoryIo, TransactionalIo};

    const EXPORT: u32 = 7;

    fn index() -> SimpleInodeIndex {
        let resolver = StaticExportResolver::new(vec![Export {
            volume: "vol".into(),
            export_id: EXPORT,
            object_size: 4,
        }])
        .unwrap();
        SimpleInodeIndex::new(
            Arc::new(TransactionalIo::new(Arc::new(MemoryIo::new()))),
            "d",
            Arc::new(resolver),
        )
    }

    fn file(id: u64) -> InodeMetadata {
        InodeMetadata::new(NodeType::Regular, 0, 0, 0o644, id, EXPORT)
    }

    fn dir(id: u64) -> Inode {
        Inode::new(EXPORT, id)
    }

    #[tokio::test]
    async fn test_hard_link_visible_under_both_parents() {
        let index = index();
        let node = file(10).with_link(ROOT_FILE_ID, "a").with_link(2, "b");
        index.index(EXPORT, &[node.clone()]).await.unwrap();

        assert_eq!(index.lookup(&dir(ROOT_FILE_ID), "a").await.unwrap(), Some(node.clone()));
        assert_eq!(index.lookup(&dir(2), "b").await.unwrap(), Some(node.clone()));
        assert_eq!(index.lookup(&dir(2), "a").await.unwrap(), None);

        index.remove(&node.as_inode(EXPORT)).await.unwrap();
        assert_eq!(index.lookup(&dir(ROOT_FILE_ID), "a").await.unwrap(), None);
        assert_eq!(index.lookup(&dir(2), "b").await.unwrap(), None);
        assert!(index.list(&dir(ROOT_FILE_ID)).await.unwrap().is_empty());
        assert!(index.list(&dir(2)).await.unwrap().is_empty());
        assert_eq!(index.get(&node.as_inode(EXPORT)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_in_name_order() {
        let index = index();
        let nodes = vec![
            file(11).with_link(ROOT_FILE_ID, "zeta"),
            file(12).with_link(ROOT_FILE_ID, "alpha"),
            file(13).with_link(ROOT_FILE_ID, "mid"),
            file(14).with_link(15, "elsewhere"),
        ];
        index.index(EXPORT, &nodes).await.unwrap();

        let names: Vec<String> = index
            .list(&dir(ROOT_FILE_ID))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn test_reindex_drops_stale_links() {
        let index = index();
        let node = file(10).with_link(ROOT_FILE_ID, "old");
        index.index(EXPORT, &[node.clone()]).await.unwrap();

        let renamed = node.with_link(ROOT_FILE_ID, "new");
        index.index(EXPORT, &[renamed.clone()]).await.unwrap();

        assert_eq!(index.lookup(&dir(ROOT_FILE_ID), "old").await.unwrap(), None);
        assert_eq!(
            index.lookup(&dir(ROOT_FILE_ID), "new").await.unwrap(),
            Some(renamed)
        );
        assert_eq!(index.list(&dir(ROOT_FILE_ID)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_entry_repointed_to_other_node_survives() {
        let index = index();
        let first = file(10).with_link(ROOT_FILE_ID, "x");
        index.index(EXPORT, &[first.clone()]).await.unwrap();
        let second = file(11).with_link(ROOT_FILE_ID, "x");
        index.index(EXPORT, &[second.clone()]).await.unwrap();

        // the first node no longer owns the entry
        index.index(EXPORT, &[first.without_link(ROOT_FILE_ID)]).await.unwrap();
        assert_eq!(index.lookup(&dir(ROOT_FILE_ID), "x").await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_invalid_names_and_unknown_export() {
        let index = index();
        let bad = file(10).with_link(ROOT_FILE_ID, "a/b");
        assert!(matches!(
            index.index(EXPORT, &[bad]).await.unwrap_err(),
            IoError::InvalidArgument(_)
        ));
        assert!(matches!(
            index.lookup(&Inode::new(99, ROOT_FILE_ID), "a").await.unwrap_err(),
            IoError::NotFound(_)
        ));
        assert!(matches!(
            index.remove(&dir(12345)).await.unwrap_err(),
            IoError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_update_attributes_keeps_links() {
        let index = index();
        let node = file(10).with_link(ROOT_FILE_ID, "a");
        index.index(EXPORT, &[node.clone()]).await.unwrap();

        let chmod: AttributeUpdate = Arc::new(|n: &InodeMetadata| n.with_mode(0o600));
        let updated = index.update_attributes(&node.as_inode(EXPORT), chmod).await.unwrap();
        assert_eq!(updated.mode(), 0o600);
        assert_eq!(index.lookup(&dir(ROOT_FILE_ID), "a").await.unwrap(), Some(updated));

        let relink: AttributeUpdate = Arc::new(|n: &InodeMetadata| n.with_link(3, "b"));
        assert!(matches!(
            index.update_attributes(&node.as_inode(EXPORT), relink).await.unwrap_err(),
            IoError::InvalidArgument(_)
        ));
        assert_eq!(index.lookup(&dir(3), "b").await.unwrap(), None);

        let touch: AttributeUpdate = Arc::new(InodeMetadata::with_updated_atime);
        assert!(matches!(
            index.update_attributes(&dir(12345), touch).await.unwrap_err(),
            IoError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_reindex_keeps_newer_timestamps() {
        let index = index();
        let node = file(10).with_link(ROOT_FILE_ID, "a");
        index.index(EXPORT, &[node.clone()]).await.unwrap();

        let later = node.mtime() + chrono::Duration::seconds(60);
        let stored = InodeMetadata::from_metadata(&{
            let mut metadata = node.to_metadata().unwrap();
            metadata.insert("mtime".into(), later.timestamp_millis().to_string());
            metadata
        })
        .unwrap();
        index.index(EXPORT, &[stored]).await.unwrap();

        // a stale copy of the node is indexed after the newer write
        index.index(EXPORT, &[node.with_link(ROOT_FILE_ID, "b")]).await.unwrap();
        let current = index.get(&node.as_inode(EXPORT)).await.unwrap().unwrap();
        assert_eq!(current.mtime(), later);
        assert_eq!(current.name_in(ROOT_FILE_ID), Some("b"));
    }
}
