//! File-level operations over one IO stack, as a protocol layer calls them.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::allocator::InodeAllocator;
use crate::chunker::Chunker;
use crate::error::IoError;
use crate::export::ExportResolver;
use crate::index::{
    validate_name, AttributeUpdate, DirectoryEntry, InodeIndex, SimpleInodeIndex,
};
use crate::inode::{Inode, InodeMetadata, NodeType, ROOT_FILE_ID};
use crate::io::IoOps;
use crate::keys::MetaKey;
use crate::metrics::SharedMetrics;

/// Owner and permission bits of a new node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

/// The filesystem of every export served from one IO stack.
///
/// File contents live in blob `data:{file_id}` of the export's volume.
/// Namespace changes are serialized. Data reads and writes run concurrently
/// with them and with each other; the timestamps they touch are updated in
/// place on the node record.
pub struct ExportFs {
    domain: String,
    resolver: Arc<dyn ExportResolver>,
    index: Arc<dyn InodeIndex>,
    allocator: InodeAllocator,
    chunker: Chunker,
    namespace: Mutex<()>,
}

impl ExportFs {
    pub async fn open(
        io: Arc<dyn IoOps>,
        domain: impl Into<String>,
        resolver: Arc<dyn ExportResolver>,
        metrics: SharedMetrics,
    ) -> Result<Self, IoError> {
        let domain = domain.into();
        let index = Arc::new(SimpleInodeIndex::new(
            io.clone(),
            domain.as_str(),
            resolver.clone(),
        ));
        let allocator = InodeAllocator::open(io.clone(), domain.as_str()).await?;
        info!(domain = %domain, "opened export filesystem");
        Ok(Self {
            domain,
            resolver,
            index,
            allocator,
            chunker: Chunker::with_metrics(io, metrics),
            namespace: Mutex::new(()),
        })
    }

    /// Volume name and chunk size of an export.
    fn export(&self, export_id: u32) -> Result<(String, usize), IoError> {
        let volume = self
            .resolver
            .volume_name(export_id)
            .ok_or_else(|| IoError::not_found(format!("export {}", export_id)))?;
        let object_size = self
            .resolver
            .object_size(&volume)
            .ok_or_else(|| IoError::not_found(format!("export volume {}", volume)))?;
        Ok((volume, object_size))
    }

    fn data_key(&self, volume: &str, file_id: u64) -> MetaKey {
        MetaKey::new(self.domain.as_str(), volume, format!("data:{}", file_id))
    }

    /// Root directory of an export, created on first use.
    pub async fn root(&self, export_id: u32) -> Result<InodeMetadata, IoError> {
        let _guard = self.namespace.lock().await;
        self.load_root(export_id).await
    }

    async fn load_root(&self, export_id: u32) -> Result<InodeMetadata, IoError> {
        self.export(export_id)?;
        if let Some(root) = self.index.get(&Inode::root(export_id)).await? {
            return Ok(root);
        }
        let root = InodeMetadata::root(export_id);
        self.index.index(export_id, &[root.clone()]).await?;
        debug!(export_id, "created root directory");
        Ok(root)
    }

    async fn node(&self, inode: &Inode) -> Result<InodeMetadata, IoError> {
        if inode.is_root() {
            return self.load_root(inode.export_id()).await;
        }
        self.index
            .get(inode)
            .await?
            .ok_or_else(|| IoError::not_found(format!("inode {}", inode)))
    }

    async fn directory(&self, inode: &Inode) -> Result<InodeMetadata, IoError> {
        let node = self.node(inode).await?;
        if !node.is_directory() {
            return Err(IoError::invalid(format!("{} is not a directory", inode)));
        }
        Ok(node)
    }

    async fn regular(&self, inode: &Inode) -> Result<InodeMetadata, IoError> {
        let node = self.node(inode).await?;
        if node.node_type() != NodeType::Regular {
            return Err(IoError::invalid(format!("{} is not a regular file", inode)));
        }
        Ok(node)
    }

    /// Fails when `ancestor` is `directory` itself or lies on its path up to
    /// the root.
    async fn check_not_ancestor(&self, ancestor: u64, directory: &Inode) -> Result<(), IoError> {
        let mut seen = BTreeSet::new();
        let mut current = directory.file_id();
        loop {
            if current == ancestor {
                return Err(IoError::invalid(format!(
                    "cannot move directory {} into its own subtree",
                    ancestor
                )));
            }
            if current == ROOT_FILE_ID {
                return Ok(());
            }
            if !seen.insert(current) {
                return Err(IoError::Codec(format!("directory cycle through {}", current)));
            }
            let node = self
                .index
                .get(&Inode::new(directory.export_id(), current))
                .await?
                .ok_or_else(|| IoError::not_found(format!("directory {}", current)))?;
            match node.links().keys().next() {
                Some(parent) => current = *parent,
                None => return Ok(()),
            }
        }
    }

    pub async fn create(
        &self,
        parent: &Inode,
        name: &str,
        node_type: NodeType,
        owner: Owner,
    ) -> Result<InodeMetadata, IoError> {
        self.create_node(parent, name, |file_id, export_id| {
            InodeMetadata::new(node_type, owner.uid, owner.gid, owner.mode, file_id, export_id)
        })
        .await
    }

    pub async fn symlink(
        &self,
        parent: &Inode,
        name: &str,
        owner: Owner,
        target: &str,
    ) -> Result<InodeMetadata, IoError> {
        self.create_node(parent, name, |file_id, export_id| {
            InodeMetadata::symlink(owner.uid, owner.gid, file_id, export_id, target)
        })
        .await
    }

    async fn create_node<F>(
        &self,
        parent: &Inode,
        name: &str,
        build: F,
    ) -> Result<InodeMetadata, IoError>
    where
        F: FnOnce(u64, u32) -> InodeMetadata,
    {
        validate_name(name)?;
        let (volume, _) = self.export(parent.export_id())?;
        let _guard = self.namespace.lock().await;

        let directory = self.directory(parent).await?;
        if self.index.lookup(parent, name).await?.is_some() {
            return Err(IoError::AlreadyExists(format!("{} in {}", name, parent)));
        }
        let file_id = self.allocator.allocate(&volume).await?;
        let node = build(file_id, parent.export_id()).with_link(parent.file_id(), name);
        self.index
            .index(
                parent.export_id(),
                &[node.clone(), directory.with_updated_mtime()],
            )
            .await?;
        debug!(parent = %parent, name, file_id, "created node");
        Ok(node)
    }

    pub async fn lookup(&self, parent: &Inode, name: &str) -> Result<InodeMetadata, IoError> {
        self.directory(parent).await?;
        self.index
            .lookup(parent, name)
            .await?
            .ok_or_else(|| IoError::not_found(format!("{} in {}", name, parent)))
    }

    pub async fn readdir(&self, parent: &Inode) -> Result<Vec<DirectoryEntry>, IoError> {
        self.directory(parent).await?;
        self.index.list(parent).await
    }

    /// Adds a hard link to a non-directory node. A node holds at most one
    /// link per directory.
    pub async fn link(
        &self,
        inode: &Inode,
        new_parent: &Inode,
        name: &str,
    ) -> Result<InodeMetadata, IoError> {
        validate_name(name)?;
        let _guard = self.namespace.lock().await;

        let node = self.node(inode).await?;
        if node.is_directory() {
            return Err(IoError::invalid(format!("cannot hard link directory {}", inode)));
        }
        let directory = self.directory(new_parent).await?;
        if self.index.lookup(new_parent, name).await?.is_some() {
            return Err(IoError::AlreadyExists(format!("{} in {}", name, new_parent)));
        }
        if node.name_in(new_parent.file_id()).is_some() {
            return Err(IoError::invalid(format!(
                "{} is already linked in {}",
                inode, new_parent
            )));
        }
        let linked = node.with_link(new_parent.file_id(), name);
        self.index
            .index(
                inode.export_id(),
                &[linked.clone(), directory.with_updated_mtime()],
            )
            .await?;
        Ok(linked)
    }

    pub async fn unlink(&self, parent: &Inode, name: &str) -> Result<(), IoError> {
        let _guard = self.namespace.lock().await;
        self.unlink_locked(parent, name).await
    }

    async fn unlink_locked(&self, parent: &Inode, name: &str) -> Result<(), IoError> {
        let directory = self.directory(parent).await?;
        let node = self
            .index
            .lookup(parent, name)
            .await?
            .ok_or_else(|| IoError::not_found(format!("{} in {}", name, parent)))?;
        let inode = node.as_inode(parent.export_id());
        if node.is_directory() && !self.index.list(&inode).await?.is_empty() {
            return Err(IoError::invalid(format!("directory {} is not empty", name)));
        }

        let remaining = node.without_link(parent.file_id());
        if remaining.links().is_empty() {
            self.index.remove(&inode).await?;
            self.index
                .index(parent.export_id(), &[directory.with_updated_mtime()])
                .await?;
            let (volume, _) = self.export(parent.export_id())?;
            match self
                .chunker
                .io()
                .delete_blob(&self.data_key(&volume, node.file_id()))
                .await
            {
                Ok(()) | Err(IoError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            debug!(parent = %parent, name, file_id = node.file_id(), "removed last link");
        } else {
            self.index
                .index(
                    parent.export_id(),
                    &[remaining, directory.with_updated_mtime()],
                )
                .await?;
        }
        Ok(())
    }

    /// Moves `name` in `parent` to `new_name` in `new_parent`, replacing a
    /// node already there.
    pub async fn rename(
        &self,
        parent: &Inode,
        name: &str,
        new_parent: &Inode,
        new_name: &str,
    ) -> Result<InodeMetadata, IoError> {
        validate_name(new_name)?;
        let _guard = self.namespace.lock().await;

        self.directory(parent).await?;
        self.directory(new_parent).await?;
        let node = self
            .index
            .lookup(parent, name)
            .await?
            .ok_or_else(|| IoError::not_found(format!("{} in {}", name, parent)))?;
        if node.is_directory() {
            self.check_not_ancestor(node.file_id(), new_parent).await?;
        }
        if parent != new_parent && node.name_in(new_parent.file_id()).is_some() {
            return Err(IoError::invalid(format!(
                "{} is already linked in {}",
                name, new_parent
            )));
        }

        if let Some(existing) = self.index.lookup(new_parent, new_name).await? {
            if existing.file_id() == node.file_id() {
                return Ok(node);
            }
            self.unlink_locked(new_parent, new_name).await?;
        }

        let moved = node
            .without_link(parent.file_id())
            .with_link(new_parent.file_id(), new_name);
        self.index.index(parent.export_id(), &[moved.clone()]).await?;

        let mut directories = vec![self.directory(parent).await?.with_updated_mtime()];
        if parent != new_parent {
            directories.push(self.directory(new_parent).await?.with_updated_mtime());
        }
        self.index.index(parent.export_id(), &directories).await?;
        debug!(from = %parent, name, to = %new_parent, new_name, "renamed node");
        Ok(moved)
    }

    /// Reads file contents at `offset` into `dest`, returning the bytes
    /// copied.
    pub async fn read(
        &self,
        inode: &Inode,
        offset: u64,
        dest: &mut [u8],
    ) -> Result<usize, IoError> {
        self.regular(inode).await?;
        let (volume, object_size) = self.export(inode.export_id())?;
        let blob = self.data_key(&volume, inode.file_id());
        let length = self.chunker.blob_length(&blob).await?.unwrap_or(0);
        let read = self
            .chunker
            .read(&blob, length, object_size, dest, offset)
            .await?;
        self.index
            .update_attributes(inode, Arc::new(InodeMetadata::with_updated_atime))
            .await?;
        Ok(read)
    }

    /// Writes `data` at `offset` and returns the file size afterwards.
    pub async fn write(&self, inode: &Inode, offset: u64, data: &[u8]) -> Result<u64, IoError> {
        self.regular(inode).await?;
        let (volume, object_size) = self.export(inode.export_id())?;
        let blob = self.data_key(&volume, inode.file_id());
        let length = self
            .chunker
            .write(&blob, object_size, data, offset, None)
            .await?;
        self.index
            .update_attributes(inode, Arc::new(InodeMetadata::with_updated_mtime))
            .await?;
        Ok(length)
    }

    pub async fn truncate(&self, inode: &Inode, length: u64) -> Result<(), IoError> {
        self.regular(inode).await?;
        let (volume, object_size) = self.export(inode.export_id())?;
        let blob = self.data_key(&volume, inode.file_id());
        self.chunker.truncate(&blob, object_size, length).await?;
        self.index
            .update_attributes(inode, Arc::new(InodeMetadata::with_updated_mtime))
            .await?;
        Ok(())
    }

    pub async fn set_mode(&self, inode: &Inode, mode: u32) -> Result<InodeMetadata, IoError> {
        let _guard = self.namespace.lock().await;
        self.node(inode).await?;
        let chmod: AttributeUpdate = Arc::new(move |node: &InodeMetadata| node.with_mode(mode));
        self.index.update_attributes(inode, chmod).await
    }

    /// Attributes of a node and its size in bytes.
    pub async fn getattr(&self, inode: &Inode) -> Result<(InodeMetadata, u64), IoError> {
        let node = self.node(inode).await?;
        let size = match node.node_type() {
            NodeType::Regular => {
                let (volume, _) = self.export(inode.export_id())?;
                self.chunker
                    .blob_length(&self.data_key(&volume, inode.file_id()))
                    .await?
                    .unwrap_or(0)
            }
            NodeType::Symlink => node.symlink_target().map_or(0, |t| t.len() as u64),
            NodeType::Directory => 0,
        };
        Ok((node, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{Export, StaticExportResolver};
    use crate::io::{MemoryIo, TransactionalIo};
    use std::time::Duration;

    const EXPORT: u32 = 5;
    const OWNER: Owner = Owner {
        uid: 1000,
        gid: 1000,
        mode: 0o644,
    };

    async fn fs() -> ExportFs {
        let resolver = StaticExportResolver::new(vec![Export {
            volume: "home".into(),
            export_id: EXPORT,
            object_size: 4,
        }])
        .unwrap();
        let io = Arc::new(TransactionalIo::new(Arc::new(MemoryIo::new())));
        ExportFs::open(io, "nfs", Arc::new(resolver), SharedMetrics::default())
            .await
            .unwrap()
    }

    fn root() -> Inode {
        Inode::root(EXPORT)
    }

    #[tokio::test]
    async fn test_root_is_created_once() {
        let fs = fs().await;
        let first = fs.root(EXPORT).await.unwrap();
        let second = fs.root(EXPORT).await.unwrap();
        assert_eq!(first, second);
        assert!(first.is_root());
        assert!(first.is_directory());
        assert!(fs.root(99).await.is_err());
    }

    #[tokio::test]
    async fn test_create_lookup_readdir() {
        let fs = fs().await;
        let b = fs.create(&root(), "b", NodeType::Regular, OWNER).await.unwrap();
        let a = fs.create(&root(), "a", NodeType::Directory, OWNER).await.unwrap();
        assert!(b.file_id() > ROOT_FILE_ID);
        assert_ne!(a.file_id(), b.file_id());

        assert_eq!(fs.lookup(&root(), "b").await.unwrap(), b);
        let names: Vec<String> = fs
            .readdir(&root())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        let err = fs.create(&root(), "b", NodeType::Regular, OWNER).await.unwrap_err();
        assert!(matches!(err, IoError::AlreadyExists(_)));
        let err = fs.lookup(&root(), "c").await.unwrap_err();
        assert!(matches!(err, IoError::NotFound(_)));

        // files are not directories
        let file = b.as_inode(EXPORT);
        assert!(fs.create(&file, "x", NodeType::Regular, OWNER).await.is_err());
    }

    #[tokio::test]
    async fn test_write_read_truncate() {
        let fs = fs().await;
        let created = fs.create(&root(), "f", NodeType::Regular, OWNER).await.unwrap();
        let file = created.as_inode(EXPORT);

        assert_eq!(fs.write(&file, 2, b"hello!").await.unwrap(), 8);
        let mut dest = [0xffu8; 16];
        assert_eq!(fs.read(&file, 0, &mut dest).await.unwrap(), 8);
        assert_eq!(&dest[..8], b"\0\0hello!");

        fs.truncate(&file, 4).await.unwrap();
        let (attrs, size) = fs.getattr(&file).await.unwrap();
        assert_eq!(size, 4);
        assert_eq!(attrs.node_type(), NodeType::Regular);
        assert!(attrs.mtime() >= created.mtime());
    }

    #[tokio::test]
    async fn test_hard_links_and_unlink() {
        let fs = fs().await;
        let dir = fs
            .create(&root(), "d", NodeType::Directory, OWNER)
            .await
            .unwrap()
            .as_inode(EXPORT);
        let file = fs
            .create(&root(), "f", NodeType::Regular, OWNER)
            .await
            .unwrap()
            .as_inode(EXPORT);
        fs.write(&file, 0, b"data").await.unwrap();

        let linked = fs.link(&file, &dir, "g").await.unwrap();
        assert_eq!(linked.links().len(), 2);
        assert_eq!(fs.lookup(&dir, "g").await.unwrap().file_id(), file.file_id());
        assert!(fs.link(&dir, &root(), "dd").await.is_err());

        fs.unlink(&root(), "f").await.unwrap();
        let mut dest = [0u8; 4];
        assert_eq!(fs.read(&file, 0, &mut dest).await.unwrap(), 4);
        assert_eq!(&dest, b"data");

        fs.unlink(&dir, "g").await.unwrap();
        assert!(matches!(fs.getattr(&file).await, Err(IoError::NotFound(_))));
        assert!(fs.readdir(&dir).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unlink_non_empty_directory_fails() {
        let fs = fs().await;
        let dir = fs
            .create(&root(), "d", NodeType::Directory, OWNER)
            .await
            .unwrap()
            .as_inode(EXPORT);
        fs.create(&dir, "x", NodeType::Regular, OWNER).await.unwrap();

        let err = fs.unlink(&root(), "d").await.unwrap_err();
        assert!(matches!(err, IoError::InvalidArgument(_)));
        fs.unlink(&dir, "x").await.unwrap();
        fs.unlink(&root(), "d").await.unwrap();
    }

    #[tokio::test]
    async fn test_rename_replaces_target() {
        let fs = fs().await;
        let dir = fs
            .create(&root(), "d", NodeType::Directory, OWNER)
            .await
            .unwrap()
            .as_inode(EXPORT);
        let a = fs.create(&root(), "a", NodeType::Regular, OWNER).await.unwrap();
        let b = fs.create(&dir, "b", NodeType::Regular, OWNER).await.unwrap();

        let moved = fs.rename(&root(), "a", &dir, "b").await.unwrap();
        assert_eq!(moved.file_id(), a.file_id());
        assert_eq!(fs.lookup(&dir, "b").await.unwrap().file_id(), a.file_id());
        assert!(fs.lookup(&root(), "a").await.is_err());
        assert!(fs.getattr(&b.as_inode(EXPORT)).await.is_err());

        fs.rename(&dir, "b", &dir, "c").await.unwrap();
        let entries = fs.readdir(&dir).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "c");
    }

    #[tokio::test]
    async fn test_symlink_and_mode() {
        let fs = fs().await;
        let link = fs.symlink(&root(), "l", OWNER, "target/path").await.unwrap();
        let inode = link.as_inode(EXPORT);
        let (attrs, size) = fs.getattr(&inode).await.unwrap();
        assert_eq!(attrs.symlink_target(), Some("target/path"));
        assert_eq!(size, 11);

        let mut dest = [0u8; 4];
        assert!(fs.read(&inode, 0, &mut dest).await.is_err());

        let updated = fs.set_mode(&inode, 0o700).await.unwrap();
        assert_eq!(updated.mode(), 0o700);
        assert_eq!(fs.getattr(&inode).await.unwrap().0.mode(), 0o700);
    }

    #[tokio::test]
    async fn test_rename_into_own_subtree_rejected() {
        let fs = fs().await;
        let a = fs
            .create(&root(), "a", NodeType::Directory, OWNER)
            .await
            .unwrap()
            .as_inode(EXPORT);
        let b = fs
            .create(&a, "b", NodeType::Directory, OWNER)
            .await
            .unwrap()
            .as_inode(EXPORT);

        let err = fs.rename(&root(), "a", &b, "a").await.unwrap_err();
        assert!(matches!(err, IoError::InvalidArgument(_)));
        let err = fs.rename(&root(), "a", &a, "x").await.unwrap_err();
        assert!(matches!(err, IoError::InvalidArgument(_)));

        assert_eq!(fs.lookup(&root(), "a").await.unwrap().file_id(), a.file_id());
        assert_eq!(fs.lookup(&a, "b").await.unwrap().file_id(), b.file_id());
        assert!(fs.readdir(&b).await.unwrap().is_empty());

        // a sibling subtree is a valid target
        fs.create(&root(), "c", NodeType::Directory, OWNER).await.unwrap();
        fs.rename(&root(), "c", &b, "c").await.unwrap();
        assert_eq!(fs.readdir(&b).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_data_io_runs_beside_namespace_changes() {
        let fs = fs().await;
        let file = fs
            .create(&root(), "f", NodeType::Regular, OWNER)
            .await
            .unwrap()
            .as_inode(EXPORT);

        let _namespace = fs.namespace.lock().await;
        let timeout = Duration::from_secs(5);
        let written = tokio::time::timeout(timeout, fs.write(&file, 0, b"abc"))
            .await
            .expect("write waited for the namespace lock");
        assert_eq!(written.unwrap(), 3);
        let mut dest = [0u8; 3];
        let read = tokio::time::timeout(timeout, fs.read(&file, 0, &mut dest))
            .await
            .expect("read waited for the namespace lock");
        assert_eq!(read.unwrap(), 3);
        assert_eq!(&dest, b"abc");
        tokio::time::timeout(timeout, fs.truncate(&file, 1))
            .await
            .expect("truncate waited for the namespace lock")
            .unwrap();
    }
}
