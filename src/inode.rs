//! Attribute records of files, directories and symlinks, and the wire handle
//! protocol code uses to refer to them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IoError;
use crate::keys::Metadata;

/// File id of every export's root directory. Never handed out by the
/// allocator.
pub const ROOT_FILE_ID: u64 = 1;

/// Length of an encoded [`Inode`] handle.
pub const HANDLE_LEN: usize = 13;

const ROOT_FLAG: u8 = 0b0000_0001;

const FIELD_TYPE: &str = "type";
const FIELD_UID: &str = "uid";
const FIELD_GID: &str = "gid";
const FIELD_MODE: &str = "mode";
const FIELD_FILE_ID: &str = "file_id";
const FIELD_EXPORT_ID: &str = "export_id";
const FIELD_ATIME: &str = "atime";
const FIELD_MTIME: &str = "mtime";
const FIELD_CTIME: &str = "ctime";
const FIELD_LINKS: &str = "links";
const FIELD_SYMLINK_TARGET: &str = "symlink_target";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Directory,
    Regular,
    Symlink,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Directory => "directory",
            NodeType::Regular => "regular",
            NodeType::Symlink => "symlink",
        }
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "directory" => Ok(NodeType::Directory),
            "regular" => Ok(NodeType::Regular),
            "symlink" => Ok(NodeType::Symlink),
            _ => Err(format!("Unknown node type: {}", s)),
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attributes of one node.
///
/// Values are immutable; the `with_*` methods return an updated copy. The
/// link map records every (parent id, name) pair the node is visible under,
/// one name per parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeMetadata {
    node_type: NodeType,
    uid: u32,
    gid: u32,
    mode: u32,
    file_id: u64,
    export_id: u32,
    atime: DateTime<Utc>,
    mtime: DateTime<Utc>,
    ctime: DateTime<Utc>,
    links: BTreeMap<u64, String>,
    symlink_target: Option<String>,
}

/// Current time at the millisecond precision records are stored with.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

impl InodeMetadata {
    pub fn new(
        node_type: NodeType,
        uid: u32,
        gid: u32,
        mode: u32,
        file_id: u64,
        export_id: u32,
    ) -> Self {
        let now = now();
        Self {
            node_type,
            uid,
            gid,
            mode,
            file_id,
            export_id,
            atime: now,
            mtime: now,
            ctime: now,
            links: BTreeMap::new(),
            symlink_target: None,
        }
    }

    /// The root directory of an export.
    pub fn root(export_id: u32) -> Self {
        Self::new(NodeType::Directory, 0, 0, 0o755, ROOT_FILE_ID, export_id)
    }

    /// A symlink node pointing at `target`.
    pub fn symlink(
        uid: u32,
        gid: u32,
        file_id: u64,
        export_id: u32,
        target: impl Into<String>,
    ) -> Self {
        let mut node = Self::new(NodeType::Symlink, uid, gid, 0o777, file_id, export_id);
        node.symlink_target = Some(target.into());
        node
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn is_directory(&self) -> bool {
        self.node_type == NodeType::Directory
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn export_id(&self) -> u32 {
        self.export_id
    }

    pub fn atime(&self) -> DateTime<Utc> {
        self.atime
    }

    pub fn mtime(&self) -> DateTime<Utc> {
        self.mtime
    }

    pub fn ctime(&self) -> DateTime<Utc> {
        self.ctime
    }

    pub fn links(&self) -> &BTreeMap<u64, String> {
        &self.links
    }

    pub fn symlink_target(&self) -> Option<&str> {
        self.symlink_target.as_deref()
    }

    pub fn is_root(&self) -> bool {
        self.file_id == ROOT_FILE_ID
    }

    /// Name of this node under `parent`, if linked there.
    pub fn name_in(&self, parent: u64) -> Option<&str> {
        self.links.get(&parent).map(String::as_str)
    }

    /// Adds (or renames) the link under `parent`.
    pub fn with_link(&self, parent: u64, name: impl Into<String>) -> Self {
        let mut updated = self.clone();
        updated.links.insert(parent, name.into());
        updated.ctime = now();
        updated
    }

    pub fn without_link(&self, parent: u64) -> Self {
        let mut updated = self.clone();
        updated.links.remove(&parent);
        updated.ctime = now();
        updated
    }

    pub fn with_updated_atime(&self) -> Self {
        Self {
            atime: now(),
            ..self.clone()
        }
    }

    pub fn with_updated_mtime(&self) -> Self {
        let now = now();
        Self {
            mtime: now,
            ctime: now,
            ..self.clone()
        }
    }

    pub fn with_mode(&self, mode: u32) -> Self {
        Self {
            mode,
            ctime: now(),
            ..self.clone()
        }
    }

    /// Copy carrying, per timestamp, the later of its own and `other`'s.
    pub fn with_latest_times(&self, other: &InodeMetadata) -> Self {
        Self {
            atime: self.atime.max(other.atime),
            mtime: self.mtime.max(other.mtime),
            ctime: self.ctime.max(other.ctime),
            ..self.clone()
        }
    }

    pub fn as_inode(&self, export_id: u32) -> Inode {
        Inode::new(export_id, self.file_id)
    }

    /// Canonical key-value form stored as blob metadata.
    pub fn to_metadata(&self) -> Result<Metadata, IoError> {
        let links: BTreeMap<String, &String> = self
            .links
            .iter()
            .map(|(parent, name)| (parent.to_string(), name))
            .collect();
        let links = serde_json::to_string(&links)
            .map_err(|e| IoError::Codec(format!("failed to encode links: {}", e)))?;

        let mut metadata = Metadata::new();
        metadata.insert(FIELD_TYPE.into(), self.node_type.as_str().into());
        metadata.insert(FIELD_UID.into(), self.uid.to_string());
        metadata.insert(FIELD_GID.into(), self.gid.to_string());
        metadata.insert(FIELD_MODE.into(), format!("{:o}", self.mode));
        metadata.insert(FIELD_FILE_ID.into(), self.file_id.to_string());
        metadata.insert(FIELD_EXPORT_ID.into(), self.export_id.to_string());
        metadata.insert(FIELD_ATIME.into(), self.atime.timestamp_millis().to_string());
        metadata.insert(FIELD_MTIME.into(), self.mtime.timestamp_millis().to_string());
        metadata.insert(FIELD_CTIME.into(), self.ctime.timestamp_millis().to_string());
        metadata.insert(FIELD_LINKS.into(), links);
        if let Some(target) = &self.symlink_target {
            metadata.insert(FIELD_SYMLINK_TARGET.into(), target.clone());
        }
        Ok(metadata)
    }

    pub fn from_metadata(metadata: &Metadata) -> Result<Self, IoError> {
        let field = |name: &str| -> Result<&String, IoError> {
            metadata
                .get(name)
                .ok_or_else(|| IoError::Codec(format!("inode record has no {} field", name)))
        };
        let number = |name: &str| -> Result<u64, IoError> {
            let raw = field(name)?;
            raw.parse()
                .map_err(|e| IoError::Codec(format!("inode field {} = {:?}: {}", name, raw, e)))
        };
        let time = |name: &str| -> Result<DateTime<Utc>, IoError> {
            let raw = field(name)?;
            let millis: i64 = raw
                .parse()
                .map_err(|e| IoError::Codec(format!("inode field {} = {:?}: {}", name, raw, e)))?;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| IoError::Codec(format!("inode field {} out of range", name)))
        };
        let narrow = |name: &str| -> Result<u32, IoError> {
            u32::try_from(number(name)?)
                .map_err(|_| IoError::Codec(format!("inode field {} out of range", name)))
        };

        let node_type: NodeType = field(FIELD_TYPE)?.parse().map_err(IoError::Codec)?;
        let mode = u32::from_str_radix(field(FIELD_MODE)?, 8)
            .map_err(|e| IoError::Codec(format!("inode mode: {}", e)))?;
        let raw_links: BTreeMap<String, String> = serde_json::from_str(field(FIELD_LINKS)?)
            .map_err(|e| IoError::Codec(format!("inode links: {}", e)))?;
        let mut links = BTreeMap::new();
        for (parent, name) in raw_links {
            let parent = parent
                .parse()
                .map_err(|e| IoError::Codec(format!("inode link parent {:?}: {}", parent, e)))?;
            links.insert(parent, name);
        }

        Ok(Self {
            node_type,
            uid: narrow(FIELD_UID)?,
            gid: narrow(FIELD_GID)?,
            mode,
            file_id: number(FIELD_FILE_ID)?,
            export_id: narrow(FIELD_EXPORT_ID)?,
            atime: time(FIELD_ATIME)?,
            mtime: time(FIELD_MTIME)?,
            ctime: time(FIELD_CTIME)?,
            links,
            symlink_target: metadata.get(FIELD_SYMLINK_TARGET).cloned(),
        })
    }
}

/// Protocol-facing handle of a node: its export id and file id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Inode {
    export_id: u32,
    file_id: u64,
}

impl Inode {
    pub fn new(export_id: u32, file_id: u64) -> Self {
        Self { export_id, file_id }
    }

    /// Handle of an export's root directory.
    pub fn root(export_id: u32) -> Self {
        Self::new(export_id, ROOT_FILE_ID)
    }

    pub fn export_id(&self) -> u32 {
        self.export_id
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn is_root(&self) -> bool {
        self.file_id == ROOT_FILE_ID
    }

    /// Flags byte, export id and file id, integers big endian.
    pub fn to_handle(&self) -> [u8; HANDLE_LEN] {
        let mut handle = [0u8; HANDLE_LEN];
        handle[0] = if self.is_root() { ROOT_FLAG } else { 0 };
        handle[1..5].copy_from_slice(&self.export_id.to_be_bytes());
        handle[5..].copy_from_slice(&self.file_id.to_be_bytes());
        handle
    }

    pub fn from_handle(handle: &[u8]) -> Result<Self, IoError> {
        let handle: &[u8; HANDLE_LEN] = handle.try_into().map_err(|_| {
            IoError::invalid(format!(
                "inode handle must be {} bytes, got {}",
                HANDLE_LEN,
                handle.len()
            ))
        })?;
        let flags = handle[0];
        if flags & !ROOT_FLAG != 0 {
            return Err(IoError::invalid(format!("unknown inode handle flags {:#04x}", flags)));
        }

        let mut export_id = [0u8; 4];
        export_id.copy_from_slice(&handle[1..5]);
        let mut file_id = [0u8; 8];
        file_id.copy_from_slice(&handle[5..]);
        let inode = Self::new(u32::from_be_bytes(export_id), u64::from_be_bytes(file_id));

        if (flags & ROOT_FLAG != 0) != inode.is_root() {
            return Err(IoError::invalid("inode handle root flag does not match file id"));
        }
        Ok(inode)
    }
}

impl fmt::Display for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.export_id, self.file_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InodeMetadata {
        InodeMetadata::new(NodeType::Regular, 1000, 100, 0o644, 42, 7)
            .with_link(1, "a.txt")
            .with_link(9, "b.txt")
    }

    #[test]
    fn test_metadata_round_trip_is_structural() {
        let node = sample();
        let decoded = InodeMetadata::from_metadata(&node.to_metadata().unwrap()).unwrap();
        assert_eq!(decoded, node);

        let link = InodeMetadata::symlink(0, 0, 5, 7, "../target");
        let decoded = InodeMetadata::from_metadata(&link.to_metadata().unwrap()).unwrap();
        assert_eq!(decoded.symlink_target(), Some("../target"));
        assert_eq!(decoded, link);
    }

    #[test]
    fn test_copy_on_write() {
        let node = sample();
        let unlinked = node.without_link(1);
        assert_eq!(node.links().len(), 2);
        assert_eq!(unlinked.links().len(), 1);
        assert_eq!(unlinked.name_in(9), Some("b.txt"));
        assert_ne!(node, unlinked);

        let chmod = node.with_mode(0o600);
        assert_eq!(chmod.mode(), 0o600);
        assert_eq!(node.mode(), 0o644);
    }

    #[test]
    fn test_latest_times_win() {
        let node = sample();
        let later = InodeMetadata {
            mtime: node.mtime + chrono::Duration::seconds(5),
            ..node.clone()
        };
        let earlier = InodeMetadata {
            atime: node.atime - chrono::Duration::seconds(5),
            mode: 0o600,
            ..node.clone()
        };

        let merged = earlier.with_latest_times(&later);
        assert_eq!(merged.mtime(), later.mtime());
        assert_eq!(merged.atime(), node.atime());
        assert_eq!(merged.mode(), 0o600);
    }

    #[test]
    fn test_corrupt_record_rejected() {
        let mut metadata = sample().to_metadata().unwrap();
        metadata.insert(FIELD_TYPE.into(), "socket".into());
        assert!(matches!(
            InodeMetadata::from_metadata(&metadata),
            Err(IoError::Codec(_))
        ));

        let mut metadata = sample().to_metadata().unwrap();
        metadata.remove(FIELD_LINKS);
        assert!(InodeMetadata::from_metadata(&metadata).is_err());
    }

    #[test]
    fn test_handle_encoding() {
        let inode = sample().as_inode(7);
        let handle = inode.to_handle();
        assert_eq!(handle[0], 0);
        assert_eq!(&handle[1..5], &7u32.to_be_bytes());
        assert_eq!(&handle[5..], &42u64.to_be_bytes());
        assert_eq!(Inode::from_handle(&handle).unwrap(), inode);

        let root = Inode::root(3).to_handle();
        assert_eq!(root[0], ROOT_FLAG);
        assert!(Inode::from_handle(&root).unwrap().is_root());
    }

    #[test]
    fn test_malformed_handles() {
        assert!(Inode::from_handle(&[0u8; 12]).is_err());

        let mut handle = Inode::new(1, 42).to_handle();
        handle[0] = 0x80;
        assert!(Inode::from_handle(&handle).is_err());

        handle[0] = ROOT_FLAG;
        assert!(Inode::from_handle(&handle).is_err());
    }
}
