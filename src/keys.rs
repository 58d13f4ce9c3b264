//! Composite keys addressing blob metadata and object chunks.
//!
//! Keys order lexicographically over (domain, volume, blob name[, offset]),
//! with unpopulated components sorting first. A prefix key is a [`MetaKey`]
//! with trailing components left out, so every key matching a prefix sorts
//! at or after it and all matches are contiguous.

use std::collections::BTreeMap;
use std::fmt;

/// Key-value attributes stored alongside a blob.
pub type Metadata = BTreeMap<String, String>;

/// Index of a fixed-size chunk within a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectOffset(u64);

impl ObjectOffset {
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// First logical byte covered by this chunk.
    pub fn start(self, object_size: usize) -> u64 {
        self.0 * object_size as u64
    }
}

impl From<u64> for ObjectOffset {
    fn from(index: u64) -> Self {
        Self(index)
    }
}

impl fmt::Display for ObjectOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Addresses the metadata of one blob, or a range of blobs when used as a
/// prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetaKey {
    domain: String,
    volume: Option<String>,
    blob_name: Option<String>,
}

impl MetaKey {
    /// Fully populated key for a single blob.
    pub fn new(
        domain: impl Into<String>,
        volume: impl Into<String>,
        blob_name: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            volume: Some(volume.into()),
            blob_name: Some(blob_name.into()),
        }
    }

    /// Prefix matching every blob of a domain.
    pub fn domain_prefix(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            volume: None,
            blob_name: None,
        }
    }

    /// Prefix matching every blob of a volume.
    pub fn volume_prefix(domain: impl Into<String>, volume: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            volume: Some(volume.into()),
            blob_name: None,
        }
    }

    /// Prefix matching every blob of a volume whose name starts with
    /// `name_prefix`.
    pub fn blob_prefix(
        domain: impl Into<String>,
        volume: impl Into<String>,
        name_prefix: impl Into<String>,
    ) -> Self {
        Self::new(domain, volume, name_prefix)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn volume(&self) -> Option<&str> {
        self.volume.as_deref()
    }

    pub fn blob_name(&self) -> Option<&str> {
        self.blob_name.as_deref()
    }

    /// True when every component is populated, i.e. the key names one blob.
    pub fn is_complete(&self) -> bool {
        self.volume.is_some() && self.blob_name.is_some()
    }

    /// Same domain and volume, different blob name.
    pub fn with_blob_name(&self, blob_name: impl Into<String>) -> Self {
        Self {
            domain: self.domain.clone(),
            volume: self.volume.clone(),
            blob_name: Some(blob_name.into()),
        }
    }

    /// Key of chunk `offset` of this blob.
    pub fn object(&self, offset: impl Into<ObjectOffset>) -> ObjectKey {
        ObjectKey::new(self.clone(), offset)
    }

    /// Prefix match: domain and volume must be equal where the prefix
    /// populates them, and the blob name must start with the prefix's blob
    /// name.
    pub fn begins_with(&self, prefix: &MetaKey) -> bool {
        if self.domain != prefix.domain {
            return false;
        }
        match (&prefix.volume, &self.volume) {
            (None, _) => return true,
            (Some(p), Some(v)) if p == v => {}
            _ => return false,
        }
        match (&prefix.blob_name, &self.blob_name) {
            (None, _) => true,
            (Some(p), Some(b)) => b.starts_with(p.as_str()),
            (Some(_), None) => false,
        }
    }
}

impl fmt::Display for MetaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.domain)?;
        if let Some(volume) = &self.volume {
            write!(f, "/{}", volume)?;
        }
        if let Some(blob_name) = &self.blob_name {
            write!(f, "/{}", blob_name)?;
        }
        Ok(())
    }
}

/// Addresses one chunk of one blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    blob: MetaKey,
    offset: ObjectOffset,
}

impl ObjectKey {
    pub fn new(blob: MetaKey, offset: impl Into<ObjectOffset>) -> Self {
        Self {
            blob,
            offset: offset.into(),
        }
    }

    /// The metadata key of the blob owning this chunk.
    pub fn blob(&self) -> &MetaKey {
        &self.blob
    }

    pub fn offset(&self) -> ObjectOffset {
        self.offset
    }

    /// Same chunk index under another blob key.
    pub fn with_blob(&self, blob: MetaKey) -> Self {
        Self {
            blob,
            offset: self.offset,
        }
    }

    /// Exact match on every component the prefix populates. Unlike
    /// [`MetaKey::begins_with`], a populated blob name must be equal, which
    /// scopes a scan or bulk delete to a single blob.
    pub fn begins_with(&self, prefix: &MetaKey) -> bool {
        if self.blob.domain != prefix.domain {
            return false;
        }
        match &prefix.volume {
            None => return true,
            Some(v) if self.blob.volume.as_ref() == Some(v) => {}
            Some(_) => return false,
        }
        match &prefix.blob_name {
            None => true,
            Some(b) => self.blob.blob_name.as_ref() == Some(b),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.blob, self.offset)
    }
}
