use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::export::Export;
use crate::io::Durability;

/// Configuration of one IO stack and the exports served over it.
///
/// ```toml
/// domain = "nfs"
///
/// [backend]
/// kind = "fjall"
/// path = "/var/lib/blob-nfs"
/// durability = "fdatasync"
///
/// [deferred]
/// window_ms = 50
///
/// [[exports]]
/// volume = "home"
/// export_id = 1
/// object_size = 65536
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StackConfig {
    pub domain: String,
    pub backend: BackendConfig,
    pub cache: CacheConfig,
    pub deferred: DeferredConfig,
    pub retry: RetryConfig,
    pub exports: Vec<Export>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            domain: "nfs".to_string(),
            backend: BackendConfig::default(),
            cache: CacheConfig::default(),
            deferred: DeferredConfig::default(),
            retry: RetryConfig::default(),
            exports: Vec::new(),
        }
    }
}

impl StackConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read stack config {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("failed to parse stack config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Fjall,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Keyspace directory, fjall only.
    pub path: PathBuf,
    pub durability: Option<Durability>,
    /// Bytes of chunk data per volume, memory only.
    pub capacity: Option<u64>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Memory,
            path: PathBuf::from(".blob-nfs"),
            durability: Some(Durability::Fdatasync),
            capacity: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub enabled: bool,
    pub metadata_entries: usize,
    pub object_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metadata_entries: 4096,
            object_entries: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeferredConfig {
    pub enabled: bool,
    pub window_ms: u64,
    pub max_pending: usize,
}

impl Default for DeferredConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 100,
            max_pending: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub recoverable_attempts: u32,
    pub timeout_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            recoverable_attempts: 5,
            timeout_attempts: 3,
            delay_ms: 20,
        }
    }
}
