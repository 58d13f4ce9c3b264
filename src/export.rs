use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::IoError;

/// Maps volume names to the export ids the protocol layer hands out, and
/// supplies each volume's chunk size.
pub trait ExportResolver: Send + Sync {
    fn export_id(&self, volume: &str) -> Option<u32>;
    fn volume_name(&self, export_id: u32) -> Option<String>;
    fn exists(&self, volume: &str) -> bool;
    /// Chunk size of the volume in bytes.
    fn object_size(&self, volume: &str) -> Option<usize>;
}

/// One exported volume.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Export {
    pub volume: String,
    pub export_id: u32,
    #[serde(default = "default_object_size")]
    pub object_size: usize,
}

fn default_object_size() -> usize {
    1024 * 1024
}

/// Resolver over a fixed list of exports, usually read from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticExportResolver {
    by_volume: BTreeMap<String, Export>,
    by_id: BTreeMap<u32, String>,
}

impl StaticExportResolver {
    pub fn new(exports: impl IntoIterator<Item = Export>) -> Result<Self, IoError> {
        let mut resolver = Self::default();
        for export in exports {
            if export.object_size == 0 {
                return Err(IoError::invalid(format!(
                    "export {} has a zero object size",
                    export.volume
                )));
            }
            if resolver.by_volume.contains_key(&export.volume) {
                return Err(IoError::AlreadyExists(format!("export volume {}", export.volume)));
            }
            if resolver.by_id.contains_key(&export.export_id) {
                return Err(IoError::AlreadyExists(format!("export id {}", export.export_id)));
            }
            resolver.by_id.insert(export.export_id, export.volume.clone());
            resolver.by_volume.insert(export.volume.clone(), export);
        }
        Ok(resolver)
    }

    pub fn exports(&self) -> impl Iterator<Item = &Export> {
        self.by_volume.values()
    }
}

impl ExportResolver for StaticExportResolver {
    fn export_id(&self, volume: &str) -> Option<u32> {
        self.by_volume.get(volume).map(|e| e.export_id)
    }

    fn volume_name(&self, export_id: u32) -> Option<String> {
        self.by_id.get(&export_id).cloned()
    }

    fn exists(&self, volume: &str) -> bool {
        self.by_volume.contains_key(volume)
    }

    fn object_size(&self, volume: &str) -> Option<usize> {
        self.by_volume.get(volume).map(|e| e.object_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn export(volume: &str, export_id: u32) -> Export {
        Export {
            volume: volume.into(),
            export_id,
            object_size: 4096,
        }
    }

    #[test]
    fn test_resolves_both_ways() {
        let resolver = StaticExportResolver::new(vec![export("a", 1), export("b", 2)]).unwrap();
        assert_eq!(resolver.export_id("b"), Some(2));
        assert_eq!(resolver.volume_name(1).as_deref(), Some("a"));
        assert_eq!(resolver.object_size("a"), Some(4096));
        assert!(resolver.exists("a"));
        assert!(!resolver.exists("c"));
        assert_eq!(resolver.volume_name(3), None);
    }

    #[test]
    fn test_rejects_duplicates_and_zero_size() {
        assert!(StaticExportResolver::new(vec![export("a", 1), export("a", 2)]).is_err());
        assert!(StaticExportResolver::new(vec![export("a", 1), export("b", 1)]).is_err());

        let mut bad = export("a", 1);
        bad.object_size = 0;
        assert!(StaticExportResolver::new(vec![bad]).is_err());
    }
}
