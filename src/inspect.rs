//! Offline inspection of a fjall-backed store.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::chunker::{recorded_length, Chunker};
use crate::config::StackConfig;
use crate::io::{FjallIo, IoOps};
use crate::keys::MetaKey;
use crate::persistent_counter::PersistentCounter;

const READ_BUFFER: usize = 1024 * 1024;

fn open(meta_root: &Path) -> Result<FjallIo> {
    FjallIo::open(meta_root, None)
        .with_context(|| format!("failed to open store at {}", meta_root.display()))
}

/// Number of metadata records and of stored chunks.
pub fn num_keys(meta_root: &Path) -> Result<(usize, usize)> {
    Ok(open(meta_root)?.num_keys()?)
}

pub fn disk_space(meta_root: &Path) -> Result<u64> {
    Ok(open(meta_root)?.disk_space())
}

/// Prints every blob of a volume whose name starts with `prefix`.
pub async fn list_blobs(meta_root: &Path, domain: &str, volume: &str, prefix: &str) -> Result<()> {
    let io = open(meta_root)?;
    let blobs = io
        .scan(&MetaKey::blob_prefix(domain, volume, prefix))
        .await?;

    for (key, metadata) in &blobs {
        let name = key.blob_name().unwrap_or_default();
        match recorded_length(metadata)? {
            Some(length) => println!("{:<40} {:>12}", name, format_bytes(length)),
            None => println!("{:<40} {:>12}", name, "-"),
        }
    }
    println!("{} blobs", blobs.len());
    Ok(())
}

pub async fn stat_blob(meta_root: &Path, domain: &str, volume: &str, blob: &str) -> Result<()> {
    let io = open(meta_root)?;
    let key = MetaKey::new(domain, volume, blob);
    let metadata = io
        .read_metadata(&key)
        .await?
        .with_context(|| format!("no blob {}", key))?;

    println!("Blob: {}", key);
    for (name, value) in &metadata {
        println!("  {} = {}", name, value);
    }
    Ok(())
}

/// Copies the contents of a blob to stdout.
pub async fn cat_blob(
    meta_root: &Path,
    domain: &str,
    volume: &str,
    blob: &str,
    object_size: usize,
) -> Result<()> {
    let chunker = Chunker::new(Arc::new(open(meta_root)?));
    let key = MetaKey::new(domain, volume, blob);
    let length = chunker
        .blob_length(&key)
        .await?
        .with_context(|| format!("no blob {}", key))?;

    let mut stdout = std::io::stdout();
    let mut buffer = vec![0u8; READ_BUFFER];
    let mut offset = 0;
    while offset < length {
        let read = chunker
            .read(&key, length, object_size, &mut buffer, offset)
            .await?;
        stdout.write_all(&buffer[..read])?;
        offset += read as u64;
    }
    stdout.flush()?;
    Ok(())
}

pub async fn counter_value(meta_root: &Path, domain: &str, name: &str, key: &str) -> Result<i64> {
    let counter = PersistentCounter::open(Arc::new(open(meta_root)?), domain, name, 0, true).await?;
    Ok(counter.current_value(key).await?)
}

/// Every persisted key of a counter with its value.
pub async fn counter_values(
    meta_root: &Path,
    domain: &str,
    name: &str,
) -> Result<BTreeMap<String, i64>> {
    let counter = PersistentCounter::open(Arc::new(open(meta_root)?), domain, name, 0, true).await?;
    Ok(counter.restored().clone())
}

/// Loads a stack configuration and prints what it describes.
pub fn check_config(path: &Path) -> Result<()> {
    let config = StackConfig::load_from_file(path)?;
    println!("Domain: {}", config.domain);
    println!("Backend: {:?} at {}", config.backend.kind, config.backend.path.display());
    println!(
        "Cache: {} ({} metadata, {} objects)",
        config.cache.enabled, config.cache.metadata_entries, config.cache.object_entries
    );
    println!(
        "Deferred writes: {} ({} ms window)",
        config.deferred.enabled, config.deferred.window_ms
    );
    for export in &config.exports {
        println!(
            "Export {}: volume {}, chunks of {}",
            export.export_id,
            export.volume,
            format_bytes(export.object_size as u64)
        );
    }
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}
