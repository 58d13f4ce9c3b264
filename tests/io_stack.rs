use std::sync::Arc;
use std::time::Duration;

use blob_nfs::config::BackendKind;
use blob_nfs::io::Durability;
use blob_nfs::{
    Counters, Inode, IoError, IoOps, IoOpsExt, IoStackBuilder, MetaKey, Metadata, NodeType,
    Owner, SharedMetrics, StackConfig,
};

const EXPORT: u32 = 7;
const OWNER: Owner = Owner {
    uid: 1000,
    gid: 100,
    mode: 0o640,
};

fn config(dir: &tempfile::TempDir) -> StackConfig {
    let mut config = StackConfig::from_toml_str(
        r#"
        domain = "tenant"

        [deferred]
        window_ms = 10

        [retry]
        delay_ms = 0

        [[exports]]
        volume = "home"
        export_id = 7
        object_size = 8
        "#,
    )
    .unwrap();
    config.backend.kind = BackendKind::Fjall;
    config.backend.path = dir.path().to_path_buf();
    config.backend.durability = Some(Durability::Buffer);
    config
}

#[tokio::test]
async fn test_files_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let root = Inode::root(EXPORT);

    let (file, first_id) = {
        let stack = IoStackBuilder::new(&config(&dir)).build().unwrap();
        let fs = stack.export_fs().await.unwrap();

        let docs = fs.create(&root, "docs", NodeType::Directory, OWNER).await.unwrap();
        let file = fs
            .create(&docs.as_inode(EXPORT), "notes.txt", NodeType::Regular, OWNER)
            .await
            .unwrap();
        let written = fs
            .write(&file.as_inode(EXPORT), 5, b"across three chunks")
            .await
            .unwrap();
        assert_eq!(written, 24);

        stack.shutdown().await.unwrap();
        (file.as_inode(EXPORT), file.file_id())
    };

    let stack = IoStackBuilder::new(&config(&dir)).build().unwrap();
    let fs = stack.export_fs().await.unwrap();

    let docs = fs.lookup(&root, "docs").await.unwrap();
    let found = fs.lookup(&docs.as_inode(EXPORT), "notes.txt").await.unwrap();
    assert_eq!(found.file_id(), first_id);

    let mut dest = vec![0xffu8; 32];
    let read = fs.read(&file, 0, &mut dest).await.unwrap();
    assert_eq!(read, 24);
    assert_eq!(&dest[..5], &[0u8; 5]);
    assert_eq!(&dest[5..24], b"across three chunks");

    // ids keep growing after the restart
    let other = fs.create(&root, "other", NodeType::Regular, OWNER).await.unwrap();
    assert!(other.file_id() > first_id);
}

#[tokio::test]
async fn test_mutation_visible_through_every_layer() {
    let dir = tempfile::tempdir().unwrap();
    let counters = Arc::new(Counters::new());
    let stack = IoStackBuilder::new(&config(&dir))
        .metrics(SharedMetrics::new(counters.clone()))
        .build()
        .unwrap();
    let io = stack.io();
    let key = MetaKey::new("tenant", "home", "blob");

    // warm the cache with the old value
    io.write_metadata(&key, Metadata::from([("n".to_string(), "0".to_string())]))
        .await
        .unwrap();
    assert!(io.read_metadata(&key).await.unwrap().is_some());

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let io = io.clone();
            let key = key.clone();
            tokio::spawn(async move {
                io.mutate_metadata(
                    &key,
                    Arc::new(|current: Option<Metadata>| -> Result<Metadata, IoError> {
                        let mut metadata = current.unwrap_or_default();
                        let n: u64 = metadata.get("n").map_or(Ok(0), |n| n.parse()).map_err(
                            |e: std::num::ParseIntError| IoError::Codec(e.to_string()),
                        )?;
                        metadata.insert("n".to_string(), (n + 1).to_string());
                        Ok(metadata)
                    }),
                )
                .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let n = io
        .map_metadata(&key, |m| m.and_then(|m| m.get("n").cloned()))
        .await
        .unwrap();
    assert_eq!(n.as_deref(), Some("16"));
    assert!(counters.get("cache_hits") > 0);

    stack.flush().await.unwrap();
    assert!(counters.get("deferred_entries_flushed") > 0);
}

#[tokio::test]
async fn test_unlink_releases_data() {
    let dir = tempfile::tempdir().unwrap();
    let stack = IoStackBuilder::new(&config(&dir)).build().unwrap();
    let fs = stack.export_fs().await.unwrap();
    let root = Inode::root(EXPORT);

    let file = fs
        .create(&root, "scratch", NodeType::Regular, OWNER)
        .await
        .unwrap()
        .as_inode(EXPORT);
    fs.write(&file, 0, &[9u8; 20]).await.unwrap();
    fs.unlink(&root, "scratch").await.unwrap();

    let data = MetaKey::new("tenant", "home", format!("data:{}", file.file_id()));
    assert_eq!(stack.io().read_metadata(&data).await.unwrap(), None);
    assert!(stack.io().read_object(&data.object(1), 8).await.unwrap().is_none());
    assert!(fs.readdir(&root).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_writes_inside_window_survive_dropped_stack() {
    let dir = tempfile::tempdir().unwrap();
    let key = MetaKey::new("tenant", "home", "scratch");
    let metadata = Metadata::from([("k".to_string(), "v".to_string())]);

    {
        let stack = IoStackBuilder::new(&config(&dir)).build().unwrap();
        stack.io().write_metadata(&key, metadata.clone()).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stack = IoStackBuilder::new(&config(&dir)).build().unwrap();
    assert_eq!(stack.io().read_metadata(&key).await.unwrap(), Some(metadata));
}
