// Core service bookkeeping: open/release lifecycle, writer exclusion,
// stat surface, image creation and destruction.

use tempfile::TempDir;
use ukai::UkaiError;
use ukai::directory::MetadataDirectory;
use ukai::rpc::{O_RDONLY, O_RDWR, O_WRONLY};

#[path = "common/mod.rs"]
mod common;

#[tokio::test(flavor = "current_thread")]
async fn test_create_image_writes_canonical_metadata() {
    let tmp = TempDir::new().expect("tempdir");
    let (core, directory) = common::memory_core(tmp.path().to_path_buf());

    core.ctl_create_image("disk01", 64, Some(16), Some("127.0.0.1".to_string()))
        .await
        .expect("create image");

    let value = directory
        .get_metadata("disk01")
        .await
        .expect("get")
        .expect("metadata present");
    assert_eq!(value["name"], "disk01");
    assert_eq!(value["size"], 64);
    assert_eq!(value["used_size"], 64);
    assert_eq!(value["block_size"], 16);
    assert_eq!(value["hypervisors"], serde_json::json!(["127.0.0.1"]));
    assert_eq!(value["blocks"].as_array().expect("blocks").len(), 4);
    for block in value["blocks"].as_array().expect("blocks") {
        assert_eq!(block["127.0.0.1"]["sync_status"], 0);
    }
}

#[tokio::test(flavor = "current_thread")]
async fn test_create_image_validates_geometry() {
    let tmp = TempDir::new().expect("tempdir");
    let (core, _) = common::memory_core(tmp.path().to_path_buf());

    // size must exceed block_size
    assert!(matches!(
        core.ctl_create_image("bad", 16, Some(16), None).await,
        Err(UkaiError::Invalid(_))
    ));
    // size must be a multiple of block_size
    assert!(matches!(
        core.ctl_create_image("bad", 65, Some(16), None).await,
        Err(UkaiError::Invalid(_))
    ));
    // duplicate names are refused
    core.ctl_create_image("dup", 64, Some(16), None)
        .await
        .expect("create");
    assert!(matches!(
        core.ctl_create_image("dup", 64, Some(16), None).await,
        Err(UkaiError::Exists(_))
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn test_writer_exclusion_is_per_image() {
    let tmp = TempDir::new().expect("tempdir");
    let (core, _) = common::memory_core(tmp.path().to_path_buf());
    core.ctl_create_image("img", 64, Some(16), None)
        .await
        .expect("create");

    let writer_fh = core.open("/img", O_RDWR).await.expect("first write open");

    // A second write open is refused while the first is live.
    assert!(matches!(
        core.open("/img", O_WRONLY).await,
        Err(UkaiError::Busy(_))
    ));
    // Concurrent read opens are fine.
    let reader_fh = core.open("/img", O_RDONLY).await.expect("read open");
    assert_ne!(writer_fh, reader_fh);

    // Releasing the read handle must not clear the writer mark.
    core.release("/img", reader_fh).await.expect("release reader");
    assert!(matches!(
        core.open("/img", O_WRONLY).await,
        Err(UkaiError::Busy(_))
    ));

    core.release("/img", writer_fh).await.expect("release writer");
    let fh = core.open("/img", O_WRONLY).await.expect("write open after release");
    core.release("/img", fh).await.expect("release");
}

#[tokio::test(flavor = "current_thread")]
async fn test_open_tracks_reader_set_and_eviction() {
    let tmp = TempDir::new().expect("tempdir");
    let (core, directory) = common::memory_core(tmp.path().to_path_buf());
    core.ctl_create_image("img", 64, Some(16), None)
        .await
        .expect("create");

    assert!(matches!(
        core.open("/missing", O_RDONLY).await,
        Err(UkaiError::NotFound(_))
    ));

    let fh1 = core.open("/img", O_RDONLY).await.expect("open");
    let fh2 = core.open("/img", O_RDONLY).await.expect("open again");
    assert_eq!(
        directory.get_readers("img").await.expect("readers"),
        vec!["127.0.0.1"]
    );
    assert!(core.readdir("/").contains(&"img".to_string()));

    core.release("/img", fh1).await.expect("release");
    // Still open once; the reader entry stays.
    assert_eq!(
        directory.get_readers("img").await.expect("readers"),
        vec!["127.0.0.1"]
    );

    core.release("/img", fh2).await.expect("release");
    assert!(directory.get_readers("img").await.expect("readers").is_empty());
    assert!(!core.readdir("/").contains(&"img".to_string()));
}

#[tokio::test(flavor = "current_thread")]
async fn test_getattr_and_statfs() {
    let tmp = TempDir::new().expect("tempdir");
    let (core, _) = common::memory_core(tmp.path().to_path_buf());
    core.ctl_create_image("img", 64, Some(16), None)
        .await
        .expect("create");

    let root = core.getattr("/").await.expect("root stat");
    assert_eq!(root.st_mode, 0o040755);
    assert_eq!(root.st_nlink, 2);

    let image = core.getattr("/img").await.expect("image stat");
    assert_eq!(image.st_mode, 0o100644);
    assert_eq!(image.st_size, 64);

    assert!(matches!(
        core.getattr("/nope").await,
        Err(UkaiError::NotFound(_))
    ));

    let statfs = core.statfs();
    assert_eq!(statfs.f_bsize, 512);
    assert_eq!(statfs.f_blocks, 4096);
    assert_eq!(statfs.f_bavail, 2048);
}

#[tokio::test(flavor = "current_thread")]
async fn test_truncate_shrinks_visible_size() {
    let tmp = TempDir::new().expect("tempdir");
    let (core, _) = common::memory_core(tmp.path().to_path_buf());
    core.ctl_create_image("img", 64, Some(16), None)
        .await
        .expect("create");

    // Growing past the image size is refused.
    assert!(matches!(
        core.truncate("/img", 65).await,
        Err(UkaiError::Invalid(_))
    ));

    core.truncate("/img", 40).await.expect("truncate");
    assert_eq!(core.getattr("/img").await.expect("stat").st_size, 40);

    let fh = core.open("/img", O_RDONLY).await.expect("open");
    // Reads clamp at the truncated size.
    let data = core.read("/img", 64, 0).await.expect("read");
    assert_eq!(data.len(), 40);
    core.release("/img", fh).await.expect("release");
}

#[tokio::test(flavor = "current_thread")]
async fn test_destroy_image_removes_data_and_metadata() {
    let tmp = TempDir::new().expect("tempdir");
    let (core, directory) = common::memory_core(tmp.path().to_path_buf());
    core.ctl_create_image("img", 64, Some(16), None)
        .await
        .expect("create");

    let fh = core.open("/img", O_RDWR).await.expect("open");
    core.write("/img", b"payload", 0).await.expect("write");
    assert!(tmp.path().join("img").exists());
    core.release("/img", fh).await.expect("release");

    core.ctl_destroy_image("img").await.expect("destroy");
    assert!(!tmp.path().join("img").exists());
    assert!(directory.get_metadata("img").await.expect("get").is_none());
    assert!(matches!(
        core.ctl_destroy_image("img").await,
        Err(UkaiError::NotFound(_))
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn test_image_names_and_statistics_diagnostics() {
    let tmp = TempDir::new().expect("tempdir");
    let (core, _) = common::memory_core(tmp.path().to_path_buf());
    core.ctl_create_image("alpha", 64, Some(16), None)
        .await
        .expect("create");
    core.ctl_create_image("beta", 64, Some(16), None)
        .await
        .expect("create");

    assert_eq!(
        core.ctl_get_image_names().await.expect("names"),
        vec!["alpha", "beta"]
    );

    let fh = core.open("/alpha", O_RDWR).await.expect("open");
    core.write("/alpha", b"abcd", 14).await.expect("write");
    core.read("/alpha", 4, 0).await.expect("read");
    let stats = core.ctl_get_statistics("alpha");
    // The write straddles blocks 0 and 1, the read touches block 0 only.
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[0].block_index, 0);
    assert_eq!(stats[0].read_ops, 1);
    assert_eq!(stats[0].write_ops, 1);
    assert_eq!(stats[1].block_index, 1);
    assert_eq!(stats[1].write_ops, 1);
    core.release("/alpha", fh).await.expect("release");

    assert!(core.ctl_get_node_error_state_set().is_empty());
}
