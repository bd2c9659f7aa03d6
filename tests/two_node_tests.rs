// Two core services on distinct loopback addresses sharing one RPC
// metadata directory: on-write healing of a freshly added replica,
// degradation when the peer dies, and metadata fan-out to a peer
// hypervisor.
//
// Node A is 127.0.0.1 and node B is 127.0.0.2; both bind the same port
// so that the uniform `core_port` addressing holds, like a real
// deployment with one address per node.

use serial_test::serial;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;
use ukai::directory::{MemoryDirectory, MetadataDirectory, RpcDirectory, serve_directory};
use ukai::rpc::O_RDWR;
use ukai::{CoreServer, SyncStatus, UkaiConfig, UkaiCore};

#[path = "common/mod.rs"]
mod common;

struct Cluster {
    core_a: Arc<UkaiCore>,
    core_b: Arc<UkaiCore>,
    server_a: CoreServer,
    server_b: CoreServer,
    directory: Arc<MemoryDirectory>,
    dir_handle: jsonrpsee::server::ServerHandle,
    _tmp_a: TempDir,
    tmp_b: TempDir,
}

async fn start_cluster() -> Cluster {
    common::init_logging();
    let directory = Arc::new(MemoryDirectory::new());
    let (dir_handle, dir_addr) = serve_directory("127.0.0.1:0", directory.clone())
        .await
        .expect("start directory");

    let core_port = common::free_port();
    let tmp_a = TempDir::new().expect("tempdir a");
    let tmp_b = TempDir::new().expect("tempdir b");

    let node = |data_root: std::path::PathBuf, host: &str| UkaiConfig {
        core_port,
        metadata_servers: vec![dir_addr.to_string()],
        ..common::node_config(data_root, host)
    };
    let config_a = node(tmp_a.path().to_path_buf(), "127.0.0.1");
    let config_b = node(tmp_b.path().to_path_buf(), "127.0.0.2");

    let core_a = UkaiCore::new(
        config_a.clone(),
        Arc::new(RpcDirectory::from_config(&config_a).expect("directory client")),
    );
    let core_b = UkaiCore::new(
        config_b.clone(),
        Arc::new(RpcDirectory::from_config(&config_b).expect("directory client")),
    );
    let server_a = CoreServer::start(core_a.clone()).await.expect("start node a");
    let server_b = CoreServer::start(core_b.clone()).await.expect("start node b");

    Cluster {
        core_a,
        core_b,
        server_a,
        server_b,
        directory,
        dir_handle,
        _tmp_a: tmp_a,
        tmp_b,
    }
}

impl Cluster {
    async fn shutdown(self) {
        self.server_a.stop().await;
        self.server_b.stop().await;
        let _ = self.dir_handle.stop();
        self.dir_handle.stopped().await;
    }
}

#[tokio::test(flavor = "current_thread")]
#[serial]
async fn test_write_heals_fresh_replica_then_degrades_when_peer_dies() {
    let cluster = start_cluster().await;
    let core_a = &cluster.core_a;

    core_a
        .ctl_create_image("img", 64, Some(16), Some("127.0.0.1".to_string()))
        .await
        .expect("create image");
    let fh = core_a.open("/img", O_RDWR).await.expect("open");

    core_a
        .ctl_add_location("img", "127.0.0.2", None, None, SyncStatus::OutOfSync)
        .await
        .expect("add replica");

    // The write hits block 0 only; its stale replica on B is healed
    // first, then receives the piece.
    assert_eq!(core_a.write("/img", b"hello", 10).await.expect("write"), 5);

    let value = core_a.ctl_get_metadata("img").await.expect("metadata");
    let blocks = value["blocks"].as_array().expect("blocks");
    assert_eq!(blocks[0]["127.0.0.2"]["sync_status"], 0);
    for block in &blocks[1..] {
        assert_eq!(block["127.0.0.2"]["sync_status"], 2);
    }

    // B holds block 0 byte-identical to A.
    let block_a = cluster
        .core_a
        .proxy_read("img", 16, 0, 0, 16)
        .expect("block on a");
    let block_b = cluster
        .core_b
        .proxy_read("img", 16, 0, 0, 16)
        .expect("block on b");
    assert_eq!(block_a, block_b);
    let mut expected = vec![0u8; 16];
    expected[10..15].copy_from_slice(b"hello");
    assert_eq!(block_a, expected);

    // The block file exists on B's disk, sized to the block.
    let b_file = cluster.tmp_b.path().join("img").join("0000000000000000");
    assert_eq!(fs::metadata(&b_file).expect("stat").len(), 16);

    // Kill node B; the next write spans blocks 0 and 1 and still
    // returns in full, demoting B's replicas and suspending the peer.
    cluster.server_b.stop().await;
    assert_eq!(
        core_a.write("/img", b"ABCDEFGH", 14).await.expect("write"),
        8
    );
    let value = core_a.ctl_get_metadata("img").await.expect("metadata");
    let blocks = value["blocks"].as_array().expect("blocks");
    assert_eq!(blocks[0]["127.0.0.2"]["sync_status"], 2);
    assert_eq!(blocks[1]["127.0.0.2"]["sync_status"], 2);
    assert_eq!(blocks[0]["127.0.0.1"]["sync_status"], 0);
    assert_eq!(blocks[1]["127.0.0.1"]["sync_status"], 0);

    let errors = core_a.ctl_get_node_error_state_set();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].address, "127.0.0.2");

    // Reads keep working from the surviving replica.
    assert_eq!(core_a.read("/img", 8, 14).await.expect("read"), b"ABCDEFGH");

    core_a.release("/img", fh).await.expect("release");
    cluster.server_a.stop().await;
    let _ = cluster.dir_handle.stop();
    cluster.dir_handle.stopped().await;
}

#[tokio::test(flavor = "current_thread")]
#[serial]
async fn test_metadata_fans_out_to_peer_hypervisor() {
    let cluster = start_cluster().await;

    cluster
        .core_a
        .ctl_create_image("img", 64, Some(16), Some("127.0.0.1".to_string()))
        .await
        .expect("create image");

    // Adding B as a hypervisor flushes, and the flush pushes the full
    // record to B, which materialises the image there.
    cluster
        .core_a
        .ctl_add_hypervisor("img", "127.0.0.2")
        .await
        .expect("add hypervisor");

    assert!(cluster.core_b.readdir("/").contains(&"img".to_string()));
    let value = cluster.core_b.ctl_get_metadata("img").await.expect("metadata");
    assert_eq!(
        value["hypervisors"],
        serde_json::json!(["127.0.0.1", "127.0.0.2"])
    );

    // B can open the image without any data copy; that is the
    // migration-without-copy property.
    let fh = cluster.core_b.open("/img", O_RDWR).await.expect("open on b");
    assert_eq!(
        cluster.directory.get_readers("img").await.expect("readers"),
        vec!["127.0.0.2"]
    );
    cluster.core_b.release("/img", fh).await.expect("release");
    assert!(
        cluster
            .directory
            .get_readers("img")
            .await
            .expect("readers")
            .is_empty()
    );

    cluster.shutdown().await;
}

#[tokio::test(flavor = "current_thread")]
#[serial]
async fn test_destroy_image_reaches_remote_location() {
    let cluster = start_cluster().await;
    let core_a = &cluster.core_a;

    core_a
        .ctl_create_image("img", 64, Some(16), Some("127.0.0.1".to_string()))
        .await
        .expect("create image");
    let fh = core_a.open("/img", O_RDWR).await.expect("open");
    core_a
        .ctl_add_location("img", "127.0.0.2", None, None, SyncStatus::OutOfSync)
        .await
        .expect("add replica");
    core_a.write("/img", b"payload", 0).await.expect("write");
    core_a.release("/img", fh).await.expect("release");

    assert!(cluster.tmp_b.path().join("img").exists());
    core_a.ctl_destroy_image("img").await.expect("destroy");
    assert!(!cluster.tmp_b.path().join("img").exists());
    assert!(
        core_a
            .ctl_get_image_names()
            .await
            .expect("names")
            .is_empty()
    );

    cluster.shutdown().await;
}
