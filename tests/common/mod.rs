use once_cell::sync::Lazy;
use std::path::PathBuf;
use std::sync::Arc;
use ukai::directory::MemoryDirectory;
use ukai::{UkaiConfig, UkaiCore};

#[allow(dead_code)]
pub fn init_logging() {
    static INIT: Lazy<()> = Lazy::new(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
    Lazy::force(&INIT);
}

#[allow(dead_code)]
pub fn node_config(data_root: PathBuf, core_server: &str) -> UkaiConfig {
    UkaiConfig {
        data_root,
        core_server: core_server.to_string(),
        // Keep transport failures in tests quick.
        rpc_timeout_ms: 3_000,
        ..UkaiConfig::default()
    }
}

/// A core backed by an in-process directory, for single-node tests.
#[allow(dead_code)]
pub fn memory_core(data_root: PathBuf) -> (Arc<UkaiCore>, Arc<MemoryDirectory>) {
    init_logging();
    let directory = Arc::new(MemoryDirectory::new());
    let core = UkaiCore::new(node_config(data_root, "127.0.0.1"), directory.clone());
    (core, directory)
}

/// Grab a free TCP port from the kernel.
#[allow(dead_code)]
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}
