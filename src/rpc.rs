//! RPC surface and wire codec.
//!
//! Every verb of the system — filesystem, proxy, and control — travels
//! over the same JSON-RPC transport with positional parameters. Opaque
//! byte payloads are hex-armoured; block data and metadata pushes are
//! additionally deflate-compressed end-to-end. The default client policy
//! is one connection per call.

use crate::node_error::NodeErrorEntry;
use crate::stats::BlockIoStats;
use crate::types::{UkaiConfig, UkaiError};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use jsonrpsee::core::RpcResult;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::proc_macros::rpc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{Read, Write};
use std::time::Duration;

// POSIX open(2) access-mode bits, as delivered by the VFS frontend.
pub const O_RDONLY: u32 = 0;
pub const O_WRONLY: u32 = 1;
pub const O_RDWR: u32 = 2;
pub const O_ACCMODE: u32 = 3;

pub fn flags_want_write(flags: u32) -> bool {
    flags & O_ACCMODE != O_RDONLY
}

/// Opaque bytes in the JSON envelope, hex-armoured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HexPayload(String);

impl HexPayload {
    pub fn from_bytes(data: &[u8]) -> Self {
        HexPayload(hex::encode(data))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, UkaiError> {
        hex::decode(&self.0).map_err(|e| UkaiError::Invalid(format!("malformed hex payload: {}", e)))
    }

    /// Compress and armour in one step, for bulk block data and metadata
    /// pushes.
    pub fn from_compressed(data: &[u8]) -> Result<Self, UkaiError> {
        Ok(Self::from_bytes(&compress(data)?))
    }

    pub fn decompressed(&self) -> Result<Vec<u8>, UkaiError> {
        decompress(&self.to_bytes()?)
    }
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>, UkaiError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, UkaiError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| UkaiError::Invalid(format!("corrupt deflate payload: {}", e)))?;
    Ok(out)
}

/// Stat record returned by `getattr`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_size: u64,
    pub st_ctime: u64,
    pub st_mtime: u64,
    pub st_atime: u64,
}

impl FileStat {
    pub fn directory() -> Self {
        Self {
            st_mode: 0o040755,
            st_nlink: 2,
            st_size: 0,
            st_ctime: 0,
            st_mtime: 0,
            st_atime: 0,
        }
    }

    pub fn regular(size: u64) -> Self {
        Self {
            st_mode: 0o100644,
            st_nlink: 1,
            st_size: size,
            st_ctime: 0,
            st_mtime: 0,
            st_atime: 0,
        }
    }
}

/// Fixed placeholders; this implementation does not aggregate free space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatFs {
    pub f_bsize: u32,
    pub f_blocks: u64,
    pub f_bavail: u64,
}

impl Default for StatFs {
    fn default() -> Self {
        Self {
            f_bsize: 512,
            f_blocks: 4096,
            f_bavail: 2048,
        }
    }
}

/// The verb set of a core service node. The same surface serves the
/// filesystem frontend, peer data engines, and the control client.
#[rpc(server, client, namespace = "ukai")]
pub trait UkaiApi {
    // Filesystem verbs.
    #[method(name = "getattr")]
    async fn getattr(&self, path: String) -> RpcResult<FileStat>;
    #[method(name = "open")]
    async fn open(&self, path: String, flags: u32) -> RpcResult<u64>;
    #[method(name = "release")]
    async fn release(&self, path: String, fh: u64) -> RpcResult<()>;
    #[method(name = "read")]
    async fn read(&self, path: String, size: u64, offset: u64) -> RpcResult<HexPayload>;
    #[method(name = "write")]
    async fn write(&self, path: String, data: HexPayload, offset: u64) -> RpcResult<u64>;
    #[method(name = "truncate")]
    async fn truncate(&self, path: String, length: u64) -> RpcResult<()>;
    #[method(name = "readdir")]
    async fn readdir(&self, path: String) -> RpcResult<Vec<String>>;
    #[method(name = "statfs")]
    async fn statfs(&self, path: String) -> RpcResult<StatFs>;

    // Proxy verbs, invoked by peer data engines.
    #[method(name = "proxy_read")]
    async fn proxy_read(
        &self,
        image_name: String,
        block_size: u64,
        block_index: u64,
        offset: u64,
        size: u64,
    ) -> RpcResult<HexPayload>;
    #[method(name = "proxy_write")]
    async fn proxy_write(
        &self,
        image_name: String,
        block_size: u64,
        block_index: u64,
        offset: u64,
        data: HexPayload,
    ) -> RpcResult<u64>;
    #[method(name = "proxy_allocate_dataspace")]
    async fn proxy_allocate_dataspace(
        &self,
        image_name: String,
        block_size: u64,
        block_index: u64,
    ) -> RpcResult<()>;
    #[method(name = "proxy_deallocate_dataspace")]
    async fn proxy_deallocate_dataspace(
        &self,
        image_name: String,
        block_index: u64,
    ) -> RpcResult<()>;
    #[method(name = "proxy_destroy_image")]
    async fn proxy_destroy_image(&self, image_name: String) -> RpcResult<()>;
    #[method(name = "proxy_update_metadata")]
    async fn proxy_update_metadata(&self, image_name: String, metadata: HexPayload)
    -> RpcResult<()>;

    // Control verbs.
    #[method(name = "ctl_create_image")]
    async fn ctl_create_image(
        &self,
        image_name: String,
        size: u64,
        block_size: Option<u64>,
        location: Option<String>,
    ) -> RpcResult<()>;
    #[method(name = "ctl_destroy_image")]
    async fn ctl_destroy_image(&self, image_name: String) -> RpcResult<()>;
    #[method(name = "ctl_get_metadata")]
    async fn ctl_get_metadata(&self, image_name: String) -> RpcResult<Value>;
    #[method(name = "ctl_add_location")]
    async fn ctl_add_location(
        &self,
        image_name: String,
        location: String,
        start_index: Option<u64>,
        end_index: Option<u64>,
        sync_status: Option<u8>,
    ) -> RpcResult<()>;
    #[method(name = "ctl_remove_location")]
    async fn ctl_remove_location(
        &self,
        image_name: String,
        location: String,
        start_index: Option<u64>,
        end_index: Option<u64>,
    ) -> RpcResult<()>;
    #[method(name = "ctl_add_hypervisor")]
    async fn ctl_add_hypervisor(&self, image_name: String, hypervisor: String) -> RpcResult<()>;
    #[method(name = "ctl_remove_hypervisor")]
    async fn ctl_remove_hypervisor(&self, image_name: String, hypervisor: String)
    -> RpcResult<()>;
    #[method(name = "ctl_synchronize")]
    async fn ctl_synchronize(
        &self,
        image_name: String,
        start_index: Option<u64>,
        end_index: Option<u64>,
        verbose: bool,
    ) -> RpcResult<()>;
    #[method(name = "ctl_get_node_error_state_set")]
    async fn ctl_get_node_error_state_set(&self) -> RpcResult<Vec<NodeErrorEntry>>;
    #[method(name = "ctl_get_image_names")]
    async fn ctl_get_image_names(&self) -> RpcResult<Vec<String>>;
    #[method(name = "ctl_get_statistics")]
    async fn ctl_get_statistics(&self, image_name: String) -> RpcResult<Vec<BlockIoStats>>;
}

/// The metadata directory contract, served by the directory cluster.
#[rpc(server, client, namespace = "dir")]
pub trait DirectoryApi {
    #[method(name = "put_metadata")]
    async fn put_metadata(&self, image_name: String, payload: Value) -> RpcResult<()>;
    #[method(name = "get_metadata")]
    async fn get_metadata(&self, image_name: String) -> RpcResult<Option<Value>>;
    #[method(name = "delete_metadata")]
    async fn delete_metadata(&self, image_name: String) -> RpcResult<()>;
    #[method(name = "list_images")]
    async fn list_images(&self) -> RpcResult<Vec<String>>;
    #[method(name = "join_reader")]
    async fn join_reader(&self, image_name: String, node: String) -> RpcResult<()>;
    #[method(name = "leave_reader")]
    async fn leave_reader(&self, image_name: String, node: String) -> RpcResult<()>;
    #[method(name = "get_readers")]
    async fn get_readers(&self, image_name: String) -> RpcResult<Vec<String>>;
    #[method(name = "lock_image")]
    async fn lock_image(&self, image_name: String) -> RpcResult<()>;
    #[method(name = "unlock_image")]
    async fn unlock_image(&self, image_name: String) -> RpcResult<()>;
}

/// Client handle for one peer. `connect` opens a fresh connection, the
/// per-call default; hold the returned client only when single-threaded
/// reuse is guaranteed.
#[derive(Debug, Clone)]
pub struct RpcClient {
    peer: String,
    url: String,
    timeout: Duration,
}

impl RpcClient {
    pub fn for_peer(config: &UkaiConfig, host: &str) -> Self {
        Self {
            peer: host.to_string(),
            url: format!("http://{}:{}", host, config.core_port),
            timeout: Duration::from_millis(config.rpc_timeout_ms),
        }
    }

    /// The local core service, reached over the same transport as peers.
    pub fn local(config: &UkaiConfig) -> Self {
        Self::for_peer(config, &config.core_server)
    }

    pub fn for_url(url: &str, timeout: Duration) -> Self {
        Self {
            peer: url.to_string(),
            url: url.to_string(),
            timeout,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn connect(&self) -> Result<HttpClient, UkaiError> {
        HttpClientBuilder::default()
            .request_timeout(self.timeout)
            .build(&self.url)
            .map_err(|e| UkaiError::Transport {
                peer: self.peer.clone(),
                detail: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_roundtrip() {
        let data = b"UKAI block payload \x00\x01\x02 with some repetition repetition";
        let packed = compress(data).expect("compress");
        assert_eq!(decompress(&packed).expect("decompress"), data);
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(decompress(b"not deflate at all").is_err());
    }

    #[test]
    fn test_hex_payload_roundtrip() {
        let payload = HexPayload::from_bytes(&[0, 1, 0xfe, 0xff]);
        assert_eq!(payload.to_bytes().expect("decode"), vec![0, 1, 0xfe, 0xff]);

        let compressed = HexPayload::from_compressed(b"hello").expect("pack");
        assert_eq!(compressed.decompressed().expect("unpack"), b"hello");
    }

    #[test]
    fn test_hex_payload_rejects_bad_hex() {
        let payload: HexPayload = serde_json::from_value(serde_json::json!("zz")).expect("decode");
        assert!(payload.to_bytes().is_err());
    }

    #[test]
    fn test_open_flag_classification() {
        assert!(!flags_want_write(O_RDONLY));
        assert!(flags_want_write(O_WRONLY));
        assert!(flags_want_write(O_RDWR));
        // Extra flags like O_CREAT do not change the access mode.
        assert!(!flags_want_write(0o100));
    }
}
