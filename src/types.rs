use jsonrpsee::types::ErrorObjectOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const UKAI_CONFIG_FILE_DEFAULT: &str = "/etc/ukai/config";

/// Node configuration, loaded once at startup from a JSON file.
///
/// The file may contain `#` comment lines; they are stripped before
/// parsing. All keys except `data_root` and `core_server` have defaults.
///
/// Example:
/// ```json
/// {
///     # storage and identity
///     "data_root": "/var/lib/ukai/data",
///     "core_server": "192.0.2.10",
///     "metadata_servers": ["192.0.2.100:22223"]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UkaiConfig {
    /// Root directory of the local block files.
    pub data_root: PathBuf,
    /// Addresses (`host:port`) of the metadata directory cluster.
    #[serde(default)]
    pub metadata_servers: Vec<String>,
    /// Address of this node's core service; peers reach us here and the
    /// address always counts as local.
    pub core_server: String,
    /// Port of the core service, shared by every node of a deployment.
    #[serde(default = "default_core_port")]
    pub core_port: u16,
    /// Filename format of block files, `%0<width>d` style.
    #[serde(default = "default_blockname_format")]
    pub blockname_format: String,
    /// Defaults applied when creating new images.
    #[serde(default)]
    pub create_default: CreateDefaults,
    /// Identity used for reader-set membership; defaults to `core_server`.
    #[serde(default)]
    pub id: Option<String>,
    /// Cache the interface-address enumeration for one second.
    #[serde(default = "default_true")]
    pub ifaddr_cache: bool,
    /// Options forwarded to the filesystem frontend.
    #[serde(default)]
    pub fuse_options: FuseOptions,
    /// Request timeout for peer and directory RPCs, in milliseconds.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDefaults {
    /// Block size for `ctl_create_image` when the caller leaves it unset.
    #[serde(default = "default_block_size")]
    pub block_size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FuseOptions {
    #[serde(default)]
    pub nothreads: bool,
}

fn default_core_port() -> u16 {
    22222
}

fn default_blockname_format() -> String {
    "%016d".to_string()
}

fn default_block_size() -> u64 {
    4 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_rpc_timeout_ms() -> u64 {
    30_000
}

impl Default for CreateDefaults {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
        }
    }
}

impl Default for UkaiConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/var/lib/ukai/data"),
            metadata_servers: Vec::new(),
            core_server: "127.0.0.1".to_string(),
            core_port: default_core_port(),
            blockname_format: default_blockname_format(),
            create_default: CreateDefaults::default(),
            id: None,
            ifaddr_cache: default_true(),
            fuse_options: FuseOptions::default(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

impl UkaiConfig {
    /// Load the configuration file, stripping `#` comment lines.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, UkaiError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| {
            UkaiError::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        let stripped: String = raw
            .lines()
            .filter(|line| !line.trim_start().starts_with('#'))
            .collect::<Vec<_>>()
            .join("\n");
        serde_json::from_str(&stripped)
            .map_err(|e| UkaiError::Config(format!("malformed config file {}: {}", path.display(), e)))
    }

    /// The identity this node uses in reader sets.
    pub fn node_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.core_server)
    }

    /// Format a block index per `blockname_format`.
    ///
    /// Only the `%0<width>d` and `%d` forms are recognised; anything else
    /// falls back to the canonical 16-digit zero-padded form.
    pub fn block_file_name(&self, block_index: u64) -> String {
        let fmt = self.blockname_format.as_str();
        if fmt == "%d" {
            return block_index.to_string();
        }
        if let Some(width) = fmt
            .strip_prefix("%0")
            .and_then(|rest| rest.strip_suffix('d'))
            .and_then(|digits| digits.parse::<usize>().ok())
        {
            return format!("{:0width$}", block_index, width = width);
        }
        format!("{:016}", block_index)
    }
}

/// JSON-RPC error codes carried by every logical error, so that a caller
/// can recover the error kind from a reply.
pub mod error_codes {
    pub const NOT_FOUND: i32 = -32001;
    pub const BUSY: i32 = -32002;
    pub const INVALID: i32 = -32003;
    pub const PERMISSION_DENIED: i32 = -32004;
    pub const EXISTS: i32 = -32005;
    pub const DATA_UNAVAILABLE: i32 = -32006;
    pub const TRANSPORT_ERROR: i32 = -32007;
    pub const IO_ERROR: i32 = -32008;
    pub const METADATA_ERROR: i32 = -32009;
    pub const DIRECTORY_ERROR: i32 = -32010;
    pub const CONFIG_ERROR: i32 = -32011;
}

/// Error kinds of the UKAI system.
///
/// `Transport` and `Io` are the transient per-peer failures that the data
/// engine masks through the failure-suspension cache; the other kinds are
/// surfaced to the caller unchanged.
#[derive(Debug, thiserror::Error)]
pub enum UkaiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("busy: {0}")]
    Busy(String),
    #[error("invalid argument: {0}")]
    Invalid(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("already exists: {0}")]
    Exists(String),
    #[error("data unavailable: {0}")]
    DataUnavailable(String),
    #[error("transport failure talking to {peer}: {detail}")]
    Transport { peer: String, detail: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata error: {0}")]
    Metadata(String),
    #[error("directory error: {0}")]
    Directory(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl UkaiError {
    /// True for the failures that should suspend a peer and demote its
    /// replica rather than fail the whole operation.
    pub fn is_peer_failure(&self) -> bool {
        matches!(self, UkaiError::Transport { .. } | UkaiError::Io(_))
    }

    /// POSIX errno for the kinds that have a VFS ancestor; everything
    /// without one maps to EIO.
    pub fn errno(&self) -> i32 {
        match self {
            UkaiError::NotFound(_) => 2,          // ENOENT
            UkaiError::PermissionDenied(_) => 1,  // EPERM
            UkaiError::Busy(_) => 16,             // EBUSY
            UkaiError::Exists(_) => 17,           // EEXIST
            UkaiError::Invalid(_) => 22,          // EINVAL
            _ => 5,                               // EIO
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            UkaiError::NotFound(_) => error_codes::NOT_FOUND,
            UkaiError::Busy(_) => error_codes::BUSY,
            UkaiError::Invalid(_) => error_codes::INVALID,
            UkaiError::PermissionDenied(_) => error_codes::PERMISSION_DENIED,
            UkaiError::Exists(_) => error_codes::EXISTS,
            UkaiError::DataUnavailable(_) => error_codes::DATA_UNAVAILABLE,
            UkaiError::Transport { .. } => error_codes::TRANSPORT_ERROR,
            UkaiError::Io(_) => error_codes::IO_ERROR,
            UkaiError::Metadata(_) => error_codes::METADATA_ERROR,
            UkaiError::Directory(_) => error_codes::DIRECTORY_ERROR,
            UkaiError::Config(_) => error_codes::CONFIG_ERROR,
        }
    }

    /// Rebuild the error kind from a JSON-RPC error object; codes outside
    /// our space become `Metadata` (a peer speaking another protocol).
    pub fn from_error_object(err: &ErrorObjectOwned, peer: &str) -> Self {
        let message = err.message().to_string();
        match err.code() {
            error_codes::NOT_FOUND => UkaiError::NotFound(message),
            error_codes::BUSY => UkaiError::Busy(message),
            error_codes::INVALID => UkaiError::Invalid(message),
            error_codes::PERMISSION_DENIED => UkaiError::PermissionDenied(message),
            error_codes::EXISTS => UkaiError::Exists(message),
            error_codes::DATA_UNAVAILABLE => UkaiError::DataUnavailable(message),
            error_codes::TRANSPORT_ERROR => UkaiError::Transport {
                peer: peer.to_string(),
                detail: message,
            },
            error_codes::IO_ERROR => UkaiError::Io(std::io::Error::other(message)),
            error_codes::METADATA_ERROR => UkaiError::Metadata(message),
            error_codes::DIRECTORY_ERROR => UkaiError::Directory(message),
            error_codes::CONFIG_ERROR => UkaiError::Config(message),
            other => UkaiError::Metadata(format!("unexpected error code {} from {}: {}", other, peer, message)),
        }
    }

    /// Classify a client-side RPC failure: a logical error reported by the
    /// callee keeps its kind, anything at the transport layer (connect,
    /// timeout, parse) becomes `Transport`.
    pub fn from_client_error(peer: &str, err: jsonrpsee::core::client::Error) -> Self {
        match err {
            jsonrpsee::core::client::Error::Call(obj) => Self::from_error_object(&obj, peer),
            other => UkaiError::Transport {
                peer: peer.to_string(),
                detail: other.to_string(),
            },
        }
    }
}

impl From<UkaiError> for ErrorObjectOwned {
    fn from(err: UkaiError) -> Self {
        ErrorObjectOwned::owned(err.code(), err.to_string(), None::<()>)
    }
}
