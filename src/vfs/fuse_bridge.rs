//! VFS-to-core translation surface.
//!
//! The kernel-facing filesystem loop lives outside this crate; what it
//! needs from us is one method per VFS verb, each a thin call into the
//! local core service. Namespace mutations are answered here without an
//! RPC — a disk image store is not a general filesystem — and the
//! attribute verbs are accepted as no-ops.

use crate::rpc::{FileStat, HexPayload, RpcClient, StatFs, UkaiApiClient};
use crate::types::{UkaiConfig, UkaiError};

pub struct FuseBridge {
    client: RpcClient,
}

impl FuseBridge {
    pub fn new(config: &UkaiConfig) -> Self {
        Self {
            client: RpcClient::local(config),
        }
    }

    fn wrap(&self, err: jsonrpsee::core::client::Error) -> UkaiError {
        UkaiError::from_client_error(self.client.peer(), err)
    }

    pub async fn getattr(&self, path: &str) -> Result<FileStat, UkaiError> {
        self.client
            .connect()?
            .getattr(path.to_string())
            .await
            .map_err(|e| self.wrap(e))
    }

    pub async fn open(&self, path: &str, flags: u32) -> Result<u64, UkaiError> {
        self.client
            .connect()?
            .open(path.to_string(), flags)
            .await
            .map_err(|e| self.wrap(e))
    }

    pub async fn release(&self, path: &str, fh: u64) -> Result<(), UkaiError> {
        self.client
            .connect()?
            .release(path.to_string(), fh)
            .await
            .map_err(|e| self.wrap(e))
    }

    pub async fn read(
        &self,
        path: &str,
        size: u64,
        offset: u64,
        _fh: u64,
    ) -> Result<Vec<u8>, UkaiError> {
        let payload = self
            .client
            .connect()?
            .read(path.to_string(), size, offset)
            .await
            .map_err(|e| self.wrap(e))?;
        payload.to_bytes()
    }

    pub async fn write(
        &self,
        path: &str,
        data: &[u8],
        offset: u64,
        _fh: u64,
    ) -> Result<u64, UkaiError> {
        self.client
            .connect()?
            .write(path.to_string(), HexPayload::from_bytes(data), offset)
            .await
            .map_err(|e| self.wrap(e))
    }

    pub async fn truncate(&self, path: &str, length: u64) -> Result<(), UkaiError> {
        self.client
            .connect()?
            .truncate(path.to_string(), length)
            .await
            .map_err(|e| self.wrap(e))
    }

    pub async fn readdir(&self, path: &str) -> Result<Vec<String>, UkaiError> {
        self.client
            .connect()?
            .readdir(path.to_string())
            .await
            .map_err(|e| self.wrap(e))
    }

    pub async fn statfs(&self, path: &str) -> Result<StatFs, UkaiError> {
        self.client
            .connect()?
            .statfs(path.to_string())
            .await
            .map_err(|e| self.wrap(e))
    }

    // Namespace mutations are refused locally; no RPC is issued.

    pub fn create(&self, path: &str, _mode: u32) -> Result<u64, UkaiError> {
        Err(UkaiError::PermissionDenied(format!("create {}", path)))
    }

    pub fn unlink(&self, path: &str) -> Result<(), UkaiError> {
        Err(UkaiError::PermissionDenied(format!("unlink {}", path)))
    }

    pub fn mkdir(&self, path: &str, _mode: u32) -> Result<(), UkaiError> {
        Err(UkaiError::PermissionDenied(format!("mkdir {}", path)))
    }

    pub fn rmdir(&self, path: &str) -> Result<(), UkaiError> {
        Err(UkaiError::PermissionDenied(format!("rmdir {}", path)))
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<(), UkaiError> {
        Err(UkaiError::PermissionDenied(format!("rename {} to {}", old, new)))
    }

    pub fn symlink(&self, target: &str, source: &str) -> Result<(), UkaiError> {
        Err(UkaiError::PermissionDenied(format!(
            "symlink {} to {}",
            source, target
        )))
    }

    pub fn readlink(&self, path: &str) -> Result<String, UkaiError> {
        Err(UkaiError::PermissionDenied(format!("readlink {}", path)))
    }

    // Attribute verbs are accepted and ignored.

    pub fn chmod(&self, _path: &str, _mode: u32) -> Result<(), UkaiError> {
        Ok(())
    }

    pub fn chown(&self, _path: &str, _uid: u32, _gid: u32) -> Result<(), UkaiError> {
        Ok(())
    }

    pub fn utimens(&self, _path: &str) -> Result<(), UkaiError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_mutations_are_denied_locally() {
        let bridge = FuseBridge::new(&UkaiConfig::default());

        assert!(matches!(
            bridge.create("/img", 0o644),
            Err(UkaiError::PermissionDenied(_))
        ));
        assert!(matches!(
            bridge.unlink("/img"),
            Err(UkaiError::PermissionDenied(_))
        ));
        assert!(matches!(
            bridge.mkdir("/dir", 0o755),
            Err(UkaiError::PermissionDenied(_))
        ));
        assert!(matches!(
            bridge.rename("/a", "/b"),
            Err(UkaiError::PermissionDenied(_))
        ));
        assert!(matches!(
            bridge.readlink("/img"),
            Err(UkaiError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_attribute_verbs_are_noops() {
        let bridge = FuseBridge::new(&UkaiConfig::default());
        assert!(bridge.chmod("/img", 0o600).is_ok());
        assert!(bridge.chown("/img", 0, 0).is_ok());
        assert!(bridge.utimens("/img").is_ok());
    }
}
