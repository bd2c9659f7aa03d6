//! Metadata directory client.
//!
//! The directory is a replicated key-value service holding the canonical
//! metadata of every image, the reader-set membership, and named
//! per-image locks for composite read-modify-write sequences. This node
//! only ever talks to it through the [`MetadataDirectory`] trait:
//! `RpcDirectory` reaches a directory cluster over the wire, and
//! `MemoryDirectory` is the in-process implementation used by tests and
//! embedded single-node setups — servable over the same RPC surface, so
//! both sides of the contract are exercised against real sockets.

use crate::rpc::{DirectoryApiClient, DirectoryApiServer, RpcClient};
use crate::types::{UkaiConfig, UkaiError};
use async_trait::async_trait;
use jsonrpsee::core::RpcResult;
use jsonrpsee::server::{ServerBuilder, ServerHandle};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait MetadataDirectory: Send + Sync {
    async fn put_metadata(&self, image_name: &str, payload: Value) -> Result<(), UkaiError>;
    async fn get_metadata(&self, image_name: &str) -> Result<Option<Value>, UkaiError>;
    async fn delete_metadata(&self, image_name: &str) -> Result<(), UkaiError>;
    async fn list_images(&self) -> Result<Vec<String>, UkaiError>;
    async fn join_reader(&self, image_name: &str, node: &str) -> Result<(), UkaiError>;
    async fn leave_reader(&self, image_name: &str, node: &str) -> Result<(), UkaiError>;
    async fn get_readers(&self, image_name: &str) -> Result<Vec<String>, UkaiError>;
    /// Take the directory-side named lock for `image_name`, waiting while
    /// another holder has it.
    async fn lock_image(&self, image_name: &str) -> Result<(), UkaiError>;
    async fn unlock_image(&self, image_name: &str) -> Result<(), UkaiError>;
}

#[derive(Default)]
struct DirectoryState {
    images: HashMap<String, Value>,
    readers: HashMap<String, HashSet<String>>,
    locks: HashSet<String>,
}

/// In-process directory.
#[derive(Default)]
pub struct MemoryDirectory {
    state: Mutex<DirectoryState>,
    unlocked: tokio::sync::Notify,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataDirectory for MemoryDirectory {
    async fn put_metadata(&self, image_name: &str, payload: Value) -> Result<(), UkaiError> {
        self.state
            .lock()
            .images
            .insert(image_name.to_string(), payload);
        Ok(())
    }

    async fn get_metadata(&self, image_name: &str) -> Result<Option<Value>, UkaiError> {
        Ok(self.state.lock().images.get(image_name).cloned())
    }

    async fn delete_metadata(&self, image_name: &str) -> Result<(), UkaiError> {
        let mut state = self.state.lock();
        state.images.remove(image_name);
        state.readers.remove(image_name);
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<String>, UkaiError> {
        let names: BTreeSet<String> = self.state.lock().images.keys().cloned().collect();
        Ok(names.into_iter().collect())
    }

    async fn join_reader(&self, image_name: &str, node: &str) -> Result<(), UkaiError> {
        self.state
            .lock()
            .readers
            .entry(image_name.to_string())
            .or_default()
            .insert(node.to_string());
        Ok(())
    }

    async fn leave_reader(&self, image_name: &str, node: &str) -> Result<(), UkaiError> {
        let mut state = self.state.lock();
        if let Some(readers) = state.readers.get_mut(image_name) {
            readers.remove(node);
            if readers.is_empty() {
                state.readers.remove(image_name);
            }
        }
        Ok(())
    }

    async fn get_readers(&self, image_name: &str) -> Result<Vec<String>, UkaiError> {
        let mut readers: Vec<String> = self
            .state
            .lock()
            .readers
            .get(image_name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        readers.sort();
        Ok(readers)
    }

    async fn lock_image(&self, image_name: &str) -> Result<(), UkaiError> {
        loop {
            let unlocked = self.unlocked.notified();
            if self.state.lock().locks.insert(image_name.to_string()) {
                return Ok(());
            }
            unlocked.await;
        }
    }

    async fn unlock_image(&self, image_name: &str) -> Result<(), UkaiError> {
        self.state.lock().locks.remove(image_name);
        self.unlocked.notify_waiters();
        Ok(())
    }
}

/// Client of a remote directory cluster. Servers are tried in order; a
/// transport failure moves on to the next one, a logical error is final.
pub struct RpcDirectory {
    servers: Vec<String>,
    timeout: Duration,
}

impl RpcDirectory {
    pub fn from_config(config: &UkaiConfig) -> Result<Self, UkaiError> {
        if config.metadata_servers.is_empty() {
            return Err(UkaiError::Config(
                "metadata_servers must list at least one directory address".to_string(),
            ));
        }
        Ok(Self {
            servers: config.metadata_servers.clone(),
            timeout: Duration::from_millis(config.rpc_timeout_ms),
        })
    }

    async fn try_servers<T, F, Fut>(&self, call: F) -> Result<T, UkaiError>
    where
        F: Fn(jsonrpsee::http_client::HttpClient, String) -> Fut,
        Fut: Future<Output = Result<T, UkaiError>>,
    {
        let mut last_error = None;
        for server in &self.servers {
            let client = RpcClient::for_url(&format!("http://{}", server), self.timeout);
            let result = match client.connect() {
                Ok(http) => call(http, server.clone()).await,
                Err(e) => Err(e),
            };
            match result {
                Err(e @ UkaiError::Transport { .. }) => {
                    log::warn!("directory server {} unreachable: {}", server, e);
                    last_error = Some(e);
                }
                other => return other,
            }
        }
        Err(last_error.unwrap_or_else(|| {
            UkaiError::Directory("no directory server configured".to_string())
        }))
    }
}

#[async_trait]
impl MetadataDirectory for RpcDirectory {
    async fn put_metadata(&self, image_name: &str, payload: Value) -> Result<(), UkaiError> {
        self.try_servers(|client, server| {
            let payload = payload.clone();
            async move {
                client
                    .put_metadata(image_name.to_string(), payload)
                    .await
                    .map_err(|e| UkaiError::from_client_error(&server, e))
            }
        })
        .await
    }

    async fn get_metadata(&self, image_name: &str) -> Result<Option<Value>, UkaiError> {
        self.try_servers(|client, server| async move {
            client
                .get_metadata(image_name.to_string())
                .await
                .map_err(|e| UkaiError::from_client_error(&server, e))
        })
        .await
    }

    async fn delete_metadata(&self, image_name: &str) -> Result<(), UkaiError> {
        self.try_servers(|client, server| async move {
            client
                .delete_metadata(image_name.to_string())
                .await
                .map_err(|e| UkaiError::from_client_error(&server, e))
        })
        .await
    }

    async fn list_images(&self) -> Result<Vec<String>, UkaiError> {
        self.try_servers(|client, server| async move {
            client
                .list_images()
                .await
                .map_err(|e| UkaiError::from_client_error(&server, e))
        })
        .await
    }

    async fn join_reader(&self, image_name: &str, node: &str) -> Result<(), UkaiError> {
        self.try_servers(|client, server| async move {
            client
                .join_reader(image_name.to_string(), node.to_string())
                .await
                .map_err(|e| UkaiError::from_client_error(&server, e))
        })
        .await
    }

    async fn leave_reader(&self, image_name: &str, node: &str) -> Result<(), UkaiError> {
        self.try_servers(|client, server| async move {
            client
                .leave_reader(image_name.to_string(), node.to_string())
                .await
                .map_err(|e| UkaiError::from_client_error(&server, e))
        })
        .await
    }

    async fn get_readers(&self, image_name: &str) -> Result<Vec<String>, UkaiError> {
        self.try_servers(|client, server| async move {
            client
                .get_readers(image_name.to_string())
                .await
                .map_err(|e| UkaiError::from_client_error(&server, e))
        })
        .await
    }

    async fn lock_image(&self, image_name: &str) -> Result<(), UkaiError> {
        self.try_servers(|client, server| async move {
            client
                .lock_image(image_name.to_string())
                .await
                .map_err(|e| UkaiError::from_client_error(&server, e))
        })
        .await
    }

    async fn unlock_image(&self, image_name: &str) -> Result<(), UkaiError> {
        self.try_servers(|client, server| async move {
            client
                .unlock_image(image_name.to_string())
                .await
                .map_err(|e| UkaiError::from_client_error(&server, e))
        })
        .await
    }
}

/// RPC front of a [`MemoryDirectory`], for tests and single-node setups.
pub struct DirectoryService {
    directory: Arc<MemoryDirectory>,
}

#[async_trait]
impl DirectoryApiServer for DirectoryService {
    async fn put_metadata(&self, image_name: String, payload: Value) -> RpcResult<()> {
        Ok(self.directory.put_metadata(&image_name, payload).await?)
    }

    async fn get_metadata(&self, image_name: String) -> RpcResult<Option<Value>> {
        Ok(self.directory.get_metadata(&image_name).await?)
    }

    async fn delete_metadata(&self, image_name: String) -> RpcResult<()> {
        Ok(self.directory.delete_metadata(&image_name).await?)
    }

    async fn list_images(&self) -> RpcResult<Vec<String>> {
        Ok(self.directory.list_images().await?)
    }

    async fn join_reader(&self, image_name: String, node: String) -> RpcResult<()> {
        Ok(self.directory.join_reader(&image_name, &node).await?)
    }

    async fn leave_reader(&self, image_name: String, node: String) -> RpcResult<()> {
        Ok(self.directory.leave_reader(&image_name, &node).await?)
    }

    async fn get_readers(&self, image_name: String) -> RpcResult<Vec<String>> {
        Ok(self.directory.get_readers(&image_name).await?)
    }

    async fn lock_image(&self, image_name: String) -> RpcResult<()> {
        Ok(self.directory.lock_image(&image_name).await?)
    }

    async fn unlock_image(&self, image_name: String) -> RpcResult<()> {
        Ok(self.directory.unlock_image(&image_name).await?)
    }
}

/// Serve a directory on `bind` (`host:port`); returns the handle and the
/// bound address, which reports the ephemeral port when `bind` ends in
/// `:0`.
pub async fn serve_directory(
    bind: &str,
    directory: Arc<MemoryDirectory>,
) -> Result<(ServerHandle, SocketAddr), UkaiError> {
    let server = ServerBuilder::default().build(bind).await?;
    let addr = server.local_addr()?;
    let handle = server.start(DirectoryApiServer::into_rpc(DirectoryService { directory }));
    log::info!("metadata directory listening on {}", addr);
    Ok((handle, addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_metadata_lifecycle() {
        let dir = MemoryDirectory::new();
        assert_eq!(dir.get_metadata("img").await.expect("get"), None);

        dir.put_metadata("img", json!({"size": 64}))
            .await
            .expect("put");
        assert_eq!(
            dir.get_metadata("img").await.expect("get"),
            Some(json!({"size": 64}))
        );
        assert_eq!(dir.list_images().await.expect("list"), vec!["img"]);

        dir.delete_metadata("img").await.expect("delete");
        assert_eq!(dir.get_metadata("img").await.expect("get"), None);
        assert!(dir.list_images().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_reader_set_membership() {
        let dir = MemoryDirectory::new();
        dir.join_reader("img", "node-a").await.expect("join");
        dir.join_reader("img", "node-b").await.expect("join");
        dir.join_reader("img", "node-a").await.expect("rejoin");

        assert_eq!(
            dir.get_readers("img").await.expect("readers"),
            vec!["node-a", "node-b"]
        );

        dir.leave_reader("img", "node-a").await.expect("leave");
        assert_eq!(dir.get_readers("img").await.expect("readers"), vec!["node-b"]);
        dir.leave_reader("img", "node-b").await.expect("leave");
        assert!(dir.get_readers("img").await.expect("readers").is_empty());
    }

    #[tokio::test]
    async fn test_named_lock_excludes_second_holder() {
        let dir = Arc::new(MemoryDirectory::new());
        dir.lock_image("img").await.expect("lock");

        let contender = {
            let dir = dir.clone();
            tokio::spawn(async move {
                dir.lock_image("img").await.expect("second lock");
                dir.unlock_image("img").await.expect("second unlock");
            })
        };
        // The contender cannot finish while we hold the lock.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        dir.unlock_image("img").await.expect("unlock");
        contender.await.expect("contender completes");
    }

    #[tokio::test]
    async fn test_locks_on_distinct_names_are_independent() {
        let dir = MemoryDirectory::new();
        dir.lock_image("a").await.expect("lock a");
        dir.lock_image("b").await.expect("lock b");
        dir.unlock_image("a").await.expect("unlock a");
        dir.unlock_image("b").await.expect("unlock b");
    }
}
