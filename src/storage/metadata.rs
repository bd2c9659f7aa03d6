//! In-memory image metadata.
//!
//! `ImageMetadata` is the authoritative view of one image on this node:
//! the canonical record loaded from the metadata directory, one mutex per
//! block for fine-grained I/O exclusion, and a whole-image write lock
//! serialising mutation and flush. Every mutation is pushed back to the
//! directory and fanned out to the peer hypervisors before it returns.

use crate::core::CoreContext;
use crate::rpc::{HexPayload, RpcClient, UkaiApiClient};
use crate::types::UkaiError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-(block, location) replica state, serialized as `0 | 1 | 2`.
/// Unknown values are rejected at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SyncStatus {
    InSync,
    /// Reserved for a future incremental-copy state; never produced.
    Syncing,
    OutOfSync,
}

impl TryFrom<u8> for SyncStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SyncStatus::InSync),
            1 => Ok(SyncStatus::Syncing),
            2 => Ok(SyncStatus::OutOfSync),
            other => Err(format!("unknown sync status {}", other)),
        }
    }
}

impl From<SyncStatus> for u8 {
    fn from(status: SyncStatus) -> u8 {
        match status {
            SyncStatus::InSync => 0,
            SyncStatus::Syncing => 1,
            SyncStatus::OutOfSync => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationState {
    pub sync_status: SyncStatus,
}

/// The canonical metadata record, stored verbatim (as JSON) in the
/// metadata directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataContent {
    pub name: String,
    pub size: u64,
    pub used_size: u64,
    pub block_size: u64,
    pub hypervisors: Vec<String>,
    pub blocks: Vec<HashMap<String, LocationState>>,
}

impl MetadataContent {
    /// Compose the record for a freshly created image: every block held
    /// in sync by `location`, the whole size visible to the guest.
    pub fn new_image(name: &str, size: u64, block_size: u64, location: &str) -> Self {
        let block_count = (size / block_size) as usize;
        let blocks = (0..block_count)
            .map(|_| {
                let mut map = HashMap::new();
                map.insert(
                    location.to_string(),
                    LocationState {
                        sync_status: SyncStatus::InSync,
                    },
                );
                map
            })
            .collect();
        Self {
            name: name.to_string(),
            size,
            used_size: size,
            block_size,
            hypervisors: vec![location.to_string()],
            blocks,
        }
    }

    pub fn block_count(&self) -> u64 {
        self.size / self.block_size
    }

    /// Check the structural invariants. Called on every load; a violation
    /// aborts the open.
    pub fn validate(&self) -> Result<(), UkaiError> {
        if self.block_size == 0 {
            return Err(UkaiError::Metadata(format!(
                "image {}: block_size must be positive",
                self.name
            )));
        }
        if self.size <= self.block_size {
            return Err(UkaiError::Metadata(format!(
                "image {}: size {} must exceed block_size {}",
                self.name, self.size, self.block_size
            )));
        }
        if self.size % self.block_size != 0 {
            return Err(UkaiError::Metadata(format!(
                "image {}: size {} is not a multiple of block_size {}",
                self.name, self.size, self.block_size
            )));
        }
        if self.used_size > self.size {
            return Err(UkaiError::Metadata(format!(
                "image {}: used_size {} exceeds size {}",
                self.name, self.used_size, self.size
            )));
        }
        if self.blocks.len() as u64 != self.block_count() {
            return Err(UkaiError::Metadata(format!(
                "image {}: {} block entries, expected {}",
                self.name,
                self.blocks.len(),
                self.block_count()
            )));
        }
        for (index, block) in self.blocks.iter().enumerate() {
            if block.is_empty() {
                return Err(UkaiError::Metadata(format!(
                    "image {}: block {} has no locations",
                    self.name, index
                )));
            }
            if !block.values().any(|s| s.sync_status == SyncStatus::InSync) {
                // Not structural corruption: a write that lost every
                // replica mid-flight leaves this state behind. The image
                // opens, and reads of the block fail until a replica
                // comes back.
                log::warn!(
                    "image {}: block {} has no in-sync replica",
                    self.name,
                    index
                );
            }
        }
        Ok(())
    }

    /// Parse and validate a directory payload.
    pub fn from_value(value: serde_json::Value) -> Result<Self, UkaiError> {
        let content: MetadataContent = serde_json::from_value(value)
            .map_err(|e| UkaiError::Metadata(format!("malformed metadata payload: {}", e)))?;
        content.validate()?;
        Ok(content)
    }

    pub fn to_value(&self) -> Result<serde_json::Value, UkaiError> {
        serde_json::to_value(self)
            .map_err(|e| UkaiError::Metadata(format!("unencodable metadata: {}", e)))
    }
}

pub struct ImageMetadata {
    content: RwLock<MetadataContent>,
    block_locks: Vec<tokio::sync::Mutex<()>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl ImageMetadata {
    pub fn new(content: MetadataContent) -> Result<Self, UkaiError> {
        content.validate()?;
        let block_locks = (0..content.block_count())
            .map(|_| tokio::sync::Mutex::new(()))
            .collect();
        Ok(Self {
            content: RwLock::new(content),
            block_locks,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn name(&self) -> String {
        self.content.read().name.clone()
    }

    pub fn size(&self) -> u64 {
        self.content.read().size
    }

    pub fn used_size(&self) -> u64 {
        self.content.read().used_size
    }

    pub fn block_size(&self) -> u64 {
        self.content.read().block_size
    }

    pub fn block_count(&self) -> u64 {
        self.content.read().block_count()
    }

    pub fn hypervisors(&self) -> Vec<String> {
        self.content.read().hypervisors.clone()
    }

    pub fn snapshot(&self) -> MetadataContent {
        self.content.read().clone()
    }

    /// The replicas of one block with their sync states.
    pub fn block_locations(&self, block_index: u64) -> Vec<(String, SyncStatus)> {
        self.content
            .read()
            .blocks
            .get(block_index as usize)
            .map(|block| {
                block
                    .iter()
                    .map(|(location, state)| (location.clone(), state.sync_status))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_sync_status(
        &self,
        block_index: u64,
        location: &str,
    ) -> Result<SyncStatus, UkaiError> {
        let content = self.content.read();
        content
            .blocks
            .get(block_index as usize)
            .and_then(|block| block.get(location))
            .map(|state| state.sync_status)
            .ok_or_else(|| {
                UkaiError::Metadata(format!(
                    "image {}: no location {} for block {}",
                    content.name, location, block_index
                ))
            })
    }

    /// Update one replica's state. The caller holds the block lock and is
    /// responsible for flushing.
    pub fn set_sync_status(
        &self,
        block_index: u64,
        location: &str,
        status: SyncStatus,
    ) -> Result<(), UkaiError> {
        let mut content = self.content.write();
        let name = content.name.clone();
        content
            .blocks
            .get_mut(block_index as usize)
            .and_then(|block| block.get_mut(location))
            .map(|state| state.sync_status = status)
            .ok_or_else(|| {
                UkaiError::Metadata(format!(
                    "image {}: no location {} for block {}",
                    name, location, block_index
                ))
            })
    }

    /// Lock a contiguous run of blocks, always in ascending index order
    /// so that two multi-block operations cannot deadlock.
    pub async fn acquire_block_range(
        &self,
        blocks: std::ops::RangeInclusive<u64>,
    ) -> Vec<tokio::sync::MutexGuard<'_, ()>> {
        let mut guards = Vec::new();
        for index in blocks {
            guards.push(self.block_locks[index as usize].lock().await);
        }
        guards
    }

    pub async fn acquire_block(&self, block_index: u64) -> tokio::sync::MutexGuard<'_, ()> {
        self.block_locks[block_index as usize].lock().await
    }

    /// Insert `location` into every block of `[start, end]` that lacks
    /// it. Idempotent per block; `end = None` means the last block.
    pub async fn add_location(
        &self,
        ctx: &CoreContext,
        location: &str,
        start: u64,
        end: Option<u64>,
        status: SyncStatus,
    ) -> Result<(), UkaiError> {
        let _write = self.write_lock.lock().await;
        {
            let mut content = self.content.write();
            let end = Self::resolve_range(&content, start, end)?;
            for index in start..=end {
                let block = &mut content.blocks[index as usize];
                if block.contains_key(location) {
                    continue;
                }
                block.insert(location.to_string(), LocationState { sync_status: status });
            }
        }
        self.flush_locked(ctx).await
    }

    /// Remove `location` from every block of `[start, end]` where another
    /// in-sync replica remains; the rest are skipped. Returns the removed
    /// block indices (whose files the caller deallocates) and the number
    /// of skipped blocks.
    pub async fn remove_location(
        &self,
        ctx: &CoreContext,
        location: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<(Vec<u64>, u64), UkaiError> {
        let _write = self.write_lock.lock().await;
        let (removed, skipped) = {
            let mut content = self.content.write();
            let end = Self::resolve_range(&content, start, end)?;
            let name = content.name.clone();
            let mut removed = Vec::new();
            let mut skipped = 0;
            for index in start..=end {
                let block = &mut content.blocks[index as usize];
                if !block.contains_key(location) {
                    continue;
                }
                let other_in_sync = block.iter().any(|(other, state)| {
                    other != location && state.sync_status == SyncStatus::InSync
                });
                if other_in_sync {
                    block.remove(location);
                    removed.push(index);
                } else {
                    log::warn!(
                        "image {}: keeping {} on block {}, it holds the last in-sync replica",
                        name,
                        location,
                        index
                    );
                    skipped += 1;
                }
            }
            (removed, skipped)
        };
        self.flush_locked(ctx).await?;
        Ok((removed, skipped))
    }

    /// Add a peer hypervisor; a second add of the same peer is a no-op.
    pub async fn add_hypervisor(&self, ctx: &CoreContext, hypervisor: &str) -> Result<(), UkaiError> {
        let _write = self.write_lock.lock().await;
        {
            let mut content = self.content.write();
            if !content.hypervisors.iter().any(|h| h == hypervisor) {
                content.hypervisors.push(hypervisor.to_string());
            }
        }
        self.flush_locked(ctx).await
    }

    /// Remove a peer hypervisor; removing an absent one is a no-op.
    pub async fn remove_hypervisor(
        &self,
        ctx: &CoreContext,
        hypervisor: &str,
    ) -> Result<(), UkaiError> {
        let _write = self.write_lock.lock().await;
        {
            let mut content = self.content.write();
            content.hypervisors.retain(|h| h != hypervisor);
        }
        self.flush_locked(ctx).await
    }

    /// Shrink (or restore) the guest-visible size.
    pub async fn set_used_size(&self, ctx: &CoreContext, length: u64) -> Result<(), UkaiError> {
        let _write = self.write_lock.lock().await;
        {
            let mut content = self.content.write();
            if length > content.size {
                return Err(UkaiError::Invalid(format!(
                    "image {}: cannot truncate to {} beyond size {}",
                    content.name, length, content.size
                )));
            }
            content.used_size = length;
        }
        self.flush_locked(ctx).await
    }

    /// Replace the whole record with one pushed by a peer hypervisor.
    /// The block count is fixed for an image's lifetime, so the lock
    /// array stays valid.
    pub fn replace_content(&self, content: MetadataContent) -> Result<(), UkaiError> {
        content.validate()?;
        let mut current = self.content.write();
        if content.name != current.name {
            return Err(UkaiError::Metadata(format!(
                "metadata update for {} cannot replace {}",
                content.name, current.name
            )));
        }
        if content.block_count() != current.block_count() {
            return Err(UkaiError::Metadata(format!(
                "image {}: block count changed from {} to {}",
                current.name,
                current.block_count(),
                content.block_count()
            )));
        }
        *current = content;
        Ok(())
    }

    /// Persist the record to the directory and push it to every peer
    /// hypervisor. Peer failures are logged and skipped; the directory
    /// copy is authoritative and peers catch up on their next open.
    pub async fn flush(&self, ctx: &CoreContext) -> Result<(), UkaiError> {
        let _write = self.write_lock.lock().await;
        self.flush_locked(ctx).await
    }

    async fn flush_locked(&self, ctx: &CoreContext) -> Result<(), UkaiError> {
        let content = self.snapshot();
        ctx.directory
            .put_metadata(&content.name, content.to_value()?)
            .await?;
        log::debug!("flushed metadata of {}", content.name);

        let raw = serde_json::to_vec(&content)
            .map_err(|e| UkaiError::Metadata(format!("unencodable metadata: {}", e)))?;
        let payload = HexPayload::from_compressed(&raw)?;
        let mut pushes = Vec::new();
        for hypervisor in &content.hypervisors {
            if ctx.addrs.is_local(hypervisor) {
                continue;
            }
            let hypervisor = hypervisor.clone();
            let client = RpcClient::for_peer(&ctx.config, &hypervisor);
            let name = content.name.clone();
            let payload = payload.clone();
            pushes.push(async move {
                let result = match client.connect() {
                    Ok(client) => client
                        .proxy_update_metadata(name.clone(), payload)
                        .await
                        .map_err(|e| UkaiError::from_client_error(&hypervisor, e)),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    log::warn!("metadata push of {} to {} failed: {}", name, hypervisor, e);
                }
            });
        }
        futures::future::join_all(pushes).await;
        Ok(())
    }

    fn resolve_range(
        content: &MetadataContent,
        start: u64,
        end: Option<u64>,
    ) -> Result<u64, UkaiError> {
        let last = content.block_count() - 1;
        let end = end.unwrap_or(last);
        if start > end || end > last {
            return Err(UkaiError::Invalid(format!(
                "image {}: block range {}..={} outside 0..={}",
                content.name, start, end, last
            )));
        }
        Ok(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(size: u64, block_size: u64) -> MetadataContent {
        MetadataContent::new_image("img", size, block_size, "10.0.0.1")
    }

    #[test]
    fn test_new_image_layout() {
        let content = content(64, 16);
        assert_eq!(content.block_count(), 4);
        assert_eq!(content.used_size, 64);
        assert_eq!(content.hypervisors, vec!["10.0.0.1".to_string()]);
        for block in &content.blocks {
            assert_eq!(block.len(), 1);
            assert_eq!(block["10.0.0.1"].sync_status, SyncStatus::InSync);
        }
        content.validate().expect("fresh image must validate");
    }

    #[test]
    fn test_validation_rejects_bad_geometry() {
        let mut bad = content(64, 16);
        bad.block_size = 0;
        assert!(bad.validate().is_err());

        let mut bad = content(64, 16);
        bad.size = 16;
        assert!(bad.validate().is_err());

        let mut bad = content(64, 16);
        bad.size = 70;
        assert!(bad.validate().is_err());

        let mut bad = content(64, 16);
        bad.used_size = 65;
        assert!(bad.validate().is_err());

        let mut bad = content(64, 16);
        bad.blocks.pop();
        assert!(bad.validate().is_err());

        let mut bad = content(64, 16);
        bad.blocks[2].clear();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_unknown_sync_status_is_rejected() {
        let mut value = content(64, 16).to_value().expect("encode");
        value["blocks"][0]["10.0.0.1"]["sync_status"] = serde_json::json!(7);
        assert!(MetadataContent::from_value(value).is_err());
    }

    #[test]
    fn test_canonical_json_shape() {
        let value = content(32, 16).to_value().expect("encode");
        assert_eq!(value["name"], "img");
        assert_eq!(value["size"], 32);
        assert_eq!(value["block_size"], 16);
        assert_eq!(value["blocks"][0]["10.0.0.1"]["sync_status"], 0);

        let decoded = MetadataContent::from_value(value).expect("decode");
        assert_eq!(decoded.block_count(), 2);
    }

    #[test]
    fn test_sync_status_accessors() {
        let meta = ImageMetadata::new(content(64, 16)).expect("metadata");
        assert_eq!(
            meta.get_sync_status(0, "10.0.0.1").expect("status"),
            SyncStatus::InSync
        );
        meta.set_sync_status(0, "10.0.0.1", SyncStatus::OutOfSync)
            .expect("set");
        assert_eq!(
            meta.get_sync_status(0, "10.0.0.1").expect("status"),
            SyncStatus::OutOfSync
        );
        assert!(meta.get_sync_status(0, "10.9.9.9").is_err());
        assert!(meta.set_sync_status(99, "10.0.0.1", SyncStatus::InSync).is_err());
    }

    #[test]
    fn test_replace_content_guards_identity() {
        let meta = ImageMetadata::new(content(64, 16)).expect("metadata");

        let renamed = MetadataContent::new_image("other", 64, 16, "10.0.0.1");
        assert!(meta.replace_content(renamed).is_err());

        let resized = MetadataContent::new_image("img", 128, 16, "10.0.0.1");
        assert!(meta.replace_content(resized).is_err());

        let mut updated = content(64, 16);
        updated.used_size = 32;
        meta.replace_content(updated).expect("replace");
        assert_eq!(meta.used_size(), 32);
    }

    #[tokio::test]
    async fn test_block_range_locking_is_reentrant_free() {
        let meta = ImageMetadata::new(content(64, 16)).expect("metadata");
        let guards = meta.acquire_block_range(1..=2).await;
        assert_eq!(guards.len(), 2);
        // Blocks outside the held range stay available.
        let _other = meta.acquire_block(0).await;
        drop(guards);
        let _again = meta.acquire_block(1).await;
    }
}
