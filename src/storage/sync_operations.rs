//! Replica synchronisation.
//!
//! `synchronize_block_to` copies one whole block from an in-sync replica
//! to a stale one; the write path calls it on demand before writing
//! through a stale replica, and `synchronize_block` runs it over every
//! stale replica of a block for the bulk `ctl_synchronize` sweep.

use crate::rpc::{RpcClient, UkaiApiClient};
use crate::storage::block_store;
use crate::storage::data::{Piece, UkaiData};
use crate::storage::metadata::SyncStatus;
use crate::types::UkaiError;

impl UkaiData {
    /// Bring every stale replica of `block_index` in sync. Returns
    /// whether any metadata changed, so the caller knows to flush.
    pub async fn synchronize_block(&self, block_index: u64) -> Result<bool, UkaiError> {
        if block_index >= self.metadata.block_count() {
            return Err(UkaiError::Invalid(format!(
                "block {} outside image {} with {} blocks",
                block_index,
                self.metadata.name(),
                self.metadata.block_count()
            )));
        }
        let _guard = self.metadata.acquire_block(block_index).await;
        let mut changed = false;
        for (location, status) in self.metadata.block_locations(block_index) {
            if status == SyncStatus::InSync {
                continue;
            }
            self.synchronize_block_to(block_index, &location).await?;
            changed = true;
        }
        Ok(changed)
    }

    /// Copy block `block_index` from an in-sync replica to `target` and
    /// mark the target in sync. The caller holds the block lock and is
    /// responsible for flushing.
    pub(crate) async fn synchronize_block_to(
        &self,
        block_index: u64,
        target: &str,
    ) -> Result<(), UkaiError> {
        let name = self.metadata.name();
        let mut source = None;
        for (location, status) in self.metadata.block_locations(block_index) {
            if status != SyncStatus::InSync {
                continue;
            }
            if self.ctx.addrs.is_local(&location) {
                source = Some(location);
                break;
            }
            source = Some(location);
        }
        let Some(source) = source else {
            return Err(UkaiError::DataUnavailable(format!(
                "no in-sync replica of block {} of {}",
                block_index, name
            )));
        };

        log::info!(
            "synchronizing block {} of {} from {} to {}",
            block_index,
            name,
            source,
            target
        );
        self.allocate_dataspace(target, block_index).await?;
        let whole_block = Piece {
            block_index,
            offset: 0,
            length: self.metadata.block_size(),
        };
        let data = self.get_data(&source, &whole_block).await?;
        self.put_data(target, &whole_block, &data).await?;
        self.metadata
            .set_sync_status(block_index, target, SyncStatus::InSync)?;
        Ok(())
    }

    async fn allocate_dataspace(&self, node: &str, block_index: u64) -> Result<(), UkaiError> {
        let name = self.metadata.name();
        let block_size = self.metadata.block_size();
        if self.ctx.addrs.is_local(node) {
            return block_store::allocate(&self.ctx.config, &name, block_size, block_index);
        }
        let client = RpcClient::for_peer(&self.ctx.config, node);
        client
            .connect()?
            .proxy_allocate_dataspace(name, block_size, block_index)
            .await
            .map_err(|e| UkaiError::from_client_error(node, e))
    }
}
