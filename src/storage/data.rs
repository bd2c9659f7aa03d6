//! The data engine.
//!
//! Splits a byte-range request into block-local pieces, picks a replica
//! per piece, and fans the I/O out — reads to one candidate with
//! failover, writes to every replica of each block, healing out-of-sync
//! replicas on the way. A replica that fails is demoted to out-of-sync
//! and its node suspended in the failure cache, so a single slow or dead
//! peer degrades into extra bookkeeping instead of a stuck guest.

use crate::core::CoreContext;
use crate::rpc::{HexPayload, RpcClient, UkaiApiClient};
use crate::storage::block_store;
use crate::storage::metadata::{ImageMetadata, SyncStatus};
use crate::types::UkaiError;
use std::sync::Arc;

/// The part of a request that falls within one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    pub block_index: u64,
    /// Start offset relative to the beginning of the block.
    pub offset: u64,
    pub length: u64,
}

/// Decompose `(offset, size)` into pieces. The pieces are contiguous,
/// non-overlapping, and their lengths sum to `size`.
pub fn gather_pieces(block_size: u64, offset: u64, size: u64) -> Vec<Piece> {
    debug_assert!(size > 0);
    let start_block = offset / block_size;
    let end_block = (offset + size - 1) / block_size;
    let mut pieces = Vec::with_capacity((end_block - start_block + 1) as usize);
    for block_index in start_block..=end_block {
        let begin = if block_index == start_block {
            offset - start_block * block_size
        } else {
            0
        };
        let end = if block_index == end_block {
            offset + size - end_block * block_size
        } else {
            block_size
        };
        pieces.push(Piece {
            block_index,
            offset: begin,
            length: end - begin,
        });
    }
    pieces
}

pub struct UkaiData {
    pub(crate) metadata: Arc<ImageMetadata>,
    pub(crate) ctx: Arc<CoreContext>,
}

impl UkaiData {
    pub fn new(metadata: Arc<ImageMetadata>, ctx: Arc<CoreContext>) -> Self {
        Self { metadata, ctx }
    }

    pub fn metadata(&self) -> &Arc<ImageMetadata> {
        &self.metadata
    }

    /// Read up to `size` bytes at `offset`. Requests at or past the
    /// guest-visible end return empty, requests straddling it are
    /// shortened.
    pub async fn read(&self, size: u64, offset: u64) -> Result<Vec<u8>, UkaiError> {
        let used_size = self.metadata.used_size();
        if offset >= used_size || size == 0 {
            return Ok(Vec::new());
        }
        let size = size.min(used_size - offset);
        let name = self.metadata.name();
        let pieces = gather_pieces(self.metadata.block_size(), offset, size);
        self.ctx.stats.record_read(&name, &pieces);

        let first = pieces[0].block_index;
        let last = pieces[pieces.len() - 1].block_index;
        let mut flush_required = false;
        let result = {
            let _guards = self.metadata.acquire_block_range(first..=last).await;
            self.read_pieces(&name, &pieces, &mut flush_required).await
        };
        self.flush_after(&name, flush_required, result).await
    }

    async fn read_pieces(
        &self,
        name: &str,
        pieces: &[Piece],
        flush_required: &mut bool,
    ) -> Result<Vec<u8>, UkaiError> {
        let mut data = Vec::new();
        for piece in pieces {
            loop {
                let Some(candidate) = self.find_read_candidate(piece.block_index) else {
                    return Err(UkaiError::DataUnavailable(format!(
                        "no readable replica of block {} of {}",
                        piece.block_index, name
                    )));
                };
                match self.get_data(&candidate, piece).await {
                    Ok(bytes) => {
                        data.extend_from_slice(&bytes);
                        break;
                    }
                    Err(e) if e.is_peer_failure() => {
                        log::warn!(
                            "read of block {} of {} from {} failed: {}",
                            piece.block_index,
                            name,
                            candidate,
                            e
                        );
                        self.metadata.set_sync_status(
                            piece.block_index,
                            &candidate,
                            SyncStatus::OutOfSync,
                        )?;
                        *flush_required = true;
                        self.ctx.node_errors.add(&candidate, &e.to_string());
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(data)
    }

    /// Pick the replica a piece is read from: not suspended, in sync,
    /// and local if any local replica qualifies.
    fn find_read_candidate(&self, block_index: u64) -> Option<String> {
        let mut candidate = None;
        for (location, status) in self.metadata.block_locations(block_index) {
            if self.ctx.node_errors.is_in_failure(&location) {
                continue;
            }
            if status != SyncStatus::InSync {
                continue;
            }
            if self.ctx.addrs.is_local(&location) {
                return Some(location);
            }
            candidate = Some(location);
        }
        candidate
    }

    /// Write `data` at `offset` to every replica of the touched blocks.
    /// Returns the caller-supplied length; replicas that could not take
    /// the write are left demoted rather than failing the operation.
    pub async fn write(&self, data: &[u8], offset: u64) -> Result<u64, UkaiError> {
        if data.is_empty() {
            return Ok(0);
        }
        let size = self.metadata.size();
        let within_image = offset
            .checked_add(data.len() as u64)
            .is_some_and(|end| end <= size);
        if !within_image {
            return Err(UkaiError::Invalid(format!(
                "write of {} bytes at {} exceeds image size {}",
                data.len(),
                offset,
                size
            )));
        }
        let name = self.metadata.name();
        let pieces = gather_pieces(self.metadata.block_size(), offset, data.len() as u64);
        self.ctx.stats.record_write(&name, &pieces);

        let first = pieces[0].block_index;
        let last = pieces[pieces.len() - 1].block_index;
        let mut flush_required = false;
        let result = {
            let _guards = self.metadata.acquire_block_range(first..=last).await;
            self.write_pieces(&name, &pieces, data, &mut flush_required).await
        };
        self.flush_after(&name, flush_required, result).await?;
        Ok(data.len() as u64)
    }

    async fn write_pieces(
        &self,
        name: &str,
        pieces: &[Piece],
        data: &[u8],
        flush_required: &mut bool,
    ) -> Result<(), UkaiError> {
        let mut data_offset = 0usize;
        for piece in pieces {
            let slice = &data[data_offset..data_offset + piece.length as usize];
            for (location, status) in self.metadata.block_locations(piece.block_index) {
                if self.ctx.node_errors.is_in_failure(&location) {
                    // A suspended peer falls behind silently; the replica
                    // is marked stale and re-synchronized on a later write.
                    if status == SyncStatus::InSync {
                        self.metadata.set_sync_status(
                            piece.block_index,
                            &location,
                            SyncStatus::OutOfSync,
                        )?;
                        *flush_required = true;
                    }
                    continue;
                }
                match self
                    .write_piece_to(piece, &location, status, slice, flush_required)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_peer_failure() => {
                        log::warn!(
                            "write of block {} of {} to {} failed: {}",
                            piece.block_index,
                            name,
                            location,
                            e
                        );
                        self.metadata.set_sync_status(
                            piece.block_index,
                            &location,
                            SyncStatus::OutOfSync,
                        )?;
                        *flush_required = true;
                        self.ctx.node_errors.add(&location, &e.to_string());
                    }
                    Err(e @ UkaiError::DataUnavailable(_)) => {
                        // No in-sync source to heal this replica from; it
                        // stays out of sync until one comes back.
                        log::warn!(
                            "cannot synchronize block {} of {} to {}: {}",
                            piece.block_index,
                            name,
                            location,
                            e
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            data_offset += piece.length as usize;
        }
        Ok(())
    }

    async fn write_piece_to(
        &self,
        piece: &Piece,
        location: &str,
        status: SyncStatus,
        data: &[u8],
        flush_required: &mut bool,
    ) -> Result<(), UkaiError> {
        if status != SyncStatus::InSync {
            self.synchronize_block_to(piece.block_index, location).await?;
            *flush_required = true;
        }
        self.put_data(location, piece, data).await?;
        Ok(())
    }

    async fn flush_after<T>(
        &self,
        name: &str,
        flush_required: bool,
        result: Result<T, UkaiError>,
    ) -> Result<T, UkaiError> {
        if !flush_required {
            return result;
        }
        match result {
            Ok(value) => {
                self.metadata.flush(&self.ctx).await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(flush_error) = self.metadata.flush(&self.ctx).await {
                    log::warn!(
                        "metadata flush of {} after failed I/O also failed: {}",
                        name,
                        flush_error
                    );
                }
                Err(e)
            }
        }
    }

    pub(crate) async fn get_data(&self, node: &str, piece: &Piece) -> Result<Vec<u8>, UkaiError> {
        let name = self.metadata.name();
        let block_size = self.metadata.block_size();
        if self.ctx.addrs.is_local(node) {
            return block_store::read(
                &self.ctx.config,
                &name,
                block_size,
                piece.block_index,
                piece.offset,
                piece.length,
            );
        }
        let client = RpcClient::for_peer(&self.ctx.config, node);
        let payload = client
            .connect()?
            .proxy_read(name, block_size, piece.block_index, piece.offset, piece.length)
            .await
            .map_err(|e| UkaiError::from_client_error(node, e))?;
        let data = payload.decompressed().map_err(|e| UkaiError::Transport {
            peer: node.to_string(),
            detail: format!("garbled proxy_read reply: {}", e),
        })?;
        if data.len() as u64 != piece.length {
            return Err(UkaiError::Transport {
                peer: node.to_string(),
                detail: format!(
                    "short read of block {}: got {} bytes, wanted {}",
                    piece.block_index,
                    data.len(),
                    piece.length
                ),
            });
        }
        Ok(data)
    }

    pub(crate) async fn put_data(
        &self,
        node: &str,
        piece: &Piece,
        data: &[u8],
    ) -> Result<u64, UkaiError> {
        let name = self.metadata.name();
        let block_size = self.metadata.block_size();
        if self.ctx.addrs.is_local(node) {
            return block_store::write(
                &self.ctx.config,
                &name,
                block_size,
                piece.block_index,
                piece.offset,
                data,
            );
        }
        let client = RpcClient::for_peer(&self.ctx.config, node);
        let payload = HexPayload::from_compressed(data)?;
        client
            .connect()?
            .proxy_write(name, block_size, piece.block_index, piece.offset, payload)
            .await
            .map_err(|e| UkaiError::from_client_error(node, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_block_piece() {
        let pieces = gather_pieces(16, 10, 5);
        assert_eq!(
            pieces,
            vec![Piece { block_index: 0, offset: 10, length: 5 }]
        );
    }

    #[test]
    fn test_straddling_piece_list() {
        let pieces = gather_pieces(16, 14, 8);
        assert_eq!(
            pieces,
            vec![
                Piece { block_index: 0, offset: 14, length: 2 },
                Piece { block_index: 1, offset: 0, length: 6 },
            ]
        );
    }

    #[test]
    fn test_interior_blocks_are_whole() {
        let pieces = gather_pieces(16, 8, 40);
        assert_eq!(
            pieces,
            vec![
                Piece { block_index: 0, offset: 8, length: 8 },
                Piece { block_index: 1, offset: 0, length: 16 },
                Piece { block_index: 2, offset: 0, length: 16 },
            ]
        );
    }

    #[test]
    fn test_pieces_are_complete_and_contiguous() {
        let block_size = 16u64;
        for offset in 0..48 {
            for size in 1..48 {
                let pieces = gather_pieces(block_size, offset, size);
                let total: u64 = pieces.iter().map(|p| p.length).sum();
                assert_eq!(total, size, "offset {} size {}", offset, size);

                let mut position = offset;
                for piece in &pieces {
                    assert_eq!(
                        piece.block_index * block_size + piece.offset,
                        position,
                        "offset {} size {}",
                        offset,
                        size
                    );
                    assert!(piece.offset + piece.length <= block_size);
                    position += piece.length;
                }
            }
        }
    }

    #[test]
    fn test_block_aligned_request() {
        let pieces = gather_pieces(16, 16, 16);
        assert_eq!(
            pieces,
            vec![Piece { block_index: 1, offset: 0, length: 16 }]
        );
    }
}
