//! Per-image I/O statistics.
//!
//! The data engine reports each request's piece list here before the
//! block locks are taken; the counters are served back through the
//! control surface.

use crate::storage::Piece;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
struct BlockCounters {
    read_ops: u64,
    write_ops: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIoStats {
    pub block_index: u64,
    pub read_ops: u64,
    pub write_ops: u64,
}

/// Counters for every image this node currently serves. Cheap to clone;
/// all clones share the same state.
#[derive(Clone, Default)]
pub struct StatisticsSet {
    inner: Arc<Mutex<HashMap<String, HashMap<u64, BlockCounters>>>>,
}

impl StatisticsSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, image: &str, pieces: &[Piece]) {
        let mut set = self.inner.lock();
        let image_stats = set.entry(image.to_string()).or_default();
        for piece in pieces {
            image_stats.entry(piece.block_index).or_default().read_ops += 1;
        }
    }

    pub fn record_write(&self, image: &str, pieces: &[Piece]) {
        let mut set = self.inner.lock();
        let image_stats = set.entry(image.to_string()).or_default();
        for piece in pieces {
            image_stats.entry(piece.block_index).or_default().write_ops += 1;
        }
    }

    /// Counters for one image, ordered by block index. Empty when the
    /// image has seen no I/O here.
    pub fn snapshot(&self, image: &str) -> Vec<BlockIoStats> {
        let set = self.inner.lock();
        let mut rows: Vec<BlockIoStats> = set
            .get(image)
            .map(|image_stats| {
                image_stats
                    .iter()
                    .map(|(block_index, counters)| BlockIoStats {
                        block_index: *block_index,
                        read_ops: counters.read_ops,
                        write_ops: counters.write_ops,
                    })
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|row| row.block_index);
        rows
    }

    pub fn remove(&self, image: &str) {
        self.inner.lock().remove(image);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn piece(block_index: u64) -> Piece {
        Piece {
            block_index,
            offset: 0,
            length: 1,
        }
    }

    #[test]
    fn test_counters_accumulate_per_block() {
        let stats = StatisticsSet::new();
        stats.record_read("img", &[piece(0), piece(1)]);
        stats.record_read("img", &[piece(1)]);
        stats.record_write("img", &[piece(1)]);

        let rows = stats.snapshot("img");
        assert_eq!(
            rows,
            vec![
                BlockIoStats { block_index: 0, read_ops: 1, write_ops: 0 },
                BlockIoStats { block_index: 1, read_ops: 2, write_ops: 1 },
            ]
        );
    }

    #[test]
    fn test_images_are_independent() {
        let stats = StatisticsSet::new();
        stats.record_write("a", &[piece(3)]);

        assert_eq!(stats.snapshot("b"), vec![]);
        stats.remove("a");
        assert_eq!(stats.snapshot("a"), vec![]);
    }
}
