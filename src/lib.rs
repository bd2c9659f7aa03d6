//! UKAI — a location-aware distributed block store for virtual-machine
//! disk images.
//!
//! A virtual disk is partitioned into fixed-size blocks, each replicated
//! on one or more storage nodes. The node holding an image open fans
//! block I/O out to the replicas, heals out-of-sync replicas on first
//! write, masks unreachable peers behind a timed failure cache, and
//! pushes metadata updates to peer hypervisors so a guest can be
//! live-migrated without copying its backing data first.
//!
//! The crate is organised around the core service ([`UkaiCore`]): the
//! per-image metadata object and data engine live in [`storage`], the
//! metadata directory client in [`directory`], the RPC surface in
//! [`rpc`], and the VFS translation layer in [`vfs`].

pub mod core;
pub mod directory;
pub mod node_error;
pub mod rpc;
pub mod stats;
pub mod storage;
pub mod types;
pub mod utils;
pub mod vfs;

pub use crate::core::{CoreContext, CoreServer, UkaiCore};
pub use crate::directory::{MemoryDirectory, MetadataDirectory, RpcDirectory};
pub use crate::storage::{ImageMetadata, MetadataContent, SyncStatus, UkaiData};
pub use crate::types::{UkaiConfig, UkaiError};
