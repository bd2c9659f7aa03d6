pub mod fuse_bridge;

pub use fuse_bridge::FuseBridge;
