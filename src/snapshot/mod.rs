//! Writable images and frozen snapshots of them.

pub mod coordinator;
pub mod image;

pub use coordinator::{Snapshot, SnapshotCoordinator, SnapshotEvent, SnapshotId, SnapshotSubscriber};
pub use image::{TileObserver, WritableTile, WritableTiledImage};
