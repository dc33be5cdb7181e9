//! Processing graph.
//!
//! Nodes are operators over tiled images. A chain is built by handing
//! nodes their sources; nothing is computed until a tile is requested.

pub mod environment;
pub mod kernel;
pub mod source;
pub mod node;
pub mod area;
pub mod untiled;
pub mod statistics;

// Re-export commonly used types
pub use environment::Environment;
pub use kernel::{AreaKernel, UntiledKernel, StatisticsKernel, StatisticAccumulator};
pub use source::{TileProvider, StaticImage};
pub use node::{ImageNode, OperatorKind, NodeEvent, NodeSubscriber, SubscriptionId};
pub use area::AreaOp;
pub use untiled::UntiledOp;
pub use statistics::{Sampling, StatisticValue, StatisticsOp};
