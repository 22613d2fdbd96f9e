//! GPU topology tree and its occupancy bookkeeping.
//!
//! The tree has an immutable shape built once from a pairwise topology
//! snapshot; only per-leaf allocatable counters and the free-leaf masks
//! change afterwards, always under the allocator lock.

pub mod node;
pub mod sort;
pub mod tree;

pub use node::AllocatableMeta;
pub use node::DeviceMeta;
pub use node::GpuNode;
pub use node::NodeId;
pub use node::TopologyLevel;
pub use node::HUNDRED_CORE;
pub use sort::NodeSorter;
pub use sort::SortKey;
pub use tree::GpuTree;
