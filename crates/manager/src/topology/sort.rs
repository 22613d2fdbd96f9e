//! Multi-key node ordering used by the placement strategies.

use std::cmp::Ordering;

use crate::topology::node::GpuNode;
use crate::types::MEMORY_BLOCK_SIZE;

/// One atomic comparison key. Strategies compose these into a
/// lexicographic order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    /// topology level, tighter coupling first
    ByType,
    /// count of fully free leaves, emptier first
    ByAvailable,
    ByAllocatableCores,
    /// allocatable memory in whole memory blocks
    ByAllocatableMemory,
    /// count of observed pids
    ByPids,
    ByMinorId,
    /// observed used memory
    ByMemory,
}

impl SortKey {
    pub fn compare(&self, a: &GpuNode, b: &GpuNode) -> Ordering {
        match self {
            SortKey::ByType => a.level.cmp(&b.level),
            SortKey::ByAvailable => a.available().cmp(&b.available()),
            SortKey::ByAllocatableCores => a.alloc.cores.cmp(&b.alloc.cores),
            SortKey::ByAllocatableMemory => {
                (a.alloc.memory / MEMORY_BLOCK_SIZE).cmp(&(b.alloc.memory / MEMORY_BLOCK_SIZE))
            }
            SortKey::ByPids => a.meta.pids.len().cmp(&b.meta.pids.len()),
            SortKey::ByMinorId => a.meta.minor_id.cmp(&b.meta.minor_id),
            SortKey::ByMemory => a.meta.used_memory.cmp(&b.meta.used_memory),
        }
    }
}

/// Lexicographic comparator over a key list.
#[derive(Debug, Clone)]
pub struct NodeSorter {
    keys: Vec<SortKey>,
}

impl NodeSorter {
    pub fn new(keys: &[SortKey]) -> Self {
        Self {
            keys: keys.to_vec(),
        }
    }

    pub fn compare(&self, a: &GpuNode, b: &GpuNode) -> Ordering {
        for key in &self.keys {
            match key.compare(a, b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::node::TopologyLevel;

    fn leaf(minor: u32, cores: u32, memory: u64, pids: usize) -> GpuNode {
        let mut node = GpuNode::new(TopologyLevel::Internal, minor as usize);
        node.meta.minor_id = minor;
        node.meta.pids = vec![0; pids];
        node.alloc.cores = cores;
        node.alloc.memory = memory;
        node
    }

    #[test]
    fn allocatable_memory_compares_in_blocks() {
        let a = leaf(0, 50, MEMORY_BLOCK_SIZE, 0);
        // one block plus change still counts as one block
        let b = leaf(1, 50, MEMORY_BLOCK_SIZE + 1024, 0);
        assert_eq!(SortKey::ByAllocatableMemory.compare(&a, &b), Ordering::Equal);

        let c = leaf(2, 50, 2 * MEMORY_BLOCK_SIZE, 0);
        assert_eq!(SortKey::ByAllocatableMemory.compare(&a, &c), Ordering::Less);
    }

    #[test]
    fn sorter_is_lexicographic() {
        let sorter = NodeSorter::new(&[SortKey::ByAllocatableCores, SortKey::ByMinorId]);

        let a = leaf(3, 50, 0, 0);
        let b = leaf(1, 50, 0, 0);
        let c = leaf(0, 100, 0, 0);

        let mut nodes = vec![c.clone(), a.clone(), b.clone()];
        nodes.sort_by(|x, y| sorter.compare(x, y));

        let minors: Vec<u32> = nodes.iter().map(|n| n.meta.minor_id).collect();
        assert_eq!(minors, vec![1, 3, 0]);
    }

    #[test]
    fn pid_count_breaks_ties() {
        let sorter = NodeSorter::new(&[SortKey::ByAllocatableCores, SortKey::ByPids]);
        let busy = leaf(0, 100, 0, 4);
        let idle = leaf(1, 100, 0, 0);
        assert_eq!(sorter.compare(&idle, &busy), Ordering::Less);
    }
}
