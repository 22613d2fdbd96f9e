use crate::placement::Placement;
use crate::topology::GpuTree;
use crate::topology::NodeId;
use crate::topology::NodeSorter;
use crate::topology::SortKey;

/// Sub-card placement: pick the busiest leaf that still fits both the
/// core and the memory dimension, so fragmentation concentrates on as few
/// cards as possible.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShareMode;

impl Placement for ShareMode {
    fn evaluate(&self, tree: &GpuTree, cores: u32, memory: u64) -> Vec<NodeId> {
        let sorter = NodeSorter::new(&[
            SortKey::ByAllocatableCores,
            SortKey::ByAllocatableMemory,
            SortKey::ByPids,
            SortKey::ByMinorId,
        ]);

        let mut leaves: Vec<NodeId> = tree.leaves().to_vec();
        tree.sort_ids(&mut leaves, &sorter);

        for leaf in leaves {
            let node = tree.node(leaf);
            if node.alloc.cores >= cores && node.alloc.memory >= memory {
                return vec![leaf];
            }
        }
        Vec::new()
    }
}
