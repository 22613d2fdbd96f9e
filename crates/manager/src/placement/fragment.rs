use crate::placement::Placement;
use crate::topology::GpuTree;
use crate::topology::NodeId;
use crate::topology::NodeSorter;
use crate::topology::SortKey;
use crate::topology::HUNDRED_CORE;

/// Single-card placement that packs into already fragmented subtrees, so
/// wide untouched subtrees stay whole for later link requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct FragmentMode;

impl Placement for FragmentMode {
    fn evaluate(&self, tree: &GpuTree, cores: u32, _memory: u64) -> Vec<NodeId> {
        let num = cores / HUNDRED_CORE;
        let sorter = NodeSorter::new(&[
            SortKey::ByAvailable,
            SortKey::ByAllocatableMemory,
            SortKey::ByPids,
            SortKey::ByMinorId,
        ]);

        // descend towards the emptiest subtree that can still serve the
        // request, stopping where no child qualifies
        let mut candidate = tree.root();
        loop {
            let mut children = tree.node(candidate).children.clone();
            tree.sort_ids(&mut children, &sorter);

            let mut descended = false;
            for child in children {
                let node = tree.node(child);
                if node.children.is_empty() || node.available() < num {
                    continue;
                }
                candidate = child;
                descended = true;
                break;
            }
            if !descended {
                break;
            }
        }

        let mut picked = Vec::with_capacity(num as usize);
        for leaf in tree.available_leaves(candidate) {
            if picked.len() == num as usize {
                break;
            }
            picked.push(leaf);
        }

        if picked.len() < num as usize {
            return Vec::new();
        }
        picked
    }
}
