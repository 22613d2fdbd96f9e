use crate::placement::Placement;
use crate::topology::GpuTree;
use crate::topology::NodeId;
use crate::topology::NodeSorter;
use crate::topology::SortKey;
use crate::topology::TopologyLevel;
use crate::topology::HUNDRED_CORE;

/// Multi-card placement that minimizes topology distance: the request is
/// served out of the tightest subtree that still holds enough fully free
/// cards, so chosen cards share the cheapest possible link.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkMode;

impl Placement for LinkMode {
    fn evaluate(&self, tree: &GpuTree, cores: u32, _memory: u64) -> Vec<NodeId> {
        let num = cores / HUNDRED_CORE;
        let sorter = NodeSorter::new(&[
            SortKey::ByType,
            SortKey::ByAvailable,
            SortKey::ByAllocatableMemory,
            SortKey::ByPids,
            SortKey::ByMinorId,
        ]);

        // from every leaf, walk up to the first ancestor wide enough for
        // the request; those ancestors are the candidate subtrees
        let mut candidates: Vec<NodeId> = Vec::new();
        for &leaf in tree.leaves() {
            let mut cur = leaf;
            while cur != tree.root() {
                if tree.node(cur).available() < num {
                    match tree.node(cur).parent {
                        Some(parent) => cur = parent,
                        None => break,
                    }
                    continue;
                }
                if !candidates.contains(&cur) {
                    candidates.push(cur);
                }
                break;
            }
        }

        if candidates.is_empty() {
            candidates.push(tree.root());
        }

        tree.sort_ids(&mut candidates, &sorter);

        // Candidates can tie on every key when the machine holds several
        // equally tight, equally empty subtrees. Consume the one hanging
        // off the loosest parent: it is the most isolated choice, so
        // tight clusters stay whole for wider requests.
        let front: Vec<NodeId> = candidates
            .iter()
            .copied()
            .take_while(|&id| {
                sorter
                    .compare(tree.node(candidates[0]), tree.node(id))
                    .is_eq()
            })
            .collect();
        let best = front
            .into_iter()
            .min_by_key(|&id| {
                let parent_level = tree
                    .node(id)
                    .parent
                    .map(|p| tree.node(p).level)
                    .unwrap_or(TopologyLevel::Unknown);
                (std::cmp::Reverse(parent_level), tree.node(id).mask.trailing_zeros())
            })
            .unwrap_or(candidates[0]);

        let mut picked = Vec::with_capacity(num as usize);
        for leaf in tree.available_leaves(best) {
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
