//! Placement strategies over the topology tree.
//!
//! All three are pure functions of the tree state: they never mutate it
//! and always hand leaves back in ascending minor-id order. Which one
//! runs is a direct match on the request shape in the allocator.

pub mod fragment;
pub mod link;
pub mod share;

pub use fragment::FragmentMode;
pub use link::LinkMode;
pub use share::ShareMode;

use crate::topology::GpuTree;
use crate::topology::NodeId;

/// A placement strategy. Returns the chosen leaves, or an empty list when
/// the request cannot be satisfied.
pub trait Placement {
    fn evaluate(&self, tree: &GpuTree, cores: u32, memory: u64) -> Vec<NodeId>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Driver;
    use crate::driver::DummyDriver;
    use crate::topology::HUNDRED_CORE;
    use crate::types::MEMORY_BLOCK_SIZE;

    const GIB: u64 = 1 << 30;

    const SIX_GPU_TOPOLOGY: &str = "\
      GPU0 GPU1 GPU2 GPU3 GPU4 GPU5
GPU0   X   PIX  PHB  PHB  SOC  SOC
GPU1  PIX   X   PHB  PHB  SOC  SOC
GPU2  PHB  PHB   X   PIX  SOC  SOC
GPU3  PHB  PHB  PIX   X   SOC  SOC
GPU4  SOC  SOC  SOC  SOC   X   PIX
GPU5  SOC  SOC  SOC  SOC  PIX   X
";

    fn six_gpu_tree() -> (Driver, GpuTree) {
        let driver = Driver::Dummy(DummyDriver::from_matrix(SIX_GPU_TOPOLOGY, GIB).unwrap());
        let tree = GpuTree::from_snapshot(&driver.snapshot().unwrap()).unwrap();
        (driver, tree)
    }

    fn minors(tree: &GpuTree, ids: &[NodeId]) -> Vec<u32> {
        ids.iter().map(|&id| tree.node(id).meta.minor_id).collect()
    }

    #[test]
    fn link_prefers_the_tightest_subtree() {
        // on a fresh tree a two-card request lands on the isolated PIX
        // pair, not inside the four-card host-bridge cluster
        let (_driver, tree) = six_gpu_tree();
        let picked = LinkMode.evaluate(&tree, 200, 0);
        assert_eq!(minors(&tree, &picked), vec![4, 5]);
    }

    #[test]
    fn link_falls_back_to_the_lowest_pair_inside_a_cluster() {
        let (_driver, mut tree) = six_gpu_tree();
        for minor in [4u32, 5] {
            let leaf = tree.query(&format!("/dev/nvidia{minor}")).unwrap();
            tree.mark_occupied(leaf, 100, 0);
        }

        let picked = LinkMode.evaluate(&tree, 200, 0);
        assert_eq!(minors(&tree, &picked), vec![0, 1]);
    }

    #[test]
    fn fragment_serves_two_cards_from_the_isolated_pair() {
        let (_driver, tree) = six_gpu_tree();
        let picked = FragmentMode.evaluate(&tree, 200, 0);
        assert_eq!(minors(&tree, &picked), vec![4, 5]);
    }

    #[test]
    fn fragment_takes_the_remaining_half_of_a_pair() {
        let (_driver, mut tree) = six_gpu_tree();
        let leaf = tree.query("/dev/nvidia4").unwrap();
        tree.mark_occupied(leaf, 200, 0);

        let picked = FragmentMode.evaluate(&tree, 100, 0);
        assert_eq!(minors(&tree, &picked), vec![5]);
    }

    #[test]
    fn fragment_packs_into_the_narrowest_subtree() {
        let (_driver, mut tree) = six_gpu_tree();
        // after the PIX pair is taken, a single-card request starts
        // chewing on the host-bridge cluster, lowest minor first
        for minor in [4u32, 5] {
            let leaf = tree.query(&format!("/dev/nvidia{minor}")).unwrap();
            tree.mark_occupied(leaf, 100, 0);
        }

        let picked = FragmentMode.evaluate(&tree, 100, 0);
        assert_eq!(minors(&tree, &picked), vec![0]);
    }

    #[test]
    fn share_fills_the_most_used_leaf_first() {
        let (_driver, mut tree) = six_gpu_tree();
        let picked = ShareMode.evaluate(&tree, 50, MEMORY_BLOCK_SIZE);
        assert_eq!(minors(&tree, &picked), vec![0]);

        // after taking half of GPU0, a second identical request still
        // fits there, and the emptier cards stay untouched
        let leaf = picked[0];
        tree.mark_occupied(leaf, 50, MEMORY_BLOCK_SIZE);
        let second = ShareMode.evaluate(&tree, 50, MEMORY_BLOCK_SIZE);
        assert_eq!(minors(&tree, &second), vec![0]);
    }

    #[test]
    fn link_can_take_the_whole_machine() {
        let (_driver, tree) = six_gpu_tree();
        let picked = LinkMode.evaluate(&tree, 600, 0);
        assert_eq!(minors(&tree, &picked), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn everything_fails_on_a_full_machine() {
        let (_driver, mut tree) = six_gpu_tree();
        for &leaf in tree.leaves().to_vec().iter() {
            tree.mark_occupied(leaf, 100, 0);
        }
        assert!(LinkMode.evaluate(&tree, 200, 0).is_empty());
        assert!(FragmentMode.evaluate(&tree, 100, 0).is_empty());
        assert!(ShareMode.evaluate(&tree, 10, MEMORY_BLOCK_SIZE).is_empty());
    }

    #[test]
    fn link_is_deterministic() {
        let (_driver, tree) = six_gpu_tree();
        let first = LinkMode.evaluate(&tree, 200, 0);
        for _ in 0..10 {
            assert_eq!(LinkMode.evaluate(&tree, 200, 0), first);
        }
    }

    #[test]
    fn fragment_exhausts_partial_subtrees_before_fresh_ones() {
        let (_driver, mut tree) = six_gpu_tree();

        // allocate single cards one after another; the host-bridge
        // cluster must be fully consumed before the pick moves on
        let mut order = Vec::new();
        for _ in 0..6 {
            let picked = FragmentMode.evaluate(&tree, 100, 0);
            assert_eq!(picked.len(), 1);
            order.push(tree.node(picked[0]).meta.minor_id);
            tree.mark_occupied(picked[0], 100, 0);
        }
        assert!(FragmentMode.evaluate(&tree, 100, 0).is_empty());

        let cluster_end = order.iter().position(|m| *m >= 4).unwrap();
        assert!(
            order[..cluster_end].iter().all(|m| *m < 4),
            "fragment left the first cluster early: {order:?}"
        );
    }

    #[test]
    fn share_never_overcommits() {
        let (_driver, mut tree) = six_gpu_tree();
        for &leaf in tree.leaves().to_vec().iter() {
            tree.mark_occupied(leaf, 80, GIB - MEMORY_BLOCK_SIZE);
        }

        let picked = ShareMode.evaluate(&tree, 30, MEMORY_BLOCK_SIZE);
        assert!(picked.is_empty());

        let picked = ShareMode.evaluate(&tree, 20, MEMORY_BLOCK_SIZE);
        assert_eq!(picked.len(), 1);
        let node = tree.node(picked[0]);
        assert!(node.alloc.cores >= 20);
        assert!(node.alloc.memory >= MEMORY_BLOCK_SIZE);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Share only ever returns a leaf that satisfies both
            /// dimensions of the request.
            #[test]
            fn share_is_safe(
                ops in proptest::collection::vec((0usize..6, 1u32..=99, 1u64..=4), 0..12),
                cores in 1u32..=99,
                blocks in 1u64..=4,
            ) {
                let (_driver, mut tree) = six_gpu_tree();
                for (leaf_idx, c, b) in ops {
                    let leaf = tree.leaves()[leaf_idx];
                    tree.mark_occupied(leaf, c, b * MEMORY_BLOCK_SIZE);
                }

                let memory = blocks * MEMORY_BLOCK_SIZE;
                let picked = ShareMode.evaluate(&tree, cores, memory);
                if let Some(&leaf) = picked.first() {
                    let node = tree.node(leaf);
                    prop_assert!(node.alloc.cores >= cores);
                    prop_assert!(node.alloc.memory >= memory);
                }
            }

            /// Link answers identically for identical tree states.
            #[test]
            fn link_is_idempotent(
                busy in proptest::collection::vec(0usize..6, 0..4),
                num in 2u32..=3,
            ) {
                let (_driver, mut tree) = six_gpu_tree();
                let mut seen = std::collections::HashSet::new();
                for leaf_idx in busy {
                    if seen.insert(leaf_idx) {
                        tree.mark_occupied(tree.leaves()[leaf_idx], 100, 0);
                    }
                }
                let first = LinkMode.evaluate(&tree, num * HUNDRED_CORE, 0);
                let second = LinkMode.evaluate(&tree, num * HUNDRED_CORE, 0);
                prop_assert_eq!(first, second);
            }
        }
    }
}
