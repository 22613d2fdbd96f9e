use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt::Write as _;

use anyhow::bail;
use anyhow::Result;
use tracing::debug;
use tracing::warn;

use crate::driver::Driver;
use crate::driver::TopologySnapshot;
use crate::topology::node::AllocatableMeta;
use crate::topology::node::GpuNode;
use crate::topology::node::NodeId;
use crate::topology::node::TopologyLevel;
use crate::topology::node::HUNDRED_CORE;
use crate::topology::sort::NodeSorter;
use crate::topology::sort::SortKey;

/// The GPU topology tree. Nodes live in an arena; parent/child links are
/// stable indices, so the whole forest sits behind one mutability
/// boundary.
#[derive(Debug, Clone)]
pub struct GpuTree {
    nodes: Vec<GpuNode>,
    root: NodeId,
    leaves: Vec<NodeId>,
    by_minor: HashMap<String, NodeId>,
}

impl GpuTree {
    /// Build the tree from a driver snapshot: leaves first, then one
    /// internal node per connected group at each topology level, stitched
    /// bottom-up under an artificial root.
    pub fn from_snapshot(snap: &TopologySnapshot) -> Result<Self> {
        let count = snap.devices.len();
        if count == 0 {
            bail!("no gpu devices in topology snapshot");
        }
        if count > 64 {
            bail!("too many gpu devices for the leaf mask: {count}");
        }
        if snap.levels.len() != count || snap.levels.iter().any(|row| row.len() != count) {
            bail!("pairwise level matrix does not match device count {count}");
        }

        let mut nodes: Vec<GpuNode> = Vec::with_capacity(count * 2 + 1);
        let mut leaves = Vec::with_capacity(count);
        for (i, dev) in snap.devices.iter().enumerate() {
            let mut leaf = GpuNode::new(TopologyLevel::Internal, i);
            leaf.mask = 1u64 << i;
            leaf.meta.minor_id = dev.minor_id;
            leaf.meta.uuid = dev.uuid.clone();
            leaf.meta.bus_id = dev.bus_id.clone();
            leaf.meta.total_memory = dev.total_memory;
            leaf.alloc = AllocatableMeta {
                cores: HUNDRED_CORE,
                memory: dev.total_memory,
            };
            leaves.push(NodeId(i));
            nodes.push(leaf);
        }

        // Group leaf pairs into upper nodes, one per connected mask at
        // each level. Pairs on the same board behave like one switch.
        let mut groups: BTreeMap<TopologyLevel, Vec<NodeId>> = BTreeMap::new();
        for a in 0..count {
            for b in (a + 1)..count {
                let mut level = snap.levels[a][b];
                if level == TopologyLevel::Internal {
                    level = TopologyLevel::Single;
                }
                let mask = (1u64 << a) | (1u64 << b);

                let list = groups.entry(level).or_default();
                let mut joined = false;
                for id in list.iter() {
                    if nodes[id.0].mask & mask != 0 {
                        nodes[id.0].mask |= mask;
                        joined = true;
                        break;
                    }
                }
                if !joined {
                    let id = NodeId(nodes.len());
                    let mut upper = GpuNode::new(level, id.0);
                    upper.mask = mask;
                    nodes.push(upper);
                    list.push(id);
                }
            }
        }

        // Stitch every leaf to its chain of ancestors, tightest level
        // first. Children are collected as sets so repeated walks stay
        // idempotent.
        let mut vchildren: HashMap<usize, BTreeSet<usize>> = HashMap::new();
        for &leaf in &leaves {
            let mut cur = leaf;
            for level in TopologyLevel::ASCENDING {
                let Some(list) = groups.get(&level) else {
                    continue;
                };
                for &upper in list {
                    if nodes[upper.0].mask & nodes[cur.0].mask != 0 {
                        nodes[cur.0].parent = Some(upper);
                        vchildren.entry(upper.0).or_default().insert(cur.0);
                        cur = upper;
                        break;
                    }
                }
            }
        }

        // Artificial root above the widest populated level.
        let root = NodeId(nodes.len());
        nodes.push(GpuNode::new(TopologyLevel::Unknown, root.0));

        let top_level = groups
            .iter()
            .rev()
            .find(|(_, list)| !list.is_empty())
            .map(|(level, _)| *level);

        match top_level {
            Some(level) => {
                let top: Vec<NodeId> = groups[&level].clone();
                for id in top {
                    nodes[root.0].mask |= nodes[id.0].mask;
                    nodes[id.0].parent = Some(root);
                    vchildren.entry(root.0).or_default().insert(id.0);
                }
            }
            None => {
                // single card, hang the leaf straight off the root
                let leaf = leaves[0];
                nodes[root.0].mask |= nodes[leaf.0].mask;
                nodes[leaf.0].parent = Some(root);
                vchildren.entry(root.0).or_default().insert(leaf.0);
            }
        }

        for (parent, children) in vchildren {
            nodes[parent].children = children.into_iter().map(NodeId).collect();
        }

        let by_minor = leaves
            .iter()
            .map(|&id| (nodes[id.0].minor_name(), id))
            .collect();

        Ok(Self {
            nodes,
            root,
            leaves,
            by_minor,
        })
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn leaves(&self) -> &[NodeId] {
        &self.leaves
    }

    pub fn total(&self) -> usize {
        self.leaves.len()
    }

    pub fn node(&self, id: NodeId) -> &GpuNode {
        &self.nodes[id.0]
    }

    /// Find a leaf by its `/dev/nvidiaN` name.
    pub fn query(&self, minor_name: &str) -> Option<NodeId> {
        self.by_minor.get(minor_name).copied()
    }

    /// Count of fully free leaves in the whole tree.
    pub fn available(&self) -> u32 {
        self.nodes[self.root.0].available()
    }

    /// Leaves below `id` that are fully free, in ascending bit order.
    pub fn available_leaves(&self, id: NodeId) -> Vec<NodeId> {
        let mut mask = self.nodes[id.0].mask;
        let mut out = Vec::with_capacity(mask.count_ones() as usize);
        while mask != 0 {
            let bit = mask.trailing_zeros() as usize;
            out.push(self.leaves[bit]);
            mask &= mask - 1;
        }
        out
    }

    /// Sort node ids with the given comparator; ties settle on the last
    /// key, and the sort itself is stable.
    pub fn sort_ids(&self, ids: &mut [NodeId], sorter: &NodeSorter) {
        ids.sort_by(|a, b| sorter.compare(&self.nodes[a.0], &self.nodes[b.0]));
    }

    /// Take `cores`/`memory` off a leaf. Any occupancy removes the leaf
    /// from the free masks; an exclusive request zeroes the counters.
    pub fn mark_occupied(&mut self, leaf: NodeId, cores: u32, memory: u64) {
        let node = &self.nodes[leaf.0];
        debug!(
            device = %node.minor_name(),
            cores,
            memory,
            "occupy device"
        );
        self.clear_free_bit(leaf);

        let node = &mut self.nodes[leaf.0];
        if cores >= HUNDRED_CORE {
            node.alloc.cores = 0;
            node.alloc.memory = 0;
        } else {
            node.alloc.cores = node.alloc.cores.saturating_sub(cores);
            node.alloc.memory = node.alloc.memory.saturating_sub(memory);
        }
    }

    /// Give `cores`/`memory` back to a leaf. When the leaf becomes fully
    /// free again it goes through a driver reset before its mask bits are
    /// restored; a failed reset keeps it out of the free set.
    pub fn mark_free(&mut self, driver: &Driver, leaf: NodeId, cores: u32, memory: u64) {
        {
            let node = &mut self.nodes[leaf.0];
            debug!(device = %node.minor_name(), cores, memory, "free device");
            if cores >= HUNDRED_CORE {
                node.alloc.cores = HUNDRED_CORE;
                node.alloc.memory = node.meta.total_memory;
            } else {
                node.alloc.cores = (node.alloc.cores + cores).min(HUNDRED_CORE);
                node.alloc.memory = (node.alloc.memory + memory).min(node.meta.total_memory);
            }
        }

        if self.nodes[leaf.0].alloc.cores == HUNDRED_CORE {
            self.nodes[leaf.0].pending_reset = true;
            if self.try_reset(driver, leaf) {
                self.set_free_bit(leaf);
            } else {
                warn!(
                    device = %self.nodes[leaf.0].minor_name(),
                    "device waiting for reset before it can be reallocated"
                );
            }
        }
    }

    /// Refresh observed pids/memory/utilization on every leaf and retry
    /// pending resets. Allocation decisions never read the observed
    /// fields; they only feed placement tie-breaks and the display
    /// endpoint.
    pub fn update(&mut self, driver: &Driver) {
        for i in 0..self.leaves.len() {
            let leaf = self.leaves[i];
            match driver.sample(i) {
                Ok(sample) => {
                    let node = &mut self.nodes[leaf.0];
                    node.meta.pids = sample.pids;
                    node.meta.used_memory = sample.used_memory;
                    node.meta.utilization = sample.utilization;
                }
                Err(err) => {
                    debug!(device = i, "sample failed: {err}");
                    continue;
                }
            }

            if self.nodes[leaf.0].pending_reset
                && self.nodes[leaf.0].alloc.cores == HUNDRED_CORE
                && self.try_reset(driver, leaf)
            {
                self.set_free_bit(leaf);
            }
        }

        self.aggregate_observed(self.root);
    }

    /// Attempt the driver-level reset of a fully freed leaf. Devices with
    /// running work skip the reset.
    fn try_reset(&mut self, driver: &Driver, leaf: NodeId) -> bool {
        let node = &mut self.nodes[leaf.0];
        if !node.pending_reset {
            return true;
        }
        if !node.meta.pids.is_empty() || node.meta.used_memory > 0 {
            node.pending_reset = false;
            return true;
        }
        match driver.reset(&node.meta) {
            Ok(()) => {
                node.pending_reset = false;
                true
            }
            Err(err) => {
                warn!(device = %node.minor_name(), "device reset failed: {err}");
                false
            }
        }
    }

    fn clear_free_bit(&mut self, leaf: NodeId) {
        let bit = 1u64 << self.nodes[leaf.0].meta.id;
        let mut cur = Some(leaf);
        while let Some(id) = cur {
            let node = &mut self.nodes[id.0];
            if node.mask & bit == bit {
                node.mask ^= bit;
            }
            cur = node.parent;
        }
    }

    fn set_free_bit(&mut self, leaf: NodeId) {
        let bit = 1u64 << self.nodes[leaf.0].meta.id;
        let mut cur = Some(leaf);
        while let Some(id) = cur {
            let node = &mut self.nodes[id.0];
            node.mask |= bit;
            cur = node.parent;
        }
    }

    /// Recompute aggregate pids/memory on internal nodes from their
    /// children. Returns (pids, used, total) for the subtree.
    fn aggregate_observed(&mut self, id: NodeId) -> (Vec<u32>, u64, u64) {
        if self.nodes[id.0].is_leaf() {
            let node = &self.nodes[id.0];
            return (
                node.meta.pids.clone(),
                node.meta.used_memory,
                node.meta.total_memory,
            );
        }

        let children = self.nodes[id.0].children.clone();
        let mut pids = Vec::new();
        let mut used = 0u64;
        let mut total = 0u64;
        for child in children {
            let (p, u, t) = self.aggregate_observed(child);
            pids.extend(p);
            used += u;
            total += t;
        }

        let node = &mut self.nodes[id.0];
        node.meta.pids = pids.clone();
        node.meta.used_memory = used;
        node.meta.total_memory = total;
        (pids, used, total)
    }

    /// Render the tree with per-node occupancy, the way the daemon logs
    /// it and the inspection endpoint returns it.
    pub fn print_graph(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "ROOT:{}", self.available());
        self.print_iter(&mut out, self.root, 0);
        out
    }

    fn print_iter(&self, out: &mut String, id: NodeId, depth: usize) {
        if depth > 0 {
            for _ in 1..depth {
                out.push_str("|   ");
            }
            out.push_str("|---");
            let node = &self.nodes[id.0];
            let _ = writeln!(
                out,
                "{} (aval: {}, pids: {:?}, usedMemory: {}, totalMemory: {}, allocatableCores: {}, allocatableMemory: {})",
                node,
                node.available(),
                node.meta.pids,
                node.meta.used_memory,
                node.meta.total_memory,
                node.alloc.cores,
                node.alloc.memory
            );
        }

        let mut children = self.nodes[id.0].children.clone();
        let sorter = NodeSorter::new(&[SortKey::ByType, SortKey::ByAvailable, SortKey::ByMinorId]);
        self.sort_ids(&mut children, &sorter);
        for child in children {
            self.print_iter(out, child, depth + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DummyDriver;

    /// Two PIX pairs behind one host bridge, another PIX pair across the
    /// socket interconnect.
    pub(crate) const SIX_GPU_TOPOLOGY: &str = "\
      GPU0 GPU1 GPU2 GPU3 GPU4 GPU5
GPU0   X   PIX  PHB  PHB  SOC  SOC
GPU1  PIX   X   PHB  PHB  SOC  SOC
GPU2  PHB  PHB   X   PIX  SOC  SOC
GPU3  PHB  PHB  PIX   X   SOC  SOC
GPU4  SOC  SOC  SOC  SOC   X   PIX
GPU5  SOC  SOC  SOC  SOC  PIX   X
";

    const GIB: u64 = 1 << 30;

    pub(crate) fn six_gpu_tree() -> (Driver, GpuTree) {
        let driver = Driver::Dummy(DummyDriver::from_matrix(SIX_GPU_TOPOLOGY, GIB).unwrap());
        let tree = GpuTree::from_snapshot(&driver.snapshot().unwrap()).unwrap();
        (driver, tree)
    }

    fn mask_invariants_hold(tree: &GpuTree) -> bool {
        // every internal node's mask is the OR of its children's masks
        fn check(tree: &GpuTree, id: NodeId) -> bool {
            let node = tree.node(id);
            if node.is_leaf() {
                let bit = 1u64 << node.meta.id;
                return (node.mask == bit) == (node.alloc.cores == HUNDRED_CORE)
                    && (node.mask == 0 || node.mask == bit);
            }
            let or = node
                .children
                .iter()
                .map(|&c| tree.node(c).mask)
                .fold(0, |acc, m| acc | m);
            if or != node.mask {
                return false;
            }
            node.children.iter().all(|&c| check(tree, c))
        }
        check(tree, tree.root())
    }

    #[test]
    fn builds_six_gpu_tree() {
        let (_driver, tree) = six_gpu_tree();
        assert_eq!(tree.total(), 6);
        assert_eq!(tree.available(), 6);
        assert_eq!(tree.node(tree.root()).mask, 0b11_1111);
        assert!(mask_invariants_hold(&tree));

        // GPU0/GPU1 share a switch; its parent covers GPU0..GPU3
        let leaf0 = tree.query("/dev/nvidia0").unwrap();
        let pix = tree.node(leaf0).parent.unwrap();
        assert_eq!(tree.node(pix).level, TopologyLevel::Single);
        assert_eq!(tree.node(pix).mask, 0b00_0011);
        let phb = tree.node(pix).parent.unwrap();
        assert_eq!(tree.node(phb).level, TopologyLevel::HostBridge);
        assert_eq!(tree.node(phb).mask, 0b00_1111);
        let top = tree.node(phb).parent.unwrap();
        assert_eq!(tree.node(top).level, TopologyLevel::System);
        assert_eq!(tree.node(top).mask, 0b11_1111);
        assert_eq!(tree.node(top).parent, Some(tree.root()));
    }

    #[test]
    fn single_gpu_hangs_off_root() {
        let driver = Driver::Dummy(DummyDriver::from_matrix("  GPU0\nGPU0  X\n", GIB).unwrap());
        let tree = GpuTree::from_snapshot(&driver.snapshot().unwrap()).unwrap();
        assert_eq!(tree.total(), 1);
        let leaf = tree.leaves()[0];
        assert_eq!(tree.node(leaf).parent, Some(tree.root()));
        assert_eq!(tree.available(), 1);
    }

    #[test]
    fn empty_snapshot_is_rejected() {
        let snap = TopologySnapshot {
            devices: Vec::new(),
            levels: Vec::new(),
            driver_version: (0, 0),
        };
        assert!(GpuTree::from_snapshot(&snap).is_err());
    }

    #[test]
    fn exclusive_occupy_clears_masks_up_the_chain() {
        let (_driver, mut tree) = six_gpu_tree();
        let leaf = tree.query("/dev/nvidia2").unwrap();
        tree.mark_occupied(leaf, 100, 0);

        assert_eq!(tree.node(leaf).alloc.cores, 0);
        assert_eq!(tree.node(leaf).alloc.memory, 0);
        assert_eq!(tree.available(), 5);
        assert!(mask_invariants_hold(&tree));

        let mut cur = tree.node(leaf).parent;
        while let Some(id) = cur {
            assert_eq!(tree.node(id).mask & 0b100, 0);
            cur = tree.node(id).parent;
        }
    }

    #[test]
    fn shared_occupy_also_leaves_the_free_set() {
        let (_driver, mut tree) = six_gpu_tree();
        let leaf = tree.query("/dev/nvidia0").unwrap();
        tree.mark_occupied(leaf, 30, GIB / 4);

        assert_eq!(tree.node(leaf).alloc.cores, 70);
        assert_eq!(tree.node(leaf).alloc.memory, GIB - GIB / 4);
        // partially used leaves are not fully free
        assert_eq!(tree.available(), 5);
        assert!(mask_invariants_hold(&tree));
    }

    #[test]
    fn occupy_then_free_restores_everything() {
        let (driver, mut tree) = six_gpu_tree();
        let before: Vec<u64> = (0..tree.nodes.len()).map(|i| tree.nodes[i].mask).collect();

        let leaf = tree.query("/dev/nvidia4").unwrap();
        tree.mark_occupied(leaf, 200, 0);
        tree.mark_free(&driver, leaf, 200, 0);

        assert_eq!(tree.node(leaf).alloc.cores, HUNDRED_CORE);
        assert_eq!(tree.node(leaf).alloc.memory, GIB);
        let after: Vec<u64> = (0..tree.nodes.len()).map(|i| tree.nodes[i].mask).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn shared_free_restores_masks_only_at_full_cores() {
        let (driver, mut tree) = six_gpu_tree();
        let leaf = tree.query("/dev/nvidia1").unwrap();

        tree.mark_occupied(leaf, 40, GIB / 2);
        tree.mark_occupied(leaf, 40, GIB / 4);
        assert_eq!(tree.node(leaf).alloc.cores, 20);
        assert_eq!(tree.available(), 5);

        tree.mark_free(&driver, leaf, 40, GIB / 4);
        assert_eq!(tree.node(leaf).alloc.cores, 60);
        assert_eq!(tree.available(), 5);

        tree.mark_free(&driver, leaf, 40, GIB / 2);
        assert_eq!(tree.node(leaf).alloc.cores, HUNDRED_CORE);
        assert_eq!(tree.node(leaf).alloc.memory, GIB);
        assert_eq!(tree.available(), 6);
        assert!(mask_invariants_hold(&tree));
    }

    #[test]
    fn free_caps_at_totals() {
        let (driver, mut tree) = six_gpu_tree();
        let leaf = tree.query("/dev/nvidia0").unwrap();
        tree.mark_free(&driver, leaf, 50, GIB);
        assert_eq!(tree.node(leaf).alloc.cores, HUNDRED_CORE);
        assert_eq!(tree.node(leaf).alloc.memory, GIB);
    }

    #[test]
    fn available_leaves_come_back_in_bit_order() {
        let (_driver, mut tree) = six_gpu_tree();
        let leaf = tree.query("/dev/nvidia1").unwrap();
        tree.mark_occupied(leaf, 100, 0);

        let avail = tree.available_leaves(tree.root());
        let minors: Vec<u32> = avail.iter().map(|&id| tree.node(id).meta.minor_id).collect();
        assert_eq!(minors, vec![0, 2, 3, 4, 5]);
    }

    #[test]
    fn print_graph_shows_every_leaf() {
        let (_driver, tree) = six_gpu_tree();
        let graph = tree.print_graph();
        assert!(graph.starts_with("ROOT:6"));
        for i in 0..6 {
            assert!(graph.contains(&format!("GPU{i} ")), "missing GPU{i} in:\n{graph}");
        }
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Random occupy/free sequences keep every internal mask equal
            /// to the OR of its children and leaf bits tied to full cores.
            #[test]
            fn masks_stay_consistent(ops in proptest::collection::vec(
                (0usize..6, 1u32..=250, 0u64..=(1u64 << 30), proptest::bool::ANY),
                1..40,
            )) {
                let (driver, mut tree) = six_gpu_tree();
                for (leaf_idx, cores, memory, occupy) in ops {
                    let leaf = tree.leaves()[leaf_idx];
                    if occupy {
                        tree.mark_occupied(leaf, cores, memory);
                    } else {
                        tree.mark_free(&driver, leaf, cores, memory);
                    }
                    prop_assert!(mask_invariants_hold(&tree));
                }
            }

            /// Freeing exactly what was occupied restores the initial
            /// counters and masks.
            #[test]
            fn occupy_free_round_trip(
                picks in proptest::collection::vec((0usize..6, 1u32..=100, 0u64..=(1u64 << 28)), 1..6)
            ) {
                let (driver, mut tree) = six_gpu_tree();
                let initial: Vec<(u32, u64, u64)> = tree
                    .leaves()
                    .iter()
                    .map(|&id| (tree.node(id).alloc.cores, tree.node(id).alloc.memory, tree.node(id).mask))
                    .collect();

                // one allocation per distinct leaf, then roll all back
                let mut seen = std::collections::HashSet::new();
                let mut done = Vec::new();
                for (leaf_idx, cores, memory) in picks {
                    if !seen.insert(leaf_idx) {
                        continue;
                    }
                    let leaf = tree.leaves()[leaf_idx];
                    tree.mark_occupied(leaf, cores, memory);
                    done.push((leaf, cores, memory));
                }
                for (leaf, cores, memory) in done {
                    tree.mark_free(&driver, leaf, cores, memory);
                }

                let back: Vec<(u32, u64, u64)> = tree
                    .leaves()
                    .iter()
                    .map(|&id| (tree.node(id).alloc.cores, tree.node(id).alloc.memory, tree.node(id).mask))
                    .collect();
                prop_assert_eq!(initial, back);
            }
        }
    }
}
