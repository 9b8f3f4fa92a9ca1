// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Collection of structures for describing the power domain tree.
//!
//! The tree is stored as two index-addressed arenas, one for non-CPU power domains and one for
//! CPU power domains, linked upwards through parent indices. It is built in two phases on the
//! boot CPU: [`PowerDomainTree::new`] unflattens the platform's topology descriptor, then
//! [`PowerDomainTree::derive_cpu_ranges`] computes the CPU index range every non-CPU domain
//! subsumes. Both phases take the tree exclusively and never lock a node; the lock-guarded
//! accessors exist for the runtime paths which run concurrently on multiple CPUs.

use super::PsciPlatformInterface;
use crate::{
    aarch64::flush_dcache_object,
    platform::{Platform, PlatformImpl, PsciPlatformImpl},
};
use arm_sysregs::MpidrEl1;
use arrayvec::ArrayVec;
use core::{
    fmt::{self, Debug, Formatter},
    ops::Range,
    slice::{Iter, IterMut},
    sync::atomic::{Ordering, fence},
};
use spin::mutex::{SpinMutex, SpinMutexGuard};

// A topology with no level above the CPUs cannot form a tree.
const _: () = assert!(PsciPlatformImpl::MAX_POWER_LEVEL > PowerDomainTree::CPU_POWER_LEVEL);

/// Represents a non-CPU power domain node in the power domain tree.
#[derive(Debug)]
pub struct NonCpuPowerNode {
    /// Power level of the node, always above the CPU level
    level: usize,
    /// Parent node index or None if it is a top level node
    parent: Option<usize>,
    /// Range of descendant CPU indices
    cpu_range: Range<usize>,
    /// Count of descendant CPUs which are currently powered on
    powered_cpus: usize,
}

impl NonCpuPowerNode {
    fn new(level: usize, parent: Option<usize>) -> Self {
        Self {
            level,
            parent,
            cpu_range: 0..0,
            powered_cpus: 0,
        }
    }

    /// Power level of the node.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Parent node index, or `None` if the node is a top level domain.
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// The contiguous range of CPU indices this domain subsumes.
    pub fn cpu_range(&self) -> Range<usize> {
        self.cpu_range.clone()
    }

    /// Start a new descendant CPU range at `cpu_index`, discarding any previous range.
    fn begin_cpu_range(&mut self, cpu_index: usize) {
        self.cpu_range = cpu_index..cpu_index + 1;
    }

    /// Extend the descendant CPU range by one. Siblings are created in index order, so the new
    /// CPU directly follows the current range end.
    fn extend_cpu_range(&mut self, cpu_index: usize) {
        debug_assert_eq!(self.cpu_range.end, cpu_index);
        self.cpu_range.end += 1;
    }

    /// Count of descendant CPUs which are currently powered on.
    pub fn powered_cpus(&self) -> usize {
        self.powered_cpus
    }

    /// Record that one more descendant CPU is powered on.
    pub fn increment_powered_cpus(&mut self) {
        self.powered_cpus += 1;
        debug_assert!(self.powered_cpus <= self.cpu_range.len());
    }

    /// Record that one descendant CPU is no longer powered on.
    pub fn decrement_powered_cpus(&mut self) {
        self.powered_cpus -= 1;
    }
}

/// Represents a CPU power domain node in the power domain tree.
#[derive(Debug)]
pub struct CpuPowerNode {
    /// Parent non-CPU power node index
    parent: usize,
    /// Hardware id of the CPU, bound when the owning CPU first runs
    mpidr: Option<MpidrEl1>,
}

impl CpuPowerNode {
    fn new(parent: usize) -> Self {
        Self {
            parent,
            mpidr: None,
        }
    }

    /// Parent non-CPU power node index.
    pub fn parent(&self) -> usize {
        self.parent
    }

    /// Hardware id of the CPU, or `None` if the owning CPU has not run yet.
    pub fn mpidr(&self) -> Option<MpidrEl1> {
        self.mpidr
    }

    /// Bind the hardware id of the CPU. A node is bound at most once.
    pub fn bind_mpidr(&mut self, mpidr: MpidrEl1) {
        assert_eq!(self.mpidr, None);
        self.mpidr = Some(mpidr);
    }
}

/// Object for locking multiple non-CPU power nodes. In order to avoid deadlocks and race
/// conditions the non-CPU power nodes are always locked from the lower level to higher.
#[derive(Debug)]
pub struct AncestorPowerDomains<'a> {
    list: ArrayVec<SpinMutexGuard<'a, NonCpuPowerNode>, { PsciPlatformImpl::MAX_POWER_LEVEL }>,
}

impl<'a> AncestorPowerDomains<'a> {
    /// Lock the selected node and every ancestor above it.
    fn new(index: usize, mutexes: &'a [SpinMutex<NonCpuPowerNode>]) -> Self {
        let mut list = ArrayVec::new();
        let mut parent = Some(index);

        while let Some(index) = parent {
            let locked = mutexes[index].lock();
            parent = locked.parent;
            list.push(locked);
        }

        Self { list }
    }

    /// Create immutable iterator starting from the lowest level.
    pub fn iter(&self) -> Iter<'_, SpinMutexGuard<'a, NonCpuPowerNode>> {
        self.list.iter()
    }

    /// Create mutable iterator starting from the lowest level.
    pub fn iter_mut(&mut self) -> IterMut<'_, SpinMutexGuard<'a, NonCpuPowerNode>> {
        self.list.iter_mut()
    }
}

impl Drop for AncestorPowerDomains<'_> {
    fn drop(&mut self) {
        // Unlock from the highest level down.
        while let Some(guard) = self.list.pop() {
            drop(guard);
        }
    }
}

/// The PowerDomainTree is responsible for storing the non-CPU and CPU power nodes and providing
/// safe ways to access them.
pub struct PowerDomainTree {
    /// Highest power level present in this tree
    max_level: usize,
    non_cpu_power_nodes: ArrayVec<SpinMutex<NonCpuPowerNode>, { Self::NON_CPU_DOMAIN_COUNT }>,
    cpu_power_nodes: ArrayVec<SpinMutex<CpuPowerNode>, { Self::CPU_DOMAIN_COUNT }>,
}

impl PowerDomainTree {
    /// The power level of the CPU nodes. Non-CPU nodes sit on the levels above.
    pub const CPU_POWER_LEVEL: usize = 0;

    const CPU_DOMAIN_COUNT: usize = PlatformImpl::CORE_COUNT;
    const NON_CPU_DOMAIN_COUNT: usize =
        PsciPlatformImpl::POWER_DOMAIN_COUNT - Self::CPU_DOMAIN_COUNT;

    /// Create the power domain tree from the BFS format topology descriptor.
    ///
    /// The first descriptor entry is the count of top level domains; every further entry is the
    /// child count of one already described node, in creation order. Levels are processed from
    /// `max_level` down to the CPU level, so entry `n` describes the children of non-CPU node
    /// `n - 1` and nodes at a given level are stored contiguously in creation order.
    ///
    /// Panics if the descriptor needs more nodes than the platform declares, names a child count
    /// for a node that was never created, or puts CPUs directly below the virtual node that owns
    /// the first entry.
    pub fn new(topology: &[u8], max_level: usize) -> Self {
        assert!(max_level <= PsciPlatformImpl::MAX_POWER_LEVEL);

        let mut non_cpu_power_nodes: ArrayVec<
            SpinMutex<NonCpuPowerNode>,
            { Self::NON_CPU_DOMAIN_COUNT },
        > = ArrayVec::new();
        let mut cpu_power_nodes = ArrayVec::new();

        // One virtual node above the top level domains owns the first descriptor entry, so the
        // descriptor cursor runs one entry ahead of the non-CPU node it refers to.
        let mut node_count: usize = 1;
        let mut parent_node_index: usize = 0;

        for level in (Self::CPU_POWER_LEVEL..=max_level).rev() {
            let mut next_level_node_count = 0;

            for _ in 0..node_count {
                assert!(
                    parent_node_index <= Self::NON_CPU_DOMAIN_COUNT,
                    "topology descriptor needs more domains than the platform declares"
                );
                let child_count = usize::from(topology[parent_node_index]);
                let parent = parent_node_index.checked_sub(1);

                for _ in 0..child_count {
                    if level > Self::CPU_POWER_LEVEL {
                        non_cpu_power_nodes
                            .push(SpinMutex::new(NonCpuPowerNode::new(level, parent)));
                    } else {
                        cpu_power_nodes.push(SpinMutex::new(CpuPowerNode::new(
                            parent.expect("CPU node created directly below the virtual node"),
                        )));
                    }
                }

                next_level_node_count += child_count;
                parent_node_index += 1;
            }

            node_count = next_level_node_count;
        }

        PowerDomainTree {
            max_level,
            non_cpu_power_nodes,
            cpu_power_nodes,
        }
    }

    /// Highest power level present in this tree.
    pub fn max_level(&self) -> usize {
        self.max_level
    }

    /// Count of non-CPU power nodes in the tree.
    pub fn non_cpu_node_count(&self) -> usize {
        self.non_cpu_power_nodes.len()
    }

    /// Count of CPU power nodes in the tree.
    pub fn cpu_node_count(&self) -> usize {
        self.cpu_power_nodes.len()
    }

    /// Compute the CPU index range subsumed by every non-CPU node.
    ///
    /// CPUs are visited in index order and their ancestor chains are walked level by level. An
    /// ancestor seen for the first time starts its range at the current CPU, an already current
    /// ancestor is extended by one. Rerunning the derivation resets every range and produces the
    /// same result.
    pub fn derive_cpu_ranges(&mut self) {
        let mut current_ancestors = [None; PsciPlatformImpl::MAX_POWER_LEVEL];

        for cpu_index in 0..self.cpu_power_nodes.len() {
            let ancestors = self.ancestor_indices(cpu_index, self.max_level);

            for (slot, &node_index) in ancestors.iter().enumerate() {
                let node = self.non_cpu_power_nodes[node_index].get_mut();
                if current_ancestors[slot] == Some(node_index) {
                    node.extend_cpu_range(cpu_index);
                } else {
                    current_ancestors[slot] = Some(node_index);
                    node.begin_cpu_range(cpu_index);
                }
            }
        }
    }

    /// Returns the ancestor node indices of a CPU ordered from power level 1 up to `max_level`,
    /// inclusive.
    ///
    /// Takes the tree exclusively so the chain can be read without locking; runtime paths lock
    /// the same chain through [`Self::with_ancestors_locked`] instead.
    pub fn ancestor_indices(
        &mut self,
        cpu_index: usize,
        max_level: usize,
    ) -> ArrayVec<usize, { PsciPlatformImpl::MAX_POWER_LEVEL }> {
        let mut chain = ArrayVec::new();
        let mut parent = Some(self.cpu_power_nodes[cpu_index].get_mut().parent);

        while let Some(index) = parent {
            if chain.len() == max_level {
                break;
            }
            chain.push(index);
            parent = self.non_cpu_power_nodes[index].get_mut().parent;
        }

        assert_eq!(
            chain.len(),
            max_level,
            "CPU {cpu_index} has no ancestor on every level up to {max_level}"
        );
        chain
    }

    /// Exclusive access to a CPU node without taking its lock. Only usable while the tree itself
    /// is held exclusively, which is the case during setup on the boot CPU.
    pub fn cpu_node_mut(&mut self, cpu_index: usize) -> &mut CpuPowerNode {
        self.cpu_power_nodes[cpu_index].get_mut()
    }

    /// Exclusive access to a non-CPU node without taking its lock.
    pub fn non_cpu_node_mut(&mut self, index: usize) -> &mut NonCpuPowerNode {
        self.non_cpu_power_nodes[index].get_mut()
    }

    /// Return a lock-guarded CPU node by its index.
    pub fn locked_cpu_node(&self, cpu_index: usize) -> SpinMutexGuard<'_, CpuPowerNode> {
        self.cpu_power_nodes[cpu_index].lock()
    }

    /// Return a lock-guarded non-CPU node by its index.
    pub fn locked_non_cpu_node(&self, index: usize) -> SpinMutexGuard<'_, NonCpuPowerNode> {
        self.non_cpu_power_nodes[index].lock()
    }

    /// Locks all ancestor nodes of a CPU, runs the closure and unlocks the nodes. This function
    /// ensures that power coordination is only possible with the proper locks acquired and it
    /// avoids deadlocks by always locking the nodes from the lowest level to the highest.
    pub fn with_ancestors_locked<F, T>(&self, cpu: &mut CpuPowerNode, f: F) -> T
    where
        F: FnOnce(&mut CpuPowerNode, AncestorPowerDomains<'_>) -> T,
    {
        let lock_list = AncestorPowerDomains::new(cpu.parent, &self.non_cpu_power_nodes);
        f(cpu, lock_list)
    }

    /// Write the node arenas back to memory.
    ///
    /// Has to run after the tree has reached its final memory location and before any secondary
    /// CPU is released, so CPUs which read the arenas before joining the coherency domain see
    /// valid nodes. With the `coherent_mem` feature the platform keeps the non-CPU nodes in
    /// hardware-coherent memory and their flush is dropped; the CPU nodes are also read by wake
    /// paths running with caches disabled, so their flush stays.
    pub fn publish(&self) {
        // Order the node writes before the maintenance operations.
        fence(Ordering::Release);

        #[cfg(not(feature = "coherent_mem"))]
        flush_dcache_object(&self.non_cpu_power_nodes);
        flush_dcache_object(&self.cpu_power_nodes);
    }
}

impl Debug for PowerDomainTree {
    /// Outputs the tree in Graphviz DOT format.
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(f, "digraph {{")?;
        for (index, ncpu) in self.non_cpu_power_nodes.iter().enumerate() {
            if let Some(nc) = ncpu.try_lock() {
                writeln!(f, "NC{index} [label=\"{nc:#?}\"]")?;
                if let Some(parent) = nc.parent {
                    writeln!(f, "NC{parent} -> NC{index}")?;
                }
            } else {
                writeln!(f, "NC{index} [label=\"NonCpuPowerNode is locked\"]")?;
            }
        }

        for (index, cpu) in self.cpu_power_nodes.iter().enumerate() {
            if let Some(c) = cpu.try_lock() {
                writeln!(f, "C{index} [label=\"{c:#?}\"]")?;
                writeln!(f, "NC{} -> C{}", c.parent, index)?;
            } else {
                writeln!(f, "C{index} [label=\"CpuPowerNode is locked\"]")?;
            }
        }

        writeln!(f, "}}")?;

        Ok(())
    }
}
