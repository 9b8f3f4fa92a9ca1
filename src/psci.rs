// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! PSCI power domain setup.
//!
//! [`Psci::new`] runs once on the boot CPU. It unflattens the platform topology into the power
//! domain tree, marks the boot CPU and its ancestor domains as running, binds the non-secure
//! context blocks and collects the callable PSCI functions from the hooks the platform provides.

pub mod power_domain_tree;

use crate::{
    aarch64::flush_dcache_object,
    context::{self, CoresImpl, CpuContext, World},
    platform::{Platform, PlatformImpl, PsciPlatformImpl},
};
use arm_psci::{ErrorCode, Mpidr, PowerState, Version};
use arm_sysregs::{MpidrEl1, read_mpidr_el1};
use bitflags::bitflags;
use core::fmt::{self, Debug, Formatter};
use log::{debug, info};
use percore::Cores;
use power_domain_tree::PowerDomainTree;
use spin::mutex::{SpinMutex, SpinMutexGuard};

bitflags! {
    /// Optional power management hooks provided by the platform
    #[derive(Debug, Eq, PartialEq, Clone, Copy)]
    #[repr(transparent)]
    pub struct PsciPlatformHooks: u64 {
        /// `power_domain_off`
        const POWER_DOMAIN_OFF = 1 << 0;
        /// `power_domain_on`
        const POWER_DOMAIN_ON = 1 << 1;
        /// `power_domain_on_finish`
        const POWER_DOMAIN_ON_FINISH = 1 << 2;
        /// `power_domain_suspend`
        const POWER_DOMAIN_SUSPEND = 1 << 3;
        /// `power_domain_suspend_finish`
        const POWER_DOMAIN_SUSPEND_FINISH = 1 << 4;
        /// `system_off`
        const SYSTEM_OFF = 1 << 5;
        /// `system_reset`
        const SYSTEM_RESET = 1 << 6;
    }
}

bitflags! {
    /// PSCI functions that can be called on this platform
    #[derive(Debug, Eq, PartialEq, Clone, Copy)]
    #[repr(transparent)]
    pub struct PsciCapabilities: u32 {
        /// `PSCI_VERSION`
        const VERSION = 1 << 0;
        /// `AFFINITY_INFO`
        const AFFINITY_INFO = 1 << 1;
        /// `PSCI_FEATURES`
        const FEATURES = 1 << 2;
        /// `CPU_OFF`
        const CPU_OFF = 1 << 3;
        /// `CPU_ON`
        const CPU_ON = 1 << 4;
        /// `CPU_SUSPEND`
        const CPU_SUSPEND = 1 << 5;
        /// `SYSTEM_OFF`
        const SYSTEM_OFF = 1 << 6;
        /// `SYSTEM_RESET`
        const SYSTEM_RESET = 1 << 7;
    }
}

impl PsciCapabilities {
    /// Functions which work on every platform without hook support.
    pub const GENERIC: Self = Self::VERSION
        .union(Self::AFFINITY_INFO)
        .union(Self::FEATURES);

    /// Collects the callable functions based on the hooks the platform provides. A function
    /// with separate start and finish hooks is only callable when the platform has both.
    pub fn from_hooks(hooks: PsciPlatformHooks) -> Self {
        let mut capabilities = Self::GENERIC;

        if hooks.contains(PsciPlatformHooks::POWER_DOMAIN_OFF) {
            capabilities |= Self::CPU_OFF;
        }

        if hooks.contains(
            PsciPlatformHooks::POWER_DOMAIN_ON | PsciPlatformHooks::POWER_DOMAIN_ON_FINISH,
        ) {
            capabilities |= Self::CPU_ON;
        }

        if hooks.contains(
            PsciPlatformHooks::POWER_DOMAIN_SUSPEND | PsciPlatformHooks::POWER_DOMAIN_SUSPEND_FINISH,
        ) {
            capabilities |= Self::CPU_SUSPEND;
        }

        if hooks.contains(PsciPlatformHooks::SYSTEM_OFF) {
            capabilities |= Self::SYSTEM_OFF;
        }

        if hooks.contains(PsciPlatformHooks::SYSTEM_RESET) {
            capabilities |= Self::SYSTEM_RESET;
        }

        capabilities
    }
}

/// Platform-specific power state interface
///
/// The platform has to provide a platform-specific power state type which implements this trait
/// and all of the dependent traits.
pub trait PlatformPowerStateInterface: Debug + Clone + Copy + Eq {
    /// The deepest local state, the domain is fully powered down.
    const OFF: Self;
    /// The local state of a running domain.
    const RUN: Self;
}

/// PSCI platform interface
///
/// The interface contains mandatory and optional constants and functions. Whether the platform
/// implements the optional hooks has to be in sync with the hooks reported in the `HOOKS`
/// constant.
pub trait PsciPlatformInterface {
    /// Count of all power domains, CPU domains included
    const POWER_DOMAIN_COUNT: usize;
    /// Maximal power level in the system
    const MAX_POWER_LEVEL: usize;

    /// Flags for describing the optional hooks implemented by the platform.
    const HOOKS: PsciPlatformHooks;

    /// Platform-specific power state type
    type PlatformPowerState: PlatformPowerStateInterface;

    /// Returns the power domain topology as the count of child nodes in a BFS traversal order.
    fn topology() -> &'static [u8];

    /// Performs platform-specific actions to turn this CPU off, e.g. program the power
    /// controller, optional.
    fn power_domain_off(&self, _target_state: Self::PlatformPowerState) {
        unimplemented!("POWER_DOMAIN_OFF is not implemented for the platform")
    }

    /// Turns on the power domain of the CPU identified by its MPIDR, optional.
    fn power_domain_on(&self, _mpidr: Mpidr) -> Result<(), ErrorCode> {
        unimplemented!("POWER_DOMAIN_ON is not implemented for the platform")
    }

    /// Performs platform-specific actions after the CPU has been turned on, optional.
    fn power_domain_on_finish(&self, _previous_state: Self::PlatformPowerState) {
        unimplemented!("POWER_DOMAIN_ON_FINISH is not implemented for the platform")
    }

    /// Performs the necessary actions to suspend this CPU, e.g. program the power controller,
    /// optional.
    fn power_domain_suspend(&self, _target_state: Self::PlatformPowerState) {
        unimplemented!("POWER_DOMAIN_SUSPEND is not implemented for the platform")
    }

    /// Performs platform-specific operations after a wake-up from a suspended state, optional.
    fn power_domain_suspend_finish(&self, _previous_state: Self::PlatformPowerState) {
        unimplemented!("POWER_DOMAIN_SUSPEND_FINISH is not implemented for the platform")
    }

    /// Shuts down the system, optional.
    fn system_off(&self) -> ! {
        unimplemented!("SYSTEM_OFF is not implemented for the platform")
    }

    /// Resets the system, the behavior is equivalent to a hardware power-cycle sequence,
    /// optional.
    fn system_reset(&self) -> ! {
        unimplemented!("SYSTEM_RESET is not implemented for the platform")
    }
}

/// PSCI view of a CPU's power state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PsciState {
    /// The CPU is off or was never started.
    Off,
    /// The CPU is running.
    On,
    /// The CPU entered a suspend state and has not finished waking up yet.
    Suspend,
}

/// PSCI bookkeeping of a single CPU.
#[derive(Debug)]
pub struct PsciCpuData {
    psci_state: PsciState,
    suspend_power_state: Option<PowerState>,
}

impl PsciCpuData {
    /// State of a CPU which has not been started yet.
    pub const OFF: Self = Self {
        psci_state: PsciState::Off,
        suspend_power_state: None,
    };

    /// PSCI state of the CPU.
    pub fn psci_state(&self) -> PsciState {
        self.psci_state
    }

    /// Sets the PSCI state of the CPU.
    pub fn set_psci_state(&mut self, psci_state: PsciState) {
        self.psci_state = psci_state;
    }

    /// The power state requested by a suspend call in progress.
    pub fn suspend_power_state(&self) -> Option<PowerState> {
        self.suspend_power_state
    }

    /// Records the power state of a suspend call in progress.
    pub fn set_suspend_power_state(&mut self, power_state: PowerState) {
        self.suspend_power_state = Some(power_state);
    }

    /// Clears the suspend power state after the wake-up is complete.
    pub fn invalidate_suspend_power_state(&mut self) {
        self.suspend_power_state = None;
    }
}

const MPIDR_AFFINITY_MASK: u64 = (MpidrEl1::AFF0_MASK << MpidrEl1::AFF0_SHIFT)
    | (MpidrEl1::AFF1_MASK << MpidrEl1::AFF1_SHIFT)
    | (MpidrEl1::AFF2_MASK << MpidrEl1::AFF2_SHIFT)
    | (MpidrEl1::AFF3_MASK << MpidrEl1::AFF3_SHIFT);

/// Non-secure context blocks, one per CPU, bound into the context registry during setup.
static PSCI_NS_CONTEXTS: [SpinMutex<CpuContext>; PlatformImpl::CORE_COUNT] =
    [const { SpinMutex::new(CpuContext::EMPTY) }; PlatformImpl::CORE_COUNT];

/// Main PSCI structure which stores the power state representation of each power domain and the
/// set of callable PSCI functions.
pub struct Psci {
    platform: PsciPlatformImpl,
    power_domain_tree: PowerDomainTree,
    cpu_data: [SpinMutex<PsciCpuData>; PlatformImpl::CORE_COUNT],
    capabilities: PsciCapabilities,
}

impl Psci {
    /// Implemented PSCI version.
    pub const VERSION: Version = Version { major: 1, minor: 1 };

    /// Initialises the PSCI state.
    ///
    /// This should be called exactly once, on the boot CPU, before any other PSCI methods are
    /// called. Once the returned value has reached its final memory location, [`Self::publish`]
    /// has to run before any secondary CPU is started.
    pub fn new() -> Self {
        info!("Initializing PSCI");

        let mut power_domain_tree = Self::build_power_domain_tree(PsciPlatformImpl::topology());

        // Init primary CPU
        let cpu_index = CoresImpl::core_index();
        let mpidr = MpidrEl1::from_bits_retain(read_mpidr_el1().bits() & MPIDR_AFFINITY_MASK);
        power_domain_tree.cpu_node_mut(cpu_index).bind_mpidr(mpidr);

        let mut cpu_data = [const { SpinMutex::new(PsciCpuData::OFF) }; PlatformImpl::CORE_COUNT];
        for (index, context) in PSCI_NS_CONTEXTS.iter().enumerate() {
            context::set_context_by_index(index, World::NonSecure, context);
        }

        do_state_coordination(
            &mut power_domain_tree,
            &mut cpu_data,
            PsciPlatformImpl::MAX_POWER_LEVEL,
            cpu_index,
            PsciState::On,
        );

        let platform = PlatformImpl::psci_platform()
            .expect("the platform does not provide PSCI power management hooks");

        let capabilities = PsciCapabilities::from_hooks(PsciPlatformImpl::HOOKS);
        info!("PSCI capabilities: {capabilities:?}");

        let psci = Self {
            platform,
            power_domain_tree,
            cpu_data,
            capabilities,
        };
        debug!("Power domain tree:\n{psci:?}");

        psci
    }

    /// Unflattens the platform topology and checks it against the domain counts the platform
    /// declares.
    fn build_power_domain_tree(topology: &[u8]) -> PowerDomainTree {
        let mut power_domain_tree =
            PowerDomainTree::new(topology, PsciPlatformImpl::MAX_POWER_LEVEL);

        assert_eq!(PlatformImpl::CORE_COUNT, power_domain_tree.cpu_node_count());
        assert_eq!(
            PsciPlatformImpl::POWER_DOMAIN_COUNT - PlatformImpl::CORE_COUNT,
            power_domain_tree.non_cpu_node_count()
        );

        power_domain_tree.derive_cpu_ranges();
        power_domain_tree
    }

    /// Writes the PSCI state back to memory.
    ///
    /// Has to run after the value has reached its final memory location and before any secondary
    /// CPU is started, so CPUs which come up with caches disabled read valid state.
    pub fn publish(&self) {
        self.power_domain_tree.publish();
        flush_dcache_object(&self.cpu_data);
    }

    /// The set of callable PSCI functions on this platform.
    pub fn capabilities(&self) -> PsciCapabilities {
        self.capabilities
    }

    /// The platform power management hook implementation.
    pub fn platform(&self) -> &PsciPlatformImpl {
        &self.platform
    }

    /// The power domain tree of the platform.
    pub fn power_domain_tree(&self) -> &PowerDomainTree {
        &self.power_domain_tree
    }

    /// Returns the lock-guarded PSCI bookkeeping of a CPU.
    pub fn locked_cpu_data(&self, cpu_index: usize) -> SpinMutexGuard<'_, PsciCpuData> {
        self.cpu_data[cpu_index].lock()
    }
}

impl Debug for Psci {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.power_domain_tree.fmt(f)
    }
}

/// Sets the PSCI state of a CPU and keeps the powered CPU count of its ancestor domains up to
/// `end_level` in sync.
///
/// Runs with the tree held exclusively; the runtime paths which share the tree do the equivalent
/// update under the ancestor locks.
fn do_state_coordination(
    power_domain_tree: &mut PowerDomainTree,
    cpu_data: &mut [SpinMutex<PsciCpuData>],
    end_level: usize,
    cpu_index: usize,
    target_state: PsciState,
) {
    let data = cpu_data[cpu_index].get_mut();
    let was_powered = data.psci_state() == PsciState::On;
    data.set_psci_state(target_state);
    let is_powered = target_state == PsciState::On;

    if was_powered == is_powered {
        return;
    }

    for node_index in power_domain_tree.ancestor_indices(cpu_index, end_level) {
        let node = power_domain_tree.non_cpu_node_mut(node_index);
        if is_powered {
            node.increment_powered_cpus();
        } else {
            node.decrement_powered_cpus();
        }
    }
}

/// Returns the corresponding linear core index for the given PSCI MPIDR value.
///
/// For any valid MPIDR this will return a unique value less than `Platform::CORE_COUNT`.
/// For any invalid MPIDR it will return `None`.
pub fn try_get_cpu_index_by_mpidr(psci_mpidr: Mpidr) -> Option<usize> {
    // The PSCI MPIDR value doesn't include the MT or U bits, but they might be important for how
    // the platform validates MPIDR values and calculates core position, so add them in.
    let mpidr = MpidrEl1::from_psci_mpidr(psci_mpidr.into());
    if PlatformImpl::mpidr_is_valid(mpidr) {
        Some(PlatformImpl::core_position(mpidr))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};

    /// Runs a closure which ends in a terminal platform hook. The test platform panics with a
    /// magic payload in place of not returning, anything else propagates.
    fn expect_terminal_hook<F: Fn()>(magic: &str, f: F) {
        // AssertUnwindSafe is required, because spin::Mutex does not implement UnwindSafe.
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => panic!("The terminal hook returned"),
            Err(err) => match err.downcast_ref::<String>() {
                Some(s) if *s == magic => {}
                _ => resume_unwind(err),
            },
        }
    }

    #[test]
    fn version() {
        assert_eq!(0x0001_0001, u32::from(Psci::VERSION));
    }

    #[test]
    fn psci_setup() {
        let psci = Psci::new();

        assert_eq!(PsciCapabilities::all(), psci.capabilities());

        let tree = psci.power_domain_tree();
        assert_eq!(PsciPlatformImpl::MAX_POWER_LEVEL, tree.max_level());
        assert_eq!(PlatformImpl::CORE_COUNT, tree.cpu_node_count());
        assert_eq!(
            PsciPlatformImpl::POWER_DOMAIN_COUNT - PlatformImpl::CORE_COUNT,
            tree.non_cpu_node_count()
        );

        psci.publish();
    }

    #[test]
    fn setup_initializes_boot_cpu_only() {
        let psci = Psci::new();
        let tree = psci.power_domain_tree();

        // The tests run as CPU 0.
        assert_eq!(
            Some(PlatformImpl::MPIDR_VALUES[0]),
            tree.locked_cpu_node(0).mpidr()
        );
        assert_eq!(PsciState::On, psci.locked_cpu_data(0).psci_state());

        for cpu_index in 1..PlatformImpl::CORE_COUNT {
            assert_eq!(None, tree.locked_cpu_node(cpu_index).mpidr());

            let cpu_data = psci.locked_cpu_data(cpu_index);
            assert_eq!(PsciState::Off, cpu_data.psci_state());
            assert!(cpu_data.suspend_power_state().is_none());
        }
    }

    #[test]
    fn setup_powers_boot_cpu_ancestors() {
        let psci = Psci::new();
        let tree = psci.power_domain_tree();

        // CPU 0 sits under cluster 3, SoC 1 and the root.
        for (index, expected) in [1, 1, 0, 1, 0, 0, 0].into_iter().enumerate() {
            assert_eq!(expected, tree.locked_non_cpu_node(index).powered_cpus());
        }
    }

    #[test]
    fn setup_binds_non_secure_contexts() {
        let _psci = Psci::new();

        for cpu_index in 0..PlatformImpl::CORE_COUNT {
            let bound = context::context_by_index(cpu_index, World::NonSecure);
            assert!(
                bound.is_some_and(|context| core::ptr::eq(context, &PSCI_NS_CONTEXTS[cpu_index]))
            );
        }
    }

    #[test]
    #[should_panic]
    fn mismatched_domain_count_halts() {
        // A well formed four level descriptor which covers four CPUs instead of thirteen.
        Psci::build_power_domain_tree(&[1, 2, 1, 1, 2, 2]);
    }

    #[test]
    fn state_coordination_tracks_powered_cpus() {
        let mut tree = Psci::build_power_domain_tree(PsciPlatformImpl::topology());
        let mut cpu_data = [const { SpinMutex::new(PsciCpuData::OFF) }; PlatformImpl::CORE_COUNT];
        let max_level = PsciPlatformImpl::MAX_POWER_LEVEL;

        do_state_coordination(&mut tree, &mut cpu_data, max_level, 7, PsciState::On);
        assert_eq!(PsciState::On, cpu_data[7].get_mut().psci_state());
        for (index, expected) in [1, 0, 1, 0, 0, 1, 0].into_iter().enumerate() {
            assert_eq!(expected, tree.non_cpu_node_mut(index).powered_cpus());
        }

        // Repeating the state of a running CPU changes nothing.
        do_state_coordination(&mut tree, &mut cpu_data, max_level, 7, PsciState::On);
        assert_eq!(1, tree.non_cpu_node_mut(0).powered_cpus());

        // A second CPU below the same root only bumps the ancestors it does not share.
        do_state_coordination(&mut tree, &mut cpu_data, max_level, 0, PsciState::On);
        for (index, expected) in [2, 1, 1, 1, 0, 1, 0].into_iter().enumerate() {
            assert_eq!(expected, tree.non_cpu_node_mut(index).powered_cpus());
        }

        // A suspended CPU does not count as powered, turning it off afterwards changes nothing.
        do_state_coordination(&mut tree, &mut cpu_data, max_level, 7, PsciState::Suspend);
        assert_eq!(PsciState::Suspend, cpu_data[7].get_mut().psci_state());
        do_state_coordination(&mut tree, &mut cpu_data, max_level, 7, PsciState::Off);
        for (index, expected) in [1, 1, 0, 1, 0, 0, 0].into_iter().enumerate() {
            assert_eq!(expected, tree.non_cpu_node_mut(index).powered_cpus());
        }
    }

    #[test]
    fn capabilities_follow_platform_hooks() {
        assert_eq!(
            PsciCapabilities::GENERIC,
            PsciCapabilities::from_hooks(PsciPlatformHooks::empty())
        );
        assert_eq!(
            PsciCapabilities::all(),
            PsciCapabilities::from_hooks(PsciPlatformHooks::all())
        );

        assert_eq!(
            PsciCapabilities::GENERIC | PsciCapabilities::CPU_OFF,
            PsciCapabilities::from_hooks(PsciPlatformHooks::POWER_DOMAIN_OFF)
        );
        assert_eq!(
            PsciCapabilities::GENERIC
                | PsciCapabilities::SYSTEM_OFF
                | PsciCapabilities::SYSTEM_RESET,
            PsciCapabilities::from_hooks(
                PsciPlatformHooks::SYSTEM_OFF | PsciPlatformHooks::SYSTEM_RESET
            )
        );

        // Functions with a separate finish hook need both hooks.
        assert_eq!(
            PsciCapabilities::GENERIC,
            PsciCapabilities::from_hooks(PsciPlatformHooks::POWER_DOMAIN_ON)
        );
        assert_eq!(
            PsciCapabilities::GENERIC | PsciCapabilities::CPU_ON,
            PsciCapabilities::from_hooks(
                PsciPlatformHooks::POWER_DOMAIN_ON | PsciPlatformHooks::POWER_DOMAIN_ON_FINISH
            )
        );
        assert_eq!(
            PsciCapabilities::GENERIC,
            PsciCapabilities::from_hooks(PsciPlatformHooks::POWER_DOMAIN_SUSPEND_FINISH)
        );
    }

    #[test]
    fn cpu_index_from_mpidr() {
        let mpidr = Mpidr {
            aff0: 0,
            aff1: 0,
            aff2: 0,
            aff3: Some(0),
        };
        assert_eq!(Some(0), try_get_cpu_index_by_mpidr(mpidr));

        // Core 3 only exists in the last cluster.
        let mpidr = Mpidr {
            aff0: 3,
            aff1: 1,
            aff2: 1,
            aff3: Some(0),
        };
        assert_eq!(Some(12), try_get_cpu_index_by_mpidr(mpidr));

        let mpidr = Mpidr {
            aff0: 3,
            aff1: 0,
            aff2: 0,
            aff3: Some(0),
        };
        assert_eq!(None, try_get_cpu_index_by_mpidr(mpidr));

        let mpidr = Mpidr {
            aff0: 0,
            aff1: 0,
            aff2: 2,
            aff3: Some(0),
        };
        assert_eq!(None, try_get_cpu_index_by_mpidr(mpidr));

        let mpidr = Mpidr {
            aff0: 0,
            aff1: 0,
            aff2: 0,
            aff3: Some(1),
        };
        assert_eq!(None, try_get_cpu_index_by_mpidr(mpidr));
    }

    #[test]
    fn suspend_power_state_round_trip() {
        let mut cpu_data = PsciCpuData::OFF;
        assert!(cpu_data.suspend_power_state().is_none());

        cpu_data.set_suspend_power_state(PowerState::PowerDown(0x0200_0022));
        assert!(matches!(
            cpu_data.suspend_power_state(),
            Some(PowerState::PowerDown(0x0200_0022))
        ));

        cpu_data.invalidate_suspend_power_state();
        assert!(cpu_data.suspend_power_state().is_none());
    }

    #[test]
    fn terminal_hooks_unwind_in_tests() {
        let psci = Psci::new();

        expect_terminal_hook(PsciPlatformImpl::SYSTEM_OFF_MAGIC, || {
            psci.platform().system_off()
        });
        expect_terminal_hook(PsciPlatformImpl::SYSTEM_RESET_MAGIC, || {
            psci.platform().system_reset()
        });
    }

    struct NoHooksPlatform;

    impl PsciPlatformInterface for NoHooksPlatform {
        const POWER_DOMAIN_COUNT: usize = 3;
        const MAX_POWER_LEVEL: usize = 1;
        const HOOKS: PsciPlatformHooks = PsciPlatformHooks::empty();

        type PlatformPowerState = crate::platform::PlatformPowerState;

        fn topology() -> &'static [u8] {
            &[1, 2]
        }
    }

    #[test]
    #[should_panic(expected = "POWER_DOMAIN_ON is not implemented for the platform")]
    fn unimplemented_hook_panics() {
        let mpidr = Mpidr {
            aff0: 1,
            aff1: 0,
            aff2: 0,
            aff3: Some(0),
        };
        let _ = NoHooksPlatform.power_domain_on(mpidr);
    }
}
