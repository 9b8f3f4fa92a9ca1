// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Execution context blocks for lower exception levels and their per-CPU registry.
//!
//! Each CPU owns one statically allocated [`CpuContext`] per security world. The PSCI setup path
//! binds the non-secure block of every CPU here; the (out-of-scope) world-switch code looks the
//! blocks up by CPU index when entering a lower EL.

use crate::platform::{Platform, PlatformImpl};
use arm_sysregs::{ScrEl3, SpsrEl3, read_mpidr_el1};
use core::ptr;
use percore::Cores;
use spin::{Once, mutex::SpinMutex};

/// The number of security worlds a CPU keeps a context for.
const WORLD_COUNT: usize = 2;

/// A security state that code at a lower exception level runs in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum World {
    /// The secure world.
    Secure = 0,
    /// The non-secure world.
    NonSecure = 1,
}

impl World {
    fn index(self) -> usize {
        self as usize
    }
}

/// Implementation of the `Cores` trait to get the index of the current CPU core.
pub struct CoresImpl;

// SAFETY: This implementation never returns the same index for different cores because
// `core_position` is guaranteed not to.
unsafe impl Cores for CoresImpl {
    fn core_index() -> usize {
        PlatformImpl::core_position(read_mpidr_el1())
    }
}

/// The state of a core at the next lower EL in a given security state.
#[derive(Clone, Debug)]
#[repr(C)]
pub struct CpuContext {
    /// General purpose register values of the lower EL.
    pub gpregs: GpRegs,
    /// EL3 register state restored before returning to the lower EL.
    pub el3_state: El3State,
}

impl CpuContext {
    /// A context with every register zeroed.
    pub const EMPTY: Self = Self {
        gpregs: GpRegs::EMPTY,
        el3_state: El3State::EMPTY,
    };
}

/// AArch64 general purpose register context structure.
#[derive(Clone, Debug)]
#[repr(C, align(16))]
pub struct GpRegs {
    /// x0-x30 plus the stack pointer of the lower EL.
    pub registers: [u64; Self::COUNT],
}

impl GpRegs {
    /// The number of (64-bit) registers included in `GpRegs`.
    const COUNT: usize = 32;

    const EMPTY: Self = Self {
        registers: [0; Self::COUNT],
    };
}

/// EL3 registers that define where and how a lower EL resumes.
#[derive(Clone, Debug)]
#[repr(C, align(16))]
pub struct El3State {
    /// Secure configuration for the world the context belongs to.
    pub scr_el3: ScrEl3,
    /// Saved program status to restore on exception return.
    pub spsr_el3: SpsrEl3,
    /// Address the lower EL resumes at.
    pub elr_el3: usize,
}

impl El3State {
    const EMPTY: Self = Self {
        scr_el3: ScrEl3::empty(),
        spsr_el3: SpsrEl3::empty(),
        elr_el3: 0,
    };
}

/// The (CPU index, world) → context block registry. Slots are set once during setup and stay
/// bound for the lifetime of the firmware.
static CPU_CONTEXTS: [[Once<&'static SpinMutex<CpuContext>>; WORLD_COUNT];
    PlatformImpl::CORE_COUNT] =
    [const { [Once::new(), Once::new()] }; PlatformImpl::CORE_COUNT];

/// Binds the context block used when CPU `cpu_index` runs in `world`.
///
/// A slot is write-once: binding the same block again is a no-op, binding a different block to an
/// already-bound slot is a configuration fault and panics.
pub fn set_context_by_index(
    cpu_index: usize,
    world: World,
    context: &'static SpinMutex<CpuContext>,
) {
    let stored = CPU_CONTEXTS[cpu_index][world.index()].call_once(|| context);
    assert!(
        ptr::eq(*stored, context),
        "CPU {cpu_index} already has a {world:?} context bound"
    );
}

/// Returns the context block bound for CPU `cpu_index` in `world`, if one has been bound.
pub fn context_by_index(
    cpu_index: usize,
    world: World,
) -> Option<&'static SpinMutex<CpuContext>> {
    CPU_CONTEXTS[cpu_index][world.index()].get().copied()
}
