// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

mod config;

use self::config::{FVP_CLUSTER_COUNT, FVP_MAX_CPUS_PER_CLUSTER, FVP_MAX_PE_PER_CPU};
use super::Platform;
use crate::{
    logger::{self, LockedWriter},
    psci::{PlatformPowerStateInterface, PsciPlatformHooks, PsciPlatformInterface},
};
use arm_pl011_uart::{PL011Registers, Uart, UniqueMmioPointer};
use arm_sysregs::MpidrEl1;
use core::ptr::NonNull;

const PLATFORM_CORE_COUNT: usize =
    FVP_CLUSTER_COUNT * FVP_MAX_CPUS_PER_CLUSTER * FVP_MAX_PE_PER_CPU;

// Base address of the primary PL011 UART.
const PL011_BASE_ADDRESS: *mut PL011Registers = 0x1C09_0000 as _;

/// Fixed Virtual Platform
pub struct Fvp;

impl Platform for Fvp {
    const CORE_COUNT: usize = PLATFORM_CORE_COUNT;
    const CACHE_WRITEBACK_GRANULE: usize = 1 << 6;

    type LogSinkImpl = LockedWriter<Uart<'static>>;
    type PsciPlatformImpl = FvpPsciPlatformImpl;

    fn init_logging() {
        // SAFETY: `PL011_BASE_ADDRESS` is the base address of a PL011 device, and nothing else
        // accesses that address range.
        let uart_pointer =
            unsafe { UniqueMmioPointer::new(NonNull::new(PL011_BASE_ADDRESS).unwrap()) };
        logger::init(LockedWriter::new(Uart::new(uart_pointer)))
            .expect("Failed to initialise logger");
    }

    fn mpidr_is_valid(mpidr: MpidrEl1) -> bool {
        if mpidr.contains(MpidrEl1::MT) {
            mpidr.aff3() == 0
                && usize::from(mpidr.aff2()) < FVP_CLUSTER_COUNT
                && usize::from(mpidr.aff1()) < FVP_MAX_CPUS_PER_CLUSTER
                && usize::from(mpidr.aff0()) < FVP_MAX_PE_PER_CPU
        } else {
            mpidr.aff3() == 0
                && mpidr.aff2() == 0
                && usize::from(mpidr.aff1()) < FVP_CLUSTER_COUNT
                && usize::from(mpidr.aff0()) < FVP_MAX_CPUS_PER_CLUSTER
        }
    }

    fn core_position(mpidr: MpidrEl1) -> usize {
        assert!(Fvp::mpidr_is_valid(mpidr));

        // Without the MT bit the affinity fields sit one level lower, as if each CPU had a single
        // thread.
        let (cluster_index, cpu_index, thread_index) = if mpidr.contains(MpidrEl1::MT) {
            (
                usize::from(mpidr.aff2()),
                usize::from(mpidr.aff1()),
                usize::from(mpidr.aff0()),
            )
        } else {
            (usize::from(mpidr.aff1()), usize::from(mpidr.aff0()), 0)
        };

        (cluster_index * FVP_MAX_CPUS_PER_CLUSTER + cpu_index) * FVP_MAX_PE_PER_CPU + thread_index
    }

    fn psci_platform() -> Option<Self::PsciPlatformImpl> {
        Some(FvpPsciPlatformImpl)
    }
}

/// Local power states of the FVP.
#[derive(PartialEq, PartialOrd, Debug, Eq, Ord, Clone, Copy)]
pub enum FvpPowerState {
    /// Fully powered down.
    PowerDown,
    /// Retention state which preserves context.
    Standby,
    /// Fully running.
    On,
}

impl PlatformPowerStateInterface for FvpPowerState {
    const OFF: Self = Self::PowerDown;
    const RUN: Self = Self::On;
}

/// The PSCI platform hooks of the FVP.
///
/// The power controller driver is not implemented yet, so no optional hooks are provided and the
/// trait defaults apply.
pub struct FvpPsciPlatformImpl;

impl PsciPlatformInterface for FvpPsciPlatformImpl {
    const POWER_DOMAIN_COUNT: usize = 11;
    const MAX_POWER_LEVEL: usize = 2;

    const HOOKS: PsciPlatformHooks = PsciPlatformHooks::empty();

    type PlatformPowerState = FvpPowerState;

    fn topology() -> &'static [u8] {
        &[1, 2, 4, 4]
    }
}
