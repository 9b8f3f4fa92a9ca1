// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The interface a platform has to implement, and the platform selected for this build.

macro_rules! select_platform {
    // A platform selected with `--cfg platform="..."`.
    (platform = $condition:literal, $mod:ident::$plat_impl:ident) => {
        #[cfg(all(platform = $condition, not(test)))]
        mod $mod;

        #[cfg(all(platform = $condition, not(test)))]
        pub use $mod::$plat_impl as PlatformImpl;
    };
    // The platform used when no `platform` cfg is given, so that the crate builds without one.
    (default, $mod:ident::$plat_impl:ident) => {
        #[cfg(all(not(platform = "fvp"), not(test)))]
        mod $mod;

        #[cfg(all(not(platform = "fvp"), not(test)))]
        pub use $mod::$plat_impl as PlatformImpl;
    };
    // Unit tests always run on the test platform.
    (test, $mod:ident::$plat_impl:ident) => {
        #[cfg(test)]
        mod $mod;

        #[cfg(test)]
        pub use $mod::$plat_impl as PlatformImpl;
    };
}

select_platform!(platform = "fvp", fvp::Fvp);
select_platform!(default, fvp::Fvp);
select_platform!(test, test::TestPlatform);

use crate::{logger::LogSink, psci::PsciPlatformInterface};
use arm_sysregs::MpidrEl1;

/// Type alias for convenience, to avoid having to use the complicated type name everywhere.
pub type LogSinkImpl = <PlatformImpl as Platform>::LogSinkImpl;

/// The PSCI platform implementation of the selected platform.
pub type PsciPlatformImpl = <PlatformImpl as Platform>::PsciPlatformImpl;

/// The platform-specific power state type of the selected platform.
pub type PlatformPowerState = <PsciPlatformImpl as PsciPlatformInterface>::PlatformPowerState;

/// The hooks implemented by all platforms.
pub trait Platform {
    /// The number of CPU cores.
    const CORE_COUNT: usize;

    /// The size in bytes of the largest cache line across all the cache levels in the platform.
    const CACHE_WRITEBACK_GRANULE: usize;

    /// Platform dependent LogSink implementation type for Logger.
    type LogSinkImpl: LogSink;

    /// Platform dependent PsciPlatformInterface implementation type.
    type PsciPlatformImpl: PsciPlatformInterface;

    /// Initialises the platform console and the logger.
    ///
    /// This is called once, before power-domain setup. Any logs sent before this is called will
    /// be ignored.
    fn init_logging();

    /// Returns whether the given MPIDR is valid for this platform.
    fn mpidr_is_valid(mpidr: MpidrEl1) -> bool;

    /// Given a valid MPIDR value, returns the corresponding linear core index.
    ///
    /// The implementation must never return the same index for two different valid MPIDR values,
    /// and must never return a value greater than or equal to `CORE_COUNT`. For an invalid MPIDR
    /// value no guarantees are made about the return value.
    fn core_position(mpidr: MpidrEl1) -> usize;

    /// Returns an option with a PSCI platform implementation handle. The function should only be
    /// called once, when it returns `Some`. All subsequent calls must return `None`.
    fn psci_platform() -> Option<Self::PsciPlatformImpl>;
}
