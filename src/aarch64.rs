// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Barrier and cache-maintenance helpers.
//!
//! On targets other than aarch64 (host unit tests) the cache operations compile to nothing;
//! the host is cache coherent and nothing here is observed across cores.

#[cfg(target_arch = "aarch64")]
use crate::platform::{Platform, PlatformImpl};
#[cfg(target_arch = "aarch64")]
use core::arch::asm;

/// Issues a data synchronization barrier (`dsb`) instruction that applies to the full system
/// domain (`sy`).
pub fn dsb_sy() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: `dsb` does not violate safe Rust guarantees.
    unsafe {
        asm!("dsb sy", options(nostack));
    }
}

/// Cleans and invalidates the data cache lines covering `size` bytes from `start`, then issues a
/// `dsb` so the maintenance completes before anything that program-order follows it.
pub fn flush_dcache_range(start: usize, size: usize) {
    #[cfg(target_arch = "aarch64")]
    {
        let line_size = PlatformImpl::CACHE_WRITEBACK_GRANULE;
        let end = start + size;
        let mut address = start & !(line_size - 1);
        while address < end {
            // SAFETY: `dc civac` does not violate safe Rust guarantees.
            unsafe {
                asm!("dc civac, {address}", address = in(reg) address, options(nostack));
            }
            address += line_size;
        }
        dsb_sy();
    }
    #[cfg(not(target_arch = "aarch64"))]
    let _ = (start, size);
}

/// Cleans and invalidates the data cache lines holding `object`.
pub fn flush_dcache_object<T>(object: &T) {
    flush_dcache_range(core::ptr::from_ref(object) as usize, size_of::<T>());
}
