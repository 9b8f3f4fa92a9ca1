// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! PSCI power-domain topology construction and state initialization for EL3 firmware.
//!
//! This crate builds the power-domain tree that a PSCI implementation coordinates power
//! transitions over: it unflattens the platform's breadth-first topology descriptor into
//! parent-linked node arenas, derives the CPU range every domain subsumes, initializes per-CPU
//! power state and the non-secure context bindings, and computes the capability set from the
//! power-management hooks the platform implements.
//!
//! [`psci::Psci::new`] is the single entry point. It must run exactly once, on the boot CPU.
//! Once the value is in its final memory location, [`psci::Psci::publish`] writes the state back
//! to memory for CPUs that come up with caches disabled; only then may secondary CPUs be
//! released from reset. Runtime PSCI call dispatch is out of scope; the constructed
//! [`psci::Psci`] exposes the node arenas and capability set that such a dispatcher consumes.

#![cfg_attr(not(test), no_std)]

pub mod aarch64;
pub mod context;
pub mod debug;
pub mod logger;
pub mod platform;
pub mod psci;
