// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

pub const FVP_CLUSTER_COUNT: usize = 2;
pub const FVP_MAX_CPUS_PER_CLUSTER: usize = 4;
pub const FVP_MAX_PE_PER_CPU: usize = 1;
