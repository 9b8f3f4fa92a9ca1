// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Build script for el3-psci.

/// Platforms with an implementation under `src/platform/`, selectable with
/// `--cfg platform="..."`. Builds without the cfg fall back to the FVP; unit
/// tests always use the built-in test platform.
const PLATFORMS: &[&str] = &["fvp"];

fn main() {
    println!(
        "cargo::rustc-check-cfg=cfg(platform, values(\"{}\"))",
        PLATFORMS.join("\", \""),
    );
}
