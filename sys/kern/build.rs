// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;

/// Exposes the ARM-M profile of the build target as a `cfg` so the `arch`
/// module can pick the matching entry/exit sequences. Non-ARM targets get no
/// profile cfg and build the hosted `arch::fake` backend instead.
fn main() {
    println!("cargo:rustc-check-cfg=cfg(armv7m)");

    let target = env::var("TARGET").unwrap();

    if target.starts_with("thumbv7m") || target.starts_with("thumbv7em") {
        println!("cargo:rustc-cfg=armv7m");
    } else if target.starts_with("thumb") {
        panic!("unsupported ARM-M profile in target {}", target);
    }
}
