// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cadence kernel.
//!
//! This is the application-independent portion of the operating system: a
//! small preemptive real-time kernel scheduling periodic threads under
//! fixed-priority Rate-Monotonic Scheduling, with Liu-Layland admission
//! control and Immediate Priority Ceiling Protocol mutexes.
//!
//! The code outside of the `arch` module is portable; it is exercised on the
//! host through the `arch::fake` backend and deployed on ARMv7-M through
//! `arch::arm_m`.
//!
//! # Design principles
//!
//! 1. Runtime configuration through the syscall interface (`thread_init`),
//!    within fixed compile-time capacity limits. No build-time codegen.
//! 2. A strong preference for safe code where reasonable; `unsafe` is
//!    confined to the `arch` backends and the user-memory window in `umem`.
//! 3. A preference for simple and clear algorithms over fast and clever
//!    algorithms. The thread table holds at most sixteen entries; linear
//!    scans are fine.

#![cfg_attr(target_os = "none", no_std)]

// Kernel logging. The sink depends on how the kernel is built: standard
// error when hosted (tests), semihosting or ITM on the metal by feature,
// and nothing at all otherwise -- the warnings required by the mutex and
// budget protocols still typecheck, they just go nowhere.
cfg_if::cfg_if! {
    if #[cfg(not(target_os = "none"))] {
        macro_rules! klog {
            ($s:expr) => {
                ::std::eprintln!(concat!("kern: ", $s))
            };
            ($s:expr, $($tt:tt)*) => {
                ::std::eprintln!(concat!("kern: ", $s), $($tt)*)
            };
        }
    } else if #[cfg(feature = "log-semihosting")] {
        macro_rules! klog {
            ($s:expr) => {
                { let _ = cortex_m_semihosting::hprintln!(concat!("kern: ", $s)); }
            };
            ($s:expr, $($tt:tt)*) => {
                { let _ = cortex_m_semihosting::hprintln!(concat!("kern: ", $s), $($tt)*); }
            };
        }
    } else if #[cfg(feature = "log-itm")] {
        macro_rules! klog {
            ($s:expr) => {
                unsafe {
                    let stim = &mut (*cortex_m::peripheral::ITM::PTR).stim[0];
                    cortex_m::iprintln!(stim, concat!("kern: ", $s));
                }
            };
            ($s:expr, $($tt:tt)*) => {
                unsafe {
                    let stim = &mut (*cortex_m::peripheral::ITM::PTR).stim[0];
                    cortex_m::iprintln!(stim, concat!("kern: ", $s), $($tt)*);
                }
            };
        }
    } else {
        macro_rules! klog {
            ($s:expr) => {{}};
            ($s:expr, $($tt:tt)*) => {
                { let _ = format_args!($s, $($tt)*); }
            };
        }
    }
}

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

pub mod arch;

pub mod admit;
pub mod err;
pub mod fail;
pub mod mutex;
pub mod profiling;
pub mod sched;
pub mod startup;
pub mod syscalls;
pub mod thread;
pub mod time;
pub mod umem;
