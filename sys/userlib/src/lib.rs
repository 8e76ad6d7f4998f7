// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User application support library for Cadence.
//!
//! This contains syscall stubs and types, and re-exports the contents of
//! the `abi` crate that gets shared with the kernel.
//!
//! # Syscall stub implementations
//!
//! Each syscall consists of two parts: a public `sys_foo` function intended
//! for use by programs, and an internal `sys_foo_stub` trampoline. The
//! trampolines are trivial: the AAPCS calling convention already places the
//! first four arguments in r0-r3 and the fifth on the stack, which is
//! exactly the shape of the trap frame the kernel reads back, so each stub
//! is just the `svc` carrying the operation number in its immediate field.
//!
//! On non-ARM builds the stubs are compiled as panicking shims so that
//! user-level crates can still be type-checked on the host.

#![no_std]

pub use abi::*;

/// Signature of a thread body: receives the `argp` it was created with. A
/// thread that returns is torn down by the kernel's thread terminator.
pub type ThreadFn = extern "C" fn(usize);

/// Signature of a replacement idle loop.
pub type IdleFn = extern "C" fn() -> !;

/// Moves the program break by `increment` bytes. Returns the previous
/// break, or `!0` if the heap is exhausted.
pub fn sys_sbrk(increment: i32) -> u32 {
    unsafe { stubs::sys_sbrk_stub(increment) }
}

/// Writes `data` to descriptor `fd` (1 is the console). Returns the number
/// of bytes written, or -1.
pub fn sys_write(fd: u32, data: &[u8]) -> i32 {
    unsafe { stubs::sys_write_stub(fd, data.as_ptr(), data.len()) }
}

/// Reads into `buffer` from descriptor `fd` (0 is the console). Returns
/// the number of bytes read, or -1.
pub fn sys_read(fd: u32, buffer: &mut [u8]) -> i32 {
    unsafe { stubs::sys_read_stub(fd, buffer.as_mut_ptr(), buffer.len()) }
}

/// Terminates the whole system with the given status.
pub fn sys_exit(status: u32) -> ! {
    unsafe { stubs::sys_exit_stub(status) }
}

/// Configures the thread system: slot count, per-thread stack size in
/// words, an optional replacement idle loop, and the mutex budget. Must be
/// called before any other thread operation; returns 0 or -1.
pub fn sys_thread_init(
    max_threads: u32,
    stack_words: u32,
    idle: Option<IdleFn>,
    max_mutexes: u32,
) -> i32 {
    let idle = idle.map(|f| f as usize).unwrap_or(0);
    unsafe {
        stubs::sys_thread_init_stub(max_threads, stack_words, idle, max_mutexes)
    }
}

/// Creates a periodic thread at `priority` with budget `budget_ticks` per
/// period of `period_ticks`, passing `argument` to `entry`. Subject to the
/// admission test; returns 0 or -1.
pub fn sys_thread_create(
    entry: ThreadFn,
    priority: u32,
    budget_ticks: u32,
    period_ticks: u32,
    argument: usize,
) -> i32 {
    unsafe {
        stubs::sys_thread_create_stub(
            entry as usize,
            priority,
            budget_ticks,
            period_ticks,
            argument,
        )
    }
}

/// Tears down the calling thread.
pub fn sys_thread_kill() -> ! {
    unsafe { stubs::sys_thread_kill_stub() }
}

/// Starts preemptive scheduling at `frequency` ticks per second. Call once,
/// after `sys_thread_init` and the initial creates; returns only when every
/// thread is done.
pub fn sys_scheduler_start(frequency: u32) -> i32 {
    unsafe { stubs::sys_scheduler_start_stub(frequency) }
}

/// Completes the current job; the thread sleeps until its next period
/// boundary.
pub fn sys_wait_until_next_period() {
    unsafe { stubs::sys_wait_until_next_period_stub() }
}

/// Reads the kernel tick counter.
pub fn sys_get_time() -> u32 {
    unsafe { stubs::sys_get_time_stub() }
}

/// Reads the calling thread's current (dynamic) priority.
pub fn sys_get_priority() -> u32 {
    unsafe { stubs::sys_get_priority_stub() }
}

/// Reads the number of ticks the calling thread has spent on the CPU.
pub fn sys_thread_time() -> u32 {
    unsafe { stubs::sys_thread_time_stub() }
}

/// Allocates a mutex whose ceiling is `ceiling_priority`; every thread that
/// will ever lock it must be no more important than the ceiling. Returns
/// the handle, or `MUTEX_NONE`.
pub fn sys_mutex_init(ceiling_priority: u32) -> u32 {
    unsafe { stubs::sys_mutex_init_stub(ceiling_priority) }
}

pub fn sys_mutex_lock(handle: u32) {
    unsafe { stubs::sys_mutex_lock_stub(handle) }
}

pub fn sys_mutex_unlock(handle: u32) {
    unsafe { stubs::sys_mutex_unlock_stub(handle) }
}

/// An owned handle to a kernel mutex.
#[derive(Debug)]
pub struct Mutex {
    handle: u32,
}

impl Mutex {
    /// Allocates a mutex with the given ceiling priority, or `None` if the
    /// configured mutex budget is exhausted.
    pub fn new(ceiling_priority: u32) -> Option<Self> {
        match sys_mutex_init(ceiling_priority) {
            MUTEX_NONE => None,
            handle => Some(Mutex { handle }),
        }
    }

    /// Acquires the mutex, blocking the calling thread until the
    /// acquisition is permitted by the ceiling protocol.
    pub fn lock(&self) {
        sys_mutex_lock(self.handle);
    }

    /// Releases the mutex. Unlocking a mutex the caller does not hold is a
    /// no-op (with a kernel-side warning).
    pub fn unlock(&self) {
        sys_mutex_unlock(self.handle);
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        mod stubs {
            use core::arch::global_asm;

            macro_rules! syscall_stub {
                ($name:ident, $nr:expr) => {
                    global_asm!(
                        concat!(
                            "
                            .section .text.", stringify!($name), "
                            .globl ", stringify!($name), "
                            .type ", stringify!($name), ",function
                            .thumb_func
                            ", stringify!($name), ":
                                svc #{nr}
                                bx lr
                            "
                        ),
                        nr = const $nr as u32,
                    );
                };
            }

            macro_rules! syscall_stub_noreturn {
                ($name:ident, $nr:expr) => {
                    global_asm!(
                        concat!(
                            "
                            .section .text.", stringify!($name), "
                            .globl ", stringify!($name), "
                            .type ", stringify!($name), ",function
                            .thumb_func
                            ", stringify!($name), ":
                                svc #{nr}
                            1:  b 1b
                            "
                        ),
                        nr = const $nr as u32,
                    );
                };
            }

            syscall_stub!(sys_sbrk_stub, abi::Sysnum::Sbrk);
            syscall_stub!(sys_write_stub, abi::Sysnum::Write);
            syscall_stub!(sys_read_stub, abi::Sysnum::Read);
            syscall_stub_noreturn!(sys_exit_stub, abi::Sysnum::Exit);
            syscall_stub!(sys_thread_init_stub, abi::Sysnum::ThreadInit);
            syscall_stub!(sys_thread_create_stub, abi::Sysnum::ThreadCreate);
            syscall_stub_noreturn!(sys_thread_kill_stub, abi::Sysnum::ThreadKill);
            syscall_stub!(sys_scheduler_start_stub, abi::Sysnum::SchedulerStart);
            syscall_stub!(sys_mutex_init_stub, abi::Sysnum::MutexInit);
            syscall_stub!(sys_mutex_lock_stub, abi::Sysnum::MutexLock);
            syscall_stub!(sys_mutex_unlock_stub, abi::Sysnum::MutexUnlock);
            syscall_stub!(
                sys_wait_until_next_period_stub,
                abi::Sysnum::WaitUntilNextPeriod
            );
            syscall_stub!(sys_get_time_stub, abi::Sysnum::GetTime);
            syscall_stub!(sys_get_priority_stub, abi::Sysnum::GetPriority);
            syscall_stub!(sys_thread_time_stub, abi::Sysnum::ThreadTime);

            extern "C" {
                pub fn sys_sbrk_stub(increment: i32) -> u32;
                pub fn sys_write_stub(
                    fd: u32,
                    data: *const u8,
                    len: usize,
                ) -> i32;
                pub fn sys_read_stub(
                    fd: u32,
                    buffer: *mut u8,
                    len: usize,
                ) -> i32;
                pub fn sys_exit_stub(status: u32) -> !;
                pub fn sys_thread_init_stub(
                    max_threads: u32,
                    stack_words: u32,
                    idle_entry: usize,
                    max_mutexes: u32,
                ) -> i32;
                pub fn sys_thread_create_stub(
                    entry: usize,
                    priority: u32,
                    budget_ticks: u32,
                    period_ticks: u32,
                    argument: usize,
                ) -> i32;
                pub fn sys_thread_kill_stub() -> !;
                pub fn sys_scheduler_start_stub(frequency: u32) -> i32;
                pub fn sys_mutex_init_stub(ceiling_priority: u32) -> u32;
                pub fn sys_mutex_lock_stub(handle: u32);
                pub fn sys_mutex_unlock_stub(handle: u32);
                pub fn sys_wait_until_next_period_stub();
                pub fn sys_get_time_stub() -> u32;
                pub fn sys_get_priority_stub() -> u32;
                pub fn sys_thread_time_stub() -> u32;
            }
        }
    } else {
        /// Host stand-ins so user-level crates type-check off target.
        mod stubs {
            #![allow(clippy::missing_safety_doc)]

            pub unsafe fn sys_sbrk_stub(_: i32) -> u32 {
                unimplemented!("syscalls require an ARM target");
            }
            pub unsafe fn sys_write_stub(_: u32, _: *const u8, _: usize) -> i32 {
                unimplemented!("syscalls require an ARM target");
            }
            pub unsafe fn sys_read_stub(_: u32, _: *mut u8, _: usize) -> i32 {
                unimplemented!("syscalls require an ARM target");
            }
            pub unsafe fn sys_exit_stub(_: u32) -> ! {
                unimplemented!("syscalls require an ARM target");
            }
            pub unsafe fn sys_thread_init_stub(
                _: u32,
                _: u32,
                _: usize,
                _: u32,
            ) -> i32 {
                unimplemented!("syscalls require an ARM target");
            }
            pub unsafe fn sys_thread_create_stub(
                _: usize,
                _: u32,
                _: u32,
                _: u32,
                _: usize,
            ) -> i32 {
                unimplemented!("syscalls require an ARM target");
            }
            pub unsafe fn sys_thread_kill_stub() -> ! {
                unimplemented!("syscalls require an ARM target");
            }
            pub unsafe fn sys_scheduler_start_stub(_: u32) -> i32 {
                unimplemented!("syscalls require an ARM target");
            }
            pub unsafe fn sys_mutex_init_stub(_: u32) -> u32 {
                unimplemented!("syscalls require an ARM target");
            }
            pub unsafe fn sys_mutex_lock_stub(_: u32) {
                unimplemented!("syscalls require an ARM target");
            }
            pub unsafe fn sys_mutex_unlock_stub(_: u32) {
                unimplemented!("syscalls require an ARM target");
            }
            pub unsafe fn sys_wait_until_next_period_stub() {
                unimplemented!("syscalls require an ARM target");
            }
            pub unsafe fn sys_get_time_stub() -> u32 {
                unimplemented!("syscalls require an ARM target");
            }
            pub unsafe fn sys_get_priority_stub() -> u32 {
                unimplemented!("syscalls require an ARM target");
            }
            pub unsafe fn sys_thread_time_stub() -> u32 {
                unimplemented!("syscalls require an ARM target");
            }
        }
    }
}
