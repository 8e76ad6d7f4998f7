// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup and the static home of the kernel state.
//!
//! Unlike the thread table itself, which is runtime-configured by
//! `thread_init`, the *slot* for it is static: a `MaybeUninit` guarded by
//! two flags. `KERNEL_READY` says whether `thread_init` has installed a
//! state value yet; `KERNEL_IN_USE` forms an ad-hoc mutex that catches any
//! attempt to re-enter the kernel state while it is borrowed, which would
//! otherwise produce a second `&mut`.

use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;
use crate::thread::{Kernel, Thread};

/// Tracks when a mutable reference to the kernel state is floating around
/// in kernel code, to prevent production of a second one.
static KERNEL_IN_USE: AtomicBool = AtomicBool::new(false);

/// Set (permanently) once `thread_init` has installed the kernel state.
static KERNEL_READY: AtomicBool = AtomicBool::new(false);

/// Backing storage for the kernel state value.
static mut KERNEL_SPACE: MaybeUninit<Kernel> = MaybeUninit::uninit();

/// TCB standing in for the boot context between `start_kernel` and
/// `thread_init`. The SVC entry sequence needs *somewhere* to deposit the
/// caller's registers before the thread table exists; once `thread_init`
/// runs, the saved state moves into the default slot and this TCB is never
/// current again.
static mut BOOT_THREAD: MaybeUninit<Thread> = MaybeUninit::uninit();

/// True once `thread_init` has succeeded.
pub fn kernel_installed() -> bool {
    KERNEL_READY.load(Ordering::Acquire)
}

/// Moves a freshly built kernel state into its static home. Fails if one is
/// already installed; `thread_init` is a once-only operation.
pub(crate) fn install_kernel(kernel: Kernel) -> Result<(), ()> {
    if KERNEL_READY.load(Ordering::Acquire) {
        return Err(());
    }
    // Safety: KERNEL_READY is false, so no `with_kernel` borrow can exist,
    // and the kernel is non-preemptible, so nothing races this write.
    unsafe {
        (*core::ptr::addr_of_mut!(KERNEL_SPACE)).write(kernel);
    }
    KERNEL_READY.store(true, Ordering::Release);
    Ok(())
}

/// Runs `body` with a reference to the kernel state, or returns `None` if
/// `thread_init` hasn't created one yet.
///
/// To preserve uniqueness of the `&mut` reference passed into `body`, this
/// function will detect any attempt to call it recursively and panic.
pub(crate) fn with_kernel<R>(
    body: impl FnOnce(&mut Kernel) -> R,
) -> Option<R> {
    if !KERNEL_READY.load(Ordering::Acquire) {
        return None;
    }
    if KERNEL_IN_USE.swap(true, Ordering::Acquire) {
        panic!(); // recursive use of with_kernel
    }
    // Safety: we have observed KERNEL_READY set, which means the space is
    // initialized, and KERNEL_IN_USE was clear, so no other reference is
    // alive. Thus we can produce a reference without aliasing.
    let kernel = unsafe {
        (*core::ptr::addr_of_mut!(KERNEL_SPACE)).assume_init_mut()
    };

    let r = body(kernel);

    KERNEL_IN_USE.store(false, Ordering::Release);

    Some(r)
}

/// The main kernel entry point.
///
/// The board's reset path does clock and memory setup and then calls this
/// with the core clock rate (used later to program the tick source) and the
/// address of the user program's entry point. This function fabricates the
/// boot context and drops to unprivileged thread mode at `user_entry`,
/// never to return; everything after that happens through traps.
///
/// # Safety
///
/// Architecture-specific requirements apply: on ARM this must be called
/// from the main stack in privileged mode, exactly once per boot.
pub unsafe fn start_kernel(core_clock_hz: u32, user_entry: usize) -> ! {
    klog!("kernel start, core clock {} Hz", core_clock_hz);

    // Safety: single-threaded boot context, per our own contract.
    unsafe {
        arch::set_clock_freq(core_clock_hz);
    }

    // The boot thread owns the whole user stack pool until thread_init
    // carves it up.
    let boot = Thread::boot(
        arch::user_stack_pool(),
        arch::kernel_stack_pool(),
        user_entry,
    );
    // Safety: nothing else touches BOOT_THREAD until set_current_thread
    // publishes it, below.
    let boot = unsafe { (*core::ptr::addr_of_mut!(BOOT_THREAD)).write(boot) };
    arch::reinitialize(boot);

    arch::start_first_thread(boot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::err::FAILURE;
    use abi::{Sysnum, ThreadState};

    /// The statics above are process-wide, so the whole lifecycle is
    /// exercised in a single test to keep the ordering deterministic. Other
    /// tests build `Kernel` values directly and never touch these statics.
    #[test]
    fn kernel_state_lifecycle() {
        assert!(!kernel_installed());
        assert_eq!(with_kernel(|_| ()), None);

        let mut boot = Thread::boot(
            arch::user_stack_pool(),
            arch::kernel_stack_pool(),
            0x1000,
        );
        boot.save_mut()
            .set_syscall(Sysnum::ThreadInit, [3, 256, 0, 2, 0]);
        crate::syscalls::thread_init(&mut boot);
        assert_eq!(boot.save().return_value(), 0);
        assert!(kernel_installed());

        with_kernel(|k| {
            assert_eq!(k.user_slots(), 3);
            assert_eq!(k.current_index(), k.default_index());
            assert_eq!(
                k.thread(k.default_index()).state(),
                ThreadState::Running
            );
            // The boot context's registers moved into the default slot.
            assert_eq!(
                k.thread(k.default_index()).save().return_value(),
                0
            );
        })
        .unwrap();

        // thread_init is once-only.
        boot.save_mut()
            .set_syscall(Sysnum::ThreadInit, [3, 256, 0, 2, 0]);
        crate::syscalls::thread_init(&mut boot);
        assert_eq!(boot.save().return_value(), FAILURE);
    }
}
