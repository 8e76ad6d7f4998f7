// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall implementation.
//!
//! This builds on architecture-specific parts defined in the `arch::*`
//! modules: the entry sequence snapshots the caller's trap frame into its
//! TCB and extracts the operation number from the trapping instruction
//! before handing control to `syscall_entry`.
//!
//! # Syscall implementations
//!
//! Operations that touch the thread and mutex tables are implemented by
//! functions with the signature:
//!
//! ```ignore
//! fn syscall(kernel: &mut Kernel, caller: usize) -> Result<NextThread, UserError>;
//! ```
//!
//! On return, a `NextThread` indicates success with a possible scheduling
//! hint, while a `UserError` indicates a condition that needs to either be
//! returned as a response code or treated as fatal for the caller. A common
//! wrapper takes care of the final side effects, reducing code in each
//! syscall.
//!
//! The host I/O surface (`sbrk`, `write`, `read`, `exit`) and `thread_init`
//! itself need no kernel state and run directly against the calling
//! thread's saved frame; they are what makes the boundary usable before the
//! thread table exists.
//!
//! Arguments are read from the frame snapshot through *argument proxy*
//! types, e.g. `thread.save().as_create_args()`. See the
//! `thread::ArchState` trait for details.

use core::sync::atomic::{AtomicUsize, Ordering};

use abi::{FaultInfo, Sysnum, ThreadState};

use crate::arch;
use crate::err::{UserError, FAILURE};
use crate::fail;
use crate::mutex;
use crate::profiling;
use crate::sched;
use crate::startup;
use crate::thread::{ArchState, InitParams, Kernel, NextThread, Thread};
use crate::umem::USlice;

/// Entry point accessed by the arch-specific SVC entry sequence.
///
/// Before calling this, thread volatile state (callee-save registers, the
/// user stack pointer, and the exception return word) must be stored safely
/// into the `SavedState` struct of the current `Thread`, and `thread` must
/// point at that TCB.
///
/// # Safety
///
/// `thread` must be the current-thread pointer maintained by the arch
/// layer; this function will both dereference it and, for table
/// operations, translate it back into a table index.
#[no_mangle]
pub unsafe extern "C" fn syscall_entry(thread: *mut Thread) {
    {
        // Safety: per our contract, the pointer is valid and nothing else
        // aliases the TCB while the kernel runs.
        let t = unsafe { &mut *thread };
        if let Err(fault) = arch::prepare_syscall(t) {
            frame_fault(thread, fault);
            return;
        }
        profiling::event_syscall_enter(t.save().syscall_descriptor());
        t.set_in_kernel_call(true);
    }

    let nr = unsafe { (*thread).save().syscall_descriptor() };
    match Sysnum::try_from(nr) {
        Err(()) => {
            let t = unsafe { &mut *thread };
            klog!("unknown syscall {}", nr);
            t.save_mut().ret0(FAILURE);
        }
        Ok(Sysnum::Sbrk) => sbrk(unsafe { &mut *thread }),
        Ok(Sysnum::Write) => write(unsafe { &mut *thread }),
        Ok(Sysnum::Read) => read(unsafe { &mut *thread }),
        Ok(Sysnum::GetTime) => get_time(unsafe { &mut *thread }),
        Ok(Sysnum::Exit) => {
            let status = unsafe { (*thread).save().as_exit_args().status };
            exit(status);
        }
        Ok(Sysnum::ThreadInit) => thread_init(unsafe { &mut *thread }),
        Ok(nr) => {
            // Everything else operates on the thread table. The raw pointer
            // is about to alias the kernel state, so shed our ability to
            // dereference it first.
            let addr = thread as usize;
            let handled = startup::with_kernel(|kernel| {
                let Some(caller) = kernel.index_of(addr) else {
                    return false;
                };
                match stateful_syscall(kernel, caller, nr) {
                    NextThread::Same => (),
                    _ => {
                        let next = sched::select(kernel);
                        // Safety: next comes from the thread table and is
                        // not used again until the next kernel entry.
                        unsafe {
                            arch::set_current_thread(kernel.thread(next));
                        }
                    }
                }
                true
            })
            .unwrap_or(false);
            if !handled {
                let t = unsafe { &mut *thread };
                klog!("syscall {} before thread_init", nr as u32);
                t.save_mut().ret0(FAILURE);
            }
        }
    }

    // Write the (possibly updated) return value and resume pc back into the
    // caller's frame. If the operation switched threads, the next thread's
    // context is restored wholesale by the exit assembly; only the caller's
    // frame needs fixing up.
    let t = unsafe { &mut *thread };
    t.set_in_kernel_call(false);
    arch::finish_syscall(t);
    profiling::event_syscall_exit();
}

/// Dispatcher for the operations that require the kernel state. Factored
/// out of `syscall_entry` to encapsulate the bits that don't need `unsafe`.
pub fn stateful_syscall(
    kernel: &mut Kernel,
    caller: usize,
    nr: Sysnum,
) -> NextThread {
    let res = match nr {
        Sysnum::ThreadCreate => thread_create(kernel, caller),
        Sysnum::ThreadKill => thread_kill(kernel, caller),
        Sysnum::SchedulerStart => scheduler_start(kernel, caller),
        Sysnum::MutexInit => mutex_init(kernel, caller),
        Sysnum::MutexLock => mutex_lock(kernel, caller),
        Sysnum::MutexUnlock => mutex_unlock(kernel, caller),
        Sysnum::WaitUntilNextPeriod => wait_until_next_period(kernel, caller),
        Sysnum::GetPriority => get_priority(kernel, caller),
        Sysnum::ThreadTime => thread_time(kernel, caller),
        _ => {
            // The stateless operations are dispatched before the kernel
            // state is borrowed and cannot arrive here.
            klog!("stateless syscall {:?} routed to thread path", nr);
            Ok(NextThread::Same)
        }
    };
    match res {
        Ok(next) => next,
        Err(UserError::Recoverable(code, hint)) => {
            kernel.thread_mut(caller).save_mut().ret0(code);
            hint
        }
        Err(UserError::Unrecoverable(fault)) => {
            kernel.kill_thread(caller, Some(fault))
        }
    }
}

fn thread_create(
    kernel: &mut Kernel,
    caller: usize,
) -> Result<NextThread, UserError> {
    let args = kernel.thread(caller).save().as_create_args();
    match kernel.create_thread(
        args.entry,
        args.argument,
        args.priority,
        args.budget,
        args.period,
        arch::now(),
    ) {
        Ok(()) => {
            kernel.thread_mut(caller).save_mut().ret0(0);
            Ok(NextThread::Same)
        }
        Err(()) => Err(UserError::rejection()),
    }
}

fn thread_kill(
    kernel: &mut Kernel,
    caller: usize,
) -> Result<NextThread, UserError> {
    if caller == kernel.default_index() {
        // The default slot is the last context standing; killing it is how
        // the system exits.
        exit(0);
    }
    if caller == kernel.idle_index() {
        // The idle slot must survive an accidental return from a
        // caller-supplied idle function: respawn it on the built-in one.
        klog!("idle thread returned; respawning");
        let t = kernel.thread_mut(caller);
        t.set_entry_point(arch::default_idle_entry());
        arch::reinitialize(t);
        return Ok(NextThread::Same);
    }
    Ok(kernel.kill_thread(caller, None))
}

fn scheduler_start(
    kernel: &mut Kernel,
    caller: usize,
) -> Result<NextThread, UserError> {
    let args = kernel.thread(caller).save().as_start_args();
    if kernel.started() {
        klog!("scheduler_start called twice");
        return Err(UserError::rejection());
    }
    if arch::start_tick_source(args.frequency).is_err() {
        klog!("scheduler_start: unusable frequency {}", args.frequency);
        return Err(UserError::rejection());
    }
    kernel.started = true;
    kernel.thread_mut(caller).save_mut().ret0(0);
    // The first real schedule happens in the switch trampoline, which is
    // pended behind this trap.
    arch::pend_context_switch();
    Ok(NextThread::Same)
}

fn mutex_init(
    kernel: &mut Kernel,
    caller: usize,
) -> Result<NextThread, UserError> {
    let args = kernel.thread(caller).save().as_mutex_init_args();
    let handle = mutex::init(kernel, args.ceiling);
    kernel.thread_mut(caller).save_mut().ret0(handle);
    Ok(NextThread::Same)
}

fn mutex_lock(
    kernel: &mut Kernel,
    caller: usize,
) -> Result<NextThread, UserError> {
    let args = kernel.thread(caller).save().as_mutex_args();
    Ok(mutex::lock(kernel, caller, args.handle))
}

fn mutex_unlock(
    kernel: &mut Kernel,
    caller: usize,
) -> Result<NextThread, UserError> {
    let args = kernel.thread(caller).save().as_mutex_args();
    Ok(mutex::unlock(kernel, caller, args.handle))
}

fn wait_until_next_period(
    kernel: &mut Kernel,
    caller: usize,
) -> Result<NextThread, UserError> {
    if kernel.is_reserved(caller) {
        klog!("wait_until_next_period from a reserved slot; ignored");
        return Ok(NextThread::Same);
    }
    kernel
        .thread_mut(caller)
        .set_state(ThreadState::Waiting);
    Ok(NextThread::Other)
}

fn get_priority(
    kernel: &mut Kernel,
    caller: usize,
) -> Result<NextThread, UserError> {
    let p = kernel.thread(caller).dynamic_priority();
    kernel.thread_mut(caller).save_mut().ret0(u32::from(p.0));
    Ok(NextThread::Same)
}

fn thread_time(
    kernel: &mut Kernel,
    caller: usize,
) -> Result<NextThread, UserError> {
    let elapsed = kernel.thread(caller).elapsed();
    kernel.thread_mut(caller).save_mut().ret0(elapsed);
    Ok(NextThread::Same)
}

/// Current program break, lazily initialized to the bottom of the heap
/// region on first use.
static PROGRAM_BREAK: AtomicUsize = AtomicUsize::new(0);

/// Implementation of `sbrk`: moves the program break, returning its
/// previous value, or `-1` if the request would leave the heap region.
pub(crate) fn sbrk(thread: &mut Thread) {
    let args = thread.save().as_sbrk_args();
    let heap = arch::heap_region();

    let mut observed = PROGRAM_BREAK.load(Ordering::Relaxed);
    loop {
        let base = if observed == 0 { heap.low } else { observed };
        let next = base as isize + args.increment as isize;
        if next < heap.low as isize || next > heap.high as isize {
            thread.save_mut().ret0(FAILURE);
            return;
        }
        match PROGRAM_BREAK.compare_exchange(
            observed,
            next as usize,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                thread.save_mut().ret0(base as u32);
                return;
            }
            Err(v) => observed = v,
        }
    }
}

/// Implementation of `write`: descriptor 1 goes to the board console.
pub(crate) fn write(thread: &mut Thread) {
    let args = thread.save().as_rw_args();
    if args.fd != 1 {
        thread.save_mut().ret0(FAILURE);
        return;
    }
    let r = match USlice::<u8>::from_raw(args.base, args.len) {
        Ok(slice) => {
            // Safety: the slice has a sane shape; it is read on behalf of
            // the calling thread, which owns the memory it named.
            let data = unsafe { slice.assume_readable() };
            arch::console_write(data);
            args.len as u32
        }
        Err(_) => FAILURE,
    };
    thread.save_mut().ret0(r);
}

/// Implementation of `read`: descriptor 0 comes from the board console.
pub(crate) fn read(thread: &mut Thread) {
    let args = thread.save().as_rw_args();
    if args.fd != 0 {
        thread.save_mut().ret0(FAILURE);
        return;
    }
    let r = match USlice::<u8>::from_raw(args.base, args.len) {
        Ok(mut slice) => {
            // Safety: as in `write`, but for a buffer the thread asked us
            // to fill.
            let buf = unsafe { slice.assume_writable() };
            arch::console_read(buf) as u32
        }
        Err(_) => FAILURE,
    };
    thread.save_mut().ret0(r);
}

/// Implementation of `get_time`: the tick source is the sole clock.
pub(crate) fn get_time(thread: &mut Thread) {
    thread.save_mut().ret0(arch::now().ticks());
}

/// Implementation of `exit`.
pub(crate) fn exit(status: u32) -> ! {
    klog!("exit status: {}", status);
    arch::halt(status)
}

/// Implementation of `thread_init`: validates the configuration, builds the
/// kernel state, adopts the caller as the default slot, and installs the
/// state into the static home in `startup`.
pub(crate) fn thread_init(thread: &mut Thread) {
    let args = thread.save().as_init_args();
    if startup::kernel_installed() {
        klog!("thread_init called twice");
        thread.save_mut().ret0(FAILURE);
        return;
    }
    let kernel = Kernel::new(InitParams {
        max_threads: args.max_threads,
        stack_words: args.stack_words,
        idle_entry: args.idle_entry,
        max_mutexes: args.max_mutexes,
    });
    match kernel {
        Err(()) => thread.save_mut().ret0(FAILURE),
        Ok(mut kernel) => {
            // The calling context becomes the default slot: copy its saved
            // machine state in, so the trap return path can restore from
            // the table entry instead of the boot TCB.
            let default = kernel.default_index();
            *kernel.thread_mut(default).save_mut() = thread.save().clone();
            kernel.thread_mut(default).save_mut().ret0(0);
            thread.save_mut().ret0(0);

            match startup::install_kernel(kernel) {
                Ok(()) => {
                    let _ = startup::with_kernel(|k| {
                        let default = k.default_index();
                        // Safety: the freshly installed table outlives this
                        // pointer's next use by construction.
                        unsafe {
                            arch::set_current_thread(k.thread(default));
                        }
                    });
                }
                Err(()) => thread.save_mut().ret0(FAILURE),
            }
        }
    }
}

/// Disposition for a thread whose stacked trap frame cannot even be read:
/// treat it like the memory fault it is.
fn frame_fault(thread: *mut Thread, fault: FaultInfo) {
    klog!("syscall frame fault: {:?}", fault);
    let addr = thread as usize;
    let handled = startup::with_kernel(|kernel| match kernel.index_of(addr) {
        Some(idx) if !kernel.is_reserved(idx) => {
            let _ = kernel.kill_thread(idx, Some(fault));
            let next = sched::select(kernel);
            // Safety: as above; the pointer is consumed before the next
            // kernel entry.
            unsafe {
                arch::set_current_thread(kernel.thread(next));
            }
            true
        }
        _ => false,
    })
    .unwrap_or(false);
    if !handled {
        // A trashed frame in the idle or default slot (or before the table
        // exists) leaves nothing to schedule.
        fail::die("stack fault in boot context");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch;
    use crate::time::Timestamp;
    use abi::{Priority, MUTEX_NONE};

    fn kernel(max_threads: usize) -> Kernel {
        Kernel::new(InitParams {
            max_threads,
            stack_words: 256,
            idle_entry: 0,
            max_mutexes: 1,
        })
        .unwrap()
    }

    #[test]
    fn create_via_dispatch() {
        let mut k = kernel(2);
        let caller = k.default_index();
        k.thread_mut(caller)
            .save_mut()
            .set_syscall(Sysnum::ThreadCreate, [0x1000, 0, 10, 100, 0xAB]);
        let next = stateful_syscall(&mut k, caller, Sysnum::ThreadCreate);
        assert_eq!(next, NextThread::Same);
        assert_eq!(k.thread(caller).save().return_value(), 0);
        assert_eq!(k.thread(0).state(), ThreadState::Ready);
        assert_eq!(k.thread(0).argument(), 0xAB);
    }

    #[test]
    fn create_rejection_returns_failure() {
        let mut k = kernel(2);
        let caller = k.default_index();
        // Priority out of range.
        k.thread_mut(caller)
            .save_mut()
            .set_syscall(Sysnum::ThreadCreate, [0x1000, 9, 10, 100, 0]);
        let _ = stateful_syscall(&mut k, caller, Sysnum::ThreadCreate);
        assert_eq!(k.thread(caller).save().return_value(), FAILURE);
        for i in 0..k.user_slots() {
            assert_eq!(k.thread(i).state(), ThreadState::New);
        }
    }

    #[test]
    #[should_panic(expected = "exit")]
    fn kill_from_default_slot_exits() {
        let mut k = kernel(2);
        let caller = k.default_index();
        let _ = stateful_syscall(&mut k, caller, Sysnum::ThreadKill);
    }

    #[test]
    fn kill_from_idle_slot_respawns() {
        let mut k = kernel(2);
        let idle = k.idle_index();
        let next = stateful_syscall(&mut k, idle, Sysnum::ThreadKill);
        assert_eq!(next, NextThread::Same);
        let t = k.thread(idle);
        assert_eq!(t.entry_point(), arch::default_idle_entry());
        assert_eq!(
            t.save().frame().pc as usize,
            arch::default_idle_entry() | 1
        );
        assert_eq!(t.state(), ThreadState::Ready);
    }

    #[test]
    fn kill_tears_down_user_thread() {
        let mut k = kernel(2);
        k.create_thread(0x1000, 0, 0, 10, 100, Timestamp::default())
            .unwrap();
        let next = stateful_syscall(&mut k, 0, Sysnum::ThreadKill);
        assert_eq!(next, NextThread::Other);
        assert_eq!(k.thread(0).state(), ThreadState::Done);
    }

    #[test]
    fn wait_until_next_period_parks_user_threads_only() {
        let mut k = kernel(2);
        k.create_thread(0x1000, 0, 0, 10, 100, Timestamp::default())
            .unwrap();
        let next = stateful_syscall(&mut k, 0, Sysnum::WaitUntilNextPeriod);
        assert_eq!(next, NextThread::Other);
        assert_eq!(k.thread(0).state(), ThreadState::Waiting);

        let idle = k.idle_index();
        let next = stateful_syscall(&mut k, idle, Sysnum::WaitUntilNextPeriod);
        assert_eq!(next, NextThread::Same);
        assert_eq!(k.thread(idle).state(), ThreadState::Ready);
    }

    #[test]
    fn scheduler_start_happens_once() {
        let mut k = kernel(2);
        let caller = k.default_index();
        k.thread_mut(caller)
            .save_mut()
            .set_syscall(Sysnum::SchedulerStart, [1000, 0, 0, 0, 0]);
        let _ = stateful_syscall(&mut k, caller, Sysnum::SchedulerStart);
        assert_eq!(k.thread(caller).save().return_value(), 0);
        assert!(k.started());
        assert!(arch::take_pended_switch());

        let _ = stateful_syscall(&mut k, caller, Sysnum::SchedulerStart);
        assert_eq!(k.thread(caller).save().return_value(), FAILURE);
    }

    #[test]
    fn scheduler_start_rejects_zero_frequency() {
        let mut k = kernel(2);
        let caller = k.default_index();
        k.thread_mut(caller)
            .save_mut()
            .set_syscall(Sysnum::SchedulerStart, [0; 5]);
        let _ = stateful_syscall(&mut k, caller, Sysnum::SchedulerStart);
        assert_eq!(k.thread(caller).save().return_value(), FAILURE);
        assert!(!k.started());
    }

    #[test]
    fn mutex_init_returns_handle_then_null() {
        let mut k = kernel(2);
        let caller = k.default_index();
        k.thread_mut(caller)
            .save_mut()
            .set_syscall(Sysnum::MutexInit, [0; 5]);
        let _ = stateful_syscall(&mut k, caller, Sysnum::MutexInit);
        assert_eq!(k.thread(caller).save().return_value(), 0);
        // The table was configured with a single slot.
        let _ = stateful_syscall(&mut k, caller, Sysnum::MutexInit);
        assert_eq!(k.thread(caller).save().return_value(), MUTEX_NONE);
    }

    #[test]
    fn get_priority_reports_the_dynamic_priority() {
        let mut k = kernel(3);
        k.create_thread(0x1000, 0, 2, 10, 100, Timestamp::default())
            .unwrap();
        let m = mutex::init(&mut k, 0);
        let _ = mutex::lock(&mut k, 2, m);
        assert_eq!(k.thread(2).static_priority(), Priority(2));

        let _ = stateful_syscall(&mut k, 2, Sysnum::GetPriority);
        assert_eq!(k.thread(2).save().return_value(), 0);
    }

    #[test]
    fn thread_time_reports_consumed_ticks() {
        let mut k = kernel(2);
        k.create_thread(0x1000, 0, 0, 10, 100, Timestamp::default())
            .unwrap();
        for _ in 0..5 {
            k.thread_mut(0).count_tick();
        }
        let _ = stateful_syscall(&mut k, 0, Sysnum::ThreadTime);
        assert_eq!(k.thread(0).save().return_value(), 5);
    }

    #[test]
    fn sbrk_moves_the_break_within_the_heap() {
        let mut k = kernel(2);
        let caller = k.default_index();

        k.thread_mut(caller)
            .save_mut()
            .set_syscall(Sysnum::Sbrk, [16, 0, 0, 0, 0]);
        sbrk(k.thread_mut(caller));
        let first = k.thread(caller).save().return_value();
        assert_ne!(first, FAILURE);

        sbrk(k.thread_mut(caller));
        let second = k.thread(caller).save().return_value();
        assert_eq!(second.wrapping_sub(first), 16);

        // Exhaustion is reported without moving the break.
        k.thread_mut(caller)
            .save_mut()
            .set_syscall(Sysnum::Sbrk, [i32::MAX as u32, 0, 0, 0, 0]);
        sbrk(k.thread_mut(caller));
        assert_eq!(k.thread(caller).save().return_value(), FAILURE);

        // So is shrinking past the bottom of the heap.
        k.thread_mut(caller)
            .save_mut()
            .set_syscall(Sysnum::Sbrk, [(-(1 << 30i32)) as u32, 0, 0, 0, 0]);
        sbrk(k.thread_mut(caller));
        assert_eq!(k.thread(caller).save().return_value(), FAILURE);
    }

    #[test]
    fn write_checks_the_descriptor() {
        let mut k = kernel(2);
        let caller = k.default_index();
        k.thread_mut(caller)
            .save_mut()
            .set_syscall(Sysnum::Write, [2, 0x2000, 4, 0, 0]);
        write(k.thread_mut(caller));
        assert_eq!(k.thread(caller).save().return_value(), FAILURE);

        // A zero-length write to the console is legal and writes nothing.
        k.thread_mut(caller)
            .save_mut()
            .set_syscall(Sysnum::Write, [1, 0x2000, 0, 0, 0]);
        write(k.thread_mut(caller));
        assert_eq!(k.thread(caller).save().return_value(), 0);
    }

    #[test]
    fn read_checks_the_descriptor() {
        let mut k = kernel(2);
        let caller = k.default_index();
        k.thread_mut(caller)
            .save_mut()
            .set_syscall(Sysnum::Read, [1, 0x2000, 4, 0, 0]);
        read(k.thread_mut(caller));
        assert_eq!(k.thread(caller).save().return_value(), FAILURE);
    }

    #[test]
    fn get_time_reads_the_tick_source() {
        let mut k = kernel(2);
        let caller = k.default_index();
        arch::set_ticks(42);
        get_time(k.thread_mut(caller));
        assert_eq!(k.thread(caller).save().return_value(), 42);
    }

    #[test]
    fn console_round_trip() {
        arch::console_write(b"hello");
        let out = arch::console_take_output();
        assert!(out.ends_with(b"hello"));

        arch::console_push_input(b"hi");
        let mut buf = [0u8; 8];
        let n = arch::console_read(&mut buf);
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"hi");
    }
}
