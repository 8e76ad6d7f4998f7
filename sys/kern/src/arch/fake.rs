// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted stand-in for the architecture layer.
//!
//! This backend simulates just enough of the machine-dependent surface --
//! saved state, stack pools, the tick counter, the console -- for the
//! portable kernel logic to run inside ordinary host unit tests. On
//! "kernel entry" the test stages the trap-frame snapshot directly in the
//! `SavedState`; on "return to user" nothing needs writing back, because
//! the snapshot *is* the frame.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use abi::FaultInfo;

use crate::thread::{ArchState, StackExtent, Thread, TrapFrame};
use crate::time::Timestamp;

/// Initially we just set the Thumb Mode bit, the minimum required.
const INITIAL_PSR: u32 = 1 << 24;

/// Pretend code addresses for the built-in idle loop and the thread
/// terminator. Nothing executes on the host, so these only need to be
/// recognizable.
const DEFAULT_IDLE_ENTRY: usize = 0xF000;
const TERMINATOR_ENTRY: usize = 0xF100;

/// Simulated machine state: the callee-save registers are irrelevant on the
/// host, so only the trap-frame snapshot and its companions exist.
#[derive(Clone, Debug, Default)]
pub struct SavedState {
    trap: TrapFrame,
    extra_arg: u32,
    sysnum: u32,
    psp: usize,
}

impl SavedState {
    /// Stages a syscall the way the real entry sequence would: four
    /// arguments in the frame registers, the fifth above the frame, and
    /// the operation number from the trapping instruction.
    pub fn set_syscall(&mut self, nr: abi::Sysnum, args: [u32; 5]) {
        self.trap.r0 = args[0];
        self.trap.r1 = args[1];
        self.trap.r2 = args[2];
        self.trap.r3 = args[3];
        self.extra_arg = args[4];
        self.sysnum = nr as u32;
    }

    /// The trap-frame snapshot, for inspection by tests.
    pub fn frame(&self) -> &TrapFrame {
        &self.trap
    }

    /// Mutable snapshot access, for tests that need to place a plausible
    /// pc before exercising the blocked-lock rewind.
    pub fn frame_mut(&mut self) -> &mut TrapFrame {
        &mut self.trap
    }

    /// What user code would observe in its first argument register after
    /// the trap returns.
    pub fn return_value(&self) -> u32 {
        self.trap.r0
    }
}

impl ArchState for SavedState {
    fn stack_pointer(&self) -> usize {
        self.psp
    }

    fn arg0(&self) -> u32 {
        self.trap.r0
    }
    fn arg1(&self) -> u32 {
        self.trap.r1
    }
    fn arg2(&self) -> u32 {
        self.trap.r2
    }
    fn arg3(&self) -> u32 {
        self.trap.r3
    }
    fn arg4(&self) -> u32 {
        self.extra_arg
    }

    fn syscall_descriptor(&self) -> u32 {
        self.sysnum
    }

    fn ret0(&mut self, x: u32) {
        self.trap.r0 = x;
    }

    fn rewind_pc(&mut self) {
        self.trap.pc = self.trap.pc.wrapping_sub(2);
    }
}

/// Host-side stand-ins for the linker-provided stack pools and heap.
static USER_STACK_POOL: [u8; abi::STACK_POOL_LIMIT] =
    [0; abi::STACK_POOL_LIMIT];
static KERNEL_STACK_POOL: [u8; abi::STACK_POOL_LIMIT] =
    [0; abi::STACK_POOL_LIMIT];
static HEAP: [u8; 16 * 1024] = [0; 16 * 1024];

fn extent_of(region: &'static [u8]) -> StackExtent {
    let low = region.as_ptr() as usize;
    StackExtent {
        low,
        high: low + region.len(),
    }
}

pub fn user_stack_pool() -> StackExtent {
    extent_of(&USER_STACK_POOL)
}

pub fn kernel_stack_pool() -> StackExtent {
    extent_of(&KERNEL_STACK_POOL)
}

pub fn heap_region() -> StackExtent {
    extent_of(&HEAP)
}

static CLOCK_FREQ_HZ: AtomicU32 = AtomicU32::new(0);

pub unsafe fn set_clock_freq(hz: u32) {
    CLOCK_FREQ_HZ.store(hz, Ordering::Relaxed);
}

/// Simulated kernel tick counter.
static TICKS: AtomicU32 = AtomicU32::new(0);

/// Reads the tick counter.
pub fn now() -> Timestamp {
    Timestamp::from(TICKS.load(Ordering::Relaxed))
}

/// Test control over the tick counter.
pub fn set_ticks(t: u32) {
    TICKS.store(t, Ordering::Relaxed);
}

static TICK_FREQUENCY: AtomicU32 = AtomicU32::new(0);

/// "Programs" the simulated tick source. The host has no timer; this only
/// validates the rate and records it.
pub fn start_tick_source(frequency: u32) -> Result<(), ()> {
    if frequency == 0 {
        return Err(());
    }
    TICK_FREQUENCY.store(frequency, Ordering::Relaxed);
    Ok(())
}

static SWITCH_PENDED: AtomicBool = AtomicBool::new(false);

/// Records a context-switch request; on hardware this pends the switch
/// exception.
pub fn pend_context_switch() {
    SWITCH_PENDED.store(true, Ordering::Relaxed);
}

/// Consumes a pended switch request, for test inspection.
pub fn take_pended_switch() -> bool {
    SWITCH_PENDED.swap(false, Ordering::Relaxed)
}

static CURRENT_THREAD: AtomicPtr<Thread> =
    AtomicPtr::new(core::ptr::null_mut());

/// Records the address of `thread` as the current user thread.
///
/// # Safety
///
/// This records a pointer that aliases `thread`. As long as you don't read
/// that pointer while you have access to `thread`, you'll be okay.
pub unsafe fn set_current_thread(thread: &Thread) {
    CURRENT_THREAD.store(thread as *const _ as *mut _, Ordering::Relaxed);
    crate::profiling::event_context_switch(thread as *const _ as usize);
}

/// Builds a thread's initial machine state. The hosted version deposits the
/// initial exception frame in the snapshot rather than in stack memory;
/// the stack pointer is still computed so extent checks stay meaningful.
pub fn reinitialize(thread: &mut Thread) {
    let entry = thread.entry_point();
    let argument = thread.argument();
    let stack_top = thread.user_stack().high & !0x7;
    let psp = stack_top - core::mem::size_of::<TrapFrame>();

    let save = thread.save_mut();
    *save = SavedState::default();
    save.psp = psp;
    save.trap.pc = entry as u32 | 1;
    save.trap.r0 = argument as u32;
    save.trap.lr = TERMINATOR_ENTRY as u32 | 1;
    save.trap.xpsr = INITIAL_PSR;
}

/// Entry point of the built-in wait-for-interrupt idle loop.
pub fn default_idle_entry() -> usize {
    DEFAULT_IDLE_ENTRY
}

/// On hardware this snapshots the stacked frame and decodes the `svc`
/// immediate; tests stage both directly, so there is nothing to do.
pub fn prepare_syscall(_thread: &mut Thread) -> Result<(), FaultInfo> {
    Ok(())
}

/// On hardware this writes the return value and resume pc back into the
/// stacked frame; the snapshot is authoritative here.
pub fn finish_syscall(_thread: &mut Thread) {}

pub fn start_first_thread(_thread: &mut Thread) -> ! {
    panic!("user mode is not available on the host");
}

/// Halts the "system". Panicking lets tests observe the exit path.
pub fn halt(status: u32) -> ! {
    panic!("exit({})", status);
}

/// Captured console output, so tests can watch the write path.
static CONSOLE_OUT: std::sync::Mutex<Vec<u8>> =
    std::sync::Mutex::new(Vec::new());

/// Pending console input, fed by tests for the read path.
static CONSOLE_IN: std::sync::Mutex<Vec<u8>> =
    std::sync::Mutex::new(Vec::new());

pub fn console_write(data: &[u8]) {
    CONSOLE_OUT.lock().unwrap().extend_from_slice(data);
}

pub fn console_read(buf: &mut [u8]) -> usize {
    let mut input = CONSOLE_IN.lock().unwrap();
    let n = buf.len().min(input.len());
    buf[..n].copy_from_slice(&input[..n]);
    input.drain(..n);
    n
}

pub fn console_take_output() -> Vec<u8> {
    core::mem::take(&mut *CONSOLE_OUT.lock().unwrap())
}

pub fn console_push_input(data: &[u8]) {
    CONSOLE_IN.lock().unwrap().extend_from_slice(data);
}
