// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M.
//!
//! # ARM-M timer
//!
//! We use the system tick timer as the kernel tick source: it's only
//! suitable for producing periodic interrupts -- its counter is small and
//! only counts down -- so at each SysTick interrupt we increment the
//! `TICKS` global that contains the real kernel timestamp. This has the
//! downside that we take regular interrupts to maintain `TICKS`, but has
//! the upside that we don't need special SoC support for timing.
//!
//! # Notes on ARM-M interrupts
//!
//! This implementation uses three interrupt service routines:
//!
//! - `SVCall` implements the `SVC` instruction used to make syscalls.
//! - `SysTick` handles interrupts from the System Tick Timer, used to
//!   maintain the kernel timestamp and run the tick accountant.
//! - `PendSV` handles deferred context switches.
//!
//! The first two are expected; the last one deserves an explanation, and
//! it has to do with interrupt latency.
//!
//! On any interrupt, the processor stacks a small subset of machine state
//! and then calls our ISR, which follows the normal calling convention. If
//! the ISR wants to *switch threads*, that isn't enough: every callee-save
//! register, the process stack pointer, and the exception return word have
//! to be deposited somewhere predictable -- the TCB -- and read back on the
//! way out, possibly from a *different* TCB.
//!
//! That full save/restore is only worth doing in handlers that actually
//! switch. `SVCall` usually does, so it pays the full price. `SysTick`
//! does not save full state; when the tick accountant decides a switch is
//! due, it pokes the `PendSV` exception pending. `PendSV` is intended for
//! this exact use: it kicks in when the tick ISR exits, at the lowest
//! priority, and performs the full save/restore around invoking the
//! scheduler.
//!
//! All kernel entries (SVCall, SysTick, PendSV, external IRQs) share the
//! lowest exception priority, so kernel code is never preempted and the
//! tick accountant can't interleave with scheduler selection -- handlers
//! tail-chain instead of nesting. The configurable faults sit above them
//! so that faults in the kernel are still detected.

#[cfg(not(armv7m))]
compile_error!("this kernel currently supports ARMv7-M targets only");

use core::arch::{asm, global_asm};
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use abi::{FaultInfo, FaultSource, Sysnum};

use crate::startup::with_kernel;
use crate::thread::{ArchState, StackExtent, Thread, TrapFrame};
use crate::time::Timestamp;
use crate::umem::USlice;

/// On ARMvx-M we have to use a global to record the current thread pointer,
/// since we don't have a scratch register.
#[no_mangle]
static CURRENT_THREAD_PTR: AtomicPtr<Thread> =
    AtomicPtr::new(core::ptr::null_mut());

/// The core clock rate handed to `start_kernel`; consulted when the tick
/// source is programmed, and kept in memory where a debugger can find it.
#[no_mangle]
static CLOCK_FREQ_HZ: AtomicU32 = AtomicU32::new(0);

/// Kernel global for tracking the current timestamp, measured in ticks.
///
/// We access this only from contexts where we can't be preempted, so a
/// single 32-bit word with relaxed ordering is sufficient.
static TICKS: AtomicU32 = AtomicU32::new(0);

/// ARMv7-M volatile registers that must be saved across context switches,
/// plus the kernel's snapshot of the caller's trap frame.
///
/// No floating-point state is preserved: the admission math runs at
/// admission time only, and user threads are built without hardware FP.
#[repr(C)]
#[derive(Clone, Debug, Default)]
pub struct SavedState {
    // NOTE: the following fields must be kept contiguous; the entry
    // assembly stores through the current-thread pointer in this order.
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    psp: u32,
    exc_return: u32,
    // NOTE: the above fields must be kept contiguous!
    /// Snapshot of the exception frame at the caller's PSP, taken on
    /// syscall entry and written back (r0, pc) on the way out.
    trap: TrapFrame,
    /// The word above the frame: the stacked fifth argument.
    extra_arg: u32,
    /// Operation number decoded from the trapping `svc`.
    sysnum: u32,
}

/// Map the saved state to the (architecture-independent) syscall argument
/// and return slots.
impl ArchState for SavedState {
    fn stack_pointer(&self) -> usize {
        self.psp as usize
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
        // Thumb `svc` is a 2-byte instruction.
        self.trap.pc = self.trap.pc.wrapping_sub(2);
    }
}

/// Initially we just set the Thumb Mode bit, the minimum required.
const INITIAL_PSR: u32 = 1 << 24;

/// EXC_RETURN value for resuming a thread: return to Thread mode, Process
/// stack, basic (no-FP) frame.
const EXC_RETURN_CONST: u32 = 0xFFFFFFFD;

// The stack pools and the heap are delimited by the linker.
extern "C" {
    static __thread_u_stacks_low: u32;
    static __thread_u_stacks_top: u32;
    static __thread_k_stacks_low: u32;
    static __thread_k_stacks_top: u32;
    static __heap_low: u32;
    static __heap_top: u32;

    fn default_idle() -> !;
    fn thread_terminator() -> !;
}

pub fn user_stack_pool() -> StackExtent {
    // Safety: we take the addresses of linker symbols, never their values.
    unsafe {
        StackExtent {
            low: core::ptr::addr_of!(__thread_u_stacks_low) as usize,
            high: core::ptr::addr_of!(__thread_u_stacks_top) as usize,
        }
    }
}

pub fn kernel_stack_pool() -> StackExtent {
    // Safety: as above.
    unsafe {
        StackExtent {
            low: core::ptr::addr_of!(__thread_k_stacks_low) as usize,
            high: core::ptr::addr_of!(__thread_k_stacks_top) as usize,
        }
    }
}

pub fn heap_region() -> StackExtent {
    // Safety: as above.
    unsafe {
        StackExtent {
            low: core::ptr::addr_of!(__heap_low) as usize,
            high: core::ptr::addr_of!(__heap_top) as usize,
        }
    }
}

/// Entry point of the built-in wait-for-interrupt idle loop, installed
/// when `thread_init` is given a null idle function and when the idle
/// thread is respawned after an accidental return.
pub fn default_idle_entry() -> usize {
    default_idle as usize
}

/// Records the core clock rate for later tick-source programming.
///
/// # Safety
///
/// Call once, from the boot path, before `scheduler_start` can run.
pub unsafe fn set_clock_freq(hz: u32) {
    CLOCK_FREQ_HZ.store(hz, Ordering::Relaxed);
}

/// Reads the tick counter.
pub fn now() -> Timestamp {
    // The tick interrupt cannot preempt kernel code, so a single relaxed
    // load is exact.
    Timestamp::from(TICKS.load(Ordering::Relaxed))
}

/// Builds a thread's initial machine state: a fabricated exception frame at
/// the top of its stack region, entering the thread function in thumb mode
/// with its argument in r0 and the thread terminator as the return
/// address, plus a zeroed callee-save image.
pub fn reinitialize(thread: &mut Thread) {
    *thread.save_mut() = SavedState::default();

    // ARMvX-M requires 8-byte stack alignment. The carve preserves it for
    // any power-of-two stack size, but the boot extent comes straight from
    // the linker -- check rather than trust.
    let stack_top = thread.user_stack().high & !0x7;
    let frame_size = core::mem::size_of::<TrapFrame>();
    uassert!(stack_top >= thread.user_stack().low + frame_size);
    let frame_addr = stack_top - frame_size;

    let mut frame_slice = match USlice::<TrapFrame>::from_raw(frame_addr, 1) {
        Ok(s) => s,
        // The extent was carved by the kernel; an unrepresentable frame
        // address means the thread table is corrupt.
        Err(_) => panic!(),
    };
    // Safety: the frame lies inside the thread's stack region, which
    // aliases no kernel data, and TrapFrame is plain old data.
    let frame = &mut unsafe { frame_slice.assume_writable() }[0];

    *frame = TrapFrame::default();
    frame.pc = thread.entry_point() as u32 | 1; // thumb
    frame.xpsr = INITIAL_PSR;
    frame.r0 = thread.argument() as u32;
    frame.lr = thread_terminator as usize as u32 | 1;

    let save = thread.save_mut();
    save.psp = frame_addr as u32;
    save.exc_return = EXC_RETURN_CONST;
}

/// Snapshots the caller's trap frame and decodes the operation number from
/// the trapping `svc` instruction. Called at the top of `syscall_entry`,
/// after the entry assembly has parked the callee-save registers.
pub fn prepare_syscall(thread: &mut Thread) -> Result<(), FaultInfo> {
    let psp = thread.save().psp as usize;
    let frame_size = core::mem::size_of::<TrapFrame>();

    // The frame plus the stacked fifth argument must lie inside the
    // thread's own stack region; a PSP outside it is a stack fault, not a
    // syscall.
    if !thread.user_stack().covers(psp, frame_size + 4) {
        return Err(FaultInfo::StackOverflow {
            address: psp as u32,
        });
    }

    let frame_slice =
        USlice::<TrapFrame>::from_raw(psp, 1).map_err(FaultInfo::from)?;
    // Safety: range-checked against the thread's extent just above.
    let frame = unsafe { &frame_slice.assume_readable()[0] }.clone();

    // Safety: covered by the same extent check.
    let extra =
        unsafe { core::ptr::read_volatile((psp + frame_size) as *const u32) };

    // The operation number rides in the immediate field of the `svc` the
    // thread just executed, two bytes behind the stacked pc.
    let pc = frame.pc as usize;
    if pc < 2 {
        return Err(FaultInfo::IllegalText);
    }
    // Safety: the thread was executing at pc-2 a moment ago; reading the
    // instruction back is benign.
    let insn = unsafe { core::ptr::read_volatile((pc - 2) as *const u16) };

    let save = thread.save_mut();
    save.trap = frame;
    save.extra_arg = extra;
    save.sysnum = u32::from(insn & 0xFF);
    Ok(())
}

/// Writes the return value and resume pc back into the caller's stacked
/// frame, so the hardware exception return delivers them.
pub fn finish_syscall(thread: &mut Thread) {
    let psp = thread.save().psp as usize;
    let r0 = thread.save().trap.r0;
    let pc = thread.save().trap.pc;
    // Offsets of r0 and pc within the stacked frame.
    const PC_OFFSET: usize = 6 * 4;
    // Safety: prepare_syscall established that the frame lies inside the
    // thread's stack region, and the thread has not run since.
    unsafe {
        core::ptr::write_volatile(psp as *mut u32, r0);
        core::ptr::write_volatile((psp + PC_OFFSET) as *mut u32, pc);
    }
}

/// Programs the system tick timer for `frequency` ticks per second against
/// the recorded core clock.
pub fn start_tick_source(frequency: u32) -> Result<(), ()> {
    if frequency == 0 {
        return Err(());
    }
    let clock = CLOCK_FREQ_HZ.load(Ordering::Relaxed);
    let reload = clock / frequency;
    if reload == 0 || reload - 1 > 0x00FF_FFFF {
        return Err(());
    }

    // Safety: programming SYST has no memory-safety implications; the
    // register API is just conservatively unsafe.
    unsafe {
        let syst = &*cortex_m::peripheral::SYST::PTR;
        // Program reload value.
        syst.rvr.write(reload - 1);
        // Clear current value.
        syst.cvr.write(0);
        // Enable counter and interrupt, processor clock source.
        syst.csr.modify(|v| v | 0b111);
    }
    Ok(())
}

/// Requests a deferred context switch: PendSV will run when the current
/// handler (and any tail-chained ones) finishes.
pub fn pend_context_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
}

/// Records the address of `thread` as the current user thread.
///
/// # Safety
///
/// This records a pointer that aliases `thread`. As long as you don't read
/// that pointer while you have access to `thread`, and as long as the
/// `thread` being stored is actually in the thread table, you'll be okay.
pub unsafe fn set_current_thread(thread: &Thread) {
    CURRENT_THREAD_PTR.store(thread as *const _ as *mut _, Ordering::Relaxed);
    crate::profiling::event_context_switch(thread as *const _ as usize);
}

/// Parks the system after `exit`: optionally reports the status to an
/// attached debugger, then sleeps forever.
pub fn halt(status: u32) -> ! {
    #[cfg(feature = "log-semihosting")]
    {
        use cortex_m_semihosting::debug;
        debug::exit(if status == 0 {
            debug::EXIT_SUCCESS
        } else {
            debug::EXIT_FAILURE
        });
    }
    let _ = status;
    loop {
        cortex_m::asm::wfi();
    }
}

/// Hands the CPU to the boot thread.
///
/// Sets up fault and exception priorities, records `thread` as current, and
/// drops to unprivileged thread mode on the process stack via the SVC
/// bootstrap path (the SVC entry sequence detects this one startup case by
/// the caller's mode and vectors accordingly).
pub fn start_first_thread(thread: &mut Thread) -> ! {
    // Our goal here is to keep the kernel non-preemptive, which means the
    // kernel entry points (SVCall, PendSV, SysTick, interrupt handlers)
    // must share one priority level, with the fault handlers above them so
    // that faults in the kernel can be told apart.
    //
    // Safety: we're purely lowering priorities from their defaults, so no
    // surprise preemption can result; the register writes are `unsafe` in
    // the `cortex_m` crate only by convention.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // Enable MEMFAULT, BUSFAULT, USGFAULT as distinct from HardFault.
        scb.shcsr.modify(|x| x | 0b111 << 16);

        // Faults to priority 0 (highest configurable)...
        scb.shpr[0].write(0x00);
        scb.shpr[1].write(0x00);
        scb.shpr[2].write(0x00);
        // ...SVCall, PendSV and SysTick to 0xFF (lowest configurable).
        scb.shpr[7].write(0xFF);
        scb.shpr[10].write(0xFF);
        scb.shpr[11].write(0xFF);

        // ARM's default disposition is that division by zero doesn't
        // actually fail, but rather returns 0. (!) We explicitly configure
        // ourselves to trap on any divide by zero.
        const DIV_0_TRP: u32 = 1 << 4;
        scb.ccr.modify(|x| x | DIV_0_TRP);

        // Configure the priority of all external interrupts so that they
        // can't preempt the kernel either. The interrupt count lives in
        // the ICTR, in blocks of 32.
        let nvic = &*cortex_m::peripheral::NVIC::PTR;
        let icb = &*cortex_m::peripheral::ICB::PTR;
        let ictr = icb.ictr.read();
        let irq_block_count = (ictr as usize & 0xF) + 1;
        let irq_count = irq_block_count * 32;
        for i in 0..irq_count {
            nvic.ipr[i].write(0xFFu8);
        }
    }

    CURRENT_THREAD_PTR.store(thread as *mut Thread, Ordering::Relaxed);

    // Safety: setting the Process stack pointer has no effect while this
    // code runs on the Main stack.
    unsafe {
        cortex_m::register::psp::write(thread.save().psp);
    }

    // Run the final pre-kernel assembly sequence: load the (zeroed)
    // callee-save image and trap. The SVC entry code detects that this
    // trap came from privileged thread mode on the Main stack and performs
    // startup instead of processing it as a syscall.
    unsafe {
        asm!("
            @ Restore callee-save registers.
            ldm {thread}, {{r4-r11}}
            @ Trap into the kernel.
            svc #0xFF
            @ noreturn generates a UDF here in case that should return.
            ",
            thread = in(reg) &thread.save().r4,
            options(noreturn),
        )
    }
}

// Handler that gets linked into the vector table for the Supervisor Call
// (SVC) instruction.
//
// First, we inspect LR, which on exception entry contains bits describing
// the _previous_ (interrupted) processor state. We can use this to detect
// if the SVC came from the Main (interrupt) stack. This only happens once,
// during startup, so we vector to a different routine in this case.
//
// We then store the calling thread's context into the TCB, call into
// `syscall_entry` with the TCB address, and restore thread context on the
// way out -- possibly for a different thread, if the syscall switched.
global_asm! {"
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
    SVCall:
        @ Inspect LR to figure out the caller's mode.
        mov r0, lr
        mov r1, #0xFFFFFFF3
        bic r0, r1
        @ Is the call coming from thread mode + main stack, i.e.
        @ from the kernel startup routine?
        cmp r0, #0x8
        @ If so, this is startup; jump ahead. The common case falls
        @ through because branch-not-taken tends to be faster on small
        @ cores.
        beq 1f

        @ store volatile state.
        @ first, get a pointer to the current thread.
        movw r0, #:lower16:CURRENT_THREAD_PTR
        movt r0, #:upper16:CURRENT_THREAD_PTR
        ldr r1, [r0]
        movs r2, r1
        @ fetch the process-mode stack pointer.
        @ fetching into r12 means the order in the stm below is right.
        mrs r12, PSP
        @ now, store volatile registers, plus the PSP in r12, plus LR.
        stm r2!, {{r4-r12, lr}}

        @ pass the TCB address to the handler and decode there.
        mov r0, r1
        bl syscall_entry

        @ we're returning back to *some* thread, maybe not the same one.
        movw r0, #:lower16:CURRENT_THREAD_PTR
        movt r0, #:upper16:CURRENT_THREAD_PTR
        ldr r0, [r0]
        @ restore volatile registers, plus load PSP into r12
        ldm r0!, {{r4-r12, lr}}
        msr PSP, r12

        @ resume
        bx lr

    1:  @ starting up the first thread.
        movs r0, #1         @ get bitmask to...
        msr CONTROL, r0     @ ...shed privs from thread mode.
                            @ note: no barrier here because exc return
                            @ serves as barrier

        mov lr, {exc_return}    @ materialize EXC_RETURN value to
                                @ return into thread mode, PSP, no FP

        bx lr                   @ branch into user mode
    ",
    exc_return = const EXC_RETURN_CONST,
}

// Handler that gets linked into the vector table for PendSV: the deferred
// context-switch trampoline. Same save/restore dance as SVCall, minus the
// startup case and the argument decoding.
global_asm! {"
    .section .text.PendSV
    .globl PendSV
    .type PendSV,function
    PendSV:
        @ store volatile state.
        @ first, get a pointer to the current thread.
        movw r0, #:lower16:CURRENT_THREAD_PTR
        movt r0, #:upper16:CURRENT_THREAD_PTR
        ldr r1, [r0]
        @ fetch the process-mode stack pointer.
        @ fetching into r12 means the order in the stm below is right.
        mrs r12, PSP
        @ now, store volatile registers, plus the PSP in r12, plus LR.
        stm r1!, {{r4-r12, lr}}

        bl pendsv_entry

        @ we're returning back to *some* thread, maybe not the same one.
        movw r0, #:lower16:CURRENT_THREAD_PTR
        movt r0, #:upper16:CURRENT_THREAD_PTR
        ldr r0, [r0]
        @ restore volatile registers, plus load PSP into r12
        ldm r0!, {{r4-r12, lr}}
        msr PSP, r12

        @ resume
        bx lr
    ",
}

// The built-in idle loop and the thread terminator. Both execute in
// unprivileged thread mode; they live in kernel text but contain nothing a
// thread shouldn't run.
//
// The terminator is the fabricated return address of every thread
// function: a thread that returns is asking to be torn down.
global_asm! {"
    .section .text.default_idle
    .globl default_idle
    .type default_idle,function
    .thumb_func
    default_idle:
        wfi
        b default_idle

    .section .text.thread_terminator
    .globl thread_terminator
    .type thread_terminator,function
    .thumb_func
    thread_terminator:
        svc #{kill}
        b thread_terminator
    ",
    kill = const Sysnum::ThreadKill as u32,
}

/// The Rust side of the PendSV handler, after all volatile registers have
/// been saved somewhere predictable.
#[no_mangle]
unsafe extern "C" fn pendsv_entry() {
    crate::profiling::event_secondary_syscall_enter();

    // A switch request can only originate from kernel code, which can only
    // run once the kernel state exists; a pended switch before that would
    // indicate vector-table trouble, and there is nothing useful to do.
    let _ = with_kernel(|kernel| {
        let next = crate::sched::select(kernel);
        // Safety: next comes from the thread table and we don't use it
        // again until the next kernel entry.
        unsafe {
            set_current_thread(kernel.thread(next));
        }
    });

    crate::profiling::event_secondary_syscall_exit();
}

/// Handler that gets linked into the vector table for the System Tick
/// Timer underflow interrupt.
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    crate::profiling::event_timer_isr_enter();

    let now = TICKS.load(Ordering::Relaxed).wrapping_add(1);
    TICKS.store(now, Ordering::Relaxed);

    // Run the tick accountant, then defer the actual switch: the entry
    // sequence to this ISR doesn't save state fully, for efficiency.
    let accounted = with_kernel(|kernel| {
        crate::sched::tick(kernel, Timestamp::from(now));
    });
    if accounted.is_some() {
        pend_context_switch();
    }

    crate::profiling::event_timer_isr_exit();
}

bitflags::bitflags! {
    /// Bits in the Configurable Fault Status Register.
    #[repr(transparent)]
    struct Cfsr: u32 {
        // Bits 0-7: MMFSR (Memory Management Fault Status Register)
        const IACCVIOL = 1 << 0;
        const DACCVIOL = 1 << 1;
        // MMFSR bit 2 reserved
        const MUNSTKERR = 1 << 3;
        const MSTKERR = 1 << 4;
        const MLSPERR = 1 << 5;
        // MMFSR bit 6 reserved
        const MMARVALID = 1 << 7;

        // Bits 8-15: BFSR (Bus Fault Status Register)
        const IBUSERR = 1 << (8 + 0);
        const PRECISERR = 1 << (8 + 1);
        const IMPRECISERR = 1 << (8 + 2);
        const UNSTKERR = 1 << (8 + 3);
        const STKERR = 1 << (8 + 4);
        const LSPERR = 1 << (8 + 5);
        // BFSR bit 6 reserved
        const BFARVALID = 1 << (8 + 7);

        // Bits 16-31: UFSR (Usage Fault Status Register)
        const UNDEFINSTR = 1 << (16 + 0);
        const INVSTATE = 1 << (16 + 1);
        const INVPC = 1 << (16 + 2);
        const NOCP = 1 << (16 + 3);
        // UFSR bits 4-7 reserved on ARMv7-M
        const UNALIGNED = 1 << (16 + 8);
        const DIVBYZERO = 1 << (16 + 9);
        // UFSR bits 10-31 reserved
    }
}

#[repr(u8)]
#[allow(dead_code)] // constructed by hardware, via the fault assembly
enum FaultType {
    MemoryManagement = 4,
    BusFault = 5,
    UsageFault = 6,
}

// The configurable faults share one entry sequence: save the faulter's
// context (so debuggers see it), pull the fault number out of IPSR, and
// let `handle_fault` dispose of the thread. HardFault means the kernel
// itself is off the rails; park the core where a debugger can find it.
global_asm! {"
    .section .text.im_dead
    .globl im_dead
    .type im_dead,function
    im_dead:
        @ lie down try not to cry cry a lot
        movw r0, #0xed0c
        movt r0, #0xe000
        movw r1, #0x0004
        movt r1, #0x05fa
        str.w  r1, [r0]
    1:
        b 1b

    .section .text.configurable_fault
    .globl configurable_fault
    .type configurable_fault,function
    configurable_fault:
        @ Read the current thread pointer.
        movw r0, #:lower16:CURRENT_THREAD_PTR
        movt r0, #:upper16:CURRENT_THREAD_PTR
        ldr r0, [r0]
        mrs r12, PSP

        @ To aid those who will debug what induced this fault, save the
        @ faulter's context: some of it (r0-r3, r12, LR, the return
        @ address and the xPSR) is already on its stack as part of the
        @ fault entry; store the remaining registers, plus the PSP (now in
        @ r12), plus exc_return (now in LR) into the current TCB.
        mov r2, r0
        stm r2!, {{r4-r12, lr}}

        @ Pull the fault number out of IPSR, allowing for program text to
        @ be shared across all configurable faults. (The exception number
        @ is the bottom 9 bits, but we need only look at the bottom 4 bits
        @ as this handler is only used for exceptions with numbers less
        @ than 16.)
        mrs r1, IPSR
        and r1, r1, #0xf
        bl handle_fault

        @ The current thread may have changed; reload it.
        movw r0, #:lower16:CURRENT_THREAD_PTR
        movt r0, #:upper16:CURRENT_THREAD_PTR
        ldr r0, [r0]

        @ Restore volatile registers, plus load PSP into r12
        ldm r0!, {{r4-r12, lr}}
        msr PSP, r12

        @ resume
        bx lr

    .section .text.MemoryManagement
    .globl MemoryManagement
    .type MemoryManagement,function
    MemoryManagement:
        b configurable_fault

    .section .text.BusFault
    .globl BusFault
    .type BusFault,function
    BusFault:
        b configurable_fault

    .section .text.UsageFault
    .globl UsageFault
    .type UsageFault,function
    UsageFault:
        b configurable_fault

    .section .text.HardFault
    .globl HardFault
    .type HardFault,function
    HardFault:
        b im_dead
    ",
}

/// Rust entry point for the configurable faults.
///
/// # Safety
///
/// In brief: don't call this. This is an implementation factor of the
/// fault handler assembly code and should not be used for other purposes.
#[no_mangle]
unsafe extern "C" fn handle_fault(task: *mut Thread, fault_type: FaultType) {
    // To diagnose the fault we need the System Control Block. Pull such
    // access from thin air.
    //
    // Safety: shared reference to a static-scoped Sync structure; the
    // register API is unsafe by convention only.
    let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };
    let cfsr = Cfsr::from_bits_truncate(scb.cfsr.read());

    // Who faulted? Collect some parameters from the thread.
    //
    // Safety: we trust the fault assembly to pass the current TCB. The
    // borrow is dropped immediately so it can't alias the thread table
    // obtained later.
    let (exc_return, psp, in_call) = unsafe {
        let t = &(*task);
        (t.save().exc_return, t.save().psp, t.in_kernel_call())
    };
    let from_thread_mode = exc_return & 0b1000 != 0;

    if !from_thread_mode {
        // This fault originates from the kernel itself. `in_call` tells
        // the reader whether it happened on some thread's behalf.
        panic!(
            "Kernel fault {} (in syscall: {}): \
            CFSR={:#010x}, MMFAR={:#010x}, BFAR={:#010x}",
            (fault_type as u8) as u32,
            in_call,
            cfsr.bits(),
            scb.mmfar.read(),
            scb.bfar.read(),
        );
    }

    // The fault may be **derived**: produced while stacking the frame for
    // a different exception (e.g. an SVC issued with a trashed stack
    // pointer). The original exception would then still be *pending* and
    // would fire as a phantom trap against the next thread after we
    // return. Clear the pended architectural exceptions; hardware
    // interrupts are left alone.
    //
    // Safety: SVC cannot be higher priority than this handler, which is
    // the precondition the ARMv7-M manual implies for touching SHCSR here.
    unsafe {
        scb.shcsr.modify(|bits| bits & !(0b1111 << 12));
    }

    let fault = match fault_type {
        FaultType::MemoryManagement => {
            if cfsr.contains(Cfsr::MSTKERR) {
                // An MSTKERR means the user's stack pointer is so trashed
                // that we can't even store an exception frame through it.
                FaultInfo::StackOverflow { address: psp }
            } else if cfsr.contains(Cfsr::IACCVIOL) {
                FaultInfo::IllegalText
            } else {
                FaultInfo::MemoryAccess {
                    address: if cfsr.contains(Cfsr::MMARVALID) {
                        Some(scb.mmfar.read())
                    } else {
                        None
                    },
                    source: FaultSource::User,
                }
            }
        }

        FaultType::BusFault => FaultInfo::MemoryAccess {
            address: if cfsr.contains(Cfsr::BFARVALID) {
                Some(scb.bfar.read())
            } else {
                None
            },
            source: FaultSource::User,
        },

        FaultType::UsageFault => {
            if cfsr.contains(Cfsr::DIVBYZERO) {
                FaultInfo::DivideByZero
            } else if cfsr.contains(Cfsr::UNDEFINSTR) {
                FaultInfo::IllegalInstruction
            } else {
                FaultInfo::InvalidOperation(cfsr.bits())
            }
        }
    };

    // Because we are responsible for clearing all conditions, we write
    // back the value of CFSR that we read. This is a write-one-to-clear
    // register.
    //
    // Safety: clearing recorded fault state; no memory-safety impact.
    unsafe {
        scb.cfsr.write(cfsr.bits());
    }

    // Tear the thread down and pick a successor directly -- faults on the
    // PSP can't be resolved by returning into the faulter.
    let addr = task as usize;
    let handled = with_kernel(|kernel| match kernel.index_of(addr) {
        Some(idx) if !kernel.is_reserved(idx) => {
            let _ = kernel.kill_thread(idx, Some(fault));
            let next = crate::sched::select(kernel);
            uassert!(next != idx);
            // Safety: the pointer is consumed before the next kernel
            // entry.
            unsafe {
                set_current_thread(kernel.thread(next));
            }
            true
        }
        _ => false,
    })
    .unwrap_or(false);

    if !handled {
        // A fault in the idle slot, the default slot, or before the
        // thread table exists: there is nothing left to schedule.
        crate::fail::die("memory fault in idle, default, or boot context");
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "log-semihosting")] {
        pub fn console_write(data: &[u8]) {
            if let Ok(mut out) = cortex_m_semihosting::hio::hstdout() {
                let _ = out.write_all(data);
            }
        }

        pub fn console_read(_buf: &mut [u8]) -> usize {
            // Semihosted input is not wired up; reads return end-of-file.
            0
        }
    } else if #[cfg(feature = "log-itm")] {
        pub fn console_write(data: &[u8]) {
            // Safety: stimulus port access races nothing; the kernel is
            // the only writer of port 0.
            let stim = unsafe {
                &mut (*cortex_m::peripheral::ITM::PTR).stim[0]
            };
            for &b in data {
                while !stim.is_fifo_ready() {}
                stim.write_u8(b);
            }
        }

        pub fn console_read(_buf: &mut [u8]) -> usize {
            0
        }
    } else {
        pub fn console_write(_data: &[u8]) {}

        pub fn console_read(_buf: &mut [u8]) -> usize {
            0
        }
    }
}
