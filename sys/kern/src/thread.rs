// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of threads: the TCB table and the kernel state value that
//! owns it.

use abi::{
    FaultInfo, Priority, ThreadState, MAX_MUTEXES, MAX_SLOTS,
    MAX_USER_THREADS, MIN_STACK_WORDS, RESERVED_SLOTS, STACK_POOL_LIMIT,
};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::admit;
use crate::arch;
use crate::mutex::{Mutex, MutexSet};
use crate::time::Timestamp;

/// The exception frame the hardware pushes onto a thread's stack on kernel
/// entry: four argument registers, a scratch register, the return address,
/// the program counter, and the saved status word. The fifth syscall
/// argument, when present, sits in the word immediately above this frame.
#[derive(Debug, Clone, Default, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct TrapFrame {
    pub(crate) r0: u32,
    pub(crate) r1: u32,
    pub(crate) r2: u32,
    pub(crate) r3: u32,
    pub(crate) r12: u32,
    pub(crate) lr: u32,
    pub(crate) pc: u32,
    pub(crate) xpsr: u32,
}

/// One carved stack region. `low` is the limit, `high` is one past the last
/// usable byte; stacks grow downward from `high`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StackExtent {
    pub low: usize,
    pub high: usize,
}

impl StackExtent {
    /// Tests whether `len` bytes starting at `addr` lie entirely inside this
    /// extent.
    pub fn covers(&self, addr: usize, len: usize) -> bool {
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        addr >= self.low && end <= self.high
    }

    /// Size of the extent in bytes.
    pub fn len(&self) -> usize {
        self.high - self.low
    }

    /// True when the extent covers no memory at all.
    pub fn is_empty(&self) -> bool {
        self.high == self.low
    }
}

/// Internal representation of a thread.
///
/// The fields of this struct are private so the rest of the kernel has to go
/// through methods that maintain the TCB invariants. The saved machine state
/// must stay the first field: the context-switch entry sequences address it
/// at offset zero through the current-thread pointer.
#[repr(C)] // so location of SavedState is predictable
#[derive(Debug)]
pub struct Thread {
    /// Saved machine state of the user program.
    save: arch::SavedState,
    // NOTE: it is critical that the above field appear first!
    /// State used to make status and scheduling decisions.
    state: ThreadState,
    /// Priority the slot was created with. Doubles as the slot index.
    static_priority: Priority,
    /// Effective priority: the static priority, possibly strengthened to the
    /// ceiling of a held mutex.
    dynamic_priority: Priority,
    /// Computation budget C, in ticks per job.
    budget: u32,
    /// Period T, in ticks. The deadline equals the period.
    period: u32,
    /// Ticks of budget remaining in the current job.
    budget_left: u32,
    /// Instant of the most recent job release.
    release_time: Timestamp,
    /// Total ticks this thread has been on the CPU, for introspection.
    elapsed: u32,
    /// Mutexes this thread currently owns.
    held_mutexes: MutexSet,
    /// Mutexes this thread is blocked on (at most one in practice).
    waiting_mutexes: MutexSet,
    /// Set while the syscall boundary is executing on this thread's behalf,
    /// so a fault taken mid-call can be attributed correctly.
    in_kernel_call: bool,
    /// Entry point the thread was created with; kept so the slot can be
    /// re-armed (idle respawn, slot recycling).
    entry_point: usize,
    /// Argument delivered in the first argument register at entry.
    argument: usize,
    /// This thread's region of the user stack pool.
    user_stack: StackExtent,
    /// This thread's region of the kernel stack pool, reserved for deep
    /// supervisor paths executed on its behalf.
    kernel_stack: StackExtent,
}

impl Thread {
    /// Creates the TCB for a slot that has not been populated by
    /// `thread_create` yet.
    pub(crate) fn unpopulated(
        user_stack: StackExtent,
        kernel_stack: StackExtent,
    ) -> Self {
        Thread {
            save: arch::SavedState::default(),
            state: ThreadState::New,
            static_priority: Priority::default(),
            dynamic_priority: Priority::default(),
            budget: 1,
            period: 1,
            budget_left: 1,
            release_time: Timestamp::default(),
            elapsed: 0,
            held_mutexes: MutexSet::EMPTY,
            waiting_mutexes: MutexSet::EMPTY,
            in_kernel_call: false,
            entry_point: 0,
            argument: 0,
            user_stack,
            kernel_stack,
        }
    }

    /// Creates the TCB for the boot context: running, with the whole user
    /// stack pool as its extent, targeting the user program's entry point.
    pub(crate) fn boot(
        user_stack: StackExtent,
        kernel_stack: StackExtent,
        entry: usize,
    ) -> Self {
        let mut t = Thread::unpopulated(user_stack, kernel_stack);
        t.entry_point = entry;
        t.state = ThreadState::Running;
        t
    }

    /// Fills in the scheduling fields for a freshly created (or recycled)
    /// slot. The caller is responsible for rebuilding the saved machine
    /// state afterwards via `arch::reinitialize`.
    pub(crate) fn populate(
        &mut self,
        entry: usize,
        argument: usize,
        priority: Priority,
        budget: u32,
        period: u32,
        now: Timestamp,
    ) {
        self.entry_point = entry;
        self.argument = argument;
        self.static_priority = priority;
        self.dynamic_priority = priority;
        self.budget = budget;
        self.period = period;
        self.budget_left = budget;
        self.release_time = now;
        self.elapsed = 0;
        self.held_mutexes = MutexSet::EMPTY;
        self.waiting_mutexes = MutexSet::EMPTY;
        self.in_kernel_call = false;
        self.state = ThreadState::Ready;
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub(crate) fn set_state(&mut self, s: ThreadState) {
        self.state = s;
    }

    pub fn static_priority(&self) -> Priority {
        self.static_priority
    }

    pub fn dynamic_priority(&self) -> Priority {
        self.dynamic_priority
    }

    pub(crate) fn set_dynamic_priority(&mut self, p: Priority) {
        self.dynamic_priority = p;
    }

    /// True while the thread runs at a mutex ceiling rather than its own
    /// static priority.
    pub fn is_promoted(&self) -> bool {
        self.dynamic_priority != self.static_priority
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    pub fn period(&self) -> u32 {
        self.period
    }

    pub fn budget_left(&self) -> u32 {
        self.budget_left
    }

    pub fn release_time(&self) -> Timestamp {
        self.release_time
    }

    pub fn elapsed(&self) -> u32 {
        self.elapsed
    }

    pub fn held_mutexes(&self) -> &MutexSet {
        &self.held_mutexes
    }

    pub(crate) fn held_mutexes_mut(&mut self) -> &mut MutexSet {
        &mut self.held_mutexes
    }

    pub fn waiting_mutexes(&self) -> &MutexSet {
        &self.waiting_mutexes
    }

    pub(crate) fn waiting_mutexes_mut(&mut self) -> &mut MutexSet {
        &mut self.waiting_mutexes
    }

    pub fn in_kernel_call(&self) -> bool {
        self.in_kernel_call
    }

    pub(crate) fn set_in_kernel_call(&mut self, v: bool) {
        self.in_kernel_call = v;
    }

    pub fn entry_point(&self) -> usize {
        self.entry_point
    }

    pub(crate) fn set_entry_point(&mut self, entry: usize) {
        self.entry_point = entry;
    }

    pub fn argument(&self) -> usize {
        self.argument
    }

    pub fn user_stack(&self) -> StackExtent {
        self.user_stack
    }

    pub fn kernel_stack(&self) -> StackExtent {
        self.kernel_stack
    }

    /// Returns a reference to the saved machine state for the thread.
    pub fn save(&self) -> &arch::SavedState {
        &self.save
    }

    /// Returns a mutable reference to the saved machine state for the
    /// thread.
    pub fn save_mut(&mut self) -> &mut arch::SavedState {
        &mut self.save
    }

    /// Accounts one tick of CPU time to this thread.
    pub(crate) fn count_tick(&mut self) {
        self.elapsed = self.elapsed.wrapping_add(1);
    }

    /// Debits one tick from the current job's budget. Returns `true` when
    /// the budget is exhausted; in that case the budget is re-armed for the
    /// next job and the caller must park the thread until its next release.
    pub(crate) fn debit_tick(&mut self) -> bool {
        self.budget_left = self.budget_left.saturating_sub(1);
        if self.budget_left == 0 {
            self.budget_left = self.budget;
            true
        } else {
            false
        }
    }

    /// Releases a new job: full budget, fresh release time, Ready.
    pub(crate) fn release(&mut self, now: Timestamp) {
        self.budget_left = self.budget;
        self.release_time = now;
        self.state = ThreadState::Ready;
    }
}

/// Interface that must be implemented by the `arch::SavedState` type. This
/// gives architecture-independent access to thread state for the rest of the
/// kernel.
///
/// Architectures implement the accessors for the snapshot of the trap frame
/// taken at syscall entry; the argument proxy methods below are derived from
/// them and just work.
pub trait ArchState: Default {
    /// Reads the thread's user stack pointer.
    fn stack_pointer(&self) -> usize;

    /// Reads syscall argument register 0.
    fn arg0(&self) -> u32;
    /// Reads syscall argument register 1.
    fn arg1(&self) -> u32;
    /// Reads syscall argument register 2.
    fn arg2(&self) -> u32;
    /// Reads syscall argument register 3.
    fn arg3(&self) -> u32;
    /// Reads the fifth argument, stacked above the trap frame.
    fn arg4(&self) -> u32;

    /// Reads the syscall operation number extracted from the trap.
    fn syscall_descriptor(&self) -> u32;

    /// Writes the syscall return value; user code sees it in the first
    /// argument register on exception return.
    fn ret0(&mut self, _: u32);

    /// Rewinds the saved program counter over the trapping `svc`
    /// instruction, so the syscall re-executes when the thread next runs.
    /// Used to retry a lock that had to block.
    fn rewind_pc(&mut self);

    /// Interprets arguments as for the `sbrk` syscall.
    fn as_sbrk_args(&self) -> SbrkArgs {
        SbrkArgs {
            increment: self.arg0() as i32,
        }
    }

    /// Interprets arguments as for the `write`/`read` syscalls.
    fn as_rw_args(&self) -> RwArgs {
        RwArgs {
            fd: self.arg0(),
            base: self.arg1() as usize,
            len: self.arg2() as usize,
        }
    }

    /// Interprets arguments as for the `exit` syscall.
    fn as_exit_args(&self) -> ExitArgs {
        ExitArgs {
            status: self.arg0(),
        }
    }

    /// Interprets arguments as for the `thread_init` syscall.
    fn as_init_args(&self) -> InitArgs {
        InitArgs {
            max_threads: self.arg0() as usize,
            stack_words: self.arg1(),
            idle_entry: self.arg2() as usize,
            max_mutexes: self.arg3() as usize,
        }
    }

    /// Interprets arguments as for the `thread_create` syscall.
    fn as_create_args(&self) -> CreateArgs {
        CreateArgs {
            entry: self.arg0() as usize,
            priority: self.arg1(),
            budget: self.arg2(),
            period: self.arg3(),
            argument: self.arg4() as usize,
        }
    }

    /// Interprets arguments as for the `scheduler_start` syscall.
    fn as_start_args(&self) -> StartArgs {
        StartArgs {
            frequency: self.arg0(),
        }
    }

    /// Interprets arguments as for the `mutex_init` syscall.
    fn as_mutex_init_args(&self) -> MutexInitArgs {
        MutexInitArgs {
            ceiling: self.arg0(),
        }
    }

    /// Interprets arguments as for the `mutex_lock`/`mutex_unlock`
    /// syscalls.
    fn as_mutex_args(&self) -> MutexArgs {
        MutexArgs {
            handle: self.arg0(),
        }
    }
}

/// Decoded arguments for the `sbrk` syscall.
#[derive(Clone, Debug)]
pub struct SbrkArgs {
    pub increment: i32,
}

/// Decoded arguments for the `write` and `read` syscalls.
#[derive(Clone, Debug)]
pub struct RwArgs {
    pub fd: u32,
    pub base: usize,
    pub len: usize,
}

/// Decoded arguments for the `exit` syscall.
#[derive(Clone, Debug)]
pub struct ExitArgs {
    pub status: u32,
}

/// Decoded arguments for the `thread_init` syscall.
#[derive(Clone, Debug)]
pub struct InitArgs {
    pub max_threads: usize,
    pub stack_words: u32,
    pub idle_entry: usize,
    pub max_mutexes: usize,
}

/// Decoded arguments for the `thread_create` syscall.
#[derive(Clone, Debug)]
pub struct CreateArgs {
    pub entry: usize,
    pub priority: u32,
    pub budget: u32,
    pub period: u32,
    pub argument: usize,
}

/// Decoded arguments for the `scheduler_start` syscall.
#[derive(Clone, Debug)]
pub struct StartArgs {
    pub frequency: u32,
}

/// Decoded arguments for the `mutex_init` syscall.
#[derive(Clone, Debug)]
pub struct MutexInitArgs {
    pub ceiling: u32,
}

/// Decoded arguments for the `mutex_lock`/`mutex_unlock` syscalls.
#[derive(Clone, Debug)]
pub struct MutexArgs {
    pub handle: u32,
}

/// Return value for operations that can have scheduling implications. This
/// is marked `must_use` because forgetting to actually update the scheduler
/// after performing an operation that requires it would be Bad.
#[derive(Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextThread {
    /// It's fine to keep running whatever thread we were just running.
    Same,
    /// We need to switch threads, but this routine has not concluded which
    /// one should now run. The scheduler needs to figure it out.
    Other,
    /// We need to switch threads, and we already know which one should run
    /// next.
    Specific(usize),
}

impl NextThread {
    pub fn combine(self, other: Self) -> Self {
        use NextThread::*; // shorthand for patterns

        match (self, other) {
            // If both agree, our job is easy.
            (x, y) if x == y => x,
            // Specific recommendations that *don't* agree get downgraded to
            // Other.
            (Specific(_), Specific(_)) => Other,
            // If only *one* is specific, it wins.
            (Specific(x), _) | (_, Specific(x)) => Specific(x),
            // Otherwise, if either suggestion says switch, switch.
            (Other, _) | (_, Other) => Other,
            // All we have left is...
            (Same, Same) => Same,
        }
    }
}

/// Parameters of `thread_init`, decoded and ready for validation.
#[derive(Clone, Debug)]
pub struct InitParams {
    pub max_threads: usize,
    pub stack_words: u32,
    pub idle_entry: usize,
    pub max_mutexes: usize,
}

/// The single kernel state value: TCB table, mutex table, and the
/// configuration that `thread_init` fixed.
///
/// Exactly one of these exists on a live system, created by `thread_init`
/// and installed into the static slot in `startup`. Unit tests build their
/// own on the stack and drive the kernel logic against it directly.
pub struct Kernel {
    pub(crate) threads: [Thread; MAX_SLOTS],
    pub(crate) mutexes: [Mutex; MAX_MUTEXES],
    /// Mutexes allocated so far; indices below this are live.
    pub(crate) mutex_count: usize,
    /// Allocation limit fixed by `thread_init`.
    pub(crate) mutex_limit: usize,
    /// Number of user slots; idle and default sit just past them.
    pub(crate) user_slots: usize,
    /// Per-thread stack size, in words, after rounding.
    pub(crate) stack_words: u32,
    /// Index of the thread currently on the CPU.
    pub(crate) current: usize,
    /// Set once `scheduler_start` has configured the tick source.
    pub(crate) started: bool,
}

impl Kernel {
    /// Validates `thread_init` parameters and builds the kernel state:
    /// carves the two stack pools into `max_threads + 2` regions top-down,
    /// seeds every slot `New`, arms the idle slot, and adopts the caller as
    /// the default slot.
    pub fn new(p: InitParams) -> Result<Self, ()> {
        if p.max_threads == 0 || p.max_threads > MAX_USER_THREADS {
            return Err(());
        }
        if p.max_mutexes > MAX_MUTEXES {
            return Err(());
        }

        let stack_words = p
            .stack_words
            .max(MIN_STACK_WORDS)
            .checked_next_power_of_two()
            .ok_or(())?;
        let stack_bytes =
            (stack_words as usize).checked_mul(4).ok_or(())?;
        let regions = p.max_threads + RESERVED_SLOTS;
        let total = regions.checked_mul(stack_bytes).ok_or(())?;

        let user_pool = arch::user_stack_pool();
        let kernel_pool = arch::kernel_stack_pool();
        if total > STACK_POOL_LIMIT
            || total > user_pool.len()
            || total > kernel_pool.len()
        {
            return Err(());
        }

        // Carve both pools top-down: slot 0 gets the topmost region.
        let carve = |pool: StackExtent, i: usize| StackExtent {
            low: pool.high - (i + 1) * stack_bytes,
            high: pool.high - i * stack_bytes,
        };

        let mut threads: [Thread; MAX_SLOTS] = core::array::from_fn(|i| {
            if i < regions {
                Thread::unpopulated(carve(user_pool, i), carve(kernel_pool, i))
            } else {
                Thread::unpopulated(
                    StackExtent::default(),
                    StackExtent::default(),
                )
            }
        });

        let idle = p.max_threads;
        let default = p.max_threads + 1;

        // The idle slot is always runnable: it soaks up time while periodic
        // jobs wait for their next release.
        let idle_entry = if p.idle_entry != 0 {
            p.idle_entry
        } else {
            arch::default_idle_entry()
        };
        threads[idle].populate(
            idle_entry,
            0,
            Priority(idle as u8),
            1,
            1,
            Timestamp::default(),
        );
        arch::reinitialize(&mut threads[idle]);

        // The default slot is the caller's own context: it is running right
        // now, and its machine state arrives by copy once this state value
        // is installed. It predates the carve, so its frames live wherever
        // the boot stack was placed -- let it keep the whole pool.
        threads[default].populate(
            0,
            0,
            Priority(default as u8),
            1,
            1,
            Timestamp::default(),
        );
        threads[default].set_state(ThreadState::Running);
        threads[default].user_stack = user_pool;

        Ok(Kernel {
            threads,
            mutexes: core::array::from_fn(|i| Mutex::unallocated(i as u8)),
            mutex_count: 0,
            mutex_limit: p.max_mutexes,
            user_slots: p.max_threads,
            stack_words,
            current: default,
            started: false,
        })
    }

    /// Number of user slots (the `max_threads` argument of `thread_init`).
    pub fn user_slots(&self) -> usize {
        self.user_slots
    }

    /// Index of the idle slot.
    pub fn idle_index(&self) -> usize {
        self.user_slots
    }

    /// Index of the default slot.
    pub fn default_index(&self) -> usize {
        self.user_slots + 1
    }

    /// True for the idle and default slots, which are never killed, debited,
    /// or released.
    pub fn is_reserved(&self, index: usize) -> bool {
        index >= self.user_slots
    }

    pub fn thread(&self, index: usize) -> &Thread {
        &self.threads[index]
    }

    pub fn thread_mut(&mut self, index: usize) -> &mut Thread {
        &mut self.threads[index]
    }

    /// Index of the thread currently on the CPU.
    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// Translates a pointer into the TCB table back into a slot index. Used
    /// by the syscall entry sequence, which receives the current thread by
    /// pointer.
    pub fn index_of(&self, addr: usize) -> Option<usize> {
        let base = self.threads.as_ptr() as usize;
        let size = core::mem::size_of::<Thread>();
        if addr < base {
            return None;
        }
        let offset = addr - base;
        if offset % size != 0 {
            return None;
        }
        let index = offset / size;
        if index < self.user_slots + RESERVED_SLOTS {
            Some(index)
        } else {
            None
        }
    }

    /// Implementation of `thread_create`: validates the priority and slot,
    /// runs the admission test, and arms the slot with a fresh job and a
    /// fabricated initial frame.
    pub fn create_thread(
        &mut self,
        entry: usize,
        argument: usize,
        priority: u32,
        budget: u32,
        period: u32,
        now: Timestamp,
    ) -> Result<(), ()> {
        let slot = priority as usize;
        if slot >= self.user_slots {
            return Err(());
        }
        // A slot that is anywhere in its lifecycle other than New/Done is
        // occupied.
        if self.threads[slot].state().counts_for_admission() {
            return Err(());
        }
        if budget == 0 || period == 0 || budget > period {
            return Err(());
        }
        if !admit::acceptable(
            &self.threads[..self.user_slots],
            budget,
            period,
        ) {
            return Err(());
        }

        self.threads[slot].populate(
            entry,
            argument,
            Priority(priority as u8),
            budget,
            period,
            now,
        );
        arch::reinitialize(&mut self.threads[slot]);
        Ok(())
    }

    /// Tears a thread down: releases anything it holds, marks the slot
    /// `Done`, and asks for a reschedule. Callers must not pass the idle or
    /// default slots; those are handled specially (respawn and exit,
    /// respectively).
    pub fn kill_thread(
        &mut self,
        index: usize,
        fault: Option<FaultInfo>,
    ) -> NextThread {
        uassert!(!self.is_reserved(index));

        match fault {
            Some(f) => klog!("thread @{} killed: {:?}", index, f),
            None => klog!("thread @{} done", index),
        }

        crate::mutex::release_all(self, index);
        let t = &mut self.threads[index];
        t.waiting_mutexes = MutexSet::EMPTY;
        t.set_state(ThreadState::Done);
        NextThread::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(max_threads: usize, stack_words: u32) -> InitParams {
        InitParams {
            max_threads,
            stack_words,
            idle_entry: 0,
            max_mutexes: 4,
        }
    }

    #[test]
    fn init_rejects_too_many_threads() {
        assert!(Kernel::new(params(MAX_USER_THREADS + 1, 256)).is_err());
        assert!(Kernel::new(params(0, 256)).is_err());
        assert!(Kernel::new(params(MAX_USER_THREADS, 256)).is_ok());
    }

    #[test]
    fn init_rejects_oversize_stacks() {
        // 16 regions of 1024 words is 64 KiB, past the pool limit.
        assert!(Kernel::new(params(MAX_USER_THREADS, 1024)).is_err());
        // Absurd requests must not panic in the rounding math.
        assert!(Kernel::new(params(2, u32::MAX)).is_err());
    }

    #[test]
    fn stack_words_round_up() {
        let k = Kernel::new(params(2, 100)).unwrap();
        assert_eq!(k.stack_words, 256);
        let k = Kernel::new(params(2, 300)).unwrap();
        assert_eq!(k.stack_words, 512);
        let k = Kernel::new(params(2, 256)).unwrap();
        assert_eq!(k.stack_words, 256);
    }

    #[test]
    fn carve_is_top_down_and_disjoint() {
        let k = Kernel::new(params(3, 256)).unwrap();
        let pool = arch::user_stack_pool();
        let bytes = 256 * 4;
        for i in 0..3 {
            let ext = k.thread(i).user_stack();
            assert_eq!(ext.high, pool.high - i * bytes);
            assert_eq!(ext.len(), bytes);
            let kext = k.thread(i).kernel_stack();
            assert_eq!(kext.len(), bytes);
        }
        // Thread 0 sits above thread 1.
        assert_eq!(k.thread(0).user_stack().low, k.thread(1).user_stack().high);
    }

    #[test]
    fn init_seeds_idle_and_default() {
        let k = Kernel::new(params(3, 256)).unwrap();
        assert_eq!(k.idle_index(), 3);
        assert_eq!(k.default_index(), 4);
        assert_eq!(k.thread(3).state(), ThreadState::Ready);
        assert_eq!(k.thread(3).static_priority(), Priority(3));
        assert_eq!(k.thread(3).budget(), 1);
        assert_eq!(k.thread(3).period(), 1);
        assert_eq!(k.thread(4).state(), ThreadState::Running);
        assert_eq!(k.current_index(), 4);
        for i in 0..3 {
            assert_eq!(k.thread(i).state(), ThreadState::New);
        }
    }

    #[test]
    fn create_validates_priority_and_slot() {
        let mut k = Kernel::new(params(2, 256)).unwrap();
        let now = Timestamp::default();
        // Priority beyond the user slots, including the idle/default slots.
        assert!(k.create_thread(0x1000, 0, 2, 10, 100, now).is_err());
        assert!(k.create_thread(0x1000, 0, 1, 10, 100, now).is_ok());
        // Busy slot.
        assert!(k.create_thread(0x1000, 0, 1, 10, 100, now).is_err());
        // Degenerate timing parameters.
        assert!(k.create_thread(0x1000, 0, 0, 0, 100, now).is_err());
        assert!(k.create_thread(0x1000, 0, 0, 10, 0, now).is_err());
        assert!(k.create_thread(0x1000, 0, 0, 101, 100, now).is_err());
    }

    #[test]
    fn create_arms_slot_and_frame() {
        let mut k = Kernel::new(params(2, 256)).unwrap();
        let now = Timestamp::from(7);
        k.create_thread(0x1000, 0xBEEF, 0, 10, 100, now).unwrap();
        let t = k.thread(0);
        assert_eq!(t.state(), ThreadState::Ready);
        assert_eq!(t.static_priority(), Priority(0));
        assert_eq!(t.dynamic_priority(), Priority(0));
        assert_eq!(t.budget_left(), 10);
        assert_eq!(t.release_time(), now);
        // The fabricated frame enters the thread function in thumb mode with
        // the argument in the first argument register.
        assert_eq!(t.save().frame().pc, 0x1001);
        assert_eq!(t.save().frame().r0, 0xBEEF);
        assert!(t
            .user_stack()
            .covers(t.save().stack_pointer(), core::mem::size_of::<TrapFrame>()));
    }

    #[test]
    fn done_slot_can_be_recycled() {
        let mut k = Kernel::new(params(2, 256)).unwrap();
        let now = Timestamp::default();
        k.create_thread(0x1000, 0, 0, 10, 100, now).unwrap();
        let _ = k.kill_thread(0, None);
        assert_eq!(k.thread(0).state(), ThreadState::Done);
        k.create_thread(0x2000, 0, 0, 20, 100, now).unwrap();
        let t = k.thread(0);
        assert_eq!(t.state(), ThreadState::Ready);
        assert_eq!(t.budget(), 20);
        assert_eq!(t.budget_left(), 20);
        assert_eq!(t.elapsed(), 0);
    }

    #[test]
    fn index_of_translates_table_pointers() {
        let k = Kernel::new(params(2, 256)).unwrap();
        for i in 0..4 {
            let addr = k.thread(i) as *const _ as usize;
            assert_eq!(k.index_of(addr), Some(i));
        }
        assert_eq!(k.index_of(0), None);
        let mid = k.thread(0) as *const _ as usize + 1;
        assert_eq!(k.index_of(mid), None);
    }

    #[test]
    fn next_thread_combine() {
        use NextThread::*;
        assert_eq!(Same.combine(Same), Same);
        assert_eq!(Same.combine(Other), Other);
        assert_eq!(Specific(3).combine(Same), Specific(3));
        assert_eq!(Specific(3).combine(Specific(3)), Specific(3));
        assert_eq!(Specific(3).combine(Specific(4)), Other);
    }
}
