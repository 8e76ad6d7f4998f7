//! Cadence ABI definitions, shared between the kernel and applications.
//!
//! Everything in this crate crosses the user/kernel boundary, so types here
//! are deliberately small, `repr`-stable, and free of kernel internals.

#![no_std]
#![forbid(unsafe_code)]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Total number of TCB slots, including the idle and default slots.
pub const MAX_SLOTS: usize = 16;

/// Slots reserved past the user threads: idle and default.
pub const RESERVED_SLOTS: usize = 2;

/// Largest `max_threads` a caller may request from `thread_init`.
pub const MAX_USER_THREADS: usize = MAX_SLOTS - RESERVED_SLOTS;

/// Capacity of the kernel mutex table.
pub const MAX_MUTEXES: usize = 32;

/// `stack_words` requests are rounded up to a power of two no smaller than
/// this.
pub const MIN_STACK_WORDS: u32 = 256;

/// Upper bound on the bytes a single carved stack pool may occupy.
pub const STACK_POOL_LIMIT: usize = 32 * 1024;

/// Sentinel for "no mutex": returned by `mutex_init` when the table is
/// exhausted, in place of a handle.
pub const MUTEX_NONE: u32 = !0;

/// Indicates priority of a thread.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so Priority 0 is the most likely to be
/// scheduled, followed by 1, and so forth. Under rate-monotonic assignment a
/// thread's static priority doubles as its TCB slot index.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means numerically
/// greater / less important, or more important / numerically smaller.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Default,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }

    /// Returns the more important (numerically smaller) of `self` and
    /// `other`. This is how a ceiling promotion combines with a thread's
    /// current priority.
    pub fn strengthen_to(self, other: Self) -> Self {
        if other.is_more_important_than(self) {
            other
        } else {
            self
        }
    }
}

/// Scheduling state of a TCB slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum ThreadState {
    /// Slot has never been (or is no longer) populated by `thread_create`.
    #[default]
    New,
    /// Thread has a released job and could be put on the CPU.
    Ready,
    /// Thread is on the CPU. Exactly one slot is in this state whenever no
    /// kernel operation is in progress.
    Running,
    /// Current job is complete; the thread re-arms at its next period
    /// boundary.
    Waiting,
    /// Thread is ineligible until the mutexes in its waiting bitmap become
    /// acquirable.
    Blocked,
    /// Thread was killed or returned; the slot may be recycled by
    /// `thread_create`.
    Done,
}

impl ThreadState {
    /// True for states that contribute to the utilization sum in the
    /// admission test, i.e. anything that has been created and not yet torn
    /// down.
    pub fn counts_for_admission(self) -> bool {
        !matches!(self, ThreadState::New | ThreadState::Done)
    }

    /// True if a release boundary re-arms a thread in this state.
    pub fn is_releasable(self) -> bool {
        matches!(
            self,
            ThreadState::Ready | ThreadState::Running | ThreadState::Waiting
        )
    }
}

/// Operation numbers carried in the `svc` instruction's immediate field.
///
/// The gaps are deliberate: the numbering is inherited from the original
/// syscall table, where the missing codes belonged to calls that no longer
/// exist.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Sysnum {
    Sbrk = 0,
    Write = 1,
    Read = 6,
    Exit = 7,
    ThreadInit = 9,
    ThreadCreate = 10,
    ThreadKill = 11,
    SchedulerStart = 12,
    MutexInit = 13,
    MutexLock = 14,
    MutexUnlock = 15,
    WaitUntilNextPeriod = 16,
    GetTime = 17,
    GetPriority = 19,
    ThreadTime = 20,
}

impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Sbrk),
            1 => Ok(Self::Write),
            6 => Ok(Self::Read),
            7 => Ok(Self::Exit),
            9 => Ok(Self::ThreadInit),
            10 => Ok(Self::ThreadCreate),
            11 => Ok(Self::ThreadKill),
            12 => Ok(Self::SchedulerStart),
            13 => Ok(Self::MutexInit),
            14 => Ok(Self::MutexLock),
            15 => Ok(Self::MutexUnlock),
            16 => Ok(Self::WaitUntilNextPeriod),
            17 => Ok(Self::GetTime),
            19 => Ok(Self::GetPriority),
            20 => Ok(Self::ThreadTime),
            _ => Err(()),
        }
    }
}

/// A record describing why a thread was torn down (or the system halted).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultInfo {
    /// The thread has violated memory access rules. This may have come from
    /// a memory protection fault while executing the thread (`source`
    /// `User`), or from checks on syscall arguments (`source` `Kernel`).
    MemoryAccess {
        /// Problematic address, when the fault reporting hardware provides
        /// one.
        address: Option<u32>,
        /// Origin of the fault.
        source: FaultSource,
    },
    /// A thread's stack pointer escaped its carved stack region.
    StackOverflow { address: u32 },
    /// Attempt to fetch an instruction from a no-execute address.
    IllegalText,
    /// Attempt to execute an instruction the processor rejected.
    IllegalInstruction,
    /// Integer division by zero (we configure the processor to trap these).
    DivideByZero,
    /// Some other processor-detected fault; the raw status bits are
    /// preserved for diagnosis.
    InvalidOperation(u32),
    /// Arguments passed to a syscall were invalid.
    SyscallUsage(UsageError),
    /// A thread locked a mutex whose declared ceiling is weaker than the
    /// thread's static priority, invalidating the blocking bound.
    CeilingViolation { mutex: u8 },
}

impl From<UsageError> for FaultInfo {
    fn from(e: UsageError) -> Self {
        Self::SyscallUsage(e)
    }
}

/// Ways in which user code can misuse the syscall interface badly enough to
/// be killed for it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UsageError {
    /// A slice argument is unaligned for its type or wraps the end of the
    /// address space. Neither is ever legal.
    InvalidSlice,
    /// The trap carried an operation number outside the syscall table.
    BadSyscallNumber,
}

/// Origin of a fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultSource {
    /// User code did something that was intercepted by the processor.
    User,
    /// User code asked the kernel to do something bad on its behalf.
    Kernel,
}
