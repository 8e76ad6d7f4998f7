// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mutexes under the Immediate Priority Ceiling Protocol.
//!
//! Every mutex declares, at allocation time, the most important priority
//! that will ever request it -- its *ceiling*. On acquisition the owner's
//! dynamic priority is immediately strengthened to the ceiling, which both
//! prevents any more-important-but-ineligible thread from preempting the
//! critical section and bounds blocking to the longest single critical
//! section of any less important user.
//!
//! A lock that cannot be granted parks the caller in `Blocked` with the
//! mutex recorded in its waiting bitmap, and rewinds the saved program
//! counter over the trapping instruction. When an unlock clears the waiting
//! bit, the scheduler re-admits the thread and the syscall re-executes,
//! re-running the acquisition rule from scratch. Arbitration between
//! several simultaneously woken waiters therefore falls out of the priority
//! rule: the most important waiter re-traps first and wins.

use abi::{FaultInfo, Priority, ThreadState, MAX_MUTEXES, MUTEX_NONE};

use crate::thread::{ArchState, Kernel, NextThread};

/// A fixed-width set of mutex indices, kept per thread for both held and
/// awaited mutexes.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct MutexSet(u32);

impl MutexSet {
    pub const EMPTY: Self = MutexSet(0);

    pub fn contains(&self, index: usize) -> bool {
        self.0 & (1 << index) != 0
    }

    pub fn insert(&mut self, index: usize) {
        self.0 |= 1 << index;
    }

    pub fn remove(&mut self, index: usize) {
        self.0 &= !(1 << index);
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterates the indices present in the set, in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let bits = self.0;
        (0..MAX_MUTEXES).filter(move |i| bits & (1 << i) != 0)
    }
}

/// One entry of the kernel mutex table.
#[derive(Copy, Clone, Debug)]
pub struct Mutex {
    /// The declared ceiling: the most important priority that may ever
    /// request this mutex. Fixed at allocation.
    ceiling: Priority,
    /// Owning thread, if any.
    owner: Option<usize>,
    /// This entry's index, immutable once allocated. Doubles as the handle
    /// given to user code.
    index: u8,
}

impl Mutex {
    pub(crate) fn unallocated(index: u8) -> Self {
        Mutex {
            ceiling: Priority(0),
            owner: None,
            index,
        }
    }

    pub fn ceiling(&self) -> Priority {
        self.ceiling
    }

    pub fn owner(&self) -> Option<usize> {
        self.owner
    }

    pub fn index(&self) -> u8 {
        self.index
    }
}

/// Allocates the next free mutex with the given ceiling. Returns the handle,
/// or `MUTEX_NONE` if the configured table is exhausted.
pub fn init(kernel: &mut Kernel, ceiling: u32) -> u32 {
    if kernel.mutex_count >= kernel.mutex_limit {
        klog!("mutex_init: table exhausted ({} in use)", kernel.mutex_count);
        return MUTEX_NONE;
    }
    let index = kernel.mutex_count;
    kernel.mutexes[index] = Mutex {
        ceiling: Priority(ceiling.min(u8::MAX as u32) as u8),
        owner: None,
        index: index as u8,
    };
    kernel.mutex_count += 1;
    index as u32
}

/// Implementation of `mutex_lock`.
pub fn lock(kernel: &mut Kernel, caller: usize, handle: u32) -> NextThread {
    let Some(index) = resolve(kernel, handle) else {
        klog!("mutex_lock: bad handle {:#x}", handle);
        return NextThread::Same;
    };
    let ceiling = kernel.mutexes[index].ceiling;

    // A caller more important than the declared ceiling invalidates the
    // blocking bound for every other user of the mutex. That is not a
    // recoverable mistake: the offender is killed.
    if kernel.threads[caller]
        .static_priority()
        .is_more_important_than(ceiling)
    {
        klog!(
            "thread @{} violated ceiling {} of mutex {}",
            caller,
            ceiling.0,
            index
        );
        if kernel.is_reserved(caller) {
            // The idle and default slots are infrastructure; refuse the
            // lock but leave them standing.
            return NextThread::Same;
        }
        return kernel.kill_thread(
            caller,
            Some(FaultInfo::CeilingViolation {
                mutex: index as u8,
            }),
        );
    }

    if kernel.threads[caller].held_mutexes().contains(index) {
        klog!("thread @{} locked mutex {} twice", caller, index);
        return NextThread::Same;
    }

    if acquirable(kernel, caller, index) {
        acquire(kernel, caller, index);
        NextThread::Same
    } else {
        let t = kernel.thread_mut(caller);
        t.set_state(ThreadState::Blocked);
        t.waiting_mutexes_mut().insert(index);
        // Re-execute the trapping instruction when this thread next runs,
        // so the acquisition is retried under the rule above.
        t.save_mut().rewind_pc();
        NextThread::Other
    }
}

/// Implementation of `mutex_unlock`.
pub fn unlock(kernel: &mut Kernel, caller: usize, handle: u32) -> NextThread {
    let Some(index) = resolve(kernel, handle) else {
        klog!("mutex_unlock: bad handle {:#x}", handle);
        return NextThread::Same;
    };

    if kernel.mutexes[index].owner != Some(caller)
        || !kernel.threads[caller].held_mutexes().contains(index)
    {
        klog!(
            "thread @{} unlocked mutex {} it does not hold",
            caller,
            index
        );
        return NextThread::Same;
    }

    kernel.mutexes[index].owner = None;
    kernel.threads[caller].held_mutexes_mut().remove(index);
    restore_priority(kernel, caller);

    // Wake everyone parked on this mutex. The scheduler's unblock pass
    // re-admits them, and their rewound program counters re-run the
    // acquisition rule; the new owner is whoever re-traps first, i.e. the
    // most important of them.
    for t in &mut kernel.threads {
        t.waiting_mutexes_mut().remove(index);
    }

    NextThread::Other
}

/// Releases everything `index` holds, on its way out. Waiters are woken as
/// for a normal unlock.
pub(crate) fn release_all(kernel: &mut Kernel, index: usize) {
    let held = *kernel.threads[index].held_mutexes();
    if held.is_empty() {
        return;
    }
    klog!("thread @{} released its mutexes on teardown", index);
    for m in held.iter() {
        kernel.mutexes[m].owner = None;
        for t in &mut kernel.threads {
            t.waiting_mutexes_mut().remove(m);
        }
    }
    let t = kernel.thread_mut(index);
    *t.held_mutexes_mut() = MutexSet::EMPTY;
    let restored = t.static_priority();
    t.set_dynamic_priority(restored);
}

/// Maps a user-supplied handle back to a live table index.
fn resolve(kernel: &Kernel, handle: u32) -> Option<usize> {
    let index = handle as usize;
    if index < kernel.mutex_count && kernel.mutexes[index].index as usize == index
    {
        Some(index)
    } else {
        None
    }
}

/// The IPCP acquisition rule: `index` must be free, and no *other* thread
/// may hold a mutex whose ceiling is at least as important as the caller's
/// current dynamic priority.
fn acquirable(kernel: &Kernel, caller: usize, index: usize) -> bool {
    if kernel.mutexes[index].owner.is_some() {
        return false;
    }
    let dynamic = kernel.threads[caller].dynamic_priority();
    kernel.mutexes[..kernel.mutex_count].iter().all(|m| {
        match m.owner {
            // Our own holdings never gate us, and a ceiling strictly weaker
            // than our current priority cannot either.
            Some(owner) => {
                owner == caller || dynamic.is_more_important_than(m.ceiling)
            }
            None => true,
        }
    })
}

fn acquire(kernel: &mut Kernel, caller: usize, index: usize) {
    kernel.mutexes[index].owner = Some(caller);
    let ceiling = kernel.mutexes[index].ceiling;
    let t = kernel.thread_mut(caller);
    t.held_mutexes_mut().insert(index);
    t.waiting_mutexes_mut().remove(index);
    let promoted = t.dynamic_priority().strengthen_to(ceiling);
    t.set_dynamic_priority(promoted);
}

/// Recomputes a thread's dynamic priority from its static priority and the
/// ceilings it still holds.
fn restore_priority(kernel: &mut Kernel, caller: usize) {
    let held = *kernel.threads[caller].held_mutexes();
    let mut p = kernel.threads[caller].static_priority();
    for m in held.iter() {
        p = p.strengthen_to(kernel.mutexes[m].ceiling);
    }
    kernel.thread_mut(caller).set_dynamic_priority(p);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{InitParams, Kernel};
    use crate::time::Timestamp;

    /// Three threads at priorities 0..=2, plenty of slack for the admission
    /// test.
    fn kernel() -> Kernel {
        let mut k = Kernel::new(InitParams {
            max_threads: 3,
            stack_words: 256,
            idle_entry: 0,
            max_mutexes: 4,
        })
        .unwrap();
        let now = Timestamp::default();
        for prio in 0..3 {
            k.create_thread(0x1000, 0, prio, 10, 100 * (prio + 1), now)
                .unwrap();
        }
        k
    }

    #[test]
    fn init_allocates_stable_indices() {
        let mut k = kernel();
        assert_eq!(init(&mut k, 0), 0);
        assert_eq!(init(&mut k, 1), 1);
        assert_eq!(k.mutexes[0].index(), 0);
        assert_eq!(k.mutexes[1].index(), 1);
        assert_eq!(k.mutexes[1].ceiling(), Priority(1));
    }

    #[test]
    fn init_exhaustion_returns_null() {
        let mut k = kernel();
        for i in 0..4 {
            assert_eq!(init(&mut k, 2), i);
        }
        assert_eq!(init(&mut k, 2), MUTEX_NONE);
    }

    #[test]
    fn lock_unlock_round_trip() {
        let mut k = kernel();
        let m = init(&mut k, 1);

        let before_dyn = k.thread(2).dynamic_priority();
        let before_held = *k.thread(2).held_mutexes();

        assert_eq!(lock(&mut k, 2, m), NextThread::Same);
        assert_eq!(k.mutexes[0].owner(), Some(2));
        assert!(k.thread(2).held_mutexes().contains(0));
        // Promotion to the ceiling is immediate.
        assert_eq!(k.thread(2).dynamic_priority(), Priority(1));
        assert!(k.thread(2).is_promoted());

        assert_eq!(unlock(&mut k, 2, m), NextThread::Other);
        assert_eq!(k.mutexes[0].owner(), None);
        assert_eq!(k.thread(2).dynamic_priority(), before_dyn);
        assert_eq!(*k.thread(2).held_mutexes(), before_held);
        assert!(!k.thread(2).is_promoted());
    }

    #[test]
    fn nested_unlock_restores_remaining_ceiling() {
        let mut k = kernel();
        let m1 = init(&mut k, 1);
        let m0 = init(&mut k, 0);

        let _ = lock(&mut k, 2, m1);
        assert_eq!(k.thread(2).dynamic_priority(), Priority(1));
        let _ = lock(&mut k, 2, m0);
        assert_eq!(k.thread(2).dynamic_priority(), Priority(0));

        // Dropping the inner mutex falls back to the outer ceiling, not to
        // the static priority.
        let _ = unlock(&mut k, 2, m0);
        assert_eq!(k.thread(2).dynamic_priority(), Priority(1));
        let _ = unlock(&mut k, 2, m1);
        assert_eq!(k.thread(2).dynamic_priority(), Priority(2));
    }

    #[test]
    fn double_lock_is_a_noop_with_warning() {
        let mut k = kernel();
        let m = init(&mut k, 1);
        let _ = lock(&mut k, 2, m);
        let held = *k.thread(2).held_mutexes();
        let dynamic = k.thread(2).dynamic_priority();

        assert_eq!(lock(&mut k, 2, m), NextThread::Same);
        assert_eq!(*k.thread(2).held_mutexes(), held);
        assert_eq!(k.thread(2).dynamic_priority(), dynamic);
        assert_eq!(k.mutexes[0].owner(), Some(2));
    }

    #[test]
    fn double_unlock_is_a_noop_with_warning() {
        let mut k = kernel();
        let m = init(&mut k, 1);
        let _ = lock(&mut k, 2, m);
        let _ = unlock(&mut k, 2, m);

        let dynamic = k.thread(2).dynamic_priority();
        assert_eq!(unlock(&mut k, 2, m), NextThread::Same);
        assert_eq!(k.thread(2).dynamic_priority(), dynamic);
        assert!(k.thread(2).held_mutexes().is_empty());
    }

    #[test]
    fn foreign_unlock_is_a_noop() {
        let mut k = kernel();
        let m = init(&mut k, 0);
        let _ = lock(&mut k, 2, m);
        assert_eq!(unlock(&mut k, 1, m), NextThread::Same);
        assert_eq!(k.mutexes[0].owner(), Some(2));
        assert!(k.thread(2).held_mutexes().contains(0));
    }

    #[test]
    fn bad_handle_is_a_noop() {
        let mut k = kernel();
        assert_eq!(lock(&mut k, 0, 17), NextThread::Same);
        assert_eq!(unlock(&mut k, 0, MUTEX_NONE), NextThread::Same);
    }

    #[test]
    fn ceiling_violation_kills_the_caller() {
        let mut k = kernel();
        let m = init(&mut k, 1);
        // Thread 0 is more important than the declared ceiling.
        assert_eq!(lock(&mut k, 0, m), NextThread::Other);
        assert_eq!(k.thread(0).state(), ThreadState::Done);
        assert_eq!(k.mutexes[0].owner(), None);
        assert!(k.thread(0).held_mutexes().is_empty());
    }

    #[test]
    fn contended_lock_blocks_and_rewinds() {
        let mut k = kernel();
        let m = init(&mut k, 1);
        let _ = lock(&mut k, 2, m);

        let pc_before = k.thread(1).save().frame().pc;
        assert_eq!(lock(&mut k, 1, m), NextThread::Other);
        let t = k.thread(1);
        assert_eq!(t.state(), ThreadState::Blocked);
        assert!(t.waiting_mutexes().contains(0));
        assert_eq!(t.save().frame().pc, pc_before.wrapping_sub(2));
        assert_eq!(k.mutexes[0].owner(), Some(2));
    }

    #[test]
    fn system_ceiling_gates_unrelated_mutexes() {
        let mut k = kernel();
        let m1 = init(&mut k, 1);
        let m0 = init(&mut k, 0);

        // Thread 2 is inside a ceiling-1 critical section.
        let _ = lock(&mut k, 2, m1);

        // Thread 1 asks for a completely free mutex, but a mutex with a
        // ceiling at least as important as thread 1 is held elsewhere, so
        // IPCP refuses the grant.
        assert_eq!(lock(&mut k, 1, m0), NextThread::Other);
        assert_eq!(k.thread(1).state(), ThreadState::Blocked);
        assert_eq!(k.mutexes[m0 as usize].owner(), None);

        // Thread 0 is *more* important than every held ceiling, so the same
        // request sails through.
        let _ = unlock(&mut k, 2, m1);
        let _ = lock(&mut k, 0, m0);
        assert_eq!(k.mutexes[m0 as usize].owner(), Some(0));
    }

    #[test]
    fn unlock_wakes_waiters_for_retry() {
        let mut k = kernel();
        let m = init(&mut k, 1);
        let _ = lock(&mut k, 2, m);
        let _ = lock(&mut k, 1, m);
        assert!(k.thread(1).waiting_mutexes().contains(0));

        let _ = unlock(&mut k, 2, m);
        // The waiting bit is cleared; the scheduler will re-admit thread 1
        // and the rewound pc re-executes the lock, which now succeeds.
        assert!(k.thread(1).waiting_mutexes().is_empty());
        assert_eq!(lock(&mut k, 1, m), NextThread::Same);
        assert_eq!(k.mutexes[0].owner(), Some(1));
    }

    #[test]
    fn release_all_frees_holdings_and_waiters() {
        let mut k = kernel();
        let m1 = init(&mut k, 1);
        let m2 = init(&mut k, 2);
        let _ = lock(&mut k, 2, m2);
        let _ = lock(&mut k, 1, m1);
        let _ = lock(&mut k, 2, m1); // blocks: m1 is owned by thread 1

        let _ = k.kill_thread(1, None);
        assert_eq!(k.mutexes[m1 as usize].owner(), None);
        assert!(k.thread(2).waiting_mutexes().is_empty());
        // Thread 2 still holds its own mutex.
        assert_eq!(k.mutexes[m2 as usize].owner(), Some(2));
    }
}
