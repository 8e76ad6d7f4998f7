// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler and the tick accountant.
//!
//! Both run with the kernel state exclusively borrowed, from the context
//! switch and tick exceptions respectively. Neither is ever re-entered: the
//! kernel's exception priorities put the tick handler and the switch
//! trampoline at the same level, so their bodies tail-chain instead of
//! nesting.

use abi::ThreadState;

use crate::thread::Kernel;
use crate::time::Timestamp;

/// Selects the next thread to run and marks it `Running`.
///
/// Pass structure:
///
/// 1. Threads whose blocking mutexes have all been released come back to
///    `Ready`.
/// 2. Whatever was `Running` is demoted to `Ready` so it competes on equal
///    terms. (At most one thread is running, but the loop is written
///    defensively.)
/// 3. Among `Ready` user threads with no pending mutex waits, the one with
///    the most important dynamic priority wins. A tie can only arise
///    between a ceiling-promoted thread and the static owner of that
///    priority; it goes to the promoted thread, since preempting it would
///    re-open the very inversion the ceiling exists to prevent. Remaining
///    comparisons fall to the smallest index, which the ascending scan
///    gives us for free.
/// 4. With no user thread eligible: the idle slot runs if anyone is parked
///    (`Waiting`/`Blocked`), otherwise everything is torn down and the
///    default slot -- the context that called `scheduler_start` -- resumes.
///
/// The scheduler never touches budgets or timers; those belong to `tick`.
pub fn select(kernel: &mut Kernel) -> usize {
    let user = kernel.user_slots();

    for i in 0..user {
        let t = kernel.thread_mut(i);
        if t.state() == ThreadState::Blocked && t.waiting_mutexes().is_empty()
        {
            t.set_state(ThreadState::Ready);
        }
    }

    for i in 0..user + abi::RESERVED_SLOTS {
        let t = kernel.thread_mut(i);
        if t.state() == ThreadState::Running {
            t.set_state(ThreadState::Ready);
        }
    }

    let mut choice: Option<usize> = None;
    for i in 0..user {
        let t = kernel.thread(i);
        if t.state() != ThreadState::Ready || !t.waiting_mutexes().is_empty()
        {
            continue;
        }
        match choice {
            None => choice = Some(i),
            Some(best) => {
                let b = kernel.thread(best);
                let more_important = t
                    .dynamic_priority()
                    .is_more_important_than(b.dynamic_priority());
                let wins_tie = t.dynamic_priority() == b.dynamic_priority()
                    && t.is_promoted()
                    && !b.is_promoted();
                if more_important || wins_tie {
                    choice = Some(i);
                }
            }
        }
    }

    let next = choice.unwrap_or_else(|| {
        let parked = (0..user).any(|i| {
            matches!(
                kernel.thread(i).state(),
                ThreadState::Waiting | ThreadState::Blocked
            )
        });
        if parked {
            kernel.idle_index()
        } else {
            kernel.default_index()
        }
    });

    kernel.thread_mut(next).set_state(ThreadState::Running);
    kernel.current = next;
    next
}

/// The tick accountant, run on every tick of the tick source, before the
/// deferred context switch is requested.
///
/// Ordering matters: the budget debit runs before the release pass, so a
/// thread that exhausts its budget on the same tick that opens its next
/// period comes out `Ready` with a full budget, not parked.
pub fn tick(kernel: &mut Kernel, now: Timestamp) {
    let current = kernel.current_index();
    kernel.thread_mut(current).count_tick();

    // Budgets apply to user slots only; the idle and default slots soak up
    // time without limit.
    if !kernel.is_reserved(current) {
        let t = kernel.thread_mut(current);
        if t.debit_tick() {
            // Budget exhausted: the job is over whether it likes it or not.
            // This is the strict reading -- truncating overruns is what
            // keeps the admission argument sound.
            if !t.held_mutexes().is_empty() {
                klog!(
                    "thread @{} exhausted its budget holding mutexes",
                    current
                );
            }
            t.set_state(ThreadState::Waiting);
        }
    }

    // Release pass: re-arm every user thread whose period opens now. The
    // release is idempotent -- a thread that missed its deadline just has
    // its job replaced by the new one.
    for i in 0..kernel.user_slots() {
        let t = kernel.thread_mut(i);
        if t.state().is_releasable() && now.is_release_for(t.period()) {
            t.release(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutex;
    use crate::thread::{InitParams, Kernel};

    fn kernel(max_threads: usize) -> Kernel {
        Kernel::new(InitParams {
            max_threads,
            stack_words: 256,
            idle_entry: 0,
            max_mutexes: 4,
        })
        .unwrap()
    }

    /// Steps the kernel the way the hardware does: the current thread runs
    /// for the tick, the accountant charges it, and the trampoline picks a
    /// successor. Returns the thread that ran during the tick.
    fn step(k: &mut Kernel, t: u32) -> usize {
        let ran = k.current_index();
        tick(k, Timestamp::from(t));
        select(k);
        ran
    }

    #[test]
    fn fallback_prefers_idle_then_default() {
        let mut k = kernel(2);
        // Nothing created: no user thread is parked, so the default slot
        // keeps the CPU.
        assert_eq!(select(&mut k), k.default_index());

        // A waiting thread means work is pending; idle soaks up the gap.
        k.create_thread(0x1000, 0, 0, 10, 100, Timestamp::default())
            .unwrap();
        k.thread_mut(0).set_state(ThreadState::Waiting);
        assert_eq!(select(&mut k), k.idle_index());

        // Once it is torn down, the default slot resumes.
        let _ = k.kill_thread(0, None);
        assert_eq!(select(&mut k), k.default_index());
    }

    #[test]
    fn selection_is_by_dynamic_priority() {
        let mut k = kernel(3);
        let now = Timestamp::default();
        k.create_thread(0x1000, 0, 1, 10, 100, now).unwrap();
        k.create_thread(0x1000, 0, 2, 10, 100, now).unwrap();
        assert_eq!(select(&mut k), 1);
        // The running thread is demoted and re-selected; stable.
        assert_eq!(select(&mut k), 1);

        k.create_thread(0x1000, 0, 0, 10, 100, now).unwrap();
        assert_eq!(select(&mut k), 0);
    }

    #[test]
    fn promoted_thread_wins_its_ceiling_tie() {
        let mut k = kernel(3);
        let now = Timestamp::default();
        for prio in 0..3 {
            k.create_thread(0x1000, 0, prio, 10, 1000, now).unwrap();
        }
        let m0 = mutex::init(&mut k, 0);
        // Thread 2 enters a ceiling-0 critical section.
        let _ = mutex::lock(&mut k, 2, m0);
        assert_eq!(k.thread(2).dynamic_priority(), abi::Priority(0));

        // Thread 0 is Ready at the same dynamic priority, but must not
        // preempt the promoted holder.
        assert_eq!(select(&mut k), 2);

        let _ = mutex::unlock(&mut k, 2, m0);
        assert_eq!(select(&mut k), 0);
    }

    #[test]
    fn budget_exhaustion_parks_the_thread() {
        let mut k = kernel(2);
        k.create_thread(0x1000, 0, 0, 3, 100, Timestamp::default())
            .unwrap();
        select(&mut k);
        assert_eq!(k.current_index(), 0);

        for t in 1..=2 {
            tick(&mut k, Timestamp::from(t));
            assert_eq!(k.thread(0).state(), ThreadState::Running);
        }
        tick(&mut k, Timestamp::from(3));
        // Hard budget: the job is over, the budget is re-armed for the next
        // release.
        assert_eq!(k.thread(0).state(), ThreadState::Waiting);
        assert_eq!(k.thread(0).budget_left(), 3);
        assert_eq!(k.thread(0).elapsed(), 3);
        assert_eq!(select(&mut k), k.idle_index());
    }

    #[test]
    fn release_follows_debit_on_a_shared_boundary() {
        let mut k = kernel(2);
        // Budget equals period: the job exhausts exactly when the next one
        // releases.
        k.create_thread(0x1000, 0, 0, 100, 100, Timestamp::default())
            .unwrap();
        select(&mut k);
        for t in 1..100 {
            tick(&mut k, Timestamp::from(t));
        }
        assert_eq!(k.thread(0).budget_left(), 1);
        tick(&mut k, Timestamp::from(100));
        // Debit parked it; the release pass re-armed it cleanly.
        assert_eq!(k.thread(0).state(), ThreadState::Ready);
        assert_eq!(k.thread(0).budget_left(), 100);
    }

    #[test]
    fn rms_preemption_two_threads() {
        // A = (C=20, T=100) at priority 0, B = (C=150, T=1000) at 1.
        let mut k = kernel(2);
        let now = Timestamp::default();
        k.create_thread(0x1000, 0, 0, 20, 100, now).unwrap();
        k.create_thread(0x1000, 0, 1, 150, 1000, now).unwrap();
        select(&mut k);

        let mut a_ticks = 0u32;
        let mut b_ticks = 0u32;
        let mut a_job_ticks = 0u32;
        for t in 1..=1000u32 {
            match step(&mut k, t) {
                0 => {
                    a_ticks += 1;
                    a_job_ticks += 1;
                }
                1 => b_ticks += 1,
                _ => {}
            }
            // A must always receive its full budget before its deadline.
            if t % 100 == 0 {
                assert_eq!(a_job_ticks, 20, "deadline miss at tick {}", t);
                a_job_ticks = 0;
            }
        }

        // Ten jobs of twenty ticks each for A; B is truncated to its
        // 150-tick budget; the idle slot absorbs the rest.
        assert_eq!(a_ticks, 200);
        assert_eq!(b_ticks, 150);
        assert_eq!(k.thread(0).elapsed(), 200);
        assert_eq!(k.thread(1).elapsed(), 150);
    }

    #[test]
    fn wait_until_next_period_cadence() {
        // A (C=50, T=200) thread that finishes instantly: it should be
        // released exactly ten times over 2000 ticks.
        let mut k = kernel(2);
        k.create_thread(0x1000, 0, 0, 50, 200, Timestamp::default())
            .unwrap();
        select(&mut k);

        let mut periods = 0u32;
        for t in 1..=2000u32 {
            if k.current_index() == 0 {
                // The job runs this tick and then yields to the next
                // period.
                periods += 1;
                k.thread_mut(0).set_state(ThreadState::Waiting);
                select(&mut k);
            }
            tick(&mut k, Timestamp::from(t));
            select(&mut k);
        }
        assert_eq!(periods, 10);
    }

    #[test]
    fn bounded_inversion_scenario() {
        // T0 = (100, 500) @ 0, T1 = (100, 500) @ 1, T2 = (750, 2000) @ 2,
        // with m0 at ceiling 0 and m1 at ceiling 1, both taken by T2.
        let mut k = kernel(3);
        let now = Timestamp::default();
        k.create_thread(0x1000, 0, 0, 100, 500, now).unwrap();
        k.create_thread(0x1000, 0, 1, 100, 500, now).unwrap();
        k.create_thread(0x1000, 0, 2, 750, 2000, now).unwrap();

        let m0 = mutex::init(&mut k, 0);
        let m1 = mutex::init(&mut k, 1);

        // T2 gets the CPU to itself (the others are parked) and takes both
        // mutexes, outer first.
        k.thread_mut(0).set_state(ThreadState::Waiting);
        k.thread_mut(1).set_state(ThreadState::Waiting);
        assert_eq!(select(&mut k), 2);
        let _ = mutex::lock(&mut k, 2, m1);
        let _ = mutex::lock(&mut k, 2, m0);
        assert_eq!(k.thread(2).dynamic_priority(), abi::Priority(0));

        // T0's release arrives. It must not preempt the ceiling-0 critical
        // section.
        k.thread_mut(0).release(Timestamp::from(500));
        assert_eq!(select(&mut k), 2);

        // The moment the ceiling-0 section closes, T0 preempts.
        let _ = mutex::unlock(&mut k, 2, m0);
        assert_eq!(select(&mut k), 0);

        // T0 finishes; T2 still holds m1, so T1's release cannot preempt
        // it...
        k.thread_mut(0).set_state(ThreadState::Waiting);
        k.thread_mut(1).release(Timestamp::from(500));
        assert_eq!(select(&mut k), 2);

        // ...until m1 is released too.
        let _ = mutex::unlock(&mut k, 2, m1);
        assert_eq!(select(&mut k), 1);
    }

    #[test]
    fn blocked_thread_reenters_via_unblock_pass() {
        let mut k = kernel(2);
        let now = Timestamp::default();
        k.create_thread(0x1000, 0, 0, 10, 100, now).unwrap();
        k.create_thread(0x1000, 0, 1, 10, 100, now).unwrap();

        let m = mutex::init(&mut k, 0);
        let _ = mutex::lock(&mut k, 1, m);
        let _ = mutex::lock(&mut k, 0, m);
        assert_eq!(k.thread(0).state(), ThreadState::Blocked);

        // While blocked, thread 0 is ineligible even though it is the most
        // important thread in the system.
        assert_eq!(select(&mut k), 1);

        let _ = mutex::unlock(&mut k, 1, m);
        // The unblock pass re-admits it and it wins selection.
        assert_eq!(select(&mut k), 0);
        assert_eq!(k.thread(0).state(), ThreadState::Running);
    }
}
