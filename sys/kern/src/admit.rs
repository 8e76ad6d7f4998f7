// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Admission control: the Liu-Layland utilization bound test.
//!
//! A set of `n` periodic threads under fixed-priority rate-monotonic
//! scheduling is schedulable if its total utilization does not exceed
//! `n * (2^(1/n) - 1)`. The bound is sufficient, not necessary -- we take
//! the conservative reading and reject anything above it.
//!
//! The table is consulted at admission time only, never on a context
//! switch, so no floating-point context needs to be preserved across
//! preemption.

use crate::thread::Thread;

/// Precalculated values of `k * (2^(1/k) - 1)` for `k = 0..=31`, single
/// precision. Entry 0 is unused and pinned to zero; entry 1 is the trivial
/// bound; the tail decreases monotonically toward `ln 2`.
pub const UB_TABLE: [f32; 32] = [
    0.000, 1.000, 0.8284, 0.7798, 0.7568, 0.7435, 0.7348, 0.7286, 0.7241,
    0.7205, 0.7177, 0.7155, 0.7136, 0.7119, 0.7106, 0.7094, 0.7083, 0.7075,
    0.7066, 0.7059, 0.7052, 0.7047, 0.7042, 0.7037, 0.7033, 0.7028, 0.7025,
    0.7021, 0.7018, 0.7015, 0.7012, 0.7009,
];

/// Runs the utilization bound test for a prospective thread with budget
/// `budget` and period `period` against the already-admitted set.
///
/// `threads` must be the user slots only: the idle and default slots never
/// participate in the test.
pub fn acceptable(threads: &[Thread], budget: u32, period: u32) -> bool {
    let mut utilization = budget as f32 / period as f32;
    let mut count = 1usize;

    for t in threads {
        if t.state().counts_for_admission() {
            utilization += t.budget() as f32 / t.period() as f32;
            count += 1;
        }
    }

    // The table covers at most 31 threads. The slot limits keep us well
    // under that, but the table lookup is guarded rather than trusted.
    if count >= UB_TABLE.len() {
        return false;
    }
    utilization <= UB_TABLE[count]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{InitParams, Kernel};
    use crate::time::Timestamp;

    fn kernel(max_threads: usize) -> Kernel {
        Kernel::new(InitParams {
            max_threads,
            stack_words: 256,
            idle_entry: 0,
            max_mutexes: 0,
        })
        .unwrap()
    }

    #[test]
    fn table_shape() {
        assert_eq!(UB_TABLE[0], 0.0);
        assert_eq!(UB_TABLE[1], 1.0);
        for k in 2..UB_TABLE.len() {
            assert!(UB_TABLE[k] < UB_TABLE[k - 1]);
            // ln 2 is the limit of the bound as k grows.
            assert!(UB_TABLE[k] > 0.6931);
        }
    }

    #[test]
    fn single_thread_admits_to_full_utilization() {
        let k = kernel(2);
        // U = 1.0 is exactly UB_TABLE[1]; anything above it is out.
        assert!(acceptable(&k.threads[..2], 500, 500));
        assert!(!acceptable(&k.threads[..2], 501, 500));
        assert!(acceptable(&k.threads[..2], 1, 1));
    }

    #[test]
    fn bound_is_exact_at_the_table_value() {
        let mut k = kernel(3);
        let now = Timestamp::default();
        // Two threads at U = 0.25 each.
        k.create_thread(0x1000, 0, 0, 50, 200, now).unwrap();
        k.create_thread(0x1000, 0, 1, 50, 200, now).unwrap();

        // Third thread: bound is UB_TABLE[3] = 0.7798, leaving 0.2798.
        // 279/1000 fits; one tick more does not.
        assert!(acceptable(&k.threads[..3], 279, 1000));
        assert!(!acceptable(&k.threads[..3], 280, 1000));
    }

    #[test]
    fn utilization_search_matches_reference_run() {
        // The reference user program creates two (50, 200) threads, then
        // walks C down from 1000 in steps of 100 at T=1000, expecting the
        // first admitted value to be 200; then from 1000 in steps of 25 at
        // T=5000, expecting 275.
        let mut k = kernel(4);
        let now = Timestamp::default();
        k.create_thread(0x1000, 0, 0, 50, 200, now).unwrap();
        k.create_thread(0x1000, 0, 1, 50, 200, now).unwrap();

        let mut admitted = None;
        let mut c = 1000;
        while c > 0 {
            if k.create_thread(0x1000, 0, 2, c, 1000, now).is_ok() {
                admitted = Some(c);
                break;
            }
            c -= 100;
        }
        assert_eq!(admitted, Some(200));

        let mut admitted = None;
        let mut c = 1000;
        while c > 0 {
            if k.create_thread(0x1000, 0, 3, c, 5000, now).is_ok() {
                admitted = Some(c);
                break;
            }
            c -= 25;
        }
        assert_eq!(admitted, Some(275));
    }

    #[test]
    fn done_slots_do_not_count() {
        let mut k = kernel(2);
        let now = Timestamp::default();
        k.create_thread(0x1000, 0, 0, 190, 200, now).unwrap();
        // Nearly saturated; a second thread of any real size is rejected.
        assert!(!acceptable(&k.threads[..2], 50, 200));
        let _ = k.kill_thread(0, None);
        // With the slot torn down its utilization is reclaimed.
        assert!(acceptable(&k.threads[..2], 50, 200));
    }
}
