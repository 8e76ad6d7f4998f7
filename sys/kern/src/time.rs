// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of kernel time.

/// In-kernel timestamp representation.
///
/// This is measured in ticks of the system tick timer, which is the sole
/// monotonic clock the kernel consults. The counter is 32 bits wide; at the
/// millisecond tick rates this kernel is used with, that is on the order of
/// seven weeks of uptime.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default)]
#[repr(transparent)]
pub struct Timestamp(u32);

impl Timestamp {
    /// Raw tick count.
    pub fn ticks(self) -> u32 {
        self.0
    }

    /// Checks whether this instant is a release boundary for a thread of the
    /// given period.
    pub fn is_release_for(self, period: u32) -> bool {
        self.0 % period == 0
    }
}

impl From<u32> for Timestamp {
    fn from(v: u32) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for u32 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}
