// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! This module is designed around the idea that kernel code spends too much
//! time handling and recording errors, and we ought to be able to separate
//! that concern using `Result`.

use abi::{FaultInfo, UsageError};

use crate::thread::NextThread;

/// Sentinel written into the caller's return register for recoverable
/// failures (`-1` as seen by user code).
pub const FAILURE: u32 = !0;

/// An error committed by user code when interacting with a syscall.
///
/// This is used internally as the returned error type for syscall
/// implementations.
#[derive(Clone, Debug)]
pub enum UserError {
    /// A recoverable error. Recoverable errors are indicated to the errant
    /// thread by returning a response code (the `u32` field). They may still
    /// cause a context switch, however, as indicated by the `NextThread`.
    Recoverable(u32, NextThread),
    /// An unrecoverable error. Unrecoverable errors kill the errant thread:
    /// its slot is marked `Done` and it is never scheduled again.
    Unrecoverable(FaultInfo),
}

impl UserError {
    /// Shorthand for the common "reject with `-1`, keep running the caller"
    /// disposition.
    pub fn rejection() -> Self {
        Self::Recoverable(FAILURE, NextThread::Same)
    }
}

/// Convenience conversion from `FaultInfo`.
impl From<FaultInfo> for UserError {
    fn from(f: FaultInfo) -> Self {
        Self::Unrecoverable(f)
    }
}

/// Convenience conversion from `UsageError` (by way of `FaultInfo`).
impl From<UsageError> for UserError {
    fn from(f: UsageError) -> Self {
        Self::Unrecoverable(f.into())
    }
}
