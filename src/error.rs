// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error as DeriveError;

/// Global return type
pub type Result<T> = core::result::Result<T, TxError>;

/// Number of distinct abort reasons tracked per thread.
pub const ABORT_REASONS: usize = 8;

/// Number of distinct spinloop reasons tracked per thread.
pub const SPINLOOP_REASONS: usize = 10;

/// Why a transaction had to roll back. The discriminant doubles as the
/// index into the per-thread abort counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum AbortReason {
    /// An orec to be locked at commit carried a version newer than the
    /// transaction's start time.
    AcquireNewer = 0,

    /// Read-set revalidation failed while scaling the read path forward.
    ReadValidation = 1,

    /// Read-set revalidation failed while catching up for inevitability.
    InevitableValidation = 2,

    /// Read-set revalidation failed while waiting out an inevitable writer.
    WaitValidation = 3,

    /// Commit-time validation found an unlocked orec newer than the start
    /// time.
    CommitNewer = 4,

    /// Commit-time validation found an orec locked by another thread.
    CommitLocked = 5,

    /// Lock acquisition found an orec locked by another thread.
    AcquireLocked = 6,

    /// The transaction body requested a restart.
    Explicit = 7,
}

#[derive(Debug, DeriveError)]
pub enum TxError {
    /// The transaction was rolled back and must be re-run from the top.
    /// Propagate this with `?`; [`crate::perform_transaction`] catches it
    /// and re-enters the body.
    #[error("transaction must restart ({0:?})")]
    Restart(AbortReason),
}
