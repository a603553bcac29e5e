// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The transaction engine.
//!
//! This module implements a lazy-lazy variation of the TL2 algorithm
//! described by Shavit et al.: transactional writes are buffered in the
//! per-thread redo log and ownership records are only acquired at commit
//! time. The commit point of a writer is the compare-and-swap advancing
//! the global clock; read-only transactions commit without touching any
//! shared word. A transaction that must not roll back (because it
//! performed irreversible work) can promote itself to *inevitable* mode,
//! which serializes it against every other inevitable transaction and
//! grants it a validation-free commit.

use std::sync::atomic::{fence, Ordering};
use std::sync::PoisonError;

use log::{debug, trace};

use crate::clock::{CLOCK, INEVITABLE};
use crate::descriptor::{with_descriptor, ThreadDescriptor};
use crate::error::{AbortReason, Result, TxError};
use crate::orec::{is_locked, locked_or_newer, ORECS};
use crate::rlog::NOT_LAST;
use crate::word::TWord;

// Spinloop accounting sites (indices into `Stats::spinloops`). The
// read-validation sites 1..=3 reuse their abort discriminant as index.
const SPIN_ABORT: usize = 0;
const SPIN_WAIT_INEVITABLE: usize = 4;
const SPIN_TRY_INEVITABLE: usize = 6;
const SPIN_READ_LOCKED: usize = 7;
const SPIN_ACQUIRE_LOCKED: usize = 8;

impl ThreadDescriptor {
    fn read_clock(&mut self) -> usize {
        let ts = CLOCK.load();
        self.last_known_timestamp = ts;
        ts
    }

    fn cas_clock(&mut self, current: usize, new: usize) -> bool {
        if CLOCK.cas(current, new) {
            self.last_known_timestamp = new;
            true
        } else {
            false
        }
    }

    fn store_clock(&mut self, new: usize) {
        CLOCK.store(new);
        self.last_known_timestamp = new;
    }

    fn begin(&mut self) {
        assert!(
            !self.transaction_active,
            "nested transactions are not supported"
        );
        assert!(self.inevitable_guard.is_none());
        self.transaction_active = true;
        // The cached clock word is good enough: a stale snapshot only
        // means scaling forward on the first conflicting read.
        self.start_time = self.last_known_timestamp & !1;
    }

    /// Rolls the transaction back: revert held locks, drop the buffers,
    /// back off, and hand the restart signal to the caller.
    fn abort(&mut self, reason: AbortReason) -> TxError {
        assert!(
            !self.is_inevitable(),
            "an inevitable transaction cannot abort"
        );
        self.stats.aborts[reason as usize] += 1;
        debug!("thread {:#x} aborting ({:?})", self.my_lock_word, reason);
        self.release_and_revert_locks();
        self.cleanup();
        self.spinloop(SPIN_ABORT);
        TxError::Restart(reason)
    }

    fn cleanup(&mut self) {
        self.reads.clear();
        self.redolog.clear();
        assert!(self.transaction_active);
        self.transaction_active = false;
        // dropping the guard releases the inevitability mutex
        self.inevitable_guard = None;
    }

    /// Stores the displaced version back into every orec this transaction
    /// holds.
    fn release_and_revert_locks(&mut self) {
        for entry in self.redolog.iter_forward() {
            if entry.saved != NOT_LAST {
                ORECS.get(entry.addr).store(entry.saved);
            }
        }
    }

    /// Like [`Self::release_and_revert_locks`], but keeps the redo log for
    /// a later re-acquisition.
    fn release_locks_for_retry(&mut self) {
        for entry in self.redolog.iter_forward_mut() {
            if entry.saved != NOT_LAST {
                ORECS.get(entry.addr).store(entry.saved);
                entry.saved = NOT_LAST;
            }
        }
    }

    /// Fast-path read-set validation; the caller holds no orec locks.
    /// Locked orecs are waited out rather than failing the whole set.
    fn validate_fast(&mut self, reason: AbortReason) -> Result<()> {
        assert!(!self.is_inevitable());
        let start_time = self.start_time;
        for at in 0..self.reads.len() {
            loop {
                let ovt = self.reads.get(at).load();
                if !locked_or_newer(ovt, start_time) {
                    break;
                }
                if is_locked(ovt) {
                    self.spinloop(reason as usize);
                } else {
                    return Err(self.abort(reason));
                }
            }
        }
        Ok(())
    }

    /// Commit-time validation: every read orec must be no newer than the
    /// start time, unless this thread holds its lock.
    fn validate(&mut self) -> Result<()> {
        assert!(!self.is_inevitable());
        let start_time = self.start_time;
        for at in 0..self.reads.len() {
            let ovt = self.reads.get(at).load();
            if locked_or_newer(ovt, start_time) {
                if !is_locked(ovt) {
                    return Err(self.abort(AbortReason::CommitNewer));
                }
                if ovt != self.my_lock_word {
                    return Err(self.abort(AbortReason::CommitLocked));
                }
            }
        }
        Ok(())
    }

    /// Locks the covering orec of every buffered write, newest entry
    /// first. On success every entry's orec is held by this thread, and of
    /// the entries sharing an orec exactly the last one in forward order
    /// carries the displaced version.
    fn acquire_locks(&mut self) -> Result<()> {
        for at in (0..self.redolog.len()).rev() {
            let addr = self.redolog.entry(at).addr;
            let orec = ORECS.get(addr);
            loop {
                let ovt = orec.load();
                if !locked_or_newer(ovt, self.start_time) {
                    if !orec.cas(ovt, self.my_lock_word) {
                        continue;
                    }
                    self.redolog.entry_mut(at).saved = ovt;
                    break;
                } else if !is_locked(ovt) {
                    // Newer than our snapshot. Most writes are also reads,
                    // so committing over it would risk inconsistency.
                    return Err(self.abort(AbortReason::AcquireNewer));
                } else if ovt != self.my_lock_word {
                    // Held by another committer. An inevitable transaction
                    // cannot abort, so it waits the holder out.
                    if self.is_inevitable() {
                        self.spinloop(SPIN_ACQUIRE_LOCKED);
                    } else {
                        return Err(self.abort(AbortReason::AcquireLocked));
                    }
                } else {
                    // Already ours through a later entry in forward order;
                    // this one keeps the NOT_LAST sentinel.
                    break;
                }
            }
        }
        Ok(())
    }

    /// Applies the redo log and publishes the new version, releasing each
    /// held orec exactly once.
    fn redo(&mut self) {
        let new_version = self.end_time as isize;
        for entry in self.redolog.iter_forward() {
            if !entry.dict {
                // Addresses enter the log from `&TWord` borrows; turning
                // them back into cells is confined to this replay.
                unsafe { TWord::from_addr(entry.addr) }.store_raw(entry.val);
            }
            if entry.saved != NOT_LAST {
                ORECS.get(entry.addr).store(new_version);
            }
        }
    }

    /// A committer that found the clock's inevitable flag set parks until
    /// the inevitable writer is done, then re-acquires its locks.
    fn wait_end_inevitability(&mut self) -> Result<()> {
        self.release_locks_for_retry();
        loop {
            let current = self.read_clock();
            if current & 1 == 0 {
                break;
            }
            // About to wait anyway, so catch the read set up for free.
            if self.start_time < current - 1 {
                self.validate_fast(AbortReason::WaitValidation)?;
                self.start_time = current - 1;
            }
            self.spinloop(SPIN_WAIT_INEVITABLE);
            // Queue behind the inevitable writer so most of the wait is a
            // blocking one.
            drop(INEVITABLE.lock().unwrap_or_else(PoisonError::into_inner));
        }
        self.acquire_locks()
    }

    /// Commit of the inevitable writer: nobody else can have committed
    /// since promotion, so no validation is needed and the clock moves by
    /// an unconditional store.
    fn commit_inevitable(&mut self) {
        let ts = self.read_clock();
        assert_eq!(ts & 1, 1);
        self.store_clock(ts + 1);
        self.end_time = ts + 1;
        assert_eq!(self.end_time, self.start_time + 2);
        self.redo();
    }

    fn commit(&mut self) -> Result<usize> {
        // Nothing written: the transaction linearizes at its last
        // validated read and commits for free.
        if !self.redolog.any_entries() {
            if self.is_inevitable() {
                let ts = self.read_clock();
                assert_eq!(ts & 1, 1);
                self.store_clock(ts - 1);
            }
            self.stats.commits += 1;
            let commit_time = self.start_time;
            self.cleanup();
            return Ok(commit_time);
        }

        self.acquire_locks()?;

        if self.is_inevitable() {
            self.commit_inevitable();
        } else {
            loop {
                let expected = self.read_clock();
                if expected & 1 == 1 {
                    self.wait_end_inevitability()?;
                    continue;
                }
                if self.cas_clock(expected, expected + 2) {
                    self.end_time = expected + 2;
                    break;
                }
            }

            // If the clock moved straight from our snapshot, no other
            // writer committed in the window and the reads still hold.
            if self.end_time != self.start_time + 2 {
                self.validate()?;
            }
            self.redo();
        }

        self.stats.commits += 1;
        let commit_time = self.end_time;
        self.cleanup();
        Ok(commit_time)
    }

    fn read_word(&mut self, word: &TWord) -> Result<usize> {
        let addr = word.addr();
        if let Some(entry) = self.redolog.lookup(addr) {
            return Ok(entry.val);
        }

        let orec = ORECS.get(addr);
        loop {
            // Sample the orec before and after the word itself; a stable
            // sample proves the word belonged to that version.
            let ovt = orec.load();
            fence(Ordering::SeqCst);

            if locked_or_newer(ovt, self.start_time) {
                if is_locked(ovt) {
                    // Locks are only held across commit write-back; wait.
                    self.spinloop(SPIN_READ_LOCKED);
                    continue;
                }
                // The stripe moved past our snapshot: scale forward.
                let new_start = self.read_clock() & !1;
                self.validate_fast(AbortReason::ReadValidation)?;
                self.start_time = new_start;
                continue;
            }

            let value = word.load_raw();
            fence(Ordering::SeqCst);
            if orec.load() != ovt {
                continue;
            }

            self.reads.push(orec);
            return Ok(value);
        }
    }
}

const NO_DESCRIPTOR: &str = "thread is not registered (missing set_tls)";

/// Transactionally reads one word.
///
/// Outside an active transaction the read passes straight through to
/// memory. Inside one, a value buffered by an earlier [`write_word`] wins;
/// otherwise the word is read under its orec with post-validation, and the
/// snapshot is scaled forward when the stripe has moved on.
pub fn read_word(word: &TWord) -> Result<usize> {
    with_descriptor(|descriptor| match descriptor {
        Some(d) if d.transaction_active => d.read_word(word),
        _ => Ok(word.load_raw()),
    })
}

/// Transactionally writes one word; the store is buffered in the redo log
/// until commit. Outside an active transaction the store goes straight to
/// memory.
pub fn write_word(word: &TWord, val: usize) -> Result<()> {
    with_descriptor(|descriptor| {
        match descriptor {
            Some(d) if d.transaction_active => d.redolog.insert(word.addr(), val, false),
            _ => word.store_raw(val),
        }
        Ok(())
    })
}

/// Runs `body` as one atomic transaction, retrying until it commits, and
/// returns the body's result.
///
/// The body receives the retry count, starting at 0. Any [`TxError`] it
/// propagates (from a transactional read, [`try_inevitable`], or
/// [`abort_and_retry`]) rolls the transaction back and re-enters the body
/// with the counter incremented; the engine does the same when commit-time
/// validation fails.
pub fn perform_transaction<T, F>(mut body: F) -> T
where
    F: FnMut(usize) -> Result<T>,
{
    with_descriptor(|descriptor| {
        assert!(descriptor.is_some(), "{}", NO_DESCRIPTOR);
    });

    let mut retry_count = 0;
    loop {
        with_descriptor(|descriptor| descriptor.expect(NO_DESCRIPTOR).begin());
        let attempt = retry_count;
        retry_count += 1;

        match body(attempt) {
            Ok(value) => {
                let committed =
                    with_descriptor(|descriptor| descriptor.expect(NO_DESCRIPTOR).commit().is_ok());
                if committed {
                    return value;
                }
            }
            Err(_) => with_descriptor(|descriptor| {
                let d = descriptor.expect(NO_DESCRIPTOR);
                // A body may bail out with a hand-rolled error value
                // instead of abort_and_retry; finish the rollback here.
                if d.transaction_active {
                    let _ = d.abort(AbortReason::Explicit);
                }
            }),
        }
    }
}

/// Promotes the running transaction to inevitable status, waiting until it
/// is the only inevitable one. From then on it cannot abort and its commit
/// skips validation. No-op when no transaction is active or the
/// transaction is already inevitable. `why` only decorates the log.
pub fn try_inevitable(why: &str) -> Result<()> {
    with_descriptor(|descriptor| {
        let d = match descriptor {
            Some(d) if d.transaction_active => d,
            _ => return Ok(()),
        };
        if d.is_inevitable() {
            trace!("thread {:#x} already inevitable: {}", d.my_lock_word, why);
            return Ok(());
        }
        debug!("thread {:#x} turning inevitable: {}", d.my_lock_word, why);

        loop {
            let current = d.read_clock();
            if d.start_time != current & !1 {
                // The inevitable window must start at the clock; catch up.
                d.validate_fast(AbortReason::InevitableValidation)?;
                d.start_time = current & !1;
            }
            let guard = INEVITABLE.lock().unwrap_or_else(PoisonError::into_inner);
            if current & 1 == 1 {
                // There is, or was, another inevitable transaction.
                drop(guard);
                d.spinloop(SPIN_TRY_INEVITABLE);
                continue;
            }
            if d.cas_clock(current, current + 1) {
                d.inevitable_guard = Some(guard);
                return Ok(());
            }
        }
    })
}

/// Rolls the running transaction back on request and returns the restart
/// signal, which the body must propagate for the restart to happen:
///
/// ```ignore
/// return Err(abort_and_retry());
/// ```
pub fn abort_and_retry() -> TxError {
    with_descriptor(|descriptor| {
        let d = descriptor.expect(NO_DESCRIPTOR);
        assert!(d.transaction_active, "abort_and_retry outside a transaction");
        d.abort(AbortReason::Explicit)
    })
}

/// Looks `key` up in the transaction-local dictionary overlaid on the redo
/// log. Entries buffered by [`write_word`] share the key space.
pub fn tldict_lookup(key: usize) -> Option<usize> {
    with_descriptor(|descriptor| descriptor.and_then(|d| d.redolog.lookup(key).map(|e| e.val)))
}

/// Adds a key/value pair to the transaction-local dictionary. The entry is
/// discarded on abort like any buffered write and conflict-checked at
/// commit through the key's covering orec, but never stored through its
/// key. Keys must be word-aligned integers.
pub fn tldict_add(key: usize, val: usize) {
    with_descriptor(|descriptor| {
        let d = descriptor.expect(NO_DESCRIPTOR);
        assert!(d.transaction_active, "tldict_add outside a transaction");
        d.redolog.insert(key, val, true);
    });
}
