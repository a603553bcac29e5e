// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Per-thread transaction state.
//!
//! Every participating thread registers exactly one descriptor through
//! [`set_tls`] and drops it with [`del_tls`]. The descriptor owns the
//! thread's read set and redo log, its clock snapshots, the lock word it
//! stores into orecs, and its commit/abort/spinloop counters.

use std::cell::RefCell;
use std::ptr;
use std::sync::MutexGuard;

use log::debug;

use crate::backoff::Backoff;
use crate::error::{ABORT_REASONS, SPINLOOP_REASONS};
use crate::orec::{is_locked, ReadSet};
use crate::rlog::RedoLog;

/// Counters kept per thread, dumped through the log at deregistration.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// Successful commits, read-only ones included.
    pub commits: u64,
    /// Aborts, indexed by [`crate::AbortReason`] discriminant.
    pub aborts: [u64; ABORT_REASONS],
    /// Backoff spins, indexed by the waiting site.
    pub spinloops: [u64; SPINLOOP_REASONS],
}

impl Stats {
    pub fn total_aborts(&self) -> u64 {
        self.aborts.iter().sum()
    }
}

pub(crate) struct ThreadDescriptor {
    /// Opaque host object owned by the caller. Never dereferenced here.
    pub tls: *mut (),

    /// Even clock snapshot bounding this transaction's reads.
    pub start_time: usize,

    /// Commit timestamp, valid once the clock has been advanced.
    pub end_time: usize,

    /// Cached clock word, refreshed on every clock access.
    pub last_known_timestamp: usize,

    pub reads: ReadSet,
    pub redolog: RedoLog,
    pub transaction_active: bool,

    /// Held between a successful inevitability promotion and commit; its
    /// presence is what marks the transaction inevitable.
    pub inevitable_guard: Option<MutexGuard<'static, ()>>,

    /// Negative, unique among live threads; stored into orecs as the lock.
    pub my_lock_word: isize,

    pub backoff: Backoff,
    pub stats: Stats,
}

impl ThreadDescriptor {
    fn new(tls: *mut ()) -> Box<Self> {
        let mut descriptor = Box::new(Self {
            tls,
            start_time: 0,
            end_time: 0,
            last_known_timestamp: 0,
            reads: ReadSet::default(),
            redolog: RedoLog::default(),
            transaction_active: false,
            inevitable_guard: None,
            my_lock_word: 0,
            backoff: Backoff::new(1),
            stats: Stats::default(),
        });

        // The heap address is unique among live descriptors; flipping the
        // bits of a non-negative address yields the negative lock word.
        let addr = &*descriptor as *const Self as isize;
        descriptor.my_lock_word = if is_locked(addr) { addr } else { !addr };
        assert!(is_locked(descriptor.my_lock_word));
        descriptor.backoff = Backoff::new(descriptor.my_lock_word as u32);

        descriptor
    }

    pub fn is_inevitable(&self) -> bool {
        self.inevitable_guard.is_some()
    }

    /// Spin-waits with the per-thread backoff and counts the occasion.
    pub fn spinloop(&mut self, reason: usize) {
        self.stats.spinloops[reason] += 1;
        self.backoff.spin();
    }
}

thread_local! {
    static DESCRIPTOR: RefCell<Option<Box<ThreadDescriptor>>> = RefCell::new(None);
}

/// Runs `f` with the calling thread's descriptor, if any.
pub(crate) fn with_descriptor<R>(f: impl FnOnce(Option<&mut ThreadDescriptor>) -> R) -> R {
    DESCRIPTOR.with(|slot| {
        let mut slot = slot.borrow_mut();
        f(slot.as_mut().map(|boxed| &mut **boxed))
    })
}

/// Registers the calling thread with the engine, storing the opaque host
/// object. Must be called once per thread, before its first transaction.
pub fn set_tls(tls: *mut ()) {
    DESCRIPTOR.with(|slot| {
        let mut slot = slot.borrow_mut();
        assert!(slot.is_none(), "thread is already registered");
        let descriptor = ThreadDescriptor::new(tls);
        debug!("thread {:#x} starting", descriptor.my_lock_word);
        *slot = Some(descriptor);
    });
}

/// Returns the opaque host object stored by [`set_tls`], or null when the
/// thread is not registered.
pub fn get_tls() -> *mut () {
    with_descriptor(|descriptor| descriptor.map(|d| d.tls).unwrap_or(ptr::null_mut()))
}

/// Deregisters the calling thread, logging its statistics summary.
pub fn del_tls() {
    DESCRIPTOR.with(|slot| {
        let descriptor = slot
            .borrow_mut()
            .take()
            .expect("thread has no descriptor to deregister");
        debug!(
            "thread {:#x} done: {} commits, {} aborts {:?} | spinloops {:?}",
            descriptor.my_lock_word,
            descriptor.stats.commits,
            descriptor.stats.total_aborts(),
            descriptor.stats.aborts,
            descriptor.stats.spinloops,
        );
    });
}

/// Snapshot of the calling thread's counters. Zeroed default when the
/// thread is not registered.
pub fn stats() -> Stats {
    with_descriptor(|descriptor| descriptor.map(|d| d.stats.clone()).unwrap_or_default())
}

/// The calling thread's lock word, or 0 when the thread is not registered.
pub fn thread_id() -> isize {
    with_descriptor(|descriptor| descriptor.map(|d| d.my_lock_word).unwrap_or(0))
}

/// Engine state of the calling thread: -1 no descriptor, 0 registered but
/// inactive, 1 running a transaction, 2 running an inevitable one.
pub fn debug_get_state() -> i32 {
    with_descriptor(|descriptor| match descriptor {
        None => -1,
        Some(d) if !d.transaction_active => 0,
        Some(d) if !d.is_inevitable() => 1,
        _ => 2,
    })
}
