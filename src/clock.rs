// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The global logical clock.
//!
//! One shared word times every commit. Its lowest bit flags a running
//! inevitable transaction; the remaining bits form an even timestamp.
//! A non-inevitable writer's commit point is the compare-and-swap that
//! advances the clock by 2. Becoming inevitable adds 1 (setting the flag),
//! an inevitable commit adds another 1 (clearing it and completing the
//! step of 2).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use lazy_static::lazy_static;

/// First valid timestamp. Orecs start at 0, strictly older.
const CLOCK_START: usize = 2;

pub(crate) struct GlobalClock {
    word: AtomicUsize,
}

impl GlobalClock {
    const fn new() -> Self {
        Self {
            word: AtomicUsize::new(CLOCK_START),
        }
    }

    pub fn load(&self) -> usize {
        self.word.load(Ordering::Acquire)
    }

    /// Commit-point compare-and-swap. Release so a reader observing the new
    /// timestamp also observes the committer's stores.
    pub fn cas(&self, current: usize, new: usize) -> bool {
        self.word
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditional store. Only legal while holding inevitability: the
    /// single inevitable writer is the only thread allowed to move the
    /// clock without a CAS.
    pub fn store(&self, new: usize) {
        self.word.store(new, Ordering::Release);
    }
}

pub(crate) static CLOCK: GlobalClock = GlobalClock::new();

lazy_static! {
    /// Serializes inevitable transactions, and gives threads waiting for
    /// one something blocking to queue on. Held from promotion to commit.
    pub(crate) static ref INEVITABLE: Mutex<()> = Mutex::new(());
}
