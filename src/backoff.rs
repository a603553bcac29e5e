// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Contention backoff.
//!
//! Threads that lose a race (a locked orec, a running inevitable writer)
//! keep the CPU busy for a short, pseudo-random stretch instead of
//! hammering the shared word. The counter is seeded from the owning
//! thread's lock word so competing threads fall out of lockstep.

/// Multiplicative spin counter driving the pause duration.
pub(crate) struct Backoff {
    counter: u32,
}

impl Backoff {
    /// The seed is forced odd so the counter never collapses to zero.
    pub fn new(seed: u32) -> Self {
        Self { counter: seed | 1 }
    }

    /// Burns a counter-derived number of pause iterations, then advances
    /// the counter. Successive calls spin longer on average.
    pub fn spin(&mut self) {
        let c = self.counter;
        self.counter = c.wrapping_mul(9);
        for _ in 0..=((c >> 16) & 0xff) {
            core::hint::spin_loop();
        }
    }
}
