// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Word-granular software transactional memory
//!
//! This crate implements a lazy-lazy variation of the TL2 algorithm
//! described by Shavit et al. Threads wrap computations over shared
//! [`TWord`] cells in [`perform_transaction`]; the runtime guarantees each
//! computation either commits as one indivisible point on a global logical
//! timeline or is rolled back and retried. Writes are buffered in a
//! per-thread redo log and versioned ownership records are acquired only
//! at commit time, so readers never block writers outside the short
//! write-back window.
//!
//! Transactions that cannot roll back (say, after irreversible I/O) can
//! promote themselves with [`try_inevitable`]; the runtime serializes
//! inevitable transactions and commits them without validation.
//!
//! # Example
//! ```
//! use word_stm as stm;
//!
//! static ACCOUNT: stm::TWord = stm::TWord::new(100);
//!
//! stm::set_tls(std::ptr::null_mut());
//!
//! let remaining = stm::perform_transaction(|_retry| {
//!     let balance = stm::read_word(&ACCOUNT)?;
//!     stm::write_word(&ACCOUNT, balance - 30)?;
//!     Ok(balance - 30)
//! });
//!
//! assert_eq!(remaining, 70);
//! assert_eq!(ACCOUNT.get(), 70);
//!
//! stm::del_tls();
//! ```

mod backoff;
mod clock;
mod descriptor;
mod error;
mod orec;
mod rlog;
mod tx;
mod word;

pub use descriptor::{debug_get_state, del_tls, get_tls, set_tls, stats, thread_id, Stats};
pub use error::{AbortReason, Result, TxError, ABORT_REASONS, SPINLOOP_REASONS};
pub use orec::NUM_STRIPES;
pub use tx::{
    abort_and_retry, perform_transaction, read_word, tldict_add, tldict_lookup, try_inevitable,
    write_word,
};
pub use word::{read_partial_u8, write_partial_u8, read_partial_u16, write_partial_u16, TWord};
#[cfg(target_pointer_width = "64")]
pub use word::{read_f32, read_f64, read_partial_u32, write_f32, write_f64, write_partial_u32};
