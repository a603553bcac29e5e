// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Transactional memory cells and derived access helpers.
//!
//! [`TWord`] is the unit of transactional access: one machine word. The
//! engine tracks words by address, so a cell must stay alive and pinned
//! for as long as any transaction may still commit a buffered write to it;
//! keep shared words in statics, `Arc`s, or containers that outlive every
//! thread transacting on them.
//!
//! The partial-word and float helpers are plain compositions of
//! [`read_word`]/[`write_word`]: a sub-word read loads the containing word
//! transactionally and masks/shifts, a sub-word write read-modify-writes
//! the containing word through the redo log. Byte offsets assume a
//! little-endian 64-bit word.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::Result;
use crate::tx::{read_word, write_word};

const WORD_BYTES: usize = std::mem::size_of::<usize>();

/// One word of transactional memory.
#[repr(transparent)]
pub struct TWord(AtomicUsize);

impl TWord {
    pub const fn new(value: usize) -> Self {
        Self(AtomicUsize::new(value))
    }

    /// Non-transactional snapshot, for inspection outside transactions.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn addr(&self) -> usize {
        self as *const Self as usize
    }

    pub(crate) fn load_raw(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn store_raw(&self, value: usize) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// # Safety
    /// `addr` must come from [`TWord::addr`] on a cell that is still
    /// alive.
    pub(crate) unsafe fn from_addr<'a>(addr: usize) -> &'a Self {
        &*(addr as *const Self)
    }
}

fn read_shifted(word: &TWord, offset: usize) -> Result<usize> {
    Ok(read_word(word)? >> (offset * 8))
}

fn write_masked(word: &TWord, offset: usize, width: usize, val: usize) -> Result<()> {
    let shift = offset * 8;
    let mask = ((1usize << (width * 8)) - 1) << shift;
    let current = read_word(word)?;
    write_word(word, (current & !mask) | ((val << shift) & mask))
}

/// Reads the byte at `offset` of the containing word.
pub fn read_partial_u8(word: &TWord, offset: usize) -> Result<u8> {
    debug_assert!(offset < WORD_BYTES);
    Ok(read_shifted(word, offset)? as u8)
}

/// Reads the halfword at `offset` (a multiple of 2).
pub fn read_partial_u16(word: &TWord, offset: usize) -> Result<u16> {
    debug_assert!(offset % 2 == 0 && offset < WORD_BYTES);
    Ok(read_shifted(word, offset)? as u16)
}

/// Reads the 4-byte half at `offset` (0 or 4).
#[cfg(target_pointer_width = "64")]
pub fn read_partial_u32(word: &TWord, offset: usize) -> Result<u32> {
    debug_assert!(offset % 4 == 0 && offset < WORD_BYTES);
    Ok(read_shifted(word, offset)? as u32)
}

/// Writes the byte at `offset`, leaving its neighbors untouched.
pub fn write_partial_u8(word: &TWord, offset: usize, val: u8) -> Result<()> {
    debug_assert!(offset < WORD_BYTES);
    write_masked(word, offset, 1, val as usize)
}

/// Writes the halfword at `offset` (a multiple of 2).
pub fn write_partial_u16(word: &TWord, offset: usize, val: u16) -> Result<()> {
    debug_assert!(offset % 2 == 0 && offset < WORD_BYTES);
    write_masked(word, offset, 2, val as usize)
}

/// Writes the 4-byte half at `offset` (0 or 4).
#[cfg(target_pointer_width = "64")]
pub fn write_partial_u32(word: &TWord, offset: usize, val: u32) -> Result<()> {
    debug_assert!(offset % 4 == 0 && offset < WORD_BYTES);
    write_masked(word, offset, 4, val as usize)
}

/// Reads a double-precision float stored in `word`.
#[cfg(target_pointer_width = "64")]
pub fn read_f64(word: &TWord) -> Result<f64> {
    Ok(f64::from_bits(read_word(word)? as u64))
}

/// Writes a double-precision float into `word`.
#[cfg(target_pointer_width = "64")]
pub fn write_f64(word: &TWord, val: f64) -> Result<()> {
    write_word(word, val.to_bits() as usize)
}

/// Reads a single-precision float stored in either half of `word`.
#[cfg(target_pointer_width = "64")]
pub fn read_f32(word: &TWord, offset: usize) -> Result<f32> {
    Ok(f32::from_bits(read_partial_u32(word, offset)?))
}

/// Writes a single-precision float into either half of `word`.
#[cfg(target_pointer_width = "64")]
pub fn write_f32(word: &TWord, offset: usize, val: f32) -> Result<()> {
    write_partial_u32(word, offset, val.to_bits())
}
