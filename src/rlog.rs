// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The per-transaction redo log.
//!
//! Writes are buffered here, keyed by word address, and replayed at commit
//! once every covering orec is locked. Entries keep a stable insertion
//! order: locks are taken walking the log backward and released walking it
//! forward, so of several entries covered by the same orec exactly one
//! (the last in forward order) owns the displaced version and releases the
//! lock.

use std::collections::HashMap;

/// Saved-version sentinel: this entry is not the last one covering its
/// orec, or the orec is not locked yet, and it must not release the lock.
pub(crate) const NOT_LAST: isize = -1;

/// One buffered write.
pub(crate) struct WriteEntry {
    /// Word address the entry is keyed by.
    pub addr: usize,

    /// Value to store at commit.
    pub val: usize,

    /// Orec version displaced when this transaction locked the covering
    /// orec, or [`NOT_LAST`].
    pub saved: isize,

    /// Thread-local dictionary entry: rolls back like a write but is never
    /// stored through its key.
    pub dict: bool,
}

/// Address-keyed write buffer with stable insertion order. Re-inserting an
/// address overwrites the buffered value in place.
#[derive(Default)]
pub(crate) struct RedoLog {
    entries: Vec<WriteEntry>,
    index: HashMap<usize, usize>,
}

impl RedoLog {
    pub fn insert(&mut self, addr: usize, val: usize, dict: bool) {
        match self.index.get(&addr) {
            Some(&at) => {
                let entry = &mut self.entries[at];
                entry.val = val;
                entry.dict = dict;
            }
            None => {
                self.index.insert(addr, self.entries.len());
                self.entries.push(WriteEntry {
                    addr,
                    val,
                    saved: NOT_LAST,
                    dict,
                });
            }
        }
    }

    pub fn lookup(&self, addr: usize) -> Option<&WriteEntry> {
        self.index.get(&addr).map(|&at| &self.entries[at])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, at: usize) -> &WriteEntry {
        &self.entries[at]
    }

    pub fn entry_mut(&mut self, at: usize) -> &mut WriteEntry {
        &mut self.entries[at]
    }

    /// Entries oldest first: the write-back and lock-release order.
    pub fn iter_forward(&self) -> impl Iterator<Item = &WriteEntry> {
        self.entries.iter()
    }

    pub fn iter_forward_mut(&mut self) -> impl Iterator<Item = &mut WriteEntry> {
        self.entries.iter_mut()
    }

    pub fn any_entries(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}
