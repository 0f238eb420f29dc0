//! Bounded token batch
//!
//! Mirrors the native batch layout: one entry per (token, position) with the
//! set of sequences it belongs to and whether logits are wanted for it.

use crate::runtime::{RuntimeError, SeqId, Token};

/// One batch slot.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub token: Token,
    pub pos: i32,
    pub seqs: Vec<SeqId>,
    pub logits: bool,
}

/// Fixed-capacity batch. `add` refuses entries past the capacity.
#[derive(Debug, Clone)]
pub struct TokenBatch {
    entries: Vec<BatchEntry>,
    capacity: usize,
}

impl TokenBatch {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends an entry and returns its batch index.
    pub fn add(
        &mut self,
        token: Token,
        pos: i32,
        seqs: &[SeqId],
        logits: bool,
    ) -> Result<i32, RuntimeError> {
        if self.entries.len() >= self.capacity {
            return Err(RuntimeError::BatchFull(self.capacity));
        }
        self.entries.push(BatchEntry {
            token,
            pos,
            seqs: seqs.to_vec(),
            logits,
        });
        Ok(self.entries.len() as i32 - 1)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Index of the last entry, or -1 when empty.
    pub fn last_index(&self) -> i32 {
        self.entries.len() as i32 - 1
    }
}
