//! KV-cache sequence sharing
//!
//! A prompt prefix decoded once into one sequence can be copied into others,
//! which then decode their own continuations. Copies are snapshots: the
//! destination evolves independently of the source afterwards.

use std::ops::Range;

use crate::runtime::{NativeContext, RuntimeError, SeqId};

/// Result of a partial eviction request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// The memory type can only be cleared whole (e.g. recurrent state)
    NotSupported,
}

/// Memory operations over one context
pub struct PrefixCache<'c, C: NativeContext + ?Sized> {
    ctx: &'c mut C,
}

impl<'c, C: NativeContext + ?Sized> PrefixCache<'c, C> {
    pub fn new(ctx: &'c mut C) -> Self {
        Self { ctx }
    }

    /// Drops every cached position of every sequence.
    pub fn clear_all(&mut self, data: bool) {
        self.ctx.memory_clear(data);
        tracing::trace!("KV cache cleared");
    }

    /// Snapshots `src` positions `[p0, p1)` into `dst`. Negative bounds are
    /// open, so `(-1, -1)` copies the whole sequence.
    pub fn copy_sequence(&mut self, src: SeqId, dst: SeqId, p0: i32, p1: i32) -> Result<(), RuntimeError> {
        if src == dst {
            return Ok(());
        }
        self.ctx.memory_seq_cp(src, dst, p0, p1)?;
        tracing::trace!(src, dst, p0, p1, "Sequence copied");
        Ok(())
    }

    /// Copies the whole of `src` into every sequence in `targets`.
    pub fn share_prefix(&mut self, src: SeqId, targets: Range<SeqId>) -> Result<(), RuntimeError> {
        for dst in targets {
            self.copy_sequence(src, dst, -1, -1)?;
        }
        Ok(())
    }

    /// Evicts positions `[p0, p1)` of `seq`. Callers must handle
    /// [`RemoveOutcome::NotSupported`]; see [`Self::remove_or_clear`].
    pub fn remove_range(&mut self, seq: SeqId, p0: i32, p1: i32) -> Result<RemoveOutcome, RuntimeError> {
        if self.ctx.memory_seq_rm(seq, p0, p1)? {
            Ok(RemoveOutcome::Removed)
        } else {
            Ok(RemoveOutcome::NotSupported)
        }
    }

    /// Like [`Self::remove_range`] but falls back to clearing everything.
    pub fn remove_or_clear(&mut self, seq: SeqId, p0: i32, p1: i32) -> Result<RemoveOutcome, RuntimeError> {
        let outcome = self.remove_range(seq, p0, p1)?;
        if outcome == RemoveOutcome::NotSupported {
            tracing::debug!(seq, p0, p1, "Partial eviction unsupported, clearing KV cache");
            self.clear_all(false);
        }
        Ok(outcome)
    }

    /// Number of cached positions spanned by `seq`, 0 when empty.
    pub fn sequence_length(&self, seq: SeqId) -> u32 {
        let min = self.ctx.memory_seq_pos_min(seq);
        let max = self.ctx.memory_seq_pos_max(seq);
        if min < 0 || max < 0 {
            return 0;
        }
        (max - min + 1) as u32
    }

    /// Next free position of `seq`.
    pub fn next_position(&self, seq: SeqId) -> i32 {
        self.ctx.memory_seq_pos_max(seq) + 1
    }

    pub fn context(&mut self) -> &mut C {
        self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContextParams, ModelParams, NativeModel, NativeRuntime, SimRuntime, TokenBatch, TokenizeOptions};
    use std::io::Write;

    fn load(runtime: &SimRuntime) -> (tempfile::NamedTempFile, Box<dyn NativeModel>) {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(b"sim").unwrap();
        let model = runtime.load_model(file.path(), &ModelParams::default()).unwrap();
        (file, model)
    }

    fn params(n_seq_max: u32) -> ContextParams {
        ContextParams {
            n_ctx: 256,
            n_seq_max,
            ..ContextParams::default()
        }
    }

    fn decode_text<C: NativeContext + ?Sized>(model: &dyn NativeModel, ctx: &mut C, seq: SeqId, text: &str) {
        let tokens = model.tokenize(text, TokenizeOptions::default()).unwrap();
        let start = ctx.memory_seq_pos_max(seq) + 1;
        let mut batch = TokenBatch::new(tokens.len());
        for (i, &token) in tokens.iter().enumerate() {
            batch.add(token, start + i as i32, &[seq], false).unwrap();
        }
        ctx.decode(&batch).unwrap();
    }

    #[test]
    fn test_copy_is_independent_snapshot() {
        let runtime = SimRuntime::new();
        let (_file, model) = load(&runtime);
        let mut ctx = model.new_context(&params(2)).unwrap();

        decode_text(model.as_ref(), ctx.as_mut(), 0, "system: ");
        let mut cache = PrefixCache::new(ctx.as_mut());
        cache.copy_sequence(0, 1, -1, -1).unwrap();
        assert_eq!(cache.sequence_length(0), 8);
        assert_eq!(cache.sequence_length(1), 8);

        decode_text(model.as_ref(), cache.context(), 0, "a");
        decode_text(model.as_ref(), cache.context(), 1, "longer suffix");

        let cache = PrefixCache::new(ctx.as_mut());
        assert_eq!(cache.sequence_length(0), 9);
        assert_eq!(cache.sequence_length(1), 21);
        assert_ne!(cache.sequence_length(0), cache.sequence_length(1));
    }

    #[test]
    fn test_mutating_copy_leaves_source() {
        let runtime = SimRuntime::new();
        let (_file, model) = load(&runtime);
        let mut ctx = model.new_context(&params(2)).unwrap();

        decode_text(model.as_ref(), ctx.as_mut(), 0, "shared");
        let mut cache = PrefixCache::new(ctx.as_mut());
        cache.copy_sequence(0, 1, -1, -1).unwrap();
        assert_eq!(cache.remove_range(1, 3, -1).unwrap(), RemoveOutcome::Removed);

        assert_eq!(cache.sequence_length(1), 3);
        assert_eq!(cache.sequence_length(0), 6);
        assert_eq!(cache.next_position(0), 6);
        assert_eq!(cache.next_position(1), 3);
    }

    #[test]
    fn test_copy_window() {
        let runtime = SimRuntime::new();
        let (_file, model) = load(&runtime);
        let mut ctx = model.new_context(&params(2)).unwrap();

        decode_text(model.as_ref(), ctx.as_mut(), 0, "abcdef");
        let mut cache = PrefixCache::new(ctx.as_mut());
        cache.copy_sequence(0, 1, 0, 4).unwrap();
        assert_eq!(cache.sequence_length(1), 4);
    }

    #[test]
    fn test_share_prefix_to_many() {
        let runtime = SimRuntime::new();
        let (_file, model) = load(&runtime);
        let mut ctx = model.new_context(&params(4)).unwrap();

        decode_text(model.as_ref(), ctx.as_mut(), 0, "prefix");
        let mut cache = PrefixCache::new(ctx.as_mut());
        cache.share_prefix(0, 1..4).unwrap();
        for seq in 0..4 {
            assert_eq!(cache.sequence_length(seq), 6);
        }
    }

    #[test]
    fn test_empty_sequence_length_is_zero() {
        let runtime = SimRuntime::new();
        let (_file, model) = load(&runtime);
        let mut ctx = model.new_context(&params(1)).unwrap();
        let cache = PrefixCache::new(ctx.as_mut());
        assert_eq!(cache.sequence_length(0), 0);
        assert_eq!(cache.next_position(0), 0);
    }

    #[test]
    fn test_partial_removal_not_supported() {
        let runtime = SimRuntime::new().with_partial_eviction(false);
        let (_file, model) = load(&runtime);
        let mut ctx = model.new_context(&params(1)).unwrap();

        decode_text(model.as_ref(), ctx.as_mut(), 0, "stale");
        let mut cache = PrefixCache::new(ctx.as_mut());
        assert_eq!(cache.remove_range(0, 2, -1).unwrap(), RemoveOutcome::NotSupported);
        assert_eq!(cache.sequence_length(0), 5);

        assert_eq!(cache.remove_or_clear(0, 2, -1).unwrap(), RemoveOutcome::NotSupported);
        assert_eq!(cache.sequence_length(0), 0);
    }

    #[test]
    fn test_clear_all() {
        let runtime = SimRuntime::new();
        let (_file, model) = load(&runtime);
        let mut ctx = model.new_context(&params(2)).unwrap();

        decode_text(model.as_ref(), ctx.as_mut(), 0, "one");
        decode_text(model.as_ref(), ctx.as_mut(), 1, "two");
        let mut cache = PrefixCache::new(ctx.as_mut());
        cache.clear_all(true);
        assert_eq!(cache.sequence_length(0), 0);
        assert_eq!(cache.sequence_length(1), 0);
    }
}
