//! Generation loop
//!
//! Drives decode/sample over a context the caller has already locked. Every
//! sampled token goes through UTF-8 assembly and the stop filter before it
//! reaches the chunk sink, so the concatenated chunks always equal the final
//! text of a choice.
//!
//! With prefix caching the prompt is decoded once into sequence 0 and copied
//! into the other choices' sequences; all choices then advance together, one
//! token each per decode. Without it, memory is cleared and each choice
//! decodes the prompt into its own sequence before generating. Either way
//! memory is cleared at the start of every call: prefix caching shares the
//! prompt between the choices of one call and reuses nothing across calls.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{NativeResultExt, Result, ServeError};
use crate::inference::options::{finish_reason, random_seed, FinishReason, GenerationOptions, TokenEvent, Usage};
use crate::inference::stop::StopMarkerFilter;
use crate::inference::streaming::Chunk;
use crate::inference::utf8::Utf8Buffer;
use crate::prefix::PrefixCache;
use crate::runtime::{NativeContext, NativeModel, RuntimeError, SamplerId, SamplerParams, SeqId, Token, TokenBatch};

/// Final text of one choice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ChoiceOutput {
    pub index: u32,
    pub text: String,
    pub finish_reason: FinishReason,
    pub completion_tokens: u32,
}

/// Result of one generation call
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub choices: Vec<ChoiceOutput>,
    pub usage: Usage,
}

/// Receives filtered chunks; an error aborts generation and is returned as-is.
pub type ChunkSink<'s> = dyn FnMut(Chunk) -> Result<()> + 's;

struct ChoiceState {
    index: u32,
    seq: SeqId,
    sampler: SamplerId,
    /// Next position to write in `seq`
    pos: i32,
    /// Batch index holding this choice's logits
    logits: i32,
    n_out: u32,
    utf8: Utf8Buffer,
    filter: StopMarkerFilter,
    text: String,
    stop_hit: bool,
    eog: bool,
    finish: Option<FinishReason>,
}

impl ChoiceState {
    fn new(index: u32, sampler: SamplerId, stop: &[String]) -> Self {
        Self {
            index,
            seq: index as SeqId,
            sampler,
            pos: 0,
            logits: -1,
            n_out: 0,
            utf8: Utf8Buffer::new(),
            filter: StopMarkerFilter::new(stop.iter().cloned()),
            text: String::new(),
            stop_hit: false,
            eog: false,
            finish: None,
        }
    }

    fn emit(&mut self, piece: &str, sink: &mut ChunkSink<'_>) -> Result<()> {
        let (text, stopped) = self.filter.process(piece);
        if stopped {
            self.stop_hit = true;
        }
        self.push(text, sink)
    }

    fn push(&mut self, text: String, sink: &mut ChunkSink<'_>) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.text.push_str(&text);
        sink(Chunk::new(self.index, text))
    }

    fn finish(&mut self, max_tokens: u32, sink: &mut ChunkSink<'_>) -> Result<()> {
        if !self.filter.is_stopped() {
            let tail = self.utf8.flush();
            self.emit(&tail, sink)?;
        }
        if !self.filter.is_stopped() {
            let withheld = self.filter.flush();
            self.push(withheld, sink)?;
        }

        let reason = finish_reason(self.n_out, max_tokens, self.stop_hit, self.eog);
        tracing::debug!(choice = self.index, tokens = self.n_out, reason = %reason, "Choice finished");
        self.finish = Some(reason);
        Ok(())
    }

    fn output(self) -> ChoiceOutput {
        ChoiceOutput {
            index: self.index,
            text: self.text,
            finish_reason: self.finish.unwrap_or(FinishReason::MaxTokens),
            completion_tokens: self.n_out,
        }
    }
}

/// Runs generations against one locked model/context pair
pub struct Generator<'g, C: NativeContext + ?Sized> {
    model: &'g dyn NativeModel,
    ctx: &'g mut C,
    /// Model path, attached to native errors
    label: String,
}

impl<'g, C: NativeContext + ?Sized> Generator<'g, C> {
    pub fn new(model: &'g dyn NativeModel, ctx: &'g mut C, label: impl Into<String>) -> Self {
        Self {
            model,
            ctx,
            label: label.into(),
        }
    }

    /// Generates `options.n` continuations of `prompt`.
    ///
    /// Memory is cleared first; nothing from an earlier call on this context
    /// is visible to the new prompt.
    pub fn run(
        &mut self,
        prompt: &[Token],
        options: &mut GenerationOptions,
        sink: &mut ChunkSink<'_>,
    ) -> Result<Generation> {
        if prompt.is_empty() {
            return Err(ServeError::InvalidArgument("prompt is empty".to_string()));
        }
        let n = options.n.max(1);
        if n > self.ctx.n_seq_max() {
            return Err(ServeError::InvalidArgument(format!(
                "{n} choices need {n} sequences but the context has {}",
                self.ctx.n_seq_max()
            )));
        }
        if prompt.len() >= self.ctx.n_ctx() as usize {
            return Err(ServeError::NoKvSlot(prompt.len()));
        }

        if let Some(cancel) = &options.cancel {
            self.ctx.set_abort_callback(Some(cancel.abort_callback()));
        }
        let result = self.run_choices(prompt, n, options, sink);
        if options.cancel.is_some() {
            self.ctx.set_abort_callback(None);
        }
        result
    }

    fn run_choices(
        &mut self,
        prompt: &[Token],
        n: u32,
        options: &mut GenerationOptions,
        sink: &mut ChunkSink<'_>,
    ) -> Result<Generation> {
        tracing::debug!(
            model = %self.label,
            prompt_tokens = prompt.len(),
            choices = n,
            prefix_caching = options.prefix_caching,
            "Starting generation"
        );

        let seed = match options.sampler.seed {
            0 => random_seed(),
            seed => seed,
        };
        let mut choices = Vec::with_capacity(n as usize);
        for index in 0..n {
            let params = SamplerParams {
                seed: seed.wrapping_add(index),
                ..options.sampler.clone()
            };
            let sampler = self.ctx.add_sampler(&params).native("add_sampler", &self.label)?;
            choices.push(ChoiceState::new(index, sampler, &options.stop));
        }

        let mut prompt_time = Duration::ZERO;
        let mut generation_time = Duration::ZERO;
        let prompt_end = prompt.len() as i32;

        if options.prefix_caching {
            let started = Instant::now();
            PrefixCache::new(&mut *self.ctx).clear_all(false);
            let logits = self.decode_prompt(prompt, 0)?;
            PrefixCache::new(&mut *self.ctx)
                .share_prefix(0, 1..n as SeqId)
                .native("copy_sequence", &self.label)?;
            for choice in &mut choices {
                choice.logits = logits;
                choice.pos = prompt_end;
            }
            prompt_time += started.elapsed();

            let started = Instant::now();
            self.step_until_done(&mut choices, options, sink)?;
            generation_time += started.elapsed();
        } else {
            for choice in &mut choices {
                let started = Instant::now();
                PrefixCache::new(&mut *self.ctx).clear_all(false);
                choice.logits = self.decode_prompt(prompt, choice.seq)?;
                choice.pos = prompt_end;
                prompt_time += started.elapsed();

                let started = Instant::now();
                self.step_until_done(std::slice::from_mut(choice), options, sink)?;
                generation_time += started.elapsed();
            }
        }

        let completion_tokens: u32 = choices.iter().map(|c| c.n_out).sum();
        let usage = Usage::new(
            prompt.len() as u32,
            completion_tokens,
            prompt_time.as_secs_f64() * 1000.0,
            generation_time.as_secs_f64() * 1000.0,
        );
        tracing::debug!(
            model = %self.label,
            completion_tokens,
            tokens_per_second = usage.tokens_per_second,
            "Generation finished"
        );

        Ok(Generation {
            choices: choices.into_iter().map(ChoiceState::output).collect(),
            usage,
        })
    }

    /// Decodes `prompt` into `seq` in `n_batch` chunks. Returns the batch
    /// index of the last prompt token, which carries the logits.
    fn decode_prompt(&mut self, prompt: &[Token], seq: SeqId) -> Result<i32> {
        let n_batch = (self.ctx.n_batch() as usize).max(1);
        let last = prompt.len() - 1;
        let mut batch = TokenBatch::new(n_batch.min(prompt.len()));

        for (chunk_index, chunk) in prompt.chunks(n_batch).enumerate() {
            batch.clear();
            for (offset, &token) in chunk.iter().enumerate() {
                let pos = chunk_index * n_batch + offset;
                batch
                    .add(token, pos as i32, &[seq], pos == last)
                    .native("batch", &self.label)?;
            }
            self.ctx.decode(&batch).native("decode", &self.label)?;
        }
        Ok(batch.last_index())
    }

    fn step_until_done(
        &mut self,
        choices: &mut [ChoiceState],
        options: &mut GenerationOptions,
        sink: &mut ChunkSink<'_>,
    ) -> Result<()> {
        let n_ctx = self.ctx.n_ctx() as i32;
        let mut batch = TokenBatch::new(choices.len().max(1));
        let mut pending = Vec::with_capacity(choices.len());

        while choices.iter().any(|c| c.finish.is_none()) {
            if options.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                tracing::debug!(model = %self.label, "Generation cancelled");
                return Err(ServeError::Cancelled);
            }

            batch.clear();
            pending.clear();

            for (slot, choice) in choices.iter_mut().enumerate() {
                if choice.finish.is_some() {
                    continue;
                }

                let token = self
                    .ctx
                    .sample(choice.sampler, choice.logits)
                    .native("sample", &self.label)?;

                if self.model.is_eog(token) {
                    tracing::trace!(choice = choice.index, "End of generation token");
                    choice.eog = true;
                    choice.finish(options.max_tokens, sink)?;
                    continue;
                }

                choice.n_out += 1;
                let bytes = self
                    .model
                    .token_to_piece(token, false)
                    .native("token_to_piece", &self.label)?;
                let piece = choice.utf8.push(&bytes);

                let halt = match options.on_token.as_mut() {
                    Some(hook) => hook(TokenEvent {
                        choice: choice.index,
                        token,
                        piece: &piece,
                    })
                    .is_break(),
                    None => false,
                };

                choice.emit(&piece, sink)?;
                if halt {
                    choice.stop_hit = true;
                }

                if choice.stop_hit || choice.n_out >= options.max_tokens || choice.pos >= n_ctx {
                    choice.finish(options.max_tokens, sink)?;
                    continue;
                }

                choice.logits = batch
                    .add(token, choice.pos, &[choice.seq], true)
                    .native("batch", &self.label)?;
                choice.pos += 1;
                pending.push(slot);
            }

            if batch.is_empty() {
                continue;
            }

            match self.ctx.decode(&batch) {
                Ok(()) => {}
                Err(RuntimeError::NoKvSlot(_)) => {
                    tracing::debug!(model = %self.label, "Context exhausted");
                    for &slot in &pending {
                        choices[slot].finish(options.max_tokens, sink)?;
                    }
                }
                Err(e) => return Err(e).native("decode", &self.label),
            }
        }
        Ok(())
    }
}
