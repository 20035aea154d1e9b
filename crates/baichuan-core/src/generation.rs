//! Token generation on top of [`BaichuanForCausalLM`].
//!
//! A request runs one context step over all prompts, then generation steps
//! of one token per live sequence. Every step is checked against the input
//! profile before it reaches the model. Sequences stop at `end_id` or after
//! `max_new_tokens`.

use candle_core::{DType, Tensor, D};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::dtype_name;
use crate::error::{Error, Result};
use crate::inputs::{prepare_inputs, InputLimits, InputProfile};
use crate::kv_cache::{KeyValueCacheParams, KvCache, SlotId};
use crate::model::{AttentionParams, BaichuanForCausalLM};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    /// Zero selects greedy decoding.
    #[serde(default)]
    pub temperature: f64,

    #[serde(default)]
    pub top_k: Option<usize>,

    #[serde(default)]
    pub top_p: Option<f64>,

    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default = "default_beam_width")]
    pub beam_width: usize,

    #[serde(default = "default_end_id")]
    pub end_id: u32,

    #[serde(default)]
    pub pad_id: u32,

    /// Beam scores are divided by `length ^ length_penalty`.
    #[serde(default = "default_length_penalty")]
    pub length_penalty: f64,
}

fn default_max_new_tokens() -> usize {
    64
}

fn default_seed() -> u64 {
    42
}

fn default_beam_width() -> usize {
    1
}

fn default_end_id() -> u32 {
    2
}

fn default_length_penalty() -> f64 {
    1.0
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: default_max_new_tokens(),
            temperature: 0.0,
            top_k: None,
            top_p: None,
            seed: default_seed(),
            beam_width: default_beam_width(),
            end_id: default_end_id(),
            pad_id: 0,
            length_penalty: default_length_penalty(),
        }
    }
}

impl GenerationParams {
    pub fn validate(&self) -> Result<()> {
        if self.max_new_tokens == 0 {
            return Err(Error::InvalidInput("max_new_tokens must be non-zero".to_string()));
        }
        if self.beam_width == 0 {
            return Err(Error::InvalidInput("beam_width must be non-zero".to_string()));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(Error::InvalidInput(format!(
                "temperature must be a non-negative number, got {}",
                self.temperature
            )));
        }
        if self.top_k == Some(0) {
            return Err(Error::InvalidInput("top_k must be non-zero".to_string()));
        }
        if let Some(p) = self.top_p {
            if !(p > 0.0 && p <= 1.0) {
                return Err(Error::InvalidInput(format!("top_p must be in (0, 1], got {p}")));
            }
        }
        Ok(())
    }

    pub fn sampling(&self) -> Sampling {
        if self.temperature <= 0.0 {
            return Sampling::ArgMax;
        }
        let temperature = self.temperature;
        match (self.top_k, self.top_p) {
            (None, None) => Sampling::All { temperature },
            (Some(k), None) => Sampling::TopK { k, temperature },
            (None, Some(p)) => Sampling::TopP { p, temperature },
            (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndId,
    Length,
}

/// Result of one prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    /// Generated tokens of the best beam, without the end token.
    pub output_ids: Vec<u32>,
    /// Every returned beam, best first.
    pub beams: Vec<Vec<u32>>,
    /// Summed log-probability of each beam, including its end token.
    pub cum_log_probs: Vec<f32>,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone)]
struct Beam {
    tokens: Vec<u32>,
    log_prob: f32,
    finished: bool,
}

impl Beam {
    fn score(&self, length_penalty: f64) -> f32 {
        let len = self.tokens.len().max(1) as f64;
        self.log_prob / len.powf(length_penalty) as f32
    }
}

pub struct Generator<'a> {
    model: &'a BaichuanForCausalLM,
    limits: InputLimits,
    profile: InputProfile,
}

impl<'a> Generator<'a> {
    /// The profile declares the dtype the model actually runs in, which can
    /// differ from the checkpoint's on CPU.
    pub fn new(model: &'a BaichuanForCausalLM, limits: InputLimits) -> Result<Self> {
        let mut config = model.config().clone();
        config.dtype = dtype_name(model.dtype()).to_string();
        let profile = prepare_inputs(
            &config,
            model.mapping(),
            model.build_config(),
            &limits,
        )?;
        Ok(Self {
            model,
            limits,
            profile,
        })
    }

    pub fn profile(&self) -> &InputProfile {
        &self.profile
    }

    pub fn limits(&self) -> &InputLimits {
        &self.limits
    }

    /// Generate for every prompt. Beam widths above one run beam search.
    pub fn generate(
        &self,
        prompts: &[Vec<u32>],
        params: &GenerationParams,
    ) -> Result<Vec<GenerationOutput>> {
        if params.beam_width > 1 {
            return self.beam_search(prompts, params);
        }
        self.validate(prompts, params)?;

        let mut cache = self.model.new_cache(prompts.len(), self.limits.max_seq_len());
        let outputs = self.sample(&mut cache, prompts, params);
        release_all(&mut cache);
        let outputs = outputs?;
        info!(
            "Generated {} tokens for {} prompt(s)",
            outputs.iter().map(|o| o.output_ids.len()).sum::<usize>(),
            prompts.len()
        );
        Ok(outputs)
    }

    /// Beam search with `params.beam_width` beams per prompt.
    pub fn beam_search(
        &self,
        prompts: &[Vec<u32>],
        params: &GenerationParams,
    ) -> Result<Vec<GenerationOutput>> {
        self.validate(prompts, params)?;
        let width = params.beam_width;
        let mut cache = self
            .model
            .new_cache(prompts.len() * width, self.limits.max_seq_len());
        let outputs = self.run_beam_search(&mut cache, prompts, params);
        release_all(&mut cache);
        let outputs = outputs?;
        info!(
            "Beam search ({width} beams) finished for {} prompt(s)",
            prompts.len()
        );
        Ok(outputs)
    }

    fn validate(&self, prompts: &[Vec<u32>], params: &GenerationParams) -> Result<()> {
        params.validate()?;
        if prompts.is_empty() || prompts.len() > self.limits.max_batch_size {
            return Err(Error::InvalidInput(format!(
                "batch of {} prompts, expected 1..={}",
                prompts.len(),
                self.limits.max_batch_size
            )));
        }
        if params.beam_width > self.limits.max_beam_width {
            return Err(Error::InvalidInput(format!(
                "beam width {} exceeds the maximum of {}",
                params.beam_width, self.limits.max_beam_width
            )));
        }
        if params.max_new_tokens > self.limits.max_new_tokens {
            return Err(Error::InvalidInput(format!(
                "max_new_tokens {} exceeds the maximum of {}",
                params.max_new_tokens, self.limits.max_new_tokens
            )));
        }
        let vocab_size = self.model.config().vocab_size;
        for (i, prompt) in prompts.iter().enumerate() {
            if prompt.is_empty() || prompt.len() > self.limits.max_input_len {
                return Err(Error::InvalidInput(format!(
                    "prompt {i} has {} tokens, expected 1..={}",
                    prompt.len(),
                    self.limits.max_input_len
                )));
            }
            if let Some(&bad) = prompt.iter().find(|&&t| t as usize >= vocab_size) {
                return Err(Error::InvalidInput(format!(
                    "prompt {i} holds token {bad} outside the vocabulary of {vocab_size}"
                )));
            }
        }
        let width = params.beam_width;
        self.profile.check(
            "cache_indirection",
            &[prompts.len(), width, self.limits.max_seq_len()],
        )
    }

    fn sample(
        &self,
        cache: &mut KvCache,
        prompts: &[Vec<u32>],
        params: &GenerationParams,
    ) -> Result<Vec<GenerationOutput>> {
        let batch = prompts.len();
        let mut processors: Vec<LogitsProcessor> = (0..batch)
            .map(|b| {
                let seed = params.seed.wrapping_add(b as u64);
                LogitsProcessor::from_sampling(seed, params.sampling())
            })
            .collect();
        let mut tokens: Vec<Vec<u32>> = vec![Vec::new(); batch];
        let mut log_probs = vec![0f32; batch];
        let mut finish = vec![FinishReason::Length; batch];

        let mut active: Vec<usize> = (0..batch).collect();
        let mut logits = self.context_step(cache, prompts, active.clone(), params.pad_id)?;
        loop {
            let step_log_probs = log_softmax_rows(&logits)?;
            let mut next = Vec::with_capacity(active.len());
            for (row, &b) in active.iter().enumerate() {
                let token = processors[b].sample(&logits.get(row)?)?;
                log_probs[b] += step_log_probs[row][token as usize];
                if token == params.end_id {
                    finish[b] = FinishReason::EndId;
                    continue;
                }
                tokens[b].push(token);
                if tokens[b].len() < params.max_new_tokens {
                    next.push((b, token));
                }
            }
            if next.is_empty() {
                break;
            }
            active = next.iter().map(|&(b, _)| b).collect();
            let context_lengths = active.iter().map(|&b| prompts[b].len()).collect();
            logits = self.generation_step(cache, &next, context_lengths)?;
        }

        Ok(tokens
            .into_iter()
            .zip(log_probs)
            .zip(finish)
            .map(|((tokens, log_prob), finish_reason)| GenerationOutput {
                output_ids: tokens.clone(),
                beams: vec![tokens],
                cum_log_probs: vec![log_prob],
                finish_reason,
            })
            .collect())
    }

    fn run_beam_search(
        &self,
        cache: &mut KvCache,
        prompts: &[Vec<u32>],
        params: &GenerationParams,
    ) -> Result<Vec<GenerationOutput>> {
        let batch = prompts.len();
        let width = params.beam_width;
        let slot = |b: usize, w: usize| b * width + w;

        let logits = self.context_step(
            cache,
            prompts,
            (0..batch).map(|b| slot(b, 0)).collect(),
            params.pad_id,
        )?;
        let first = log_softmax_rows(&logits)?;

        let root = Beam {
            tokens: Vec::new(),
            log_prob: 0.0,
            finished: false,
        };
        let mut beams: Vec<Vec<Beam>> = Vec::with_capacity(batch);
        let mut finished: Vec<Vec<Beam>> = vec![Vec::new(); batch];
        let mut done = vec![false; batch];
        for b in 0..batch {
            for w in 1..width {
                cache.fork(slot(b, 0), slot(b, w))?;
            }
            let (next, ended) = select_beams(
                std::slice::from_ref(&root),
                std::slice::from_ref(&first[b]),
                width,
                params.end_id,
            );
            finished[b].extend(ended);
            beams.push(next.into_iter().map(|(_, beam)| beam).collect());
            done[b] = is_done(&beams[b], &finished[b], width, params.max_new_tokens);
        }

        loop {
            let mut rows = Vec::new();
            let mut context_lengths = Vec::new();
            for b in (0..batch).filter(|&b| !done[b]) {
                for (w, beam) in beams[b].iter().enumerate() {
                    let last = beam.tokens.last().copied().unwrap_or(params.pad_id);
                    rows.push((slot(b, w), last));
                    context_lengths.push(prompts[b].len());
                }
            }
            if rows.is_empty() {
                break;
            }
            let logits = self.generation_step(cache, &rows, context_lengths)?;
            let step = log_softmax_rows(&logits)?;

            let mut offset = 0;
            let mut slots = Vec::new();
            let mut sources = Vec::new();
            let live: Vec<usize> = (0..batch).filter(|&b| !done[b]).collect();
            for b in live {
                let n = beams[b].len();
                let (next, ended) =
                    select_beams(&beams[b], &step[offset..offset + n], width, params.end_id);
                offset += n;
                finished[b].extend(ended);
                for (w, (parent, _)) in next.iter().enumerate() {
                    slots.push(slot(b, w));
                    sources.push(slot(b, *parent));
                }
                beams[b] = next.into_iter().map(|(_, beam)| beam).collect();
                done[b] = is_done(&beams[b], &finished[b], width, params.max_new_tokens);
            }
            cache.reorder(&slots, &sources)?;
        }

        Ok(beams
            .into_iter()
            .zip(finished)
            .map(|(alive, mut hypotheses)| {
                if hypotheses.len() < width {
                    hypotheses.extend(alive);
                }
                hypotheses.sort_by(|a, b| {
                    b.score(params.length_penalty)
                        .total_cmp(&a.score(params.length_penalty))
                });
                hypotheses.truncate(width);
                let finish_reason = if hypotheses.first().is_some_and(|h| h.finished) {
                    FinishReason::EndId
                } else {
                    FinishReason::Length
                };
                GenerationOutput {
                    output_ids: hypotheses.first().map(|h| h.tokens.clone()).unwrap_or_default(),
                    cum_log_probs: hypotheses.iter().map(|h| h.log_prob).collect(),
                    beams: hypotheses.into_iter().map(|h| h.tokens).collect(),
                    finish_reason,
                }
            })
            .collect())
    }

    /// Run all prompts through the model and return logits `[batch, vocab]`.
    fn context_step(
        &self,
        cache: &mut KvCache,
        prompts: &[Vec<u32>],
        slots: Vec<SlotId>,
        pad_id: u32,
    ) -> Result<Tensor> {
        let build = self.model.build_config();
        let device = self.model.device();
        let batch = prompts.len();
        let lengths: Vec<usize> = prompts.iter().map(Vec::len).collect();

        let (input_ids, last_token_ids, params) = if build.remove_input_padding {
            let flat = prompts.concat();
            let num_tokens = flat.len();
            let last_token_ids = lengths
                .iter()
                .scan(0, |total, len| {
                    *total += len;
                    Some(*total)
                })
                .collect();
            (
                Tensor::from_vec(flat, (1, num_tokens), device)?,
                last_token_ids,
                AttentionParams::context(lengths.clone()),
            )
        } else {
            let width = lengths.iter().copied().max().unwrap_or(0);
            let mut flat = Vec::with_capacity(batch * width);
            let mut mask = Vec::with_capacity(batch * width);
            for prompt in prompts {
                flat.extend_from_slice(prompt);
                flat.extend(std::iter::repeat(pad_id).take(width - prompt.len()));
                mask.extend(std::iter::repeat(1u32).take(prompt.len()));
                mask.extend(std::iter::repeat(0u32).take(width - prompt.len()));
            }
            let params = if build.gpt_attention_plugin {
                AttentionParams::context(lengths.clone())
            } else {
                let mask = Tensor::from_vec(mask, (batch, width), device)?;
                self.profile.check("attention_mask", mask.dims())?;
                AttentionParams::from_attention_mask(&mask)?
            };
            (
                Tensor::from_vec(flat, (batch, width), device)?,
                lengths.clone(),
                params,
            )
        };

        self.check_step(&input_ids, batch, 0, &lengths)?;
        self.run(cache, &input_ids, &last_token_ids, &params, slots)
    }

    /// Feed one token per `(slot, token)` row and return logits `[rows, vocab]`.
    fn generation_step(
        &self,
        cache: &mut KvCache,
        rows: &[(SlotId, u32)],
        context_lengths: Vec<usize>,
    ) -> Result<Tensor> {
        let build = self.model.build_config();
        let device = self.model.device();
        let n = rows.len();
        let slots: Vec<SlotId> = rows.iter().map(|&(slot, _)| slot).collect();
        let tokens: Vec<u32> = rows.iter().map(|&(_, token)| token).collect();

        let (input_ids, last_token_ids): (Tensor, Vec<usize>) = if build.remove_input_padding {
            (Tensor::from_vec(tokens, (1, n), device)?, (1..=n).collect())
        } else {
            (Tensor::from_vec(tokens, (n, 1), device)?, vec![1; n])
        };

        let past: Vec<usize> = slots.iter().map(|&s| cache.seq_len(s)).collect();
        let max_past = past.iter().copied().max().unwrap_or(0);
        if !build.gpt_attention_plugin {
            self.profile.check("attention_mask", &[n, max_past + 1])?;
        }
        let after: Vec<usize> = past.iter().map(|p| p + 1).collect();
        self.check_step(&input_ids, n, max_past, &after)?;

        let params = AttentionParams::generation(context_lengths);
        self.run(cache, &input_ids, &last_token_ids, &params, slots)
    }

    fn check_step(
        &self,
        input_ids: &Tensor,
        batch: usize,
        max_past: usize,
        lengths_after: &[usize],
    ) -> Result<()> {
        let build = self.model.build_config();
        let config = self.model.config();
        self.profile.check("input_ids", input_ids.dims())?;
        self.profile.check("position_ids", input_ids.dims())?;
        self.profile.check("last_token_ids", &[batch])?;
        if build.gpt_attention_plugin {
            for name in [
                "sequence_length",
                "host_request_types",
                "host_past_key_value_lengths",
                "context_lengths",
            ] {
                self.profile.check(name, &[batch])?;
            }
            if build.remove_input_padding {
                self.profile.check("host_context_lengths", &[batch])?;
            }
        }
        if build.paged_kv_cache {
            let max_len = lengths_after.iter().copied().max().unwrap_or(0);
            let blocks = max_len.div_ceil(build.tokens_per_block);
            self.profile
                .check("kv_cache_block_pointers_0", &[batch, 2, blocks])?;
        } else {
            let local_heads = config.num_kv_heads() / self.model.mapping().tp_size;
            self.profile.check(
                "past_key_value_0",
                &[batch, 2, local_heads, max_past, config.head_size()],
            )?;
        }
        debug!(
            "Step of {batch} sequence(s): input_ids {:?}, past {max_past}",
            input_ids.dims()
        );
        Ok(())
    }

    fn run(
        &self,
        cache: &mut KvCache,
        input_ids: &Tensor,
        last_token_ids: &[usize],
        params: &AttentionParams,
        slots: Vec<SlotId>,
    ) -> Result<Tensor> {
        let outputs = self.model.forward(
            input_ids,
            Some(last_token_ids),
            params,
            Some(KeyValueCacheParams::new(cache, slots)),
        )?;
        let vocab_size = self.model.config().vocab_size;
        outputs
            .logits()?
            .narrow(1, 0, vocab_size)?
            .to_dtype(DType::F32)
            .map_err(Error::from)
    }
}

fn release_all(cache: &mut KvCache) {
    for slot in 0..cache.max_slots() {
        cache.release(slot);
    }
}

fn log_softmax_rows(logits: &Tensor) -> Result<Vec<Vec<f32>>> {
    candle_nn::ops::log_softmax(logits, D::Minus1)?
        .to_vec2::<f32>()
        .map_err(Error::from)
}

/// Indices of the `k` largest values, largest first; ties keep the lower index.
fn top_k_indices(values: &[f32], k: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..values.len()).collect();
    indices.sort_by(|&a, &b| values[b].total_cmp(&values[a]).then(a.cmp(&b)));
    indices.truncate(k);
    indices
}

/// Extend `parents` by one token each and keep the best `width` candidates.
///
/// Returns the surviving beams with their parent index, plus the hypotheses
/// that ended with `end_id` among the top `width` candidates.
fn select_beams(
    parents: &[Beam],
    log_probs: &[Vec<f32>],
    width: usize,
    end_id: u32,
) -> (Vec<(usize, Beam)>, Vec<Beam>) {
    let mut candidates = Vec::with_capacity(parents.len() * 2 * width);
    for (p, (parent, row)) in parents.iter().zip(log_probs).enumerate() {
        for token in top_k_indices(row, 2 * width) {
            candidates.push((parent.log_prob + row[token], p, token as u32));
        }
    }
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

    let mut next = Vec::with_capacity(width);
    let mut ended = Vec::new();
    for (rank, (log_prob, p, token)) in candidates.into_iter().enumerate() {
        if token == end_id {
            if rank < width {
                ended.push(Beam {
                    tokens: parents[p].tokens.clone(),
                    log_prob,
                    finished: true,
                });
            }
            continue;
        }
        let mut tokens = parents[p].tokens.clone();
        tokens.push(token);
        next.push((
            p,
            Beam {
                tokens,
                log_prob,
                finished: false,
            },
        ));
        if next.len() == width {
            break;
        }
    }
    (next, ended)
}

fn is_done(alive: &[Beam], finished: &[Beam], width: usize, max_new_tokens: usize) -> bool {
    finished.len() >= width
        || alive.is_empty()
        || alive.iter().all(|b| b.tokens.len() >= max_new_tokens)
}
