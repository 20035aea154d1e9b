//! Baichuan decoder stack and causal-LM head.

use std::collections::BTreeMap;
use std::sync::Arc;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, RmsNorm, VarBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{BaichuanConfig, BuildConfig};
use crate::error::{Error, Result};
use crate::kv_cache::{KeyValueCacheParams, KvCache, SlotId};
use crate::layers::attention::{Attention, Segment};
use crate::layers::mlp::GatedMlp;
use crate::layers::parallel::{ColumnLinear, Communicator};
use crate::mapping::{pad_vocab_size, Mapping};

/// Phase of a batch row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RequestType {
    /// Prompt processing: every prompt token is new.
    Context = 0,
    /// One new token on top of the cached sequence.
    Generation = 1,
}

/// Per-row lengths and phases of one forward step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionParams {
    pub request_types: Vec<RequestType>,
    /// Prompt length of every row.
    pub context_lengths: Vec<usize>,
    pub max_context_length: usize,
}

impl AttentionParams {
    /// All rows are prompts of the given lengths.
    pub fn context(context_lengths: Vec<usize>) -> Self {
        let max_context_length = context_lengths.iter().copied().max().unwrap_or(0);
        Self {
            request_types: vec![RequestType::Context; context_lengths.len()],
            context_lengths,
            max_context_length,
        }
    }

    /// All rows decode one token past their prompts.
    pub fn generation(context_lengths: Vec<usize>) -> Self {
        let max_context_length = context_lengths.iter().copied().max().unwrap_or(0);
        Self {
            request_types: vec![RequestType::Generation; context_lengths.len()],
            context_lengths,
            max_context_length,
        }
    }

    /// Context rows from a right-padded 0/1 mask `[batch, len]`. Every row
    /// must be a run of ones followed only by zeros.
    pub fn from_attention_mask(mask: &Tensor) -> Result<Self> {
        let (_batch, len) = mask.dims2()?;
        let rows = mask.to_dtype(DType::U32)?.to_vec2::<u32>()?;
        let mut context_lengths = Vec::with_capacity(rows.len());
        for (b, row) in rows.iter().enumerate() {
            let ones = row.iter().take_while(|&&m| m != 0).count();
            if ones == 0 {
                return Err(Error::InvalidInput(format!(
                    "attention mask row {b} holds no tokens, expected 1..={len}"
                )));
            }
            if row[ones..].iter().any(|&m| m != 0) {
                return Err(Error::InvalidInput(format!(
                    "attention mask row {b} is not right-padded"
                )));
            }
            context_lengths.push(ones);
        }
        Ok(Self::context(context_lengths))
    }

    pub fn batch_size(&self) -> usize {
        self.request_types.len()
    }

    /// Tokens the row contributes to this step.
    pub fn new_tokens(&self, row: usize) -> usize {
        match self.request_types[row] {
            RequestType::Context => self.context_lengths[row],
            RequestType::Generation => 1,
        }
    }

    /// Sequence length of every row once this step is done.
    pub fn sequence_length(&self, past_key_value_lengths: &[usize]) -> Vec<usize> {
        past_key_value_lengths
            .iter()
            .enumerate()
            .map(|(row, past)| past + self.new_tokens(row))
            .collect()
    }

    fn validate(&self) -> Result<()> {
        if self.request_types.is_empty() {
            return Err(Error::InvalidInput("empty batch".to_string()));
        }
        if self.context_lengths.len() != self.request_types.len() {
            return Err(Error::InvalidInput(format!(
                "{} context lengths for {} request types",
                self.context_lengths.len(),
                self.request_types.len()
            )));
        }
        if self.context_lengths.contains(&0) {
            return Err(Error::InvalidInput("context length must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Named outputs of one forward step.
#[derive(Debug, Clone, Default)]
pub struct ModelOutputs {
    outputs: BTreeMap<String, Tensor>,
}

impl ModelOutputs {
    pub fn mark_output(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.outputs.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.outputs.get(name)
    }

    pub fn logits(&self) -> Result<&Tensor> {
        self.get("logits")
            .ok_or_else(|| Error::InferenceError("logits were not produced".to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct BaichuanDecoderLayer {
    input_layernorm: RmsNorm,
    self_attn: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: GatedMlp,
}

impl BaichuanDecoderLayer {
    pub fn load(cfg: &BaichuanConfig, vb: VarBuilder, comm: Arc<dyn Communicator>) -> Result<Self> {
        let input_layernorm =
            candle_nn::rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?;
        let self_attn = Attention::load(cfg, vb.pp("self_attn"), comm.clone())?;
        let post_attention_layernorm = candle_nn::rms_norm(
            cfg.hidden_size,
            cfg.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;
        let mlp = GatedMlp::load(cfg, vb.pp("mlp"), comm)?;
        Ok(Self {
            input_layernorm,
            self_attn,
            post_attention_layernorm,
            mlp,
        })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        segments: &[Segment],
        cache: Option<&mut KvCache>,
        layer_idx: usize,
    ) -> Result<Tensor> {
        let normed = self.input_layernorm.forward(x)?;
        let attn_out = self.self_attn.forward(&normed, segments, cache, layer_idx)?;
        let x = x.add(&attn_out)?;

        let normed = self.post_attention_layernorm.forward(&x)?;
        let mlp_out = self.mlp.forward(&normed)?;
        x.add(&mlp_out).map_err(Error::from)
    }
}

/// Embedding, decoder layers and final norm.
#[derive(Debug, Clone)]
pub struct BaichuanModel {
    vocab_embedding: Embedding,
    layers: Vec<BaichuanDecoderLayer>,
    ln_f: RmsNorm,
}

impl BaichuanModel {
    pub fn load(cfg: &BaichuanConfig, vb: VarBuilder, comm: Arc<dyn Communicator>) -> Result<Self> {
        let vocab_embedding =
            candle_nn::embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("embed_tokens"))?;
        let mut layers = Vec::with_capacity(cfg.num_layers);
        for idx in 0..cfg.num_layers {
            layers.push(BaichuanDecoderLayer::load(
                cfg,
                vb.pp(format!("layers.{idx}")),
                comm.clone(),
            )?);
        }
        let ln_f = candle_nn::rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("norm"))?;
        Ok(Self {
            vocab_embedding,
            layers,
            ln_f,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Hidden states `[rows, hidden]` for the flattened `input_ids`.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        segments: &[Segment],
        mut cache: Option<&mut KvCache>,
    ) -> Result<Tensor> {
        let ids = input_ids.flatten_all()?;
        let mut x = self.vocab_embedding.forward(&ids)?;
        for (idx, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x, segments, cache.as_deref_mut(), idx)?;
        }
        self.ln_f.forward(&x).map_err(Error::from)
    }
}

/// Baichuan with its output head, sharded for one tensor-parallel rank.
#[derive(Debug, Clone)]
pub struct BaichuanForCausalLM {
    model: BaichuanModel,
    lm_head: ColumnLinear,
    config: BaichuanConfig,
    mapping: Mapping,
    build: BuildConfig,
    padded_vocab_size: usize,
    device: Device,
    dtype: DType,
}

impl BaichuanForCausalLM {
    pub fn load(
        config: BaichuanConfig,
        mapping: Mapping,
        build: BuildConfig,
        vb: VarBuilder,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        config.validate(&mapping)?;
        build.validate()?;
        if comm.world_size() != mapping.tp_size || comm.rank() != mapping.tp_rank() {
            return Err(Error::InvalidConfig(format!(
                "communicator is rank {}/{} but the mapping expects {}/{}",
                comm.rank(),
                comm.world_size(),
                mapping.tp_rank(),
                mapping.tp_size
            )));
        }

        let model = BaichuanModel::load(&config, vb.pp("model"), comm.clone())?;
        let padded_vocab_size = pad_vocab_size(config.vocab_size, mapping.tp_size);
        let mut head = vb
            .pp("lm_head")
            .get((config.vocab_size, config.hidden_size), "weight")?;
        if config.norm_head {
            head = normalize_rows(&head)?;
        }
        if padded_vocab_size > config.vocab_size {
            head = head.pad_with_zeros(0, 0, padded_vocab_size - config.vocab_size)?;
        }
        let lm_head = ColumnLinear::from_full(&head, true, comm)?;

        debug!(
            "Loaded Baichuan rank {}/{}: {} layers, padded vocab {}",
            mapping.tp_rank(),
            mapping.tp_size,
            model.num_layers(),
            padded_vocab_size
        );

        Ok(Self {
            model,
            lm_head,
            config,
            mapping,
            build,
            padded_vocab_size,
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    pub fn config(&self) -> &BaichuanConfig {
        &self.config
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn build_config(&self) -> &BuildConfig {
        &self.build
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn padded_vocab_size(&self) -> usize {
        self.padded_vocab_size
    }

    /// Cache matching this model's layers and build config.
    pub fn new_cache(&self, max_slots: usize, max_seq_len: usize) -> KvCache {
        KvCache::for_model(&self.config, &self.mapping, &self.build, max_slots, max_seq_len)
    }

    /// Run one step.
    ///
    /// `input_ids` is `[batch, max_len]` (padded) or `[1, num_tokens]` (packed
    /// when `remove_input_padding` is set). `last_token_ids` holds the 1-based
    /// index of every row's last token, cumulative for packed inputs. Without
    /// it logits are returned for every position.
    ///
    /// Cache capacity is checked for the whole batch before any layer writes,
    /// so a rejected step leaves the cache untouched. Present keys/values are
    /// returned only when the cache params ask for them.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        last_token_ids: Option<&[usize]>,
        params: &AttentionParams,
        kv_cache_params: Option<KeyValueCacheParams<'_>>,
    ) -> Result<ModelOutputs> {
        params.validate()?;
        let batch = params.batch_size();
        if let Some(last) = last_token_ids {
            if last.len() != batch {
                return Err(Error::InvalidInput(format!(
                    "{} last token ids for a batch of {batch}",
                    last.len()
                )));
            }
        }
        let (slots, past_lens, export_presents, mut cache) = match kv_cache_params {
            Some(kv) => {
                if kv.slots.len() != batch {
                    return Err(Error::InvalidInput(format!(
                        "{} cache slots for a batch of {batch}",
                        kv.slots.len()
                    )));
                }
                let past_lens = kv.past_key_value_lengths();
                (kv.slots, past_lens, kv.export_presents, Some(kv.cache))
            }
            None => ((0..batch).collect(), vec![0; batch], false, None),
        };

        let segments = self.segments(input_ids, params, &slots, &past_lens, cache.is_some())?;
        if let Some(cache) = cache.as_deref_mut() {
            let requests: Vec<(SlotId, usize)> = segments.iter().map(|s| (s.slot, s.len)).collect();
            cache.prepare(&requests)?;
        }
        debug!(
            "Forward step over {batch} row(s), sequence lengths {:?}",
            params.sequence_length(&past_lens)
        );
        let hidden = self.model.forward(input_ids, &segments, cache.as_deref_mut())?;
        let (rows_a, rows_b) = input_ids.dims2()?;
        let hidden = hidden.reshape((rows_a, rows_b, self.config.hidden_size))?;

        let hidden = gather_last_token_logits(
            &hidden,
            last_token_ids,
            self.build.remove_input_padding,
        )?;
        let logits = self.lm_head.forward(&hidden)?;

        let mut outputs = ModelOutputs::default();
        outputs.mark_output("logits", logits.to_dtype(self.dtype)?);
        if let Some(cache) = cache.as_deref().filter(|c| export_presents && !c.is_paged()) {
            for layer in 0..self.model.num_layers() {
                if let Some(present) = cache.present(layer, &slots)? {
                    outputs.mark_output(format!("present_key_value_{layer}"), present);
                }
            }
        }
        Ok(outputs)
    }

    fn segments(
        &self,
        input_ids: &Tensor,
        params: &AttentionParams,
        slots: &[usize],
        past_lens: &[usize],
        has_cache: bool,
    ) -> Result<Vec<Segment>> {
        let (dim0, dim1) = input_ids.dims2()?;
        let batch = params.batch_size();
        let packed = self.build.remove_input_padding;
        if packed && dim0 != 1 {
            return Err(Error::InvalidInput(format!(
                "packed input_ids must be [1, num_tokens], got [{dim0}, {dim1}]"
            )));
        }
        if !packed && dim0 != batch {
            return Err(Error::InvalidInput(format!(
                "input_ids hold {dim0} rows for a batch of {batch}"
            )));
        }

        let mut segments = Vec::with_capacity(batch);
        let mut offset = 0;
        let max_positions = self.config.max_position_embeddings;
        for (row, (&slot, &past_len)) in slots.iter().zip(past_lens).enumerate() {
            let len = params.new_tokens(row);
            if past_len + len > max_positions {
                return Err(Error::InvalidInput(format!(
                    "row {row} would reach position {}, max_position_embeddings is {max_positions}",
                    past_len + len
                )));
            }
            match params.request_types[row] {
                RequestType::Context if past_len > 0 => {
                    return Err(Error::InvalidInput(format!(
                        "context request on slot {slot} which already caches {past_len} tokens"
                    )))
                }
                RequestType::Generation if !has_cache => {
                    return Err(Error::InvalidInput(
                        "generation requests need a key/value cache".to_string(),
                    ))
                }
                _ => {}
            }
            let row_offset = if packed { offset } else { row * dim1 };
            if !packed && len > dim1 {
                return Err(Error::InvalidInput(format!(
                    "row {row} has {len} tokens but input_ids are {dim1} wide"
                )));
            }
            segments.push(Segment {
                offset: row_offset,
                len,
                slot,
                past_len,
            });
            offset += len;
        }
        if packed && offset != dim1 {
            return Err(Error::InvalidInput(format!(
                "packed input_ids hold {dim1} tokens, the batch needs {offset}"
            )));
        }
        Ok(segments)
    }
}

/// Keep only the hidden state of each row's last token.
///
/// `hidden` is `[batch, len, hidden]` (padded) or `[1, num_tokens, hidden]`
/// (packed). `last_token_ids` are 1-based; packed ids are cumulative over the
/// flattened tokens and strictly increasing. The result is `[batch, hidden]`.
pub fn gather_last_token_logits(
    hidden: &Tensor,
    last_token_ids: Option<&[usize]>,
    remove_input_padding: bool,
) -> Result<Tensor> {
    let Some(last_token_ids) = last_token_ids else {
        return Ok(hidden.clone());
    };
    let (rows, len, width) = hidden.dims3()?;
    if !remove_input_padding && last_token_ids.len() != rows {
        return Err(Error::InvalidInput(format!(
            "{} last token ids for {rows} rows",
            last_token_ids.len()
        )));
    }
    let mut indices = Vec::with_capacity(last_token_ids.len());
    for (b, &last) in last_token_ids.iter().enumerate() {
        if last == 0 || last > len {
            return Err(Error::InvalidInput(format!(
                "last_token_ids[{b}] = {last} is outside 1..={len}"
            )));
        }
        if remove_input_padding && b > 0 && last <= last_token_ids[b - 1] {
            return Err(Error::InvalidInput(format!(
                "packed last_token_ids must increase, got {} then {last}",
                last_token_ids[b - 1]
            )));
        }
        let index = if remove_input_padding { last - 1 } else { b * len + last - 1 };
        indices.push(index as u32);
    }
    let flat = hidden.reshape((rows * len, width))?;
    let indices = Tensor::new(indices.as_slice(), hidden.device())?;
    flat.index_select(&indices, 0).map_err(Error::from)
}

/// Scale every row of `weight` to unit L2 norm.
fn normalize_rows(weight: &Tensor) -> Result<Tensor> {
    let dtype = weight.dtype();
    let w = weight.to_dtype(DType::F32)?;
    let norm = w.sqr()?.sum_keepdim(1)?.sqrt()?.clamp(1e-12f32, f32::MAX)?;
    w.broadcast_div(&norm)?.to_dtype(dtype).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PositionEmbeddingType;
    use crate::layers::parallel::{local_group, SingleRank};
    use crate::testing::{max_abs_diff, tiny_config, tiny_weights, var_builder};
    use std::collections::HashMap;

    fn load_model(
        cfg: &BaichuanConfig,
        weights: &HashMap<String, Tensor>,
        build: BuildConfig,
    ) -> BaichuanForCausalLM {
        BaichuanForCausalLM::load(
            cfg.clone(),
            Mapping::default(),
            build,
            var_builder(weights.clone()),
            Arc::new(SingleRank),
        )
        .unwrap()
    }

    fn ids(rows: &[&[u32]]) -> Tensor {
        let flat: Vec<u32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(flat, (rows.len(), rows[0].len()), &Device::Cpu).unwrap()
    }

    fn row_ids(tokens: &[u32]) -> Tensor {
        Tensor::new(tokens, &Device::Cpu).unwrap().unsqueeze(0).unwrap()
    }

    #[test]
    fn test_attention_params() {
        let mask = Tensor::new(&[[1u8, 1, 1, 0], [1, 1, 1, 1]], &Device::Cpu).unwrap();
        let params = AttentionParams::from_attention_mask(&mask).unwrap();
        assert_eq!(params.context_lengths, vec![3, 4]);
        assert_eq!(params.max_context_length, 4);
        assert_eq!(params.sequence_length(&[0, 0]), vec![3, 4]);

        let params = AttentionParams::generation(vec![3, 4]);
        assert_eq!(params.new_tokens(1), 1);
        assert_eq!(params.sequence_length(&[5, 6]), vec![6, 7]);

        let empty = Tensor::new(&[[0u8, 0]], &Device::Cpu).unwrap();
        assert!(AttentionParams::from_attention_mask(&empty).is_err());
        let hole = Tensor::new(&[[1u8, 0, 1]], &Device::Cpu).unwrap();
        assert!(AttentionParams::from_attention_mask(&hole).is_err());
    }

    #[test]
    fn test_gather_last_token_logits() {
        let hidden = Tensor::arange(0f32, 12.0, &Device::Cpu)
            .unwrap()
            .reshape((2, 3, 2))
            .unwrap();
        let padded = gather_last_token_logits(&hidden, Some(&[2, 3]), false).unwrap();
        assert_eq!(padded.to_vec2::<f32>().unwrap(), vec![vec![2.0, 3.0], vec![10.0, 11.0]]);

        let packed_hidden = hidden.reshape((1, 6, 2)).unwrap();
        let packed = gather_last_token_logits(&packed_hidden, Some(&[2, 6]), true).unwrap();
        assert_eq!(packed.to_vec2::<f32>().unwrap(), vec![vec![2.0, 3.0], vec![10.0, 11.0]]);

        assert!(gather_last_token_logits(&hidden, Some(&[0, 1]), false).is_err());
        assert!(gather_last_token_logits(&hidden, Some(&[4, 1]), false).is_err());
        assert!(gather_last_token_logits(&hidden, Some(&[2]), false).is_err());
        assert!(gather_last_token_logits(&packed_hidden, Some(&[6, 2]), true).is_err());
        assert!(gather_last_token_logits(&packed_hidden, Some(&[3, 3]), true).is_err());
        let all = gather_last_token_logits(&hidden, None, false).unwrap();
        assert_eq!(all.dims(), &[2, 3, 2]);
    }

    #[test]
    fn test_incremental_decoding_matches_full_recompute() {
        for position in [PositionEmbeddingType::RopeGptNeox, PositionEmbeddingType::Alibi] {
            for paged in [false, true] {
                let cfg = tiny_config(position);
                let weights = tiny_weights(&cfg);
                let build = BuildConfig {
                    paged_kv_cache: paged,
                    tokens_per_block: 2,
                    ..Default::default()
                };
                let model = load_model(&cfg, &weights, build);
                let tokens = [3u32, 17, 5, 29, 11];

                let full = model
                    .forward(&row_ids(&tokens), Some(&[5]), &AttentionParams::context(vec![5]), None)
                    .unwrap();

                let mut cache = model.new_cache(1, 8);
                model
                    .forward(
                        &row_ids(&tokens[..3]),
                        Some(&[3]),
                        &AttentionParams::context(vec![3]),
                        Some(KeyValueCacheParams::sequential(&mut cache, 1)),
                    )
                    .unwrap();
                let mut step = None;
                for &token in &tokens[3..] {
                    step = Some(
                        model
                            .forward(
                                &row_ids(&[token]),
                                Some(&[1]),
                                &AttentionParams::generation(vec![3]),
                                Some(KeyValueCacheParams::sequential(&mut cache, 1)),
                            )
                            .unwrap(),
                    );
                }
                let step = step.unwrap();
                let diff = max_abs_diff(step.logits().unwrap(), full.logits().unwrap());
                assert!(diff < 1e-4, "{position} paged={paged}: {diff}");
                assert_eq!(cache.seq_len(0), 5);
                assert!(step.get("present_key_value_1").is_none());
            }
        }
    }

    #[test]
    fn test_packed_matches_padded() {
        let cfg = tiny_config(PositionEmbeddingType::Alibi);
        let weights = tiny_weights(&cfg);
        let padded_model = load_model(&cfg, &weights, BuildConfig::default());
        let packed_model = load_model(
            &cfg,
            &weights,
            BuildConfig {
                remove_input_padding: true,
                ..Default::default()
            },
        );
        let params = AttentionParams::context(vec![3, 5]);

        let padded = padded_model
            .forward(&ids(&[&[4, 8, 15, 0, 0], &[16, 23, 1, 2, 9]]), Some(&[3, 5]), &params, None)
            .unwrap();
        let packed = packed_model
            .forward(&row_ids(&[4, 8, 15, 16, 23, 1, 2, 9]), Some(&[3, 8]), &params, None)
            .unwrap();
        assert_eq!(padded.logits().unwrap().dims(), &[2, cfg.vocab_size]);
        assert!(max_abs_diff(padded.logits().unwrap(), packed.logits().unwrap()) < 1e-5);

        // Token count must match the batch exactly.
        assert!(packed_model
            .forward(&row_ids(&[4, 8, 15, 16]), Some(&[3, 4]), &params, None)
            .is_err());
    }

    #[test]
    fn test_present_key_values_are_padded_per_row() {
        let cfg = tiny_config(PositionEmbeddingType::RopeGptNeox);
        let model = load_model(&cfg, &tiny_weights(&cfg), BuildConfig::default());
        let mut cache = model.new_cache(2, 8);
        let outputs = model
            .forward(
                &ids(&[&[1, 2, 3], &[4, 5, 0]]),
                Some(&[3, 2]),
                &AttentionParams::context(vec![3, 2]),
                Some(KeyValueCacheParams::sequential(&mut cache, 2).with_presents()),
            )
            .unwrap();
        let names: Vec<&str> = outputs.names().collect();
        assert_eq!(names, vec!["logits", "present_key_value_0", "present_key_value_1"]);
        let present = outputs.get("present_key_value_0").unwrap();
        assert_eq!(present.dims(), &[2, 2, cfg.num_heads, 3, cfg.head_size()]);
    }

    #[test]
    fn test_presents_are_opt_in() {
        for paged in [false, true] {
            let cfg = tiny_config(PositionEmbeddingType::RopeGptNeox);
            let build = BuildConfig {
                paged_kv_cache: paged,
                tokens_per_block: 2,
                ..Default::default()
            };
            let model = load_model(&cfg, &tiny_weights(&cfg), build);
            let mut cache = model.new_cache(2, 8);
            let plain = model
                .forward(
                    &row_ids(&[1, 2, 3]),
                    Some(&[3]),
                    &AttentionParams::context(vec![3]),
                    Some(KeyValueCacheParams::new(&mut cache, vec![0])),
                )
                .unwrap();
            assert_eq!(plain.names().collect::<Vec<_>>(), vec!["logits"]);

            let exported = model
                .forward(
                    &row_ids(&[4, 5]),
                    Some(&[2]),
                    &AttentionParams::context(vec![2]),
                    Some(KeyValueCacheParams::new(&mut cache, vec![1]).with_presents()),
                )
                .unwrap();
            assert_eq!(exported.get("present_key_value_0").is_some(), !paged);
        }
    }

    #[test]
    fn test_rejected_step_leaves_cache_clean() {
        let cfg = tiny_config(PositionEmbeddingType::RopeGptNeox);
        let model = load_model(&cfg, &tiny_weights(&cfg), BuildConfig::default());
        let mut cache = model.new_cache(2, 4);
        let err = model
            .forward(
                &ids(&[&[1, 2, 3, 0, 0], &[4, 5, 6, 7, 8]]),
                Some(&[3, 5]),
                &AttentionParams::context(vec![3, 5]),
                Some(KeyValueCacheParams::sequential(&mut cache, 2)),
            )
            .unwrap_err();
        assert!(matches!(err, Error::CacheError(_)));
        for layer in 0..cfg.num_layers {
            assert_eq!(cache.layer_len(layer, 0), 0);
        }

        model
            .forward(
                &row_ids(&[1, 2, 3]),
                Some(&[3]),
                &AttentionParams::context(vec![3]),
                Some(KeyValueCacheParams::sequential(&mut cache, 1)),
            )
            .unwrap();
        assert_eq!(cache.seq_len(0), 3);
    }

    #[test]
    fn test_rejects_positions_past_max_position_embeddings() {
        let cfg = tiny_config(PositionEmbeddingType::RopeGptNeox);
        let model = load_model(&cfg, &tiny_weights(&cfg), BuildConfig::default());
        let tokens: Vec<u32> = (0..65).map(|i| i % 37).collect();
        let err = model
            .forward(&row_ids(&tokens), Some(&[65]), &AttentionParams::context(vec![65]), None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        let fits = AttentionParams::context(vec![64]);
        assert!(model.forward(&row_ids(&tokens[..64]), Some(&[64]), &fits, None).is_ok());
    }

    #[test]
    fn test_last_token_ids_must_cover_the_batch() {
        let cfg = tiny_config(PositionEmbeddingType::RopeGptNeox);
        let model = load_model(&cfg, &tiny_weights(&cfg), BuildConfig::default());
        let err = model
            .forward(
                &ids(&[&[1, 2, 3], &[4, 5, 6]]),
                Some(&[3]),
                &AttentionParams::context(vec![3, 3]),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_generation_without_cache_is_rejected() {
        let cfg = tiny_config(PositionEmbeddingType::RopeGptNeox);
        let model = load_model(&cfg, &tiny_weights(&cfg), BuildConfig::default());
        let err = model
            .forward(&row_ids(&[1]), Some(&[1]), &AttentionParams::generation(vec![3]), None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_norm_head_normalizes_output_rows() {
        let mut cfg = tiny_config(PositionEmbeddingType::RopeGptNeox);
        let mut weights = tiny_weights(&cfg);
        let plain = load_model(&cfg, &weights, BuildConfig::default());
        let tokens = row_ids(&[7, 8, 9]);
        let params = AttentionParams::context(vec![3]);
        let plain_logits = plain.forward(&tokens, Some(&[3]), &params, None).unwrap();

        cfg.norm_head = true;
        let normed = load_model(&cfg, &weights, BuildConfig::default());
        let normed_logits = normed.forward(&tokens, Some(&[3]), &params, None).unwrap();
        assert!(max_abs_diff(plain_logits.logits().unwrap(), normed_logits.logits().unwrap()) > 1e-3);

        let head = weights["lm_head.weight"].clone();
        weights.insert("lm_head.weight".to_string(), normalize_rows(&head).unwrap());
        cfg.norm_head = false;
        let reference = load_model(&cfg, &weights, BuildConfig::default());
        let reference_logits = reference.forward(&tokens, Some(&[3]), &params, None).unwrap();
        assert!(
            max_abs_diff(normed_logits.logits().unwrap(), reference_logits.logits().unwrap())
                < 1e-5
        );
    }

    #[test]
    fn test_tensor_parallel_matches_single_rank() {
        for position in [PositionEmbeddingType::RopeGptNeox, PositionEmbeddingType::Alibi] {
            let cfg = tiny_config(position);
            let weights = tiny_weights(&cfg);
            let tokens = ids(&[&[5, 6, 7, 8], &[9, 10, 11, 0]]);
            let params = AttentionParams::context(vec![4, 3]);

            let single = load_model(&cfg, &weights, BuildConfig::default());
            let expected = single
                .forward(&tokens, Some(&[4, 3]), &params, None)
                .unwrap()
                .logits()
                .unwrap()
                .clone();

            let mappings = Mapping::tensor_parallel(2).unwrap();
            let comms = local_group(2);
            let logits: Vec<Tensor> = std::thread::scope(|scope| {
                let handles: Vec<_> = mappings
                    .into_iter()
                    .zip(comms)
                    .map(|(mapping, comm)| {
                        let (cfg, weights, tokens, params) = (&cfg, &weights, &tokens, &params);
                        scope.spawn(move || {
                            let model = BaichuanForCausalLM::load(
                                cfg.clone(),
                                mapping,
                                BuildConfig::default(),
                                var_builder(weights.clone()),
                                comm,
                            )
                            .unwrap();
                            model
                                .forward(tokens, Some(&[4, 3]), params, None)
                                .unwrap()
                                .logits()
                                .unwrap()
                                .clone()
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            for rank_logits in logits {
                assert_eq!(rank_logits.dims(), &[2, 38]);
                let real = rank_logits.narrow(1, 0, cfg.vocab_size).unwrap();
                assert!(max_abs_diff(&real, &expected) < 1e-4, "{position}");
            }
        }
    }

    #[test]
    fn test_rejects_mismatched_communicator() {
        let cfg = tiny_config(PositionEmbeddingType::RopeGptNeox);
        let err = BaichuanForCausalLM::load(
            cfg.clone(),
            Mapping::new(2, 2, 0).unwrap(),
            BuildConfig::default(),
            var_builder(tiny_weights(&cfg)),
            Arc::new(SingleRank),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
