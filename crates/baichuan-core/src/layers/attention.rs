//! Causal self-attention with a fused QKV projection.
//!
//! The hidden state of a batch is processed as a flat `[rows, hidden]`
//! matrix. Every sequence occupies a contiguous run of rows described by a
//! [`Segment`]; padded batches place sequence `b` at row `b * T`, packed
//! batches lay sequences end to end. Rows covered by no segment are padding
//! and come out as zeros.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{ops, VarBuilder};

use crate::config::{BaichuanConfig, PositionEmbeddingType};
use crate::error::{Error, Result};
use crate::kv_cache::{KvCache, SlotId};
use crate::layers::alibi::AlibiBias;
use crate::layers::parallel::{ColumnLinear, Communicator, RowLinear};
use crate::layers::rotary::RotaryEmbedding;

/// Rows of the flattened batch owned by one sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// First row of the sequence.
    pub offset: usize,
    /// Number of new tokens.
    pub len: usize,
    /// Cache slot holding the sequence's keys and values.
    pub slot: SlotId,
    /// Tokens already cached before this step.
    pub past_len: usize,
}

#[derive(Debug, Clone)]
pub struct Attention {
    w_pack: ColumnLinear,
    o_proj: RowLinear,
    local_heads: usize,
    head_size: usize,
    rotary: Option<RotaryEmbedding>,
    alibi: Option<AlibiBias>,
}

impl Attention {
    /// Load `W_pack` and `o_proj` under `vb`, keeping this rank's heads.
    pub fn load(cfg: &BaichuanConfig, vb: VarBuilder, comm: Arc<dyn Communicator>) -> Result<Self> {
        let hidden = cfg.hidden_size;
        let (rank, world_size) = (comm.rank(), comm.world_size());
        let local_heads = cfg.num_heads / world_size;
        let head_size = cfg.head_size();
        let local_hidden = local_heads * head_size;

        // W_pack rows are [q; k; v]. Each rank takes its heads from all three.
        let w_pack = vb.pp("W_pack").get((3 * hidden, hidden), "weight")?;
        let w_pack = w_pack
            .reshape((3, hidden, hidden))?
            .narrow(1, rank * local_hidden, local_hidden)?
            .reshape((3 * local_hidden, hidden))?
            .contiguous()?;
        let w_pack = ColumnLinear::from_local(w_pack, false, comm.clone());
        let o_proj = RowLinear::load(hidden, hidden, vb.pp("o_proj"), comm)?;

        let (rotary, alibi) = match cfg.position_embedding_type {
            PositionEmbeddingType::RopeGptNeox => {
                (Some(RotaryEmbedding::new(head_size, cfg.rotary_base)), None)
            }
            PositionEmbeddingType::Alibi => {
                (None, Some(AlibiBias::new(cfg.num_heads, world_size, rank)))
            }
        };

        Ok(Self {
            w_pack,
            o_proj,
            local_heads,
            head_size,
            rotary,
            alibi,
        })
    }

    /// Attend over `x` (`[rows, hidden]`), appending the new keys and values
    /// of every segment to `cache` at `layer_idx`.
    pub fn forward(
        &self,
        x: &Tensor,
        segments: &[Segment],
        mut cache: Option<&mut KvCache>,
        layer_idx: usize,
    ) -> Result<Tensor> {
        let (rows, _hidden) = x.dims2()?;
        let local_hidden = self.local_heads * self.head_size;
        let qkv = self.w_pack.forward(x)?;

        let mut pieces = Vec::with_capacity(2 * segments.len() + 1);
        let mut cursor = 0;
        for segment in segments {
            if segment.offset < cursor || segment.offset + segment.len > rows {
                return Err(Error::InferenceError(format!(
                    "segment at row {} with {} tokens does not fit {rows} rows",
                    segment.offset, segment.len
                )));
            }
            if segment.offset > cursor {
                pieces.push(zeros(segment.offset - cursor, local_hidden, x.device(), x.dtype())?);
            }
            let qkv = qkv.narrow(0, segment.offset, segment.len)?;
            let out = self.attend_segment(&qkv, segment, cache.as_deref_mut(), layer_idx)?;
            pieces.push(out);
            cursor = segment.offset + segment.len;
        }
        if cursor < rows {
            pieces.push(zeros(rows - cursor, local_hidden, x.device(), x.dtype())?);
        }

        let attn = Tensor::cat(&pieces, 0)?;
        self.o_proj.forward(&attn)
    }

    fn split_heads(&self, x: &Tensor, index: usize) -> Result<Tensor> {
        let local_hidden = self.local_heads * self.head_size;
        let len = x.dim(0)?;
        x.narrow(1, index * local_hidden, local_hidden)?
            .reshape((len, self.local_heads, self.head_size))
            .map_err(Error::from)
    }

    fn attend_segment(
        &self,
        qkv: &Tensor,
        segment: &Segment,
        cache: Option<&mut KvCache>,
        layer_idx: usize,
    ) -> Result<Tensor> {
        let len = segment.len;
        let mut q = self.split_heads(qkv, 0)?;
        let mut k = self.split_heads(qkv, 1)?;
        let v = self.split_heads(qkv, 2)?;
        if let Some(rotary) = &self.rotary {
            q = rotary.apply(&q, segment.past_len)?;
            k = rotary.apply(&k, segment.past_len)?;
        }

        // [heads, len, head_size]
        let q = q.transpose(0, 1)?.contiguous()?;
        let k = k.transpose(0, 1)?.contiguous()?;
        let v = v.transpose(0, 1)?.contiguous()?;

        let (k, v) = match cache {
            Some(cache) => {
                let cached = cache.layer_len(layer_idx, segment.slot);
                if cached != segment.past_len {
                    return Err(Error::InferenceError(format!(
                        "slot {} caches {cached} tokens but the step expects {}",
                        segment.slot, segment.past_len
                    )));
                }
                cache.append(layer_idx, segment.slot, &k, &v)?
            }
            None if segment.past_len > 0 => {
                return Err(Error::InferenceError(
                    "past tokens require a key/value cache".to_string(),
                ))
            }
            None => (k, v),
        };
        let k_len = k.dim(1)?;

        let out_dtype = q.dtype();
        let q = q.to_dtype(DType::F32)?;
        let k = k.to_dtype(DType::F32)?;
        let v = v.to_dtype(DType::F32)?;

        let scale = 1.0 / (self.head_size as f64).sqrt();
        let mut scores = q.matmul(&k.t()?)?.affine(scale, 0.0)?;
        if let Some(alibi) = &self.alibi {
            let bias = alibi.bias(segment.past_len, len, k_len, q.device(), DType::F32)?;
            scores = scores.add(&bias)?;
        }
        let mask = causal_mask(segment.past_len, len, k_len, q.device())?;
        scores = scores.broadcast_add(&mask)?;

        let probs = ops::softmax(&scores, D::Minus1)?;
        let out = probs.matmul(&v.contiguous()?)?;
        out.transpose(0, 1)?
            .reshape((len, self.local_heads * self.head_size))?
            .to_dtype(out_dtype)
            .map_err(Error::from)
    }
}

/// Additive mask `[q_len, k_len]`: query `i` sees keys `j <= past_len + i`.
pub fn causal_mask(past_len: usize, q_len: usize, k_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..q_len)
        .flat_map(|i| {
            (0..k_len).map(move |j| {
                if j <= past_len + i {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect();
    Tensor::from_vec(mask, (q_len, k_len), device).map_err(Error::from)
}

fn zeros(rows: usize, cols: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    Tensor::zeros((rows, cols), dtype, device).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_cache::ContiguousKvCache;
    use crate::layers::parallel::SingleRank;
    use crate::testing::{max_abs_diff, tiny_config, tiny_var_builder};

    fn load(position: PositionEmbeddingType) -> (BaichuanConfig, Attention) {
        let cfg = tiny_config(position);
        let vb = tiny_var_builder(&cfg);
        let attn = Attention::load(&cfg, vb.pp("model.layers.0.self_attn"), Arc::new(SingleRank))
            .unwrap();
        (cfg, attn)
    }

    fn segment(offset: usize, len: usize, slot: usize, past_len: usize) -> Segment {
        Segment {
            offset,
            len,
            slot,
            past_len,
        }
    }

    #[test]
    fn test_causal_mask() {
        let mask = causal_mask(1, 2, 3, &Device::Cpu).unwrap();
        let rows = mask.to_vec2::<f32>().unwrap();
        assert_eq!(rows[0][..2], [0.0, 0.0]);
        assert!(rows[0][2].is_infinite());
        assert_eq!(rows[1], vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_incremental_matches_full_sequence() {
        for position in [PositionEmbeddingType::RopeGptNeox, PositionEmbeddingType::Alibi] {
            let (cfg, attn) = load(position);
            let x = Tensor::randn(0f32, 1.0, (5, cfg.hidden_size), &Device::Cpu).unwrap();
            let full = attn.forward(&x, &[segment(0, 5, 0, 0)], None, 0).unwrap();

            let mut cache = KvCache::Contiguous(ContiguousKvCache::new(1, 1, 8));
            let prefix = x.narrow(0, 0, 3).unwrap();
            attn.forward(&prefix, &[segment(0, 3, 0, 0)], Some(&mut cache), 0)
                .unwrap();
            let mut last = None;
            for pos in 3..5 {
                let row = x.narrow(0, pos, 1).unwrap();
                last = Some(
                    attn.forward(&row, &[segment(0, 1, 0, pos)], Some(&mut cache), 0)
                        .unwrap(),
                );
            }
            let expected = full.narrow(0, 4, 1).unwrap();
            assert!(max_abs_diff(&last.unwrap(), &expected) < 1e-4, "{position}");
            assert_eq!(cache.seq_len(0), 5);
        }
    }

    #[test]
    fn test_padding_rows_are_zero_and_sequences_independent() {
        let (cfg, attn) = load(PositionEmbeddingType::RopeGptNeox);
        let a = Tensor::randn(0f32, 1.0, (3, cfg.hidden_size), &Device::Cpu).unwrap();
        let b = Tensor::randn(0f32, 1.0, (2, cfg.hidden_size), &Device::Cpu).unwrap();
        let pad = Tensor::zeros((1, cfg.hidden_size), DType::F32, &Device::Cpu).unwrap();
        let padded = Tensor::cat(&[&a, &b, &pad], 0).unwrap();

        let out = attn
            .forward(&padded, &[segment(0, 3, 0, 0), segment(3, 2, 1, 0)], None, 0)
            .unwrap();
        let alone = attn.forward(&b, &[segment(0, 2, 0, 0)], None, 0).unwrap();
        assert!(max_abs_diff(&out.narrow(0, 3, 2).unwrap(), &alone) < 1e-5);
        let tail: f32 = out
            .narrow(0, 5, 1)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(tail, 0.0);
    }

    #[test]
    fn test_rejects_past_without_cache_and_overlapping_segments() {
        let (cfg, attn) = load(PositionEmbeddingType::Alibi);
        let x = Tensor::randn(0f32, 1.0, (2, cfg.hidden_size), &Device::Cpu).unwrap();
        assert!(attn.forward(&x, &[segment(0, 1, 0, 3)], None, 0).is_err());
        assert!(attn
            .forward(&x, &[segment(0, 2, 0, 0), segment(1, 1, 1, 0)], None, 0)
            .is_err());
    }
}
