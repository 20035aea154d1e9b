//! Fixtures shared by unit tests: a tiny Baichuan with random weights.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::config::{BaichuanConfig, PositionEmbeddingType};

pub fn tiny_config(position_embedding_type: PositionEmbeddingType) -> BaichuanConfig {
    BaichuanConfig {
        num_layers: 2,
        num_heads: 4,
        hidden_size: 16,
        vocab_size: 37,
        hidden_act: Default::default(),
        max_position_embeddings: 64,
        position_embedding_type,
        mlp_hidden_size: Some(32),
        rms_norm_eps: 1e-6,
        rotary_base: 10000.0,
        dtype: "float32".to_string(),
        norm_head: false,
    }
}

fn random(shape: &[usize], std: f32) -> Tensor {
    Tensor::randn(0f32, std, shape, &Device::Cpu).unwrap()
}

fn norm_weight(size: usize) -> Tensor {
    (random(&[size], 0.1) + 1.0).unwrap()
}

/// Checkpoint-shaped tensors for `cfg`, named as in HuggingFace checkpoints.
pub fn tiny_weights(cfg: &BaichuanConfig) -> HashMap<String, Tensor> {
    let h = cfg.hidden_size;
    let f = cfg.mlp_hidden_size();
    let mut weights = HashMap::new();
    weights.insert("model.embed_tokens.weight".to_string(), random(&[cfg.vocab_size, h], 1.0));
    for i in 0..cfg.num_layers {
        let p = format!("model.layers.{i}");
        weights.insert(format!("{p}.input_layernorm.weight"), norm_weight(h));
        weights.insert(format!("{p}.post_attention_layernorm.weight"), norm_weight(h));
        weights.insert(format!("{p}.self_attn.W_pack.weight"), random(&[3 * h, h], 0.3));
        weights.insert(format!("{p}.self_attn.o_proj.weight"), random(&[h, h], 0.3));
        weights.insert(format!("{p}.mlp.gate_proj.weight"), random(&[f, h], 0.3));
        weights.insert(format!("{p}.mlp.up_proj.weight"), random(&[f, h], 0.3));
        weights.insert(format!("{p}.mlp.down_proj.weight"), random(&[h, f], 0.3));
    }
    weights.insert("model.norm.weight".to_string(), norm_weight(h));
    weights.insert("lm_head.weight".to_string(), random(&[cfg.vocab_size, h], 0.5));
    weights
}

pub fn var_builder(weights: HashMap<String, Tensor>) -> VarBuilder<'static> {
    VarBuilder::from_tensors(weights, DType::F32, &Device::Cpu)
}

pub fn tiny_var_builder(cfg: &BaichuanConfig) -> VarBuilder<'static> {
    var_builder(tiny_weights(cfg))
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    a.sub(b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}
