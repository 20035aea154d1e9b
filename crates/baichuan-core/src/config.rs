//! Configuration types for the Baichuan model.

use std::fmt;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mapping::Mapping;

/// How positional information enters attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionEmbeddingType {
    /// Rotary embeddings in the GPT-NeoX (rotate-half) layout.
    #[serde(alias = "rope")]
    RopeGptNeox,
    /// Attention with linear biases.
    Alibi,
}

impl fmt::Display for PositionEmbeddingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionEmbeddingType::RopeGptNeox => write!(f, "rope_gpt_neox"),
            PositionEmbeddingType::Alibi => write!(f, "alibi"),
        }
    }
}

/// Activation applied to the gate branch of the MLP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HiddenAct {
    #[default]
    Silu,
    Gelu,
    Relu,
}

impl HiddenAct {
    pub fn apply(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            HiddenAct::Silu => candle_nn::ops::silu(x),
            HiddenAct::Gelu => x.gelu_erf(),
            HiddenAct::Relu => x.relu(),
        }
    }
}

/// Published Baichuan checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaichuanVersion {
    #[serde(rename = "v1_7b")]
    V1_7b,
    #[serde(rename = "v1_13b")]
    V1_13b,
    #[serde(rename = "v2_7b")]
    V2_7b,
    #[serde(rename = "v2_13b")]
    V2_13b,
}

impl BaichuanVersion {
    pub fn all() -> &'static [BaichuanVersion] {
        &[
            BaichuanVersion::V1_7b,
            BaichuanVersion::V1_13b,
            BaichuanVersion::V2_7b,
            BaichuanVersion::V2_13b,
        ]
    }

    /// 7B checkpoints use rotary embeddings, 13B checkpoints use ALiBi.
    pub fn position_embedding_type(&self) -> PositionEmbeddingType {
        match self {
            BaichuanVersion::V1_7b | BaichuanVersion::V2_7b => PositionEmbeddingType::RopeGptNeox,
            BaichuanVersion::V1_13b | BaichuanVersion::V2_13b => PositionEmbeddingType::Alibi,
        }
    }

    /// Baichuan2 normalizes the rows of the output head weight.
    pub fn uses_norm_head(&self) -> bool {
        matches!(self, BaichuanVersion::V2_7b | BaichuanVersion::V2_13b)
    }

    /// Best-effort identification from the shape of a HuggingFace config.
    pub fn infer(hidden_size: usize, vocab_size: usize) -> Option<Self> {
        match (hidden_size, vocab_size) {
            (4096, 64000) => Some(BaichuanVersion::V1_7b),
            (5120, 64000) => Some(BaichuanVersion::V1_13b),
            (4096, 125696) => Some(BaichuanVersion::V2_7b),
            (5120, 125696) => Some(BaichuanVersion::V2_13b),
            _ => None,
        }
    }
}

impl fmt::Display for BaichuanVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BaichuanVersion::V1_7b => "v1_7b",
            BaichuanVersion::V1_13b => "v1_13b",
            BaichuanVersion::V2_7b => "v2_7b",
            BaichuanVersion::V2_13b => "v2_13b",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for BaichuanVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        BaichuanVersion::all()
            .iter()
            .copied()
            .find(|v| v.to_string() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| Error::InvalidConfig(format!("Unknown Baichuan version: {s}")))
    }
}

/// Model hyperparameters. Fixed at construction and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaichuanConfig {
    pub num_layers: usize,
    pub num_heads: usize,
    pub hidden_size: usize,
    pub vocab_size: usize,
    #[serde(default)]
    pub hidden_act: HiddenAct,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    pub position_embedding_type: PositionEmbeddingType,
    /// Gated MLP width; `None` or zero means `4 * hidden_size`.
    #[serde(default)]
    pub mlp_hidden_size: Option<usize>,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rotary_base")]
    pub rotary_base: f64,
    #[serde(default = "default_dtype")]
    pub dtype: String,
    #[serde(default)]
    pub norm_head: bool,
}

fn default_max_position_embeddings() -> usize {
    4096
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rotary_base() -> f64 {
    10000.0
}

fn default_dtype() -> String {
    "float16".to_string()
}

/// Shape of `config.json` as shipped with the HuggingFace checkpoints.
#[derive(Debug, Deserialize)]
struct HfBaichuanConfig {
    hidden_size: usize,
    num_attention_heads: usize,
    num_hidden_layers: usize,
    vocab_size: usize,
    #[serde(default)]
    intermediate_size: Option<usize>,
    #[serde(default)]
    hidden_act: HiddenAct,
    #[serde(default)]
    max_position_embeddings: Option<usize>,
    #[serde(default)]
    model_max_length: Option<usize>,
    #[serde(default = "default_rms_norm_eps")]
    rms_norm_eps: f64,
    #[serde(default)]
    rope_theta: Option<f64>,
    #[serde(default)]
    torch_dtype: Option<String>,
    #[serde(default)]
    position_embedding_type: Option<PositionEmbeddingType>,
    #[serde(default)]
    baichuan_version: Option<BaichuanVersion>,
}

impl BaichuanConfig {
    /// Hyperparameters of a published checkpoint.
    pub fn preset(version: BaichuanVersion) -> Self {
        let (num_layers, num_heads, hidden_size, mlp_hidden_size) = match version {
            BaichuanVersion::V1_7b | BaichuanVersion::V2_7b => (32, 32, 4096, 11008),
            BaichuanVersion::V1_13b | BaichuanVersion::V2_13b => (40, 40, 5120, 13696),
        };
        let vocab_size = if version.uses_norm_head() { 125696 } else { 64000 };
        Self {
            num_layers,
            num_heads,
            hidden_size,
            vocab_size,
            hidden_act: HiddenAct::Silu,
            max_position_embeddings: default_max_position_embeddings(),
            position_embedding_type: version.position_embedding_type(),
            mlp_hidden_size: Some(mlp_hidden_size),
            rms_norm_eps: default_rms_norm_eps(),
            rotary_base: default_rotary_base(),
            dtype: default_dtype(),
            norm_head: version.uses_norm_head(),
        }
    }

    /// Parse a HuggingFace `config.json`.
    ///
    /// The position embedding comes from an explicit `position_embedding_type`,
    /// then an explicit `baichuan_version`, then the version inferred from the
    /// hidden and vocabulary sizes. A config that resolves none of these is
    /// rejected.
    pub fn from_hf_json(json: &str) -> Result<Self> {
        let raw: HfBaichuanConfig = serde_json::from_str(json)?;
        let version = raw
            .baichuan_version
            .or_else(|| BaichuanVersion::infer(raw.hidden_size, raw.vocab_size));
        let position_embedding_type = raw
            .position_embedding_type
            .or_else(|| version.map(|v| v.position_embedding_type()))
            .ok_or_else(|| {
                Error::InvalidConfig(
                    "position_embedding_type is required and could not be inferred".to_string(),
                )
            })?;

        let config = Self {
            num_layers: raw.num_hidden_layers,
            num_heads: raw.num_attention_heads,
            hidden_size: raw.hidden_size,
            vocab_size: raw.vocab_size,
            hidden_act: raw.hidden_act,
            max_position_embeddings: raw
                .max_position_embeddings
                .or(raw.model_max_length)
                .unwrap_or_else(default_max_position_embeddings),
            position_embedding_type,
            mlp_hidden_size: raw.intermediate_size,
            rms_norm_eps: raw.rms_norm_eps,
            rotary_base: raw.rope_theta.unwrap_or_else(default_rotary_base),
            dtype: raw.torch_dtype.unwrap_or_else(default_dtype),
            norm_head: version.map(|v| v.uses_norm_head()).unwrap_or(false),
        };
        config.validate(&Mapping::default())?;
        Ok(config)
    }

    pub fn mlp_hidden_size(&self) -> usize {
        self.mlp_hidden_size
            .filter(|size| *size > 0)
            .unwrap_or(self.hidden_size * 4)
    }

    pub fn head_size(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    /// Baichuan uses full multi-head attention.
    pub fn num_kv_heads(&self) -> usize {
        self.num_heads
    }

    pub fn dtype(&self) -> Result<DType> {
        parse_dtype(&self.dtype)
    }

    /// Check the hyperparameters against a tensor-parallel mapping.
    pub fn validate(&self, mapping: &Mapping) -> Result<()> {
        if self.num_layers == 0 || self.num_heads == 0 || self.hidden_size == 0 {
            return Err(Error::InvalidConfig(
                "num_layers, num_heads and hidden_size must be non-zero".to_string(),
            ));
        }
        if self.vocab_size == 0 {
            return Err(Error::InvalidConfig("vocab_size must be non-zero".to_string()));
        }
        if self.hidden_size % self.num_heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "hidden_size {} is not divisible by num_heads {}",
                self.hidden_size, self.num_heads
            )));
        }
        if self.num_heads % mapping.tp_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "num_heads {} is not divisible by tp_size {}",
                self.num_heads, mapping.tp_size
            )));
        }
        if self.mlp_hidden_size() % mapping.tp_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "mlp_hidden_size {} is not divisible by tp_size {}",
                self.mlp_hidden_size(),
                mapping.tp_size
            )));
        }
        if self.position_embedding_type == PositionEmbeddingType::RopeGptNeox
            && self.head_size() % 2 != 0
        {
            return Err(Error::InvalidConfig(format!(
                "rotary embeddings need an even head size, got {}",
                self.head_size()
            )));
        }
        parse_dtype(&self.dtype)?;
        Ok(())
    }
}

/// Build-time switches that decide input layout and cache layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Pack all sequences into a single `[1, num_tokens]` row.
    #[serde(default)]
    pub remove_input_padding: bool,

    /// Attention driven by explicit per-sequence lengths instead of a mask.
    #[serde(default = "default_true")]
    pub gpt_attention_plugin: bool,

    #[serde(default = "default_true")]
    pub gemm_plugin: bool,

    /// Store keys/values in fixed-size blocks.
    #[serde(default)]
    pub paged_kv_cache: bool,

    #[serde(default = "default_tokens_per_block")]
    pub tokens_per_block: usize,

    #[serde(default)]
    pub max_num_tokens: Option<usize>,
}

fn default_true() -> bool {
    true
}

fn default_tokens_per_block() -> usize {
    64
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            remove_input_padding: false,
            gpt_attention_plugin: default_true(),
            gemm_plugin: default_true(),
            paged_kv_cache: false,
            tokens_per_block: default_tokens_per_block(),
            max_num_tokens: None,
        }
    }
}

impl BuildConfig {
    pub fn validate(&self) -> Result<()> {
        if self.remove_input_padding && !self.gpt_attention_plugin {
            return Err(Error::InvalidConfig(
                "remove_input_padding requires gpt_attention_plugin".to_string(),
            ));
        }
        if self.paged_kv_cache && !self.gpt_attention_plugin {
            return Err(Error::InvalidConfig(
                "paged_kv_cache requires gpt_attention_plugin".to_string(),
            ));
        }
        if self.tokens_per_block == 0 || !self.tokens_per_block.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "tokens_per_block must be a power of two, got {}",
                self.tokens_per_block
            )));
        }
        if self.max_num_tokens == Some(0) {
            return Err(Error::InvalidConfig("max_num_tokens must be non-zero".to_string()));
        }
        Ok(())
    }
}

pub fn parse_dtype(name: &str) -> Result<DType> {
    match name.trim().to_ascii_lowercase().as_str() {
        "float16" | "fp16" | "f16" | "half" => Ok(DType::F16),
        "bfloat16" | "bf16" => Ok(DType::BF16),
        "float32" | "fp32" | "f32" | "float" => Ok(DType::F32),
        other => Err(Error::InvalidConfig(format!("Unsupported dtype: {other}"))),
    }
}

pub fn dtype_name(dtype: DType) -> &'static str {
    match dtype {
        DType::F16 => "float16",
        DType::BF16 => "bfloat16",
        DType::F32 => "float32",
        other => other.as_str(),
    }
}
