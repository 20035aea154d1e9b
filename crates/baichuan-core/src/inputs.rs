//! Input preparation: named tensors with legal ranges for every dynamic
//! dimension.
//!
//! A profile lists the inputs a forward step may receive and, for each
//! dynamic dimension, a `(min, opt, max)` range per optimization profile.
//! Context and generation steps get separate profiles unless packed inputs
//! with the attention and GEMM plugins let one profile cover both. The
//! generator checks every step against the profile before running it.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{BaichuanConfig, BuildConfig};
use crate::error::{Error, Result};
use crate::mapping::{pad_vocab_size, Mapping};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeRange {
    pub min: usize,
    pub opt: usize,
    pub max: usize,
}

impl ShapeRange {
    pub const fn new(min: usize, opt: usize, max: usize) -> Self {
        Self { min, opt, max }
    }

    /// `[1, (max + 1) / 2, max]`
    pub const fn up_to(max: usize) -> Self {
        Self::new(1, (max + 1) / 2, max)
    }

    pub const fn fixed(value: usize) -> Self {
        Self::new(value, value, value)
    }

    pub fn contains(&self, value: usize) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dim {
    Static(usize),
    /// One range per optimization profile.
    Dynamic { name: String, ranges: Vec<ShapeRange> },
}

impl Dim {
    fn dynamic(name: &str, ranges: &[ShapeRange]) -> Self {
        Dim::Dynamic {
            name: name.to_string(),
            ranges: ranges.to_vec(),
        }
    }

    fn admits(&self, profile: usize, value: usize) -> bool {
        match self {
            Dim::Static(size) => *size == value,
            Dim::Dynamic { ranges, .. } => ranges
                .get(profile)
                .or_else(|| ranges.last())
                .is_some_and(|r| r.contains(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub dtype: String,
    pub dims: Vec<Dim>,
}

impl TensorSpec {
    fn new(name: impl Into<String>, dtype: &str, dims: Vec<Dim>) -> Self {
        Self {
            name: name.into(),
            dtype: dtype.to_string(),
            dims,
        }
    }
}

/// Serving limits the input profile is built for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputLimits {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default = "default_max_input_len")]
    pub max_input_len: usize,

    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    #[serde(default = "default_max_beam_width")]
    pub max_beam_width: usize,

    /// Token budget of a packed context step; defaults to
    /// `max_input_len * max_batch_size`.
    #[serde(default)]
    pub max_num_tokens: Option<usize>,
}

fn default_max_batch_size() -> usize {
    8
}

fn default_max_input_len() -> usize {
    1024
}

fn default_max_new_tokens() -> usize {
    1024
}

fn default_max_beam_width() -> usize {
    1
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_input_len: default_max_input_len(),
            max_new_tokens: default_max_new_tokens(),
            max_beam_width: default_max_beam_width(),
            max_num_tokens: None,
        }
    }
}

impl InputLimits {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0
            || self.max_input_len == 0
            || self.max_new_tokens == 0
            || self.max_beam_width == 0
        {
            return Err(Error::InvalidConfig(
                "input limits must all be non-zero".to_string(),
            ));
        }
        if self.max_num_tokens == Some(0) {
            return Err(Error::InvalidConfig("max_num_tokens must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Longest sequence a request can reach.
    pub fn max_seq_len(&self) -> usize {
        self.max_input_len + self.max_new_tokens
    }
}

/// Inputs and outputs of a forward step with their legal shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputProfile {
    pub num_profiles: usize,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

impl InputProfile {
    pub fn input(&self, name: &str) -> Option<&TensorSpec> {
        self.inputs.iter().find(|t| t.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&TensorSpec> {
        self.outputs.iter().find(|t| t.name == name)
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.input(name).is_some()
    }

    /// Accept `shape` for input `name` if any optimization profile admits it.
    pub fn check(&self, name: &str, shape: &[usize]) -> Result<()> {
        let spec = self
            .input(name)
            .ok_or_else(|| Error::InvalidInput(format!("unknown input tensor: {name}")))?;
        if spec.dims.len() != shape.len() {
            return Err(Error::InvalidInput(format!(
                "{name} expects rank {}, got shape {shape:?}",
                spec.dims.len()
            )));
        }
        let admitted = (0..self.num_profiles).any(|profile| {
            spec.dims
                .iter()
                .zip(shape)
                .all(|(dim, &value)| dim.admits(profile, value))
        });
        if admitted {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "shape {shape:?} of {name} is outside every input profile"
            )))
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(Error::from)
    }
}

/// Build the input profile of a model for the given limits.
///
/// Floating-point tensors are declared in `config.dtype`.
pub fn prepare_inputs(
    config: &BaichuanConfig,
    mapping: &Mapping,
    build: &BuildConfig,
    limits: &InputLimits,
) -> Result<InputProfile> {
    config.validate(mapping)?;
    build.validate()?;
    limits.validate()?;
    if limits.max_seq_len() > config.max_position_embeddings {
        return Err(Error::InvalidConfig(format!(
            "max_input_len + max_new_tokens ({}) exceeds max_position_embeddings ({})",
            limits.max_seq_len(),
            config.max_position_embeddings
        )));
    }

    let batch = limits.max_batch_size;
    let beam = limits.max_beam_width;
    let input_len = limits.max_input_len;
    let seq_len = limits.max_seq_len();
    let batch_beam = batch * beam;
    let num_tokens = limits
        .max_num_tokens
        .or(build.max_num_tokens)
        .unwrap_or(input_len * batch);
    let blocks_per_seq = seq_len.div_ceil(build.tokens_per_block);

    // The attention plugin can serve context and generation from one profile
    // when the GEMM plugin is on, or when packed inputs meet a paged cache.
    let single = build.gpt_attention_plugin
        && (build.gemm_plugin || (build.remove_input_padding && build.paged_kv_cache));
    debug!(
        "Preparing {} input profile(s) for batch {batch}, beam {beam}, seq {seq_len}",
        if single { 1 } else { 2 }
    );

    let pick = |single_range: ShapeRange, ctx: ShapeRange, gen: ShapeRange| -> Vec<ShapeRange> {
        if single {
            vec![single_range]
        } else {
            vec![ctx, gen]
        }
    };
    let same = |range: ShapeRange| -> Vec<ShapeRange> {
        if single {
            vec![range]
        } else {
            vec![range, range]
        }
    };

    let bb = Dim::dynamic(
        "batch_size_beam_width",
        &pick(
            ShapeRange::up_to(batch_beam),
            ShapeRange::up_to(batch),
            ShapeRange::up_to(batch_beam),
        ),
    );
    let input_len_dim = Dim::dynamic(
        "input_len",
        &pick(
            ShapeRange::new(1, 1, input_len),
            ShapeRange::up_to(input_len),
            ShapeRange::fixed(1),
        ),
    );
    let past_key_len = Dim::dynamic(
        "past_key_len",
        &pick(
            ShapeRange::new(0, (seq_len + 1) / 2, seq_len),
            ShapeRange::fixed(0),
            ShapeRange::up_to(seq_len),
        ),
    );
    let mask_ranges = pick(
        ShapeRange::new(1, (seq_len + 1) / 2 + 1, seq_len + 1),
        ShapeRange::up_to(input_len),
        ShapeRange::new(2, (seq_len + 1) / 2 + 1, seq_len + 1),
    );
    let num_tokens_dim = Dim::dynamic(
        "num_tokens",
        &pick(
            ShapeRange::new(1, batch_beam, num_tokens.max(batch_beam)),
            ShapeRange::up_to(num_tokens),
            ShapeRange::new(1, batch_beam, batch_beam),
        ),
    );

    let ids_dims = if build.remove_input_padding {
        vec![
            Dim::dynamic("batch_size_fake", &same(ShapeRange::fixed(1))),
            num_tokens_dim,
        ]
    } else {
        vec![bb.clone(), input_len_dim]
    };

    let mut inputs = vec![
        TensorSpec::new("input_ids", "int32", ids_dims.clone()),
        TensorSpec::new("position_ids", "int32", ids_dims),
        TensorSpec::new("last_token_ids", "int32", vec![bb.clone()]),
    ];

    if build.gpt_attention_plugin {
        for name in [
            "sequence_length",
            "host_request_types",
            "host_past_key_value_lengths",
            "context_lengths",
        ] {
            inputs.push(TensorSpec::new(name, "int32", vec![bb.clone()]));
        }
        if build.remove_input_padding {
            inputs.push(TensorSpec::new("host_context_lengths", "int32", vec![bb.clone()]));
        }
    } else {
        inputs.push(TensorSpec::new(
            "attention_mask",
            "int32",
            vec![bb.clone(), Dim::dynamic("mask_len", &mask_ranges)],
        ));
    }

    inputs.push(TensorSpec::new(
        "cache_indirection",
        "int32",
        vec![
            Dim::dynamic("batch_size_cache", &same(ShapeRange::up_to(batch))),
            Dim::dynamic("beam_width", &same(ShapeRange::up_to(beam))),
            Dim::dynamic("max_seq_len", &same(ShapeRange::new(0, (seq_len + 1) / 2, seq_len))),
        ],
    ));

    let local_kv_heads = config.num_kv_heads() / mapping.tp_size;
    let head_size = config.head_size();
    let kv_dtype = config.dtype.as_str();
    let mut outputs = vec![TensorSpec::new(
        "logits",
        kv_dtype,
        vec![
            bb.clone(),
            Dim::Static(pad_vocab_size(config.vocab_size, mapping.tp_size)),
        ],
    )];

    for layer in 0..config.num_layers {
        if build.paged_kv_cache {
            inputs.push(TensorSpec::new(
                format!("kv_cache_block_pointers_{layer}"),
                "int64",
                vec![
                    bb.clone(),
                    Dim::Static(2),
                    Dim::dynamic("max_blocks_per_seq", &same(ShapeRange::up_to(blocks_per_seq))),
                ],
            ));
        } else {
            inputs.push(TensorSpec::new(
                format!("past_key_value_{layer}"),
                kv_dtype,
                vec![
                    bb.clone(),
                    Dim::Static(2),
                    Dim::Static(local_kv_heads),
                    past_key_len.clone(),
                    Dim::Static(head_size),
                ],
            ));
            outputs.push(TensorSpec::new(
                format!("present_key_value_{layer}"),
                kv_dtype,
                vec![
                    bb.clone(),
                    Dim::Static(2),
                    Dim::Static(local_kv_heads),
                    Dim::dynamic("present_key_len", &mask_ranges),
                    Dim::Static(head_size),
                ],
            ));
        }
    }

    Ok(InputProfile {
        num_profiles: if single { 1 } else { 2 },
        inputs,
        outputs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BaichuanVersion, PositionEmbeddingType};
    use crate::testing::tiny_config;

    fn limits() -> InputLimits {
        InputLimits {
            max_batch_size: 4,
            max_input_len: 10,
            max_new_tokens: 6,
            max_beam_width: 2,
            max_num_tokens: None,
        }
    }

    fn ranges<'a>(profile: &'a InputProfile, tensor: &str, dim: usize) -> &'a [ShapeRange] {
        match &profile.input(tensor).unwrap().dims[dim] {
            Dim::Dynamic { ranges, .. } => ranges,
            Dim::Static(_) => panic!("{tensor}[{dim}] is static"),
        }
    }

    #[test]
    fn test_two_profiles_with_attention_mask() {
        let cfg = tiny_config(PositionEmbeddingType::RopeGptNeox);
        let build = BuildConfig {
            gpt_attention_plugin: false,
            ..Default::default()
        };
        let profile = prepare_inputs(&cfg, &Mapping::default(), &build, &limits()).unwrap();
        assert_eq!(profile.num_profiles, 2);
        assert_eq!(
            ranges(&profile, "input_ids", 0),
            &[ShapeRange::new(1, 2, 4), ShapeRange::new(1, 4, 8)]
        );
        assert_eq!(
            ranges(&profile, "input_ids", 1),
            &[ShapeRange::new(1, 5, 10), ShapeRange::fixed(1)]
        );
        assert_eq!(
            ranges(&profile, "past_key_value_0", 3),
            &[ShapeRange::fixed(0), ShapeRange::new(1, 8, 16)]
        );
        assert_eq!(
            ranges(&profile, "attention_mask", 1),
            &[ShapeRange::new(1, 5, 10), ShapeRange::new(2, 9, 17)]
        );
        assert!(!profile.has_input("sequence_length"));
        assert!(profile.output("present_key_value_1").is_some());
    }

    #[test]
    fn test_single_profile_for_packed_plugin_inputs() {
        let cfg = tiny_config(PositionEmbeddingType::Alibi);
        let build = BuildConfig {
            remove_input_padding: true,
            ..Default::default()
        };
        let profile = prepare_inputs(&cfg, &Mapping::default(), &build, &limits()).unwrap();
        assert_eq!(profile.num_profiles, 1);
        assert_eq!(ranges(&profile, "input_ids", 0), &[ShapeRange::fixed(1)]);
        assert_eq!(ranges(&profile, "input_ids", 1), &[ShapeRange::new(1, 8, 40)]);
        assert_eq!(
            ranges(&profile, "past_key_value_0", 3),
            &[ShapeRange::new(0, 8, 16)]
        );
        assert!(profile.has_input("host_context_lengths"));
        assert!(profile.has_input("host_past_key_value_lengths"));
        assert!(!profile.has_input("attention_mask"));

        let capped = InputLimits {
            max_num_tokens: Some(5),
            ..limits()
        };
        let profile = prepare_inputs(&cfg, &Mapping::default(), &build, &capped).unwrap();
        assert_eq!(ranges(&profile, "input_ids", 1), &[ShapeRange::new(1, 8, 8)]);
    }

    #[test]
    fn test_gemm_plugin_allows_single_padded_profile() {
        let cfg = tiny_config(PositionEmbeddingType::RopeGptNeox);
        let profile =
            prepare_inputs(&cfg, &Mapping::default(), &BuildConfig::default(), &limits()).unwrap();
        assert_eq!(profile.num_profiles, 1);
        assert_eq!(ranges(&profile, "input_ids", 0), &[ShapeRange::up_to(8)]);
        assert_eq!(ranges(&profile, "input_ids", 1), &[ShapeRange::new(1, 1, 10)]);
        assert!(profile.check("input_ids", &[5, 7]).is_ok());
    }

    #[test]
    fn test_packed_paged_without_gemm_plugin_uses_single_profile() {
        let cfg = tiny_config(PositionEmbeddingType::Alibi);
        let build = BuildConfig {
            remove_input_padding: true,
            paged_kv_cache: true,
            gemm_plugin: false,
            ..Default::default()
        };
        let profile = prepare_inputs(&cfg, &Mapping::default(), &build, &limits()).unwrap();
        assert_eq!(profile.num_profiles, 1);
        assert_eq!(ranges(&profile, "input_ids", 1), &[ShapeRange::new(1, 8, 40)]);
    }

    #[test]
    fn test_packed_without_gemm_plugin_keeps_two_profiles() {
        let cfg = tiny_config(PositionEmbeddingType::Alibi);
        let build = BuildConfig {
            remove_input_padding: true,
            gemm_plugin: false,
            ..Default::default()
        };
        let profile = prepare_inputs(&cfg, &Mapping::default(), &build, &limits()).unwrap();
        assert_eq!(profile.num_profiles, 2);
        assert_eq!(
            ranges(&profile, "input_ids", 1),
            &[ShapeRange::new(1, 20, 40), ShapeRange::new(1, 8, 8)]
        );
    }

    #[test]
    fn test_paged_cache_uses_block_pointers() {
        let cfg = tiny_config(PositionEmbeddingType::RopeGptNeox);
        let build = BuildConfig {
            paged_kv_cache: true,
            tokens_per_block: 4,
            ..Default::default()
        };
        let profile = prepare_inputs(&cfg, &Mapping::default(), &build, &limits()).unwrap();
        let pointers = profile.input("kv_cache_block_pointers_1").unwrap();
        assert_eq!(pointers.dtype, "int64");
        assert_eq!(ranges(&profile, "kv_cache_block_pointers_1", 2)[0], ShapeRange::new(1, 2, 4));
        assert!(!profile.has_input("past_key_value_0"));
        assert!(profile.output("present_key_value_0").is_none());
    }

    #[test]
    fn test_tensor_parallel_shapes() {
        let cfg = BaichuanConfig::preset(BaichuanVersion::V2_13b);
        let mapping = Mapping::new(4, 4, 1).unwrap();
        let profile =
            prepare_inputs(&cfg, &mapping, &BuildConfig::default(), &InputLimits::default()).unwrap();
        let past = profile.input("past_key_value_39").unwrap();
        assert_eq!(past.dims[2], Dim::Static(10));
        assert_eq!(past.dims[4], Dim::Static(128));
        assert_eq!(past.dtype, "float16");
        assert_eq!(profile.output("logits").unwrap().dims[1], Dim::Static(125696));
    }

    #[test]
    fn test_check_accepts_any_matching_profile() {
        let cfg = tiny_config(PositionEmbeddingType::RopeGptNeox);
        let build = BuildConfig {
            gemm_plugin: false,
            ..Default::default()
        };
        let profile = prepare_inputs(&cfg, &Mapping::default(), &build, &limits()).unwrap();
        assert_eq!(profile.num_profiles, 2);
        assert!(profile.check("input_ids", &[3, 7]).is_ok());
        assert!(profile.check("input_ids", &[8, 1]).is_ok());
        assert!(profile.check("input_ids", &[5, 7]).is_err());
        assert!(profile.check("input_ids", &[3]).is_err());
        assert!(profile.check("past_key_value_0", &[2, 2, 4, 5, 4]).is_ok());
        assert!(profile.check("past_key_value_0", &[2, 2, 3, 5, 4]).is_err());
        assert!(profile.check("no_such_input", &[1]).is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let cfg = tiny_config(PositionEmbeddingType::RopeGptNeox);
        let profile =
            prepare_inputs(&cfg, &Mapping::default(), &BuildConfig::default(), &limits()).unwrap();
        let json = profile.to_json().unwrap();
        assert!(json.contains("\"batch_size_beam_width\""));
        let parsed: InputProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, profile);
    }

    #[test]
    fn test_rejects_limits_past_max_positions() {
        let cfg = tiny_config(PositionEmbeddingType::RopeGptNeox);
        let long = InputLimits {
            max_input_len: 60,
            max_new_tokens: 10,
            ..limits()
        };
        let err = prepare_inputs(&cfg, &Mapping::default(), &BuildConfig::default(), &long);
        assert!(matches!(err, Err(Error::InvalidConfig(_))));
        let exact = InputLimits {
            max_input_len: 54,
            ..long
        };
        assert!(prepare_inputs(&cfg, &Mapping::default(), &BuildConfig::default(), &exact).is_ok());
    }

    #[test]
    fn test_rejects_zero_limits() {
        let cfg = tiny_config(PositionEmbeddingType::RopeGptNeox);
        let zero = InputLimits {
            max_beam_width: 0,
            ..limits()
        };
        assert!(prepare_inputs(&cfg, &Mapping::default(), &BuildConfig::default(), &zero).is_err());
    }
}
