//! Baichuan Core - Baichuan causal language model on candle
//!
//! This crate composes the Baichuan decoder (token embedding, RMSNorm,
//! causal self-attention with RoPE or ALiBi, gated MLP, output head) from
//! candle building blocks and provides the pieces needed to serve it:
//!
//! - Tensor-parallel sharding of every projection with a pluggable
//!   [`layers::parallel::Communicator`]
//! - Contiguous and paged key/value caches with copy-on-write block sharing
//! - Input profiles describing legal ranges of every dynamic dimension
//! - Greedy, sampled and beam-search generation
//!
//! # Example
//!
//! ```ignore
//! use baichuan_core::{weights, BuildConfig, DeviceSelector, Generator, GenerationParams, InputLimits};
//!
//! let device = DeviceSelector::detect()?;
//! let model = weights::load_model(model_dir, &BuildConfig::default(), &device)?;
//! let generator = Generator::new(&model, InputLimits::default())?;
//! let outputs = generator.generate(&[prompt_ids], &GenerationParams::default())?;
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod generation;
pub mod inputs;
pub mod kv_cache;
pub mod layers;
pub mod mapping;
pub mod model;
pub mod tokenizer;
pub mod weights;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{BaichuanConfig, BaichuanVersion, BuildConfig, HiddenAct, PositionEmbeddingType};
pub use device::{DeviceKind, DeviceProfile, DeviceSelector};
pub use error::{Error, Result};
pub use generation::{GenerationOutput, GenerationParams, Generator};
pub use inputs::{prepare_inputs, InputLimits, InputProfile};
pub use kv_cache::{KeyValueCacheParams, KvCache};
pub use mapping::Mapping;
pub use model::{AttentionParams, BaichuanForCausalLM, BaichuanModel, ModelOutputs, RequestType};
pub use tokenizer::Tokenizer;
