//! Loading Baichuan checkpoints from a HuggingFace model directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use serde_json::Value;
use tracing::info;

use crate::config::{BaichuanConfig, BuildConfig};
use crate::device::DeviceProfile;
use crate::error::{Error, Result};
use crate::layers::parallel::{Communicator, SingleRank};
use crate::mapping::Mapping;
use crate::model::BaichuanForCausalLM;

pub fn load_config(model_dir: &Path) -> Result<BaichuanConfig> {
    let config_path = model_dir.join("config.json");
    let config_str = fs::read_to_string(&config_path).map_err(|e| {
        Error::ModelLoadError(format!("Failed to read {}: {e}", config_path.display()))
    })?;
    BaichuanConfig::from_hf_json(&config_str)
}

/// Safetensors files of a checkpoint: the shards listed by
/// `model.safetensors.index.json`, or a single `model.safetensors`.
pub fn weight_files(model_dir: &Path) -> Result<Vec<PathBuf>> {
    let index_path = model_dir.join("model.safetensors.index.json");
    let files = if index_path.exists() {
        let index_data = fs::read_to_string(&index_path)?;
        let index: Value = serde_json::from_str(&index_data)?;
        let weight_map = index
            .get("weight_map")
            .and_then(|m| m.as_object())
            .ok_or_else(|| {
                Error::ModelLoadError("Invalid model.safetensors.index.json format".to_string())
            })?;

        let mut shard_files: Vec<String> = weight_map
            .values()
            .filter_map(|v| v.as_str().map(String::from))
            .collect();
        shard_files.sort();
        shard_files.dedup();
        shard_files.iter().map(|f| model_dir.join(f)).collect()
    } else {
        vec![model_dir.join("model.safetensors")]
    };

    if let Some(missing) = files.iter().find(|f| !f.exists()) {
        return Err(Error::ModelLoadError(format!(
            "Missing weight file {}",
            missing.display()
        )));
    }
    Ok(files)
}

pub fn var_builder(model_dir: &Path, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    let files = weight_files(model_dir)?;
    // The files are mapped read-only and must not change while loaded.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files, dtype, device)? };
    Ok(vb)
}

/// Load the model for a single device.
pub fn load_model(
    model_dir: &Path,
    build: &BuildConfig,
    device: &DeviceProfile,
) -> Result<BaichuanForCausalLM> {
    load_rank(
        model_dir,
        Mapping::default(),
        build,
        device,
        Arc::new(SingleRank),
    )
}

/// Load the shard of `mapping`'s rank. Every rank reads the full checkpoint
/// and keeps its own slice.
pub fn load_rank(
    model_dir: &Path,
    mapping: Mapping,
    build: &BuildConfig,
    device: &DeviceProfile,
    comm: Arc<dyn Communicator>,
) -> Result<BaichuanForCausalLM> {
    let config = load_config(model_dir)?;
    let dtype = device.select_dtype(Some(&config.dtype));
    let vb = var_builder(model_dir, dtype, &device.device)?;
    let model = BaichuanForCausalLM::load(config, mapping, build.clone(), vb, comm)?;

    info!(
        "Loaded Baichuan ({} layers, {}) rank {}/{} on {} as {:?}",
        model.config().num_layers,
        model.config().position_embedding_type,
        mapping.tp_rank(),
        mapping.tp_size,
        device.kind,
        dtype
    );
    Ok(model)
}
