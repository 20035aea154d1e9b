use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{info, warn};

use baichuan_core::{
    prepare_inputs, weights, BaichuanConfig, BaichuanVersion, BuildConfig, DeviceSelector,
    GenerationParams, Generator, InputLimits, Mapping, Tokenizer,
};

use crate::{BuildArgs, LimitArgs, OutputFormat};

pub struct GenerateArgs {
    pub model_dir: PathBuf,
    pub prompt: Option<String>,
    pub token_ids: Option<Vec<u32>>,
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_k: Option<usize>,
    pub top_p: Option<f64>,
    pub seed: u64,
    pub beam_width: usize,
    pub length_penalty: f64,
    pub device: Option<String>,
    pub build: BuildArgs,
}

fn build_config(args: &BuildArgs) -> Result<BuildConfig> {
    let mut build = match &args.build_config {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&json)
                .with_context(|| format!("Invalid build config {}", path.display()))?
        }
        None => BuildConfig::default(),
    };
    build.remove_input_padding |= args.remove_input_padding;
    build.paged_kv_cache |= args.paged_kv_cache;
    if args.no_gpt_attention_plugin {
        build.gpt_attention_plugin = false;
    }
    if args.no_gemm_plugin {
        build.gemm_plugin = false;
    }
    if let Some(tokens_per_block) = args.tokens_per_block {
        build.tokens_per_block = tokens_per_block;
    }
    build.validate()?;
    Ok(build)
}

pub fn info(model_dir: &Path, format: OutputFormat) -> Result<()> {
    let config = weights::load_config(model_dir)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
        OutputFormat::Table => {
            let version = BaichuanVersion::infer(config.hidden_size, config.vocab_size)
                .map(|v| v.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let rows = [
                ("version", version),
                ("layers", config.num_layers.to_string()),
                ("heads", config.num_heads.to_string()),
                ("hidden size", config.hidden_size.to_string()),
                ("head size", config.head_size().to_string()),
                ("mlp hidden size", config.mlp_hidden_size().to_string()),
                ("vocab size", config.vocab_size.to_string()),
                ("position embedding", config.position_embedding_type.to_string()),
                ("max positions", config.max_position_embeddings.to_string()),
                ("norm head", config.norm_head.to_string()),
                ("dtype", config.dtype.clone()),
            ];
            for (key, value) in rows {
                println!("{key:<20} {value}");
            }
        }
    }
    Ok(())
}

pub fn profile(
    model_dir: Option<&Path>,
    preset: Option<BaichuanVersion>,
    tp_size: usize,
    build: &BuildArgs,
    limits: &LimitArgs,
) -> Result<()> {
    let config = match (model_dir, preset) {
        (_, Some(version)) => BaichuanConfig::preset(version),
        (Some(dir), None) => weights::load_config(dir)?,
        (None, None) => bail!("Either --model-dir or --preset is required"),
    };
    let mapping = Mapping::new(tp_size, tp_size, 0)?;
    let build = build_config(build)?;
    let limits = InputLimits {
        max_batch_size: limits.max_batch_size,
        max_input_len: limits.max_input_len,
        max_new_tokens: limits.max_new_tokens,
        max_beam_width: limits.max_beam_width,
        max_num_tokens: limits.max_num_tokens,
    };

    let profile = prepare_inputs(&config, &mapping, &build, &limits)?;
    info!(
        "{} input(s), {} output(s), {} optimization profile(s)",
        profile.inputs.len(),
        profile.outputs.len(),
        profile.num_profiles
    );
    println!("{}", profile.to_json()?);
    Ok(())
}

pub fn generate(args: GenerateArgs, format: OutputFormat) -> Result<()> {
    let build = build_config(&args.build)?;
    let device = DeviceSelector::detect_with_preference(args.device.as_deref())?;

    let tokenizer = match (&args.prompt, Tokenizer::from_path(&args.model_dir)) {
        (_, Ok(tokenizer)) => Some(tokenizer),
        (Some(_), Err(e)) => return Err(e).context("A prompt needs tokenizer.json"),
        (None, Err(e)) => {
            warn!("Printing raw token ids: {e}");
            None
        }
    };
    let special_tokens = tokenizer
        .as_ref()
        .map(|t| *t.special_tokens())
        .unwrap_or_default();

    let prompt_ids = match (&args.prompt, &args.token_ids, &tokenizer) {
        (_, Some(ids), _) => ids.clone(),
        (Some(text), None, Some(tokenizer)) => tokenizer.encode_prompt(text)?,
        _ => return Err(anyhow!("Either --prompt or --token-ids is required")),
    };

    let started = Instant::now();
    let model = weights::load_model(&args.model_dir, &build, &device)
        .with_context(|| format!("Failed to load {}", args.model_dir.display()))?;
    info!("Model loaded in {:.2}s", started.elapsed().as_secs_f32());

    let limits = InputLimits {
        max_batch_size: 1,
        max_input_len: prompt_ids.len().max(1),
        max_new_tokens: args.max_new_tokens.max(1),
        max_beam_width: args.beam_width.max(1),
        max_num_tokens: None,
    };
    let params = GenerationParams {
        max_new_tokens: args.max_new_tokens,
        temperature: args.temperature,
        top_k: args.top_k,
        top_p: args.top_p,
        seed: args.seed,
        beam_width: args.beam_width,
        end_id: special_tokens.eos_id,
        pad_id: special_tokens.pad_id,
        length_penalty: args.length_penalty,
    };

    let generator = Generator::new(&model, limits)?;
    let started = Instant::now();
    let outputs = generator.generate(&[prompt_ids], &params)?;
    let output = outputs
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Generation returned no output"))?;
    let elapsed = started.elapsed().as_secs_f32();
    info!(
        "Generated {} token(s) in {elapsed:.2}s ({:.1} tok/s)",
        output.output_ids.len(),
        output.output_ids.len() as f32 / elapsed.max(f32::EPSILON)
    );

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Table => match &tokenizer {
            Some(tokenizer) => println!("{}", tokenizer.decode(&output.output_ids)?),
            None => println!("{:?}", output.output_ids),
        },
    }
    Ok(())
}
