//! Baichuan CLI - inspect checkpoints, print input profiles and generate text

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use baichuan_core::BaichuanVersion;

mod commands;

/// Baichuan causal language model on candle
///
/// Examples:
///   baichuan info --model-dir ./Baichuan2-7B-Chat
///   baichuan profile --preset v2_13b --tp-size 4
///   baichuan generate --model-dir ./Baichuan2-7B-Chat --prompt "Hello"
#[derive(Parser)]
#[command(
    name = "baichuan",
    about = "Baichuan causal language model",
    version = env!("CARGO_PKG_VERSION"),
    arg_required_else_help = true,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format
    #[arg(
        long = "output-format",
        global = true,
        value_enum,
        default_value = "table"
    )]
    pub output_format: OutputFormat,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the hyperparameters of a checkpoint
    Info {
        /// Checkpoint directory with config.json
        #[arg(short, long, env = "BAICHUAN_MODEL_DIR")]
        model_dir: PathBuf,
    },

    /// Print the input profile of a build as JSON
    ///
    /// Lists every input and output tensor with the legal range of each
    /// dynamic dimension.
    Profile {
        /// Checkpoint directory with config.json
        #[arg(short, long, env = "BAICHUAN_MODEL_DIR")]
        model_dir: Option<PathBuf>,

        /// Published checkpoint to take hyperparameters from; wins over --model-dir
        #[arg(long, value_parser = clap::value_parser!(BaichuanVersion))]
        preset: Option<BaichuanVersion>,

        /// Tensor-parallel degree
        #[arg(long, default_value = "1")]
        tp_size: usize,

        #[command(flatten)]
        build: BuildArgs,

        #[command(flatten)]
        limits: LimitArgs,
    },

    /// Generate a continuation of a prompt
    #[command(alias = "gen")]
    Generate {
        /// Checkpoint directory with config.json, weights and tokenizer.json
        #[arg(short, long, env = "BAICHUAN_MODEL_DIR")]
        model_dir: PathBuf,

        /// Prompt text
        #[arg(short, long, required_unless_present = "token_ids")]
        prompt: Option<String>,

        /// Comma-separated prompt token ids, bypassing the tokenizer
        #[arg(long, value_delimiter = ',', conflicts_with = "prompt")]
        token_ids: Option<Vec<u32>>,

        /// Maximum number of new tokens
        #[arg(short = 'n', long, default_value = "64")]
        max_new_tokens: usize,

        /// Sampling temperature; 0 decodes greedily
        #[arg(short, long, default_value = "0.0")]
        temperature: f64,

        #[arg(long)]
        top_k: Option<usize>,

        #[arg(long)]
        top_p: Option<f64>,

        #[arg(long, default_value = "42")]
        seed: u64,

        /// Beams per prompt; above 1 runs beam search
        #[arg(long, default_value = "1")]
        beam_width: usize,

        #[arg(long, default_value = "1.0")]
        length_penalty: f64,

        /// Device to run on (cpu, cuda, metal); detected when omitted
        #[arg(long, env = "BAICHUAN_DEVICE")]
        device: Option<String>,

        #[command(flatten)]
        build: BuildArgs,
    },
}

/// Build-time switches.
#[derive(Args, Clone)]
pub struct BuildArgs {
    /// JSON file with a build config; flags below override it
    #[arg(long, value_name = "PATH")]
    pub build_config: Option<PathBuf>,

    /// Pack sequences into one row
    #[arg(long)]
    pub remove_input_padding: bool,

    /// Use an attention mask instead of per-sequence lengths
    #[arg(long)]
    pub no_gpt_attention_plugin: bool,

    #[arg(long)]
    pub no_gemm_plugin: bool,

    /// Store keys/values in fixed-size blocks
    #[arg(long)]
    pub paged_kv_cache: bool,

    #[arg(long)]
    pub tokens_per_block: Option<usize>,
}

#[derive(Args, Clone)]
pub struct LimitArgs {
    #[arg(long, default_value = "8")]
    pub max_batch_size: usize,

    #[arg(long, default_value = "1024")]
    pub max_input_len: usize,

    #[arg(long, default_value = "1024")]
    pub max_new_tokens: usize,

    #[arg(long, default_value = "1")]
    pub max_beam_width: usize,

    #[arg(long)]
    pub max_num_tokens: Option<usize>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format
    Table,
    /// JSON output
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "baichuan=debug,baichuan_core=debug"
    } else {
        "baichuan=info,baichuan_core=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Info { model_dir } => commands::info(&model_dir, cli.output_format),

        Commands::Profile {
            model_dir,
            preset,
            tp_size,
            build,
            limits,
        } => commands::profile(model_dir.as_deref(), preset, tp_size, &build, &limits),

        Commands::Generate {
            model_dir,
            prompt,
            token_ids,
            max_new_tokens,
            temperature,
            top_k,
            top_p,
            seed,
            beam_width,
            length_penalty,
            device,
            build,
        } => commands::generate(
            commands::GenerateArgs {
                model_dir,
                prompt,
                token_ids,
                max_new_tokens,
                temperature,
                top_k,
                top_p,
                seed,
                beam_width,
                length_penalty,
                device,
                build,
            },
            cli.output_format,
        ),
    }
}
