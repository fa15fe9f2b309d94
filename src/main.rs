//! sparsellm CLI - one-shot layerwise LLM compression
//!
//! Sparsify and quantize a transformer checkpoint against a small
//! calibration corpus, without retraining.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tokenizers::Tokenizer;

use rs_sparsellm::{
    config::ModelConfig,
    layers::CheckpointWriter,
    utils::{format_bytes, get_device, parse_dtype},
    CalibrationDataset, CompressionConfig, LayerwiseModel, OneShotCompressor, WeightStorage,
};

#[derive(Parser)]
#[command(name = "sparsellm")]
#[command(author, version, about = "One-shot layerwise LLM compression", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sparsify (and optionally quantize) a checkpoint
    Compress {
        /// Checkpoint directory (config.json + safetensors shards)
        #[arg(short, long)]
        model: PathBuf,

        /// Output directory for the compressed checkpoint
        #[arg(short, long)]
        output: PathBuf,

        /// Target sparsity (fraction of weights zeroed)
        #[arg(long, default_value = "0.5")]
        sparsity: f32,

        /// n of an n:m structured pattern (0 = unstructured)
        #[arg(long, default_value = "0")]
        prunen: usize,

        /// m of an n:m structured pattern
        #[arg(long, default_value = "0")]
        prunem: usize,

        /// Solver/quantizer column block size
        #[arg(long, default_value = "128")]
        block_size: usize,

        /// Hessian dampening fraction
        #[arg(long, default_value = "0.01")]
        dampening: f32,

        /// Solve each layer's projections in one joint pass
        #[arg(long)]
        batched: bool,

        /// Quantize surviving weights after pruning
        #[arg(long)]
        quantize: bool,

        /// On-disk format for the output checkpoint
        #[arg(long, value_enum, default_value = "dense")]
        storage: StorageMode,

        /// Calibration text corpus
        #[arg(short, long)]
        calibration: PathBuf,

        /// Number of calibration samples drawn from the corpus
        #[arg(long, default_value = "64")]
        num_samples: usize,

        /// Calibration sequence length
        #[arg(long, default_value = "512")]
        seq_len: usize,

        /// Seed for calibration window sampling
        #[arg(long)]
        seed: Option<u64>,

        /// GPU device ID (auto-detect if not specified)
        #[arg(long)]
        device: Option<usize>,

        /// Compute dtype (f32, f16, bf16)
        #[arg(long, default_value = "f32")]
        dtype: String,

        /// Name prefix selecting compressible layers
        #[arg(long, default_value = "model.layers")]
        layers: String,
    },

    /// Show information about a checkpoint
    Info {
        /// Checkpoint directory
        #[arg(short, long)]
        model: PathBuf,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum StorageMode {
    Dense,
    Int8,
    Nf4,
}

impl From<StorageMode> for WeightStorage {
    fn from(mode: StorageMode) -> Self {
        match mode {
            StorageMode::Dense => WeightStorage::Dense,
            StorageMode::Int8 => WeightStorage::Int8,
            StorageMode::Nf4 => WeightStorage::Nf4,
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rs_sparsellm=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Compress {
            model,
            output,
            sparsity,
            prunen,
            prunem,
            block_size,
            dampening,
            batched,
            quantize,
            storage,
            calibration,
            num_samples,
            seq_len,
            seed,
            device,
            dtype,
            layers,
        } => {
            let config = CompressionConfig::builder()
                .sparsity(sparsity)
                .structured(prunen, prunem)
                .block_size(block_size)
                .dampening_frac(dampening)
                .sequential_update(!batched)
                .quantize(quantize)
                .compress_layers(layers)
                .storage(storage.into())
                .build()?;

            compress(
                &model,
                &output,
                config,
                &calibration,
                num_samples,
                seq_len,
                seed,
                device,
                &dtype,
            )?;
        }

        Commands::Info { model } => {
            show_info(&model)?;
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn compress(
    model_path: &PathBuf,
    output: &PathBuf,
    config: CompressionConfig,
    calibration: &PathBuf,
    num_samples: usize,
    seq_len: usize,
    seed: Option<u64>,
    device_id: Option<usize>,
    dtype: &str,
) -> anyhow::Result<()> {
    println!("Loading model: {:?}", model_path);

    let device = get_device(device_id)?;
    println!("Using device: {:?}", device);

    let dtype = parse_dtype(dtype);
    let model = LayerwiseModel::load(model_path, dtype)?;

    let tokenizer_path = model_path.join("tokenizer.json");
    let tokenizer = Tokenizer::from_file(&tokenizer_path)
        .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;

    let dataset =
        CalibrationDataset::from_text_file(calibration, &tokenizer, seq_len, num_samples, seed)?;
    println!(
        "Calibration: {} samples x {} tokens",
        dataset.len(),
        dataset.seq_len()
    );

    let storage = config.storage();
    let block_size = config.block_size();

    let mut compressor = OneShotCompressor::new(config);
    compressor.initialize(model, device)?;
    let payload = compressor.run(&dataset)?;
    compressor.finalize(&payload)?;

    println!("\nPer-layer results");
    println!("=================");
    for telemetry in compressor.telemetry() {
        println!(
            "layer {:>3}  sparsity {:>5.1}%  passes {:>2}  error {:.3e}",
            telemetry.layer_idx,
            telemetry.achieved_sparsity() * 100.0,
            telemetry.solver_passes,
            telemetry.error_estimate
        );
    }

    let model = compressor.into_model()?;
    CheckpointWriter::new(output, storage, block_size).write(&model)?;

    println!("\nCompressed checkpoint written to {:?}", output);
    Ok(())
}

fn show_info(model_path: &PathBuf) -> anyhow::Result<()> {
    let config = ModelConfig::from_file(model_path.join("config.json"))?;

    println!("Model Information");
    println!("=================");
    println!("Architecture: {:?}", config.architecture());
    println!("Vocab size: {}", config.vocab_size);
    println!("Hidden size: {}", config.hidden_size);
    println!("Intermediate size: {}", config.intermediate_size);
    println!("Num layers: {}", config.num_hidden_layers);
    println!("Num attention heads: {}", config.num_attention_heads);
    println!("Num KV heads: {}", config.num_kv_heads());
    println!("Head dim: {}", config.head_dim());
    println!("Max position embeddings: {}", config.max_position_embeddings);
    println!("Use cache: {}", config.use_cache);
    println!("Using GQA: {}", config.is_gqa());

    // Estimate memory
    let kv_dim = config.num_kv_heads() * config.head_dim();
    let params_per_layer = config.hidden_size * config.hidden_size * 2 // q, o projections
        + config.hidden_size * kv_dim * 2                             // k, v projections
        + config.hidden_size * config.intermediate_size * 3; // MLP

    let total_params = config.vocab_size * config.hidden_size // embeddings
        + params_per_layer * config.num_hidden_layers
        + config.hidden_size * config.vocab_size; // lm_head

    println!("\nEstimated Parameters");
    println!("====================");
    println!("Per layer: ~{:.1}M", params_per_layer as f64 / 1e6);
    println!("Total: ~{:.2}B", total_params as f64 / 1e9);

    let f16_bytes = (total_params * 2) as u64;
    println!("\nEstimated Storage");
    println!("=================");
    println!("Dense (FP16): ~{}", format_bytes(f16_bytes));
    println!(
        "Int8: ~{}",
        format_bytes((f16_bytes as f32 * WeightStorage::Int8.ratio()) as u64)
    );
    println!(
        "NF4: ~{}",
        format_bytes((f16_bytes as f32 * WeightStorage::Nf4.ratio()) as u64)
    );

    Ok(())
}
