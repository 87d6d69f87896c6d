//! bert-fusion CLI
//!
//! Command-line interface for optimizing BERT-family ONNX models, inspecting
//! the result and generating synthetic encoders.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use bert_fusion::eval::{compare_models, parse_shape_override, CompareOptions};
use bert_fusion::synthetic::{BertGraphBuilder, GeluForm};
use bert_fusion::{graph, FusionCounts, ModelType, OptimizerConfig, Optimizer, WaitPolicy};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

/// bert-fusion - Fuse transformer-encoder operator motifs in ONNX models
///
/// This tool provides three commands:
/// - `optimize`: Fuse a model and report how complete the fusion is
/// - `inspect`: Show graph statistics and fused-operator counts
/// - `generate`: Write an unfused synthetic BERT encoder
#[derive(Parser, Debug)]
#[command(name = "bert-fusion")]
#[command(version)]
#[command(about = "Operator-fusion optimizer for BERT-family ONNX models", long_about = None)]
struct Cli {
    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Optimize an ONNX model
    ///
    /// The optimizer runs one pass per fusion kind, in order:
    /// 1. Reshape collapsing
    /// 2. LayerNormalization
    /// 3. EmbedLayerNormalization
    /// 4. SkipLayerNormalization
    /// 5. Attention
    /// 6. Gelu / FastGelu
    ///
    /// Dead nodes and initializers are pruned after every pass.
    Optimize(OptimizeArgs),

    /// Show graph statistics and fused-operator counts of a model
    Inspect(InspectArgs),

    /// Write an unfused synthetic BERT encoder
    Generate(GenerateArgs),
}

#[derive(Parser, Debug)]
struct OptimizeArgs {
    /// Path to input ONNX model file
    #[arg(short, long)]
    input: PathBuf,

    /// Output path for the optimized model
    #[arg(short, long)]
    output: PathBuf,

    /// Model family: bert (expected counts are checked) or generic
    #[arg(long = "model-type")]
    model_type: Option<ModelType>,

    /// Declared attention head count (0 = infer from the graph)
    #[arg(long = "num-heads")]
    num_heads: Option<usize>,

    /// Declared hidden size (0 = infer from the graph)
    #[arg(long = "hidden-size")]
    hidden_size: Option<usize>,

    /// Declared number of encoder layers (default: number of Softmax nodes)
    #[arg(long = "num-layers")]
    num_layers: Option<usize>,

    /// Skip a fusion (reshape, layernorm, embedlayernorm, skiplayernorm, attention, gelu)
    ///
    /// Can be specified multiple times.
    #[arg(long = "disable")]
    disable: Vec<String>,

    /// Path to config file (TOML format)
    ///
    /// If not specified, searches for config in:
    /// 1. ./bert-fusion.toml (current dir)
    /// 2. ./.bert-fusion.toml (dotfile in current dir)
    /// 3. ~/.config/bert-fusion/config.toml (user config)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Run both models on seeded random inputs and compare every output
    #[arg(long)]
    verify: bool,

    /// Concrete input shape for verification
    ///
    /// Format: "name:dim1,dim2,..." (e.g., "input_ids:1,128")
    /// Can be specified multiple times for different inputs.
    /// Dynamic dimensions without an override default to 1.
    #[arg(long = "verify-shape", requires = "verify")]
    verify_shapes: Vec<String>,

    /// Seed for verification inputs
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Write the fusion report as JSON
    #[arg(long = "report-json")]
    report_json: Option<PathBuf>,

    /// Write runtime session options as a JSON sidecar
    #[arg(long = "session-config")]
    session_config: Option<PathBuf>,

    /// Intra-op thread count recorded in the session sidecar
    #[arg(long)]
    threads: Option<usize>,

    /// Idle thread behavior recorded in the session sidecar
    #[arg(long = "wait-policy")]
    wait_policy: Option<WaitPolicy>,

    /// Exit with status 2 when the model is not fully optimized
    #[arg(long)]
    strict: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// Path to ONNX model file
    #[arg(short, long)]
    input: PathBuf,

    /// Print fused-operator counts as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum GeluArg {
    Erf,
    Tanh,
}

impl From<GeluArg> for GeluForm {
    fn from(arg: GeluArg) -> Self {
        match arg {
            GeluArg::Erf => GeluForm::Erf,
            GeluArg::Tanh => GeluForm::Tanh,
        }
    }
}

#[derive(Parser, Debug)]
struct GenerateArgs {
    /// Output ONNX file path
    #[arg(short, long)]
    output: PathBuf,

    /// Number of encoder layers
    #[arg(long, default_value = "2")]
    layers: usize,

    /// Attention heads per layer
    #[arg(long, default_value = "2")]
    heads: usize,

    /// Hidden size
    #[arg(long, default_value = "8")]
    hidden: usize,

    /// Feed-forward width (default: 4 x hidden)
    #[arg(long)]
    intermediate: Option<usize>,

    /// Vocabulary size
    #[arg(long, default_value = "16")]
    vocab: usize,

    /// Sequence length
    #[arg(long = "seq-len", default_value = "4")]
    seq_len: usize,

    /// Exported Gelu form
    #[arg(long, value_enum, default_value = "erf")]
    gelu: GeluArg,

    /// Omit the attention mask input
    #[arg(long = "no-mask")]
    no_mask: bool,

    /// Insert a collapsible Reshape pair before the head
    #[arg(long = "redundant-reshape")]
    redundant_reshape: bool,

    /// Write weights without payload (dims and dtype only)
    #[arg(long = "structure-only")]
    structure_only: bool,

    /// Seed for random weights
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Give this layer irregular Q/K projections
    #[arg(long = "irregular-layer")]
    irregular_layer: Option<usize>,
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Optimize(args) => run_optimize(args, cli.verbose),
        Commands::Inspect(args) => run_inspect(args),
        Commands::Generate(args) => run_generate(args),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<OptimizerConfig> {
    if let Some(path) = path {
        info!("Loading config from: {}", path.display());
        return OptimizerConfig::load(path).with_context(|| format!("Failed to load config {}", path.display()));
    }
    match OptimizerConfig::find_and_load() {
        Ok(Some(config)) => {
            info!("Loaded config from standard location");
            Ok(config)
        }
        Ok(None) => Ok(OptimizerConfig::default()),
        Err(e) => {
            warn!("Ignoring config file: {}", e);
            Ok(OptimizerConfig::default())
        }
    }
}

fn run_optimize(args: OptimizeArgs, verbose: bool) -> anyhow::Result<i32> {
    let config = load_config(args.config.as_deref())?;

    // Merge config with CLI args (CLI takes precedence)
    let merged = config.merge_with_cli(
        args.model_type,
        args.num_heads,
        args.hidden_size,
        args.num_layers,
        &args.disable,
        args.strict.then_some(true),
        verbose.then_some(true),
        args.threads,
        args.wait_policy,
    )?;

    let mut model = graph::load_file(&args.input)
        .with_context(|| format!("Failed to load model {}", args.input.display()))?;
    let original = args.verify.then(|| model.clone());

    let optimizer = Optimizer::new(merged.optimization_options()).with_verbose(merged.verbose);
    let outcome = optimizer.optimize_graph(&mut model)?;
    graph::save_file(&model, &args.output)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;

    println!("{}", outcome.report);
    if merged.verbose {
        println!("{}", outcome.stats);
    }
    println!("Output: {}", args.output.display());

    if let Some(path) = &args.report_json {
        let json = serde_json::to_string_pretty(&outcome.report)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    }
    if let Some(path) = &args.session_config {
        merged.session.write_sidecar(path)?;
    }

    if let Some(original) = original {
        let shape_overrides = args
            .verify_shapes
            .iter()
            .map(|spec| parse_shape_override(spec))
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        let options = CompareOptions {
            seed: args.seed,
            shape_overrides,
            ..Default::default()
        };
        let comparison = compare_models(&original, &model, &options).context("Verification failed to run")?;
        println!("Verification:");
        print!("{comparison}");
        if !comparison.passed {
            anyhow::bail!("optimized model outputs differ from the original");
        }
    }

    if merged.strict && !outcome.report.fully_optimized {
        eprintln!("Model is not fully optimized (--strict)");
        return Ok(2);
    }
    Ok(0)
}

fn run_inspect(args: InspectArgs) -> anyhow::Result<i32> {
    let model = graph::load_file(&args.input)
        .with_context(|| format!("Failed to load model {}", args.input.display()))?;
    let counts = FusionCounts::from_graph(&model);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&counts)?);
        return Ok(0);
    }

    print!("{}", model.statistics());
    println!("Fused operators:");
    println!("  EmbedLayerNormalization: {}", counts.embed_layer_norm);
    println!("  Attention: {}", counts.attention);
    println!("  Gelu: {}", counts.gelu);
    println!("  LayerNormalization: {}", counts.layer_norm);
    println!("  SkipLayerNormalization: {}", counts.skip_layer_norm);
    Ok(0)
}

fn run_generate(args: GenerateArgs) -> anyhow::Result<i32> {
    let mut builder = BertGraphBuilder::new()
        .layers(args.layers)
        .heads(args.heads)
        .hidden(args.hidden)
        .vocab(args.vocab)
        .seq_len(args.seq_len)
        .gelu(args.gelu.into())
        .mask(!args.no_mask)
        .redundant_reshape(args.redundant_reshape)
        .structure_only(args.structure_only)
        .seed(args.seed)
        .irregular_layer(args.irregular_layer);
    if let Some(intermediate) = args.intermediate {
        builder = builder.intermediate(intermediate);
    }

    let model = builder.build()?;
    graph::save_file(&model, &args.output)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;
    println!(
        "Wrote {} ({} nodes, {} layers)",
        args.output.display(),
        model.node_count(),
        args.layers
    );
    Ok(0)
}
