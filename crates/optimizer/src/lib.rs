//! # bert-fusion optimizer
//!
//! Operator-fusion optimizer for transformer-encoder (BERT-family) models in
//! the ONNX format.
//!
//! ## Optimization Flow
//!
//! ```text
//! ONNX → Graph → [Match → Fuse → Prune] per fusion kind → Report → ONNX
//! ```
//!
//! ### Step 1: Load
//!
//! - Decode the `ModelProto`
//! - Build the petgraph-backed [`Graph`]
//! - Reject malformed models before anything is mutated
//!
//! ### Step 2: Fuse
//!
//! - Reshape collapsing
//! - LayerNormalization, EmbedLayerNormalization, SkipLayerNormalization
//! - Attention with packed Q/K/V weights and a shared mask cast
//! - Gelu / FastGelu
//! - Dead element removal after every pass
//!
//! ### Step 3: Report
//!
//! - Fused-operator counts against the counts expected for the encoder depth
//!
//! ## Usage
//!
//! ```no_run
//! use bert_fusion_optimizer::{optimize, ModelType};
//!
//! let report = optimize("model.onnx", "model.opt.onnx", ModelType::Bert, 12, 768)?;
//! println!("{report}");
//! # Ok::<(), bert_fusion_optimizer::OptimizerError>(())
//! ```

pub mod config;
pub mod error;
pub mod eval;
pub mod fusion;
pub mod graph;
pub mod matcher;
pub mod passes;
pub mod pipeline;
pub mod proto;
pub mod pruner;
pub mod report;
pub mod synthetic;

// Re-exports for convenient access
pub use error::{FormatError, FusionError, OptimizerError, Result};

pub use config::{ConfigError, MergedConfig, ModelType, OptimizerConfig, SessionOptions, WaitPolicy};
pub use fusion::{FusionContext, FusionFailure, FusionKind, FusionPass};
pub use graph::{load, load_file, save, save_file, Graph};
pub use passes::{OptimizationPass, OptimizationStats, PassStats};
pub use pipeline::{optimize, OptimizationOptions, OptimizationOutcome, Optimizer};
pub use pruner::{prune, DeadCodeElimination, PruneStats};
pub use report::{Deficit, ExpectedCounts, FusionCounts, Report, ReportKind};
