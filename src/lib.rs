//! # bert-fusion
//!
//! Operator-fusion optimizer for BERT-family ONNX models.
//!
//! ## Overview
//!
//! This package provides both a CLI tool (`bert-fusion`) and a library API.
//! The optimizer finds the embedding lookup chain, multi-head self-attention,
//! decomposed layer normalization and Gelu expansions in an exported encoder
//! and replaces each with the fused operator the inference runtime provides.
//!
//! ## CLI Usage
//!
//! ```bash
//! # Optimize a model, declaring its hyperparameters
//! bert-fusion optimize -i model.onnx -o model.opt.onnx --num-heads 12 --hidden-size 768
//!
//! # Check numerical equivalence and fail when fusion is incomplete
//! bert-fusion optimize -i model.onnx -o model.opt.onnx --verify --strict
//!
//! # Show graph statistics and fused-operator counts
//! bert-fusion inspect -i model.opt.onnx
//!
//! # Write a small unfused encoder for experiments
//! bert-fusion generate -o tiny.onnx --layers 2 --heads 2 --hidden 8
//! ```
//!
//! ## Library Usage
//!
//! ```no_run
//! use bert_fusion::{OptimizationOptions, Optimizer};
//!
//! let optimizer = Optimizer::new(OptimizationOptions {
//!     num_heads: Some(12),
//!     ..Default::default()
//! })
//! .with_verbose(true);
//!
//! let outcome = optimizer.optimize_file("model.onnx", "model.opt.onnx")?;
//! println!("{}", outcome.report);
//! # Ok::<(), bert_fusion::OptimizerError>(())
//! ```

// Re-export everything from the optimizer crate
pub use bert_fusion_optimizer::*;
