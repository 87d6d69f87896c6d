//! ONNX protobuf messages.
//!
//! `onnx.rs` holds the prost message definitions for the subset of
//! `onnx.proto3` the optimizer reads and writes. Field numbers follow the
//! upstream schema, so unknown-to-us fields of real models are skipped on
//! decode and the kept ones round-trip unchanged.

#[allow(clippy::all)]
mod onnx;

pub use onnx::*;
