//! Graph IR and ONNX serialization

pub mod attributes;
pub mod codec;
pub mod ir;
pub mod tensor;

pub use attributes::AttrValue;
pub use codec::{load, load_file, save, save_file, SUPPORTED_OPSETS};
pub use ir::{Dependency, Graph, GraphNode, GraphStatistics, ModelMetadata, NewOp, NodeId, MS_DOMAIN};
