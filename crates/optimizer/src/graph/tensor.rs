// TensorProto helpers: payload decoding, constructors and declared shapes

use crate::proto::tensor_proto::{DataLocation, DataType};
use crate::proto::tensor_shape_proto::{dimension, Dimension};
use crate::proto::type_proto;
use crate::proto::{TensorProto, TensorShapeProto, TypeProto, ValueInfoProto};

/// Element count for a shape (1 for scalars)
pub fn numel(dims: &[i64]) -> usize {
    dims.iter().map(|&d| d.max(0) as usize).product()
}

pub fn data_type(tensor: &TensorProto) -> DataType {
    DataType::try_from(tensor.data_type).unwrap_or(DataType::Undefined)
}

/// Tensor whose payload lives in a separate file
pub fn is_external(tensor: &TensorProto) -> bool {
    tensor.data_location == DataLocation::External as i32
}

/// True when the tensor carries dims and dtype but no readable values.
///
/// Structure-only tensors come from tools that ship weights separately, or
/// from external-data models loaded without their data files.
pub fn is_structure_only(tensor: &TensorProto) -> bool {
    if numel(&tensor.dims) == 0 {
        return false;
    }
    is_external(tensor)
        || (tensor.raw_data.is_empty()
            && tensor.float_data.is_empty()
            && tensor.int32_data.is_empty()
            && tensor.int64_data.is_empty()
            && tensor.double_data.is_empty()
            && tensor.uint64_data.is_empty()
            && tensor.string_data.is_empty())
}

/// Decode a floating-point tensor. Integer tensors are widened so that
/// exporters emitting integral constants (e.g. `Pow(x, 2)`) still read.
pub fn f32_values(tensor: &TensorProto) -> Option<Vec<f32>> {
    if is_structure_only(tensor) {
        return None;
    }
    let raw = &tensor.raw_data;
    match data_type(tensor) {
        DataType::Float if !raw.is_empty() => Some(
            raw.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        DataType::Float => Some(tensor.float_data.clone()),
        DataType::Double if !raw.is_empty() => Some(
            raw.chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
                .collect(),
        ),
        DataType::Double => Some(tensor.double_data.iter().map(|&v| v as f32).collect()),
        DataType::Int64 | DataType::Int32 => {
            i64_values(tensor).map(|v| v.into_iter().map(|x| x as f32).collect())
        }
        _ => None,
    }
}

/// Decode an integer tensor (int64, int32 or bool)
pub fn i64_values(tensor: &TensorProto) -> Option<Vec<i64>> {
    if is_structure_only(tensor) {
        return None;
    }
    let raw = &tensor.raw_data;
    match data_type(tensor) {
        DataType::Int64 if !raw.is_empty() => Some(
            raw.chunks_exact(8)
                .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        ),
        DataType::Int64 => Some(tensor.int64_data.clone()),
        DataType::Int32 if !raw.is_empty() => Some(
            raw.chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64)
                .collect(),
        ),
        DataType::Int32 | DataType::Bool => Some(tensor.int32_data.iter().map(|&v| v as i64).collect()),
        _ => None,
    }
}

/// Value of a single-element tensor, whatever its rank
pub fn scalar_f32(tensor: &TensorProto) -> Option<f32> {
    match f32_values(tensor)?.as_slice() {
        [v] => Some(*v),
        _ => None,
    }
}

/// Float tensor with little-endian raw payload
pub fn float_tensor(name: impl Into<String>, dims: &[i64], values: &[f32]) -> TensorProto {
    TensorProto {
        name: name.into(),
        dims: dims.to_vec(),
        data_type: DataType::Float as i32,
        raw_data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ..Default::default()
    }
}

/// Int64 tensor with little-endian raw payload
pub fn int64_tensor(name: impl Into<String>, dims: &[i64], values: &[i64]) -> TensorProto {
    TensorProto {
        name: name.into(),
        dims: dims.to_vec(),
        data_type: DataType::Int64 as i32,
        raw_data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ..Default::default()
    }
}

/// Dims and dtype only, no payload
pub fn structure_only(name: impl Into<String>, dims: &[i64], dtype: DataType) -> TensorProto {
    TensorProto {
        name: name.into(),
        dims: dims.to_vec(),
        data_type: dtype as i32,
        ..Default::default()
    }
}

/// One declared dimension of a graph input or output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dim {
    Fixed(i64),
    Symbolic(String),
}

/// Build a tensor value info
pub fn value_info(name: impl Into<String>, elem_type: DataType, dims: &[Dim]) -> ValueInfoProto {
    let dim = dims
        .iter()
        .map(|d| Dimension {
            denotation: String::new(),
            value: Some(match d {
                Dim::Fixed(v) => dimension::Value::DimValue(*v),
                Dim::Symbolic(s) => dimension::Value::DimParam(s.clone()),
            }),
        })
        .collect();
    ValueInfoProto {
        name: name.into(),
        r#type: Some(TypeProto {
            denotation: String::new(),
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: elem_type as i32,
                shape: Some(TensorShapeProto { dim }),
            })),
        }),
        doc_string: String::new(),
    }
}

/// Declared element type and shape of a value info, `None` per unknown dim
pub fn declared_type(info: &ValueInfoProto) -> Option<(DataType, Vec<Option<i64>>)> {
    let type_proto::Value::TensorType(tensor) = info.r#type.as_ref()?.value.as_ref()?;
    let elem = DataType::try_from(tensor.elem_type).unwrap_or(DataType::Undefined);
    let dims = tensor
        .shape
        .as_ref()
        .map(|s| {
            s.dim
                .iter()
                .map(|d| match d.value {
                    Some(dimension::Value::DimValue(v)) if v > 0 => Some(v),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    Some((elem, dims))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_float_roundtrip() {
        let t = float_tensor("w", &[2, 2], &[1.0, -2.0, 0.5, 3.25]);
        assert_eq!(f32_values(&t), Some(vec![1.0, -2.0, 0.5, 3.25]));
        assert!(!is_structure_only(&t));
    }

    #[test]
    fn test_typed_float_data() {
        let t = TensorProto {
            dims: vec![],
            data_type: DataType::Float as i32,
            float_data: vec![2.0],
            ..Default::default()
        };
        assert_eq!(scalar_f32(&t), Some(2.0));
    }

    #[test]
    fn test_structure_only_has_no_values() {
        let t = structure_only("w", &[1024, 1024], DataType::Float);
        assert!(is_structure_only(&t));
        assert_eq!(f32_values(&t), None);
    }

    #[test]
    fn test_empty_tensor_is_not_structure_only() {
        let t = int64_tensor("axes", &[0], &[]);
        assert!(!is_structure_only(&t));
        assert_eq!(i64_values(&t), Some(vec![]));
    }

    #[test]
    fn test_int64_widened_to_float() {
        let t = int64_tensor("two", &[], &[2]);
        assert_eq!(scalar_f32(&t), Some(2.0));
    }

    #[test]
    fn test_declared_type() {
        let info = value_info(
            "input_ids",
            DataType::Int64,
            &[Dim::Symbolic("batch".into()), Dim::Fixed(128)],
        );
        let (elem, dims) = declared_type(&info).unwrap();
        assert_eq!(elem, DataType::Int64);
        assert_eq!(dims, vec![None, Some(128)]);
    }
}
