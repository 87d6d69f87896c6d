// Dense host tensors for the reference evaluator
//
// Row-major storage with a shape. Floating point values are kept as f32 and
// every integer type as i64, which covers the op vocabulary the evaluator
// runs.

use crate::error::OptimizerError;
use crate::graph::tensor::{data_type, f32_values, i64_values, is_structure_only};
use crate::proto::tensor_proto::DataType;
use crate::proto::TensorProto;
use crate::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    F32(Vec<f32>),
    I64(Vec<i64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Data,
}

pub(crate) fn eval_error(message: impl Into<String>) -> OptimizerError {
    OptimizerError::Evaluation(message.into())
}

impl Tensor {
    pub fn from_f32(shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self {
            shape,
            data: Data::F32(values),
        }
    }

    pub fn from_i64(shape: Vec<usize>, values: Vec<i64>) -> Self {
        Self {
            shape,
            data: Data::I64(values),
        }
    }

    pub fn scalar(value: f32) -> Self {
        Self::from_f32(Vec::new(), vec![value])
    }

    /// Convert a constant tensor; structure-only tensors cannot be evaluated
    pub fn from_proto(tensor: &TensorProto) -> Result<Self> {
        if is_structure_only(tensor) {
            return Err(eval_error(format!(
                "tensor '{}' has no payload (structure-only weights cannot be evaluated)",
                tensor.name
            )));
        }
        let shape = tensor
            .dims
            .iter()
            .map(|&d| usize::try_from(d).map_err(|_| eval_error(format!("negative dim in '{}'", tensor.name))))
            .collect::<Result<Vec<_>>>()?;

        let data = match data_type(tensor) {
            DataType::Float | DataType::Double => f32_values(tensor).map(Data::F32),
            DataType::Int64 | DataType::Int32 | DataType::Bool => i64_values(tensor).map(Data::I64),
            other => {
                return Err(eval_error(format!(
                    "tensor '{}' has unsupported type {:?}",
                    tensor.name, other
                )))
            }
        }
        .ok_or_else(|| eval_error(format!("tensor '{}' payload is unreadable", tensor.name)))?;

        let tensor = Self { shape, data };
        if tensor.data_len() != tensor.len() {
            return Err(eval_error(format!(
                "payload holds {} values, shape {:?} needs {}",
                tensor.data_len(),
                tensor.shape,
                tensor.len()
            )));
        }
        Ok(tensor)
    }

    /// Element count implied by the shape
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    fn data_len(&self) -> usize {
        match &self.data {
            Data::F32(v) => v.len(),
            Data::I64(v) => v.len(),
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self.data, Data::F32(_))
    }

    pub fn as_f32(&self) -> Result<&[f32]> {
        match &self.data {
            Data::F32(v) => Ok(v),
            Data::I64(_) => Err(eval_error("expected a float tensor, found int64")),
        }
    }

    pub fn as_i64(&self) -> Result<&[i64]> {
        match &self.data {
            Data::I64(v) => Ok(v),
            Data::F32(_) => Err(eval_error("expected an int64 tensor, found float")),
        }
    }

    pub fn to_f32(&self) -> Vec<f32> {
        match &self.data {
            Data::F32(v) => v.clone(),
            Data::I64(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }

    pub fn to_i64(&self) -> Vec<i64> {
        match &self.data {
            Data::F32(v) => v.iter().map(|&x| x as i64).collect(),
            Data::I64(v) => v.clone(),
        }
    }

    /// Same data under a new shape
    pub fn reshaped(&self, shape: Vec<usize>) -> Result<Self> {
        if shape.iter().product::<usize>() != self.len() {
            return Err(eval_error(format!("cannot reshape {:?} to {:?}", self.shape, shape)));
        }
        Ok(Self {
            shape,
            data: self.data.clone(),
        })
    }
}

/// Row-major strides
pub fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Numpy-style broadcast of two shapes
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let dim = |s: &[usize], i: usize| {
        let offset = rank - s.len();
        if i < offset {
            1
        } else {
            s[i - offset]
        }
    };
    (0..rank)
        .map(|i| match (dim(a, i), dim(b, i)) {
            (x, y) if x == y => Ok(x),
            (1, y) => Ok(y),
            (x, 1) => Ok(x),
            (x, y) => Err(eval_error(format!("shapes {a:?} and {b:?} do not broadcast ({x} vs {y})"))),
        })
        .collect()
}

/// Strides of `shape` viewed at rank `rank`, zero along broadcast dims
pub fn broadcast_strides(shape: &[usize], rank: usize) -> Vec<usize> {
    let mut padded = vec![1; rank - shape.len()];
    padded.extend_from_slice(shape);
    let mut result = strides(&padded);
    for (stride, &dim) in result.iter_mut().zip(&padded) {
        if dim == 1 {
            *stride = 0;
        }
    }
    result
}

/// Elementwise `f(a, b)` with broadcasting
pub fn broadcast_binary<T: Copy, U>(
    a: &[T],
    a_shape: &[usize],
    b: &[T],
    b_shape: &[usize],
    f: impl Fn(T, T) -> U,
) -> Result<(Vec<usize>, Vec<U>)> {
    let shape = broadcast_shape(a_shape, b_shape)?;
    let rank = shape.len();
    let (sa, sb) = (broadcast_strides(a_shape, rank), broadcast_strides(b_shape, rank));
    let count: usize = shape.iter().product();

    let mut out = Vec::with_capacity(count);
    let mut index = vec![0usize; rank];
    for _ in 0..count {
        let (mut ia, mut ib) = (0, 0);
        for d in 0..rank {
            ia += index[d] * sa[d];
            ib += index[d] * sb[d];
        }
        out.push(f(a[ia], b[ib]));
        for d in (0..rank).rev() {
            index[d] += 1;
            if index[d] < shape[d] {
                break;
            }
            index[d] = 0;
        }
    }
    Ok((shape, out))
}

/// Reorder axes: output axis `i` is input axis `perm[i]`
pub fn permute<T: Copy>(data: &[T], shape: &[usize], perm: &[usize]) -> (Vec<usize>, Vec<T>) {
    let out_shape: Vec<usize> = perm.iter().map(|&p| shape[p]).collect();
    let in_strides = strides(shape);
    let rank = shape.len();
    let count = data.len();

    let mut out = Vec::with_capacity(count);
    let mut index = vec![0usize; rank];
    for _ in 0..count {
        let offset: usize = (0..rank).map(|i| index[i] * in_strides[perm[i]]).sum();
        out.push(data[offset]);
        for d in (0..rank).rev() {
            index[d] += 1;
            if index[d] < out_shape[d] {
                break;
            }
            index[d] = 0;
        }
    }
    (out_shape, out)
}

/// Normalize a possibly negative axis against `rank`
pub fn normalize_axis(axis: i64, rank: usize) -> Result<usize> {
    let rank_i = rank as i64;
    let resolved = if axis < 0 { axis + rank_i } else { axis };
    if (0..rank_i).contains(&resolved) {
        Ok(resolved as usize)
    } else {
        Err(eval_error(format!("axis {axis} out of range for rank {rank}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tensor::{float_tensor, structure_only};

    #[test]
    fn test_broadcast_shapes() {
        assert_eq!(broadcast_shape(&[2, 3, 4], &[4]).unwrap(), vec![2, 3, 4]);
        assert_eq!(broadcast_shape(&[2, 1, 1, 4], &[2, 3, 4, 4]).unwrap(), vec![2, 3, 4, 4]);
        assert!(broadcast_shape(&[2, 3], &[4]).is_err());
    }

    #[test]
    fn test_broadcast_binary_rows() {
        let (shape, out) = broadcast_binary(&[1.0, 2.0, 3.0, 4.0], &[2, 2], &[10.0, 20.0], &[2], |a, b| a + b).unwrap();
        assert_eq!(shape, vec![2, 2]);
        assert_eq!(out, vec![11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn test_permute() {
        // [[1, 2, 3], [4, 5, 6]] transposed
        let (shape, out) = permute(&[1, 2, 3, 4, 5, 6], &[2, 3], &[1, 0]);
        assert_eq!(shape, vec![3, 2]);
        assert_eq!(out, vec![1, 4, 2, 5, 3, 6]);
    }

    #[test]
    fn test_from_proto() {
        let t = Tensor::from_proto(&float_tensor("w", &[2], &[0.5, 1.5])).unwrap();
        assert_eq!(t.as_f32().unwrap(), &[0.5, 1.5]);
        assert!(Tensor::from_proto(&structure_only("w", &[2], DataType::Float)).is_err());
    }
}
