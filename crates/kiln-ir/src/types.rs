//! Tensor types and compiled-kernel handles.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a tensor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F16,
    F32,
    I32,
    I64,
    Bool,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::Bool => "bool",
        };
        f.write_str(s)
    }
}

/// Static type of a Value: element type plus declared dimensions.
///
/// A dimension of `-1` is dynamic; symbolic extents live in the shape
/// analysis, not in the type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorType {
    pub dtype: DType,
    pub dims: Vec<i64>,
}

impl TensorType {
    pub fn new(dtype: DType, dims: Vec<i64>) -> Self {
        Self { dtype, dims }
    }

    /// Shorthand for an f32 tensor type.
    pub fn f32(dims: &[i64]) -> Self {
        Self::new(DType::F32, dims.to_vec())
    }

    /// Shorthand for an i64 tensor type (shape operands).
    pub fn i64(dims: &[i64]) -> Self {
        Self::new(DType::I64, dims.to_vec())
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
        write!(f, "{}[{}]", self.dtype, dims.join("x"))
    }
}

/// Opaque reference to one compiled kernel.
///
/// Produced by a kernel-compiler backend and attached to a kernel-call
/// operation. `artifact` indexes the artifact store of the pass invocation
/// that compiled it; `result_types` is the kernel's ordered result signature
/// and must match the output values of the group it was compiled from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelHandle {
    pub symbol: String,
    pub artifact: u64,
    pub result_types: Vec<TensorType>,
}

impl KernelHandle {
    pub fn new(symbol: impl Into<String>, artifact: u64, result_types: Vec<TensorType>) -> Self {
        Self {
            symbol: symbol.into(),
            artifact,
            result_types,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_type_display() {
        assert_eq!(TensorType::f32(&[2, 4]).to_string(), "f32[2x4]");
        assert_eq!(TensorType::i64(&[3]).to_string(), "i64[3]");
        assert_eq!(TensorType::new(DType::Bool, vec![]).to_string(), "bool[]");
    }

    #[test]
    fn test_dynamic_dims() {
        let ty = TensorType::f32(&[-1, 8]);
        assert_eq!(ty.rank(), 2);
        assert_eq!(ty.dims[0], -1);
    }
}
