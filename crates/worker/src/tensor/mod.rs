//! Tensor storage for backend weights
//!
//! Weights are read from memory-mapped safetensors files and converted once to
//! owned `f32` tensors; the forward pass only works on those.

pub mod ops;
pub mod safetensors;

pub use ops::{matvec, softmax_in_place};
pub use safetensors::{SafeTensorBuffer, SafeTensorView, TensorDType};

use skinscan_common::{Result, ServiceError};
use std::fmt;

/// Tensor shape
pub type Shape = Vec<usize>;

/// Owned row-major tensor
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    pub data: Vec<T>,
    pub shape: Shape,
}

impl<T> Tensor<T>
where
    T: Copy,
{
    /// Create a tensor, checking that the data fills the shape
    pub fn new(data: Vec<T>, shape: Shape) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(ServiceError::tensor(format!(
                "Shape {:?} needs {} values, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { data, shape })
    }

    /// Get the total number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the tensor is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the number of dimensions
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Row `i` of a 2D tensor
    pub fn row(&self, i: usize) -> &[T] {
        let cols = self.shape.get(1).copied().unwrap_or(self.data.len());
        &self.data[i * cols..(i + 1) * cols]
    }
}

impl<T> fmt::Display for Tensor<T>
where
    T: Copy,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape={:?}, size={})", self.shape, self.data.len())
    }
}
