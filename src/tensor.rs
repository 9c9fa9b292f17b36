//! Dense tensors and tensor specs
//!
//! Tensors are row-major `f32` buffers. Specs fix shape and dtype at export
//! time; validation inputs are sampled against the same spec.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit float
    F32,
    /// 8-bit signed integer (quantized weights only)
    I8,
}

/// Shape and dtype contract of a tensor value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    shape: Vec<usize>,
    dtype: DType,
}

impl TensorSpec {
    /// Create an `f32` spec with the given shape.
    #[must_use]
    pub fn f32(shape: impl Into<Vec<usize>>) -> Self {
        Self {
            shape: shape.into(),
            dtype: DType::F32,
        }
    }

    /// Create a spec with an explicit dtype.
    #[must_use]
    pub fn new(shape: impl Into<Vec<usize>>, dtype: DType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
        }
    }

    /// Get the shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the dtype.
    #[must_use]
    pub const fn dtype(&self) -> DType {
        self.dtype
    }

    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Sample a standard-normal-ish tensor matching this spec.
    ///
    /// Uses Box-Muller over the supplied RNG so callers control seeding.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Tensor {
        let data = (0..self.numel())
            .map(|_| {
                let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
                let u2: f32 = rng.gen();
                (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
            })
            .collect();
        Tensor {
            shape: self.shape.clone(),
            data,
        }
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}{:?}", self.dtype, self.shape)
    }
}

/// Row-major `f32` tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Create a tensor from shape and data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `data.len()` does not match the shape.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<f32>) -> Result<Self> {
        let shape = shape.into();
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::InvalidInput(format!(
                "shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Tensor filled with zeros.
    #[must_use]
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        let n = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; n],
        }
    }

    /// Tensor filled with a deterministic ramp, handy for weights in tests
    /// and reference models.
    #[must_use]
    pub fn ramp(shape: impl Into<Vec<usize>>, scale: f32) -> Self {
        let shape = shape.into();
        let n: usize = shape.iter().product();
        #[allow(clippy::cast_precision_loss)]
        let data = (0..n)
            .map(|i| ((i % 17) as f32 - 8.0) * scale)
            .collect();
        Self { shape, data }
    }

    /// Get the shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the raw data.
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Consume into raw data.
    #[must_use]
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Spec describing this tensor.
    #[must_use]
    pub fn spec(&self) -> TensorSpec {
        TensorSpec::f32(self.shape.clone())
    }

    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }
}
