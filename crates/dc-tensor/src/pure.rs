// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Dense tensor storage, constructors, and element-wise arithmetic.

use core::fmt;
use dc_config::determinism;
use rand::distributions::Distribution;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use std::error::Error;

/// Result alias used throughout the tensor engine.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors emitted by tensor constructors and operators.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorError {
    /// A constructor received an empty shape or a zero-sized axis.
    InvalidDimensions { shape: Vec<usize> },
    /// Data provided to a constructor does not match the tensor shape.
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    ShapeMismatch { left: Vec<usize>, right: Vec<usize> },
    /// An operator requires a specific rank.
    RankMismatch { expected: usize, got: usize },
    /// Computation received an empty input which would otherwise trigger a panic.
    EmptyInput(&'static str),
    /// Generic configuration violation.
    InvalidValue { label: &'static str },
    /// Numeric guard detected a non-finite value.
    NonFiniteValue { label: &'static str, value: f32 },
    /// Attempted to load or update a parameter that was missing from the state dict.
    MissingParameter { name: String },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorError::InvalidDimensions { shape } => {
                write!(f, "invalid tensor dimensions {shape:?}; every axis must be non-zero")
            }
            TensorError::DataLength { expected, got } => {
                write!(f, "data length mismatch: expected {expected}, got {got}")
            }
            TensorError::ShapeMismatch { left, right } => {
                write!(
                    f,
                    "shape mismatch: left={:?}, right={:?} cannot be combined",
                    left, right
                )
            }
            TensorError::RankMismatch { expected, got } => {
                write!(f, "rank mismatch: expected rank {expected}, got rank {got}")
            }
            TensorError::EmptyInput(label) => {
                write!(f, "{label} must not be empty for this computation")
            }
            TensorError::InvalidValue { label } => {
                write!(f, "invalid value: {label}")
            }
            TensorError::NonFiniteValue { label, value } => {
                write!(f, "non-finite value detected for {label}: {value}")
            }
            TensorError::MissingParameter { name } => {
                write!(f, "missing parameter '{name}' while loading module state")
            }
        }
    }
}

impl Error for TensorError {}

/// Dense row-major `f32` tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

fn volume(shape: &[usize]) -> PureResult<usize> {
    if shape.is_empty() || shape.contains(&0) {
        return Err(TensorError::InvalidDimensions {
            shape: shape.to_vec(),
        });
    }
    Ok(shape.iter().product())
}

impl Tensor {
    /// Create a tensor filled with zeros.
    pub fn zeros(shape: &[usize]) -> PureResult<Self> {
        Self::full(shape, 0.0)
    }

    /// Create a tensor where every element equals `value`.
    pub fn full(shape: &[usize], value: f32) -> PureResult<Self> {
        let len = volume(shape)?;
        Ok(Self {
            shape: shape.to_vec(),
            data: vec![value; len],
        })
    }

    /// Create a tensor from raw row-major data.
    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> PureResult<Self> {
        let expected = volume(shape)?;
        if expected != data.len() {
            return Err(TensorError::DataLength {
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    /// Construct a tensor by applying a generator to each flat index.
    pub fn from_fn<F>(shape: &[usize], f: F) -> PureResult<Self>
    where
        F: FnMut(usize) -> f32,
    {
        let len = volume(shape)?;
        Ok(Self {
            shape: shape.to_vec(),
            data: (0..len).map(f).collect(),
        })
    }

    /// Construct a tensor by sampling a normal distribution.
    ///
    /// When `seed` is provided the RNG is deterministic; otherwise the
    /// process-wide determinism policy decides.
    pub fn random_normal(
        shape: &[usize],
        mean: f32,
        std: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let len = volume(shape)?;
        if !(std > 0.0) || !std.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "random_normal_std",
            });
        }
        let mut rng = determinism::rng_from_optional(seed, "dc-tensor/tensor/normal");
        let data = (0..len)
            .map(|_| {
                let sample: f64 = StandardNormal.sample(&mut rng);
                mean + std * sample as f32
            })
            .collect();
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    /// Square identity matrix of shape `[n, n]`.
    pub fn eye(n: usize) -> PureResult<Self> {
        let mut eye = Self::zeros(&[n, n])?;
        for i in 0..n {
            eye.data[i * n + i] = 1.0;
        }
        Ok(eye)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Tensors always hold at least one element.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Size of the trailing (channel) axis.
    pub fn last_dim(&self) -> usize {
        self.shape[self.shape.len() - 1]
    }

    /// Returns the four axes of a rank-4 tensor.
    pub fn dims4(&self) -> PureResult<[usize; 4]> {
        match self.shape.as_slice() {
            &[a, b, c, d] => Ok([a, b, c, d]),
            other => Err(TensorError::RankMismatch {
                expected: 4,
                got: other.len(),
            }),
        }
    }

    /// Returns the two axes of a matrix.
    pub fn dims2(&self) -> PureResult<[usize; 2]> {
        match self.shape.as_slice() {
            &[rows, cols] => Ok([rows, cols]),
            other => Err(TensorError::RankMismatch {
                expected: 2,
                got: other.len(),
            }),
        }
    }

    /// Returns a copy with a new shape holding the same number of elements.
    pub fn reshape(&self, shape: &[usize]) -> PureResult<Tensor> {
        let expected = volume(shape)?;
        if expected != self.len() {
            return Err(TensorError::DataLength {
                expected,
                got: self.len(),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            data: self.data.clone(),
        })
    }

    /// Applies `f` element-wise.
    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32,
    {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    fn zip_with<F>(&self, other: &Tensor, f: F) -> PureResult<Tensor>
    where
        F: Fn(f32, f32) -> f32,
    {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                left: self.shape.clone(),
                right: other.shape.clone(),
            });
        }
        Ok(Self {
            shape: self.shape.clone(),
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(&a, &b)| f(a, b))
                .collect(),
        })
    }

    /// Element-wise addition.
    pub fn add(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_with(other, |a, b| a + b)
    }

    /// Element-wise subtraction.
    pub fn sub(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_with(other, |a, b| a - b)
    }

    /// Apply the ReLU activation in-place.
    pub fn relu_inplace(&mut self) {
        for value in self.data.iter_mut() {
            if *value < 0.0 {
                *value = 0.0;
            }
        }
    }

    /// Sum of squared elements.
    pub fn squared_l2_norm(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum()
    }

    /// Sum of all elements.
    pub fn sum(&self) -> f32 {
        self.data.iter().sum()
    }

    /// Sums `value²` over every axis except the last, one entry per trailing
    /// index. For a filter this is the squared norm of each output filter.
    pub fn sum_squares_per_channel(&self) -> Vec<f32> {
        let channels = self.last_dim();
        let mut sums = vec![0.0f32; channels];
        for row in self.data.chunks_exact(channels) {
            for (acc, value) in sums.iter_mut().zip(row.iter()) {
                *acc += value * value;
            }
        }
        sums
    }

    /// Applies `f(value, channel)` where `channel` indexes the trailing axis.
    pub fn map_per_channel<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32, usize) -> f32,
    {
        let channels = self.last_dim();
        let mut data = Vec::with_capacity(self.len());
        for row in self.data.chunks_exact(channels) {
            for (channel, &value) in row.iter().enumerate() {
                data.push(f(value, channel));
            }
        }
        Self {
            shape: self.shape.clone(),
            data,
        }
    }

    /// Divides every trailing-axis slot by the matching entry of `divisors`.
    pub fn div_per_channel(&self, divisors: &[f32]) -> PureResult<Tensor> {
        if divisors.len() != self.last_dim() {
            return Err(TensorError::DataLength {
                expected: self.last_dim(),
                got: divisors.len(),
            });
        }
        Ok(self.map_per_channel(|value, channel| value / divisors[channel]))
    }

    fn zip_broadcast_channel<F>(&self, map: &Tensor, f: F) -> PureResult<Tensor>
    where
        F: Fn(f32, f32) -> f32,
    {
        let rank = self.rank();
        let compatible = map.rank() == rank
            && map.last_dim() == 1
            && map.shape[..rank - 1] == self.shape[..rank - 1];
        if !compatible {
            return Err(TensorError::ShapeMismatch {
                left: self.shape.clone(),
                right: map.shape.clone(),
            });
        }
        let channels = self.last_dim();
        let mut data = Vec::with_capacity(self.len());
        for (row, &scalar) in self.data.chunks_exact(channels).zip(map.data.iter()) {
            data.extend(row.iter().map(|&value| f(value, scalar)));
        }
        Ok(Self {
            shape: self.shape.clone(),
            data,
        })
    }

    /// Multiplies by a single-channel map broadcast over the trailing axis
    /// (`[.., 1]` against `[.., c]`).
    pub fn mul_broadcast_channel(&self, map: &Tensor) -> PureResult<Tensor> {
        self.zip_broadcast_channel(map, |value, scalar| value * scalar)
    }

    /// Divides by a single-channel map broadcast over the trailing axis.
    pub fn div_broadcast_channel(&self, map: &Tensor) -> PureResult<Tensor> {
        self.zip_broadcast_channel(map, |value, scalar| value / scalar)
    }

    /// Returns the transpose of a matrix.
    pub fn transpose(&self) -> PureResult<Tensor> {
        let [rows, cols] = self.dims2()?;
        let mut data = vec![0.0f32; self.len()];
        for r in 0..rows {
            for c in 0..cols {
                data[c * rows + r] = self.data[r * cols + c];
            }
        }
        Tensor::from_vec(&[cols, rows], data)
    }

    /// Matrix product of `[m, k]` and `[k, n]`.
    pub fn matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        let [rows, inner] = self.dims2()?;
        let [other_inner, cols] = other.dims2()?;
        if inner != other_inner {
            return Err(TensorError::ShapeMismatch {
                left: self.shape.clone(),
                right: other.shape.clone(),
            });
        }
        let mut data = vec![0.0f32; rows * cols];
        gemm_rows(&self.data, &other.data, &mut data, inner, cols);
        Tensor::from_vec(&[rows, cols], data)
    }
}

/// Row-parallel `dst[m, n] += lhs[m, k] · rhs[k, n]`.
pub(crate) fn gemm_rows(lhs: &[f32], rhs: &[f32], dst: &mut [f32], inner: usize, cols: usize) {
    dst.par_chunks_mut(cols)
        .zip(lhs.par_chunks(inner))
        .for_each(|(dst_row, lhs_row)| {
            for (k, &a) in lhs_row.iter().enumerate() {
                if a == 0.0 {
                    continue;
                }
                let rhs_row = &rhs[k * cols..(k + 1) * cols];
                for (out, &b) in dst_row.iter_mut().zip(rhs_row.iter()) {
                    *out += a * b;
                }
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_reject_zero_axes() {
        assert!(matches!(
            Tensor::zeros(&[2, 0, 3]),
            Err(TensorError::InvalidDimensions { .. })
        ));
        assert!(matches!(
            Tensor::from_vec(&[2, 2], vec![1.0; 3]),
            Err(TensorError::DataLength {
                expected: 4,
                got: 3
            })
        ));
    }

    #[test]
    fn random_normal_is_seeded() {
        let a = Tensor::random_normal(&[3, 3, 2, 4], 0.0, 0.5, Some(11)).unwrap();
        let b = Tensor::random_normal(&[3, 3, 2, 4], 0.0, 0.5, Some(11)).unwrap();
        let c = Tensor::random_normal(&[3, 3, 2, 4], 0.0, 0.5, Some(12)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(Tensor::random_normal(&[2], 0.0, 0.0, Some(1)).is_err());
    }

    #[test]
    fn matmul_and_transpose_agree_with_manual() {
        let a = Tensor::from_vec(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let gram = a.transpose().unwrap().matmul(&a).unwrap();
        assert_eq!(gram.shape(), &[3, 3]);
        assert_eq!(
            gram.data(),
            &[17.0, 22.0, 27.0, 22.0, 29.0, 36.0, 27.0, 36.0, 45.0]
        );
        assert!(a.matmul(&a).is_err());
    }

    #[test]
    fn per_channel_helpers_follow_trailing_axis() {
        let filt = Tensor::from_vec(&[2, 1, 1, 2], vec![3.0, 1.0, 4.0, 2.0]).unwrap();
        assert_eq!(filt.sum_squares_per_channel(), vec![25.0, 5.0]);
        let scaled = filt.div_per_channel(&[5.0, 1.0]).unwrap();
        assert_eq!(scaled.data(), &[0.6, 1.0, 0.8, 2.0]);
        assert!(filt.div_per_channel(&[1.0]).is_err());
    }

    #[test]
    fn channel_broadcast_requires_singleton_channel() {
        let x = Tensor::from_vec(&[1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let map = Tensor::from_vec(&[1, 1, 2, 1], vec![2.0, 4.0]).unwrap();
        let out = x.div_broadcast_channel(&map).unwrap();
        assert_eq!(out.data(), &[0.5, 1.0, 0.75, 1.0]);
        let back = out.mul_broadcast_channel(&map).unwrap();
        assert_eq!(back, x);
        assert!(x.mul_broadcast_channel(&x).is_err());
    }

    #[test]
    fn eye_has_unit_diagonal() {
        let eye = Tensor::eye(3).unwrap();
        assert_eq!(eye.sum(), 3.0);
        assert_eq!(eye.data()[4], 1.0);
    }
}
