// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Moving-average batch statistics with explicit training/inference paths.

use crate::context::Mode;
use dc_tensor::{ops, PureResult, Tensor, TensorError};
use std::cell::RefCell;

/// Decay applied to the running statistics.
pub const DEFAULT_DECAY: f32 = 0.999;

/// Zero-initialised, zero-debiased exponential moving average over a vector.
///
/// After `t` updates the reported average is
/// `biased / (1 − decayᵗ)`, so the first update already reproduces the
/// observed value instead of a value shrunk towards zero.
#[derive(Clone, Debug, PartialEq)]
pub struct ExponentialMovingAverage {
    decay: f32,
    biased: Vec<f32>,
    steps: u64,
}

impl ExponentialMovingAverage {
    pub fn new(len: usize, decay: f32) -> PureResult<Self> {
        if len == 0 {
            return Err(TensorError::EmptyInput("moving_average"));
        }
        if !(0.0..1.0).contains(&decay) || !decay.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "moving_average_decay",
            });
        }
        Ok(Self {
            decay,
            biased: vec![0.0; len],
            steps: 0,
        })
    }

    pub fn decay(&self) -> f32 {
        self.decay
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn len(&self) -> usize {
        self.biased.len()
    }

    pub fn is_empty(&self) -> bool {
        self.biased.is_empty()
    }

    /// Folds `value` into the average.
    pub fn update(&mut self, value: &[f32]) -> PureResult<()> {
        if value.len() != self.biased.len() {
            return Err(TensorError::DataLength {
                expected: self.biased.len(),
                got: value.len(),
            });
        }
        for (slot, v) in self.biased.iter_mut().zip(value.iter()) {
            *slot = self.decay * *slot + (1.0 - self.decay) * v;
        }
        self.steps += 1;
        Ok(())
    }

    /// Debiased average; zeros before the first update.
    pub fn average(&self) -> Vec<f32> {
        if self.steps == 0 {
            return vec![0.0; self.biased.len()];
        }
        let exponent = i32::try_from(self.steps).unwrap_or(i32::MAX);
        let correction = 1.0 - self.decay.powi(exponent);
        if correction <= 0.0 {
            return self.biased.clone();
        }
        self.biased.iter().map(|v| v / correction).collect()
    }
}

fn guard_channels(input: &Tensor, channels: usize) -> PureResult<()> {
    let dims = input.dims4()?;
    if dims[3] != channels {
        return Err(TensorError::ShapeMismatch {
            left: dims.to_vec(),
            right: vec![dims[0], dims[1], dims[2], channels],
        });
    }
    Ok(())
}

/// Per-channel mean and variance over batch and spatial axes, tracked by a
/// single moving average.
#[derive(Debug)]
pub struct MovingMoments {
    channels: usize,
    mean: RefCell<ExponentialMovingAverage>,
    variance: RefCell<ExponentialMovingAverage>,
}

impl MovingMoments {
    pub fn new(channels: usize, decay: f32) -> PureResult<Self> {
        Ok(Self {
            channels,
            mean: RefCell::new(ExponentialMovingAverage::new(channels, decay)?),
            variance: RefCell::new(ExponentialMovingAverage::new(channels, decay)?),
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Number of training updates folded into the averages.
    pub fn steps(&self) -> u64 {
        self.mean.borrow().steps()
    }

    /// Current `(mean, variance)` averages.
    pub fn average(&self) -> (Vec<f32>, Vec<f32>) {
        (self.mean.borrow().average(), self.variance.borrow().average())
    }

    /// In [`Mode::Training`] returns the batch moments of `input` and folds
    /// them into the averages; in [`Mode::Inference`] returns the frozen
    /// averages and leaves them untouched.
    pub fn forward(&self, input: &Tensor, mode: Mode) -> PureResult<(Vec<f32>, Vec<f32>)> {
        guard_channels(input, self.channels)?;
        match mode {
            Mode::Training => {
                let (mean, variance) = ops::channel_moments(input)?;
                self.mean.borrow_mut().update(&mean)?;
                self.variance.borrow_mut().update(&variance)?;
                Ok((mean, variance))
            }
            Mode::Inference => Ok(self.average()),
        }
    }
}

/// Mean-only variant of [`MovingMoments`].
#[derive(Debug)]
pub struct MovingMean {
    channels: usize,
    mean: RefCell<ExponentialMovingAverage>,
}

impl MovingMean {
    pub fn new(channels: usize, decay: f32) -> PureResult<Self> {
        Ok(Self {
            channels,
            mean: RefCell::new(ExponentialMovingAverage::new(channels, decay)?),
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn steps(&self) -> u64 {
        self.mean.borrow().steps()
    }

    pub fn average(&self) -> Vec<f32> {
        self.mean.borrow().average()
    }

    pub fn forward(&self, input: &Tensor, mode: Mode) -> PureResult<Vec<f32>> {
        guard_channels(input, self.channels)?;
        match mode {
            Mode::Training => {
                let mean = ops::channel_mean(input)?;
                self.mean.borrow_mut().update(&mean)?;
                Ok(mean)
            }
            Mode::Inference => Ok(self.average()),
        }
    }
}
