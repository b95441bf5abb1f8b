// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Neural building blocks for normalized-convolution residual networks.
//!
//! Layers implement [`Module`] and receive a [`ForwardContext`] that carries
//! the evaluation [`Mode`], the auxiliary loss accumulator, and the
//! normalized-weight sink. Nothing here keeps process-wide state: everything a
//! forward pass produces besides its output tensor is written into the context
//! the caller owns.

pub mod context;
pub mod layers;
pub mod module;

pub use context::{
    AuxiliaryLoss, AuxiliaryLosses, ForwardContext, LossKind, Mode, NormalizedWeights,
};
pub use layers::conv::{ConvOptions, NormConv2d};
pub use layers::moments::{ExponentialMovingAverage, MovingMean, MovingMoments};
pub use layers::normalization::BatchNorm2d;
pub use layers::regularizer::{orthogonal_penalty, weight_decay_penalty};
pub use layers::residual::ResidualUnit;
pub use module::{Module, Parameter};

pub use dc_tensor::{ops, Padding, PureResult, Tensor, TensorError};
