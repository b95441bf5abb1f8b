// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::moments::{MovingMoments, DEFAULT_DECAY};
use super::regularizer::{weight_decay_penalty, WEIGHT_DECAY};
use crate::context::{ForwardContext, LossKind};
use crate::module::{Module, Parameter};
use dc_tensor::{PureResult, Tensor, TensorError};

/// Variance stabiliser used by [`BatchNorm2d`].
pub const BATCH_NORM_EPSILON: f32 = 1e-3;

/// Per-channel batch normalisation over NHWC feature maps.
///
/// Statistics come from [`MovingMoments`]: batch moments while training,
/// frozen averages during inference. Gamma and beta are always weight-decay
/// regularised.
#[derive(Debug)]
pub struct BatchNorm2d {
    name: String,
    channels: usize,
    epsilon: f32,
    weight_decay: f32,
    gamma: Parameter,
    beta: Parameter,
    moments: MovingMoments,
}

impl BatchNorm2d {
    pub fn new(name: impl Into<String>, channels: usize) -> PureResult<Self> {
        if channels == 0 {
            return Err(TensorError::InvalidDimensions {
                shape: vec![channels],
            });
        }
        let name = name.into();
        let gamma = Parameter::new(format!("{name}/bn/gamma"), Tensor::full(&[channels], 1.0)?);
        let beta = Parameter::new(format!("{name}/bn/beta"), Tensor::zeros(&[channels])?);
        Ok(Self {
            name,
            channels,
            epsilon: BATCH_NORM_EPSILON,
            weight_decay: WEIGHT_DECAY,
            gamma,
            beta,
            moments: MovingMoments::new(channels, DEFAULT_DECAY)?,
        })
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> PureResult<Self> {
        if epsilon <= 0.0 || !epsilon.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "batch_norm_epsilon",
                value: epsilon,
            });
        }
        self.epsilon = epsilon;
        Ok(self)
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn gamma(&self) -> &Parameter {
        &self.gamma
    }

    pub fn beta(&self) -> &Parameter {
        &self.beta
    }

    /// Moving statistics backing the inference path.
    pub fn moments(&self) -> &MovingMoments {
        &self.moments
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, input: &Tensor, ctx: &mut ForwardContext) -> PureResult<Tensor> {
        let (mean, variance) = self.moments.forward(input, ctx.mode())?;
        for param in [&self.gamma, &self.beta] {
            ctx.losses_mut().push(
                param.name(),
                LossKind::WeightDecay,
                weight_decay_penalty(param.value(), self.weight_decay),
            );
        }
        let gamma = self.gamma.value().data();
        let beta = self.beta.value().data();
        let inv_std: Vec<f32> = variance
            .iter()
            .map(|v| 1.0 / (v + self.epsilon).sqrt())
            .collect();
        Ok(input.map_per_channel(|value, c| (value - mean[c]) * inv_std[c] * gamma[c] + beta[c]))
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.gamma)?;
        visitor(&self.beta)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.gamma)?;
        visitor(&mut self.beta)
    }
}
