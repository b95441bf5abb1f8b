// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Normalized convolution.
//!
//! With `normalize` on, each output filter is scaled to unit norm and the
//! response at every position is divided by the norm of the input window it
//! covers, giving a cosine `r ∈ [-1, 1]`. The layer then emits `r·|r|·‖x‖`:
//! a square-law cosine rescaled by the input window norm.

use super::normalization::BatchNorm2d;
use super::regularizer::{
    normalize_filter, orthogonal_penalty, weight_decay_penalty, NORM_EPSILON, ORTHOGONAL_SCALE,
    WEIGHT_DECAY,
};
use crate::context::{ForwardContext, LossKind};
use crate::module::{Module, Parameter};
use dc_config::determinism;
use dc_tensor::{ops, Padding, PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};

fn validate_positive(value: usize) -> PureResult<()> {
    if value == 0 {
        return Err(TensorError::InvalidDimensions { shape: vec![value] });
    }
    Ok(())
}

/// Per-layer switches of [`NormConv2d`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvOptions {
    /// Cosine-normalise the response.
    pub normalize: bool,
    /// Apply [`BatchNorm2d`] after the convolution.
    pub batch_norm: bool,
    pub relu: bool,
    /// Push a weight-decay term for the filter.
    pub regularize: bool,
    /// Push an orthogonality term for the filter.
    pub orthogonal: bool,
}

impl Default for ConvOptions {
    fn default() -> Self {
        Self {
            normalize: true,
            batch_norm: false,
            relu: false,
            regularize: false,
            orthogonal: false,
        }
    }
}

impl ConvOptions {
    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn with_batch_norm(mut self, batch_norm: bool) -> Self {
        self.batch_norm = batch_norm;
        self
    }

    pub fn with_relu(mut self, relu: bool) -> Self {
        self.relu = relu;
        self
    }

    pub fn with_regularize(mut self, regularize: bool) -> Self {
        self.regularize = regularize;
        self
    }

    pub fn with_orthogonal(mut self, orthogonal: bool) -> Self {
        self.orthogonal = orthogonal;
        self
    }
}

/// `sign(0)` is zero so a zero response stays zero.
fn sign(value: f32) -> f32 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        value
    }
}

/// Turns a raw response into `r·|r|·n` where `r = response / n` and `n` is
/// the `[.., 1]` input-norm map broadcast over the channels.
///
/// Evaluated as divide, `r *= sign(r)·r`, multiply, in that order.
pub fn square_law_rescale(response: &Tensor, input_norm: &Tensor) -> PureResult<Tensor> {
    let cosine = response.div_broadcast_channel(input_norm)?;
    let squared = cosine.map(|r| r * (sign(r) * r));
    squared.mul_broadcast_channel(input_norm)
}

/// Square 2-D normalized convolution over NHWC inputs.
#[derive(Debug)]
pub struct NormConv2d {
    name: String,
    filter: Parameter,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: Padding,
    options: ConvOptions,
    epsilon: f32,
    weight_decay: f32,
    orthogonal_scale: f32,
    batch_norm: Option<BatchNorm2d>,
}

impl NormConv2d {
    /// Allocates a `[kernel, kernel, in_channels, out_channels]` filter drawn
    /// from `N(0, 2 / (kernel²·in_channels))`.
    ///
    /// `seed` is mixed with the layer name so layers sharing a network seed
    /// still draw distinct filters.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: Padding,
        options: ConvOptions,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        validate_positive(in_channels)?;
        validate_positive(out_channels)?;
        validate_positive(kernel)?;
        if stride == 0 {
            return Err(TensorError::InvalidValue { label: "stride" });
        }
        let name = name.into();
        let filter_name = format!("{name}/filter");
        let shape = [kernel, kernel, in_channels, out_channels];
        let stddev = (2.0 / (kernel * kernel * in_channels) as f32).sqrt();
        let value = Tensor::random_normal(
            &shape,
            0.0,
            stddev,
            determinism::layer_seed(seed, &filter_name),
        )?;
        tracing::debug!(filter = %filter_name, shape = ?shape, "allocated filter");
        let batch_norm = if options.batch_norm {
            Some(BatchNorm2d::new(name.clone(), out_channels)?)
        } else {
            None
        };
        Ok(Self {
            name,
            filter: Parameter::new(filter_name, value),
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            options,
            epsilon: NORM_EPSILON,
            weight_decay: WEIGHT_DECAY,
            orthogonal_scale: ORTHOGONAL_SCALE,
            batch_norm,
        })
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        if let Some(bn) = self.batch_norm.take() {
            self.batch_norm = Some(bn.with_weight_decay(weight_decay));
        }
        self
    }

    pub fn with_orthogonal_scale(mut self, scale: f32) -> Self {
        self.orthogonal_scale = scale;
        self
    }

    /// Overrides the stabiliser used in the filter and input norms. Must be
    /// strictly positive so an all-zero window never divides by zero.
    pub fn with_epsilon(mut self, epsilon: f32) -> PureResult<Self> {
        if !epsilon.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "norm_epsilon",
                value: epsilon,
            });
        }
        if epsilon <= 0.0 {
            return Err(TensorError::InvalidValue {
                label: "norm_epsilon",
            });
        }
        self.epsilon = epsilon;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filter(&self) -> &Parameter {
        &self.filter
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn kernel(&self) -> usize {
        self.kernel
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }

    pub fn options(&self) -> ConvOptions {
        self.options
    }

    pub fn batch_norm(&self) -> Option<&BatchNorm2d> {
        self.batch_norm.as_ref()
    }

    /// Output spatial extent for an `(h, w)` input.
    pub fn output_hw(&self, input_hw: (usize, usize)) -> PureResult<(usize, usize)> {
        let (oh, _) = self.padding.resolve(input_hw.0, self.kernel, self.stride)?;
        let (ow, _) = self.padding.resolve(input_hw.1, self.kernel, self.stride)?;
        Ok((oh, ow))
    }

    /// `sqrt(window_energy(x) + epsilon)` with this layer's geometry.
    pub fn input_norm(&self, input: &Tensor) -> PureResult<Tensor> {
        let epsilon = self.epsilon;
        let energy = ops::window_energy(input, self.kernel, self.stride, self.padding)?;
        Ok(energy.map(|value| (value + epsilon).sqrt()))
    }
}

impl Module for NormConv2d {
    fn forward(&self, input: &Tensor, ctx: &mut ForwardContext) -> PureResult<Tensor> {
        let filter = self.filter.value();
        if self.options.orthogonal {
            let penalty = orthogonal_penalty(filter, self.orthogonal_scale, self.epsilon)?;
            ctx.losses_mut()
                .push(self.name.as_str(), LossKind::Orthogonal, penalty);
        }
        if self.options.regularize {
            ctx.losses_mut().push(
                self.filter.name(),
                LossKind::WeightDecay,
                weight_decay_penalty(filter, self.weight_decay),
            );
        }
        let mut output = if self.options.normalize {
            let unit = normalize_filter(filter, self.epsilon)?;
            let response = ops::conv2d(input, &unit, self.stride, self.padding)?;
            ctx.normalized_weights_mut().record(self.filter.name(), unit);
            square_law_rescale(&response, &self.input_norm(input)?)?
        } else {
            ops::conv2d(input, filter, self.stride, self.padding)?
        };
        if let Some(bn) = &self.batch_norm {
            output = bn.forward(&output, ctx)?;
        }
        if self.options.relu {
            output.relu_inplace();
        }
        Ok(output)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.filter)?;
        if let Some(bn) = &self.batch_norm {
            bn.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.filter)?;
        if let Some(bn) = &mut self.batch_norm {
            bn.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_tap(weight: f32, options: ConvOptions) -> NormConv2d {
        let mut conv =
            NormConv2d::new("tap", 1, 1, 1, 1, Padding::Same, options, Some(0)).unwrap();
        conv.visit_parameters_mut(&mut |param| {
            if param.name() != "tap/filter" {
                return Ok(());
            }
            param.load_value(&Tensor::from_vec(&[1, 1, 1, 1], vec![weight])?)
        })
        .unwrap();
        conv
    }

    #[test]
    fn filter_init_matches_requested_geometry() {
        let conv = NormConv2d::new(
            "root",
            3,
            16,
            3,
            1,
            Padding::Same,
            ConvOptions::default(),
            Some(7),
        )
        .unwrap();
        assert_eq!(conv.filter().name(), "root/filter");
        assert_eq!(conv.filter().value().shape(), &[3, 3, 3, 16]);
        assert_eq!(conv.parameter_count().unwrap(), 3 * 3 * 3 * 16);
        let again = NormConv2d::new(
            "root",
            3,
            16,
            3,
            1,
            Padding::Same,
            ConvOptions::default(),
            Some(7),
        )
        .unwrap();
        assert_eq!(conv.filter().value(), again.filter().value());
        let other = NormConv2d::new(
            "other",
            3,
            16,
            3,
            1,
            Padding::Same,
            ConvOptions::default(),
            Some(7),
        )
        .unwrap();
        assert_ne!(conv.filter().value(), other.filter().value());
    }

    #[test]
    fn rejects_zero_sizes() {
        let opts = ConvOptions::default();
        assert!(NormConv2d::new("a", 0, 4, 3, 1, Padding::Same, opts, None).is_err());
        assert!(NormConv2d::new("a", 4, 0, 3, 1, Padding::Same, opts, None).is_err());
        assert!(NormConv2d::new("a", 4, 4, 0, 1, Padding::Same, opts, None).is_err());
        assert!(NormConv2d::new("a", 4, 4, 3, 0, Padding::Same, opts, None).is_err());
    }

    #[test]
    fn epsilon_must_be_strictly_positive() {
        let conv = |eps: f32| single_tap(1.0, ConvOptions::default()).with_epsilon(eps);
        assert!(matches!(
            conv(0.0),
            Err(TensorError::InvalidValue {
                label: "norm_epsilon"
            })
        ));
        assert!(matches!(conv(-1e-4), Err(TensorError::InvalidValue { .. })));
        assert!(matches!(conv(f32::NAN), Err(TensorError::NonFiniteValue { .. })));

        let conv = conv(1e-6).unwrap();
        let zeros = Tensor::zeros(&[1, 2, 2, 1]).unwrap();
        let out = conv.forward(&zeros, &mut ForwardContext::inference()).unwrap();
        assert!(out.data().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn single_tap_response_is_square_law_cosine() {
        let conv = single_tap(2.0, ConvOptions::default());
        let input = Tensor::from_vec(&[1, 1, 3, 1], vec![3.0, -1.0, 0.0]).unwrap();
        let mut ctx = ForwardContext::inference();
        let out = conv.forward(&input, &mut ctx).unwrap();

        let unit = 2.0f64 / (4.0f64 + 1e-4).sqrt();
        for (x, got) in [3.0f64, -1.0].iter().zip(out.data()) {
            let norm = (x * x + 1e-4).sqrt();
            let r = x * unit / norm;
            let expected = r * r.abs() * norm;
            assert!((expected - *got as f64).abs() < 1e-5, "{expected} vs {got}");
        }
        assert!(out.data()[0] > 0.0);
        assert!(out.data()[1] < 0.0);
        assert_eq!(out.data()[2], 0.0);
        assert!(ctx.normalized_weights().contains("tap/filter"));
        assert!(ctx.losses().is_empty());
    }

    #[test]
    fn cosine_never_exceeds_input_norm() {
        let conv = NormConv2d::new(
            "bounded",
            2,
            4,
            3,
            1,
            Padding::Same,
            ConvOptions::default(),
            Some(11),
        )
        .unwrap();
        let input = Tensor::random_normal(&[2, 5, 5, 2], 0.0, 1.0, Some(5)).unwrap();
        let out = conv.forward(&input, &mut ForwardContext::training()).unwrap();
        let norm = conv.input_norm(&input).unwrap();
        for (row, n) in out.data().chunks_exact(4).zip(norm.data()) {
            for value in row {
                assert!(value.abs() <= n * (1.0 + 1e-4));
            }
        }
    }

    #[test]
    fn penalties_and_sink_follow_options() {
        let options = ConvOptions::default()
            .with_orthogonal(true)
            .with_regularize(true);
        let conv = NormConv2d::new(
            "block1_unit0/first",
            4,
            8,
            3,
            1,
            Padding::Same,
            options,
            Some(3),
        )
        .unwrap();
        let input = Tensor::random_normal(&[1, 4, 4, 4], 0.0, 1.0, Some(9)).unwrap();
        let mut ctx = ForwardContext::training();
        conv.forward(&input, &mut ctx).unwrap();

        let orth: Vec<_> = ctx.losses().of_kind(LossKind::Orthogonal).collect();
        assert_eq!(orth.len(), 1);
        assert_eq!(orth[0].name, "block1_unit0/first");
        assert!(orth[0].value >= 0.0);
        let decay: Vec<_> = ctx.losses().of_kind(LossKind::WeightDecay).collect();
        assert_eq!(decay.len(), 1);
        assert_eq!(decay[0].name, "block1_unit0/first/filter");
        let expected = WEIGHT_DECAY * 0.5 * conv.filter().value().squared_l2_norm();
        assert!((decay[0].value - expected).abs() < 1e-9);

        let unit = ctx.normalized_weights().get("block1_unit0/first/filter").unwrap();
        for sum in unit.sum_squares_per_channel() {
            assert!((sum - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn plain_path_matches_raw_convolution() {
        let options = ConvOptions::default().with_normalize(false);
        let conv = NormConv2d::new("score", 3, 5, 1, 1, Padding::Valid, options, Some(1)).unwrap();
        let input = Tensor::random_normal(&[2, 1, 1, 3], 0.0, 1.0, Some(2)).unwrap();
        let mut ctx = ForwardContext::inference();
        let out = conv.forward(&input, &mut ctx).unwrap();
        let expected = ops::conv2d(&input, conv.filter().value(), 1, Padding::Valid).unwrap();
        assert_eq!(out, expected);
        assert!(ctx.normalized_weights().is_empty());
    }

    #[test]
    fn relu_and_batch_norm_are_applied_in_order() {
        let plain = single_tap(1.0, ConvOptions::default().with_normalize(false));
        let input = Tensor::from_vec(&[1, 1, 2, 1], vec![1.0, -1.0]).unwrap();
        let raw = plain.forward(&input, &mut ForwardContext::training()).unwrap();
        assert_eq!(raw.data(), &[1.0, -1.0]);

        let rectified = single_tap(
            1.0,
            ConvOptions::default().with_normalize(false).with_relu(true),
        );
        let out = rectified.forward(&input, &mut ForwardContext::training()).unwrap();
        assert_eq!(out.data(), &[1.0, 0.0]);

        let normed = single_tap(
            1.0,
            ConvOptions::default()
                .with_normalize(false)
                .with_batch_norm(true)
                .with_relu(true),
        );
        assert_eq!(normed.parameter_count().unwrap(), 3);
        let mut ctx = ForwardContext::training();
        let out = normed
            .forward(&Tensor::from_vec(&[1, 1, 2, 1], vec![3.0, 5.0]).unwrap(), &mut ctx)
            .unwrap();
        // Whitened to (-1, 1) before the ReLU.
        assert_eq!(out.data()[0], 0.0);
        assert!(out.data()[1] > 0.99);
        assert_eq!(ctx.losses().of_kind(LossKind::WeightDecay).count(), 2);
        assert_eq!(normed.batch_norm().unwrap().moments().steps(), 1);
    }

    #[test]
    fn strided_same_output_extent() {
        let conv = NormConv2d::new(
            "down",
            2,
            3,
            3,
            2,
            Padding::Same,
            ConvOptions::default(),
            Some(4),
        )
        .unwrap();
        let input = Tensor::random_normal(&[2, 5, 5, 2], 0.0, 1.0, Some(8)).unwrap();
        let out = conv.forward(&input, &mut ForwardContext::inference()).unwrap();
        assert_eq!(out.shape(), &[2, 3, 3, 3]);
        assert_eq!(conv.output_hw((5, 5)).unwrap(), (3, 3));
    }
}
