// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::conv::{ConvOptions, NormConv2d};
use crate::context::ForwardContext;
use crate::module::{Module, Parameter};
use dc_tensor::{Padding, PureResult, Tensor};

/// `relu(second(first(x)) + shortcut(x))`.
///
/// `first` carries the unit stride and a ReLU; `second` runs at stride 1
/// without one. The shortcut is the identity when the channel count is
/// unchanged and a plain, regularised 1×1 projection otherwise.
#[derive(Debug)]
pub struct ResidualUnit {
    name: String,
    first: NormConv2d,
    second: NormConv2d,
    shortcut: Option<NormConv2d>,
}

impl ResidualUnit {
    /// `options` supplies `normalize`, `regularize` and `orthogonal` for both
    /// branch convolutions; batch norm and ReLU are fixed by the unit.
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        options: ConvOptions,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let name = name.into();
        let branch = options.with_batch_norm(false);
        let first = NormConv2d::new(
            format!("{name}/first"),
            in_channels,
            out_channels,
            kernel,
            stride,
            Padding::Same,
            branch.with_relu(true),
            seed,
        )?;
        let second = NormConv2d::new(
            format!("{name}/second"),
            out_channels,
            out_channels,
            kernel,
            1,
            Padding::Same,
            branch.with_relu(false),
            seed,
        )?;
        let shortcut = if in_channels == out_channels {
            None
        } else {
            let projection = ConvOptions {
                normalize: false,
                batch_norm: false,
                relu: false,
                regularize: true,
                orthogonal: false,
            };
            Some(NormConv2d::new(
                format!("{name}/shortcut"),
                in_channels,
                out_channels,
                1,
                stride,
                Padding::Same,
                projection,
                seed,
            )?)
        };
        Ok(Self {
            name,
            first,
            second,
            shortcut,
        })
    }

    /// Applies `weight_decay` to every regularised convolution in the unit.
    pub fn with_weight_decay(self, weight_decay: f32) -> Self {
        Self {
            first: self.first.with_weight_decay(weight_decay),
            second: self.second.with_weight_decay(weight_decay),
            shortcut: self.shortcut.map(|conv| conv.with_weight_decay(weight_decay)),
            ..self
        }
    }

    pub fn with_orthogonal_scale(self, scale: f32) -> Self {
        Self {
            first: self.first.with_orthogonal_scale(scale),
            second: self.second.with_orthogonal_scale(scale),
            ..self
        }
    }

    pub fn with_epsilon(self, epsilon: f32) -> PureResult<Self> {
        Ok(Self {
            first: self.first.with_epsilon(epsilon)?,
            second: self.second.with_epsilon(epsilon)?,
            ..self
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn first(&self) -> &NormConv2d {
        &self.first
    }

    pub fn second(&self) -> &NormConv2d {
        &self.second
    }

    pub fn shortcut(&self) -> Option<&NormConv2d> {
        self.shortcut.as_ref()
    }

    /// True when the shortcut is a 1×1 projection instead of the identity.
    pub fn has_projection(&self) -> bool {
        self.shortcut.is_some()
    }

    pub fn out_channels(&self) -> usize {
        self.second.out_channels()
    }

    pub fn output_hw(&self, input_hw: (usize, usize)) -> PureResult<(usize, usize)> {
        self.first.output_hw(input_hw)
    }

    /// The shortcut path on its own.
    pub fn shortcut_forward(&self, input: &Tensor, ctx: &mut ForwardContext) -> PureResult<Tensor> {
        match &self.shortcut {
            Some(projection) => projection.forward(input, ctx),
            None => Ok(input.clone()),
        }
    }
}

impl Module for ResidualUnit {
    fn forward(&self, input: &Tensor, ctx: &mut ForwardContext) -> PureResult<Tensor> {
        let residual = self.first.forward(input, ctx)?;
        let residual = self.second.forward(&residual, ctx)?;
        let shortcut = self.shortcut_forward(input, ctx)?;
        let mut output = residual.add(&shortcut)?;
        output.relu_inplace();
        Ok(output)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.first.visit_parameters(visitor)?;
        self.second.visit_parameters(visitor)?;
        if let Some(projection) = &self.shortcut {
            projection.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.first.visit_parameters_mut(visitor)?;
        self.second.visit_parameters_mut(visitor)?;
        if let Some(projection) = &mut self.shortcut {
            projection.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LossKind;

    fn unit_options() -> ConvOptions {
        ConvOptions::default().with_orthogonal(true)
    }

    #[test]
    fn identity_shortcut_has_no_parameters() {
        let unit = ResidualUnit::new("block1_unit0", 4, 4, 3, 1, unit_options(), Some(1)).unwrap();
        assert!(!unit.has_projection());
        assert_eq!(unit.parameter_count().unwrap(), 2 * 3 * 3 * 4 * 4);
        let input = Tensor::random_normal(&[2, 4, 4, 4], 0.0, 1.0, Some(2)).unwrap();
        let mut ctx = ForwardContext::training();
        assert_eq!(unit.shortcut_forward(&input, &mut ctx).unwrap(), input);
        assert!(ctx.losses().is_empty());
    }

    #[test]
    fn projection_is_a_single_strided_1x1() {
        let unit = ResidualUnit::new("block2_unit0", 4, 8, 3, 2, unit_options(), Some(1)).unwrap();
        assert!(unit.has_projection());
        let projection = unit.shortcut().unwrap();
        assert_eq!(projection.kernel(), 1);
        assert_eq!(projection.stride(), 2);
        assert_eq!(projection.filter().name(), "block2_unit0/shortcut/filter");
        assert_eq!(projection.filter().value().shape(), &[1, 1, 4, 8]);
        let options = projection.options();
        assert!(!options.normalize && options.regularize && !options.orthogonal && !options.relu);

        let state = unit.state_dict().unwrap();
        let mut names: Vec<_> = state.keys().cloned().collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "block2_unit0/first/filter",
                "block2_unit0/second/filter",
                "block2_unit0/shortcut/filter",
            ]
        );
    }

    #[test]
    fn forward_downsamples_and_collects_terms() {
        let unit = ResidualUnit::new("block2_unit0", 4, 8, 3, 2, unit_options(), Some(3)).unwrap();
        let input = Tensor::random_normal(&[2, 6, 6, 4], 0.0, 1.0, Some(4)).unwrap();
        let mut ctx = ForwardContext::training();
        let out = unit.forward(&input, &mut ctx).unwrap();
        assert_eq!(out.shape(), &[2, 3, 3, 8]);
        assert!(out.data().iter().all(|v| *v >= 0.0));
        assert_eq!(ctx.losses().of_kind(LossKind::Orthogonal).count(), 2);
        let decay: Vec<_> = ctx.losses().of_kind(LossKind::WeightDecay).collect();
        assert_eq!(decay.len(), 1);
        assert_eq!(decay[0].name, "block2_unit0/shortcut/filter");
        assert_eq!(ctx.normalized_weights().len(), 2);
        assert_eq!(unit.output_hw((6, 6)).unwrap(), (3, 3));
    }

    #[test]
    fn branch_options_ignore_batch_norm_and_relu() {
        let options = ConvOptions::default().with_batch_norm(true).with_relu(true);
        let unit = ResidualUnit::new("u", 2, 2, 3, 1, options, None).unwrap();
        assert!(unit.first().batch_norm().is_none());
        assert!(unit.first().options().relu);
        assert!(!unit.second().options().relu);
    }
}
