// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use dc_config::{ConfigLayering, LayeredConfig, LayeredConfigError};
use dc_nn::{
    ops, AuxiliaryLosses, ConvOptions, ForwardContext, Mode, Module, NormConv2d,
    NormalizedWeights, Padding, Parameter, PureResult, ResidualUnit, Tensor, TensorError,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Key of the network section inside layered configuration files.
pub const DCNET_SECTION: &str = "dcnet";

/// Topology and hyper-parameters of a [`NormalizedResNet`].
///
/// The defaults describe the CIFAR network: a 96-channel root followed by
/// three stages of five units at 96, 192 and 384 channels, the last two
/// entered with stride 2.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DcNetConfig {
    pub input_channels: usize,
    pub input_hw: (usize, usize),
    pub kernel: usize,
    pub stage_channels: Vec<usize>,
    pub stage_strides: Vec<usize>,
    pub units_per_stage: usize,
    /// Pixels are mapped to `(x - pixel_center) / pixel_scale`.
    pub pixel_center: f32,
    pub pixel_scale: f32,
    pub weight_decay: f32,
    pub orthogonal_scale: f32,
    pub norm_epsilon: f32,
    pub seed: Option<u64>,
}

impl Default for DcNetConfig {
    fn default() -> Self {
        Self {
            input_channels: 3,
            input_hw: (32, 32),
            kernel: 3,
            stage_channels: vec![96, 192, 384],
            stage_strides: vec![1, 2, 2],
            units_per_stage: 5,
            pixel_center: 127.5,
            pixel_scale: 128.0,
            weight_decay: 5e-4,
            orthogonal_scale: 1e-5,
            norm_epsilon: 1e-4,
            seed: None,
        }
    }
}

fn validate_positive(value: usize, label: &'static str) -> PureResult<()> {
    if value == 0 {
        return Err(TensorError::InvalidValue { label });
    }
    Ok(())
}

fn validate_finite(value: f32, label: &'static str) -> PureResult<()> {
    if !value.is_finite() {
        return Err(TensorError::NonFiniteValue { label, value });
    }
    Ok(())
}

impl DcNetConfig {
    pub fn validate(&self) -> PureResult<()> {
        validate_positive(self.input_channels, "dcnet_input_channels")?;
        validate_positive(self.input_hw.0, "dcnet_input_height")?;
        validate_positive(self.input_hw.1, "dcnet_input_width")?;
        validate_positive(self.kernel, "dcnet_kernel")?;
        validate_positive(self.units_per_stage, "dcnet_units_per_stage")?;
        if self.stage_channels.is_empty() {
            return Err(TensorError::EmptyInput("dcnet_stage_channels"));
        }
        if self.stage_channels.len() != self.stage_strides.len() {
            return Err(TensorError::ShapeMismatch {
                left: self.stage_channels.clone(),
                right: self.stage_strides.clone(),
            });
        }
        for &channels in &self.stage_channels {
            validate_positive(channels, "dcnet_stage_channels")?;
        }
        for &stride in &self.stage_strides {
            validate_positive(stride, "dcnet_stage_strides")?;
        }
        validate_finite(self.pixel_center, "dcnet_pixel_center")?;
        validate_finite(self.pixel_scale, "dcnet_pixel_scale")?;
        if self.pixel_scale == 0.0 {
            return Err(TensorError::InvalidValue {
                label: "dcnet_pixel_scale",
            });
        }
        for (value, label) in [
            (self.weight_decay, "dcnet_weight_decay"),
            (self.orthogonal_scale, "dcnet_orthogonal_scale"),
        ] {
            validate_finite(value, label)?;
            if value < 0.0 {
                return Err(TensorError::InvalidValue { label });
            }
        }
        validate_finite(self.norm_epsilon, "dcnet_norm_epsilon")?;
        if self.norm_epsilon <= 0.0 {
            return Err(TensorError::InvalidValue {
                label: "dcnet_norm_epsilon",
            });
        }
        Ok(())
    }

    /// Reads the `[dcnet]` section of a merged configuration. Keys left out
    /// keep their defaults; a missing section yields [`DcNetConfig::default`].
    pub fn from_layered(layered: &LayeredConfig) -> Result<Self, ConfigError> {
        let config = layered
            .section::<Self>(&[DCNET_SECTION])?
            .unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    /// Loads a single TOML or JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let layered = LayeredConfig::load(ConfigLayering::default().with_base(path.as_ref()))?;
        Self::from_layered(&layered)
    }

    /// Loads the layers named by `DCNET_CONFIG_BASE` / `DCNET_CONFIG_RUN`.
    pub fn discover() -> Result<Self, ConfigError> {
        Self::from_layered(&LayeredConfig::load(ConfigLayering::discover())?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Layered(#[from] LayeredConfigError),
    #[error("invalid network configuration: {0}")]
    Invalid(#[from] TensorError),
}

/// Everything one forward pass produces.
#[derive(Clone, Debug)]
pub struct NetworkOutput {
    /// Class scores, `[batch, 1, 1, n_class]`.
    pub score: Tensor,
    /// Arg-max class per example.
    pub pred: Vec<usize>,
    pub losses: AuxiliaryLosses,
    /// Unit-norm filters used by the normalized convolutions, keyed by
    /// filter name.
    pub normalized_weights: NormalizedWeights,
}

impl NetworkOutput {
    /// Sum of every auxiliary loss term.
    pub fn auxiliary_loss(&self) -> f32 {
        self.losses.total()
    }
}

/// Configures and assembles a [`NormalizedResNet`].
#[derive(Clone, Debug)]
pub struct NormalizedResNetBuilder {
    config: DcNetConfig,
    n_class: usize,
    seed: Option<u64>,
}

impl NormalizedResNetBuilder {
    pub fn new(n_class: usize) -> Self {
        Self {
            config: DcNetConfig::default(),
            n_class,
            seed: None,
        }
    }

    pub fn with_config(mut self, config: DcNetConfig) -> Self {
        self.config = config;
        self
    }

    /// Seeds every filter; overrides `config.seed`.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn config(&self) -> &DcNetConfig {
        &self.config
    }

    pub fn build(self) -> PureResult<NormalizedResNet> {
        NormalizedResNet::new(self.config, self.n_class, self.seed)
    }
}

/// Root convolution, residual stages, global average pool and a 1×1 scoring
/// convolution.
#[derive(Debug)]
pub struct NormalizedResNet {
    config: DcNetConfig,
    n_class: usize,
    root: NormConv2d,
    units: Vec<ResidualUnit>,
    feature_hw: (usize, usize),
    score: NormConv2d,
}

impl NormalizedResNet {
    fn new(config: DcNetConfig, n_class: usize, seed: Option<u64>) -> PureResult<Self> {
        config.validate()?;
        validate_positive(n_class, "dcnet_n_class")?;
        let seed = seed.or(config.seed);
        let kernel = config.kernel;
        let root_channels = config.stage_channels[0];
        let normalized = ConvOptions::default().with_orthogonal(true);

        let root = NormConv2d::new(
            "root",
            config.input_channels,
            root_channels,
            kernel,
            1,
            Padding::Same,
            normalized,
            seed,
        )?
        .with_weight_decay(config.weight_decay)
        .with_orthogonal_scale(config.orthogonal_scale)
        .with_epsilon(config.norm_epsilon)?;
        let mut hw = root.output_hw(config.input_hw)?;

        let mut units = Vec::with_capacity(config.stage_channels.len() * config.units_per_stage);
        let mut channels = root_channels;
        for (stage, (&out_channels, &stage_stride)) in config
            .stage_channels
            .iter()
            .zip(config.stage_strides.iter())
            .enumerate()
        {
            for index in 0..config.units_per_stage {
                let stride = if index == 0 { stage_stride } else { 1 };
                let unit = ResidualUnit::new(
                    format!("block{}_unit{index}", stage + 1),
                    channels,
                    out_channels,
                    kernel,
                    stride,
                    normalized,
                    seed,
                )?
                .with_weight_decay(config.weight_decay)
                .with_orthogonal_scale(config.orthogonal_scale)
                .with_epsilon(config.norm_epsilon)?;
                hw = unit.output_hw(hw)?;
                channels = out_channels;
                units.push(unit);
            }
        }

        let score = NormConv2d::new(
            "score",
            channels,
            n_class,
            1,
            1,
            Padding::Valid,
            ConvOptions::default()
                .with_normalize(false)
                .with_regularize(true),
            seed,
        )?
        .with_weight_decay(config.weight_decay);

        let network = Self {
            config,
            n_class,
            root,
            units,
            feature_hw: hw,
            score,
        };
        let parameters = network.parameter_count()?;
        tracing::info!(
            n_class,
            units = network.units.len(),
            feature_hw = ?network.feature_hw,
            parameters,
            "assembled normalized resnet"
        );
        Ok(network)
    }

    pub fn config(&self) -> &DcNetConfig {
        &self.config
    }

    pub fn n_class(&self) -> usize {
        self.n_class
    }

    pub fn root(&self) -> &NormConv2d {
        &self.root
    }

    pub fn units(&self) -> &[ResidualUnit] {
        &self.units
    }

    pub fn score_layer(&self) -> &NormConv2d {
        &self.score
    }

    /// Spatial extent of the last stage, which the global pool averages over.
    pub fn feature_hw(&self) -> (usize, usize) {
        self.feature_hw
    }

    /// Spatial extent of the score map; always `(1, 1)`.
    pub fn output_hw(&self) -> (usize, usize) {
        (1, 1)
    }

    /// Layer scopes in evaluation order.
    pub fn layer_names(&self) -> Vec<String> {
        std::iter::once(self.root.name())
            .chain(self.units.iter().map(|unit| unit.name()))
            .chain(std::iter::once(self.score.name()))
            .map(str::to_string)
            .collect()
    }

    /// Runs one forward pass with a fresh context and returns everything it
    /// produced.
    pub fn forward(&self, rgb: &Tensor, mode: impl Into<Mode>) -> PureResult<NetworkOutput> {
        let mut ctx = ForwardContext::new(mode.into());
        let score = Module::forward(self, rgb, &mut ctx)?;
        let pred = ops::argmax_last_axis(&score);
        let (losses, normalized_weights) = ctx.into_parts();
        Ok(NetworkOutput {
            score,
            pred,
            losses,
            normalized_weights,
        })
    }

    fn guard_input(&self, rgb: &Tensor) -> PureResult<()> {
        let [batch, h, w, channels] = rgb.dims4()?;
        let (eh, ew) = self.config.input_hw;
        if (h, w, channels) != (eh, ew, self.config.input_channels) {
            return Err(TensorError::ShapeMismatch {
                left: vec![batch, h, w, channels],
                right: vec![batch, eh, ew, self.config.input_channels],
            });
        }
        Ok(())
    }
}

impl Module for NormalizedResNet {
    fn forward(&self, rgb: &Tensor, ctx: &mut ForwardContext) -> PureResult<Tensor> {
        self.guard_input(rgb)?;
        let center = self.config.pixel_center;
        let scale = self.config.pixel_scale;
        let pixels = rgb.map(|value| (value - center) / scale);

        let mut feat = self.root.forward(&pixels, ctx)?;
        tracing::trace!(layer = "root", shape = ?feat.shape(), "forward");
        for unit in &self.units {
            feat = unit.forward(&feat, ctx)?;
            tracing::trace!(layer = unit.name(), shape = ?feat.shape(), "forward");
        }
        let pooled = ops::avg_pool2d(&feat, self.feature_hw, (1, 1), Padding::Valid)?;
        let score = self.score.forward(&pooled, ctx)?;
        tracing::trace!(layer = "score", shape = ?score.shape(), "forward");
        Ok(score)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.root.visit_parameters(visitor)?;
        for unit in &self.units {
            unit.visit_parameters(visitor)?;
        }
        self.score.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.root.visit_parameters_mut(visitor)?;
        for unit in &mut self.units {
            unit.visit_parameters_mut(visitor)?;
        }
        self.score.visit_parameters_mut(visitor)
    }
}

/// Assembles the default network for `rgb`'s spatial extent and channel count
/// and evaluates it once.
pub fn build(
    rgb: &Tensor,
    n_class: usize,
    mode: impl Into<Mode>,
) -> PureResult<(NormalizedResNet, NetworkOutput)> {
    build_with(DcNetConfig::default(), rgb, n_class, mode)
}

/// [`build`] with an explicit configuration. `input_hw` and `input_channels`
/// are taken from `rgb`.
pub fn build_with(
    config: DcNetConfig,
    rgb: &Tensor,
    n_class: usize,
    mode: impl Into<Mode>,
) -> PureResult<(NormalizedResNet, NetworkOutput)> {
    let [_, h, w, channels] = rgb.dims4()?;
    let config = DcNetConfig {
        input_channels: channels,
        input_hw: (h, w),
        ..config
    };
    let network = NormalizedResNetBuilder::new(n_class)
        .with_config(config)
        .build()?;
    let output = network.forward(rgb, mode)?;
    Ok((network, output))
}
