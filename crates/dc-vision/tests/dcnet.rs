// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use dc_nn::{LossKind, Mode, Module, Tensor};
use dc_vision::{build, build_with, ConfigError, DcNetConfig, NormalizedResNetBuilder};
use std::fs;

fn narrow() -> DcNetConfig {
    DcNetConfig {
        stage_channels: vec![8, 16, 32],
        units_per_stage: 1,
        ..DcNetConfig::default()
    }
}

fn cifar_batch(batch: usize) -> Tensor {
    Tensor::from_fn(&[batch, 32, 32, 3], |i| ((i * 131 + 7) % 256) as f32).unwrap()
}

#[test]
fn cifar_batch_yields_one_prediction_per_image() {
    let rgb = cifar_batch(4);
    let (network, output) = build_with(narrow(), &rgb, 100, Mode::Training).unwrap();
    assert_eq!(output.score.shape(), &[4, 1, 1, 100]);
    assert_eq!(output.pred.len(), 4);
    assert!(output.pred.iter().all(|&p| p < 100));
    assert_eq!(network.feature_hw(), (8, 8));
    assert_eq!(network.output_hw(), (1, 1));
    assert_eq!(output.losses.of_kind(LossKind::Orthogonal).count(), 7);
    assert!(output.auxiliary_loss() > 0.0);
}

#[test]
fn default_network_on_cifar_batch() {
    let rgb = cifar_batch(4);
    let (network, output) = build(&rgb, 100, false).unwrap();
    assert_eq!(output.score.shape(), &[4, 1, 1, 100]);
    assert_eq!(output.pred.len(), 4);
    assert!(output.pred.iter().all(|&p| p < 100));
    assert!(output.score.data().iter().all(|v| v.is_finite()));
    assert_eq!(network.feature_hw(), (8, 8));
    assert_eq!(network.layer_names().len(), 17);
    assert_eq!(output.normalized_weights.len(), 31);
}

#[test]
fn mid_grey_batch_keeps_scores_finite() {
    // Every pixel maps to exactly zero, so each input window has zero energy.
    let rgb = Tensor::full(&[2, 8, 8, 3], 127.5).unwrap();
    let config = DcNetConfig {
        stage_channels: vec![4, 8],
        stage_strides: vec![1, 2],
        units_per_stage: 1,
        ..DcNetConfig::default()
    };
    let (_, output) = build_with(config.clone(), &rgb, 5, Mode::Inference).unwrap();
    assert!(output.score.data().iter().all(|v| v.is_finite()));

    let unstabilised = DcNetConfig {
        norm_epsilon: 0.0,
        ..config
    };
    assert!(build_with(unstabilised, &rgb, 5, Mode::Inference).is_err());
}

#[test]
fn default_network_parameter_count() {
    let network = NormalizedResNetBuilder::new(100).with_seed(0).build().unwrap();
    assert_eq!(network.parameter_count().unwrap(), 16_721_952);
    let state = network.state_dict().unwrap();
    assert!(state.contains_key("root/filter"));
    assert!(state.contains_key("block2_unit0/shortcut/filter"));
    assert!(state.contains_key("block3_unit0/shortcut/filter"));
    assert!(!state.contains_key("block1_unit0/shortcut/filter"));
    assert_eq!(state["score/filter"].shape(), &[1, 1, 384, 100]);
}

#[test]
fn seeded_networks_agree() {
    let rgb = cifar_batch(2);
    let a = NormalizedResNetBuilder::new(10)
        .with_config(narrow())
        .with_seed(17)
        .build()
        .unwrap();
    let b = NormalizedResNetBuilder::new(10)
        .with_config(narrow())
        .with_seed(17)
        .build()
        .unwrap();
    assert_eq!(a.state_dict().unwrap(), b.state_dict().unwrap());
    let out_a = a.forward(&rgb, Mode::Inference).unwrap();
    let out_b = b.forward(&rgb, Mode::Inference).unwrap();
    assert_eq!(out_a.score, out_b.score);
    assert_eq!(out_a.pred, out_b.pred);
}

#[test]
fn state_dict_round_trips_between_networks() {
    let rgb = cifar_batch(1);
    let source = NormalizedResNetBuilder::new(5)
        .with_config(narrow())
        .with_seed(1)
        .build()
        .unwrap();
    let mut target = NormalizedResNetBuilder::new(5)
        .with_config(narrow())
        .with_seed(2)
        .build()
        .unwrap();
    assert_ne!(source.state_dict().unwrap(), target.state_dict().unwrap());
    target.load_state_dict(&source.state_dict().unwrap()).unwrap();
    assert_eq!(
        source.forward(&rgb, Mode::Inference).unwrap().score,
        target.forward(&rgb, Mode::Inference).unwrap().score
    );
}

#[test]
fn config_file_overrides_selected_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dcnet.toml");
    fs::write(
        &path,
        "[dcnet]\n\
         stage_channels = [16, 32]\n\
         stage_strides = [1, 2]\n\
         units_per_stage = 2\n\
         seed = 9\n",
    )
    .unwrap();
    let config = DcNetConfig::from_file(&path).unwrap();
    assert_eq!(config.stage_channels, vec![16, 32]);
    assert_eq!(config.units_per_stage, 2);
    assert_eq!(config.seed, Some(9));
    assert_eq!(config.input_hw, (32, 32));
    assert_eq!(config.pixel_scale, 128.0);

    let network = NormalizedResNetBuilder::new(10)
        .with_config(config)
        .build()
        .unwrap();
    assert_eq!(network.layer_names().len(), 6);
    assert_eq!(network.feature_hw(), (16, 16));
}

#[test]
fn missing_section_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("other.json");
    fs::write(&path, r#"{"trainer": {"epochs": 3}}"#).unwrap();
    assert_eq!(DcNetConfig::from_file(&path).unwrap(), DcNetConfig::default());
}

#[test]
fn invalid_config_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[dcnet]\nstage_channels = [16, 32, 64]\nstage_strides = [1, 2]\n").unwrap();
    assert!(matches!(
        DcNetConfig::from_file(&path),
        Err(ConfigError::Invalid(_))
    ));
    fs::write(&path, "[dcnet]\nnorm_epsilon = 0.0\n").unwrap();
    assert!(matches!(
        DcNetConfig::from_file(&path),
        Err(ConfigError::Invalid(_))
    ));
    fs::write(&path, "[dcnet]\nunits_per_stage = \"five\"\n").unwrap();
    assert!(matches!(
        DcNetConfig::from_file(&path),
        Err(ConfigError::Layered(_))
    ));
}
