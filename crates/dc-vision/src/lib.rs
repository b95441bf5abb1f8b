// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Image classifiers assembled from normalized-convolution residual units.
//!
//! [`build`] is the one-call entry point: it assembles the default
//! [`NormalizedResNet`] for the image batch it is given and runs one forward
//! pass. Use [`NormalizedResNetBuilder`] to keep the network around across
//! batches or to override the [`DcNetConfig`] defaults.

pub mod models;

pub use models::dcnet::{
    build, build_with, ConfigError, DcNetConfig, NetworkOutput, NormalizedResNet,
    NormalizedResNetBuilder, DCNET_SECTION,
};
