// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Filter normalisation and the auxiliary penalties attached to filters.

use dc_tensor::{PureResult, Tensor};

/// Stabiliser added under the square root of every filter and input norm.
pub const NORM_EPSILON: f32 = 1e-4;
/// Scale of the orthogonality penalty.
pub const ORTHOGONAL_SCALE: f32 = 1e-5;
/// L2 weight-decay coefficient for regularised parameters.
pub const WEIGHT_DECAY: f32 = 5e-4;

/// `sqrt(Σ w² + epsilon)` for every output filter (trailing axis), summing
/// over all leading axes.
pub fn filter_norms(filter: &Tensor, epsilon: f32) -> Vec<f32> {
    filter
        .sum_squares_per_channel()
        .into_iter()
        .map(|sum| (sum + epsilon).sqrt())
        .collect()
}

/// Divides every output filter by its [`filter_norms`] entry.
pub fn normalize_filter(filter: &Tensor, epsilon: f32) -> PureResult<Tensor> {
    filter.div_per_channel(&filter_norms(filter, epsilon))
}

/// `scale · ½‖WᵀW − I‖²` where `W` is the filter reshaped to
/// `[receptive_field, out_channels]` with unit-norm columns.
///
/// Zero (up to the epsilon in the column norms) when the output filters are
/// orthonormal.
pub fn orthogonal_penalty(filter: &Tensor, scale: f32, epsilon: f32) -> PureResult<f32> {
    let out_channels = filter.last_dim();
    let receptive = filter.len() / out_channels;
    let columns = filter.reshape(&[receptive, out_channels])?;
    let unit = normalize_filter(&columns, epsilon)?;
    let gram = unit.transpose()?.matmul(&unit)?;
    let deviation = gram.sub(&Tensor::eye(out_channels)?)?;
    Ok(scale * 0.5 * deviation.squared_l2_norm())
}

/// `decay · ½Σw²`.
pub fn weight_decay_penalty(value: &Tensor, decay: f32) -> f32 {
    decay * 0.5 * value.squared_l2_norm()
}
