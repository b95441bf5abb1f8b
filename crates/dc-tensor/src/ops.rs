// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Convolution, pooling, and reduction kernels over NHWC tensors.
//!
//! Output sizes and padding follow TensorFlow's `SAME`/`VALID` conventions so
//! that feature-map extents line up with the 32 → 16 → 8 schedule used by the
//! CIFAR models.

use crate::pure::{gemm_rows, PureResult, Tensor, TensorError};
use rayon::prelude::*;

/// Spatial padding policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Padding {
    /// Output extent is `ceil(input / stride)`; the input is zero-padded with
    /// the smaller half of the padding placed before the data.
    #[default]
    Same,
    /// No padding; windows must fit entirely inside the input.
    Valid,
}

impl Padding {
    /// Returns `(output_extent, padding_before)` for one spatial axis.
    pub fn resolve(self, input: usize, kernel: usize, stride: usize) -> PureResult<(usize, usize)> {
        if stride == 0 {
            return Err(TensorError::InvalidValue { label: "stride" });
        }
        if kernel == 0 || input == 0 {
            return Err(TensorError::InvalidDimensions {
                shape: vec![input, kernel],
            });
        }
        match self {
            Padding::Same => {
                let out = (input + stride - 1) / stride;
                let total = ((out - 1) * stride + kernel).saturating_sub(input);
                Ok((out, total / 2))
            }
            Padding::Valid => {
                if input < kernel {
                    return Err(TensorError::InvalidDimensions {
                        shape: vec![input, kernel],
                    });
                }
                Ok(((input - kernel) / stride + 1, 0))
            }
        }
    }
}

/// 2-D convolution of `input [n, h, w, c]` with `filter [kh, kw, c, o]`.
///
/// Each output row `(n, y)` gathers its patches into a scratch buffer ordered
/// `(kh, kw, c)`, which matches the flattened filter, and accumulates the GEMM
/// against the `[kh·kw·c, o]` filter view.
pub fn conv2d(
    input: &Tensor,
    filter: &Tensor,
    stride: usize,
    padding: Padding,
) -> PureResult<Tensor> {
    let [batch, h, w, channels] = input.dims4()?;
    let [kh, kw, filter_channels, out_channels] = filter.dims4()?;
    if filter_channels != channels {
        return Err(TensorError::ShapeMismatch {
            left: input.shape().to_vec(),
            right: filter.shape().to_vec(),
        });
    }
    let (oh, pad_top) = padding.resolve(h, kh, stride)?;
    let (ow, pad_left) = padding.resolve(w, kw, stride)?;
    let span = kh * kw * channels;
    let input_data = input.data();
    let weight = filter.data();
    let mut out = vec![0.0f32; batch * oh * ow * out_channels];
    out.par_chunks_mut(ow * out_channels)
        .enumerate()
        .for_each(|(row_index, out_row)| {
            let b = row_index / oh;
            let oy = row_index % oh;
            let image = &input_data[b * h * w * channels..(b + 1) * h * w * channels];
            let mut patches = vec![0.0f32; ow * span];
            for (ox, patch) in patches.chunks_exact_mut(span).enumerate() {
                let mut offset = 0;
                for ky in 0..kh {
                    let iy = (oy * stride + ky) as isize - pad_top as isize;
                    for kx in 0..kw {
                        let ix = (ox * stride + kx) as isize - pad_left as isize;
                        let slot = &mut patch[offset..offset + channels];
                        if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize {
                            slot.fill(0.0);
                        } else {
                            let start = (iy as usize * w + ix as usize) * channels;
                            slot.copy_from_slice(&image[start..start + channels]);
                        }
                        offset += channels;
                    }
                }
            }
            for (patch, dst) in patches
                .chunks_exact(span)
                .zip(out_row.chunks_exact_mut(out_channels))
            {
                gemm_row(patch, weight, dst, out_channels);
            }
        });
    Tensor::from_vec(&[batch, oh, ow, out_channels], out)
}

fn gemm_row(lhs_row: &[f32], rhs: &[f32], dst_row: &mut [f32], cols: usize) {
    // Single-row variant of `gemm_rows`; the caller already parallelises.
    for (k, &a) in lhs_row.iter().enumerate() {
        if a == 0.0 {
            continue;
        }
        let rhs_row = &rhs[k * cols..(k + 1) * cols];
        for (out, &b) in dst_row.iter_mut().zip(rhs_row.iter()) {
            *out += a * b;
        }
    }
}

/// Sums `x²` over each `kernel × kernel` window and every input channel by
/// convolving with an all-ones `[kernel, kernel, c, 1]` filter.
pub fn window_energy(
    input: &Tensor,
    kernel: usize,
    stride: usize,
    padding: Padding,
) -> PureResult<Tensor> {
    let channels = input.dims4()?[3];
    let ones = Tensor::full(&[kernel, kernel, channels, 1], 1.0)?;
    conv2d(&input.map(|v| v * v), &ones, stride, padding)
}

/// Average pooling over `kernel` windows. Padded positions are excluded from
/// the average.
pub fn avg_pool2d(
    input: &Tensor,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: Padding,
) -> PureResult<Tensor> {
    let [batch, h, w, channels] = input.dims4()?;
    let (oh, pad_top) = padding.resolve(h, kernel.0, stride.0)?;
    let (ow, pad_left) = padding.resolve(w, kernel.1, stride.1)?;
    let data = input.data();
    let mut out = Vec::with_capacity(batch * oh * ow * channels);
    for b in 0..batch {
        for oy in 0..oh {
            for ox in 0..ow {
                let mut acc = vec![0.0f32; channels];
                let mut count = 0usize;
                for ky in 0..kernel.0 {
                    let iy = (oy * stride.0 + ky) as isize - pad_top as isize;
                    if iy < 0 || iy >= h as isize {
                        continue;
                    }
                    for kx in 0..kernel.1 {
                        let ix = (ox * stride.1 + kx) as isize - pad_left as isize;
                        if ix < 0 || ix >= w as isize {
                            continue;
                        }
                        let start = ((b * h + iy as usize) * w + ix as usize) * channels;
                        for (slot, value) in acc.iter_mut().zip(&data[start..start + channels]) {
                            *slot += value;
                        }
                        count += 1;
                    }
                }
                let inv = 1.0 / count.max(1) as f32;
                out.extend(acc.into_iter().map(|value| value * inv));
            }
        }
    }
    Tensor::from_vec(&[batch, oh, ow, channels], out)
}

/// Per-channel mean over the batch and spatial axes of an NHWC tensor.
pub fn channel_mean(input: &Tensor) -> PureResult<Vec<f32>> {
    input.dims4()?;
    let channels = input.last_dim();
    let rows = input.len() / channels;
    let mut mean = vec![0.0f32; channels];
    for row in input.data().chunks_exact(channels) {
        for (acc, value) in mean.iter_mut().zip(row.iter()) {
            *acc += value;
        }
    }
    let scale = 1.0 / rows as f32;
    for value in mean.iter_mut() {
        *value *= scale;
    }
    Ok(mean)
}

/// Per-channel mean and population variance over the batch and spatial axes.
pub fn channel_moments(input: &Tensor) -> PureResult<(Vec<f32>, Vec<f32>)> {
    let mean = channel_mean(input)?;
    let channels = mean.len();
    let rows = input.len() / channels;
    let mut variance = vec![0.0f32; channels];
    for row in input.data().chunks_exact(channels) {
        for ((acc, value), mu) in variance.iter_mut().zip(row.iter()).zip(mean.iter()) {
            let centered = value - mu;
            *acc += centered * centered;
        }
    }
    let scale = 1.0 / rows as f32;
    for value in variance.iter_mut() {
        *value *= scale;
    }
    Ok((mean, variance))
}

/// Index of the largest entry along the trailing axis for every leading
/// position. Ties resolve to the smallest index.
pub fn argmax_last_axis(input: &Tensor) -> Vec<usize> {
    input
        .data()
        .chunks_exact(input.last_dim())
        .map(|row| {
            let mut best = 0usize;
            for (idx, value) in row.iter().enumerate().skip(1) {
                if *value > row[best] {
                    best = idx;
                }
            }
            best
        })
        .collect()
}
