// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Pure Rust tensor engine for the DCNet stack.
//!
//! Tensors are dense, row-major `f32` buffers of arbitrary rank. Image batches
//! use the channel-last `[batch, height, width, channels]` layout and filters
//! use `[kernel_h, kernel_w, in_channels, out_channels]`, so the flattened
//! filter is directly the `[receptive_field, out_channels]` GEMM operand.

pub mod ops;
pub mod pure;

pub use ops::Padding;
pub use pure::{PureResult, Tensor, TensorError};
