// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::context::ForwardContext;
use dc_tensor::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Named tensor owned by a layer.
#[derive(Clone, PartialEq)]
pub struct Parameter {
    name: String,
    value: Tensor,
}

impl core::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Parameter(name={},shape={:?})", self.name, self.value.shape())
    }
}

impl Parameter {
    /// Creates a new parameter with the provided tensor value.
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Returns the identifier assigned to the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provides an immutable view into the underlying tensor value.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Provides a mutable view into the underlying tensor value.
    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    /// Replaces the stored value; the shape must not change.
    pub fn load_value(&mut self, value: &Tensor) -> PureResult<()> {
        if value.shape() != self.value.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.value.shape().to_vec(),
                right: value.shape().to_vec(),
            });
        }
        self.value = value.clone();
        Ok(())
    }
}

/// Forward-only layer interface.
pub trait Module {
    /// Runs a forward pass. Mode-dependent layers read `ctx.mode()`; layers
    /// that contribute auxiliary losses or normalized filters write them into
    /// `ctx`.
    fn forward(&self, input: &Tensor, ctx: &mut ForwardContext) -> PureResult<Tensor>;

    /// Visits immutable parameters.
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Visits mutable parameters.
    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Total number of scalar parameters.
    fn parameter_count(&self) -> PureResult<usize> {
        let mut total = 0usize;
        self.visit_parameters(&mut |param| {
            total += param.value().len();
            Ok(())
        })?;
        Ok(total)
    }

    /// Captures a copy of every parameter tensor keyed by its canonical name.
    fn state_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores parameters from a state dictionary produced by [`Module::state_dict`].
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_value_rejects_new_shape() {
        let mut param = Parameter::new("root/filter", Tensor::zeros(&[3, 3, 3, 4]).unwrap());
        assert!(param.load_value(&Tensor::zeros(&[3, 3, 3, 5]).unwrap()).is_err());
        let ones = Tensor::full(&[3, 3, 3, 4], 1.0).unwrap();
        param.load_value(&ones).unwrap();
        assert_eq!(param.value(), &ones);
        assert_eq!(
            format!("{param:?}"),
            "Parameter(name=root/filter,shape=[3, 3, 3, 4])"
        );
    }
}
