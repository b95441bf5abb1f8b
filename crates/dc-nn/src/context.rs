// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Evaluation mode and the caller-owned sinks a forward pass writes into.

use dc_tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Selects which branch of mode-dependent layers runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Batch statistics are used and moving averages are updated.
    Training,
    /// Frozen moving averages are used; no layer state changes.
    Inference,
}

impl Mode {
    pub fn is_training(self) -> bool {
        matches!(self, Mode::Training)
    }
}

impl From<bool> for Mode {
    fn from(is_training: bool) -> Self {
        if is_training {
            Mode::Training
        } else {
            Mode::Inference
        }
    }
}

/// Origin of an auxiliary loss term.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LossKind {
    /// Gram-matrix deviation of a filter bank from orthonormality.
    Orthogonal,
    /// L2 weight decay on a regularised parameter.
    WeightDecay,
}

/// One scalar term contributed by a layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuxiliaryLoss {
    pub name: String,
    pub kind: LossKind,
    pub value: f32,
}

/// Append-only collection of auxiliary loss terms.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AuxiliaryLosses {
    terms: Vec<AuxiliaryLoss>,
}

impl AuxiliaryLosses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, kind: LossKind, value: f32) {
        self.terms.push(AuxiliaryLoss {
            name: name.into(),
            kind,
            value,
        });
    }

    pub fn terms(&self) -> &[AuxiliaryLoss] {
        &self.terms
    }

    pub fn iter(&self) -> impl Iterator<Item = &AuxiliaryLoss> {
        self.terms.iter()
    }

    /// Terms of a single kind, in insertion order.
    pub fn of_kind(&self, kind: LossKind) -> impl Iterator<Item = &AuxiliaryLoss> {
        self.terms.iter().filter(move |term| term.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Sum of every term.
    pub fn total(&self) -> f32 {
        self.terms.iter().map(|term| term.value).sum()
    }

    /// Sum of the terms of one kind.
    pub fn total_of(&self, kind: LossKind) -> f32 {
        self.of_kind(kind).map(|term| term.value).sum()
    }
}

/// Unit-norm filters recorded by normalized convolutions, keyed by the filter
/// parameter name. Only written during a forward pass; never read back by the
/// network.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NormalizedWeights {
    filters: BTreeMap<String, Tensor>,
}

impl NormalizedWeights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `filter` under `name`, replacing any earlier entry.
    pub fn record(&mut self, name: impl Into<String>, filter: Tensor) {
        self.filters.insert(name.into(), filter);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.filters.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.filters.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.filters.iter().map(|(name, filter)| (name.as_str(), filter))
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

/// State threaded through a single forward pass.
#[derive(Debug)]
pub struct ForwardContext {
    mode: Mode,
    losses: AuxiliaryLosses,
    normalized: NormalizedWeights,
}

impl ForwardContext {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            losses: AuxiliaryLosses::new(),
            normalized: NormalizedWeights::new(),
        }
    }

    pub fn training() -> Self {
        Self::new(Mode::Training)
    }

    pub fn inference() -> Self {
        Self::new(Mode::Inference)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn losses(&self) -> &AuxiliaryLosses {
        &self.losses
    }

    pub fn losses_mut(&mut self) -> &mut AuxiliaryLosses {
        &mut self.losses
    }

    pub fn normalized_weights(&self) -> &NormalizedWeights {
        &self.normalized
    }

    pub fn normalized_weights_mut(&mut self) -> &mut NormalizedWeights {
        &mut self.normalized
    }

    /// Hands the accumulated sinks back to the caller.
    pub fn into_parts(self) -> (AuxiliaryLosses, NormalizedWeights) {
        (self.losses, self.normalized)
    }
}
