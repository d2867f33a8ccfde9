//! Named parameter tensors shared by networks, the optimizer and checkpoints.

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map;

/// What role a parameter plays, which decides whether a checkpoint carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    /// Updated by the optimizer.
    Trainable,
    /// Running normalization statistics, updated outside the optimizer.
    Statistic,
    /// Optimizer-internal state (moments, power accumulators).
    Optimizer,
}

impl ParameterKind {
    /// Model parameters are everything inference needs.
    #[must_use]
    pub fn is_model(self) -> bool {
        matches!(self, Self::Trainable | Self::Statistic)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub kind: ParameterKind,
    pub value: ArrayD<f32>,
}

/// Gradients keyed by trainable parameter name.
pub type Gradients = BTreeMap<String, ArrayD<f32>>;

/// Ordered map of named parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    entries: BTreeMap<String, Parameter>,
}

impl ParameterSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, kind: ParameterKind, value: ArrayD<f32>) {
        self.entries.insert(name.into(), Parameter { kind, value });
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.entries.get(name)
    }

    #[must_use]
    pub fn value(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.entries.get(name).map(|p| &p.value)
    }

    pub fn value_mut(&mut self, name: &str) -> Option<&mut ArrayD<f32>> {
        self.entries.get_mut(name).map(|p| &mut p.value)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Parameter> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Subset holding only the parameters whose kind satisfies `keep`.
    #[must_use]
    pub fn filter(&self, keep: impl Fn(ParameterKind) -> bool) -> Self {
        let entries = self
            .entries
            .iter()
            .filter(|(_, p)| keep(p.kind))
            .map(|(name, p)| (name.clone(), p.clone()))
            .collect();
        Self { entries }
    }

    /// Adds every entry of `other`, replacing entries with the same name.
    pub fn extend(&mut self, other: Self) {
        self.entries.extend(other.entries);
    }

    /// Total number of scalars held by parameters of the given kind.
    #[must_use]
    pub fn scalar_count(&self, kind: ParameterKind) -> usize {
        self.entries.values().filter(|p| p.kind == kind).map(|p| p.value.len()).sum()
    }

    /// Copies every `kind`-matching value of `source` into `self`.
    ///
    /// Both sides must agree exactly on the names, kinds and shapes of the selected
    /// parameters; anything else means the snapshot belongs to a different network.
    pub fn assign_from(&mut self, source: &Self, keep: impl Fn(ParameterKind) -> bool) -> Result<(), String> {
        let expected: Vec<&String> = self.entries.iter().filter(|(_, p)| keep(p.kind)).map(|(n, _)| n).collect();
        let provided: Vec<&String> = source.entries.iter().filter(|(_, p)| keep(p.kind)).map(|(n, _)| n).collect();

        if let Some(missing) = expected.iter().find(|name| !source.entries.contains_key(name.as_str())) {
            return Err(format!("parameter '{missing}' is missing"));
        }
        if let Some(unknown) = provided.iter().find(|name| !self.entries.contains_key(name.as_str())) {
            return Err(format!("unexpected parameter '{unknown}'"));
        }

        for (name, incoming) in source.entries.iter().filter(|(_, p)| keep(p.kind)) {
            let target = &self.entries[name];
            if target.kind != incoming.kind {
                return Err(format!(
                    "parameter '{name}' is {:?}, expected {:?}",
                    incoming.kind, target.kind
                ));
            }
            if target.value.shape() != incoming.value.shape() {
                return Err(format!(
                    "parameter '{name}' has shape {:?}, expected {:?}",
                    incoming.value.shape(),
                    target.value.shape()
                ));
            }
        }

        for (name, incoming) in source.entries.iter().filter(|(_, p)| keep(p.kind)) {
            if let Some(target) = self.entries.get_mut(name) {
                target.value.assign(&incoming.value);
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a ParameterSet {
    type Item = (&'a String, &'a Parameter);
    type IntoIter = btree_map::Iter<'a, String, Parameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
