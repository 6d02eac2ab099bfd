//! Model taxonomy types shared across HiveMind crates

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a shared model, e.g. `stealth-detection`.
///
/// The set of model types is closed and supplied through configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelType(String);

impl ModelType {
    /// Creates a model type from its label
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    /// Returns the label
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelType {
    fn from(label: &str) -> Self {
        Self::new(label)
    }
}

impl From<String> for ModelType {
    fn from(label: String) -> Self {
        Self(label)
    }
}

/// One named layer of a model's flat parameter vector.
///
/// Within the flat vector a layer occupies `weights` entries followed by
/// `biases` entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSpec {
    /// Layer name
    pub name: String,
    /// Number of weight parameters
    pub weights: usize,
    /// Number of bias parameters
    pub biases: usize,
}

impl LayerSpec {
    /// Creates a layer description
    pub fn new(name: impl Into<String>, weights: usize, biases: usize) -> Self {
        Self {
            name: name.into(),
            weights,
            biases,
        }
    }

    /// Total parameters in this layer
    pub fn len(&self) -> usize {
        self.weights + self.biases
    }

    /// Returns true if the layer has no parameters
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Architecture descriptor for a model type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelArchitecture {
    /// Layers in flat-vector order
    pub layers: Vec<LayerSpec>,
    /// Declared parameter count, must equal the sum of layer sizes
    pub total_parameters: usize,
    /// Input feature dimension
    pub input_dimension: usize,
    /// Output dimension
    pub output_dimension: usize,
}

impl ModelArchitecture {
    /// Builds a fully connected architecture from layer widths.
    ///
    /// `dense(&[32, 16, 4])` yields `dense_0` (32x16 weights, 16 biases) and
    /// `dense_1` (16x4 weights, 4 biases).
    pub fn dense(widths: &[usize]) -> Self {
        let layers: Vec<LayerSpec> = widths
            .windows(2)
            .enumerate()
            .map(|(i, pair)| LayerSpec::new(format!("dense_{i}"), pair[0] * pair[1], pair[1]))
            .collect();
        let total_parameters = layers.iter().map(LayerSpec::len).sum();

        Self {
            layers,
            total_parameters,
            input_dimension: widths.first().copied().unwrap_or(0),
            output_dimension: widths.last().copied().unwrap_or(0),
        }
    }

    /// Sum of all layer sizes
    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(LayerSpec::len).sum()
    }

    /// Checks that the declared parameter count matches the layers
    pub fn is_consistent(&self) -> bool {
        !self.layers.is_empty() && self.parameter_count() == self.total_parameters
    }
}
