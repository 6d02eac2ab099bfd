//! Coordinator configuration
//!
//! [`HiveMindConfig`] carries the round, privacy and trust parameters plus
//! the closed model taxonomy. It can be built in code or loaded from YAML;
//! every section uses `#[serde(default)]` so partial documents are accepted.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::{ModelArchitecture, ModelType};

/// What happens when a model's cumulative privacy spend reaches its ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPolicy {
    /// Spend keeps accumulating; crossing the ceiling is reported only
    #[default]
    Advisory,
    /// Updates that would push spend past the ceiling are rejected
    Enforce,
}

impl fmt::Display for BudgetPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetPolicy::Advisory => write!(f, "advisory"),
            BudgetPolicy::Enforce => write!(f, "enforce"),
        }
    }
}

/// Differential privacy parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// L2 clipping bound for a single contribution
    pub max_gradient_norm: f64,
    /// Gaussian noise multiplier (sigma relative to the clipping bound)
    pub noise_multiplier: f64,
    /// Target delta of the (epsilon, delta) guarantee
    pub delta: f64,
    /// Per-model privacy budget ceiling
    pub max_privacy_budget: f64,
    /// Handling of the ceiling
    pub budget_policy: BudgetPolicy,
    /// Keep only the largest-magnitude entries after noise
    pub compression_enabled: bool,
    /// Fraction of entries kept when compression is enabled
    pub compression_ratio: f64,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            max_gradient_norm: 1.0,
            noise_multiplier: 1.1,
            delta: 1e-5,
            max_privacy_budget: 10.0,
            budget_policy: BudgetPolicy::Advisory,
            compression_enabled: false,
            compression_ratio: 0.1,
        }
    }
}

/// Worker trust scoring parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Trust assigned on registration
    pub initial_trust: f64,
    /// Weight kept from the previous score in the moving average
    pub retention: f64,
    /// Updates from workers below this trust are rejected
    pub min_trust: f64,
    /// Number of past trust values kept per worker
    pub history_len: usize,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            initial_trust: 0.5,
            retention: 0.9,
            min_trust: 0.1,
            history_len: 100,
        }
    }
}

/// One entry of the model taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model type label
    pub model_type: ModelType,
    /// Parameter layout
    pub architecture: ModelArchitecture,
}

impl ModelConfig {
    /// Creates a taxonomy entry
    pub fn new(model_type: impl Into<ModelType>, architecture: ModelArchitecture) -> Self {
        Self {
            model_type: model_type.into(),
            architecture,
        }
    }
}

/// Top-level coordinator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HiveMindConfig {
    /// Interval of the buffer flush timer
    pub sync_interval_ms: u64,
    /// Hard deadline of a round, measured from its start
    pub round_timeout_ms: u64,
    /// Accepted updates that trigger aggregation
    pub min_workers_per_round: usize,
    /// Minimum batch size that may produce a private update
    pub min_samples_per_round: usize,
    /// Step size of the update applied to the model
    pub learning_rate: f64,
    /// Buffered experiences kept after each flush
    pub experience_retention: usize,
    /// Multiplier on `max_gradient_norm` tolerated when validating updates
    pub norm_tolerance: f64,
    /// Archived snapshots kept per model
    pub max_versions: usize,
    /// Seed for noise and initial weights; random when absent
    pub seed: Option<u64>,
    /// Differential privacy
    pub privacy: PrivacyConfig,
    /// Trust scoring
    pub trust: TrustConfig,
    /// Closed model taxonomy
    pub models: Vec<ModelConfig>,
    /// Experience label to model type lookup
    pub label_routes: BTreeMap<String, ModelType>,
    /// Model type used for labels without a route
    pub default_model: ModelType,
}

impl Default for HiveMindConfig {
    fn default() -> Self {
        let stealth = ModelType::new("stealth-detection");
        let bypass = ModelType::new("bypass-strategy");
        let timing = ModelType::new("timing-optimization");

        let label_routes = [
            ("bot-detection", &stealth),
            ("fingerprint", &stealth),
            ("captcha", &bypass),
            ("waf", &bypass),
            ("rate-limit", &timing),
            ("throttle", &timing),
        ]
        .into_iter()
        .map(|(label, model)| (label.to_string(), model.clone()))
        .collect();

        Self {
            sync_interval_ms: 60_000,
            round_timeout_ms: 300_000,
            min_workers_per_round: 3,
            min_samples_per_round: 10,
            learning_rate: 0.01,
            experience_retention: 1000,
            norm_tolerance: 1.1,
            max_versions: 20,
            seed: None,
            privacy: PrivacyConfig::default(),
            trust: TrustConfig::default(),
            models: vec![
                ModelConfig::new(stealth.clone(), ModelArchitecture::dense(&[32, 16, 4])),
                ModelConfig::new(bypass, ModelArchitecture::dense(&[32, 16, 8])),
                ModelConfig::new(timing, ModelArchitecture::dense(&[16, 8, 1])),
            ],
            label_routes,
            default_model: stealth,
        }
    }
}

impl HiveMindConfig {
    /// Parses a configuration from a YAML string.
    ///
    /// # Example
    /// ```
    /// use hivemind_common::HiveMindConfig;
    ///
    /// let yaml = r#"
    /// sync_interval_ms: 1000
    /// min_workers_per_round: 2
    /// privacy:
    ///   noise_multiplier: 0.5
    /// "#;
    ///
    /// let config = HiveMindConfig::from_yaml(yaml).unwrap();
    /// assert_eq!(config.sync_interval_ms, 1000);
    /// assert_eq!(config.privacy.max_gradient_norm, 1.0);
    /// ```
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Serializes the configuration to YAML.
    pub fn to_yaml(&self) -> Result<String, Error> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Interval of the aggregation-check timer
    pub fn aggregation_check_interval_ms(&self) -> u64 {
        self.sync_interval_ms.saturating_mul(2)
    }

    /// Largest gradient norm accepted by update validation
    pub fn norm_limit(&self) -> f64 {
        self.privacy.max_gradient_norm * self.norm_tolerance
    }

    /// Looks up the architecture of a model type
    pub fn architecture(&self, model_type: &ModelType) -> Option<&ModelArchitecture> {
        self.models
            .iter()
            .find(|m| &m.model_type == model_type)
            .map(|m| &m.architecture)
    }

    /// Checks the configuration for internal consistency.
    pub fn validate(&self) -> Result<(), Error> {
        if self.models.is_empty() {
            return Err(Error::Config("model taxonomy is empty".into()));
        }

        let mut seen = BTreeSet::new();
        for model in &self.models {
            if !seen.insert(&model.model_type) {
                return Err(Error::Config(format!(
                    "duplicate model type {}",
                    model.model_type
                )));
            }
            if !model.architecture.is_consistent() {
                return Err(Error::Config(format!(
                    "architecture of {} declares {} parameters but its layers hold {}",
                    model.model_type,
                    model.architecture.total_parameters,
                    model.architecture.parameter_count()
                )));
            }
        }

        if !seen.contains(&self.default_model) {
            return Err(Error::Config(format!(
                "default model {} is not in the taxonomy",
                self.default_model
            )));
        }
        if let Some((label, model)) = self.label_routes.iter().find(|(_, m)| !seen.contains(m)) {
            return Err(Error::Config(format!(
                "label {label} routes to unknown model {model}"
            )));
        }

        if self.sync_interval_ms == 0 || self.round_timeout_ms == 0 {
            return Err(Error::Config("timer intervals must be positive".into()));
        }
        if self.min_workers_per_round == 0 || self.min_samples_per_round == 0 {
            return Err(Error::Config("round minimums must be at least 1".into()));
        }
        if self.experience_retention == 0 || self.max_versions == 0 {
            return Err(Error::Config("retention limits must be at least 1".into()));
        }
        if !(self.learning_rate > 0.0) || !(self.norm_tolerance >= 1.0) {
            return Err(Error::Config(
                "learning_rate must be positive and norm_tolerance at least 1".into(),
            ));
        }

        let privacy = &self.privacy;
        if !(privacy.max_gradient_norm > 0.0) || !(privacy.noise_multiplier > 0.0) {
            return Err(Error::Config(
                "max_gradient_norm and noise_multiplier must be positive".into(),
            ));
        }
        if !(privacy.delta > 0.0 && privacy.delta < 1.0) {
            return Err(Error::Config(format!(
                "delta {} outside (0, 1)",
                privacy.delta
            )));
        }
        if !(privacy.compression_ratio > 0.0 && privacy.compression_ratio <= 1.0) {
            return Err(Error::Config(format!(
                "compression_ratio {} outside (0, 1]",
                privacy.compression_ratio
            )));
        }
        if !(privacy.max_privacy_budget > 0.0) {
            return Err(Error::Config("max_privacy_budget must be positive".into()));
        }

        let trust = &self.trust;
        let unit = 0.0..=1.0;
        if !unit.contains(&trust.initial_trust)
            || !unit.contains(&trust.retention)
            || !unit.contains(&trust.min_trust)
            || trust.history_len == 0
        {
            return Err(Error::Config("trust parameters out of range".into()));
        }

        Ok(())
    }
}
