//! Common types and utilities for HiveMind
//!
//! This crate provides the model taxonomy types, coordinator configuration,
//! logging setup and clock abstractions shared by the HiveMind crates.

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BudgetPolicy, HiveMindConfig, ModelConfig, PrivacyConfig, TrustConfig};
pub use error::Error;
pub use logging::{init_logging, init_logging_with_filter, init_test_logging, LogLevel};
pub use types::{LayerSpec, ModelArchitecture, ModelType};
