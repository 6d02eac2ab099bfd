//! Integration test framework for HiveMind
#![allow(missing_docs)]
//!
//! This crate provides fixtures and utilities for exercising the
//! coordinator through its public API.
//!
//! # Components
//!
//! - [`test_fixtures`] - Configurations, experience generators and
//!   recording collaborators (transport, broadcaster)
//! - [`test_utils`] - Logging, event draining and polling helpers
//!
//! # Test Categories
//!
//! 1. **End-to-End** - Register, report, sync, aggregate, distribute
//! 2. **Urgent Path** - Immediate broadcast under the privacy rules
//! 3. **Round Lifecycle** - Timeouts, validation, versioning, budget
//! 4. **Concurrency** - Many callers against one coordinator
//! 5. **State Restore** - Export, restore, interrupted rounds
//! 6. **Driver Task** - The tokio task and its commands

pub mod test_fixtures;

pub use test_fixtures::{
    experience, experience_batch, test_config, urgent_config, RecordingBroadcaster,
    RecordingTransport, TestHive, FEATURE_DIM,
};
pub use test_utils::{
    drain_events, init_test_logging, wait_for_condition, TestResult, DEFAULT_POLL_INTERVAL,
    DEFAULT_TEST_TIMEOUT,
};
