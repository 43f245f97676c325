//! # Configuration
//!
//! Runtime settings for provisioning, readiness, exposure and teardown.

mod fixture;

pub use fixture::{FixtureConfig, RetryPolicy};
