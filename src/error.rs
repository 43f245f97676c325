//! # Errors
//!
//! Library-level error type shared by every lifecycle stage.

use crate::cluster::{ApiError, ResourceRef};
use crate::teardown::TeardownFailure;
use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by resolve, acquire and release
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("Malformed manifest: {0}")]
    MalformedManifest(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Failed to provision {resource}: {last_error}")]
    ProvisionFailed {
        resource: ResourceRef,
        last_error: ApiError,
    },

    #[error("{resource} was not ready within {timeout:?}")]
    TimedOut {
        resource: ResourceRef,
        timeout: Duration,
    },

    #[error("{resource} failed: {reason}")]
    ResourceFailed { resource: ResourceRef, reason: String },

    #[error("Setup of {resource} failed: {reason}")]
    SetupFailed { resource: ResourceRef, reason: String },

    #[error("Cannot expose {resource} port {port}: {reason}")]
    ExposeFailed {
        resource: String,
        port: u16,
        reason: String,
    },

    #[error("Teardown of scope {scope} left {} resource(s) behind", failed.len())]
    TeardownIncomplete {
        scope: String,
        failed: Vec<TeardownFailure>,
    },

    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    #[error("Scope {0} is already active")]
    ScopeActive(String),

    #[error("Scope {0} has already been released")]
    ScopeReleased(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = FixtureError> = std::result::Result<T, E>;
