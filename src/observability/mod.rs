//! # Observability
//!
//! Observability modules for metrics and logging.
//!
//! - `metrics`: Prometheus metrics collection
//! - `logging`: tracing subscriber setup with env filter and text/JSON output

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::init_tracing;
pub use metrics::{gather_text, register_metrics};
