//! Observability
//!
//! Structured logging is set up with [`crate::logger`]. This module turns
//! broker events into Prometheus metrics.

pub mod metrics;

pub use metrics::RedmqMetrics;
