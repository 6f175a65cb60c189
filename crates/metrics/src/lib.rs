//! Metrics collection and export for the gateway core.
//!
//! This crate provides a unified metrics interface using the `metrics` crate
//! facade, plus directly-readable atomic counters for the scheduler (C5),
//! the WS client dialer (C7), and the sticky-key compatibility fallback.
//! When the `prometheus` feature is enabled, the same data is additionally
//! exported in Prometheus text format.
//!
//! # Usage
//!
//! ```rust,ignore
//! use relay_metrics::{counter, scheduler};
//!
//! counter!(scheduler::SELECT_TOTAL).increment(1);
//! ```
//!
//! # Features
//!
//! - `prometheus`: enable Prometheus metrics export via a `/metrics` endpoint.
//! - `tracing`: propagate tracing span context into metrics labels.

mod definitions;
mod recorder;
mod snapshot;
pub mod tracing_integration;

pub use definitions::*;
pub use recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics};
pub use snapshot::{
    CompatMetrics, CompatMetricsSnapshot, DialerMetrics, DialerMetricsSnapshot, SchedulerMetrics,
    SchedulerMetricsSnapshot, SelectOutcome,
};

// Re-export metrics macros for convenience.
pub use metrics::{counter, gauge, histogram};
