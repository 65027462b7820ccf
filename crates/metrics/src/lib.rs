//! Metrics - step-indexed training metrics with cross-rank reduction

pub mod store;

pub use store::{Bucket, MetricOptions, MetricSettings, MetricStore, PendingSync};
