//! Time series derived from engine metrics and their text exposition.
mod exposition;
mod histogram;
mod registry;


pub use exposition::serve_metrics;
pub use histogram::LatencyHistogram;
pub use registry::{MetricsSink, TimeSeriesRegistry};
