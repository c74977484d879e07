//! Wiring and runtime for the bundler: configuration, metrics, the bundling
//! cycle driver, and the front-end API trait.

pub mod api;
pub mod config;
pub mod metrics;
pub mod service;

pub use api::BundlerApi;
pub use config::Args;
pub use metrics::BundlerMetrics;
pub use service::{BundlerService, BundlingMode};
