use metrics::{Counter, Gauge, Histogram};
use metrics_derive::Metrics;

/// Collected metrics for the bundler service.
#[derive(Metrics)]
#[metrics(scope = "gantry")]
pub struct BundlerMetrics {
    /// Operations accepted into the pending pool.
    #[metric(describe = "Operations accepted into the pending pool")]
    pub ops_admitted: Counter,

    /// Operations rejected at admission.
    #[metric(describe = "Operations rejected at admission")]
    pub ops_rejected: Counter,

    /// Operations confirmed on-chain.
    #[metric(describe = "Operations confirmed on-chain")]
    pub ops_included: Counter,

    /// Operations cancelled without landing on-chain.
    #[metric(describe = "Operations cancelled without landing on-chain")]
    pub ops_cancelled: Counter,

    /// Bundle transactions broadcast.
    #[metric(describe = "Bundle transactions broadcast")]
    pub bundles_submitted: Counter,

    /// Bundles whose dry run or execution failed.
    #[metric(describe = "Bundles whose dry run or execution failed")]
    pub bundles_failed: Counter,

    /// Number of entries in submitted bundles.
    #[metric(describe = "Number of entries in submitted bundles")]
    pub bundle_size: Histogram,

    /// Duration of bundle assembly in seconds.
    #[metric(describe = "Duration of bundle assembly in seconds")]
    pub bundle_build_duration: Histogram,

    /// Current number of entries in the pool.
    #[metric(describe = "Current number of entries in the pool")]
    pub pool_size: Gauge,

    /// Submission identities not currently carrying a transaction.
    #[metric(describe = "Submission identities not currently carrying a transaction")]
    pub available_identities: Gauge,
}
