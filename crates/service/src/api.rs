use std::time::Duration;

use alloy_primitives::{Address, TxHash};
use async_trait::async_trait;
use chrono::Utc;
use gantry_reputation::ReputationSummary;
use gantry_types::{
    PoolEntry, PoolError, PoolEvent, UserOpHash, ValidationOutcome, VersionedUserOperation,
};
use tokio::sync::broadcast;

use crate::service::{BundlerService, BundlingMode};

/// The operations an RPC front end drives the bundler with. Kept as a trait
/// so transports stay out of the core.
#[async_trait]
pub trait BundlerApi: Send + Sync {
    /// Validates an operation and admits it into the pending pool.
    async fn admit(&self, op: VersionedUserOperation) -> Result<UserOpHash, PoolError>;

    /// Runs validation without touching the pool.
    async fn simulate_validation(
        &self,
        op: VersionedUserOperation,
    ) -> Result<ValidationOutcome, PoolError>;

    async fn dump_pool(&self) -> Vec<PoolEntry>;

    fn dump_reputation(&self) -> Vec<ReputationSummary>;

    fn set_reputation(&self, address: Address, ops_seen: u64, ops_included: u64);

    /// Debug reset: drops every pool entry and reputation record.
    async fn clear_state(&self) -> Result<(), PoolError>;

    fn set_bundling_mode(&self, mode: BundlingMode);

    fn set_bundling_interval(&self, interval: Duration);

    /// Builds and submits one bundle immediately, regardless of mode.
    async fn send_bundle_now(&self) -> Result<Option<TxHash>, PoolError>;

    fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent>;
}

#[async_trait]
impl BundlerApi for BundlerService {
    async fn admit(&self, op: VersionedUserOperation) -> Result<UserOpHash, PoolError> {
        if let Err(err) = op.precheck() {
            self.metrics.ops_rejected.increment(1);
            return Err(err);
        }
        let outcome = match self.validator.validate(&op, None).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.metrics.ops_rejected.increment(1);
                return Err(err);
            }
        };
        let entry = PoolEntry::new(
            self.pool.chain_id(),
            op,
            self.pool.entry_point(),
            outcome.code_hash,
            outcome.aggregator_info.as_ref().map(|a| a.address),
            Utc::now(),
        );
        match self.pool.admit(entry, &outcome).await {
            Ok(hash) => {
                self.metrics.ops_admitted.increment(1);
                Ok(hash)
            }
            Err(err) => {
                self.metrics.ops_rejected.increment(1);
                Err(err)
            }
        }
    }

    async fn simulate_validation(
        &self,
        op: VersionedUserOperation,
    ) -> Result<ValidationOutcome, PoolError> {
        self.validator.validate(&op, None).await
    }

    async fn dump_pool(&self) -> Vec<PoolEntry> {
        self.pool.dump().await
    }

    fn dump_reputation(&self) -> Vec<ReputationSummary> {
        self.reputation.dump()
    }

    fn set_reputation(&self, address: Address, ops_seen: u64, ops_included: u64) {
        self.reputation.set_reputation(address, ops_seen, ops_included);
    }

    async fn clear_state(&self) -> Result<(), PoolError> {
        self.pool.clear().await?;
        self.reputation.clear();
        Ok(())
    }

    fn set_bundling_mode(&self, mode: BundlingMode) {
        BundlerService::set_bundling_mode(self, mode);
    }

    fn set_bundling_interval(&self, interval: Duration) {
        BundlerService::set_bundling_interval(self, interval);
    }

    async fn send_bundle_now(&self) -> Result<Option<TxHash>, PoolError> {
        self.send_next_bundle().await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.pool.subscribe()
    }
}
