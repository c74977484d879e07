use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy_primitives::TxHash;
use gantry_bundler::{BundleProposer, EntryOutcome, Relayer, SubmissionReport};
use gantry_pool::{StatusChange, UoPool};
use gantry_reputation::ReputationTracker;
use gantry_sim::Validator;
use gantry_types::{Bundle, EntryStatus, PoolError};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::metrics::BundlerMetrics;

/// Added to an entity's seen counter when its on-chain behavior rejected a
/// bundle. Large enough to land any record in the banned band.
const PENALTY_OPS_SEEN: u64 = 1_000;

/// Whether bundles are built on a timer or only on explicit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundlingMode {
    Manual,
    Auto,
}

impl FromStr for BundlingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown bundling mode: {other}")),
        }
    }
}

impl std::fmt::Display for BundlingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// Drives the pool through the bundling cycle: propose, submit, then fold
/// the submission report back into entry statuses and reputation. One cycle
/// runs at a time; the timer loop and manual triggers share a lock.
pub struct BundlerService {
    pub(crate) pool: Arc<UoPool>,
    pub(crate) validator: Arc<dyn Validator>,
    pub(crate) proposer: BundleProposer,
    pub(crate) relayer: Arc<dyn Relayer>,
    pub(crate) reputation: Arc<ReputationTracker>,
    pub(crate) metrics: BundlerMetrics,
    pub(crate) mode: Mutex<BundlingMode>,
    pub(crate) interval: Mutex<Duration>,
    max_submit_attempts: u32,
    cycle: tokio::sync::Mutex<()>,
}

impl BundlerService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<UoPool>,
        validator: Arc<dyn Validator>,
        proposer: BundleProposer,
        relayer: Arc<dyn Relayer>,
        reputation: Arc<ReputationTracker>,
        mode: BundlingMode,
        interval: Duration,
        max_submit_attempts: u32,
    ) -> Self {
        Self {
            pool,
            validator,
            proposer,
            relayer,
            reputation,
            metrics: BundlerMetrics::default(),
            mode: Mutex::new(mode),
            interval: Mutex::new(interval),
            max_submit_attempts,
            cycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Timer loop for automatic bundling. Runs until the task is dropped.
    pub async fn run(&self) {
        info!(mode = %*self.mode.lock(), "bundler service started");
        loop {
            let interval = *self.interval.lock();
            tokio::time::sleep(interval).await;

            if *self.mode.lock() != BundlingMode::Auto {
                continue;
            }

            // one bundle per free identity, stopping early when the pool
            // runs dry
            for _ in 0..self.relayer.available_identities() {
                match self.send_next_bundle().await {
                    Ok(Some(tx_hash)) => info!(%tx_hash, "bundle submitted"),
                    Ok(None) => break,
                    Err(err) => {
                        error!(error = %err, "bundling cycle failed");
                        break;
                    }
                }
            }

            if let Err(err) = self.pool.purge_archived().await {
                warn!(error = %err, "archive purge failed");
            }
            self.metrics.pool_size.set(self.pool.len().await as f64);
            self.metrics
                .available_identities
                .set(self.relayer.available_identities() as f64);
        }
    }

    /// One bundling cycle: build the next bundle, submit it, and settle the
    /// fate of every member. Returns the bundle transaction hash, or `None`
    /// when nothing qualified for bundling.
    pub async fn send_next_bundle(&self) -> Result<Option<TxHash>, PoolError> {
        let _cycle = self.cycle.lock().await;

        let started = Instant::now();
        let Some(bundle) = self.proposer.propose().await? else {
            return Ok(None);
        };
        self.metrics
            .bundle_build_duration
            .record(started.elapsed().as_secs_f64());
        self.metrics.bundle_size.record(bundle.len() as f64);

        match self.relayer.send_bundle(bundle.clone()).await {
            Ok(report) => {
                if report.tx_hash.is_some() {
                    self.metrics.bundles_submitted.increment(1);
                } else {
                    self.metrics.bundles_failed.increment(1);
                }
                self.apply_report(&report).await?;
                Ok(report.tx_hash)
            }
            Err(err) => {
                // The bundle never reached the network; its entries are
                // still good.
                self.metrics.bundles_failed.increment(1);
                self.requeue(&bundle).await?;
                Err(err)
            }
        }
    }

    async fn requeue(&self, bundle: &Bundle) -> Result<(), PoolError> {
        let changes = bundle
            .entries
            .iter()
            .map(|e| StatusChange::new(e.id(), EntryStatus::New))
            .collect();
        self.pool.update_status(changes).await?;
        Ok(())
    }

    /// Folds a submission report into the pool. Entries that landed walk
    /// `Pending -> Submitted -> OnChain` (or `Reverted`); requeued entries
    /// go back to `New` until their attempt budget runs out.
    async fn apply_report(&self, report: &SubmissionReport) -> Result<(), PoolError> {
        for entity in &report.penalties {
            warn!(%entity, "penalizing entity for rejecting a bundle");
            let summary = self.reputation.get(entity.address);
            self.reputation.set_reputation(
                entity.address,
                summary.ops_seen + PENALTY_OPS_SEEN,
                summary.ops_included,
            );
        }

        let mut broadcast_phase = Vec::new();
        let mut settle_phase = Vec::new();
        for (id, outcome) in &report.outcomes {
            match outcome {
                EntryOutcome::Included { tx_hash } => {
                    broadcast_phase.push(
                        StatusChange::new(*id, EntryStatus::Submitted).with_tx_hash(*tx_hash),
                    );
                    settle_phase.push(
                        StatusChange::new(*id, EntryStatus::OnChain).with_tx_hash(*tx_hash),
                    );
                    self.metrics.ops_included.increment(1);
                }
                EntryOutcome::Reverted { tx_hash, reason } => {
                    broadcast_phase.push(
                        StatusChange::new(*id, EntryStatus::Submitted).with_tx_hash(*tx_hash),
                    );
                    settle_phase.push(
                        StatusChange::new(*id, EntryStatus::Reverted)
                            .with_tx_hash(*tx_hash)
                            .with_reason(reason.clone()),
                    );
                }
                EntryOutcome::Failed { reason } | EntryOutcome::Dropped { reason } => {
                    settle_phase.push(
                        StatusChange::new(*id, EntryStatus::Cancelled)
                            .with_reason(reason.clone()),
                    );
                    self.metrics.ops_cancelled.increment(1);
                }
                EntryOutcome::Requeued => {
                    let exhausted = self
                        .pool
                        .find(id)
                        .await
                        .is_some_and(|e| e.submit_attempts >= self.max_submit_attempts);
                    if exhausted {
                        settle_phase.push(
                            StatusChange::new(*id, EntryStatus::Cancelled)
                                .with_reason("submission attempts exhausted"),
                        );
                        self.metrics.ops_cancelled.increment(1);
                    } else {
                        settle_phase.push(StatusChange::new(*id, EntryStatus::New));
                    }
                }
            }
        }
        self.pool.update_status(broadcast_phase).await?;
        self.pool.update_status(settle_phase).await?;
        Ok(())
    }

    pub fn bundling_mode(&self) -> BundlingMode {
        *self.mode.lock()
    }

    pub fn set_bundling_mode(&self, mode: BundlingMode) {
        info!(%mode, "bundling mode changed");
        *self.mode.lock() = mode;
    }

    pub fn set_bundling_interval(&self, interval: Duration) {
        info!(interval_ms = interval.as_millis() as u64, "bundling interval changed");
        *self.interval.lock() = interval;
    }
}
