use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use gantry_pool::{StatusChange, UoPool};
use gantry_provider::{EthRpc, FeeOracle};
use gantry_reputation::{ReputationStatus, ReputationTracker};
use gantry_sim::Validator;
use gantry_types::{
    Bundle, Entity, EntityType, EntryStatus, GasFees, PoolEntry, PoolError, StorageAccess,
    StorageMap, merge_storage_maps,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ProposerConfig {
    pub max_bundle_gas: U256,
    /// Skip members whose fees undercut the current network estimate.
    pub enforce_min_fees: bool,
    /// Take the oracle estimate as the bundle fee unconditionally, for
    /// chains whose nodes reprice rather than reject.
    pub oracle_fee_direct: bool,
    /// Entries referencing one throttled entity allowed per bundle.
    pub throttled_entity_bundle_count: u64,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self {
            max_bundle_gas: U256::from(10_000_000u64),
            enforce_min_fees: true,
            oracle_fee_direct: false,
            throttled_entity_bundle_count: 4,
        }
    }
}

/// Assembles the next bundle from the pending pool: a fee-descending scan
/// that re-validates each candidate and skips anything that cannot share a
/// transaction with the members already chosen.
pub struct BundleProposer {
    pool: Arc<UoPool>,
    validator: Arc<dyn Validator>,
    rpc: Arc<dyn EthRpc>,
    fee_oracle: Arc<dyn FeeOracle>,
    reputation: Arc<ReputationTracker>,
    config: ProposerConfig,
}

impl BundleProposer {
    pub fn new(
        pool: Arc<UoPool>,
        validator: Arc<dyn Validator>,
        rpc: Arc<dyn EthRpc>,
        fee_oracle: Arc<dyn FeeOracle>,
        reputation: Arc<ReputationTracker>,
        config: ProposerConfig,
    ) -> Self {
        Self {
            pool,
            validator,
            rpc,
            fee_oracle,
            reputation,
            config,
        }
    }

    /// Builds the next bundle, or `None` when nothing qualifies. Selected
    /// entries are moved to `Pending` before the bundle is handed out.
    pub async fn propose(&self) -> Result<Option<Bundle>, PoolError> {
        let oracle_fees = self
            .fee_oracle
            .estimate()
            .await
            .map_err(|e| PoolError::Internal(e.to_string()))?;
        let pending = self.pool.pending_sorted_by_fee().await;
        if pending.is_empty() {
            return Ok(None);
        }

        let mut selected: Vec<PoolEntry> = Vec::new();
        let mut senders: HashSet<Address> = HashSet::new();
        let mut storage_map = StorageMap::new();
        let mut gas = U256::ZERO;
        let mut deposits: HashMap<Address, U256> = HashMap::new();
        let mut paymaster_spend: HashMap<Address, U256> = HashMap::new();
        let mut throttled_in_bundle: HashMap<Address, u64> = HashMap::new();

        'scan: for entry in pending {
            let sender = entry.operation.sender();
            if senders.contains(&sender) {
                continue;
            }
            let entry_gas = entry.operation.call_gas_limit()
                + entry.operation.verification_gas_limit()
                + entry.operation.pre_verification_gas();
            if gas + entry_gas > self.config.max_bundle_gas {
                continue;
            }
            if self.config.enforce_min_fees
                && !self.config.oracle_fee_direct
                && (entry.operation.max_fee_per_gas() < oracle_fees.max_fee_per_gas
                    || entry.operation.max_priority_fee_per_gas()
                        < oracle_fees.max_priority_fee_per_gas)
            {
                continue;
            }

            for entity in referenced_entities(&entry) {
                match self.reputation.status(entity.address) {
                    ReputationStatus::Banned => {
                        // A banned entity invalidates the entry outright.
                        warn!(id = %entry.id(), %entity, "removing entry of banned entity");
                        self.pool.remove(&entry.id()).await?;
                        continue 'scan;
                    }
                    ReputationStatus::Throttled => {
                        let count =
                            throttled_in_bundle.entry(entity.address).or_insert(0);
                        if *count >= self.config.throttled_entity_bundle_count {
                            continue 'scan;
                        }
                        *count += 1;
                    }
                    ReputationStatus::Ok => {}
                }
            }

            // Anything can have happened on-chain since admission.
            let outcome = match self
                .validator
                .validate(&entry.operation, Some(entry.code_hash))
                .await
            {
                Ok(outcome) => outcome,
                Err(err @ PoolError::TracingUnavailable(_)) => return Err(err),
                Err(err) => {
                    debug!(id = %entry.id(), %err, "re-validation failed, cancelling");
                    self.pool
                        .update_status(vec![
                            StatusChange::new(entry.id(), EntryStatus::Cancelled)
                                .with_reason(err.to_string()),
                        ])
                        .await?;
                    continue;
                }
            };

            if conflicts(&storage_map, &outcome.storage_map) {
                // Defer to the next bundle rather than risk a mid-bundle
                // storage race between members.
                debug!(id = %entry.id(), "storage conflict with selected members");
                continue;
            }

            if let Some(paymaster) = entry.paymaster {
                let deposit = match deposits.get(&paymaster) {
                    Some(deposit) => *deposit,
                    None => {
                        let deposit = self
                            .rpc
                            .deposit_of(self.pool.entry_point(), paymaster)
                            .await
                            .map_err(|e| PoolError::Internal(e.to_string()))?;
                        deposits.insert(paymaster, deposit);
                        deposit
                    }
                };
                let spend = paymaster_spend.entry(paymaster).or_insert(U256::ZERO);
                if *spend + entry.prefund > deposit {
                    debug!(id = %entry.id(), %paymaster, "paymaster deposit exhausted");
                    continue;
                }
                *spend += entry.prefund;
            }

            merge_storage_maps(&mut storage_map, &outcome.storage_map);
            gas += entry_gas;
            senders.insert(sender);
            selected.push(entry);
        }

        if selected.is_empty() {
            return Ok(None);
        }

        let gas_fees = if self.config.oracle_fee_direct {
            oracle_fees
        } else {
            mean_fees(&selected, oracle_fees)
        };
        self.pool
            .update_status(
                selected
                    .iter()
                    .map(|e| StatusChange::new(e.id(), EntryStatus::Pending))
                    .collect(),
            )
            .await?;
        info!(entries = selected.len(), %gas, "bundle proposed");
        Ok(Some(Bundle {
            entries: selected,
            storage_map,
            gas_fees,
        }))
    }
}

/// Arithmetic mean of the members' fees, capped by the network estimate.
fn mean_fees(entries: &[PoolEntry], cap: GasFees) -> GasFees {
    let len = U256::from(entries.len());
    let (sum_max, sum_priority) = entries.iter().fold(
        (U256::ZERO, U256::ZERO),
        |(max, priority), e| {
            (
                max + e.operation.max_fee_per_gas(),
                priority + e.operation.max_priority_fee_per_gas(),
            )
        },
    );
    GasFees {
        max_fee_per_gas: (sum_max / len).min(cap.max_fee_per_gas),
        max_priority_fee_per_gas: (sum_priority / len).min(cap.max_priority_fee_per_gas),
    }
}

fn conflicts(map: &StorageMap, other: &StorageMap) -> bool {
    other.iter().any(|(address, access)| {
        match (map.get(address), access) {
            (None, _) => false,
            (Some(StorageAccess::Slots(mine)), StorageAccess::Slots(theirs)) => {
                theirs.keys().any(|slot| mine.contains_key(slot))
            }
            // A root-hash marker on either side covers the whole account.
            _ => true,
        }
    })
}

fn referenced_entities(entry: &PoolEntry) -> Vec<Entity> {
    let mut entities = entry.operation.entities();
    if let Some(aggregator) = entry.aggregator {
        entities.push(Entity::new(EntityType::Aggregator, aggregator));
    }
    entities
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use alloy_primitives::{B256, Bytes, address};
    use alloy_rpc_types::erc4337;
    use async_trait::async_trait;
    use chrono::Utc;
    use gantry_pool::{InMemoryStore, PoolConfig};
    use gantry_provider::test_utils::{FixedFeeOracle, StubEthRpc};
    use gantry_types::{ValidationOutcome, VersionedUserOperation};
    use parking_lot::Mutex;

    use super::*;

    const CHAIN: u64 = 8453;
    const ENTRY_POINT: Address = address!("5ff137d4b0fdcd49dca30c7cf57e578a026d2789");

    /// [`Validator`] double: queued results pop in order, then clean passes.
    #[derive(Default)]
    struct StubValidator {
        results: Mutex<VecDeque<Result<ValidationOutcome, PoolError>>>,
    }

    impl StubValidator {
        fn push(&self, result: Result<ValidationOutcome, PoolError>) {
            self.results.lock().push_back(result);
        }
    }

    #[async_trait]
    impl Validator for StubValidator {
        async fn validate(
            &self,
            _op: &VersionedUserOperation,
            _expected_code_hash: Option<B256>,
        ) -> Result<ValidationOutcome, PoolError> {
            self.results
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(ValidationOutcome::default()))
        }
    }

    struct Fixture {
        pool: Arc<UoPool>,
        validator: Arc<StubValidator>,
        rpc: Arc<StubEthRpc>,
        reputation: Arc<ReputationTracker>,
        config: ProposerConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let reputation = Arc::new(ReputationTracker::default());
            Self {
                pool: Arc::new(UoPool::new(
                    PoolConfig::new(CHAIN, ENTRY_POINT),
                    reputation.clone(),
                    Arc::new(InMemoryStore::new()),
                )),
                validator: Arc::new(StubValidator::default()),
                rpc: Arc::new(StubEthRpc::default()),
                reputation,
                config: ProposerConfig::default(),
            }
        }

        fn proposer(&self) -> BundleProposer {
            BundleProposer::new(
                self.pool.clone(),
                self.validator.clone(),
                self.rpc.clone(),
                Arc::new(FixedFeeOracle::new(30, 2)),
                self.reputation.clone(),
                self.config.clone(),
            )
        }

        async fn admit(&self, entry: PoolEntry) {
            self.pool
                .admit(entry, &ValidationOutcome::default())
                .await
                .unwrap();
        }
    }

    fn entry(sender: Address, nonce: u64, priority_fee: u64) -> PoolEntry {
        entry_with_paymaster(sender, nonce, priority_fee, None)
    }

    fn entry_with_paymaster(
        sender: Address,
        nonce: u64,
        priority_fee: u64,
        paymaster: Option<Address>,
    ) -> PoolEntry {
        let op = VersionedUserOperation::UserOperation(erc4337::UserOperation {
            sender,
            nonce: U256::from(nonce),
            init_code: Bytes::default(),
            call_data: Bytes::default(),
            call_gas_limit: U256::from(100_000),
            verification_gas_limit: U256::from(150_000),
            pre_verification_gas: U256::from(21_000),
            max_fee_per_gas: U256::from(30),
            max_priority_fee_per_gas: U256::from(priority_fee),
            paymaster_and_data: paymaster
                .map(|p| Bytes::copy_from_slice(p.as_slice()))
                .unwrap_or_default(),
            signature: Bytes::default(),
        });
        PoolEntry::new(CHAIN, op, ENTRY_POINT, B256::ZERO, None, Utc::now())
    }

    fn slot_access(address: Address, slot: u8) -> StorageMap {
        StorageMap::from([(
            address,
            StorageAccess::Slots(HashMap::from([(B256::with_last_byte(slot), B256::ZERO)])),
        )])
    }

    #[tokio::test]
    async fn empty_pool_proposes_nothing() {
        let fx = Fixture::new();
        assert!(fx.proposer().propose().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dedupes_senders_and_marks_members_pending() {
        let fx = Fixture::new();
        fx.admit(entry(Address::repeat_byte(1), 0, 5)).await;
        fx.admit(entry(Address::repeat_byte(1), 1, 4)).await;
        fx.admit(entry(Address::repeat_byte(2), 0, 3)).await;

        let bundle = fx.proposer().propose().await.unwrap().unwrap();
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.entries[0].operation.sender(), Address::repeat_byte(1));
        assert_eq!(bundle.entries[1].operation.sender(), Address::repeat_byte(2));

        for member in &bundle.entries {
            let entry = fx.pool.find(&member.id()).await.unwrap();
            assert_eq!(entry.status, EntryStatus::Pending);
            assert_eq!(entry.submit_attempts, 1);
        }
        // The duplicate-sender entry stays eligible for the next bundle.
        let deferred = entry(Address::repeat_byte(1), 1, 4).id();
        assert_eq!(fx.pool.find(&deferred).await.unwrap().status, EntryStatus::New);
    }

    #[tokio::test]
    async fn underpriced_entries_are_skipped() {
        let fx = Fixture::new();
        fx.admit(entry(Address::repeat_byte(1), 0, 1)).await;
        assert!(fx.proposer().propose().await.unwrap().is_none());
        assert_eq!(fx.pool.pending_sorted_by_fee().await.len(), 1);
    }

    #[tokio::test]
    async fn banned_entity_entries_are_removed() {
        let fx = Fixture::new();
        let paymaster = Address::repeat_byte(9);
        let banned =
            entry_with_paymaster(Address::repeat_byte(1), 0, 5, Some(paymaster));
        let banned_id = banned.id();
        fx.admit(banned).await;
        fx.admit(entry(Address::repeat_byte(2), 0, 3)).await;
        fx.reputation.set_reputation(paymaster, 600, 0);

        let bundle = fx.proposer().propose().await.unwrap().unwrap();
        assert_eq!(bundle.len(), 1);
        assert_eq!(bundle.entries[0].operation.sender(), Address::repeat_byte(2));
        assert!(fx.pool.find(&banned_id).await.is_none());
    }

    #[tokio::test]
    async fn throttled_entity_capped_per_bundle() {
        let fx = Fixture::new();
        let paymaster = Address::repeat_byte(9);
        for n in 0..5u8 {
            fx.admit(entry_with_paymaster(
                Address::repeat_byte(n + 1),
                0,
                5,
                Some(paymaster),
            ))
            .await;
        }
        fx.reputation.set_reputation(paymaster, 200, 5);

        let bundle = fx.proposer().propose().await.unwrap().unwrap();
        assert_eq!(bundle.len(), 4);
    }

    #[tokio::test]
    async fn storage_conflicts_defer_the_later_entry() {
        let fx = Fixture::new();
        let contested = Address::repeat_byte(0xcc);
        fx.admit(entry(Address::repeat_byte(1), 0, 5)).await;
        fx.admit(entry(Address::repeat_byte(2), 0, 4)).await;
        fx.validator.push(Ok(ValidationOutcome {
            storage_map: slot_access(contested, 1),
            ..Default::default()
        }));
        fx.validator.push(Ok(ValidationOutcome {
            storage_map: slot_access(contested, 1),
            ..Default::default()
        }));

        let bundle = fx.proposer().propose().await.unwrap().unwrap();
        assert_eq!(bundle.len(), 1);
        assert_eq!(bundle.entries[0].operation.sender(), Address::repeat_byte(1));
        assert!(bundle.storage_map.contains_key(&contested));

        let deferred = entry(Address::repeat_byte(2), 0, 4).id();
        assert_eq!(fx.pool.find(&deferred).await.unwrap().status, EntryStatus::New);
    }

    #[tokio::test]
    async fn paymaster_deposit_bounds_the_bundle() {
        let fx = Fixture::new();
        let paymaster = Address::repeat_byte(9);
        fx.admit(entry_with_paymaster(Address::repeat_byte(1), 0, 5, Some(paymaster)))
            .await;
        fx.admit(entry_with_paymaster(Address::repeat_byte(2), 0, 4, Some(paymaster)))
            .await;
        // Covers one prefund ((3*150k + 100k + 21k) * 30) but not two.
        fx.rpc.set_deposit(paymaster, U256::from(20_000_000u64));

        let bundle = fx.proposer().propose().await.unwrap().unwrap();
        assert_eq!(bundle.len(), 1);
        assert_eq!(bundle.entries[0].operation.sender(), Address::repeat_byte(1));
    }

    #[tokio::test]
    async fn failed_revalidation_cancels_the_entry() {
        let fx = Fixture::new();
        let doomed = entry(Address::repeat_byte(1), 0, 5);
        let doomed_id = doomed.id();
        fx.admit(doomed).await;
        fx.validator.push(Err(PoolError::CodeChanged));

        assert!(fx.proposer().propose().await.unwrap().is_none());
        let entry = fx.pool.find(&doomed_id).await.unwrap();
        assert_eq!(entry.status, EntryStatus::Cancelled);
        assert!(entry.revert_reason.is_some());
    }

    #[tokio::test]
    async fn tracing_outage_aborts_the_proposal() {
        let fx = Fixture::new();
        fx.admit(entry(Address::repeat_byte(1), 0, 5)).await;
        fx.validator
            .push(Err(PoolError::TracingUnavailable("tracer down".into())));
        assert!(matches!(
            fx.proposer().propose().await,
            Err(PoolError::TracingUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn bundle_fees_are_the_capped_member_mean() {
        let fx = Fixture::new();
        fx.admit(entry(Address::repeat_byte(1), 0, 8)).await;
        fx.admit(entry(Address::repeat_byte(2), 0, 4)).await;

        let bundle = fx.proposer().propose().await.unwrap().unwrap();
        // Mean priority fee is 6, capped by the oracle's 2.
        assert_eq!(bundle.gas_fees.max_fee_per_gas, U256::from(30));
        assert_eq!(bundle.gas_fees.max_priority_fee_per_gas, U256::from(2));
    }

    #[tokio::test]
    async fn oracle_fee_direct_overrides_member_fees() {
        let mut fx = Fixture::new();
        fx.config.oracle_fee_direct = true;
        fx.admit(entry(Address::repeat_byte(1), 0, 8)).await;

        let bundle = fx.proposer().propose().await.unwrap().unwrap();
        assert_eq!(bundle.gas_fees.max_priority_fee_per_gas, U256::from(2));
        assert_eq!(bundle.gas_fees.max_fee_per_gas, U256::from(30));
    }
}
