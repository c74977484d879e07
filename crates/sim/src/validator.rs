use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use alloy_primitives::{Address, B256, keccak256};
use async_trait::async_trait;
use chrono::Utc;
use gantry_provider::{CallResult, EntryPointCodec, EthRpc, SimulatedValidation, ValidationTrace};
use gantry_reputation::ReputationTracker;
use gantry_types::{
    PoolError, StakeInfo, StorageAccess, StorageMap, ValidationOutcome, VersionedUserOperation,
};
use tracing::debug;

use crate::rules;

#[derive(Debug, Clone, Copy)]
pub struct ValidatorConfig {
    pub entry_point: Address,
    /// How far past now the validity window must still extend.
    pub time_window_slack_secs: u64,
}

impl ValidatorConfig {
    pub fn new(entry_point: Address) -> Self {
        Self {
            entry_point,
            time_window_slack_secs: 30,
        }
    }
}

/// Decides whether an operation is admissible, and re-checks members at
/// bundle time. `expected_code_hash` pins the bytecode digest recorded at
/// admission; a mismatch means a referenced contract changed underneath us.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(
        &self,
        op: &VersionedUserOperation,
        expected_code_hash: Option<B256>,
    ) -> Result<ValidationOutcome, PoolError>;
}

/// Single simulation round-trip with no tracing. Only for private mempools
/// where every submitter is trusted; it cannot see opcode or storage abuse.
pub struct UnsafeValidator {
    rpc: Arc<dyn EthRpc>,
    codec: Arc<dyn EntryPointCodec>,
    config: ValidatorConfig,
}

impl UnsafeValidator {
    pub fn new(
        rpc: Arc<dyn EthRpc>,
        codec: Arc<dyn EntryPointCodec>,
        config: ValidatorConfig,
    ) -> Self {
        Self { rpc, codec, config }
    }
}

#[async_trait]
impl Validator for UnsafeValidator {
    async fn validate(
        &self,
        op: &VersionedUserOperation,
        expected_code_hash: Option<B256>,
    ) -> Result<ValidationOutcome, PoolError> {
        let data = self.codec.encode_simulate_validation(op);
        let payload = match self
            .rpc
            .call(self.config.entry_point, data)
            .await
            .map_err(|e| PoolError::Internal(e.to_string()))?
        {
            // The v0.6 entry point reports the result by reverting.
            CallResult::Return(data) | CallResult::Revert(data) => data,
        };
        let sim = self
            .codec
            .decode_validation_result(&payload)
            .map_err(|e| PoolError::ExecutionReverted(e.to_string()))?;
        finalize(
            &self.config,
            sim,
            StorageMap::new(),
            B256::ZERO,
            expected_code_hash,
        )
    }
}

/// Full validation: replays the simulation under the bundler tracer and
/// enforces the mempool safety rules on the observed execution.
pub struct SafeValidator {
    rpc: Arc<dyn EthRpc>,
    codec: Arc<dyn EntryPointCodec>,
    reputation: Arc<ReputationTracker>,
    config: ValidatorConfig,
}

impl SafeValidator {
    pub fn new(
        rpc: Arc<dyn EthRpc>,
        codec: Arc<dyn EntryPointCodec>,
        reputation: Arc<ReputationTracker>,
        config: ValidatorConfig,
    ) -> Self {
        Self {
            rpc,
            codec,
            reputation,
            config,
        }
    }

    /// Digest over the bytecode of every contract the validation touched,
    /// order-independent: keccak over sorted (address, keccak(code)) pairs.
    async fn code_digest(&self, trace: &ValidationTrace) -> Result<B256, PoolError> {
        let mut addresses = BTreeSet::new();
        for frame in &trace.calls_from_entry_point {
            addresses.insert(frame.top_level_target_address);
            addresses.extend(frame.access.keys().copied());
            addresses.extend(frame.contract_size.keys().copied());
        }
        let mut buf = Vec::with_capacity(addresses.len() * 52);
        for address in addresses {
            let code = self
                .rpc
                .get_code(address)
                .await
                .map_err(|e| PoolError::Internal(e.to_string()))?;
            buf.extend_from_slice(address.as_slice());
            buf.extend_from_slice(keccak256(&code).as_slice());
        }
        Ok(keccak256(&buf))
    }
}

#[async_trait]
impl Validator for SafeValidator {
    async fn validate(
        &self,
        op: &VersionedUserOperation,
        expected_code_hash: Option<B256>,
    ) -> Result<ValidationOutcome, PoolError> {
        let data = self.codec.encode_simulate_validation(op);
        let trace = self
            .rpc
            .trace_validation(self.config.entry_point, data)
            .await
            .map_err(|e| PoolError::TracingUnavailable(e.to_string()))?;

        // The simulation result rides on the final top-level revert.
        let payload = trace
            .calls
            .iter()
            .rev()
            .find(|c| c.op == "REVERT")
            .and_then(|c| c.data.clone())
            .ok_or_else(|| {
                PoolError::ExecutionReverted("validation produced no result".to_owned())
            })?;
        let sim = self
            .codec
            .decode_validation_result(&payload)
            .map_err(|e| PoolError::ExecutionReverted(e.to_string()))?;

        let stakes = stake_map(op, &sim);
        rules::check_trace(
            op,
            self.config.entry_point,
            &trace,
            &self.reputation,
            &stakes,
        )?;

        // A context would make postOp behavior depend on mutable paymaster
        // state; only staked paymasters may carry one.
        if let Some(paymaster) = op.paymaster() {
            let staked = sim.paymaster_info.as_ref().is_some_and(|i| i.is_staked());
            if !staked && !sim.return_info.paymaster_context.is_empty() {
                return Err(PoolError::RejectedByPaymaster(
                    paymaster,
                    "unstaked paymaster returned a context".to_owned(),
                ));
            }
        }

        let code_hash = self.code_digest(&trace).await?;
        let storage_map = storage_map_from(&trace);
        debug!(sender = %op.sender(), %code_hash, "validation passed");
        finalize(&self.config, sim, storage_map, code_hash, expected_code_hash)
    }
}

fn finalize(
    config: &ValidatorConfig,
    sim: SimulatedValidation,
    storage_map: StorageMap,
    code_hash: B256,
    expected_code_hash: Option<B256>,
) -> Result<ValidationOutcome, PoolError> {
    if sim.return_info.sig_failed {
        return Err(PoolError::SignatureInvalid {
            aggregator: sim.aggregator_info.as_ref().map(|a| a.address),
        });
    }
    check_time_window(
        sim.return_info.valid_after,
        sim.return_info.valid_until,
        Utc::now().timestamp() as u64,
        config.time_window_slack_secs,
    )?;
    if let Some(expected) = expected_code_hash {
        if expected != code_hash {
            return Err(PoolError::CodeChanged);
        }
    }
    Ok(ValidationOutcome {
        return_info: sim.return_info,
        sender_info: sim.sender_info,
        factory_info: sim.factory_info,
        paymaster_info: sim.paymaster_info,
        aggregator_info: sim.aggregator_info,
        storage_map,
        code_hash,
    })
}

fn check_time_window(
    valid_after: u64,
    valid_until: u64,
    now: u64,
    slack: u64,
) -> Result<(), PoolError> {
    // valid_until == 0 means unbounded.
    let expires_too_soon = valid_until != 0 && valid_until < now + slack;
    if valid_after > now || expires_too_soon {
        return Err(PoolError::Expired {
            valid_after,
            valid_until,
            now,
        });
    }
    Ok(())
}

fn stake_map(op: &VersionedUserOperation, sim: &SimulatedValidation) -> HashMap<Address, StakeInfo> {
    let mut stakes = HashMap::new();
    stakes.insert(op.sender(), sim.sender_info);
    if let (Some(factory), Some(info)) = (op.factory(), sim.factory_info) {
        stakes.insert(factory, info);
    }
    if let (Some(paymaster), Some(info)) = (op.paymaster(), sim.paymaster_info) {
        stakes.insert(paymaster, info);
    }
    if let Some(aggregator) = &sim.aggregator_info {
        stakes.insert(aggregator.address, aggregator.stake_info);
    }
    stakes
}

/// Slot values observed during validation, keyed by contract. Written slots
/// without an observed read carry a zero value.
fn storage_map_from(trace: &ValidationTrace) -> StorageMap {
    let mut map = StorageMap::new();
    for frame in &trace.calls_from_entry_point {
        for (contract, access) in &frame.access {
            let entry = map
                .entry(*contract)
                .or_insert_with(|| StorageAccess::Slots(HashMap::new()));
            if let StorageAccess::Slots(slots) = entry {
                for (slot, value) in &access.reads {
                    slots.insert(*slot, *value);
                }
                for slot in access.writes.keys() {
                    slots.entry(*slot).or_insert(B256::ZERO);
                }
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Bytes, U256, address};
    use alloy_rpc_types::erc4337;
    use gantry_provider::test_utils::{StubCodec, StubEthRpc};
    use gantry_provider::{AccessInfo, CallRecord, EntityFrame};
    use gantry_types::ReturnInfo;

    const ENTRY_POINT: Address = address!("5ff137d4b0fdcd49dca30c7cf57e578a026d2789");
    const SENDER: Address = address!("1111111111111111111111111111111111111111");
    const FACTORY: Address = address!("2222222222222222222222222222222222222222");
    const PAYMASTER: Address = address!("3333333333333333333333333333333333333333");

    fn op(factory: Option<Address>, paymaster: Option<Address>) -> VersionedUserOperation {
        let as_bytes =
            |a: Option<Address>| a.map(|a| Bytes::copy_from_slice(a.as_slice())).unwrap_or_default();
        VersionedUserOperation::UserOperation(erc4337::UserOperation {
            sender: SENDER,
            nonce: U256::ZERO,
            init_code: as_bytes(factory),
            call_data: Bytes::default(),
            call_gas_limit: U256::from(100_000),
            verification_gas_limit: U256::from(150_000),
            pre_verification_gas: U256::from(21_000),
            max_fee_per_gas: U256::from(30),
            max_priority_fee_per_gas: U256::from(2),
            paymaster_and_data: as_bytes(paymaster),
            signature: Bytes::default(),
        })
    }

    fn frame(target: Address) -> EntityFrame {
        EntityFrame {
            top_level_target_address: target,
            ..Default::default()
        }
    }

    fn result_revert() -> CallRecord {
        CallRecord {
            op: "REVERT".to_owned(),
            data: Some(Bytes::from(vec![1u8])),
            ..Default::default()
        }
    }

    fn trace_with(frames: Vec<EntityFrame>) -> ValidationTrace {
        ValidationTrace {
            calls_from_entry_point: frames,
            calls: vec![result_revert()],
            keccak: Vec::new(),
        }
    }

    fn safe_validator(rpc: Arc<StubEthRpc>, codec: Arc<StubCodec>) -> SafeValidator {
        SafeValidator::new(
            rpc,
            codec,
            Arc::new(ReputationTracker::default()),
            ValidatorConfig::new(ENTRY_POINT),
        )
    }

    fn staked(address: Address) -> StakeInfo {
        StakeInfo {
            address,
            stake: U256::from(1_000_000_000u64),
            unstake_delay_sec: 86_400,
            deposit: U256::from(1_000_000_000u64),
        }
    }

    #[tokio::test]
    async fn accepts_a_clean_trace() {
        let rpc = Arc::new(StubEthRpc::default());
        let codec = Arc::new(StubCodec::default());
        rpc.push_trace(trace_with(vec![frame(SENDER)]));
        codec.push_validation(SimulatedValidation::default());

        let outcome = safe_validator(rpc, codec)
            .validate(&op(None, None), None)
            .await
            .unwrap();
        assert_ne!(outcome.code_hash, B256::ZERO);
    }

    #[tokio::test]
    async fn banned_opcode_in_sender_frame() {
        let rpc = Arc::new(StubEthRpc::default());
        let codec = Arc::new(StubCodec::default());
        let mut f = frame(SENDER);
        f.opcodes.insert("TIMESTAMP".to_owned(), 1);
        rpc.push_trace(trace_with(vec![f]));
        codec.push_validation(SimulatedValidation::default());

        let err = safe_validator(rpc, codec)
            .validate(&op(None, None), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PoolError::OpcodeViolation { ref opcode, .. } if opcode == "TIMESTAMP"
        ));
    }

    #[tokio::test]
    async fn create2_allowed_only_in_the_factory_frame() {
        let rpc = Arc::new(StubEthRpc::default());
        let codec = Arc::new(StubCodec::default());
        let mut factory_frame = frame(FACTORY);
        factory_frame.opcodes.insert("CREATE2".to_owned(), 1);
        rpc.push_trace(trace_with(vec![factory_frame, frame(SENDER)]));
        codec.push_validation(SimulatedValidation::default());
        safe_validator(rpc.clone(), codec.clone())
            .validate(&op(Some(FACTORY), None), None)
            .await
            .unwrap();

        let mut sender_frame = frame(SENDER);
        sender_frame.opcodes.insert("CREATE2".to_owned(), 1);
        rpc.push_trace(trace_with(vec![sender_frame]));
        codec.push_validation(SimulatedValidation::default());
        let err = safe_validator(rpc, codec)
            .validate(&op(None, None), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PoolError::OpcodeViolation { ref opcode, .. } if opcode == "CREATE2"
        ));
    }

    #[tokio::test]
    async fn unassociated_storage_needs_stake() {
        let foreign = address!("9999999999999999999999999999999999999999");
        let slot = B256::with_last_byte(7);
        let mut paymaster_frame = frame(PAYMASTER);
        paymaster_frame.access.insert(
            foreign,
            AccessInfo {
                reads: HashMap::from([(slot, B256::ZERO)]),
                writes: HashMap::new(),
            },
        );

        let rpc = Arc::new(StubEthRpc::default());
        let codec = Arc::new(StubCodec::default());
        rpc.push_trace(trace_with(vec![paymaster_frame.clone()]));
        codec.push_validation(SimulatedValidation::default());
        let err = safe_validator(rpc.clone(), codec.clone())
            .validate(&op(None, Some(PAYMASTER)), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PoolError::UnassociatedStorage { address, .. } if address == foreign
        ));

        // The same access is fine once the paymaster is staked.
        rpc.push_trace(trace_with(vec![paymaster_frame]));
        codec.push_validation(SimulatedValidation {
            paymaster_info: Some(staked(PAYMASTER)),
            ..Default::default()
        });
        safe_validator(rpc, codec)
            .validate(&op(None, Some(PAYMASTER)), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn value_calls_may_only_pay_the_entry_point() {
        let rpc = Arc::new(StubEthRpc::default());
        let codec = Arc::new(StubCodec::default());
        let mut trace = trace_with(vec![frame(SENDER)]);
        trace.calls.insert(
            0,
            CallRecord {
                op: "CALL".to_owned(),
                from: SENDER,
                to: ENTRY_POINT,
                value: Some(U256::from(1)),
                data: None,
            },
        );
        rpc.push_trace(trace);
        codec.push_validation(SimulatedValidation::default());
        safe_validator(rpc.clone(), codec.clone())
            .validate(&op(None, None), None)
            .await
            .unwrap();

        let mut trace = trace_with(vec![frame(SENDER)]);
        trace.calls.insert(
            0,
            CallRecord {
                op: "CALL".to_owned(),
                from: SENDER,
                to: PAYMASTER,
                value: Some(U256::from(1)),
                data: None,
            },
        );
        rpc.push_trace(trace);
        codec.push_validation(SimulatedValidation::default());
        let err = safe_validator(rpc, codec)
            .validate(&op(None, None), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::CallWithValue { to, .. } if to == PAYMASTER));
    }

    #[tokio::test]
    async fn tracing_failure_is_not_a_validation_verdict() {
        let rpc = Arc::new(StubEthRpc::default());
        rpc.push_trace_error("debug_traceCall not supported");
        let err = safe_validator(rpc, Arc::new(StubCodec::default()))
            .validate(&op(None, None), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::TracingUnavailable(_)));
    }

    #[tokio::test]
    async fn missing_result_revert_is_an_execution_failure() {
        let rpc = Arc::new(StubEthRpc::default());
        let mut trace = trace_with(vec![frame(SENDER)]);
        trace.calls.clear();
        rpc.push_trace(trace);
        let err = safe_validator(rpc, Arc::new(StubCodec::default()))
            .validate(&op(None, None), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::ExecutionReverted(_)));
    }

    #[tokio::test]
    async fn signature_failure_is_rejected() {
        let rpc = Arc::new(StubEthRpc::default());
        let codec = Arc::new(StubCodec::default());
        rpc.push_trace(trace_with(vec![frame(SENDER)]));
        codec.push_validation(SimulatedValidation {
            return_info: ReturnInfo {
                sig_failed: true,
                ..Default::default()
            },
            ..Default::default()
        });
        let err = safe_validator(rpc, codec)
            .validate(&op(None, None), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::SignatureInvalid { aggregator: None }));
    }

    #[tokio::test]
    async fn expired_window_is_rejected() {
        let rpc = Arc::new(StubEthRpc::default());
        let codec = Arc::new(StubCodec::default());
        rpc.push_trace(trace_with(vec![frame(SENDER)]));
        codec.push_validation(SimulatedValidation {
            return_info: ReturnInfo {
                valid_until: 10,
                ..Default::default()
            },
            ..Default::default()
        });
        let err = safe_validator(rpc, codec)
            .validate(&op(None, None), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Expired { valid_until: 10, .. }));
    }

    #[tokio::test]
    async fn code_digest_pins_referenced_bytecode() {
        let rpc = Arc::new(StubEthRpc::default());
        let codec = Arc::new(StubCodec::default());
        rpc.push_trace(trace_with(vec![frame(SENDER)]));
        codec.push_validation(SimulatedValidation::default());
        let validator = safe_validator(rpc.clone(), codec.clone());
        let outcome = validator.validate(&op(None, None), None).await.unwrap();

        // Same code: re-validation under the pinned digest passes.
        rpc.push_trace(trace_with(vec![frame(SENDER)]));
        codec.push_validation(SimulatedValidation::default());
        validator
            .validate(&op(None, None), Some(outcome.code_hash))
            .await
            .unwrap();

        // Upgraded account contract: digest moves, re-validation fails.
        rpc.set_code(SENDER, Bytes::from(vec![0x60, 0x01]));
        rpc.push_trace(trace_with(vec![frame(SENDER)]));
        codec.push_validation(SimulatedValidation::default());
        let err = validator
            .validate(&op(None, None), Some(outcome.code_hash))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::CodeChanged));
    }

    #[tokio::test]
    async fn unstaked_paymaster_must_not_return_context() {
        let rpc = Arc::new(StubEthRpc::default());
        let codec = Arc::new(StubCodec::default());
        rpc.push_trace(trace_with(vec![frame(PAYMASTER), frame(SENDER)]));
        codec.push_validation(SimulatedValidation {
            return_info: ReturnInfo {
                paymaster_context: Bytes::from(vec![1, 2, 3]),
                ..Default::default()
            },
            ..Default::default()
        });
        let err = safe_validator(rpc, codec)
            .validate(&op(None, Some(PAYMASTER)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::RejectedByPaymaster(p, _) if p == PAYMASTER));
    }

    #[tokio::test]
    async fn unsafe_validator_skips_tracing() {
        let rpc = Arc::new(StubEthRpc::default());
        let codec = Arc::new(StubCodec::default());
        rpc.push_call_result(CallResult::Revert(Bytes::from(vec![1])));
        codec.push_validation(SimulatedValidation::default());

        let validator =
            UnsafeValidator::new(rpc, codec, ValidatorConfig::new(ENTRY_POINT));
        let outcome = validator.validate(&op(None, None), None).await.unwrap();
        assert_eq!(outcome.code_hash, B256::ZERO);
        assert!(outcome.storage_map.is_empty());
    }
}
