use std::sync::Arc;
use std::time::Duration;

use alloy_consensus::TxEip1559;
use alloy_primitives::{Address, Bytes, TxKind, U256};
use async_trait::async_trait;
use gantry_provider::{CallResult, EntryPointCodec, EthRpc};
use gantry_types::{Bundle, Entity, EntityType, PoolError};
use tracing::warn;

use crate::identity::IdentityGuard;
use crate::report::{EntryOutcome, SubmissionReport};

/// Submits assembled bundles on-chain. Strategies differ in broadcast path
/// and post-broadcast guarantees, not in how bundles are built.
#[async_trait]
pub trait Relayer: Send + Sync {
    /// Whether an identity is free to take a bundle right now.
    fn can_submit(&self) -> bool;

    fn available_identities(&self) -> usize;

    async fn send_bundle(&self, bundle: Bundle) -> Result<SubmissionReport, PoolError>;
}

#[derive(Debug, Clone)]
pub struct RelayerConfig {
    pub chain_id: u64,
    pub entry_point: Address,
    /// Fee recipient for `handleOps`. `None` pays the submitting identity.
    pub beneficiary: Option<Address>,
    /// Identity balance under which fees are redirected to the identity
    /// itself so it can keep submitting.
    pub balance_floor: U256,
    pub max_confirm_attempts: u32,
    pub confirm_poll_interval: Duration,
    /// Use the conditional broadcast endpoint, attaching the bundle's
    /// storage map as inclusion preconditions.
    pub conditional: bool,
    /// Ceiling on how long a private-relay submission keeps re-targeting
    /// new blocks before requeueing its entries.
    pub submission_timeout: Duration,
}

impl RelayerConfig {
    pub fn new(chain_id: u64, entry_point: Address) -> Self {
        Self {
            chain_id,
            entry_point,
            beneficiary: None,
            balance_floor: U256::from(10u64.pow(17)),
            max_confirm_attempts: 10,
            confirm_poll_interval: Duration::from_secs(2),
            conditional: false,
            submission_timeout: Duration::from_secs(180),
        }
    }
}

/// Fee recipient for this submission: the configured beneficiary, unless the
/// identity's own balance has fallen under the floor.
pub(crate) async fn resolve_beneficiary(
    rpc: &dyn EthRpc,
    config: &RelayerConfig,
    identity: &IdentityGuard,
) -> Result<Address, PoolError> {
    let Some(beneficiary) = config.beneficiary else {
        return Ok(identity.address());
    };
    let balance = rpc
        .get_balance(identity.address())
        .await
        .map_err(|e| PoolError::Internal(e.to_string()))?;
    if balance < config.balance_floor {
        warn!(identity = %identity.address(), %balance, "identity balance low, taking fees");
        return Ok(identity.address());
    }
    Ok(beneficiary)
}

/// Dry-runs the bundle transaction. `Ok(None)` means the bundle would
/// execute; `Ok(Some(report))` means the entry point rejected a member and
/// the bundle must not be broadcast.
pub(crate) async fn dry_run(
    rpc: &dyn EthRpc,
    codec: &dyn EntryPointCodec,
    config: &RelayerConfig,
    bundle: &Bundle,
    data: Bytes,
) -> Result<Option<SubmissionReport>, PoolError> {
    let payload = match rpc
        .call(config.entry_point, data)
        .await
        .map_err(|e| PoolError::Internal(e.to_string()))?
    {
        CallResult::Return(_) => return Ok(None),
        CallResult::Revert(payload) => payload,
    };
    let Some(failed) = codec.decode_failed_op(&payload) else {
        return Err(PoolError::ExecutionReverted(format!(
            "handleOps dry run reverted: 0x{}",
            alloy_primitives::hex::encode(&payload)
        )));
    };
    let Some(culprit) = bundle.entries.get(failed.index) else {
        return Err(PoolError::Internal(format!(
            "FailedOp index {} out of range for bundle of {}",
            failed.index,
            bundle.len()
        )));
    };

    // The entity whose on-chain behavior sank the bundle gets penalized;
    // everyone else simply rides the next one.
    let mut penalties = Vec::new();
    if failed.is_factory_fault() {
        if let Some(factory) = culprit.factory {
            penalties.push(Entity::new(EntityType::Factory, factory));
        }
    }
    if failed.is_paymaster_fault() {
        if let Some(paymaster) = culprit.paymaster {
            penalties.push(Entity::new(EntityType::Paymaster, paymaster));
        }
    }
    let outcomes = bundle
        .entries
        .iter()
        .map(|entry| {
            let outcome = if entry.id() == culprit.id() {
                EntryOutcome::Failed {
                    reason: failed.reason.clone(),
                }
            } else {
                EntryOutcome::Requeued
            };
            (entry.id(), outcome)
        })
        .collect();
    Ok(Some(SubmissionReport {
        tx_hash: None,
        outcomes,
        penalties,
    }))
}

pub(crate) async fn build_transaction(
    rpc: &dyn EthRpc,
    config: &RelayerConfig,
    identity: &IdentityGuard,
    bundle: &Bundle,
    data: Bytes,
) -> Result<TxEip1559, PoolError> {
    let nonce = rpc
        .get_transaction_count(identity.address())
        .await
        .map_err(|e| PoolError::Internal(e.to_string()))?;
    let gas_limit = rpc
        .estimate_gas(config.entry_point, data.clone())
        .await
        .map_err(|e| PoolError::Internal(e.to_string()))?;
    Ok(TxEip1559 {
        chain_id: config.chain_id,
        nonce,
        gas_limit,
        max_fee_per_gas: bundle.gas_fees.max_fee_per_gas.saturating_to(),
        max_priority_fee_per_gas: bundle.gas_fees.max_priority_fee_per_gas.saturating_to(),
        to: TxKind::Call(config.entry_point),
        value: U256::ZERO,
        access_list: Default::default(),
        input: data,
    })
}

pub(crate) async fn broadcast(
    rpc: &dyn EthRpc,
    config: &RelayerConfig,
    bundle: &Bundle,
    raw: Bytes,
) -> Result<alloy_primitives::TxHash, PoolError> {
    let result = if config.conditional {
        rpc.send_raw_transaction_conditional(raw, &bundle.storage_map)
            .await
    } else {
        rpc.send_raw_transaction(raw).await
    };
    result.map_err(|e| PoolError::Internal(e.to_string()))
}

pub(crate) fn encode_bundle(
    codec: &dyn EntryPointCodec,
    bundle: &Bundle,
    beneficiary: Address,
) -> Bytes {
    let ops: Vec<_> = bundle.entries.iter().map(|e| e.operation.clone()).collect();
    codec.encode_handle_ops(&ops, beneficiary)
}

pub(crate) fn no_identity() -> PoolError {
    PoolError::Internal("no submission identity available".to_owned())
}

pub(crate) type SharedRpc = Arc<dyn EthRpc>;
pub(crate) type SharedCodec = Arc<dyn EntryPointCodec>;
