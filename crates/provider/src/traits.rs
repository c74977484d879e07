use alloy_primitives::{Address, Bytes, TxHash, U256};
use async_trait::async_trait;
use gantry_types::{
    AggregatorInfo, GasFees, ReturnInfo, StakeInfo, StorageMap, VersionedUserOperation,
};
use tokio::sync::watch;

use crate::trace::ValidationTrace;

/// Outcome of an `eth_call`. Reverts carry the revert payload because the
/// v0.6 entry point reports validation results by reverting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallResult {
    Return(Bytes),
    Revert(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptInfo {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub success: bool,
}

/// New-head notifications. Receivers observe the latest block number.
pub type BlockFeed = watch::Receiver<u64>;

/// The ledger RPC surface this system consumes. One implementation speaks to
/// a real node; tests substitute doubles at this seam.
#[async_trait]
pub trait EthRpc: Send + Sync {
    async fn call(&self, to: Address, data: Bytes) -> anyhow::Result<CallResult>;

    async fn estimate_gas(&self, to: Address, data: Bytes) -> anyhow::Result<u64>;

    async fn get_balance(&self, address: Address) -> anyhow::Result<U256>;

    async fn get_code(&self, address: Address) -> anyhow::Result<Bytes>;

    async fn get_transaction_count(&self, address: Address) -> anyhow::Result<u64>;

    /// The entity's gas deposit held by the entry point.
    async fn deposit_of(&self, entry_point: Address, address: Address) -> anyhow::Result<U256>;

    async fn send_raw_transaction(&self, raw: Bytes) -> anyhow::Result<TxHash>;

    /// Conditional submission: the node drops the transaction unless the
    /// supplied storage values still hold at inclusion time.
    async fn send_raw_transaction_conditional(
        &self,
        raw: Bytes,
        known_accounts: &StorageMap,
    ) -> anyhow::Result<TxHash>;

    async fn get_transaction_receipt(&self, hash: TxHash)
        -> anyhow::Result<Option<ReceiptInfo>>;

    async fn latest_block_number(&self) -> anyhow::Result<u64>;

    /// Runs the validation entry-point call under the bundler tracer.
    /// Errors here mean tracing is unavailable, not that the operation is
    /// invalid.
    async fn trace_validation(
        &self,
        entry_point: Address,
        data: Bytes,
    ) -> anyhow::Result<ValidationTrace>;

    /// Latest-block watch channel for submission loops.
    fn block_feed(&self) -> BlockFeed;
}

/// A failing operation identified by a `FailedOp` revert from the entry
/// point's batched execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedOp {
    pub index: usize,
    /// `AAxy ...` revert reason; the leading code classifies the entity at
    /// fault (AA1x factory, AA2x account, AA3x paymaster).
    pub reason: String,
}

impl FailedOp {
    pub fn is_factory_fault(&self) -> bool {
        self.reason.starts_with("AA1")
    }

    pub fn is_paymaster_fault(&self) -> bool {
        self.reason.starts_with("AA3")
    }
}

/// Decoded result of the entry point's validation simulation.
#[derive(Debug, Clone, Default)]
pub struct SimulatedValidation {
    pub return_info: ReturnInfo,
    pub sender_info: StakeInfo,
    pub factory_info: Option<StakeInfo>,
    pub paymaster_info: Option<StakeInfo>,
    pub aggregator_info: Option<AggregatorInfo>,
}

/// ABI encode/decode for the entry-point contract. Internals are opaque to
/// the core; only the fields surfaced here matter.
pub trait EntryPointCodec: Send + Sync {
    /// Calldata for the validation simulation of one operation.
    fn encode_simulate_validation(&self, op: &VersionedUserOperation) -> Bytes;

    /// Decodes the simulation outcome from return or revert data.
    fn decode_validation_result(&self, data: &Bytes) -> anyhow::Result<SimulatedValidation>;

    /// Calldata for the batched execution of a bundle.
    fn encode_handle_ops(&self, ops: &[VersionedUserOperation], beneficiary: Address) -> Bytes;

    /// Decodes a `FailedOp` revert, if the data is one.
    fn decode_failed_op(&self, data: &Bytes) -> Option<FailedOp>;
}

/// Network fee estimation.
#[async_trait]
pub trait FeeOracle: Send + Sync {
    async fn estimate(&self) -> anyhow::Result<GasFees>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_op_classification() {
        let factory = FailedOp {
            index: 0,
            reason: "AA13 initCode failed or OOG".into(),
        };
        let paymaster = FailedOp {
            index: 2,
            reason: "AA31 paymaster deposit too low".into(),
        };
        let account = FailedOp {
            index: 1,
            reason: "AA23 reverted".into(),
        };
        assert!(factory.is_factory_fault());
        assert!(!factory.is_paymaster_fault());
        assert!(paymaster.is_paymaster_fault());
        assert!(!account.is_factory_fault());
        assert!(!account.is_paymaster_fault());
    }
}
