use alloy_primitives::{Address, B256, Bytes, U256};
use serde::{Deserialize, Serialize};

use crate::bundle::StorageMap;

/// On-chain-reported stake of one entity at the entry point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StakeInfo {
    pub address: Address,
    pub stake: U256,
    pub unstake_delay_sec: u64,
    pub deposit: U256,
}

impl StakeInfo {
    /// Staked in the protocol sense: both a nonzero deposit and a nonzero
    /// unstake delay.
    pub fn is_staked(&self) -> bool {
        self.stake > U256::ZERO && self.unstake_delay_sec > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorInfo {
    pub address: Address,
    pub stake_info: StakeInfo,
}

/// The entry point's validation return values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnInfo {
    pub pre_op_gas: U256,
    pub prefund: U256,
    pub sig_failed: bool,
    pub valid_after: u64,
    pub valid_until: u64,
    pub paymaster_context: Bytes,
}

/// Everything the validation engine reports for an admissible operation.
#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub return_info: ReturnInfo,
    pub sender_info: StakeInfo,
    pub factory_info: Option<StakeInfo>,
    pub paymaster_info: Option<StakeInfo>,
    pub aggregator_info: Option<AggregatorInfo>,
    pub storage_map: StorageMap,
    /// Digest over the bytecode of every contract the validation touched.
    pub code_hash: B256,
}
