//! Wire types returned by the validation tracer: per-entity call frames with
//! opcode counts, storage accesses, contract sizes, plus the flat call log
//! and every keccak preimage observed during the simulated validation.

use std::collections::HashMap;

use alloy_primitives::{Address, B256, Bytes, U256};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationTrace {
    /// One frame per top-level call the entry point makes during validation
    /// (factory deployment, account validation, paymaster validation).
    #[serde(default)]
    pub calls_from_entry_point: Vec<EntityFrame>,
    /// Flat log of every call observed, in execution order.
    #[serde(default)]
    pub calls: Vec<CallRecord>,
    /// Inputs of every KECCAK256 the validation executed.
    #[serde(default)]
    pub keccak: Vec<Bytes>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityFrame {
    pub top_level_target_address: Address,
    #[serde(default)]
    pub top_level_method_sig: Bytes,
    /// Opcode name to invocation count within this frame.
    #[serde(default)]
    pub opcodes: HashMap<String, u64>,
    /// Storage accesses keyed by the contract whose storage was touched.
    #[serde(default)]
    pub access: HashMap<Address, AccessInfo>,
    /// EXTCODE* / CALL-target contract sizes observed from this frame.
    #[serde(default)]
    pub contract_size: HashMap<Address, ContractInfo>,
    /// The frame ran out of gas during validation.
    #[serde(default)]
    pub oog: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessInfo {
    /// Slot to the value first read from it.
    #[serde(default)]
    pub reads: HashMap<B256, B256>,
    /// Slot to write count.
    #[serde(default)]
    pub writes: HashMap<B256, u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractInfo {
    pub contract_size: u64,
    #[serde(default)]
    pub opcode: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    /// Opcode that initiated the call (`CALL`, `DELEGATECALL`, ...) or the
    /// terminating `REVERT`/`RETURN` marker.
    pub op: String,
    #[serde(default)]
    pub from: Address,
    #[serde(default)]
    pub to: Address,
    #[serde(default)]
    pub value: Option<U256>,
    #[serde(default)]
    pub data: Option<Bytes>,
}
