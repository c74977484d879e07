use alloy_primitives::{Address, B256, U256};
use thiserror::Error;

use crate::user_operation::Entity;

/// Stable error codes surfaced to callers alongside the reason string.
/// Numbering follows the ERC-4337 RPC error conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidFields = -32602,
    SimulateValidation = -32500,
    RejectedByPaymaster = -32501,
    OpcodeViolation = -32502,
    Expired = -32503,
    Throttled = -32504,
    InsufficientStake = -32505,
    UnsupportedAggregator = -32506,
    InvalidSignature = -32507,
    ExecutionReverted = -32521,
    RoleConflict = -32604,
    CodeChanged = -32605,
    Internal = -32603,
}

/// Everything that can go wrong between admission and inclusion.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid user operation: {0}")]
    InvalidOperation(String),

    #[error(
        "replacement underpriced: needs maxPriorityFeePerGas >= {min_priority_fee} and maxFeePerGas >= {min_fee}"
    )]
    InvalidReplacement {
        min_priority_fee: U256,
        min_fee: U256,
    },

    #[error("operation already known")]
    AlreadyKnown,

    #[error("entity {0} is banned")]
    EntityBanned(Entity),

    #[error("entity {0} is throttled and at capacity")]
    EntityThrottled(Entity),

    #[error("address {address} cannot act as both sender and {conflicting_role}")]
    RoleConflict {
        address: Address,
        conflicting_role: String,
    },

    #[error("entity {entity} used banned opcode {opcode}")]
    OpcodeViolation { entity: Entity, opcode: String },

    #[error("entity {entity} accessed unassociated storage {address} slot {slot}")]
    UnassociatedStorage {
        entity: Entity,
        address: Address,
        slot: B256,
    },

    #[error("entity {0} ran out of gas during validation")]
    OutOfGas(Entity),

    #[error("illegal value-bearing call from {from} to {to} during validation")]
    CallWithValue { from: Address, to: Address },

    #[error("entity {entity} stake too low: stake {stake}, unstake delay {unstake_delay_sec}s")]
    StakeInsufficient {
        entity: Entity,
        stake: U256,
        unstake_delay_sec: u64,
    },

    #[error("signature check failed{}", aggregator.map(|a| format!(" for aggregator {a}")).unwrap_or_default())]
    SignatureInvalid { aggregator: Option<Address> },

    #[error("operation expired or not yet valid: valid after {valid_after}, valid until {valid_until}, now {now}")]
    Expired {
        valid_after: u64,
        valid_until: u64,
        now: u64,
    },

    #[error("referenced contract code changed since validation")]
    CodeChanged,

    #[error("execution reverted: {0}")]
    ExecutionReverted(String),

    #[error("paymaster {0} rejected the operation: {1}")]
    RejectedByPaymaster(Address, String),

    #[error("validation tracing unavailable: {0}")]
    TracingUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PoolError {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidOperation(_) | Self::InvalidReplacement { .. } | Self::AlreadyKnown => {
                ErrorCode::InvalidFields
            }
            Self::EntityBanned(_) | Self::EntityThrottled(_) => ErrorCode::Throttled,
            Self::RoleConflict { .. } => ErrorCode::RoleConflict,
            Self::OpcodeViolation { .. }
            | Self::UnassociatedStorage { .. }
            | Self::CallWithValue { .. } => ErrorCode::OpcodeViolation,
            Self::OutOfGas(_) => ErrorCode::SimulateValidation,
            Self::StakeInsufficient { .. } => ErrorCode::InsufficientStake,
            Self::SignatureInvalid { .. } => ErrorCode::InvalidSignature,
            Self::Expired { .. } => ErrorCode::Expired,
            Self::CodeChanged => ErrorCode::CodeChanged,
            Self::ExecutionReverted(_) => ErrorCode::ExecutionReverted,
            Self::RejectedByPaymaster(_, _) => ErrorCode::RejectedByPaymaster,
            Self::TracingUnavailable(_) | Self::Internal(_) => ErrorCode::Internal,
        }
    }
}
