use alloy_primitives::{Address, B256, ChainId, TxHash, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::user_operation::{UserOpHash, VersionedUserOperation};

/// Pool identity of an entry. At most one entry may exist per id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId {
    pub chain_id: ChainId,
    pub sender: Address,
    pub nonce: U256,
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.chain_id, self.sender, self.nonce)
    }
}

/// Lifecycle of a pool entry. Ranks are strictly ordered; the only rank
/// decreases allowed are the explicit recovery transitions back to `New`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum EntryStatus {
    New = 0,
    Pending = 1,
    Submitted = 2,
    OnChain = 3,
    Reverted = 4,
    Cancelled = 5,
}

impl EntryStatus {
    pub fn rank(&self) -> u8 {
        *self as u8
    }

    /// Terminal statuses are eligible for archival purge.
    pub fn is_terminal(&self) -> bool {
        self.rank() >= Self::OnChain.rank()
    }

    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition_to(&self, next: EntryStatus) -> bool {
        match (self, next) {
            // recovery paths
            (Self::Submitted, Self::New) | (Self::Pending, Self::New) => true,
            // cancellation from any non-terminal state
            (from, Self::Cancelled) => !from.is_terminal(),
            (Self::New, Self::Pending) => true,
            (Self::Pending, Self::Submitted) => true,
            (Self::Submitted, Self::OnChain) | (Self::Submitted, Self::Reverted) => true,
            _ => false,
        }
    }
}

/// The pool's unit of work: a validated user operation plus submission
/// bookkeeping. Owned exclusively by the entry store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolEntry {
    pub chain_id: ChainId,
    pub operation: VersionedUserOperation,
    pub entry_point: Address,
    pub hash: UserOpHash,
    pub prefund: U256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub factory: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paymaster: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregator: Option<Address>,
    /// Digest over the bytecode of every contract touched during validation.
    /// Detects code changes between admission and bundling.
    pub code_hash: B256,
    pub status: EntryStatus,
    pub submit_attempts: u32,
    pub added_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<TxHash>,
    /// Transaction hash the operation actually landed in, when front-run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_tx_hash: Option<TxHash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revert_reason: Option<String>,
}

impl PoolEntry {
    pub fn new(
        chain_id: ChainId,
        operation: VersionedUserOperation,
        entry_point: Address,
        code_hash: B256,
        aggregator: Option<Address>,
        now: DateTime<Utc>,
    ) -> Self {
        let hash = operation.hash(entry_point, chain_id);
        let prefund = operation.max_prefund();
        let factory = operation.factory();
        let paymaster = operation.paymaster();
        Self {
            chain_id,
            operation,
            entry_point,
            hash,
            prefund,
            factory,
            paymaster,
            aggregator,
            code_hash,
            status: EntryStatus::New,
            submit_attempts: 0,
            added_at: now,
            last_updated_at: now,
            submitted_at: None,
            tx_hash: None,
            actual_tx_hash: None,
            revert_reason: None,
        }
    }

    pub fn id(&self) -> EntryId {
        EntryId {
            chain_id: self.chain_id,
            sender: self.operation.sender(),
            nonce: self.operation.nonce(),
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.added_at
    }
}
