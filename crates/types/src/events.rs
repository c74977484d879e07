use serde::{Deserialize, Serialize};

use crate::entry::PoolEntry;

/// Pool state changes broadcast to subscribers (RPC event streams, P2P
/// gossip). One producer, many consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum PoolEvent {
    /// An operation entered the pending pool.
    PendingUserOp { entry: PoolEntry },
    /// An operation was broadcast inside a bundle transaction.
    SubmittedUserOp { entry: PoolEntry },
    /// An operation left the pool without landing on-chain.
    CancelledUserOp { entry: PoolEntry, reason: String },
    /// An operation landed on-chain but its execution reverted.
    RevertedUserOp { entry: PoolEntry, reason: String },
}
