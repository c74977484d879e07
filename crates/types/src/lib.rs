//! Core domain types for the gantry bundler: user operations, pool entries,
//! bundles, reputation-facing stake records, pool events, and the error
//! taxonomy shared by every other crate.

pub mod bundle;
pub mod entry;
pub mod error;
pub mod events;
pub mod hash;
pub mod user_operation;
pub mod validation;

pub use bundle::{Bundle, GasFees, StorageAccess, StorageMap, merge_storage_maps};
pub use entry::{EntryId, EntryStatus, PoolEntry};
pub use error::{ErrorCode, PoolError};
pub use events::PoolEvent;
pub use user_operation::{
    Entity, EntityType, MIN_PRE_VERIFICATION_GAS, UserOpHash, VersionedUserOperation,
};
pub use validation::{AggregatorInfo, ReturnInfo, StakeInfo, ValidationOutcome};
