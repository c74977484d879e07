//! Interfaces to the bundler's external collaborators: the ledger RPC node,
//! the entry-point contract codec, and the gas-fee oracle. The rest of the
//! system depends only on these traits; the alloy-backed implementations
//! live in [`alloy`].

pub mod alloy;
pub mod codec;
pub mod trace;
pub mod traits;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use codec::AbiEntryPointCodec;
pub use trace::{AccessInfo, CallRecord, ContractInfo, EntityFrame, ValidationTrace};
pub use traits::{
    BlockFeed, CallResult, EntryPointCodec, EthRpc, FailedOp, FeeOracle, ReceiptInfo,
    SimulatedValidation,
};
