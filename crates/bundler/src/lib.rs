//! Bundle construction and on-chain submission.
//!
//! The proposer turns the pending pool into an ordered, conflict-free batch;
//! a relayer signs it into a `handleOps` transaction and shepherds it to
//! inclusion. Relayer strategies differ in how they broadcast and what they
//! guarantee afterwards; both report per-entry outcomes for the cycle driver
//! to apply.

mod classic;
mod identity;
mod private;
mod proposer;
mod relayer;
mod report;

pub use classic::ClassicRelayer;
pub use identity::{IdentityGuard, IdentityPool};
pub use private::PrivateRelayer;
pub use proposer::{BundleProposer, ProposerConfig};
pub use relayer::{Relayer, RelayerConfig};
pub use report::{EntryOutcome, SubmissionReport};
