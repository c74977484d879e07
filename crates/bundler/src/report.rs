use alloy_primitives::TxHash;
use gantry_types::{Bundle, Entity, EntryId};

/// Where one bundled entry ended up after a submission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Landed on-chain in `tx_hash` and executed.
    Included { tx_hash: TxHash },
    /// Landed on-chain but its execution reverted.
    Reverted { tx_hash: TxHash, reason: String },
    /// Rejected before broadcast; the entry cannot be retried as-is.
    Failed { reason: String },
    /// Not included this round; eligible for the next bundle.
    Requeued,
    /// Broadcast but never confirmed; not safely retryable.
    Dropped { reason: String },
}

/// Per-entry outcomes of one submission attempt, plus the entities whose
/// on-chain behavior caused a rejection and deserve a reputation penalty.
#[derive(Debug, Clone, Default)]
pub struct SubmissionReport {
    pub tx_hash: Option<TxHash>,
    pub outcomes: Vec<(EntryId, EntryOutcome)>,
    pub penalties: Vec<Entity>,
}

impl SubmissionReport {
    pub fn uniform(bundle: &Bundle, outcome: EntryOutcome) -> Self {
        Self {
            tx_hash: None,
            outcomes: bundle
                .entries
                .iter()
                .map(|e| (e.id(), outcome.clone()))
                .collect(),
            penalties: Vec::new(),
        }
    }

    pub fn included(bundle: &Bundle, tx_hash: TxHash) -> Self {
        Self {
            tx_hash: Some(tx_hash),
            ..Self::uniform(bundle, EntryOutcome::Included { tx_hash })
        }
    }
}
