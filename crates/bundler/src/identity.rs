use std::sync::Arc;

use alloy_consensus::{SignableTransaction, TxEip1559, TxEnvelope};
use alloy_eips::eip2718::Encodable2718;
use alloy_network::TxSignerSync;
use alloy_primitives::{Address, B256, Bytes};
use alloy_signer_local::PrivateKeySigner;
use anyhow::Context;
use tokio::sync::{Mutex, OwnedMutexGuard};

struct Identity {
    signer: PrivateKeySigner,
    busy: Arc<Mutex<()>>,
}

/// A set of submission keys. Each identity carries its own lock so distinct
/// identities can submit concurrently while a busy one simply declines.
pub struct IdentityPool {
    identities: Vec<Arc<Identity>>,
}

impl IdentityPool {
    pub fn from_keys(keys: &[B256]) -> anyhow::Result<Self> {
        let identities = keys
            .iter()
            .map(|key| {
                Ok(Arc::new(Identity {
                    signer: PrivateKeySigner::from_bytes(key)
                        .context("invalid submission key")?,
                    busy: Arc::new(Mutex::new(())),
                }))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        anyhow::ensure!(!identities.is_empty(), "at least one submission key required");
        Ok(Self { identities })
    }

    /// Ephemeral identities for tests and dry runs.
    pub fn random(count: usize) -> Self {
        let identities = (0..count)
            .map(|_| {
                Arc::new(Identity {
                    signer: PrivateKeySigner::random(),
                    busy: Arc::new(Mutex::new(())),
                })
            })
            .collect();
        Self { identities }
    }

    /// First identity not currently mid-submission, locked for the caller.
    pub fn try_acquire(&self) -> Option<IdentityGuard> {
        for identity in &self.identities {
            if let Ok(guard) = identity.busy.clone().try_lock_owned() {
                return Some(IdentityGuard {
                    identity: identity.clone(),
                    _guard: guard,
                });
            }
        }
        None
    }

    pub fn available(&self) -> usize {
        self.identities
            .iter()
            .filter(|i| i.busy.try_lock().is_ok())
            .count()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.identities.iter().map(|i| i.signer.address()).collect()
    }
}

/// Exclusive use of one identity for the duration of a submission.
pub struct IdentityGuard {
    identity: Arc<Identity>,
    _guard: OwnedMutexGuard<()>,
}

impl IdentityGuard {
    pub fn address(&self) -> Address {
        self.identity.signer.address()
    }

    pub fn sign_transaction(&self, mut tx: TxEip1559) -> anyhow::Result<Bytes> {
        let signature = self
            .identity
            .signer
            .sign_transaction_sync(&mut tx)
            .context("signing bundle transaction")?;
        let envelope: TxEnvelope = tx.into_signed(signature).into();
        let mut raw = Vec::with_capacity(envelope.encode_2718_len());
        envelope.encode_2718(&mut raw);
        Ok(Bytes::from(raw))
    }
}
