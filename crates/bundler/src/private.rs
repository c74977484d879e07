use async_trait::async_trait;
use gantry_types::{Bundle, PoolError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::identity::IdentityPool;
use crate::relayer::{
    Relayer, RelayerConfig, SharedCodec, SharedRpc, broadcast, build_transaction, dry_run,
    encode_bundle, no_identity, resolve_beneficiary,
};
use crate::report::{EntryOutcome, SubmissionReport};

/// Private-relay submission. The relay only ever includes or forgets a
/// bundle, so the transaction is re-signed and re-offered at every new head
/// until it lands or the timeout passes; timed-out entries go back to the
/// pool unharmed.
pub struct PrivateRelayer {
    rpc: SharedRpc,
    codec: SharedCodec,
    identities: IdentityPool,
    config: RelayerConfig,
}

impl PrivateRelayer {
    pub fn new(
        rpc: SharedRpc,
        codec: SharedCodec,
        identities: IdentityPool,
        config: RelayerConfig,
    ) -> Self {
        Self {
            rpc,
            codec,
            identities,
            config,
        }
    }

    async fn find_receipt(
        &self,
        submitted: &[alloy_primitives::TxHash],
        bundle: &Bundle,
    ) -> Result<Option<SubmissionReport>, PoolError> {
        for tx_hash in submitted {
            let receipt = self
                .rpc
                .get_transaction_receipt(*tx_hash)
                .await
                .map_err(|e| PoolError::Internal(e.to_string()))?;
            if let Some(receipt) = receipt {
                let report = if receipt.success {
                    SubmissionReport::included(bundle, receipt.tx_hash)
                } else {
                    SubmissionReport {
                        tx_hash: Some(receipt.tx_hash),
                        ..SubmissionReport::uniform(
                            bundle,
                            EntryOutcome::Reverted {
                                tx_hash: receipt.tx_hash,
                                reason: "bundle transaction reverted".to_owned(),
                            },
                        )
                    }
                };
                return Ok(Some(report));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Relayer for PrivateRelayer {
    fn can_submit(&self) -> bool {
        self.identities.available() > 0
    }

    fn available_identities(&self) -> usize {
        self.identities.available()
    }

    async fn send_bundle(&self, bundle: Bundle) -> Result<SubmissionReport, PoolError> {
        let identity = self.identities.try_acquire().ok_or_else(no_identity)?;
        let beneficiary =
            resolve_beneficiary(self.rpc.as_ref(), &self.config, &identity).await?;
        let data = encode_bundle(self.codec.as_ref(), &bundle, beneficiary);

        if let Some(report) = dry_run(
            self.rpc.as_ref(),
            self.codec.as_ref(),
            &self.config,
            &bundle,
            data.clone(),
        )
        .await?
        {
            return Ok(report);
        }

        let deadline = Instant::now() + self.config.submission_timeout;
        let mut feed = self.rpc.block_feed();
        let mut submitted = Vec::new();
        loop {
            let tx = build_transaction(
                self.rpc.as_ref(),
                &self.config,
                &identity,
                &bundle,
                data.clone(),
            )
            .await?;
            let raw = identity
                .sign_transaction(tx)
                .map_err(|e| PoolError::Internal(e.to_string()))?;
            let tx_hash = broadcast(self.rpc.as_ref(), &self.config, &bundle, raw).await?;
            debug!(%tx_hash, head = *feed.borrow(), "bundle offered to relay");
            submitted.push(tx_hash);

            if let Some(report) = self.find_receipt(&submitted, &bundle).await? {
                info!(entries = bundle.len(), "private bundle included");
                return Ok(report);
            }

            tokio::select! {
                changed = feed.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        if let Some(report) = self.find_receipt(&submitted, &bundle).await? {
            return Ok(report);
        }
        warn!(
            attempts = submitted.len(),
            "private submission timed out, requeueing entries"
        );
        Ok(SubmissionReport::uniform(&bundle, EntryOutcome::Requeued))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use alloy_primitives::{Address, B256, Bytes, U256, address};
    use alloy_rpc_types::erc4337;
    use chrono::Utc;
    use gantry_provider::test_utils::{StubCodec, StubEthRpc};
    use gantry_types::{GasFees, PoolEntry, VersionedUserOperation};

    use super::*;

    const ENTRY_POINT: Address = address!("5ff137d4b0fdcd49dca30c7cf57e578a026d2789");

    fn bundle() -> Bundle {
        let op = VersionedUserOperation::UserOperation(erc4337::UserOperation {
            sender: Address::repeat_byte(1),
            nonce: U256::ZERO,
            init_code: Bytes::default(),
            call_data: Bytes::default(),
            call_gas_limit: U256::from(100_000),
            verification_gas_limit: U256::from(150_000),
            pre_verification_gas: U256::from(21_000),
            max_fee_per_gas: U256::from(30),
            max_priority_fee_per_gas: U256::from(2),
            paymaster_and_data: Bytes::default(),
            signature: Bytes::default(),
        });
        Bundle {
            entries: vec![PoolEntry::new(
                8453,
                op,
                ENTRY_POINT,
                B256::ZERO,
                None,
                Utc::now(),
            )],
            storage_map: Default::default(),
            gas_fees: GasFees::default(),
        }
    }

    fn relayer(rpc: Arc<StubEthRpc>, timeout: Duration) -> PrivateRelayer {
        let mut config = RelayerConfig::new(8453, ENTRY_POINT);
        config.submission_timeout = timeout;
        PrivateRelayer::new(
            rpc,
            Arc::new(StubCodec::default()),
            IdentityPool::random(1),
            config,
        )
    }

    #[tokio::test]
    async fn included_on_first_offer() {
        let rpc = Arc::new(StubEthRpc::default());
        rpc.confirm_sends(true);
        let report = relayer(rpc.clone(), Duration::from_secs(5))
            .send_bundle(bundle())
            .await
            .unwrap();
        assert!(matches!(report.outcomes[0].1, EntryOutcome::Included { .. }));
        assert_eq!(rpc.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn timeout_requeues_entries() {
        let rpc = Arc::new(StubEthRpc::default());
        let report = relayer(rpc.clone(), Duration::from_millis(20))
            .send_bundle(bundle())
            .await
            .unwrap();
        assert!(matches!(report.outcomes[0].1, EntryOutcome::Requeued));
        assert_eq!(rpc.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn new_heads_trigger_a_fresh_offer() {
        let rpc = Arc::new(StubEthRpc::default());
        let advancer = rpc.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            advancer.advance_block(2);
        });

        let report = relayer(rpc.clone(), Duration::from_millis(80))
            .send_bundle(bundle())
            .await
            .unwrap();
        assert!(matches!(report.outcomes[0].1, EntryOutcome::Requeued));
        assert!(rpc.sent.lock().unwrap().len() >= 2);
    }
}
