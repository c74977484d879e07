use async_trait::async_trait;
use gantry_types::{Bundle, PoolError};
use tracing::{info, warn};

use crate::identity::IdentityPool;
use crate::relayer::{
    Relayer, RelayerConfig, SharedCodec, SharedRpc, broadcast, build_transaction, dry_run,
    encode_bundle, no_identity, resolve_beneficiary,
};
use crate::report::{EntryOutcome, SubmissionReport};

/// Plain public-mempool submission. Broadcasts once and polls receipts; a
/// bundle that never confirms cannot be retried safely (the nonce may have
/// been consumed by a front-runner), so its entries are dropped.
pub struct ClassicRelayer {
    rpc: SharedRpc,
    codec: SharedCodec,
    identities: IdentityPool,
    config: RelayerConfig,
}

impl ClassicRelayer {
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
}

#[async_trait]
impl Relayer for ClassicRelayer {
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
            warn!(entries = bundle.len(), "bundle rejected in dry run");
            return Ok(report);
        }

        let tx = build_transaction(self.rpc.as_ref(), &self.config, &identity, &bundle, data)
            .await?;
        let raw = identity
            .sign_transaction(tx)
            .map_err(|e| PoolError::Internal(e.to_string()))?;
        let tx_hash = broadcast(self.rpc.as_ref(), &self.config, &bundle, raw).await?;
        info!(%tx_hash, entries = bundle.len(), "bundle broadcast");

        for _ in 0..self.config.max_confirm_attempts {
            if let Some(receipt) = self
                .rpc
                .get_transaction_receipt(tx_hash)
                .await
                .map_err(|e| PoolError::Internal(e.to_string()))?
            {
                let report = if receipt.success {
                    SubmissionReport::included(&bundle, tx_hash)
                } else {
                    SubmissionReport {
                        tx_hash: Some(tx_hash),
                        ..SubmissionReport::uniform(
                            &bundle,
                            EntryOutcome::Reverted {
                                tx_hash,
                                reason: "bundle transaction reverted".to_owned(),
                            },
                        )
                    }
                };
                return Ok(report);
            }
            tokio::time::sleep(self.config.confirm_poll_interval).await;
        }

        warn!(%tx_hash, "bundle unconfirmed, dropping entries");
        Ok(SubmissionReport {
            tx_hash: Some(tx_hash),
            ..SubmissionReport::uniform(
                &bundle,
                EntryOutcome::Dropped {
                    reason: format!(
                        "unconfirmed after {} attempts",
                        self.config.max_confirm_attempts
                    ),
                },
            )
        })
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
    use gantry_provider::{CallResult, FailedOp};
    use gantry_types::{GasFees, PoolEntry, VersionedUserOperation};

    use super::*;

    const ENTRY_POINT: Address = address!("5ff137d4b0fdcd49dca30c7cf57e578a026d2789");

    fn entry(sender: Address, paymaster: Option<Address>) -> PoolEntry {
        let op = VersionedUserOperation::UserOperation(erc4337::UserOperation {
            sender,
            nonce: U256::ZERO,
            init_code: Bytes::default(),
            call_data: Bytes::default(),
            call_gas_limit: U256::from(100_000),
            verification_gas_limit: U256::from(150_000),
            pre_verification_gas: U256::from(21_000),
            max_fee_per_gas: U256::from(30),
            max_priority_fee_per_gas: U256::from(2),
            paymaster_and_data: paymaster
                .map(|p| Bytes::copy_from_slice(p.as_slice()))
                .unwrap_or_default(),
            signature: Bytes::default(),
        });
        PoolEntry::new(8453, op, ENTRY_POINT, B256::ZERO, None, Utc::now())
    }

    fn bundle(entries: Vec<PoolEntry>) -> Bundle {
        Bundle {
            entries,
            storage_map: Default::default(),
            gas_fees: GasFees {
                max_fee_per_gas: U256::from(30),
                max_priority_fee_per_gas: U256::from(2),
            },
        }
    }

    fn relayer(rpc: Arc<StubEthRpc>, codec: Arc<StubCodec>) -> ClassicRelayer {
        let mut config = RelayerConfig::new(8453, ENTRY_POINT);
        config.max_confirm_attempts = 2;
        config.confirm_poll_interval = Duration::from_millis(1);
        ClassicRelayer::new(rpc, codec, IdentityPool::random(1), config)
    }

    #[tokio::test]
    async fn confirmed_bundle_reports_inclusion() {
        let rpc = Arc::new(StubEthRpc::default());
        rpc.confirm_sends(true);
        let relayer = relayer(rpc.clone(), Arc::new(StubCodec::default()));

        let report = relayer
            .send_bundle(bundle(vec![entry(Address::repeat_byte(1), None)]))
            .await
            .unwrap();
        assert!(report.tx_hash.is_some());
        assert_eq!(report.outcomes.len(), 1);
        assert!(matches!(report.outcomes[0].1, EntryOutcome::Included { .. }));
        assert_eq!(rpc.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reverted_bundle_transaction_reports_reverts() {
        let rpc = Arc::new(StubEthRpc::default());
        rpc.confirm_sends(false);
        let relayer = relayer(rpc, Arc::new(StubCodec::default()));

        let report = relayer
            .send_bundle(bundle(vec![entry(Address::repeat_byte(1), None)]))
            .await
            .unwrap();
        assert!(matches!(report.outcomes[0].1, EntryOutcome::Reverted { .. }));
    }

    #[tokio::test]
    async fn unconfirmed_bundle_drops_entries() {
        let rpc = Arc::new(StubEthRpc::default());
        let relayer = relayer(rpc.clone(), Arc::new(StubCodec::default()));

        let report = relayer
            .send_bundle(bundle(vec![entry(Address::repeat_byte(1), None)]))
            .await
            .unwrap();
        assert!(matches!(report.outcomes[0].1, EntryOutcome::Dropped { .. }));
        // It was broadcast; only confirmation was missing.
        assert_eq!(rpc.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_op_aborts_before_broadcast_and_penalizes_the_paymaster() {
        let rpc = Arc::new(StubEthRpc::default());
        let codec = Arc::new(StubCodec::default());
        rpc.push_call_result(CallResult::Revert(Bytes::from(vec![1])));
        codec.set_failed_op(FailedOp {
            index: 1,
            reason: "AA31 paymaster deposit too low".to_owned(),
        });

        let paymaster = Address::repeat_byte(9);
        let relayer = relayer(rpc.clone(), codec);
        let report = relayer
            .send_bundle(bundle(vec![
                entry(Address::repeat_byte(1), None),
                entry(Address::repeat_byte(2), Some(paymaster)),
            ]))
            .await
            .unwrap();

        assert!(rpc.sent.lock().unwrap().is_empty());
        assert!(matches!(report.outcomes[0].1, EntryOutcome::Requeued));
        assert!(matches!(report.outcomes[1].1, EntryOutcome::Failed { .. }));
        assert_eq!(report.penalties.len(), 1);
        assert_eq!(report.penalties[0].address, paymaster);
    }

    #[tokio::test]
    async fn conditional_mode_attaches_the_storage_map() {
        let rpc = Arc::new(StubEthRpc::default());
        rpc.confirm_sends(true);
        let mut config = RelayerConfig::new(8453, ENTRY_POINT);
        config.conditional = true;
        config.confirm_poll_interval = Duration::from_millis(1);
        let relayer = ClassicRelayer::new(
            rpc.clone(),
            Arc::new(StubCodec::default()),
            IdentityPool::random(1),
            config,
        );

        relayer
            .send_bundle(bundle(vec![entry(Address::repeat_byte(1), None)]))
            .await
            .unwrap();
        assert!(rpc.sent.lock().unwrap().is_empty());
        assert_eq!(rpc.sent_conditional.lock().unwrap().len(), 1);
    }
}
