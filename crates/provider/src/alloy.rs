//! Alloy-backed implementations of the collaborator traits, speaking raw
//! JSON-RPC through a [`RootProvider`] client.

use std::time::Duration;

use alloy_primitives::{hex, Address, Bytes, TxHash, U256, U64};
use alloy_provider::{Provider, RootProvider};
use async_trait::async_trait;
use gantry_types::{GasFees, StorageMap};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::warn;

use crate::trace::ValidationTrace;
use crate::traits::{BlockFeed, CallResult, EthRpc, FeeOracle, ReceiptInfo};

/// `balanceOf(address)` on the entry point.
const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

/// Ledger RPC client over an alloy provider. The tracer source (a JS blob or
/// a node-native tracer name) is injected at construction.
pub struct AlloyEthRpc {
    provider: RootProvider,
    tracer: String,
    block_feed: watch::Receiver<u64>,
}

impl AlloyEthRpc {
    /// Wraps a provider and starts a head poller that feeds
    /// [`EthRpc::block_feed`].
    pub fn new(provider: RootProvider, tracer: String, poll_interval: Duration) -> Self {
        let (tx, rx) = watch::channel(0u64);
        let poller = provider.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                match poller.client().request::<_, U64>("eth_blockNumber", ()).await {
                    Ok(number) => {
                        let _ = tx.send(number.to::<u64>());
                    }
                    Err(err) => warn!(error = %err, "head poll failed"),
                }
            }
        });
        Self {
            provider,
            tracer,
            block_feed: rx,
        }
    }

    fn call_object(to: Address, data: &Bytes) -> serde_json::Value {
        json!({ "to": to, "data": data })
    }
}

/// Pulls the revert payload out of a JSON-RPC execution-reverted error, if
/// the node attached one.
fn revert_data_of(err: &alloy_transport::TransportError) -> Option<Bytes> {
    let payload = err.as_error_resp()?;
    let raw = payload.data.as_ref()?;
    let hex_str: String = serde_json::from_str(raw.get()).ok()?;
    hex::decode(hex_str.trim_start_matches("0x")).ok().map(Bytes::from)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: TxHash,
    block_number: Option<U64>,
    status: Option<U64>,
}

#[async_trait]
impl EthRpc for AlloyEthRpc {
    async fn call(&self, to: Address, data: Bytes) -> anyhow::Result<CallResult> {
        let result = self
            .provider
            .client()
            .request::<_, Bytes>("eth_call", (Self::call_object(to, &data), "latest"))
            .await;
        match result {
            Ok(output) => Ok(CallResult::Return(output)),
            Err(err) => match revert_data_of(&err) {
                Some(revert) => Ok(CallResult::Revert(revert)),
                None => Err(err.into()),
            },
        }
    }

    async fn estimate_gas(&self, to: Address, data: Bytes) -> anyhow::Result<u64> {
        let gas: U64 = self
            .provider
            .client()
            .request("eth_estimateGas", (Self::call_object(to, &data),))
            .await?;
        Ok(gas.to::<u64>())
    }

    async fn get_balance(&self, address: Address) -> anyhow::Result<U256> {
        Ok(self
            .provider
            .client()
            .request("eth_getBalance", (address, "latest"))
            .await?)
    }

    async fn get_code(&self, address: Address) -> anyhow::Result<Bytes> {
        Ok(self
            .provider
            .client()
            .request("eth_getCode", (address, "latest"))
            .await?)
    }

    async fn get_transaction_count(&self, address: Address) -> anyhow::Result<u64> {
        let nonce: U64 = self
            .provider
            .client()
            .request("eth_getTransactionCount", (address, "latest"))
            .await?;
        Ok(nonce.to::<u64>())
    }

    async fn deposit_of(&self, entry_point: Address, address: Address) -> anyhow::Result<U256> {
        let mut data = BALANCE_OF_SELECTOR.to_vec();
        data.extend_from_slice(&[0u8; 12]);
        data.extend_from_slice(address.as_slice());
        match self.call(entry_point, Bytes::from(data)).await? {
            CallResult::Return(output) if output.len() >= 32 => {
                Ok(U256::from_be_slice(&output[..32]))
            }
            CallResult::Return(_) => anyhow::bail!("short balanceOf return"),
            CallResult::Revert(_) => anyhow::bail!("balanceOf reverted"),
        }
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> anyhow::Result<TxHash> {
        Ok(self
            .provider
            .client()
            .request("eth_sendRawTransaction", (raw,))
            .await?)
    }

    async fn send_raw_transaction_conditional(
        &self,
        raw: Bytes,
        known_accounts: &StorageMap,
    ) -> anyhow::Result<TxHash> {
        Ok(self
            .provider
            .client()
            .request(
                "eth_sendRawTransactionConditional",
                (raw, json!({ "knownAccounts": known_accounts })),
            )
            .await?)
    }

    async fn get_transaction_receipt(
        &self,
        hash: TxHash,
    ) -> anyhow::Result<Option<ReceiptInfo>> {
        let receipt: Option<RpcReceipt> = self
            .provider
            .client()
            .request("eth_getTransactionReceipt", (hash,))
            .await?;
        Ok(receipt.and_then(|r| {
            r.block_number.map(|number| ReceiptInfo {
                tx_hash: r.transaction_hash,
                block_number: number.to::<u64>(),
                success: r.status.map(|s| s == U64::from(1)).unwrap_or(false),
            })
        }))
    }

    async fn latest_block_number(&self) -> anyhow::Result<u64> {
        let number: U64 = self
            .provider
            .client()
            .request("eth_blockNumber", ())
            .await?;
        Ok(number.to::<u64>())
    }

    async fn trace_validation(
        &self,
        entry_point: Address,
        data: Bytes,
    ) -> anyhow::Result<ValidationTrace> {
        Ok(self
            .provider
            .client()
            .request(
                "debug_traceCall",
                (
                    Self::call_object(entry_point, &data),
                    "latest",
                    json!({ "tracer": self.tracer }),
                ),
            )
            .await?)
    }

    fn block_feed(&self) -> BlockFeed {
        self.block_feed.clone()
    }
}

/// Fee oracle reading the node's own estimates.
pub struct NodeFeeOracle {
    provider: RootProvider,
}

impl NodeFeeOracle {
    pub fn new(provider: RootProvider) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl FeeOracle for NodeFeeOracle {
    async fn estimate(&self) -> anyhow::Result<GasFees> {
        let max_fee: U256 = self.provider.client().request("eth_gasPrice", ()).await?;
        let max_priority: U256 = self
            .provider
            .client()
            .request("eth_maxPriorityFeePerGas", ())
            .await?;
        Ok(GasFees {
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: max_priority,
        })
    }
}
