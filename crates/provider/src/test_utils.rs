//! Hand-rolled collaborator doubles shared by the crates' test suites.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use alloy_primitives::{Address, Bytes, TxHash, U256};
use async_trait::async_trait;
use gantry_types::{GasFees, StorageMap, VersionedUserOperation};
use tokio::sync::watch;

use crate::trace::ValidationTrace;
use crate::traits::{
    BlockFeed, CallResult, EntryPointCodec, EthRpc, FailedOp, FeeOracle, ReceiptInfo,
    SimulatedValidation,
};

/// Scriptable [`EthRpc`] double. Queued results pop in order; maps fall back
/// to zero/empty defaults.
pub struct StubEthRpc {
    pub balances: Mutex<HashMap<Address, U256>>,
    pub deposits: Mutex<HashMap<Address, U256>>,
    pub code: Mutex<HashMap<Address, Bytes>>,
    pub call_results: Mutex<VecDeque<CallResult>>,
    pub traces: Mutex<VecDeque<anyhow::Result<ValidationTrace>>>,
    pub receipts: Mutex<HashMap<TxHash, ReceiptInfo>>,
    pub sent: Mutex<Vec<Bytes>>,
    pub sent_conditional: Mutex<Vec<(Bytes, StorageMap)>>,
    /// When set, every broadcast gains a receipt with this success flag.
    pub auto_receipt_success: Mutex<Option<bool>>,
    pub block_number: Mutex<u64>,
    block_tx: watch::Sender<u64>,
    block_rx: watch::Receiver<u64>,
}

impl Default for StubEthRpc {
    fn default() -> Self {
        let (block_tx, block_rx) = watch::channel(1);
        Self {
            balances: Mutex::new(HashMap::new()),
            deposits: Mutex::new(HashMap::new()),
            code: Mutex::new(HashMap::new()),
            call_results: Mutex::new(VecDeque::new()),
            traces: Mutex::new(VecDeque::new()),
            receipts: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            sent_conditional: Mutex::new(Vec::new()),
            auto_receipt_success: Mutex::new(None),
            block_number: Mutex::new(1),
            block_tx,
            block_rx,
        }
    }
}

impl StubEthRpc {
    pub fn push_call_result(&self, result: CallResult) {
        self.call_results.lock().unwrap().push_back(result);
    }

    pub fn push_trace(&self, trace: ValidationTrace) {
        self.traces.lock().unwrap().push_back(Ok(trace));
    }

    pub fn push_trace_error(&self, message: &str) {
        self.traces
            .lock()
            .unwrap()
            .push_back(Err(anyhow::anyhow!(message.to_owned())));
    }

    pub fn set_deposit(&self, address: Address, amount: U256) {
        self.deposits.lock().unwrap().insert(address, amount);
    }

    pub fn set_balance(&self, address: Address, amount: U256) {
        self.balances.lock().unwrap().insert(address, amount);
    }

    pub fn set_code(&self, address: Address, code: Bytes) {
        self.code.lock().unwrap().insert(address, code);
    }

    pub fn add_receipt(&self, receipt: ReceiptInfo) {
        self.receipts.lock().unwrap().insert(receipt.tx_hash, receipt);
    }

    pub fn advance_block(&self, number: u64) {
        *self.block_number.lock().unwrap() = number;
        let _ = self.block_tx.send(number);
    }

    pub fn confirm_sends(&self, success: bool) {
        *self.auto_receipt_success.lock().unwrap() = Some(success);
    }

    fn synthetic_tx_hash(&self, raw: &Bytes) -> TxHash {
        let hash = alloy_primitives::keccak256(raw);
        if let Some(success) = *self.auto_receipt_success.lock().unwrap() {
            self.add_receipt(ReceiptInfo {
                tx_hash: hash,
                block_number: *self.block_number.lock().unwrap(),
                success,
            });
        }
        hash
    }
}

#[async_trait]
impl EthRpc for StubEthRpc {
    async fn call(&self, _to: Address, _data: Bytes) -> anyhow::Result<CallResult> {
        Ok(self
            .call_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(CallResult::Return(Bytes::new())))
    }

    async fn estimate_gas(&self, _to: Address, _data: Bytes) -> anyhow::Result<u64> {
        Ok(1_000_000)
    }

    async fn get_balance(&self, address: Address) -> anyhow::Result<U256> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or(U256::ZERO))
    }

    async fn get_code(&self, address: Address) -> anyhow::Result<Bytes> {
        Ok(self
            .code
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_transaction_count(&self, _address: Address) -> anyhow::Result<u64> {
        Ok(0)
    }

    async fn deposit_of(&self, _entry_point: Address, address: Address) -> anyhow::Result<U256> {
        Ok(self
            .deposits
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or(U256::ZERO))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> anyhow::Result<TxHash> {
        let hash = self.synthetic_tx_hash(&raw);
        self.sent.lock().unwrap().push(raw);
        Ok(hash)
    }

    async fn send_raw_transaction_conditional(
        &self,
        raw: Bytes,
        known_accounts: &StorageMap,
    ) -> anyhow::Result<TxHash> {
        let hash = self.synthetic_tx_hash(&raw);
        self.sent_conditional
            .lock()
            .unwrap()
            .push((raw, known_accounts.clone()));
        Ok(hash)
    }

    async fn get_transaction_receipt(
        &self,
        hash: TxHash,
    ) -> anyhow::Result<Option<ReceiptInfo>> {
        Ok(self.receipts.lock().unwrap().get(&hash).copied())
    }

    async fn latest_block_number(&self) -> anyhow::Result<u64> {
        Ok(*self.block_number.lock().unwrap())
    }

    async fn trace_validation(
        &self,
        _entry_point: Address,
        _data: Bytes,
    ) -> anyhow::Result<ValidationTrace> {
        match self.traces.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(ValidationTrace::default()),
        }
    }

    fn block_feed(&self) -> BlockFeed {
        self.block_rx.clone()
    }
}

/// Scriptable [`EntryPointCodec`] double.
#[derive(Default)]
pub struct StubCodec {
    pub validations: Mutex<VecDeque<anyhow::Result<SimulatedValidation>>>,
    pub failed_op: Mutex<Option<FailedOp>>,
}

impl StubCodec {
    pub fn push_validation(&self, validation: SimulatedValidation) {
        self.validations.lock().unwrap().push_back(Ok(validation));
    }

    pub fn set_failed_op(&self, failed: FailedOp) {
        *self.failed_op.lock().unwrap() = Some(failed);
    }
}

impl EntryPointCodec for StubCodec {
    fn encode_simulate_validation(&self, op: &VersionedUserOperation) -> Bytes {
        Bytes::from(op.hash(Address::ZERO, 0).to_vec())
    }

    fn decode_validation_result(&self, _data: &Bytes) -> anyhow::Result<SimulatedValidation> {
        match self.validations.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(SimulatedValidation::default()),
        }
    }

    fn encode_handle_ops(
        &self,
        ops: &[VersionedUserOperation],
        beneficiary: Address,
    ) -> Bytes {
        let mut buf = beneficiary.to_vec();
        for op in ops {
            buf.extend_from_slice(op.hash(Address::ZERO, 0).as_slice());
        }
        Bytes::from(buf)
    }

    fn decode_failed_op(&self, data: &Bytes) -> Option<FailedOp> {
        if data.is_empty() {
            return None;
        }
        self.failed_op.lock().unwrap().clone()
    }
}

/// [`FeeOracle`] returning a fixed estimate.
pub struct FixedFeeOracle {
    pub fees: GasFees,
}

impl FixedFeeOracle {
    pub fn new(max_fee: u64, max_priority: u64) -> Self {
        Self {
            fees: GasFees {
                max_fee_per_gas: U256::from(max_fee),
                max_priority_fee_per_gas: U256::from(max_priority),
            },
        }
    }
}

#[async_trait]
impl FeeOracle for FixedFeeOracle {
    async fn estimate(&self) -> anyhow::Result<GasFees> {
        Ok(self.fees)
    }
}
