//! ABI codec for the canonical entry-point contracts.

use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_sol_types::{SolCall, SolError};
use anyhow::bail;
use gantry_types::{AggregatorInfo, ReturnInfo, StakeInfo, VersionedUserOperation};

use crate::traits::{EntryPointCodec, FailedOp, SimulatedValidation};

mod v06 {
    alloy_sol_types::sol! {
        #[derive(Debug, Default)]
        struct UserOperation {
            address sender;
            uint256 nonce;
            bytes initCode;
            bytes callData;
            uint256 callGasLimit;
            uint256 verificationGasLimit;
            uint256 preVerificationGas;
            uint256 maxFeePerGas;
            uint256 maxPriorityFeePerGas;
            bytes paymasterAndData;
            bytes signature;
        }

        #[derive(Debug, Default)]
        struct StakeInfo {
            uint256 stake;
            uint256 unstakeDelaySec;
        }

        #[derive(Debug, Default)]
        struct ReturnInfo {
            uint256 preOpGas;
            uint256 prefund;
            bool sigFailed;
            uint48 validAfter;
            uint48 validUntil;
            bytes paymasterContext;
        }

        #[derive(Debug, Default)]
        struct AggregatorStakeInfo {
            address aggregator;
            StakeInfo stakeInfo;
        }

        function simulateValidation(UserOperation calldata userOp) external;
        function handleOps(UserOperation[] calldata ops, address payable beneficiary) external;

        error FailedOp(uint256 opIndex, string reason);
        error ValidationResult(
            ReturnInfo returnInfo,
            StakeInfo senderInfo,
            StakeInfo factoryInfo,
            StakeInfo paymasterInfo
        );
        error ValidationResultWithAggregation(
            ReturnInfo returnInfo,
            StakeInfo senderInfo,
            StakeInfo factoryInfo,
            StakeInfo paymasterInfo,
            AggregatorStakeInfo aggregatorInfo
        );
    }
}

mod v07 {
    alloy_sol_types::sol! {
        #[derive(Debug, Default)]
        struct PackedUserOperation {
            address sender;
            uint256 nonce;
            bytes initCode;
            bytes callData;
            bytes32 accountGasLimits;
            uint256 preVerificationGas;
            bytes32 gasFees;
            bytes paymasterAndData;
            bytes signature;
        }

        // The v0.7 entry point has no on-chain simulation; this selector
        // belongs to the EntryPointSimulations override contract.
        function simulateValidation(PackedUserOperation calldata userOp) external;
        function handleOps(PackedUserOperation[] calldata ops, address payable beneficiary) external;
    }
}

fn to_sol_v06(op: &alloy_rpc_types::erc4337::UserOperation) -> v06::UserOperation {
    v06::UserOperation {
        sender: op.sender,
        nonce: op.nonce,
        initCode: op.init_code.clone(),
        callData: op.call_data.clone(),
        callGasLimit: op.call_gas_limit,
        verificationGasLimit: op.verification_gas_limit,
        preVerificationGas: op.pre_verification_gas,
        maxFeePerGas: op.max_fee_per_gas,
        maxPriorityFeePerGas: op.max_priority_fee_per_gas,
        paymasterAndData: op.paymaster_and_data.clone(),
        signature: op.signature.clone(),
    }
}

/// Two 128-bit values packed into one word, high half first.
fn pack_pair(high: U256, low: U256) -> B256 {
    let mut out = [0u8; 32];
    out[..16].copy_from_slice(&high.to_be_bytes::<32>()[16..]);
    out[16..].copy_from_slice(&low.to_be_bytes::<32>()[16..]);
    B256::from(out)
}

fn to_sol_v07(op: &alloy_rpc_types::erc4337::PackedUserOperation) -> v07::PackedUserOperation {
    let init_code = match op.factory {
        Some(factory) => {
            let mut buf = factory.to_vec();
            buf.extend_from_slice(&op.factory_data.clone().unwrap_or_default());
            Bytes::from(buf)
        }
        None => Bytes::default(),
    };
    let paymaster_and_data = match op.paymaster {
        Some(paymaster) => {
            let mut buf = paymaster.to_vec();
            buf.extend_from_slice(
                pack_pair(
                    op.paymaster_verification_gas_limit.unwrap_or_default(),
                    op.paymaster_post_op_gas_limit.unwrap_or_default(),
                )
                .as_slice(),
            );
            buf.extend_from_slice(&op.paymaster_data.clone().unwrap_or_default());
            Bytes::from(buf)
        }
        None => Bytes::default(),
    };
    v07::PackedUserOperation {
        sender: op.sender,
        nonce: op.nonce,
        initCode: init_code,
        callData: op.call_data.clone(),
        accountGasLimits: pack_pair(op.verification_gas_limit, op.call_gas_limit),
        preVerificationGas: op.pre_verification_gas,
        gasFees: pack_pair(op.max_priority_fee_per_gas, op.max_fee_per_gas),
        paymasterAndData: paymaster_and_data,
        signature: op.signature.clone(),
    }
}

/// The decoded structs carry no addresses or deposits; callers key stake
/// infos by the operation's own entity addresses and fetch deposits via
/// `deposit_of`.
fn from_sol_stake(info: &v06::StakeInfo) -> StakeInfo {
    StakeInfo {
        address: Address::ZERO,
        stake: info.stake,
        unstake_delay_sec: info.unstakeDelaySec.saturating_to(),
        deposit: U256::ZERO,
    }
}

fn from_sol_return(info: &v06::ReturnInfo) -> ReturnInfo {
    ReturnInfo {
        pre_op_gas: info.preOpGas,
        prefund: info.prefund,
        sig_failed: info.sigFailed,
        valid_after: info.validAfter.to(),
        valid_until: info.validUntil.to(),
        paymaster_context: info.paymasterContext.clone(),
    }
}

/// [`EntryPointCodec`] over the canonical ABI. Validation results arrive in
/// the revert payloads the entry point reports them with.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbiEntryPointCodec;

impl EntryPointCodec for AbiEntryPointCodec {
    fn encode_simulate_validation(&self, op: &VersionedUserOperation) -> Bytes {
        match op {
            VersionedUserOperation::UserOperation(op) => v06::simulateValidationCall {
                userOp: to_sol_v06(op),
            }
            .abi_encode()
            .into(),
            VersionedUserOperation::PackedUserOperation(op) => v07::simulateValidationCall {
                userOp: to_sol_v07(op),
            }
            .abi_encode()
            .into(),
        }
    }

    fn decode_validation_result(&self, data: &Bytes) -> anyhow::Result<SimulatedValidation> {
        if let Ok(result) = v06::ValidationResult::abi_decode(data) {
            return Ok(SimulatedValidation {
                return_info: from_sol_return(&result.returnInfo),
                sender_info: from_sol_stake(&result.senderInfo),
                factory_info: Some(from_sol_stake(&result.factoryInfo)),
                paymaster_info: Some(from_sol_stake(&result.paymasterInfo)),
                aggregator_info: None,
            });
        }
        if let Ok(result) = v06::ValidationResultWithAggregation::abi_decode(data) {
            return Ok(SimulatedValidation {
                return_info: from_sol_return(&result.returnInfo),
                sender_info: from_sol_stake(&result.senderInfo),
                factory_info: Some(from_sol_stake(&result.factoryInfo)),
                paymaster_info: Some(from_sol_stake(&result.paymasterInfo)),
                aggregator_info: Some(AggregatorInfo {
                    address: result.aggregatorInfo.aggregator,
                    stake_info: from_sol_stake(&result.aggregatorInfo.stakeInfo),
                }),
            });
        }
        if let Ok(failed) = v06::FailedOp::abi_decode(data) {
            bail!("validation failed: {}", failed.reason);
        }
        bail!(
            "unrecognized validation revert: 0x{}",
            alloy_primitives::hex::encode(data)
        )
    }

    fn encode_handle_ops(&self, ops: &[VersionedUserOperation], beneficiary: Address) -> Bytes {
        let all_packed = ops
            .iter()
            .all(|op| matches!(op, VersionedUserOperation::PackedUserOperation(_)));
        if all_packed && !ops.is_empty() {
            let ops = ops
                .iter()
                .filter_map(|op| match op {
                    VersionedUserOperation::PackedUserOperation(op) => Some(to_sol_v07(op)),
                    VersionedUserOperation::UserOperation(_) => None,
                })
                .collect();
            v07::handleOpsCall { ops, beneficiary }.abi_encode().into()
        } else {
            let ops = ops
                .iter()
                .filter_map(|op| match op {
                    VersionedUserOperation::UserOperation(op) => Some(to_sol_v06(op)),
                    VersionedUserOperation::PackedUserOperation(_) => None,
                })
                .collect();
            v06::handleOpsCall { ops, beneficiary }.abi_encode().into()
        }
    }

    fn decode_failed_op(&self, data: &Bytes) -> Option<FailedOp> {
        let failed = v06::FailedOp::abi_decode(data).ok()?;
        Some(FailedOp {
            index: failed.opIndex.saturating_to(),
            reason: failed.reason,
        })
    }
}
