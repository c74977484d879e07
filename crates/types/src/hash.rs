//! Protocol hashes for user operations.
//!
//! Both entry-point versions hash the same way at the outer layer:
//! `keccak256(abi.encode(innerHash, entryPoint, chainId))`. The inner hash
//! packs the operation with variable-length fields pre-hashed. v0.7
//! additionally packs gas-limit and fee pairs into single words.

use alloy_primitives::{Address, Bytes, ChainId, B256, U256, keccak256};
use alloy_rpc_types::erc4337;
use alloy_sol_types::{sol, SolValue};

sol!(
    #[derive(Debug)]
    struct PackedForHashV06 {
        address sender;
        uint256 nonce;
        bytes32 hashInitCode;
        bytes32 hashCallData;
        uint256 callGasLimit;
        uint256 verificationGasLimit;
        uint256 preVerificationGas;
        uint256 maxFeePerGas;
        uint256 maxPriorityFeePerGas;
        bytes32 hashPaymasterAndData;
    }

    #[derive(Debug)]
    struct PackedForHashV07 {
        address sender;
        uint256 nonce;
        bytes32 hashInitCode;
        bytes32 hashCallData;
        bytes32 accountGasLimits;
        uint256 preVerificationGas;
        bytes32 gasFees;
        bytes32 hashPaymasterAndData;
    }

    #[derive(Debug)]
    struct OuterHash {
        bytes32 innerHash;
        address entryPoint;
        uint256 chainId;
    }
);

fn outer_hash(inner: B256, entry_point: Address, chain_id: ChainId) -> B256 {
    keccak256(
        OuterHash {
            innerHash: inner,
            entryPoint: entry_point,
            chainId: U256::from(chain_id),
        }
        .abi_encode(),
    )
}

/// Two 128-bit quantities packed high/low into one word, as the v0.7 entry
/// point lays out `accountGasLimits` and `gasFees`.
fn pack_pair(high: U256, low: U256) -> B256 {
    let mask = (U256::from(1u64) << 128) - U256::from(1u64);
    let combined: U256 = ((high & mask) << 128) | (low & mask);
    B256::from(combined.to_be_bytes::<32>())
}

pub fn hash_user_operation_v06(
    op: &erc4337::UserOperation,
    entry_point: Address,
    chain_id: ChainId,
) -> B256 {
    let packed = PackedForHashV06 {
        sender: op.sender,
        nonce: op.nonce,
        hashInitCode: keccak256(&op.init_code),
        hashCallData: keccak256(&op.call_data),
        callGasLimit: op.call_gas_limit,
        verificationGasLimit: op.verification_gas_limit,
        preVerificationGas: op.pre_verification_gas,
        maxFeePerGas: op.max_fee_per_gas,
        maxPriorityFeePerGas: op.max_priority_fee_per_gas,
        hashPaymasterAndData: keccak256(&op.paymaster_and_data),
    };
    outer_hash(keccak256(packed.abi_encode()), entry_point, chain_id)
}

pub fn hash_user_operation_v07(
    op: &erc4337::PackedUserOperation,
    entry_point: Address,
    chain_id: ChainId,
) -> B256 {
    let packed = PackedForHashV07 {
        sender: op.sender,
        nonce: op.nonce,
        hashInitCode: keccak256(v07_init_code(op)),
        hashCallData: keccak256(&op.call_data),
        accountGasLimits: pack_pair(op.verification_gas_limit, op.call_gas_limit),
        preVerificationGas: op.pre_verification_gas,
        gasFees: pack_pair(op.max_priority_fee_per_gas, op.max_fee_per_gas),
        hashPaymasterAndData: keccak256(v07_paymaster_and_data(op)),
    };
    outer_hash(keccak256(packed.abi_encode()), entry_point, chain_id)
}

fn v07_init_code(op: &erc4337::PackedUserOperation) -> Bytes {
    match op.factory {
        Some(factory) => {
            let mut buf = factory.to_vec();
            buf.extend_from_slice(&op.factory_data.clone().unwrap_or_default());
            Bytes::from(buf)
        }
        None => Bytes::new(),
    }
}

fn v07_paymaster_and_data(op: &erc4337::PackedUserOperation) -> Bytes {
    match op.paymaster {
        Some(paymaster) => {
            let mut buf = paymaster.to_vec();
            let verification: [u8; 16] = op
                .paymaster_verification_gas_limit
                .unwrap_or_default()
                .to::<u128>()
                .to_be_bytes();
            let post_op: [u8; 16] = op
                .paymaster_post_op_gas_limit
                .unwrap_or_default()
                .to::<u128>()
                .to_be_bytes();
            buf.extend_from_slice(&verification);
            buf.extend_from_slice(&post_op);
            buf.extend_from_slice(&op.paymaster_data.clone().unwrap_or_default());
            Bytes::from(buf)
        }
        None => Bytes::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256, bytes, uint};

    // Vector from a live v0.7 operation on Sepolia.
    #[test]
    fn v07_hash_matches_known_vector() {
        let op = erc4337::PackedUserOperation {
            sender: address!("b292Cf4a8E1fF21Ac27C4f94071Cd02C022C414b"),
            nonce: uint!(0xF83D07238A7C8814A48535035602123AD6DBFA63000000000000000000000001_U256),
            factory: None,
            factory_data: None,
            call_data: bytes!("e9ae5c530000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000004000000000000000000000000000000000000000000000000000000000000001d8b292cf4a8e1ff21ac27c4f94071cd02c022c414b00000000000000000000000000000000000000000000000000000000000000009517e29f0000000000000000000000000000000000000000000000000000000000000002000000000000000000000000ad6330089d9a1fe89f4020292e1afe9969a5a2fc000000000000000000000000000000000000000000000000000000000000006000000000000000000000000000000000000000000000000000000000000001200000000000000000000000000000000000000000000000000000000000015180000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000018e2fbe8980000000000000000000000000000000000000000000000000000000000000008000000000000000000000000000000000000000000000000000000000000000800000000000000000000000002372912728f93ab3daaaebea4f87e6e28476d987000000000000000000000000000000000000000000000000002386f26fc1000000000000000000000000000000000000000000000000000000000000000000600000000000000000000000000000000000000000000000000000000000000000000000000000000"),
            call_gas_limit: U256::from(0x12c9b5u64),
            verification_gas_limit: U256::from(0x114fcu64),
            pre_verification_gas: U256::from(48_916),
            max_fee_per_gas: U256::from(0x109a4a441au64),
            max_priority_fee_per_gas: U256::from(0x524121u64),
            paymaster: None,
            paymaster_verification_gas_limit: None,
            paymaster_post_op_gas_limit: None,
            paymaster_data: None,
            signature: bytes!("3c7bfe22c9c2ef8994a9637bcc4df1741c5dc0c25b209545a7aeb20f7770f351479b683bd17c4d55bc32e2a649c8d2dff49dcfcc1f3fd837bcd88d1e69a434cf1c"),
        };

        let hash = hash_user_operation_v07(
            &op,
            address!("0000000071727De22E5E9d8BAf0edAc6f37da032"),
            11155111,
        );
        assert_eq!(
            hash,
            b256!("e486401370d145766c3cf7ba089553214a1230d38662ae532c9b62eb6dadcf7e")
        );
    }

    #[test]
    fn pack_pair_layout() {
        let packed = pack_pair(U256::from(0x114fcu64), U256::from(0x12c9b5u64));
        assert_eq!(
            packed,
            b256!("000000000000000000000000000114fc0000000000000000000000000012c9b5")
        );
    }

    #[test]
    fn v06_hash_is_chain_and_entry_point_bound() {
        let op = erc4337::UserOperation {
            sender: address!("1111111111111111111111111111111111111111"),
            nonce: U256::from(1),
            init_code: Bytes::default(),
            call_data: Bytes::default(),
            call_gas_limit: U256::from(100_000),
            verification_gas_limit: U256::from(100_000),
            pre_verification_gas: U256::from(21_000),
            max_fee_per_gas: U256::from(10),
            max_priority_fee_per_gas: U256::from(1),
            paymaster_and_data: Bytes::default(),
            signature: Bytes::default(),
        };
        let ep = address!("5FF137D4b0FDCD49DcA30c7CF57E578a026d2789");
        let h1 = hash_user_operation_v06(&op, ep, 1);
        let h2 = hash_user_operation_v06(&op, ep, 10);
        let h3 = hash_user_operation_v06(&op, Address::ZERO, 1);
        assert_ne!(h1, h2);
        assert_ne!(h1, h3);
    }
}
