use alloy_primitives::{Address, Bytes, ChainId, FixedBytes, U256};
use alloy_rpc_types::erc4337;
use serde::{Deserialize, Serialize};

use crate::error::PoolError;
use crate::hash;

pub type UserOpHash = FixedBytes<32>;

/// Floor for the declared pre-verification gas; nothing executes for less
/// than the intrinsic transaction cost.
pub const MIN_PRE_VERIFICATION_GAS: u64 = 21_000;

/// A user operation for either entry-point version. Deserialization is
/// untagged: v0.7 payloads carry `factory`/`paymaster` as discrete fields,
/// v0.6 payloads carry `initCode`/`paymasterAndData` blobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum VersionedUserOperation {
    UserOperation(erc4337::UserOperation),
    PackedUserOperation(erc4337::PackedUserOperation),
}

impl VersionedUserOperation {
    pub fn sender(&self) -> Address {
        match self {
            Self::UserOperation(op) => op.sender,
            Self::PackedUserOperation(op) => op.sender,
        }
    }

    pub fn nonce(&self) -> U256 {
        match self {
            Self::UserOperation(op) => op.nonce,
            Self::PackedUserOperation(op) => op.nonce,
        }
    }

    pub fn max_fee_per_gas(&self) -> U256 {
        match self {
            Self::UserOperation(op) => op.max_fee_per_gas,
            Self::PackedUserOperation(op) => op.max_fee_per_gas,
        }
    }

    pub fn max_priority_fee_per_gas(&self) -> U256 {
        match self {
            Self::UserOperation(op) => op.max_priority_fee_per_gas,
            Self::PackedUserOperation(op) => op.max_priority_fee_per_gas,
        }
    }

    pub fn call_gas_limit(&self) -> U256 {
        match self {
            Self::UserOperation(op) => op.call_gas_limit,
            Self::PackedUserOperation(op) => op.call_gas_limit,
        }
    }

    pub fn verification_gas_limit(&self) -> U256 {
        match self {
            Self::UserOperation(op) => op.verification_gas_limit,
            Self::PackedUserOperation(op) => op.verification_gas_limit,
        }
    }

    pub fn pre_verification_gas(&self) -> U256 {
        match self {
            Self::UserOperation(op) => op.pre_verification_gas,
            Self::PackedUserOperation(op) => op.pre_verification_gas,
        }
    }

    pub fn signature(&self) -> &Bytes {
        match self {
            Self::UserOperation(op) => &op.signature,
            Self::PackedUserOperation(op) => &op.signature,
        }
    }

    /// The factory address, if the operation deploys its sender. For v0.6
    /// this is the first 20 bytes of a non-empty init code.
    pub fn factory(&self) -> Option<Address> {
        match self {
            Self::UserOperation(op) => address_prefix(&op.init_code),
            Self::PackedUserOperation(op) => op.factory,
        }
    }

    /// The paymaster address, if gas is sponsored.
    pub fn paymaster(&self) -> Option<Address> {
        match self {
            Self::UserOperation(op) => address_prefix(&op.paymaster_and_data),
            Self::PackedUserOperation(op) => op.paymaster,
        }
    }

    /// Protocol-level hash binding the operation to an entry point and chain.
    pub fn hash(&self, entry_point: Address, chain_id: ChainId) -> UserOpHash {
        match self {
            Self::UserOperation(op) => hash::hash_user_operation_v06(op, entry_point, chain_id),
            Self::PackedUserOperation(op) => {
                hash::hash_user_operation_v07(op, entry_point, chain_id)
            }
        }
    }

    /// Maximum wei the entry point may need to withhold for this operation.
    /// With a paymaster the verification limit is charged up to three times
    /// (validation, paymaster validation, postOp).
    pub fn max_prefund(&self) -> U256 {
        let verification_mul = if self.paymaster().is_some() {
            U256::from(3)
        } else {
            U256::from(1)
        };
        let gas = self.verification_gas_limit() * verification_mul
            + self.call_gas_limit()
            + self.pre_verification_gas();
        gas * self.max_fee_per_gas()
    }

    /// Structural sanity checks that need no simulation. Run before any
    /// network round-trip on admission.
    pub fn precheck(&self) -> Result<(), PoolError> {
        if self.sender() == Address::ZERO {
            return Err(PoolError::InvalidOperation(
                "sender is the zero address".into(),
            ));
        }
        if self.max_fee_per_gas() < self.max_priority_fee_per_gas() {
            return Err(PoolError::InvalidOperation(
                "maxPriorityFeePerGas exceeds maxFeePerGas".into(),
            ));
        }
        if self.pre_verification_gas() < U256::from(MIN_PRE_VERIFICATION_GAS) {
            return Err(PoolError::InvalidOperation(format!(
                "preVerificationGas below the {MIN_PRE_VERIFICATION_GAS} floor"
            )));
        }
        if let Self::UserOperation(op) = self {
            if !op.init_code.is_empty() && op.init_code.len() < 20 {
                return Err(PoolError::InvalidOperation(
                    "initCode shorter than a factory address".into(),
                ));
            }
            if !op.paymaster_and_data.is_empty() && op.paymaster_and_data.len() < 20 {
                return Err(PoolError::InvalidOperation(
                    "paymasterAndData shorter than a paymaster address".into(),
                ));
            }
        }
        Ok(())
    }

    /// Every entity this operation references, sender first.
    pub fn entities(&self) -> Vec<Entity> {
        let mut out = vec![Entity::new(EntityType::Sender, self.sender())];
        if let Some(factory) = self.factory() {
            out.push(Entity::new(EntityType::Factory, factory));
        }
        if let Some(paymaster) = self.paymaster() {
            out.push(Entity::new(EntityType::Paymaster, paymaster));
        }
        out
    }
}

fn address_prefix(data: &Bytes) -> Option<Address> {
    if data.len() >= 20 {
        Some(Address::from_slice(&data[..20]))
    } else {
        None
    }
}

/// Role an address plays in a user operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Sender,
    Factory,
    Paymaster,
    Aggregator,
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Sender => "account",
            Self::Factory => "factory",
            Self::Paymaster => "paymaster",
            Self::Aggregator => "aggregator",
        };
        f.write_str(name)
    }
}

/// An address together with the role it plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    pub kind: EntityType,
    pub address: Address,
}

impl Entity {
    pub fn new(kind: EntityType, address: Address) -> Self {
        Self { kind, address }
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, bytes};

    fn v06_op(init_code: Bytes, paymaster_and_data: Bytes) -> VersionedUserOperation {
        VersionedUserOperation::UserOperation(erc4337::UserOperation {
            sender: address!("1111111111111111111111111111111111111111"),
            nonce: U256::from(7),
            init_code,
            call_data: Bytes::default(),
            call_gas_limit: U256::from(100_000),
            verification_gas_limit: U256::from(200_000),
            pre_verification_gas: U256::from(21_000),
            max_fee_per_gas: U256::from(10),
            max_priority_fee_per_gas: U256::from(2),
            paymaster_and_data,
            signature: Bytes::default(),
        })
    }

    #[test]
    fn factory_from_init_code_prefix() {
        let op = v06_op(
            bytes!("22222222222222222222222222222222222222220011"),
            Bytes::default(),
        );
        assert_eq!(
            op.factory(),
            Some(address!("2222222222222222222222222222222222222222"))
        );
        assert_eq!(op.paymaster(), None);
    }

    #[test]
    fn short_init_code_has_no_factory() {
        let op = v06_op(bytes!("aabb"), Bytes::default());
        assert_eq!(op.factory(), None);
    }

    #[test]
    fn prefund_triples_verification_gas_with_paymaster() {
        let plain = v06_op(Bytes::default(), Bytes::default());
        let sponsored = v06_op(
            Bytes::default(),
            bytes!("3333333333333333333333333333333333333333"),
        );
        // (200k + 100k + 21k) * 10 vs (600k + 100k + 21k) * 10
        assert_eq!(plain.max_prefund(), U256::from(3_210_000));
        assert_eq!(sponsored.max_prefund(), U256::from(7_210_000));
    }

    #[test]
    fn entities_includes_all_roles() {
        let op = v06_op(
            bytes!("2222222222222222222222222222222222222222"),
            bytes!("3333333333333333333333333333333333333333"),
        );
        let entities = op.entities();
        assert_eq!(entities.len(), 3);
        assert_eq!(entities[0].kind, EntityType::Sender);
        assert_eq!(entities[1].kind, EntityType::Factory);
        assert_eq!(entities[2].kind, EntityType::Paymaster);
    }

    #[test]
    fn precheck_accepts_a_well_formed_operation() {
        let op = v06_op(Bytes::default(), Bytes::default());
        assert!(op.precheck().is_ok());
    }

    #[test]
    fn precheck_rejects_inverted_fees() {
        let mut op = match v06_op(Bytes::default(), Bytes::default()) {
            VersionedUserOperation::UserOperation(op) => op,
            _ => unreachable!(),
        };
        op.max_priority_fee_per_gas = op.max_fee_per_gas + U256::from(1);
        let err = VersionedUserOperation::UserOperation(op).precheck().unwrap_err();
        assert!(matches!(err, PoolError::InvalidOperation(_)));
    }

    #[test]
    fn precheck_rejects_low_pre_verification_gas() {
        let mut op = match v06_op(Bytes::default(), Bytes::default()) {
            VersionedUserOperation::UserOperation(op) => op,
            _ => unreachable!(),
        };
        op.pre_verification_gas = U256::from(MIN_PRE_VERIFICATION_GAS - 1);
        assert!(VersionedUserOperation::UserOperation(op).precheck().is_err());
    }

    #[test]
    fn precheck_rejects_truncated_entity_blobs() {
        let op = v06_op(bytes!("aabb"), Bytes::default());
        assert!(op.precheck().is_err());
        let op = v06_op(Bytes::default(), bytes!("ccdd"));
        assert!(op.precheck().is_err());
    }
}
