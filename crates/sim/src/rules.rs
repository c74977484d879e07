//! Mempool safety rules applied to a validation trace.

use std::collections::HashMap;

use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use gantry_provider::ValidationTrace;
use gantry_reputation::ReputationTracker;
use gantry_types::{Entity, EntityType, PoolError, StakeInfo, VersionedUserOperation};

/// Opcodes whose outcome can differ between validation and inclusion.
/// The tracer only reports `GAS` when it does not directly feed a call.
const BANNED_OPCODES: &[&str] = &[
    "GASPRICE",
    "GASLIMIT",
    "DIFFICULTY",
    "PREVRANDAO",
    "TIMESTAMP",
    "BASEFEE",
    "BLOCKHASH",
    "NUMBER",
    "SELFBALANCE",
    "BALANCE",
    "ORIGIN",
    "GAS",
    "COINBASE",
    "SELFDESTRUCT",
    "CREATE",
];

/// Slots at `keccak(pad(address) ++ suffix)` plus this window are treated
/// as belonging to the address (mapping values and small structs).
const ASSOCIATED_SLOT_WINDOW: u64 = 128;

/// Whether `slot` is associated with `address` given the keccak preimages
/// observed during validation: either the padded address itself, or within
/// the window above a digest whose preimage starts with the padded address.
pub fn is_associated_slot(address: Address, slot: B256, keccak_preimages: &[Bytes]) -> bool {
    let padded = address.into_word();
    if slot == padded {
        return true;
    }
    let slot_value = U256::from_be_bytes(slot.0);
    keccak_preimages.iter().any(|preimage| {
        preimage.len() >= 32 && preimage[..32] == padded[..] && {
            let base = U256::from_be_bytes(keccak256(preimage).0);
            slot_value >= base && slot_value - base < U256::from(ASSOCIATED_SLOT_WINDOW)
        }
    })
}

/// Enforces the opcode, storage and call rules over every entity frame.
pub(crate) fn check_trace(
    op: &VersionedUserOperation,
    entry_point: Address,
    trace: &ValidationTrace,
    reputation: &ReputationTracker,
    stakes: &HashMap<Address, StakeInfo>,
) -> Result<(), PoolError> {
    let sender = op.sender();
    for frame in &trace.calls_from_entry_point {
        let Some(entity) = entity_for(op, frame.top_level_target_address) else {
            continue;
        };
        if frame.oog == Some(true) {
            return Err(PoolError::OutOfGas(entity));
        }
        for opcode in BANNED_OPCODES {
            if frame.opcodes.get(*opcode).copied().unwrap_or(0) > 0 {
                return Err(PoolError::OpcodeViolation {
                    entity,
                    opcode: (*opcode).to_owned(),
                });
            }
        }
        // One CREATE2 is legitimate: the factory deploying the account.
        let create2_budget = u64::from(entity.kind == EntityType::Factory);
        if frame.opcodes.get("CREATE2").copied().unwrap_or(0) > create2_budget {
            return Err(PoolError::OpcodeViolation {
                entity,
                opcode: "CREATE2".to_owned(),
            });
        }
        for (contract, access) in &frame.access {
            for slot in access.reads.keys().chain(access.writes.keys()) {
                if allowed_storage(sender, &entity, *contract, *slot, &trace.keccak) {
                    continue;
                }
                // Sufficient stake buys access to foreign storage.
                reputation
                    .check_stake(entity, stakes.get(&entity.address))
                    .map_err(|_| PoolError::UnassociatedStorage {
                        entity,
                        address: *contract,
                        slot: *slot,
                    })?;
            }
        }
    }

    for call in &trace.calls {
        if !matches!(call.op.as_str(), "CALL" | "CALLCODE") {
            continue;
        }
        let value = call.value.unwrap_or(U256::ZERO);
        if value > U256::ZERO && call.to != entry_point {
            // Only the entry point may be paid during validation (prefund).
            return Err(PoolError::CallWithValue {
                from: call.from,
                to: call.to,
            });
        }
    }
    Ok(())
}

fn allowed_storage(
    sender: Address,
    entity: &Entity,
    contract: Address,
    slot: B256,
    keccak_preimages: &[Bytes],
) -> bool {
    contract == entity.address
        || contract == sender
        || is_associated_slot(entity.address, slot, keccak_preimages)
        || is_associated_slot(sender, slot, keccak_preimages)
}

fn entity_for(op: &VersionedUserOperation, target: Address) -> Option<Entity> {
    if target == op.sender() {
        return Some(Entity::new(EntityType::Sender, target));
    }
    if op.factory() == Some(target) {
        return Some(Entity::new(EntityType::Factory, target));
    }
    if op.paymaster() == Some(target) {
        return Some(Entity::new(EntityType::Paymaster, target));
    }
    None
}
