use std::collections::HashMap;

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

use crate::entry::PoolEntry;

/// EIP-1559 fee pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasFees {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Declared storage access for one address, as recorded by the validation
/// tracer. Either a whole-account marker or individual slot values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StorageAccess {
    RootHash(B256),
    Slots(HashMap<B256, B256>),
}

pub type StorageMap = HashMap<Address, StorageAccess>;

/// Merge `other` into `map`. Slot maps union per address; a root-hash marker
/// for an address supersedes slot granularity.
pub fn merge_storage_maps(map: &mut StorageMap, other: &StorageMap) {
    for (address, access) in other {
        match (map.get_mut(address), access) {
            (Some(StorageAccess::Slots(existing)), StorageAccess::Slots(incoming)) => {
                existing.extend(incoming.iter().map(|(k, v)| (*k, *v)));
            }
            (Some(_), StorageAccess::Slots(_)) => {}
            (_, access) => {
                map.insert(*address, access.clone());
            }
        }
    }
}

/// An ordered batch of entries ready for one `handleOps` transaction.
/// Ephemeral: built, submitted, discarded.
#[derive(Debug, Clone, Default)]
pub struct Bundle {
    pub entries: Vec<PoolEntry>,
    pub storage_map: StorageMap,
    pub gas_fees: GasFees,
}

impl Bundle {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Total gas the bundle may consume, by the members' declared limits.
    pub fn gas_estimate(&self) -> U256 {
        self.entries
            .iter()
            .map(|e| {
                e.operation.call_gas_limit()
                    + e.operation.verification_gas_limit()
                    + e.operation.pre_verification_gas()
            })
            .fold(U256::ZERO, |acc, g| acc + g)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn merge_unions_slots() {
        let addr = address!("1111111111111111111111111111111111111111");
        let mut a: StorageMap = HashMap::new();
        a.insert(
            addr,
            StorageAccess::Slots(HashMap::from([(B256::with_last_byte(1), B256::ZERO)])),
        );
        let mut b: StorageMap = HashMap::new();
        b.insert(
            addr,
            StorageAccess::Slots(HashMap::from([(B256::with_last_byte(2), B256::ZERO)])),
        );
        merge_storage_maps(&mut a, &b);
        match a.get(&addr).unwrap() {
            StorageAccess::Slots(slots) => assert_eq!(slots.len(), 2),
            _ => panic!("expected slots"),
        }
    }

    #[test]
    fn root_hash_marker_wins() {
        let addr = address!("1111111111111111111111111111111111111111");
        let mut a: StorageMap = HashMap::new();
        a.insert(
            addr,
            StorageAccess::Slots(HashMap::from([(B256::with_last_byte(1), B256::ZERO)])),
        );
        let mut b: StorageMap = HashMap::new();
        b.insert(addr, StorageAccess::RootHash(B256::with_last_byte(9)));
        merge_storage_maps(&mut a, &b);
        assert!(matches!(a.get(&addr), Some(StorageAccess::RootHash(_))));

        // and slots never demote an existing marker
        let mut c: StorageMap = HashMap::new();
        c.insert(
            addr,
            StorageAccess::Slots(HashMap::from([(B256::with_last_byte(3), B256::ZERO)])),
        );
        merge_storage_maps(&mut a, &c);
        assert!(matches!(a.get(&addr), Some(StorageAccess::RootHash(_))));
    }
}
