//! Per-address reputation with lazy 24-hour linear decay.
//!
//! Counters are stored raw and decayed on read; every write re-anchors the
//! decay clock at the decayed value plus the increment. There is no
//! background sweep, so two reads with no write in between always observe a
//! monotonically non-increasing value.

use std::collections::{HashMap, HashSet};

use alloy_primitives::{Address, U256};
use chrono::{DateTime, Utc};
use gantry_types::{Entity, PoolError, StakeInfo};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

const DECAY_HOURS: i64 = 24;

/// Base allowance of pool slots for an unstaked entity.
const UNSTAKED_SLOTS_BASE: u64 = 10;
/// Multiplier on the entity's inclusion rate.
const INCLUSION_RATE_FACTOR: u64 = 10;
/// Cap on the inclusion bonus.
const UNSTAKED_SLOTS_INCLUDED_CAP: u64 = 10_000;

/// Ban/throttle thresholds, per network.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReputationParams {
    pub min_inclusion_denominator: u64,
    pub throttling_slack: u64,
    pub ban_slack: u64,
}

impl Default for ReputationParams {
    fn default() -> Self {
        Self {
            min_inclusion_denominator: 10,
            throttling_slack: 10,
            ban_slack: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReputationStatus {
    Ok,
    Throttled,
    Banned,
}

/// Effective (decayed) counters for one address.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReputationSummary {
    pub address: Address,
    pub ops_seen: u64,
    pub ops_included: u64,
    pub status: ReputationStatus,
}

#[derive(Debug, Clone, Copy)]
struct Record {
    ops_seen: u64,
    ops_included: u64,
    anchor: DateTime<Utc>,
}

impl Record {
    fn decayed(&self, now: DateTime<Utc>) -> (u64, u64) {
        (
            decay(self.ops_seen, self.anchor, now),
            decay(self.ops_included, self.anchor, now),
        )
    }
}

fn decay(raw: u64, anchor: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let elapsed_hours = (now - anchor).num_hours();
    if elapsed_hours <= 0 {
        return raw;
    }
    if elapsed_hours >= DECAY_HOURS {
        return 0;
    }
    raw * (DECAY_HOURS - elapsed_hours) as u64 / DECAY_HOURS as u64
}

/// Stake requirements checked against on-chain-reported values.
#[derive(Debug, Clone, Copy, Default)]
pub struct StakeRequirements {
    pub min_stake: U256,
    pub min_unstake_delay_sec: u64,
}

/// Tracks seen/included counters per address and derives ban/throttle
/// status. Read-modify-write sequences are serialized by an interior lock.
pub struct ReputationTracker {
    params: ReputationParams,
    stake_requirements: StakeRequirements,
    whitelist: HashSet<Address>,
    blacklist: HashSet<Address>,
    records: Mutex<HashMap<Address, Record>>,
}

impl ReputationTracker {
    pub fn new(
        params: ReputationParams,
        stake_requirements: StakeRequirements,
        whitelist: HashSet<Address>,
        blacklist: HashSet<Address>,
    ) -> Self {
        Self {
            params,
            stake_requirements,
            whitelist,
            blacklist,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, address: Address) -> ReputationSummary {
        self.get_at(address, Utc::now())
    }

    pub fn record_seen(&self, address: Address) {
        self.record_seen_at(address, Utc::now());
    }

    pub fn record_included(&self, address: Address) {
        self.record_included_at(address, Utc::now());
    }

    pub fn status(&self, address: Address) -> ReputationStatus {
        self.get(address).status
    }

    /// Administrative override; anchors the counters at `now`.
    pub fn set_reputation(&self, address: Address, ops_seen: u64, ops_included: u64) {
        self.records.lock().insert(
            address,
            Record {
                ops_seen,
                ops_included,
                anchor: Utc::now(),
            },
        );
    }

    pub fn dump(&self) -> Vec<ReputationSummary> {
        let now = Utc::now();
        let records = self.records.lock();
        records
            .keys()
            .map(|address| self.summary_locked(&records, *address, now))
            .collect()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    /// How many pool slots this address may hold while unstaked, derived
    /// from its inclusion rate.
    pub fn allowed_unstaked_count(&self, address: Address) -> u64 {
        let summary = self.get(address);
        let rate_bonus = if summary.ops_seen == 0 {
            0
        } else {
            INCLUSION_RATE_FACTOR * summary.ops_included / summary.ops_seen
        };
        UNSTAKED_SLOTS_BASE
            + rate_bonus
            + summary.ops_included.min(UNSTAKED_SLOTS_INCLUDED_CAP)
    }

    /// Verifies an entity's stake against the configured minimums. The
    /// whitelist short-circuits to success, the blacklist to a ban; every
    /// failure is a typed error, never a nullable sentinel.
    pub fn check_stake(&self, entity: Entity, info: Option<&StakeInfo>) -> Result<(), PoolError> {
        if self.blacklist.contains(&entity.address) {
            return Err(PoolError::EntityBanned(entity));
        }
        if self.whitelist.contains(&entity.address) {
            return Ok(());
        }
        if self.status(entity.address) == ReputationStatus::Banned {
            return Err(PoolError::EntityBanned(entity));
        }
        let info = info.ok_or(PoolError::StakeInsufficient {
            entity,
            stake: U256::ZERO,
            unstake_delay_sec: 0,
        })?;
        if !info.is_staked()
            || info.stake < self.stake_requirements.min_stake
            || info.unstake_delay_sec < self.stake_requirements.min_unstake_delay_sec
        {
            return Err(PoolError::StakeInsufficient {
                entity,
                stake: info.stake,
                unstake_delay_sec: info.unstake_delay_sec,
            });
        }
        Ok(())
    }

    // Clock-explicit variants. Production callers use the wall-clock
    // wrappers above; tests drive these directly.

    pub fn get_at(&self, address: Address, now: DateTime<Utc>) -> ReputationSummary {
        let records = self.records.lock();
        self.summary_locked(&records, address, now)
    }

    pub fn record_seen_at(&self, address: Address, now: DateTime<Utc>) {
        let mut records = self.records.lock();
        let (seen, included) = records
            .get(&address)
            .map(|r| r.decayed(now))
            .unwrap_or((0, 0));
        records.insert(
            address,
            Record {
                ops_seen: seen + 1,
                ops_included: included,
                anchor: now,
            },
        );
    }

    pub fn record_included_at(&self, address: Address, now: DateTime<Utc>) {
        let mut records = self.records.lock();
        let (seen, included) = records
            .get(&address)
            .map(|r| r.decayed(now))
            .unwrap_or((0, 0));
        records.insert(
            address,
            Record {
                ops_seen: seen,
                ops_included: included + 1,
                anchor: now,
            },
        );
        debug!(address = %address, "recorded inclusion");
    }

    fn summary_locked(
        &self,
        records: &HashMap<Address, Record>,
        address: Address,
        now: DateTime<Utc>,
    ) -> ReputationSummary {
        let (ops_seen, ops_included) = records
            .get(&address)
            .map(|r| r.decayed(now))
            .unwrap_or((0, 0));
        ReputationSummary {
            address,
            ops_seen,
            ops_included,
            status: self.derive_status(address, ops_seen, ops_included),
        }
    }

    fn derive_status(&self, address: Address, seen: u64, included: u64) -> ReputationStatus {
        if self.blacklist.contains(&address) {
            return ReputationStatus::Banned;
        }
        if self.whitelist.contains(&address) {
            return ReputationStatus::Ok;
        }
        let min_expected_included = seen / self.params.min_inclusion_denominator;
        if min_expected_included > included + self.params.ban_slack {
            ReputationStatus::Banned
        } else if min_expected_included > included + self.params.throttling_slack {
            ReputationStatus::Throttled
        } else {
            ReputationStatus::Ok
        }
    }
}

impl Default for ReputationTracker {
    fn default() -> Self {
        Self::new(
            ReputationParams::default(),
            StakeRequirements::default(),
            HashSet::new(),
            HashSet::new(),
        )
    }
}
