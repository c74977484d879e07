use std::sync::Arc;

use alloy_primitives::{Address, ChainId, TxHash, U256};
use chrono::{DateTime, Duration, Utc};
use gantry_reputation::{ReputationStatus, ReputationTracker};
use gantry_types::{
    Entity, EntityType, EntryId, EntryStatus, PoolEntry, PoolError, PoolEvent, StakeInfo,
    UserOpHash, ValidationOutcome,
};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::store::{EntryStore, KeyValueStore};

/// Admission-side knobs. Slot counts follow the ERC-4337 reputation rules.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub chain_id: ChainId,
    pub entry_point: Address,
    /// Age past which an entry may be replaced without a fee bump.
    pub entry_ttl: Duration,
    /// How long terminal entries are kept for inspection before purge.
    pub archive_ttl: Duration,
    /// Required fee increase, in percent, for an in-place replacement.
    pub replacement_fee_bump_percent: u64,
    /// Pool slots for one unstaked sender.
    pub same_sender_slots: u64,
    /// Pool slots for a throttled entity.
    pub throttled_entity_slots: u64,
    pub event_buffer: usize,
}

impl PoolConfig {
    pub fn new(chain_id: ChainId, entry_point: Address) -> Self {
        Self {
            chain_id,
            entry_point,
            entry_ttl: Duration::minutes(15),
            archive_ttl: Duration::hours(1),
            replacement_fee_bump_percent: 10,
            same_sender_slots: 4,
            throttled_entity_slots: 4,
            event_buffer: 1024,
        }
    }
}

/// One status transition to apply to one entry.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub id: EntryId,
    pub status: EntryStatus,
    pub tx_hash: Option<TxHash>,
    pub reason: Option<String>,
}

impl StatusChange {
    pub fn new(id: EntryId, status: EntryStatus) -> Self {
        Self {
            id,
            status,
            tx_hash: None,
            reason: None,
        }
    }

    pub fn with_tx_hash(mut self, tx_hash: TxHash) -> Self {
        self.tx_hash = Some(tx_hash);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// The pending pool for one chain. Every mutation runs under a single async
/// lock; reads clone out of the locked working set.
pub struct UoPool {
    config: PoolConfig,
    reputation: Arc<ReputationTracker>,
    store: Mutex<EntryStore>,
    events: broadcast::Sender<PoolEvent>,
}

impl UoPool {
    pub fn new(
        config: PoolConfig,
        reputation: Arc<ReputationTracker>,
        kv: Arc<dyn KeyValueStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer);
        let store = Mutex::new(EntryStore::new(config.chain_id, kv));
        Self {
            config,
            reputation,
            store,
            events,
        }
    }

    /// Rebuilds the working set from the key-value store after a restart.
    pub async fn recover(&self) -> Result<usize, PoolError> {
        self.store
            .lock()
            .await
            .load()
            .await
            .map_err(|e| PoolError::Internal(e.to_string()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn entry_point(&self) -> Address {
        self.config.entry_point
    }

    pub fn chain_id(&self) -> ChainId {
        self.config.chain_id
    }

    /// Admits a validated entry. Exactly one live entry may exist per
    /// (chain, sender, nonce); an occupied slot is taken over only when the
    /// incumbent is past `OnChain`, older than the TTL, or outbid on both
    /// fee fields by the configured bump.
    pub async fn admit(
        &self,
        entry: PoolEntry,
        validation: &ValidationOutcome,
    ) -> Result<UserOpHash, PoolError> {
        self.admit_at(entry, validation, Utc::now()).await
    }

    pub async fn admit_at(
        &self,
        entry: PoolEntry,
        validation: &ValidationOutcome,
        now: DateTime<Utc>,
    ) -> Result<UserOpHash, PoolError> {
        let mut store = self.store.lock().await;

        if store.contains_hash(&entry.hash) {
            return Err(PoolError::AlreadyKnown);
        }

        let id = entry.id();
        if let Some(existing) = store.find(&id) {
            self.check_replacement(existing, &entry, now)?;
            store
                .remove(&id)
                .await
                .map_err(|e| PoolError::Internal(e.to_string()))?;
            debug!(%id, "replaced pool entry");
        } else {
            self.check_entity_limits(&store, &entry, validation)?;
        }
        self.check_role_exclusivity(&store, &entry)?;

        let hash = entry.hash;
        for entity in referenced_entities(&entry) {
            self.reputation.record_seen(entity.address);
        }
        let event = PoolEvent::PendingUserOp {
            entry: entry.clone(),
        };
        store
            .put(entry)
            .await
            .map_err(|e| PoolError::Internal(e.to_string()))?;
        let _ = self.events.send(event);
        info!(%id, %hash, "admitted user operation");
        Ok(hash)
    }

    fn check_replacement(
        &self,
        existing: &PoolEntry,
        candidate: &PoolEntry,
        now: DateTime<Utc>,
    ) -> Result<(), PoolError> {
        // Slots past OnChain are free, as are stale ones.
        if existing.status.rank() >= EntryStatus::OnChain.rank()
            || existing.age(now) > self.config.entry_ttl
        {
            return Ok(());
        }
        let bump = U256::from(100 + self.config.replacement_fee_bump_percent);
        let min_priority_fee =
            existing.operation.max_priority_fee_per_gas() * bump / U256::from(100);
        let min_fee = existing.operation.max_fee_per_gas() * bump / U256::from(100);
        if candidate.operation.max_priority_fee_per_gas() < min_priority_fee
            || candidate.operation.max_fee_per_gas() < min_fee
        {
            return Err(PoolError::InvalidReplacement {
                min_priority_fee,
                min_fee,
            });
        }
        Ok(())
    }

    fn check_entity_limits(
        &self,
        store: &EntryStore,
        entry: &PoolEntry,
        validation: &ValidationOutcome,
    ) -> Result<(), PoolError> {
        for entity in referenced_entities(entry) {
            let count = count_in_role(store, &entity);
            match self.reputation.status(entity.address) {
                ReputationStatus::Banned => return Err(PoolError::EntityBanned(entity)),
                ReputationStatus::Throttled => {
                    if count >= self.config.throttled_entity_slots {
                        return Err(PoolError::EntityThrottled(entity));
                    }
                }
                ReputationStatus::Ok => {}
            }
            let unstaked_slots = match entity.kind {
                EntityType::Sender => self.config.same_sender_slots,
                _ => self.reputation.allowed_unstaked_count(entity.address),
            };
            if count >= unstaked_slots {
                // Staked entities are exempt from slot limits.
                self.reputation
                    .check_stake(entity, stake_info_for(validation, entity.kind))?;
            }
        }
        Ok(())
    }

    /// An address may not act as a sender in one entry and as a
    /// factory/paymaster/aggregator in another.
    fn check_role_exclusivity(
        &self,
        store: &EntryStore,
        entry: &PoolEntry,
    ) -> Result<(), PoolError> {
        let id = entry.id();
        let sender = entry.operation.sender();
        for existing in store.all() {
            if existing.status.is_terminal() || existing.id() == id {
                continue;
            }
            for (role, address) in [
                ("factory", existing.factory),
                ("paymaster", existing.paymaster),
                ("aggregator", existing.aggregator),
            ] {
                if address == Some(sender) {
                    return Err(PoolError::RoleConflict {
                        address: sender,
                        conflicting_role: role.to_owned(),
                    });
                }
            }
            let other_sender = existing.operation.sender();
            for (role, address) in [
                ("factory", entry.factory),
                ("paymaster", entry.paymaster),
                ("aggregator", entry.aggregator),
            ] {
                if address == Some(other_sender) {
                    return Err(PoolError::RoleConflict {
                        address: other_sender,
                        conflicting_role: role.to_owned(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Applies status transitions, skipping any that would break rank
    /// monotonicity. Returns the entries as updated.
    pub async fn update_status(
        &self,
        changes: Vec<StatusChange>,
    ) -> Result<Vec<PoolEntry>, PoolError> {
        let now = Utc::now();
        let mut store = self.store.lock().await;
        let mut updated = Vec::with_capacity(changes.len());
        for change in changes {
            let Some(existing) = store.find(&change.id) else {
                warn!(id = %change.id, "status change for unknown entry");
                continue;
            };
            if !existing.status.can_transition_to(change.status) {
                warn!(
                    id = %change.id,
                    from = ?existing.status,
                    to = ?change.status,
                    "illegal status transition skipped"
                );
                continue;
            }
            let mut entry = existing.clone();
            entry.status = change.status;
            entry.last_updated_at = now;
            match change.status {
                EntryStatus::New => {
                    // Recovery path: detach from the failed submission.
                    entry.tx_hash = None;
                    entry.submitted_at = None;
                }
                EntryStatus::Pending => entry.submit_attempts += 1,
                EntryStatus::Submitted => {
                    entry.submitted_at = Some(now);
                    entry.tx_hash = change.tx_hash.or(entry.tx_hash);
                }
                EntryStatus::OnChain => {
                    entry.actual_tx_hash = change.tx_hash.or(entry.tx_hash);
                    for entity in referenced_entities(&entry) {
                        self.reputation.record_included(entity.address);
                    }
                }
                EntryStatus::Reverted | EntryStatus::Cancelled => {
                    entry.revert_reason = change.reason.clone();
                }
            }
            let event = match change.status {
                EntryStatus::Submitted => Some(PoolEvent::SubmittedUserOp {
                    entry: entry.clone(),
                }),
                EntryStatus::Cancelled => Some(PoolEvent::CancelledUserOp {
                    entry: entry.clone(),
                    reason: change.reason.clone().unwrap_or_default(),
                }),
                EntryStatus::Reverted => Some(PoolEvent::RevertedUserOp {
                    entry: entry.clone(),
                    reason: change.reason.unwrap_or_default(),
                }),
                _ => None,
            };
            store
                .put(entry.clone())
                .await
                .map_err(|e| PoolError::Internal(e.to_string()))?;
            if let Some(event) = event {
                let _ = self.events.send(event);
            }
            updated.push(entry);
        }
        Ok(updated)
    }

    /// Removes an entry outright, bypassing the status machine. Used when a
    /// banned entity invalidates an entry mid-bundle.
    pub async fn remove(&self, id: &EntryId) -> Result<Option<PoolEntry>, PoolError> {
        self.store
            .lock()
            .await
            .remove(id)
            .await
            .map_err(|e| PoolError::Internal(e.to_string()))
    }

    pub async fn find(&self, id: &EntryId) -> Option<PoolEntry> {
        self.store.lock().await.find(id).cloned()
    }

    pub async fn find_by_hash(&self, hash: &UserOpHash) -> Option<PoolEntry> {
        self.store.lock().await.find_by_hash(hash).cloned()
    }

    /// Entries awaiting their first bundle attempt, highest priority fee
    /// first. Ties break on arrival order, then hash, so the order is total
    /// and stable across calls.
    pub async fn pending_sorted_by_fee(&self) -> Vec<PoolEntry> {
        let store = self.store.lock().await;
        let mut pending: Vec<PoolEntry> = store
            .all()
            .filter(|e| e.status == EntryStatus::New)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.operation
                .max_priority_fee_per_gas()
                .cmp(&a.operation.max_priority_fee_per_gas())
                .then(a.added_at.cmp(&b.added_at))
                .then(a.hash.cmp(&b.hash))
        });
        pending
    }

    pub async fn dump(&self) -> Vec<PoolEntry> {
        self.store.lock().await.all().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.store.lock().await.len()
    }

    /// Drops terminal entries whose last update is past the archive window.
    pub async fn purge_archived(&self) -> Result<usize, PoolError> {
        self.purge_archived_at(Utc::now()).await
    }

    pub async fn purge_archived_at(&self, now: DateTime<Utc>) -> Result<usize, PoolError> {
        let mut store = self.store.lock().await;
        let expired: Vec<EntryId> = store
            .all()
            .filter(|e| {
                e.status.is_terminal() && now - e.last_updated_at > self.config.archive_ttl
            })
            .map(|e| e.id())
            .collect();
        let purged = expired.len();
        for id in expired {
            store
                .remove(&id)
                .await
                .map_err(|e| PoolError::Internal(e.to_string()))?;
        }
        if purged > 0 {
            debug!(purged, "purged archived entries");
        }
        Ok(purged)
    }

    pub async fn clear(&self) -> Result<(), PoolError> {
        self.store
            .lock()
            .await
            .clear()
            .await
            .map_err(|e| PoolError::Internal(e.to_string()))
    }
}

fn referenced_entities(entry: &PoolEntry) -> Vec<Entity> {
    let mut entities = entry.operation.entities();
    if let Some(aggregator) = entry.aggregator {
        entities.push(Entity::new(EntityType::Aggregator, aggregator));
    }
    entities
}

fn count_in_role(store: &EntryStore, entity: &Entity) -> u64 {
    store
        .all()
        .filter(|e| !e.status.is_terminal())
        .filter(|e| match entity.kind {
            EntityType::Sender => e.operation.sender() == entity.address,
            EntityType::Factory => e.factory == Some(entity.address),
            EntityType::Paymaster => e.paymaster == Some(entity.address),
            EntityType::Aggregator => e.aggregator == Some(entity.address),
        })
        .count() as u64
}

fn stake_info_for(validation: &ValidationOutcome, kind: EntityType) -> Option<&StakeInfo> {
    match kind {
        EntityType::Sender => Some(&validation.sender_info),
        EntityType::Factory => validation.factory_info.as_ref(),
        EntityType::Paymaster => validation.paymaster_info.as_ref(),
        EntityType::Aggregator => validation.aggregator_info.as_ref().map(|a| &a.stake_info),
    }
}
