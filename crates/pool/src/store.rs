use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use alloy_primitives::ChainId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use gantry_types::{EntryId, PoolEntry, UserOpHash};
use parking_lot::Mutex;
use tracing::{info, warn};

/// Durable byte storage keyed by opaque strings. Implementations must make
/// `put` visible to a subsequent `get` on the same key.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// All key/value pairs whose key starts with `prefix`.
    async fn get_many(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Process-local store backing tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.lock().insert(key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn get_many(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.lock();
        Ok(entries
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

fn entry_key(id: &EntryId) -> String {
    format!("entry/{}/{}/{}", id.chain_id, id.sender, id.nonce)
}

fn hash_key(chain_id: ChainId, hash: &UserOpHash) -> String {
    format!("hash/{chain_id}/{hash}")
}

/// Entries for one chain: an in-memory working set mirrored to the
/// key-value store as JSON. The id map is authoritative between restarts;
/// `load` rebuilds both maps from the store.
pub struct EntryStore {
    chain_id: ChainId,
    kv: Arc<dyn KeyValueStore>,
    by_id: HashMap<EntryId, PoolEntry>,
    by_hash: HashMap<UserOpHash, EntryId>,
}

impl EntryStore {
    pub fn new(chain_id: ChainId, kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            chain_id,
            kv,
            by_id: HashMap::new(),
            by_hash: HashMap::new(),
        }
    }

    /// Rebuilds the working set from the store. Unparseable records are
    /// skipped with a warning rather than wedging startup.
    pub async fn load(&mut self) -> Result<usize> {
        let prefix = format!("entry/{}/", self.chain_id);
        let mut loaded = 0;
        for (key, raw) in self.kv.get_many(&prefix).await? {
            match serde_json::from_slice::<PoolEntry>(&raw) {
                Ok(entry) => {
                    self.by_hash.insert(entry.hash, entry.id());
                    self.by_id.insert(entry.id(), entry);
                    loaded += 1;
                }
                Err(err) => warn!(%key, %err, "skipping undecodable pool entry"),
            }
        }
        if loaded > 0 {
            info!(chain_id = self.chain_id, loaded, "recovered pool entries");
        }
        Ok(loaded)
    }

    pub async fn put(&mut self, entry: PoolEntry) -> Result<()> {
        let id = entry.id();
        let raw = serde_json::to_vec(&entry).context("serializing pool entry")?;
        self.kv.put(&entry_key(&id), raw).await?;
        self.kv
            .put(
                &hash_key(self.chain_id, &entry.hash),
                entry_key(&id).into_bytes(),
            )
            .await?;
        self.by_hash.insert(entry.hash, id);
        self.by_id.insert(id, entry);
        Ok(())
    }

    pub async fn remove(&mut self, id: &EntryId) -> Result<Option<PoolEntry>> {
        let Some(entry) = self.by_id.remove(id) else {
            return Ok(None);
        };
        self.by_hash.remove(&entry.hash);
        self.kv.delete(&entry_key(id)).await?;
        self.kv.delete(&hash_key(self.chain_id, &entry.hash)).await?;
        Ok(Some(entry))
    }

    pub fn find(&self, id: &EntryId) -> Option<&PoolEntry> {
        self.by_id.get(id)
    }

    pub fn find_by_hash(&self, hash: &UserOpHash) -> Option<&PoolEntry> {
        self.by_hash.get(hash).and_then(|id| self.by_id.get(id))
    }

    pub fn contains_hash(&self, hash: &UserOpHash) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn all(&self) -> impl Iterator<Item = &PoolEntry> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub async fn clear(&mut self) -> Result<()> {
        let ids: Vec<EntryId> = self.by_id.keys().copied().collect();
        for id in ids {
            self.remove(&id).await?;
        }
        Ok(())
    }
}
