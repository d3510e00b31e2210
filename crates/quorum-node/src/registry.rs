//! registry of live participant addresses
//!
//! the monitor registers every address that answered a heartbeat; the
//! publisher samples quorums from entries seen within the ttl.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use quorum_primitives::Address;
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{NodeError, Result};
use crate::store::KvStore;

/// store key of the persisted registry
pub const AVAILABLE_NODES_KEY: &str = "available-nodes";

#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// mark `addresses` as seen at `now`
    async fn register(&self, addresses: &[Address], now: u64) -> Result<()>;

    /// distinct addresses seen within the ttl, sorted
    async fn live(&self, now: u64) -> Result<Vec<Address>>;

    /// `n` distinct live addresses drawn uniformly, or `None` when fewer are live
    async fn sample(&self, n: usize, now: u64) -> Result<Option<Vec<Address>>> {
        let live = self.live(now).await?;
        if live.len() < n {
            return Ok(None);
        }
        let mut rng = rand::thread_rng();
        Ok(Some(live.choose_multiple(&mut rng, n).copied().collect()))
    }
}

fn is_live(last_seen: u64, now: u64, ttl_secs: u64) -> bool {
    now.saturating_sub(last_seen) <= ttl_secs
}

/// registry persisted as one `{address: last_seen}` object in the store
pub struct StoreRegistry<S: ?Sized> {
    store: Arc<S>,
    ttl_secs: u64,
}

impl<S: KvStore + ?Sized> StoreRegistry<S> {
    pub fn new(store: Arc<S>, ttl_secs: u64) -> Self {
        Self { store, ttl_secs }
    }
}

#[async_trait]
impl<S: KvStore + ?Sized> NodeRegistry for StoreRegistry<S> {
    async fn register(&self, addresses: &[Address], now: u64) -> Result<()> {
        if addresses.is_empty() {
            return Ok(());
        }
        if self.store.get(AVAILABLE_NODES_KEY).await?.is_none() {
            self.store.put(AVAILABLE_NODES_KEY, json!({})).await?;
        }
        for address in addresses {
            self.store
                .update_field(AVAILABLE_NODES_KEY, &address.to_hex(), json!(now))
                .await?;
        }
        Ok(())
    }

    async fn live(&self, now: u64) -> Result<Vec<Address>> {
        let entries = match self.store.get(AVAILABLE_NODES_KEY).await? {
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(NodeError::Storage(format!(
                    "{} is not an object",
                    AVAILABLE_NODES_KEY
                )))
            }
            None => return Ok(Vec::new()),
        };

        let mut live = Vec::with_capacity(entries.len());
        for (key, last_seen) in entries {
            let Ok(address) = Address::from_hex(&key) else {
                warn!("skipping malformed registry entry {}", key);
                continue;
            };
            if last_seen.as_u64().map(|t| is_live(t, now, self.ttl_secs)).unwrap_or(false) {
                live.push(address);
            }
        }
        live.sort();
        Ok(live)
    }
}

/// process-local registry
#[derive(Clone)]
pub struct MemoryRegistry {
    entries: Arc<Mutex<BTreeMap<Address, u64>>>,
    ttl_secs: u64,
}

impl MemoryRegistry {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            entries: Arc::new(Mutex::new(BTreeMap::new())),
            ttl_secs,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<Address, u64>>> {
        self.entries
            .lock()
            .map_err(|_| NodeError::Storage("memory registry poisoned".into()))
    }
}

#[async_trait]
impl NodeRegistry for MemoryRegistry {
    async fn register(&self, addresses: &[Address], now: u64) -> Result<()> {
        let mut entries = self.lock()?;
        for address in addresses {
            entries.insert(*address, now);
        }
        Ok(())
    }

    async fn live(&self, now: u64) -> Result<Vec<Address>> {
        Ok(self
            .lock()?
            .iter()
            .filter(|&(_, &seen)| is_live(seen, now, self.ttl_secs))
            .map(|(a, _)| *a)
            .collect())
    }
}
