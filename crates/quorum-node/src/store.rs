//! json key-value store
//!
//! task records, selected results and the node registry live here. `get` on a
//! missing key is `Ok(None)`; `update_field` on a missing key is
//! [`NodeError::NotFound`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::error::{NodeError, Result};

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn put(&self, key: &str, value: Value) -> Result<()>;

    /// set one top-level field of an existing object
    async fn update_field(&self, key: &str, field: &str, value: Value) -> Result<()>;

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Value>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }
}

pub async fn get_json<S, T>(store: &S, key: &str) -> Result<Option<T>>
where
    S: KvStore + ?Sized,
    T: DeserializeOwned,
{
    match store.get(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

pub async fn put_json<S, T>(store: &S, key: &str, value: &T) -> Result<()>
where
    S: KvStore + ?Sized,
    T: Serialize + Sync,
{
    store.put(key, serde_json::to_value(value)?).await
}

fn set_field(key: &str, object: &mut Value, field: &str, value: Value) -> Result<()> {
    match object {
        Value::Object(map) => {
            map.insert(field.to_string(), value);
            Ok(())
        }
        _ => Err(NodeError::Validation(format!("{} is not an object", key))),
    }
}

/// sled-backed store, values kept as json bytes
#[derive(Clone)]
pub struct SledStore {
    tree: sled::Tree,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("opening store at {}", path.display());
        let db = sled::open(path)?;
        Self::from_db(&db)
    }

    pub fn from_db(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree("kv")?,
        })
    }
}

#[async_trait]
impl KvStore for SledStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.tree.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.tree.insert(key, serde_json::to_vec(&value)?)?;
        Ok(())
    }

    async fn update_field(&self, key: &str, field: &str, value: Value) -> Result<()> {
        loop {
            let current = self
                .tree
                .get(key)?
                .ok_or_else(|| NodeError::NotFound(key.to_string()))?;
            let mut object: Value = serde_json::from_slice(&current)?;
            set_field(key, &mut object, field, value.clone())?;
            let updated = serde_json::to_vec(&object)?;

            // retry when another writer got in between
            match self.tree.compare_and_swap(key, Some(current), Some(updated))? {
                Ok(()) => return Ok(()),
                Err(_) => continue,
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Value>>> {
        self.inner
            .lock()
            .map_err(|_| NodeError::Storage("memory store poisoned".into()))
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.lock()?.insert(key.to_string(), value);
        Ok(())
    }

    async fn update_field(&self, key: &str, field: &str, value: Value) -> Result<()> {
        let mut inner = self.lock()?;
        let object = inner
            .get_mut(key)
            .ok_or_else(|| NodeError::NotFound(key.to_string()))?;
        set_field(key, object, field, value)
    }
}
