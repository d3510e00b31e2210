//! durable work queue
//!
//! at-least-once delivery: a dequeued item stays in flight until it is acked
//! (gone) or nacked (back to the tail of the channel). reopening a
//! [`SledQueue`] returns everything still in flight to pending, so a crash
//! between dequeue and ack never loses work.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{IVec, Transactional};
use tracing::{debug, info};

use crate::error::{NodeError, Result};

/// one reserved item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub channel: String,
    pub tag: u64,
    pub body: Vec<u8>,
}

impl Delivery {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| NodeError::Validation(format!("{} delivery {}: {}", self.channel, self.tag, e)))
    }
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, channel: &str, body: &[u8]) -> Result<()>;

    /// reserve the oldest pending item, if any
    async fn dequeue(&self, channel: &str) -> Result<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// return the item to the tail of its channel
    async fn nack(&self, delivery: &Delivery) -> Result<()>;

    /// replace the body of an in-flight item; a later nack or a restart
    /// redelivers the new body
    async fn amend(&self, delivery: &Delivery, body: &[u8]) -> Result<()>;

    /// pending items on `channel`, in-flight ones excluded
    async fn pending(&self, channel: &str) -> Result<usize>;
}

pub async fn enqueue_json<Q, T>(queue: &Q, channel: &str, value: &T) -> Result<()>
where
    Q: WorkQueue + ?Sized,
    T: Serialize + Sync,
{
    let body = serde_json::to_vec(value)?;
    queue.enqueue(channel, &body).await
}

fn queue_err(e: sled::Error) -> NodeError {
    NodeError::Queue(format!("sled: {}", e))
}

fn tx_err(e: TransactionError<NodeError>) -> NodeError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => queue_err(e),
    }
}

fn not_in_flight(delivery: &Delivery) -> NodeError {
    NodeError::Queue(format!(
        "delivery {} on {} is not in flight",
        delivery.tag, delivery.channel
    ))
}

const PENDING_SUFFIX: &str = ":pending";
const INFLIGHT_SUFFIX: &str = ":inflight";

/// sled-backed queue, one pending and one in-flight tree per channel
#[derive(Clone)]
pub struct SledQueue {
    db: sled::Db,
}

impl SledQueue {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("opening queue at {}", path.display());
        let db = sled::open(path).map_err(queue_err)?;
        Self::from_db(db)
    }

    /// share an already open database; in-flight items are restored
    pub fn from_db(db: sled::Db) -> Result<Self> {
        let queue = Self { db };
        queue.restore_inflight()?;
        Ok(queue)
    }

    fn pending_tree(&self, channel: &str) -> Result<sled::Tree> {
        self.db
            .open_tree(format!("queue:{}{}", channel, PENDING_SUFFIX))
            .map_err(queue_err)
    }

    fn inflight_tree(&self, channel: &str) -> Result<sled::Tree> {
        self.db
            .open_tree(format!("queue:{}{}", channel, INFLIGHT_SUFFIX))
            .map_err(queue_err)
    }

    fn restore_inflight(&self) -> Result<()> {
        for name in self.db.tree_names() {
            let name = String::from_utf8_lossy(&name).to_string();
            let channel = match name
                .strip_prefix("queue:")
                .and_then(|n| n.strip_suffix(INFLIGHT_SUFFIX))
            {
                Some(c) => c.to_string(),
                None => continue,
            };
            let inflight = self.inflight_tree(&channel)?;
            let pending = self.pending_tree(&channel)?;
            let mut restored = 0usize;
            for entry in inflight.iter() {
                let (key, _) = entry.map_err(queue_err)?;
                let moved = (&inflight, &pending)
                    .transaction(|(inflight, pending)| {
                        let value = inflight.remove(key.clone())?;
                        if let Some(value) = &value {
                            pending.insert(key.clone(), value.clone())?;
                        }
                        Ok::<_, ConflictableTransactionError<NodeError>>(value.is_some())
                    })
                    .map_err(tx_err)?;
                if moved {
                    restored += 1;
                }
            }
            if restored > 0 {
                info!("restored {} in-flight items on {}", restored, channel);
            }
        }
        Ok(())
    }

    fn next_key(&self) -> Result<[u8; 8]> {
        Ok(self.db.generate_id().map_err(queue_err)?.to_be_bytes())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(queue_err)?;
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for SledQueue {
    async fn enqueue(&self, channel: &str, body: &[u8]) -> Result<()> {
        let key = self.next_key()?;
        self.pending_tree(channel)?.insert(key, body).map_err(queue_err)?;
        debug!("enqueued on {}", channel);
        Ok(())
    }

    async fn dequeue(&self, channel: &str) -> Result<Option<Delivery>> {
        let pending = self.pending_tree(channel)?;
        let inflight = self.inflight_tree(channel)?;

        // the move is one transaction, so the item is always in exactly one tree
        let (key, value) = loop {
            let key = match pending.first().map_err(queue_err)? {
                Some((key, _)) => key,
                None => return Ok(None),
            };
            let taken = (&pending, &inflight)
                .transaction(|(pending, inflight)| {
                    let value = pending.remove(key.clone())?;
                    if let Some(value) = &value {
                        inflight.insert(key.clone(), value.clone())?;
                    }
                    Ok::<Option<IVec>, ConflictableTransactionError<NodeError>>(value)
                })
                .map_err(tx_err)?;
            // another consumer took it first
            if let Some(value) = taken {
                break (key, value);
            }
        };

        let tag = <[u8; 8]>::try_from(&key[..])
            .map(u64::from_be_bytes)
            .map_err(|_| NodeError::Queue(format!("corrupt key on {}", channel)))?;
        Ok(Some(Delivery {
            channel: channel.to_string(),
            tag,
            body: value.to_vec(),
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.inflight_tree(&delivery.channel)?
            .remove(delivery.tag.to_be_bytes())
            .map_err(queue_err)?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        let inflight = self.inflight_tree(&delivery.channel)?;
        let pending = self.pending_tree(&delivery.channel)?;
        let tag = delivery.tag.to_be_bytes();
        let key = self.next_key()?;

        (&inflight, &pending)
            .transaction(|(inflight, pending)| {
                let body = inflight
                    .remove(&tag[..])?
                    .ok_or_else(|| ConflictableTransactionError::Abort(not_in_flight(delivery)))?;
                pending.insert(&key[..], body)?;
                Ok::<(), ConflictableTransactionError<NodeError>>(())
            })
            .map_err(tx_err)
    }

    async fn amend(&self, delivery: &Delivery, body: &[u8]) -> Result<()> {
        let previous = self
            .inflight_tree(&delivery.channel)?
            .fetch_and_update(delivery.tag.to_be_bytes(), |old| old.map(|_| body.to_vec()))
            .map_err(queue_err)?;
        match previous {
            Some(_) => Ok(()),
            None => Err(not_in_flight(delivery)),
        }
    }

    async fn pending(&self, channel: &str) -> Result<usize> {
        Ok(self.pending_tree(channel)?.len())
    }
}

#[derive(Default)]
struct MemoryChannels {
    next_tag: u64,
    pending: HashMap<String, VecDeque<(u64, Vec<u8>)>>,
    inflight: HashMap<u64, (String, Vec<u8>)>,
}

#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Mutex<MemoryChannels>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryChannels>> {
        self.inner
            .lock()
            .map_err(|_| NodeError::Queue("memory queue poisoned".into()))
    }

    pub fn inflight(&self) -> usize {
        self.lock().map(|c| c.inflight.len()).unwrap_or(0)
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, channel: &str, body: &[u8]) -> Result<()> {
        let mut inner = self.lock()?;
        inner.next_tag += 1;
        let tag = inner.next_tag;
        inner
            .pending
            .entry(channel.to_string())
            .or_default()
            .push_back((tag, body.to_vec()));
        Ok(())
    }

    async fn dequeue(&self, channel: &str) -> Result<Option<Delivery>> {
        let mut inner = self.lock()?;
        let Some((tag, body)) = inner.pending.get_mut(channel).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        inner.inflight.insert(tag, (channel.to_string(), body.clone()));
        Ok(Some(Delivery {
            channel: channel.to_string(),
            tag,
            body,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.lock()?.inflight.remove(&delivery.tag);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        let mut inner = self.lock()?;
        let (channel, body) = inner
            .inflight
            .remove(&delivery.tag)
            .ok_or_else(|| not_in_flight(delivery))?;
        inner.next_tag += 1;
        let tag = inner.next_tag;
        inner.pending.entry(channel).or_default().push_back((tag, body));
        Ok(())
    }

    async fn amend(&self, delivery: &Delivery, body: &[u8]) -> Result<()> {
        let mut inner = self.lock()?;
        let (_, stored) = inner
            .inflight
            .get_mut(&delivery.tag)
            .ok_or_else(|| not_in_flight(delivery))?;
        *stored = body.to_vec();
        Ok(())
    }

    async fn pending(&self, channel: &str) -> Result<usize> {
        Ok(self.lock()?.pending.get(channel).map(VecDeque::len).unwrap_or(0))
    }
}
