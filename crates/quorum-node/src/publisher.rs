//! task publisher
//!
//! takes one request off the intake channel, samples a quorum from the live
//! registry, hides it in a bloom filter and broadcasts the signed task. the
//! task is stored as pending before anything leaves the node, and the intake
//! delivery is acked only after the broadcast and the aggregation job are
//! durable; any earlier failure nacks it back and the redelivery resumes the
//! stored task instead of starting a new one.

use std::sync::Arc;
use std::time::Duration;

use quorum_primitives::{KeyPair, QuorumFilter};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Channels, Config};
use crate::error::{NodeError, Result};
use crate::message::{FilterModel, SignedMessage, TaskAnnouncement, WireMessage};
use crate::queue::{enqueue_json, Delivery, WorkQueue};
use crate::registry::NodeRegistry;
use crate::store::KvStore;
use crate::task::{advance, load_task, save_task, AggregationJob, TaskRecord, TaskRequest, TaskStatus};
use crate::topic::Topics;
use crate::transport::GossipTransport;
use crate::worker::unix_now;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// nothing on the intake channel
    Idle,
    /// too few live participants; nothing was dequeued
    Shortfall { live: usize, required: u32 },
    Published { task_id: String },
}

pub struct Publisher {
    key: KeyPair,
    transport: Arc<dyn GossipTransport>,
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn KvStore>,
    registry: Arc<dyn NodeRegistry>,
    topics: Topics,
    channels: Channels,
    quorum_size: u32,
    filter_capacity: u32,
    false_positive_rate: f64,
    task_timeout_secs: u64,
    polling_interval: Duration,
}

impl Publisher {
    pub fn new(
        config: &Config,
        key: KeyPair,
        transport: Arc<dyn GossipTransport>,
        queue: Arc<dyn WorkQueue>,
        store: Arc<dyn KvStore>,
        registry: Arc<dyn NodeRegistry>,
    ) -> Self {
        Self {
            key,
            transport,
            queue,
            store,
            registry,
            topics: config.topics(),
            channels: config.channels.clone(),
            quorum_size: config.quorum_size,
            filter_capacity: config.filter_capacity(),
            false_positive_rate: config.false_positive_rate,
            task_timeout_secs: config.task_timeout_secs,
            polling_interval: config.polling_interval(),
        }
    }

    pub fn polling_interval(&self) -> Duration {
        self.polling_interval
    }

    pub async fn publish_once(&self) -> Result<PublishOutcome> {
        self.publish_at(unix_now()).await
    }

    pub async fn publish_at(&self, now: u64) -> Result<PublishOutcome> {
        let live = self.registry.live(now).await?.len();
        if live < self.quorum_size as usize {
            warn!("only {} live participants, need {}; not publishing", live, self.quorum_size);
            return Ok(PublishOutcome::Shortfall {
                live,
                required: self.quorum_size,
            });
        }

        let delivery = match self.queue.dequeue(&self.channels.synthesis).await? {
            Some(d) => d,
            None => return Ok(PublishOutcome::Idle),
        };

        let request = match delivery.decode::<TaskRequest>().and_then(TaskRequest::validated) {
            Ok(r) => r,
            Err(e) => {
                // redelivering an unusable request can never succeed
                error!("dropping malformed task request: {}", e);
                self.queue.ack(&delivery).await?;
                return Ok(PublishOutcome::Idle);
            }
        };

        let published = match self.assign_id(&delivery, request).await {
            Ok((task_id, prompt)) => self
                .publish_request(&task_id, &prompt, now)
                .await
                .map(|_| task_id),
            Err(e) => Err(e),
        };
        match published {
            Ok(task_id) => {
                self.queue.ack(&delivery).await?;
                Ok(PublishOutcome::Published { task_id })
            }
            Err(e) => {
                self.release(&delivery).await;
                Err(e)
            }
        }
    }

    async fn release(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.nack(delivery).await {
            error!("failed to return delivery {} to {}: {}", delivery.tag, delivery.channel, e);
        }
    }

    /// an id-less request gets its id written back into the in-flight
    /// delivery, so a redelivery resumes the same task
    async fn assign_id(&self, delivery: &Delivery, request: TaskRequest) -> Result<(String, String)> {
        if let Some(id) = request.id {
            return Ok((id, request.prompt));
        }
        let id = Uuid::new_v4().to_string();
        let body = serde_json::to_vec(&TaskRequest {
            id: Some(id.clone()),
            prompt: request.prompt.clone(),
        })?;
        self.queue.amend(delivery, &body).await?;
        Ok((id, request.prompt))
    }

    async fn publish_request(&self, task_id: &str, prompt: &str, now: u64) -> Result<()> {
        if let Some(mut existing) = load_task(self.store.as_ref(), task_id).await? {
            return self.resume(&mut existing).await;
        }

        let quorum = self
            .registry
            .sample(self.quorum_size as usize, now)
            .await?
            .ok_or(NodeError::InsufficientQuorum {
                accepted: 0,
                required: self.quorum_size as usize,
            })?;

        let mut filter = QuorumFilter::new(self.filter_capacity, self.false_positive_rate)?;
        for address in &quorum {
            filter.add(address.as_bytes());
        }

        let task_key = KeyPair::generate();
        let mut record = TaskRecord {
            id: task_id.to_string(),
            prompt: prompt.to_string(),
            deadline: now + self.task_timeout_secs,
            filter: FilterModel::from_filter(&filter),
            filter_capacity: self.filter_capacity,
            quorum_size: self.quorum_size,
            quorum,
            public_key: task_key.public_key_hex(),
            ephemeral_secret: Some(task_key.secret_hex()),
            publisher_signature: String::new(),
            status: TaskStatus::Pending,
            created_at: now,
        };
        record.publisher_signature = self.announcement(&record)?.signature.to_hex();

        // the pending record is the marker a redelivery resumes from
        save_task(self.store.as_ref(), &record).await?;
        self.broadcast(&mut record).await?;
        self.schedule_aggregation(&mut record).await
    }

    fn announcement(&self, record: &TaskRecord) -> Result<SignedMessage> {
        let announcement = TaskAnnouncement {
            task_id: record.id.clone(),
            filter: record.filter.clone(),
            prompt: record.prompt.clone(),
            deadline: record.deadline,
            public_key: record.public_key.clone(),
        };
        SignedMessage::sign(&self.key, WireMessage::Task(announcement))
    }

    /// push the announcement for a pending task and mark it published.
    /// signing is deterministic, so a repeat push is byte-identical
    async fn broadcast(&self, record: &mut TaskRecord) -> Result<()> {
        let signed = self.announcement(record)?;
        self.transport
            .push_message(&signed.encode(), &self.topics.input())
            .await?;
        info!(
            task_id = %record.id,
            deadline = record.deadline,
            quorum = record.quorum.len(),
            "task published"
        );
        advance(self.store.as_ref(), record, TaskStatus::Published).await
    }

    /// finish a task that an earlier, interrupted attempt started
    async fn resume(&self, record: &mut TaskRecord) -> Result<()> {
        match record.status {
            TaskStatus::Pending => {
                debug!(task_id = %record.id, "rebroadcasting interrupted publish");
                self.broadcast(record).await?;
                self.schedule_aggregation(record).await
            }
            TaskStatus::Published => {
                debug!(task_id = %record.id, "resuming interrupted publish");
                self.schedule_aggregation(record).await
            }
            status => {
                debug!(task_id = %record.id, %status, "request already handled");
                Ok(())
            }
        }
    }

    async fn schedule_aggregation(&self, record: &mut TaskRecord) -> Result<()> {
        let job = AggregationJob {
            task_id: record.id.clone(),
        };
        enqueue_json(self.queue.as_ref(), &self.channels.aggregation, &job).await?;
        advance(self.store.as_ref(), record, TaskStatus::AwaitingResults).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use crate::registry::MemoryRegistry;
    use crate::store::MemoryStore;
    use crate::transport::MemoryTransport;
    use async_trait::async_trait;
    use quorum_primitives::Address;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        publisher: Publisher,
        key_address: Address,
        transport: MemoryTransport,
        queue: MemoryQueue,
        store: MemoryStore,
        registry: MemoryRegistry,
    }

    fn harness_with(transport: Arc<dyn GossipTransport>, memory: MemoryTransport) -> Harness {
        build(transport, memory, |store| -> Arc<dyn KvStore> { Arc::new(store) })
    }

    fn build(
        transport: Arc<dyn GossipTransport>,
        memory: MemoryTransport,
        wrap_store: impl FnOnce(MemoryStore) -> Arc<dyn KvStore>,
    ) -> Harness {
        let config = Config::default();
        let key = KeyPair::generate();
        let queue = MemoryQueue::new();
        let store = MemoryStore::new();
        let registry = MemoryRegistry::new(60);
        let publisher = Publisher::new(
            &config,
            key.clone(),
            transport,
            Arc::new(queue.clone()),
            wrap_store(store.clone()),
            Arc::new(registry.clone()),
        );
        Harness {
            publisher,
            key_address: key.address(),
            transport: memory,
            queue,
            store,
            registry,
        }
    }

    fn harness() -> Harness {
        let transport = MemoryTransport::new();
        harness_with(Arc::new(transport.clone()), transport)
    }

    fn addr(b: u8) -> Address {
        Address::from_bytes([b; 20])
    }

    async fn request(queue: &MemoryQueue, id: &str) {
        let req = TaskRequest {
            id: Some(id.into()),
            prompt: "what is 2+2".into(),
        };
        enqueue_json(queue, "synthesis", &req).await.unwrap();
    }

    #[tokio::test]
    async fn test_shortfall_leaves_request_queued() {
        let h = harness();
        h.registry.register(&[addr(1), addr(2)], 1000).await.unwrap();
        request(&h.queue, "t1").await;

        let outcome = h.publisher.publish_at(1000).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Shortfall { live: 2, required: 3 });
        assert_eq!(h.queue.pending("synthesis").await.unwrap(), 1);
        assert_eq!(h.transport.message_count("/dria/0/synthesis/proto"), 0);
    }

    #[tokio::test]
    async fn test_idle_when_queue_empty() {
        let h = harness();
        h.registry.register(&[addr(1), addr(2), addr(3)], 1000).await.unwrap();
        assert_eq!(h.publisher.publish_at(1000).await.unwrap(), PublishOutcome::Idle);
    }

    #[tokio::test]
    async fn test_publish_broadcasts_persists_and_acks() {
        let h = harness();
        let quorum = [addr(1), addr(2), addr(3)];
        h.registry.register(&quorum, 1000).await.unwrap();
        request(&h.queue, "t1").await;

        let outcome = h.publisher.publish_at(1000).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Published { task_id: "t1".into() });
        assert_eq!(h.queue.pending("synthesis").await.unwrap(), 0);
        assert_eq!(h.queue.inflight(), 0);
        assert_eq!(h.queue.pending("aggregation").await.unwrap(), 1);

        let sent = h.transport.fetch_messages("/dria/0/synthesis/proto").await.unwrap();
        assert_eq!(sent.len(), 1);
        let signed = SignedMessage::decode(&sent[0].payload).unwrap();
        assert_eq!(signed.signer().unwrap(), h.key_address);
        let WireMessage::Task(task) = signed.message else {
            panic!("expected a task announcement");
        };
        assert_eq!(task.task_id, "t1");
        assert_eq!(task.deadline, 1000 + 180);
        let filter = task.filter.to_filter().unwrap();
        assert!(quorum.iter().all(|a| filter.contains(a.as_bytes())));

        let record = load_task(&h.store, "t1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::AwaitingResults);
        assert_eq!(record.quorum_size, 3);
        assert_eq!(record.public_key, task.public_key);
        assert!(record.ephemeral_secret.is_some());
    }

    #[tokio::test]
    async fn test_generated_task_ids_are_unique() {
        let h = harness();
        h.registry.register(&[addr(1), addr(2), addr(3)], 1000).await.unwrap();
        for _ in 0..2 {
            enqueue_json(&h.queue, "synthesis", &TaskRequest { id: None, prompt: "x".into() })
                .await
                .unwrap();
        }
        let a = h.publisher.publish_at(1000).await.unwrap();
        let b = h.publisher.publish_at(1000).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_redelivered_request_not_republished() {
        let h = harness();
        h.registry.register(&[addr(1), addr(2), addr(3)], 1000).await.unwrap();
        request(&h.queue, "t1").await;
        request(&h.queue, "t1").await;

        h.publisher.publish_at(1000).await.unwrap();
        h.publisher.publish_at(1000).await.unwrap();
        assert_eq!(h.transport.message_count("/dria/0/synthesis/proto"), 1);
        assert_eq!(h.queue.pending("aggregation").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_request_dropped() {
        let h = harness();
        h.registry.register(&[addr(1), addr(2), addr(3)], 1000).await.unwrap();
        h.queue.enqueue("synthesis", b"{not json").await.unwrap();
        assert_eq!(h.publisher.publish_at(1000).await.unwrap(), PublishOutcome::Idle);
        assert_eq!(h.queue.pending("synthesis").await.unwrap(), 0);
        assert_eq!(h.queue.inflight(), 0);
    }

    struct DownTransport;

    #[async_trait]
    impl GossipTransport for DownTransport {
        async fn health_check(&self) -> Result<bool> {
            Ok(false)
        }
        async fn subscribe(&self, _topics: &[String]) -> Result<()> {
            Err(NodeError::TransientTransport("down".into()))
        }
        async fn fetch_messages(&self, _topic: &str) -> Result<Vec<crate::transport::GossipMessage>> {
            Err(NodeError::TransientTransport("down".into()))
        }
        async fn push_message(&self, _payload: &str, _topic: &str) -> Result<()> {
            Err(NodeError::TransientTransport("down".into()))
        }
    }

    #[tokio::test]
    async fn test_broadcast_failure_nacks() {
        let h = harness_with(Arc::new(DownTransport), MemoryTransport::new());
        h.registry.register(&[addr(1), addr(2), addr(3)], 1000).await.unwrap();
        request(&h.queue, "t1").await;

        let err = h.publisher.publish_at(1000).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(h.queue.pending("synthesis").await.unwrap(), 1);
        assert_eq!(h.queue.inflight(), 0);
        let record = load_task(&h.store, "t1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(h.queue.pending("aggregation").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_topic_like_ids_dropped() {
        let h = harness();
        h.registry.register(&[addr(1), addr(2), addr(3)], 1000).await.unwrap();
        for id in ["synthesis", "heartbeat", "a/b"] {
            request(&h.queue, id).await;
            assert_eq!(h.publisher.publish_at(1000).await.unwrap(), PublishOutcome::Idle, "{id}");
            assert!(load_task(&h.store, id).await.unwrap().is_none());
        }
        assert_eq!(h.queue.pending("synthesis").await.unwrap(), 0);
        assert_eq!(h.queue.inflight(), 0);
        assert_eq!(h.transport.message_count("/dria/0/synthesis/proto"), 0);
    }

    /// memory store whose `n`th write (1-based) fails once
    struct FlakyStore {
        inner: MemoryStore,
        writes: AtomicUsize,
        fail_at: usize,
    }

    impl FlakyStore {
        fn write(&self) -> Result<()> {
            if self.writes.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_at {
                return Err(NodeError::Storage("disk hiccup".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl KvStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
            self.write()?;
            self.inner.put(key, value).await
        }
        async fn update_field(&self, key: &str, field: &str, value: serde_json::Value) -> Result<()> {
            self.write()?;
            self.inner.update_field(key, field, value).await
        }
    }

    fn flaky_harness(fail_at: usize) -> Harness {
        let transport = MemoryTransport::new();
        build(Arc::new(transport.clone()), transport, move |inner| -> Arc<dyn KvStore> {
            Arc::new(FlakyStore {
                inner,
                writes: AtomicUsize::new(0),
                fail_at,
            })
        })
    }

    fn announced_ids(sent: &[crate::transport::GossipMessage]) -> Vec<String> {
        sent.iter()
            .map(|m| match SignedMessage::decode(&m.payload).unwrap().message {
                WireMessage::Task(task) => task.task_id,
                other => panic!("expected task, got {:?}", other),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_store_failure_before_broadcast_keeps_generated_id() {
        // first write is the pending record
        let h = flaky_harness(1);
        h.registry.register(&[addr(1), addr(2), addr(3)], 1000).await.unwrap();
        enqueue_json(&h.queue, "synthesis", &TaskRequest { id: None, prompt: "x".into() })
            .await
            .unwrap();

        assert!(h.publisher.publish_at(1000).await.is_err());
        assert_eq!(h.transport.message_count("/dria/0/synthesis/proto"), 0);

        let redelivered = h.queue.dequeue("synthesis").await.unwrap().unwrap();
        let assigned = redelivered.decode::<TaskRequest>().unwrap().id.unwrap();
        h.queue.nack(&redelivered).await.unwrap();

        let outcome = h.publisher.publish_at(1000).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Published { task_id: assigned.clone() });
        let sent = h.transport.fetch_messages("/dria/0/synthesis/proto").await.unwrap();
        assert_eq!(announced_ids(&sent), vec![assigned]);
    }

    #[tokio::test]
    async fn test_store_failure_after_broadcast_resumes_same_task() {
        // second write marks the broadcast task published
        let h = flaky_harness(2);
        h.registry.register(&[addr(1), addr(2), addr(3)], 1000).await.unwrap();
        enqueue_json(&h.queue, "synthesis", &TaskRequest { id: None, prompt: "x".into() })
            .await
            .unwrap();

        let err = h.publisher.publish_at(1000).await.unwrap_err();
        assert!(matches!(err, NodeError::Storage(_)));
        assert_eq!(h.queue.pending("synthesis").await.unwrap(), 1);

        let PublishOutcome::Published { task_id } = h.publisher.publish_at(1000).await.unwrap() else {
            panic!("expected the redelivery to publish");
        };
        let sent = h.transport.fetch_messages("/dria/0/synthesis/proto").await.unwrap();
        assert_eq!(announced_ids(&sent), vec![task_id.clone(), task_id.clone()]);
        assert_eq!(sent[0].payload, sent[1].payload);

        let record = load_task(&h.store, &task_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::AwaitingResults);
        assert_eq!(h.queue.pending("aggregation").await.unwrap(), 1);
        assert_eq!(h.queue.pending("synthesis").await.unwrap(), 0);
    }
}
