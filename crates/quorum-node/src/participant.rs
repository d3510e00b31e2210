//! reference participant
//!
//! the responder side of the protocol, used for local simulation and tests.
//! it acks heartbeats from one trusted publisher and answers the tasks whose
//! quorum filter names it, sealing each answer to the task key.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use quorum_primitives::{seal, Address, KeyPair};
use tracing::{debug, info};

use crate::error::{NodeError, Result};
use crate::message::{
    encode_reply, HeartbeatAck, SignedMessage, TaskAnnouncement, TaskResult, WireMessage,
};
use crate::topic::Topics;
use crate::transport::GossipTransport;

/// produces the answer to a task prompt
#[async_trait]
pub trait Compute: Send + Sync {
    async fn answer(&self, prompt: &str) -> Result<String>;
}

/// always answers with the same text
#[derive(Debug, Clone)]
pub struct FixedAnswer(pub String);

#[async_trait]
impl Compute for FixedAnswer {
    async fn answer(&self, _prompt: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

pub struct Participant {
    key: KeyPair,
    publisher: Address,
    transport: Arc<dyn GossipTransport>,
    topics: Topics,
    compute: Arc<dyn Compute>,
    seen_heartbeats: Mutex<HashSet<uuid::Uuid>>,
    seen_tasks: Mutex<HashSet<String>>,
}

impl Participant {
    pub fn new(
        key: KeyPair,
        publisher: Address,
        transport: Arc<dyn GossipTransport>,
        topics: Topics,
        compute: Arc<dyn Compute>,
    ) -> Self {
        Self {
            key,
            publisher,
            transport,
            topics,
            compute,
            seen_heartbeats: Mutex::new(HashSet::new()),
            seen_tasks: Mutex::new(HashSet::new()),
        }
    }

    pub fn address(&self) -> Address {
        self.key.address()
    }

    /// decode a broadcast and make sure the trusted publisher signed it
    fn from_publisher(&self, encoded: &str) -> Result<SignedMessage> {
        let signed = SignedMessage::decode(encoded)?;
        let signer = signed.signer()?;
        if signer != self.publisher {
            return Err(NodeError::Validation(format!("broadcast signed by unknown {}", signer)));
        }
        Ok(signed)
    }

    /// returns true the first time `id` is seen
    fn first_sight<T: Eq + std::hash::Hash>(set: &Mutex<HashSet<T>>, id: T) -> Result<bool> {
        let mut seen = set
            .lock()
            .map_err(|_| NodeError::Validation("participant state poisoned".into()))?;
        Ok(seen.insert(id))
    }

    /// ack every new, unexpired heartbeat; returns how many were acked
    pub async fn answer_heartbeats(&self, now: u64) -> Result<usize> {
        let messages = self.transport.fetch_messages(&self.topics.heartbeat()).await?;
        let mut acked = 0;
        for message in messages {
            let signed = match self.from_publisher(&message.payload) {
                Ok(s) => s,
                Err(e) => {
                    debug!("ignoring heartbeat: {}", e);
                    continue;
                }
            };
            let WireMessage::Heartbeat(heartbeat) = &signed.message else {
                continue;
            };
            if heartbeat.deadline < now || !Self::first_sight(&self.seen_heartbeats, heartbeat.nonce)? {
                continue;
            }

            let ack = WireMessage::HeartbeatAck(HeartbeatAck {
                signature: self.key.sign(&signed.payload)?.to_hex(),
            });
            self.transport
                .push_message(&encode_reply(&ack)?, &self.topics.heartbeat_responses(&heartbeat.nonce))
                .await?;
            acked += 1;
        }
        Ok(acked)
    }

    /// answer every new task this participant was selected for
    pub async fn answer_tasks(&self, now: u64) -> Result<usize> {
        let messages = self.transport.fetch_messages(&self.topics.input()).await?;
        let mut answered = 0;
        for message in messages {
            let signed = match self.from_publisher(&message.payload) {
                Ok(s) => s,
                Err(e) => {
                    debug!("ignoring task: {}", e);
                    continue;
                }
            };
            let WireMessage::Task(task) = signed.message else {
                continue;
            };
            if task.deadline < now {
                continue;
            }
            match self.is_selected(&task) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    debug!(task_id = %task.task_id, "unreadable task filter: {}", e);
                    continue;
                }
            }
            if !Self::first_sight(&self.seen_tasks, task.task_id.clone())? {
                continue;
            }

            self.respond(&task).await?;
            answered += 1;
        }
        Ok(answered)
    }

    fn is_selected(&self, task: &TaskAnnouncement) -> Result<bool> {
        Ok(task.filter.to_filter()?.contains(self.address().as_bytes()))
    }

    /// answer one task unconditionally
    pub async fn respond(&self, task: &TaskAnnouncement) -> Result<()> {
        let answer = self.compute.answer(&task.prompt).await?;
        let sealed = seal::seal(&task.task_public_key()?, answer.as_bytes())?;
        let result = WireMessage::TaskResult(TaskResult {
            ciphertext: hex::encode(sealed),
            signature: self.key.sign(answer.as_bytes())?.to_hex(),
        });
        self.transport
            .push_message(&encode_reply(&result)?, &self.topics.results(&task.task_id))
            .await?;
        info!(task_id = %task.task_id, address = %self.address(), "task answered");
        Ok(())
    }

    pub async fn poll_once(&self, now: u64) -> Result<(usize, usize)> {
        Ok((self.answer_heartbeats(now).await?, self.answer_tasks(now).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{decode_reply, FilterModel, Heartbeat};
    use crate::transport::MemoryTransport;
    use quorum_primitives::{identity, QuorumFilter};
    use uuid::Uuid;

    fn topics() -> Topics {
        Topics::new("dria", 0)
    }

    fn participant(publisher: &KeyPair, transport: &MemoryTransport, answer: &str) -> Participant {
        Participant::new(
            KeyPair::generate(),
            publisher.address(),
            Arc::new(transport.clone()),
            topics(),
            Arc::new(FixedAnswer(answer.into())),
        )
    }

    async fn broadcast(transport: &MemoryTransport, key: &KeyPair, message: WireMessage, topic: &str) {
        let signed = SignedMessage::sign(key, message).unwrap();
        transport.push_message(&signed.encode(), topic).await.unwrap();
    }

    #[tokio::test]
    async fn test_acks_trusted_unexpired_heartbeats_once() {
        let publisher = KeyPair::generate();
        let transport = MemoryTransport::new();
        let node = participant(&publisher, &transport, "x");

        let live = Uuid::new_v4();
        let expired = Uuid::new_v4();
        let forged = Uuid::new_v4();
        broadcast(&transport, &publisher, WireMessage::Heartbeat(Heartbeat { nonce: live, deadline: 200 }), &topics().heartbeat()).await;
        broadcast(&transport, &publisher, WireMessage::Heartbeat(Heartbeat { nonce: expired, deadline: 50 }), &topics().heartbeat()).await;
        broadcast(&transport, &KeyPair::generate(), WireMessage::Heartbeat(Heartbeat { nonce: forged, deadline: 200 }), &topics().heartbeat()).await;

        assert_eq!(node.answer_heartbeats(100).await.unwrap(), 1);
        assert_eq!(node.answer_heartbeats(100).await.unwrap(), 0);
        assert_eq!(transport.message_count(&topics().heartbeat_responses(&expired)), 0);
        assert_eq!(transport.message_count(&topics().heartbeat_responses(&forged)), 0);

        let acks = transport.fetch_messages(&topics().heartbeat_responses(&live)).await.unwrap();
        let WireMessage::HeartbeatAck(ack) = decode_reply(&acks[0].payload).unwrap() else {
            panic!("expected ack");
        };
        let heartbeats = transport.fetch_messages(&topics().heartbeat()).await.unwrap();
        let sent = SignedMessage::decode(&heartbeats[0].payload).unwrap();
        let signature = quorum_primitives::RecoverableSignature::from_hex(&ack.signature).unwrap();
        assert_eq!(identity::recover_signer(&signature, &sent.payload).unwrap(), node.address());
    }

    #[tokio::test]
    async fn test_answers_only_selected_tasks() {
        let publisher = KeyPair::generate();
        let transport = MemoryTransport::new();
        let chosen = participant(&publisher, &transport, "four");
        let bystander = participant(&publisher, &transport, "five");

        let mut filter = QuorumFilter::new(3, 0.0001).unwrap();
        filter.add(chosen.address().as_bytes());
        let task_key = KeyPair::generate();
        let task = TaskAnnouncement {
            task_id: "t1".into(),
            filter: FilterModel::from_filter(&filter),
            prompt: "2+2".into(),
            deadline: 200,
            public_key: task_key.public_key_hex(),
        };
        broadcast(&transport, &publisher, WireMessage::Task(task), &topics().input()).await;

        assert_eq!(chosen.answer_tasks(100).await.unwrap(), 1);
        assert_eq!(chosen.answer_tasks(100).await.unwrap(), 0);
        assert_eq!(bystander.answer_tasks(100).await.unwrap(), 0);

        let results = transport.fetch_messages(&topics().results("t1")).await.unwrap();
        assert_eq!(results.len(), 1);
        let WireMessage::TaskResult(result) = decode_reply(&results[0].payload).unwrap() else {
            panic!("expected a task result");
        };
        let plaintext = seal::open(&task_key, &hex::decode(&result.ciphertext).unwrap()).unwrap();
        assert_eq!(plaintext, b"four");
        let signature = quorum_primitives::RecoverableSignature::from_hex(&result.signature).unwrap();
        assert_eq!(identity::recover_signer(&signature, &plaintext).unwrap(), chosen.address());
    }

    #[tokio::test]
    async fn test_expired_task_ignored() {
        let publisher = KeyPair::generate();
        let transport = MemoryTransport::new();
        let node = participant(&publisher, &transport, "late");

        let mut filter = QuorumFilter::new(3, 0.01).unwrap();
        filter.add(node.address().as_bytes());
        let task = TaskAnnouncement {
            task_id: "old".into(),
            filter: FilterModel::from_filter(&filter),
            prompt: "p".into(),
            deadline: 10,
            public_key: KeyPair::generate().public_key_hex(),
        };
        broadcast(&transport, &publisher, WireMessage::Task(task), &topics().input()).await;
        assert_eq!(node.answer_tasks(100).await.unwrap(), 0);
    }
}
