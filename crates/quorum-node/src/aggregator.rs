//! result aggregator
//!
//! once a task's deadline has passed, every message on its result topic is
//! opened with the task secret, its signer recovered and checked against the
//! quorum filter. with at least `quorum_size` distinct verified responders the
//! response the others agree with most is selected; otherwise the task fails.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use quorum_primitives::{identity, seal, Address, KeyPair, QuorumFilter, RecoverableSignature};
use tracing::{debug, info, warn};

use crate::config::{Channels, Config, MembershipGate};
use crate::consensus::{self, Candidate};
use crate::embedding::Embedder;
use crate::error::{NodeError, Result};
use crate::message::{decode_reply, WireMessage};
use crate::queue::{enqueue_json, WorkQueue};
use crate::store::{put_json, KvStore};
use crate::task::{advance, load_task, AggregationJob, TaskRecord, TaskResultRecord, TaskStatus};
use crate::topic::Topics;
use crate::transport::{GossipMessage, GossipTransport};
use crate::worker::unix_now;

#[derive(Debug, Clone, PartialEq)]
pub enum AggregateOutcome {
    /// deadline not reached; the task keeps waiting
    NotDue,
    Completed(TaskResultRecord),
    /// nobody answered at all
    FailedTimeout,
    FailedInsufficientQuorum { accepted: usize, required: usize },
}

/// one response that passed decryption, signer recovery and the gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedResponse {
    pub address: Address,
    pub text: String,
}

pub struct Aggregator {
    transport: Arc<dyn GossipTransport>,
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn KvStore>,
    embedder: Arc<dyn Embedder>,
    topics: Topics,
    channels: Channels,
    gate: MembershipGate,
    polling_interval: Duration,
}

impl Aggregator {
    pub fn new(
        config: &Config,
        transport: Arc<dyn GossipTransport>,
        queue: Arc<dyn WorkQueue>,
        store: Arc<dyn KvStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            transport,
            queue,
            store,
            embedder,
            topics: config.topics(),
            channels: config.channels.clone(),
            gate: config.membership_gate,
            polling_interval: config.polling_interval(),
        }
    }

    pub fn polling_interval(&self) -> Duration {
        self.polling_interval
    }

    /// work through the aggregation jobs pending at the start of the cycle
    pub async fn run_once(&self) -> Result<Vec<(String, AggregateOutcome)>> {
        self.run_at(unix_now()).await
    }

    pub async fn run_at(&self, now: u64) -> Result<Vec<(String, AggregateOutcome)>> {
        let pending = self.queue.pending(&self.channels.aggregation).await?;
        let mut outcomes = Vec::with_capacity(pending);

        for _ in 0..pending {
            let Some(delivery) = self.queue.dequeue(&self.channels.aggregation).await? else {
                break;
            };
            let job: AggregationJob = match delivery.decode() {
                Ok(job) => job,
                Err(e) => {
                    warn!("dropping malformed aggregation job: {}", e);
                    self.queue.ack(&delivery).await?;
                    continue;
                }
            };

            match self.aggregate_task(&job.task_id, now).await {
                Ok(AggregateOutcome::NotDue) => {
                    self.queue.nack(&delivery).await?;
                    outcomes.push((job.task_id, AggregateOutcome::NotDue));
                }
                Ok(outcome) => {
                    self.queue.ack(&delivery).await?;
                    outcomes.push((job.task_id, outcome));
                }
                Err(e @ NodeError::NotFound(_)) | Err(e @ NodeError::IllegalTransition { .. }) => {
                    warn!(task_id = %job.task_id, "dropping aggregation job: {}", e);
                    self.queue.ack(&delivery).await?;
                }
                Err(e) => {
                    self.queue.nack(&delivery).await?;
                    return Err(e);
                }
            }
        }
        Ok(outcomes)
    }

    pub async fn aggregate_task(&self, task_id: &str, now: u64) -> Result<AggregateOutcome> {
        let mut record = load_task(self.store.as_ref(), task_id)
            .await?
            .ok_or_else(|| NodeError::NotFound(TaskRecord::store_key(task_id)))?;

        // the publisher has not finished scheduling this task yet
        if !record.is_due(now) || record.status == TaskStatus::Published {
            debug!(task_id, deadline = record.deadline, now, "task not due yet");
            return Ok(AggregateOutcome::NotDue);
        }

        // fetch before committing to AGGREGATING so a transport failure
        // leaves the task retryable
        let messages = self.transport.fetch_messages(&self.topics.results(task_id)).await?;

        if record.status != TaskStatus::Aggregating {
            advance(self.store.as_ref(), &mut record, TaskStatus::Aggregating).await?;
        }

        if messages.is_empty() {
            info!(task_id, "no responses before the deadline");
            advance(self.store.as_ref(), &mut record, TaskStatus::FailedTimeout).await?;
            return Ok(AggregateOutcome::FailedTimeout);
        }

        let accepted = self.verify_responses(&record, &messages)?;
        let required = record.quorum_size as usize;
        if accepted.len() < required {
            warn!(task_id, accepted = accepted.len(), required, "insufficient quorum");
            advance(self.store.as_ref(), &mut record, TaskStatus::FailedInsufficientQuorum).await?;
            return Ok(AggregateOutcome::FailedInsufficientQuorum {
                accepted: accepted.len(),
                required,
            });
        }

        let texts: Vec<String> = accepted.iter().map(|r| r.text.clone()).collect();
        let embeddings = self.embedder.embed(&texts).await?;
        if embeddings.len() != accepted.len() {
            return Err(NodeError::Embedding(format!(
                "{} embeddings for {} responses",
                embeddings.len(),
                accepted.len()
            )));
        }
        let candidates: Vec<Candidate> = accepted
            .into_iter()
            .zip(embeddings)
            .map(|(r, embedding)| Candidate {
                address: r.address,
                text: r.text,
                embedding,
            })
            .collect();
        let selection = consensus::select(&candidates)
            .ok_or_else(|| NodeError::Validation("no candidates to select from".into()))?;
        let winner = &candidates[selection.index];

        let result = TaskResultRecord {
            task_id: task_id.to_string(),
            address: winner.address,
            text: winner.text.clone(),
            score: selection.score,
            accepted: candidates.len(),
            completed_at: now,
        };
        put_json(self.store.as_ref(), &TaskResultRecord::store_key(task_id), &result).await?;
        enqueue_json(self.queue.as_ref(), &self.channels.results, &result).await?;
        advance(self.store.as_ref(), &mut record, TaskStatus::Completed).await?;

        info!(task_id, winner = %result.address, score = result.score, "task completed");
        Ok(AggregateOutcome::Completed(result))
    }

    /// open, recover and gate every message; first response per signer wins
    pub fn verify_responses(
        &self,
        record: &TaskRecord,
        messages: &[GossipMessage],
    ) -> Result<Vec<VerifiedResponse>> {
        let secret = record
            .ephemeral_secret
            .as_deref()
            .ok_or_else(|| NodeError::Validation(format!("task {} has no secret", record.id)))?;
        let task_key = KeyPair::from_hex(secret)?;
        let filter = record.filter.to_filter_expecting(record.filter_capacity)?;
        let quorum: HashSet<Address> = record.quorum.iter().copied().collect();

        let mut seen = HashSet::new();
        let mut accepted = Vec::new();
        for message in messages {
            let response = match open_response(&task_key, &message.payload) {
                Ok(r) => r,
                Err(e) if e.is_item_local() => {
                    debug!(task_id = %record.id, "dropping response: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !self.admits(&filter, &quorum, &response.address) {
                debug!(task_id = %record.id, address = %response.address, "responder not in quorum");
                continue;
            }
            if seen.insert(response.address) {
                accepted.push(response);
            }
        }
        Ok(accepted)
    }

    fn admits(&self, filter: &QuorumFilter, quorum: &HashSet<Address>, address: &Address) -> bool {
        if !filter.contains(address.as_bytes()) {
            return false;
        }
        match self.gate {
            MembershipGate::Bloom => true,
            MembershipGate::Exact => quorum.contains(address),
        }
    }
}

fn open_response(task_key: &KeyPair, encoded: &str) -> Result<VerifiedResponse> {
    let result = match decode_reply(encoded)? {
        WireMessage::TaskResult(r) => r,
        other => {
            return Err(NodeError::Validation(format!("expected task_result, got {}", other.kind())))
        }
    };
    let sealed = hex::decode(result.ciphertext.trim_start_matches("0x"))
        .map_err(|e| NodeError::Validation(format!("ciphertext: {}", e)))?;
    let plaintext = seal::open(task_key, &sealed)?;
    let signature = RecoverableSignature::from_hex(&result.signature)?;
    let address = identity::recover_signer(&signature, &plaintext)?;
    let text = String::from_utf8(plaintext)
        .map_err(|_| NodeError::Validation("answer is not utf-8".into()))?;
    Ok(VerifiedResponse { address, text })
}
