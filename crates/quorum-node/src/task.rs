//! task lifecycle and persisted records

use std::fmt;

use quorum_primitives::Address;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{NodeError, Result};
use crate::message::FilterModel;
use crate::store::{get_json, put_json, KvStore};
use crate::topic::check_task_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Published,
    AwaitingResults,
    Aggregating,
    Completed,
    FailedTimeout,
    FailedInsufficientQuorum,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Published => "PUBLISHED",
            TaskStatus::AwaitingResults => "AWAITING_RESULTS",
            TaskStatus::Aggregating => "AGGREGATING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::FailedTimeout => "FAILED_TIMEOUT",
            TaskStatus::FailedInsufficientQuorum => "FAILED_INSUFFICIENT_QUORUM",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::FailedTimeout | TaskStatus::FailedInsufficientQuorum
        )
    }

    /// forward edges only; nothing re-enters pending
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Published)
                | (Published, AwaitingResults)
                | (AwaitingResults, Aggregating)
                | (Aggregating, Completed)
                | (Aggregating, FailedTimeout)
                | (Aggregating, FailedInsufficientQuorum)
        )
    }

    pub fn check_transition(&self, next: TaskStatus) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(NodeError::IllegalTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// work item on the intake channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub prompt: String,
}

impl TaskRequest {
    /// reject ids that cannot serve as a result topic segment
    pub fn validated(self) -> Result<Self> {
        if let Some(id) = &self.id {
            check_task_id(id)?;
        }
        Ok(self)
    }
}

/// work item on the aggregation channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationJob {
    pub task_id: String,
}

/// published task as persisted under `task:<id>`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub prompt: String,
    pub deadline: u64,
    pub filter: FilterModel,
    /// number of addresses the filter was sized for
    pub filter_capacity: u32,
    /// acceptance threshold, equal to the number of sampled participants
    pub quorum_size: u32,
    /// sampled addresses; never broadcast
    pub quorum: Vec<Address>,
    /// task public key, compressed hex
    pub public_key: String,
    /// task secret, hex; dropped once the task is terminal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_secret: Option<String>,
    pub publisher_signature: String,
    pub status: TaskStatus,
    pub created_at: u64,
}

impl TaskRecord {
    pub fn store_key(id: &str) -> String {
        format!("task:{}", id)
    }

    pub fn is_due(&self, now: u64) -> bool {
        now >= self.deadline
    }
}

/// selected response as persisted under `result:<id>` and sent on the
/// results channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultRecord {
    pub task_id: String,
    pub address: Address,
    pub text: String,
    pub score: f32,
    pub accepted: usize,
    pub completed_at: u64,
}

impl TaskResultRecord {
    pub fn store_key(task_id: &str) -> String {
        format!("result:{}", task_id)
    }
}

pub async fn load_task<S: KvStore + ?Sized>(store: &S, id: &str) -> Result<Option<TaskRecord>> {
    get_json(store, &TaskRecord::store_key(id)).await
}

pub async fn save_task<S: KvStore + ?Sized>(store: &S, record: &TaskRecord) -> Result<()> {
    put_json(store, &TaskRecord::store_key(&record.id), record).await
}

/// move `record` to `next` and persist it. terminal states archive the
/// record with the task secret removed
pub async fn advance<S: KvStore + ?Sized>(
    store: &S,
    record: &mut TaskRecord,
    next: TaskStatus,
) -> Result<()> {
    record.status.check_transition(next)?;
    debug!("task {}: {} -> {}", record.id, record.status, next);
    record.status = next;

    if next.is_terminal() {
        record.ephemeral_secret = None;
        save_task(store, record).await
    } else {
        store
            .update_field(&TaskRecord::store_key(&record.id), "status", json!(next))
            .await
    }
}
