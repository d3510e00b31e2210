//! content topic naming
//!
//! every topic is `/<namespace>/<version>/<segment>/proto`. the version segment
//! separates protocol revisions that must never read each other's messages.

use uuid::Uuid;

use crate::error::{NodeError, Result};

/// segment of the task announcement topic
pub const INPUT_SEGMENT: &str = "synthesis";

/// segment of the heartbeat topic
pub const HEARTBEAT_SEGMENT: &str = "heartbeat";

/// longest caller-supplied task id
pub const MAX_TASK_ID_LEN: usize = 128;

/// a task id becomes a topic segment, so it must be one path component that
/// cannot alias the fixed topics
pub fn check_task_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_TASK_ID_LEN {
        return Err(NodeError::Validation(format!(
            "task id must be 1..={} bytes, got {}",
            MAX_TASK_ID_LEN,
            id.len()
        )));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(NodeError::Validation(format!("task id {:?} contains {:?}", id, c)));
    }
    if [INPUT_SEGMENT, HEARTBEAT_SEGMENT]
        .iter()
        .any(|reserved| id.eq_ignore_ascii_case(reserved))
    {
        return Err(NodeError::Validation(format!("task id {:?} is reserved", id)));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    namespace: String,
    version: u32,
}

impl Topics {
    pub fn new(namespace: impl Into<String>, version: u32) -> Self {
        Self {
            namespace: namespace.into(),
            version,
        }
    }

    fn topic(&self, segment: &str) -> String {
        format!("/{}/{}/{}/proto", self.namespace, self.version, segment)
    }

    /// where the publisher announces tasks
    pub fn input(&self) -> String {
        self.topic(INPUT_SEGMENT)
    }

    /// where the monitor broadcasts heartbeats
    pub fn heartbeat(&self) -> String {
        self.topic(HEARTBEAT_SEGMENT)
    }

    /// where participants answer one heartbeat round
    pub fn heartbeat_responses(&self, nonce: &Uuid) -> String {
        self.topic(&nonce.to_string())
    }

    /// where the quorum posts results for one task
    pub fn results(&self, task_id: &str) -> String {
        self.topic(task_id)
    }
}
