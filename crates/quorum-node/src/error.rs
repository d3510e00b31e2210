use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("transient transport error: {0}")]
    TransientTransport(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] quorum_primitives::Error),

    #[error("insufficient quorum: {accepted} of {required} responses verified")]
    InsufficientQuorum { accepted: usize, required: usize },

    #[error("component init failed: {0}")]
    ComponentInit(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("illegal task transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },
}

pub type Result<T> = std::result::Result<T, NodeError>;

impl NodeError {
    /// errors worth retrying after a backoff; everything else is either a
    /// per-item drop or terminal for the current operation
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeError::TransientTransport(_) | NodeError::Storage(_) | NodeError::Queue(_)
        )
    }

    /// errors that only invalidate a single inbound item
    pub fn is_item_local(&self) -> bool {
        matches!(self, NodeError::Validation(_) | NodeError::Crypto(_))
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

impl From<sled::Error> for NodeError {
    fn from(err: sled::Error) -> Self {
        NodeError::Storage(format!("sled: {}", err))
    }
}

impl From<reqwest::Error> for NodeError {
    fn from(err: reqwest::Error) -> Self {
        let transient = err.is_connect()
            || err.is_timeout()
            || err.status().map(|s| s.is_server_error()).unwrap_or(false);
        if transient {
            NodeError::TransientTransport(err.to_string())
        } else {
            NodeError::Transport(err.to_string())
        }
    }
}
