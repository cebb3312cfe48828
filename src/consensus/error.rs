use crate::{messaging::MessagingError, storage::PersistenceError};

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Node {0} not found")]
    NodeNotFound(u64),
    #[error("Node {0} is not a leader")]
    NotLeader(u64),
    #[error("Node {0} is not a candidate")]
    NotCandidate(u64),
    #[error("Message handling failed: {0}")]
    Transport(#[from] MessagingError),
    /// The only fatal condition: a node must never acknowledge a vote or log
    /// write it failed to durably record.
    #[error("Persisting node state failed: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Timeout: {0}")]
    Timeout(String),
}
