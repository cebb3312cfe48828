#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessagingError {
    #[error("Destination node {0} not found")]
    NodeNotFound(u64),
    #[error("Failed to send message to node {0}")]
    SendError(u64),
    #[error("Send to node {0} timed out")]
    SendTimeout(u64),
    #[error("Failed to receive message for node {0}")]
    ReceiveError(u64),
    #[error("Node {0} is unreachable")]
    Unreachable(u64),
}
