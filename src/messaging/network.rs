use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use futures::future;
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::{
    config::DEFAULT_RPC_TIMEOUT,
    messaging::{Message, MessagingError},
};

/// In-process routing between node queues.
///
/// Delivery is best-effort: every send is bounded by `send_timeout`, and a
/// partitioned node can neither send nor receive. Nodes must not assume
/// ordering or delivery.
#[derive(Debug)]
pub struct Network {
    nodes: HashMap<u64, mpsc::Sender<Arc<Message>>>,
    partitioned: HashSet<u64>,
    send_timeout: Duration,
}

impl Network {
    pub fn new() -> Self {
        Self::with_send_timeout(DEFAULT_RPC_TIMEOUT)
    }

    pub fn with_send_timeout(send_timeout: Duration) -> Self {
        Self { nodes: HashMap::new(), partitioned: HashSet::new(), send_timeout }
    }

    pub fn add_node(&mut self, node_id: u64, sender: mpsc::Sender<Arc<Message>>) {
        self.nodes.insert(node_id, sender);
    }

    /// Cut a node off from the rest of the cluster.
    pub fn disconnect(&mut self, node_id: u64) {
        warn!("Network: disconnecting node {}", node_id);
        self.partitioned.insert(node_id);
    }

    /// Heal a partition for a node.
    pub fn reconnect(&mut self, node_id: u64) {
        warn!("Network: reconnecting node {}", node_id);
        self.partitioned.remove(&node_id);
    }

    pub fn is_partitioned(&self, node_id: u64) -> bool {
        self.partitioned.contains(&node_id)
    }

    /// All node IDs registered on the network, including the caller's.
    pub fn node_ids(&self) -> Vec<u64> {
        self.nodes.keys().copied().collect()
    }

    pub fn nodes_count(&self) -> usize {
        self.nodes.len()
    }

    /// Send a message to a specific node within the send timeout.
    pub async fn send_message(
        &self,
        from: u64,
        to: u64,
        message: Arc<Message>,
    ) -> Result<(), MessagingError> {
        if self.is_partitioned(from) {
            return Err(MessagingError::Unreachable(from));
        }
        if self.is_partitioned(to) {
            return Err(MessagingError::Unreachable(to));
        }

        let sender = self.nodes.get(&to).ok_or(MessagingError::NodeNotFound(to))?;
        debug!("Network: routing message from node {} to node {}", from, to);
        sender.send_timeout(message, self.send_timeout).await.map_err(|e| match e {
            mpsc::error::SendTimeoutError::Timeout(_) => MessagingError::SendTimeout(to),
            mpsc::error::SendTimeoutError::Closed(_) => MessagingError::SendError(to),
        })
    }

    /// Broadcast a message to all other nodes concurrently.
    ///
    /// Per-peer failures are absorbed: a dead or slow peer costs at most one
    /// send timeout and never blocks delivery to the rest.
    pub async fn broadcast(&self, from: u64, message: Arc<Message>) {
        if self.is_partitioned(from) {
            warn!("Network: node {} is partitioned, broadcast goes nowhere", from);
            return;
        }

        let sends = self
            .nodes
            .iter()
            .filter(|(node_id, _)| **node_id != from && !self.is_partitioned(**node_id))
            .map(|(node_id, sender)| {
                let message = message.clone();
                async move {
                    (*node_id, sender.send_timeout(message, self.send_timeout).await)
                }
            });

        for (node_id, result) in future::join_all(sends).await {
            match result {
                Ok(()) => debug!("Network: broadcast from node {} reached node {}", from, node_id),
                Err(e) => warn!(
                    "Network: broadcast from node {} failed to reach node {}: {}",
                    from, node_id, e
                ),
            }
        }
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_test_node(network: &mut Network, id: u64) -> mpsc::Receiver<Arc<Message>> {
        let (tx, rx) = mpsc::channel(16);
        network.add_node(id, tx);
        rx
    }

    #[tokio::test]
    async fn test_send_to_unknown_node_fails() {
        let network = Network::new();
        let result = network.send_message(0, 42, Arc::new(Message::StartElectionCmd)).await;
        assert_eq!(result, Err(MessagingError::NodeNotFound(42)));
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender_and_partitioned_nodes() {
        let mut network = Network::new();
        let mut rx0 = add_test_node(&mut network, 0);
        let mut rx1 = add_test_node(&mut network, 1);
        let mut rx2 = add_test_node(&mut network, 2);
        network.disconnect(2);

        network.broadcast(0, Arc::new(Message::StartElectionCmd)).await;

        assert!(rx0.try_recv().is_err());
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_partitioned_sender_cannot_send() {
        let mut network = Network::new();
        let mut rx1 = add_test_node(&mut network, 1);
        add_test_node(&mut network, 0);
        network.disconnect(0);

        let result = network.send_message(0, 1, Arc::new(Message::StartElectionCmd)).await;
        assert_eq!(result, Err(MessagingError::Unreachable(0)));

        network.reconnect(0);
        network.send_message(0, 1, Arc::new(Message::StartElectionCmd)).await.unwrap();
        assert!(rx1.try_recv().is_ok());
    }
}
