use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use crate::messaging::{Message, MessagingError, Network, NodeReceiver};

const NODE_QUEUE_DEPTH: usize = 100;

/// A node's handle for sending messages through the shared network.
#[derive(Debug, Clone)]
pub struct NodeMessenger {
    /// The ID of the owning node.
    id: u64,
    network: Arc<Mutex<Network>>,
    /// Sender for this node's own inbound queue; registered with the network.
    pub sender: mpsc::Sender<Arc<Message>>,
}

impl NodeMessenger {
    pub fn new(id: u64, network: Arc<Mutex<Network>>) -> (Self, NodeReceiver) {
        let (sender, receiver) = mpsc::channel(NODE_QUEUE_DEPTH);
        (Self { id, network, sender }, NodeReceiver::new(id, receiver))
    }

    /// Sends a message directly into this node's own queue. Used to inject
    /// commands; does not cross the network, so partitions don't apply.
    pub async fn send_self(&self, message: Message) -> Result<(), MessagingError> {
        self.sender.send(Arc::new(message)).await.map_err(|_| MessagingError::SendError(self.id))
    }

    /// Sends a message to a specific node through the network.
    pub async fn send_to(&self, to: u64, message: Arc<Message>) -> Result<(), MessagingError> {
        let network = self.network.lock().await;
        network.send_message(self.id, to, message).await
    }

    /// Broadcasts a message to all other nodes. Per-peer failures are
    /// absorbed by the network.
    pub async fn broadcast(&self, message: Message) {
        let network = self.network.lock().await;
        network.broadcast(self.id, Arc::new(message)).await;
    }

    /// All node IDs on the network, including this node's.
    pub async fn node_ids(&self) -> Vec<u64> {
        self.network.lock().await.node_ids()
    }

    /// Total number of nodes in the cluster.
    pub async fn nodes_count(&self) -> usize {
        self.network.lock().await.nodes_count()
    }
}
