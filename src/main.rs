#![warn(missing_docs)]
//! An embedded, simplified Raft-style consensus node: leader election,
//! heartbeat/log replication, and commit-index advancement across an
//! in-process cluster of peers.

mod config;
mod consensus;
mod messaging;
mod state_machine;
mod storage;

use std::{collections::HashMap, sync::Arc, time::Duration};

use config::Config;
use consensus::{ConsensusError, ConsensusEvent, NodeServer, NodeTimer};
use log::{debug, error, info, warn};
use messaging::{Message, Network, NodeMessenger};
use state_machine::CounterStateMachine;
use storage::InMemoryPersistence;
use tokio::sync::{Mutex, broadcast};

/// Helper to send a command message to a specific node
async fn send_command_to_node(
    nodes_messengers: &HashMap<u64, NodeMessenger>,
    node_id: u64,
    message: Message,
) -> Result<(), ConsensusError> {
    if let Some(messenger) = nodes_messengers.get(&node_id) {
        // Use send_self because the command originates "externally" but targets the
        // node's loop
        messenger.send_self(message).await.map_err(ConsensusError::Transport)
    } else {
        Err(ConsensusError::NodeNotFound(node_id))
    }
}

/// Drain consensus events until a leader (other than `exclude`, if any) is
/// elected. Returns `(leader_id, term)`.
async fn wait_for_leader_elected(
    event_rx: &mut broadcast::Receiver<ConsensusEvent>,
    exclude: Option<u64>,
    deadline: Duration,
) -> Result<(u64, u64), ConsensusError> {
    let start_time = tokio::time::Instant::now();
    loop {
        if start_time.elapsed() > deadline {
            error!("Simulation: Timeout waiting for leader election after {:?}", deadline);
            return Err(ConsensusError::Timeout("Leader election timeout".to_string()));
        }

        match event_rx.try_recv() {
            Ok(ConsensusEvent::LeaderElected { leader_id, term })
                if Some(leader_id) != exclude =>
            {
                info!("Simulation: Leader Elected: Node {} in term {}", leader_id, term);
                return Ok((leader_id, term));
            }
            Ok(other_event) => {
                debug!("Simulation: Ignoring event while waiting for leader: {:?}", other_event);
            }
            Err(broadcast::error::TryRecvError::Empty) => {
                // No event yet, wait briefly
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                warn!("Simulation: Event receiver lagged by {} messages.", n);
            }
            Err(broadcast::error::TryRecvError::Closed) => {
                error!("Simulation: Event channel closed unexpectedly during leader wait.");
                return Err(ConsensusError::Timeout("Event channel closed".to_string()));
            }
        }
    }
}

/// Poll every node until each has applied at least `target_last_applied`
/// entries, or the timeout passes.
async fn verify_all_nodes_applied(
    nodes: &HashMap<u64, Arc<Mutex<NodeServer>>>,
    target_last_applied: u64,
    timeout: Duration,
) -> bool {
    let start_time = tokio::time::Instant::now();

    info!(
        "Simulation: Verifying application up to index {} across {} nodes (timeout: {:?})...",
        target_last_applied,
        nodes.len(),
        timeout
    );

    while start_time.elapsed() <= timeout {
        let mut all_nodes_ok = true;

        for (id, node_arc) in nodes {
            let node_locked = node_arc.lock().await; // Lock briefly

            // The counter state machine counts applied commands, so both
            // numbers must reach the target together.
            if !(node_locked.last_applied() >= target_last_applied
                && node_locked.state_machine_state() == target_last_applied)
            {
                all_nodes_ok = false;
                debug!(
                    "Node {} has not reached target state yet (last_applied={}, sm_state={})",
                    id,
                    node_locked.last_applied(),
                    node_locked.state_machine_state()
                );
                break;
            }
        }

        if all_nodes_ok {
            info!(
                "Simulation: Verification successful! All {} nodes applied {} entries.",
                nodes.len(),
                target_last_applied
            );
            return true;
        }

        // Wait before polling again
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    error!("Simulation: Verification timeout after {:?}.", timeout);
    for (id, node_arc) in nodes {
        let node_locked = node_arc.lock().await;
        error!(
            " -> Final State Node {}: Term={}, State={:?}, CommitIdx={}, LastApplied={}, SMState={}",
            id,
            node_locked.current_term(),
            node_locked.state(),
            node_locked.commit_index(),
            node_locked.last_applied(),
            node_locked.state_machine_state()
        );
    }
    false
}

#[tokio::main]
async fn main() -> Result<(), ConsensusError> {
    // Initialize logging
    env_logger::init();

    // Create a config
    let config = Config { node_count: 3, ..Default::default() };
    let election_deadline = config.election_timeout_max * 20;

    // Create a broadcast channel for consensus events.
    let (event_tx, mut event_rx) = broadcast::channel::<ConsensusEvent>(64);

    let network = Arc::new(Mutex::new(Network::with_send_timeout(config.rpc_timeout)));
    let mut nodes: HashMap<u64, Arc<Mutex<NodeServer>>> = HashMap::new();
    let mut nodes_messengers: HashMap<u64, NodeMessenger> = HashMap::new();

    info!("Simulation: Setting up {} nodes...", config.node_count);

    for id in 0..config.node_count as u64 {
        // Create a new node messenger and receiver
        let (node_messenger, mut node_receiver) = NodeMessenger::new(id, network.clone());

        // Add sender to the network
        network.lock().await.add_node(id, node_messenger.sender.clone());

        // Add messenger to the nodes messengers map (to send commands)
        nodes_messengers.insert(id, node_messenger.clone());

        // Create a new timer
        let mut timer = NodeTimer::new(config.clone());

        // Every node boots through recovery; a fresh store just yields an
        // empty state at term 0.
        let node_server = NodeServer::recover(
            id,
            Box::new(CounterStateMachine::new()),
            Box::new(InMemoryPersistence::new()),
            node_messenger,
            event_tx.clone(),
        )?;
        let node_server_arc = Arc::new(Mutex::new(node_server));
        // Store the node in the nodes map
        nodes.insert(id, node_server_arc.clone());

        // Spawn a task driving this node: one inbound message or timer
        // expiry at a time, so handler execution is serialized per node.
        tokio::spawn(async move {
            info!("Simulation: Start processing messages for node {}", id);

            loop {
                tokio::select! {
                  msg = node_receiver.receive() => {
                    match msg {
                      Ok(msg) => {
                        debug!("Simulation: Node {} received message: {:?}", id, msg);
                        let mut node_locked = node_server_arc.lock().await;
                        let step_result = node_locked.process_message(msg.clone(), &mut timer).await;
                        drop(node_locked);

                        if let Err(e) = step_result {
                          // Transport and protocol hiccups are retried on
                          // later ticks; only log them here.
                          error!(
                            "!!! Simulation: Error processing message {:?} for node {}: {:?}",
                            msg, id, e
                          );
                        }
                      }
                      Err(e) => {
                        error!("!!! Simulation: Error receiving message for node {}: {:?}", id, e);
                        break;
                      }
                    }
                  }

                  timer_event = timer.wait_for_timer_and_emit_event() => {
                    debug!("Simulation: Node {} timer event triggered: {:?}", id, timer_event);
                    let mut node_locked = node_server_arc.lock().await;
                    let result = node_locked.handle_timer_event(timer_event, &mut timer).await;
                    drop(node_locked);

                    if let Err(e) = result {
                      error!(
                        "!!! Simulation: Error handling timer event for node {}: {:?}",
                        id, e
                      );
                    }
                  }
                }

                tokio::task::yield_now().await;
            }
        });
    }

    drop(event_tx);

    info!("Simulation: Nodes initialized, tasks spawned");

    // Phase 1: Leader election
    info!("Simulation: Waiting for leader elected event...");
    let (leader_id, leader_term) =
        wait_for_leader_elected(&mut event_rx, None, election_deadline).await?;

    // Phase 2: Leader appends entries
    let num_commands_to_send: u64 = 10;

    info!("Simulation: Sending {} commands to Leader Node {}...", num_commands_to_send, leader_id);

    for i in 1..=num_commands_to_send {
        let command = format!("Command {}", i);
        debug!("Simulation: Sending command '{}' to Leader {}", command, leader_id);
        send_command_to_node(
            &nodes_messengers,
            leader_id,
            Message::StartAppendEntriesCmd { command },
        )
        .await?;
        // Small delay between commands to simulate client behavior
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    info!("Simulation: Finished sending commands.");

    // Phase 3: Verify that every node applied every command
    if !verify_all_nodes_applied(&nodes, num_commands_to_send, Duration::from_secs(10)).await {
        return Err(ConsensusError::Timeout("State verification failed".to_string()));
    }

    // Phase 4: Partition the leader away; the remaining majority elects a
    // replacement, while the isolated old leader can make no progress.
    info!("Simulation: Partitioning Leader Node {} away from the cluster...", leader_id);
    network.lock().await.disconnect(leader_id);

    let (new_leader_id, new_leader_term) =
        wait_for_leader_elected(&mut event_rx, Some(leader_id), election_deadline).await?;
    info!(
        "Simulation: Majority side elected Node {} for term {} (was Node {} in term {})",
        new_leader_id, new_leader_term, leader_id, leader_term
    );

    // Phase 5: Heal the partition and commit one more command through the
    // new leader; the rejoined node adopts the newer term and catches up.
    info!("Simulation: Reconnecting Node {}...", leader_id);
    network.lock().await.reconnect(leader_id);

    send_command_to_node(
        &nodes_messengers,
        new_leader_id,
        Message::StartAppendEntriesCmd { command: "Command after failover".to_string() },
    )
    .await?;

    if !verify_all_nodes_applied(&nodes, num_commands_to_send + 1, Duration::from_secs(10)).await {
        return Err(ConsensusError::Timeout("Post-failover verification failed".to_string()));
    }

    info!("Simulation: Complete.");
    Ok(())
}
