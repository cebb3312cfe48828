
use std::{collections::HashMap, sync::Arc};

use futures::future;
use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use crate::{
    consensus::{
        ConsensusError, ConsensusEvent, InMemoryLog, LogEntry, NodeCore, NodeState, NodeTimer,
        TimerType,
    },
    messaging::{Message, NodeMessenger},
    state_machine::StateMachine,
    storage::Persistence,
};

/// A consensus node: the core state machine plus its collaborators.
///
/// All handlers run one at a time (the owning task serializes them), mutate
/// the core, persist the durable fields, and only then respond.
#[derive(Debug)]
pub struct NodeServer {
    /// The core state of the node.
    core: NodeCore,
    /// Consumer of committed entries.
    state_machine: Box<dyn StateMachine>,
    /// Durable storage for term, vote, and log.
    persistence: Box<dyn Persistence>,
    /// The messenger for the node.
    messenger: NodeMessenger,
    /// The event sender for the node.
    event_tx: broadcast::Sender<ConsensusEvent>,
    /// What was last sent to each follower, keyed by follower ID:
    /// `(prev_log_index, entries_len)`. Needed to interpret its response.
    pending_append_entries: HashMap<u64, (u64, usize)>,
}

// Constructors
impl NodeServer {
    pub fn new(
        id: u64,
        state_machine: Box<dyn StateMachine>,
        persistence: Box<dyn Persistence>,
        messenger: NodeMessenger,
        event_tx: broadcast::Sender<ConsensusEvent>,
    ) -> Self {
        Self {
            core: NodeCore::new(id),
            state_machine,
            persistence,
            messenger,
            event_tx,
            pending_append_entries: HashMap::new(),
        }
    }

    /// Rebuild a node from its persistence after a restart. The node resumes
    /// as Follower with volatile state reset.
    pub fn recover(
        id: u64,
        state_machine: Box<dyn StateMachine>,
        persistence: Box<dyn Persistence>,
        messenger: NodeMessenger,
        event_tx: broadcast::Sender<ConsensusEvent>,
    ) -> Result<Self, ConsensusError> {
        let persisted = persistence.load()?;
        let log = Box::new(InMemoryLog::from_entries(persisted.log));
        let core = NodeCore::from_persisted(id, persisted.current_term, persisted.voted_for, log);
        Ok(Self {
            core,
            state_machine,
            persistence,
            messenger,
            event_tx,
            pending_append_entries: HashMap::new(),
        })
    }
}

// Getters (thin wrappers around core methods)
impl NodeServer {
    /// Get the node's ID.
    pub fn id(&self) -> u64 {
        self.core.id()
    }

    /// Get the node's current role.
    pub fn state(&self) -> NodeState {
        self.core.state()
    }

    /// Get the current term.
    pub fn current_term(&self) -> u64 {
        self.core.current_term()
    }

    /// Get the log.
    pub fn log(&self) -> &[LogEntry] {
        self.core.log_entries()
    }

    /// Get the commit index.
    pub fn commit_index(&self) -> u64 {
        self.core.commit_index()
    }

    /// Get the last applied index.
    pub fn last_applied(&self) -> u64 {
        self.core.last_applied()
    }

    /// Get the last log index.
    pub fn log_last_index(&self) -> u64 {
        self.core.log_last_index()
    }

    /// Get the last log term.
    pub fn log_last_term(&self) -> u64 {
        self.core.log_last_term()
    }

    /// Get the state machine's current state.
    pub fn state_machine_state(&self) -> u64 {
        self.state_machine.get_state()
    }

    // Getters for testing
    /// Get the match index for a peer.
    #[cfg(test)]
    pub fn match_index_for(&self, peer_id: u64) -> Option<u64> {
        self.core.match_index_for(peer_id)
    }

    /// Get the next index for a peer.
    #[cfg(test)]
    pub fn next_index_for(&self, peer_id: u64) -> Option<u64> {
        self.core.next_index_for(peer_id)
    }

    /// Get the node that this node voted for.
    #[cfg(test)]
    pub fn voted_for(&self) -> Option<u64> {
        self.core.voted_for()
    }
}

// Persistence
impl NodeServer {
    /// Durably record term, vote, and log. Must complete before any RPC
    /// response that depends on them; on failure the response is aborted.
    fn persist_hard_state(&mut self) -> Result<(), ConsensusError> {
        self.persistence.persist(
            self.core.current_term(),
            self.core.voted_for(),
            self.core.log_entries(),
        )?;
        Ok(())
    }
}

// RPC sends
impl NodeServer {
    /// Send an AppendResponse to a leader.
    async fn send_append_response(
        &self,
        leader_id: u64,
        success: bool,
        term: u64,
    ) -> Result<(), ConsensusError> {
        let msg = Message::AppendResponse { term, success, from_id: self.id() };
        debug!("Node {} sending AppendResponse to leader {}: {:?}", self.id(), leader_id, msg);
        self.messenger.send_to(leader_id, Arc::new(msg)).await.map_err(ConsensusError::Transport)
    }

    /// Send a VoteResponse to a candidate.
    async fn send_vote_response(
        &self,
        candidate_id: u64,
        vote_granted: bool,
        term: u64,
    ) -> Result<(), ConsensusError> {
        let msg = Message::VoteResponse { term, vote_granted, from_id: self.id() };
        info!("Node {} sending VoteResponse to candidate {}: {:?}", self.id(), candidate_id, msg);
        self.messenger.send_to(candidate_id, Arc::new(msg)).await.map_err(ConsensusError::Transport)
    }

    /// Broadcast a vote request to all other nodes.
    async fn broadcast_vote_request(&self) -> Result<(), ConsensusError> {
        if self.core.state() != NodeState::Candidate {
            warn!("Node {} tried to broadcast vote request but is not Candidate", self.id());
            return Err(ConsensusError::NotCandidate(self.id()));
        }

        let msg = Message::VoteRequest {
            term: self.current_term(),
            candidate_id: self.id(),
            last_log_index: self.log_last_index(),
            last_log_term: self.log_last_term(),
        };
        info!("Node {} broadcasting VoteRequest: {:?}", self.id(), msg);
        self.messenger.broadcast(msg).await;
        Ok(())
    }

    /// Send AppendEntries to every follower, concurrently. A peer that is
    /// unreachable or slow costs one bounded send and is retried on the next
    /// heartbeat tick.
    async fn send_append_entries_to_all_followers(&mut self) -> Result<(), ConsensusError> {
        if self.core.state() != NodeState::Leader {
            warn!("Node {} tried to send AppendEntries to followers but is not Leader", self.id());
            return Err(ConsensusError::NotLeader(self.id()));
        }

        debug!("Node {} sending AppendEntries to all followers", self.id());

        // Build every request up front so the sends can run concurrently.
        let mut requests = Vec::new();
        for peer_id in self.messenger.node_ids().await {
            if peer_id == self.id() {
                continue;
            }
            let msg = self.build_append_entries_for(peer_id)?;
            requests.push((peer_id, Arc::new(msg)));
        }

        let sends = requests.into_iter().map(|(peer_id, msg)| {
            let messenger = self.messenger.clone();
            async move { (peer_id, messenger.send_to(peer_id, msg).await) }
        });

        for (peer_id, result) in future::join_all(sends).await {
            if let Err(e) = result {
                // Non-fatal: the follower is retried on the next tick.
                warn!(
                    "Node {} failed to send AppendEntries to follower {}: {}",
                    self.id(),
                    peer_id,
                    e
                );
            }
        }

        Ok(())
    }

    /// Build the AppendEntries request for one follower from its next_index,
    /// recording what was sent so the response can be interpreted.
    fn build_append_entries_for(&mut self, peer_id: u64) -> Result<Message, ConsensusError> {
        let next_index =
            self.core.next_index_for(peer_id).ok_or(ConsensusError::NodeNotFound(peer_id))?;

        let prev_log_index = next_index - 1;
        let prev_log_term = if prev_log_index > 0 {
            self.core.log_entry(prev_log_index).map_or(0, |entry| entry.term)
        } else {
            0
        };

        // Everything from next_index onward; empty means heartbeat.
        let entries = self.core.log_entries_from(next_index);
        self.pending_append_entries.insert(peer_id, (prev_log_index, entries.len()));

        Ok(Message::AppendEntries {
            term: self.current_term(),
            leader_id: self.id(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index(),
        })
    }
}

// Command handlers
impl NodeServer {
    /// Start an election: become candidate (new term, self-vote), persist the
    /// new term, and solicit votes from all peers.
    async fn start_election(&mut self, timer: &mut NodeTimer) -> Result<(), ConsensusError> {
        info!("Node {} starting election for term {}", self.id(), self.current_term() + 1);
        self.core.transition_to_candidate();

        // The new term and self-vote must survive a crash, or this node
        // could vote twice in the same term after restarting.
        self.persist_hard_state()?;

        timer.reset_election_timer();
        self.broadcast_vote_request().await
    }

    /// Leader appends a new command to its log and replicates it right away;
    /// stragglers are caught up by the heartbeat.
    async fn start_append_entries(&mut self, command: String) -> Result<(), ConsensusError> {
        if !self.core.leader_append_entry(command.clone()) {
            return Err(ConsensusError::NotLeader(self.id()));
        }

        // The entry must be durable before any follower can acknowledge it.
        self.persist_hard_state()?;

        info!("Node {} appended new entry to log: {:?}", self.id(), command);
        self.send_append_entries_to_all_followers().await
    }

    /// Handle a vote request from a candidate.
    async fn handle_request_vote(
        &mut self,
        candidate_term: u64,
        candidate_id: u64,
        candidate_last_log_index: u64,
        candidate_last_log_term: u64,
        timer: &mut NodeTimer,
    ) -> Result<(), ConsensusError> {
        info!(
            "Node {} received VoteRequest from Node {} for Term {}",
            self.id(),
            candidate_id,
            candidate_term
        );

        let before = (self.core.current_term(), self.core.voted_for());
        let (vote_granted, term_to_respond) = self.core.decide_vote(
            candidate_id,
            candidate_term,
            candidate_last_log_index,
            candidate_last_log_term,
        );

        // Any term or vote movement must be durable before we answer.
        if (self.core.current_term(), self.core.voted_for()) != before {
            self.persist_hard_state()?;
        }

        let term_adopted = self.core.current_term() > before.0;
        if term_adopted || vote_granted {
            // A voter should not immediately start its own election, and a
            // deposed leader needs its election timer running again.
            timer.reset_election_timer();
        }

        if vote_granted {
            info!(
                "Node {} decided to GRANT vote for Node {} in term {}",
                self.id(),
                candidate_id,
                term_to_respond
            );
        } else {
            info!(
                "Node {} decided to REJECT vote for Node {} in term {}",
                self.id(),
                candidate_id,
                term_to_respond
            );
        }

        self.send_vote_response(candidate_id, vote_granted, term_to_respond).await
    }

    /// Handle an AppendEntries request from a leader.
    async fn handle_append_entries(
        &mut self,
        leader_term: u64,
        leader_id: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        new_entries: &[LogEntry],
        leader_commit_index: u64,
        timer: &mut NodeTimer,
    ) -> Result<(), ConsensusError> {
        debug!(
            "Node {} received AppendEntries from Leader {} for Term {}",
            self.id(),
            leader_id,
            leader_term
        );

        // 1. Stale leader: reject without touching any state.
        if leader_term < self.current_term() {
            warn!(
                "Node {} rejecting AppendEntries from Node {} (LeaderTerm {} < CurrentTerm {})",
                self.id(),
                leader_id,
                leader_term,
                self.current_term()
            );
            return self.send_append_response(leader_id, false, self.current_term()).await;
        }

        // 2. A valid heartbeat from the current leader suppresses elections.
        timer.reset_election_timer();

        // 3. Adopt the leader's term; a candidate of the same term steps down.
        let term_before = self.current_term();
        self.core.transition_to_follower(leader_term);

        // 4. Consistency check and append, truncating any conflicting suffix.
        let (log_consistent, log_modified) =
            self.core.follower_append_entries(prev_log_index, prev_log_term, new_entries);

        // 5. Durably record the adopted term and any log change before
        // acknowledging either.
        if self.current_term() > term_before || log_modified {
            self.persist_hard_state()?;
        }

        if !log_consistent {
            warn!(
                "Node {} log is not consistent with Leader {} log. Rejecting AppendEntries.",
                self.id(),
                leader_id
            );
            return self.send_append_response(leader_id, false, self.current_term()).await;
        }

        // 6. Advance the commit index and apply what became committed.
        self.core.follower_update_commit_index(leader_commit_index);
        self.apply_committed_entries();

        self.send_append_response(leader_id, true, self.current_term()).await
    }

    /// Handle a vote response. Used by candidates to tally votes.
    async fn handle_vote_response(
        &mut self,
        term: u64,
        voter_id: u64,
        vote_granted: bool,
        timer: &mut NodeTimer,
    ) -> Result<(), ConsensusError> {
        info!(
            "Node {} received VoteResponse from Node {} for Term {} (Granted: {})",
            self.id(),
            voter_id,
            term,
            vote_granted
        );

        if self.core.state() != NodeState::Candidate {
            debug!(
                "Node {} received VoteResponse but is no longer a Candidate. Ignoring.",
                self.id()
            );
            return Ok(());
        }

        if term < self.current_term() {
            debug!(
                "Node {} received VoteResponse for older term {} from Node {}, ignoring.",
                self.id(),
                term,
                voter_id
            );
            return Ok(());
        }

        if term > self.current_term() {
            info!(
                "Node {} sees newer term {} in VoteResponse from Node {}, transitioning to \
                 Follower.",
                self.id(),
                term,
                voter_id
            );
            self.core.transition_to_follower(term);
            self.persist_hard_state()?;
            timer.reset_election_timer();
            return Ok(());
        }

        if !vote_granted {
            info!("Node {} received vote rejection from Node {}", self.id(), voter_id);
            return Ok(());
        }

        let votes = self.core.record_vote_from(voter_id);
        let total_nodes = self.messenger.nodes_count().await as u64;
        let majority = total_nodes / 2 + 1;

        info!("Node {} has {}/{} votes in term {}", self.id(), votes, total_nodes, term);

        if votes >= majority {
            info!(
                "Node {} received majority of votes ({}/{}), becoming Leader for Term {}",
                self.id(),
                votes,
                total_nodes,
                self.current_term()
            );

            let peer_ids = self.messenger.node_ids().await;
            self.core.transition_to_leader(&peer_ids);
            timer.reset_heartbeat_timer();

            let _ = self.event_tx.send(ConsensusEvent::LeaderElected {
                leader_id: self.id(),
                term: self.current_term(),
            });

            // Assert authority immediately to stop further elections.
            self.send_append_entries_to_all_followers().await?;
        }

        Ok(())
    }

    /// Handle a follower's AppendResponse. Used by leaders to advance
    /// per-peer progress and the commit index.
    async fn handle_append_response(
        &mut self,
        follower_term: u64,
        success: bool,
        from_id: u64,
        timer: &mut NodeTimer,
    ) -> Result<(), ConsensusError> {
        debug!(
            "Node {} received AppendResponse from follower {} for term {} (Success: {})",
            self.id(),
            from_id,
            follower_term,
            success
        );

        if self.core.state() != NodeState::Leader {
            debug!("Node {} received AppendResponse but is no longer Leader. Ignoring.", self.id());
            self.pending_append_entries.remove(&from_id);
            return Ok(());
        }

        if follower_term > self.current_term() {
            info!(
                "Node {} (Leader) sees newer term {} in AppendResponse from follower {}, \
                 transitioning to Follower.",
                self.id(),
                follower_term,
                from_id
            );
            self.pending_append_entries.clear();
            self.core.transition_to_follower(follower_term);
            self.persist_hard_state()?;
            timer.reset_election_timer();
            return Ok(());
        }

        if follower_term < self.current_term() {
            debug!(
                "Node {} (Leader) received stale AppendResponse from Node {} for term {}. \
                 Ignoring.",
                self.id(),
                from_id,
                follower_term
            );
            return Ok(());
        }

        let Some((sent_prev_log_index, sent_entries_len)) =
            self.pending_append_entries.remove(&from_id)
        else {
            warn!(
                "Node {} (Leader) received AppendResponse from {} with nothing pending. Ignoring.",
                self.id(),
                from_id
            );
            return Ok(());
        };

        let total_nodes = self.messenger.nodes_count().await as u64;
        let (commit_advanced, _old_ci, _new_ci) = self.core.leader_process_append_response(
            from_id,
            success,
            sent_prev_log_index,
            sent_entries_len,
            total_nodes,
        );

        if commit_advanced {
            self.apply_committed_entries();
        }

        Ok(())
    }

    /// Send a heartbeat to all followers. Used on the heartbeat tick.
    async fn send_heartbeat(&mut self) -> Result<(), ConsensusError> {
        debug!("Node {} sending heartbeat to all followers", self.id());
        self.send_append_entries_to_all_followers().await
    }

    /// Handle a timer event (election or heartbeat timeout).
    pub async fn handle_timer_event(
        &mut self,
        timer_type: TimerType,
        timer: &mut NodeTimer,
    ) -> Result<(), ConsensusError> {
        match timer_type {
            TimerType::Election =>
                if self.state() != NodeState::Leader {
                    self.start_election(timer).await?;
                } else {
                    warn!(
                        "Node {} received election timer event but is already a Leader. Ignoring.",
                        self.id()
                    );
                    timer.reset_heartbeat_timer();
                },
            TimerType::Heartbeat =>
                if self.state() == NodeState::Leader {
                    self.send_heartbeat().await?;
                } else {
                    warn!(
                        "Node {} received heartbeat timer event but is not a Leader. Ignoring.",
                        self.id()
                    );
                    timer.reset_election_timer();
                },
        }
        Ok(())
    }

    /// Process a single inbound message. Used by the node's event loop.
    pub async fn process_message(
        &mut self,
        msg: Arc<Message>,
        timer: &mut NodeTimer,
    ) -> Result<(), ConsensusError> {
        match *msg {
            Message::VoteRequest { term, candidate_id, last_log_index, last_log_term } => {
                self.handle_request_vote(term, candidate_id, last_log_index, last_log_term, timer)
                    .await?;
            }
            Message::VoteResponse { term, vote_granted, from_id } => {
                self.handle_vote_response(term, from_id, vote_granted, timer).await?;
            }
            Message::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                ref entries,
                leader_commit,
            } => {
                self.handle_append_entries(
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                    timer,
                )
                .await?;
            }
            Message::AppendResponse { term, success, from_id } => {
                self.handle_append_response(term, success, from_id, timer).await?;
            }
            Message::StartElectionCmd => {
                info!("Node {} received StartElectionCmd", self.id());
                if self.state() != NodeState::Leader {
                    self.start_election(timer).await?;
                } else {
                    warn!(
                        "Node {} received StartElectionCmd but is already a Leader. Ignoring.",
                        self.id()
                    );
                }
            }
            Message::StartAppendEntriesCmd { ref command } => {
                info!("Node {} received StartAppendEntriesCmd: '{}'", self.id(), command);
                if self.state() == NodeState::Leader {
                    self.start_append_entries(command.clone()).await?;
                } else {
                    warn!(
                        "Node {} received StartAppendEntriesCmd but is not a Leader. Ignoring.",
                        self.id()
                    );
                }
            }
        }

        Ok(())
    }
}

// State machine update
impl NodeServer {
    /// Apply entries from `last_applied + 1` through `commit_index` to the
    /// state machine, in order, advancing the cursor as we go.
    fn apply_committed_entries(&mut self) {
        let commit_idx = self.commit_index();
        let mut last_applied = self.last_applied();

        if commit_idx <= last_applied {
            return;
        }

        info!(
            "Node {} applying entries from index {} up to {}",
            self.id(),
            last_applied + 1,
            commit_idx
        );

        for i in (last_applied + 1)..=commit_idx {
            let Some(entry) = self.core.log_entry(i) else {
                error!(
                    "Node {} CRITICAL: tried to apply non-existent log entry at index {}",
                    self.id(),
                    i
                );
                break;
            };
            let command = entry.command.clone();

            info!("Node {} applying log[{}] ('{}') to state machine.", self.id(), i, command);
            self.state_machine.apply(&command);
            last_applied = i;

            let _ = self.event_tx.send(ConsensusEvent::EntryCommitted { index: i, entry: command });
        }

        self.core.set_last_applied(last_applied);
    }
}
