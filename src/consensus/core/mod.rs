#[cfg(test)]
mod tests;

use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
};

use log::{debug, error, info, warn};

use crate::consensus::{InMemoryLog, LogEntry, LogStore};

/// The role of a node in the consensus protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    Follower,
    Candidate,
    Leader,
}

/// The pure state machine of a node: roles, terms, votes, and the log.
///
/// `NodeCore` performs no I/O. The server around it is responsible for
/// persisting `current_term`, `voted_for`, and the log before any RPC
/// response that depends on them.
#[derive(Debug)]
pub struct NodeCore {
    /// The id of the node.
    id: u64,

    // Persistent state
    /// The current term of the node.
    current_term: u64,
    /// The candidate this node voted for in the current term.
    voted_for: Option<u64>,
    /// The replicated log.
    log: Box<dyn LogStore>,

    // Volatile state
    /// Highest log index known committed.
    commit_index: u64,
    /// Highest log index applied to the state machine.
    last_applied: u64,
    /// The role of the node.
    state: NodeState,

    // Candidate only
    /// Peers that granted this node a vote in the current term. A set, so a
    /// re-delivered response cannot count twice toward the majority.
    votes_from: HashSet<u64>,

    // Leader only
    /// Index of the next entry to send, per peer.
    next_index: HashMap<u64, u64>,
    /// Highest index known replicated, per peer.
    match_index: HashMap<u64, u64>,
}

// Constructors
impl NodeCore {
    pub fn new(id: u64) -> Self {
        Self::with_log(id, Box::new(InMemoryLog::new()))
    }

    pub fn with_log(id: u64, log: Box<dyn LogStore>) -> Self {
        Self {
            id,
            current_term: 0,
            voted_for: None,
            log,
            commit_index: 0,
            last_applied: 0,
            state: NodeState::default(),
            votes_from: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        }
    }

    /// Rebuild a node from recovered durable state. The node resumes as
    /// Follower; `commit_index` and `last_applied` restart at 0 and are
    /// recovered naturally via replication.
    pub fn from_persisted(
        id: u64,
        current_term: u64,
        voted_for: Option<u64>,
        log: Box<dyn LogStore>,
    ) -> Self {
        info!(
            "Node {} recovered with term {}, voted_for {:?}, {} log entries",
            id,
            current_term,
            voted_for,
            log.last_index()
        );
        Self { current_term, voted_for, ..Self::with_log(id, log) }
    }
}

// Getters
impl NodeCore {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<u64> {
        self.voted_for
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Number of votes gathered this term, including the self-vote.
    pub fn votes_received(&self) -> u64 {
        self.votes_from.len() as u64
    }

    /// Index of the last log entry (1-based; 0 for an empty log).
    pub fn log_last_index(&self) -> u64 {
        self.log.last_index()
    }

    /// Term of the last log entry (0 for an empty log).
    pub fn log_last_term(&self) -> u64 {
        self.log.last_term()
    }

    pub fn log_entry(&self, index: u64) -> Option<&LogEntry> {
        self.log.entry(index)
    }

    /// All log entries, for persistence.
    pub fn log_entries(&self) -> &[LogEntry] {
        self.log.entries()
    }

    /// Log suffix starting at `from_index`, for replication.
    pub fn log_entries_from(&self, from_index: u64) -> Vec<LogEntry> {
        self.log.entries_from(from_index)
    }

    /// Get the next index for a peer.
    pub fn next_index_for(&self, peer_id: u64) -> Option<u64> {
        self.next_index.get(&peer_id).copied()
    }

    /// Get the match index for a peer.
    pub fn match_index_for(&self, peer_id: u64) -> Option<u64> {
        self.match_index.get(&peer_id).copied()
    }
}

// Setters
impl NodeCore {
    /// Set the last applied index.
    pub fn set_last_applied(&mut self, index: u64) {
        // last_applied may never pass commit_index
        let applied_index = index.min(self.commit_index());

        match applied_index.cmp(&self.last_applied) {
            Ordering::Greater => {
                self.last_applied = applied_index;
                debug!("Node {} updated last_applied to {}", self.id, self.last_applied);
            }
            Ordering::Less => {
                error!(
                    "Node {} attempted to set last_applied to {} (lower than current {})",
                    self.id, applied_index, self.last_applied
                );
            }
            Ordering::Equal => {}
        }
    }

    /// Update the term of the node and reset the vote if new_term is greater
    /// than current_term. Returns true if the term was updated, false
    /// otherwise.
    fn update_term(&mut self, new_term: u64) -> bool {
        if new_term > self.current_term() {
            info!("Node {} updated term from {} to {}", self.id, self.current_term, new_term);
            self.current_term = new_term;
            self.voted_for = None;
            true
        } else {
            false
        }
    }
}

// State transitions
impl NodeCore {
    /// Transition to follower, discarding any candidate or leader state.
    pub fn transition_to_follower(&mut self, term: u64) {
        let term_updated = self.update_term(term);
        let state_changed = self.state() != NodeState::Follower;

        if term_updated || state_changed {
            info!("Node {} transitioning to follower state at term {}", self.id, term);
            self.state = NodeState::Follower;
            self.votes_from.clear();
            // Leader-only replication progress is meaningless once deposed.
            self.next_index.clear();
            self.match_index.clear();
        }
    }

    /// Transition to candidate: advance the term and vote for self. Starting
    /// over from Candidate (a retry election) is allowed.
    pub fn transition_to_candidate(&mut self) {
        if self.state() == NodeState::Leader {
            warn!("Node {} attempted to transition to candidate state but is a Leader", self.id);
            return;
        }

        let new_term = self.current_term() + 1;
        info!("Node {} transitioning to candidate state at term {}", self.id, new_term);

        let term_updated = self.update_term(new_term);
        debug_assert!(term_updated, "term should increase");
        self.state = NodeState::Candidate;
        self.voted_for = Some(self.id);
        self.votes_from.clear();
        self.votes_from.insert(self.id); // self vote
    }

    /// Transition to leader and initialize per-peer replication progress.
    pub fn transition_to_leader(&mut self, peer_ids: &[u64]) {
        if self.state() != NodeState::Candidate {
            warn!(
                "Node {} attempted to transition to leader state but is not a candidate",
                self.id
            );
            return;
        }

        info!("Node {} transitioning to leader state at term {}", self.id, self.current_term());
        self.state = NodeState::Leader;
        self.votes_from.clear();

        self.initialize_leader_state(peer_ids);
    }

    fn initialize_leader_state(&mut self, peer_ids: &[u64]) {
        self.next_index.clear();
        self.match_index.clear();
        let last_log_index = self.log_last_index();

        for peer_id in peer_ids {
            if *peer_id == self.id {
                continue;
            }

            // + 1 because the next entry to send follows the leader's log
            self.next_index.insert(*peer_id, last_log_index + 1);
            self.match_index.insert(*peer_id, 0);
        }

        info!(
            "Node {} initialized leader state with next_index: {:?}, match_index: {:?}",
            self.id, self.next_index, self.match_index
        );
    }
}

// Voting
impl NodeCore {
    /// Decides whether to grant a vote based on RequestVote RPC args, updating
    /// term and voted_for internally as needed.
    /// Returns `(vote_granted, term_to_respond_with)`.
    pub fn decide_vote(
        &mut self,
        candidate_id: u64,
        candidate_term: u64,
        candidate_last_log_index: u64,
        candidate_last_log_term: u64,
    ) -> (bool, u64) {
        // 1. Stale term: reject outright.
        if candidate_term < self.current_term() {
            debug!(
                "Node {} rejecting vote for {}: stale term {} < {}",
                self.id,
                candidate_id,
                candidate_term,
                self.current_term()
            );
            return (false, self.current_term());
        }

        // 2. Higher term: adopt it and step down before deciding.
        if candidate_term > self.current_term() {
            self.transition_to_follower(candidate_term);
        }

        // 3. One vote per term.
        let can_vote = match self.voted_for {
            // Already voted for the requesting candidate: grant again (idempotent)
            Some(id) if id == candidate_id => true,
            // Already voted for someone else: reject
            Some(_) => false,
            // Haven't voted yet
            None => true,
        };

        if !can_vote {
            debug!(
                "Node {} rejecting vote for {} in term {}: already voted for {:?}",
                self.id,
                candidate_id,
                self.current_term(),
                self.voted_for
            );
            return (false, self.current_term());
        }

        // 4. Election restriction: the candidate's log must be at least as
        // up-to-date as ours, or it could erase committed entries.
        if !self.candidate_log_up_to_date(candidate_last_log_index, candidate_last_log_term) {
            info!(
                "Node {} rejecting vote for {} in term {}: candidate log (term {}, index {}) \
                 behind ours (term {}, index {})",
                self.id,
                candidate_id,
                self.current_term(),
                candidate_last_log_term,
                candidate_last_log_index,
                self.log_last_term(),
                self.log_last_index()
            );
            return (false, self.current_term());
        }

        // 5. Grant vote
        info!(
            "Node {} voting for candidate {} in term {}",
            self.id,
            candidate_id,
            self.current_term()
        );
        self.voted_for = Some(candidate_id);
        (true, self.current_term())
    }

    /// Compare logs by last term, then by last index on a tie.
    fn candidate_log_up_to_date(
        &self,
        candidate_last_log_index: u64,
        candidate_last_log_term: u64,
    ) -> bool {
        match candidate_last_log_term.cmp(&self.log_last_term()) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => candidate_last_log_index >= self.log_last_index(),
        }
    }

    /// Record a granted vote from a peer. Returns the updated vote count.
    pub fn record_vote_from(&mut self, voter_id: u64) -> u64 {
        if self.state() != NodeState::Candidate {
            warn!("Node {} attempted to record a vote but is not a candidate", self.id);
            return self.votes_received();
        }

        if !self.votes_from.insert(voter_id) {
            debug!("Node {} already counted the vote from Node {}", self.id, voter_id);
        }

        self.votes_received()
    }
}

// Follower-side replication
impl NodeCore {
    /// Whether our log contains `prev_log_term` at `prev_log_index`. Index 0
    /// is the empty prefix and always matches.
    fn check_log_consistency(&self, prev_log_index: u64, prev_log_term: u64) -> bool {
        if prev_log_index == 0 {
            return true;
        }
        match self.log.entry(prev_log_index) {
            Some(entry) => entry.term == prev_log_term,
            None => false,
        }
    }

    /// Handle entries received from a leader.
    /// Returns `(log_consistent, log_modified)`; on an inconsistent log
    /// nothing is changed and the caller must respond `success = false`.
    pub fn follower_append_entries(
        &mut self,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: &[LogEntry],
    ) -> (bool, bool) {
        if !self.check_log_consistency(prev_log_index, prev_log_term) {
            warn!(
                "Node {} rejected append: no entry with term {} at index {} (last index {})",
                self.id,
                prev_log_term,
                prev_log_index,
                self.log_last_index()
            );
            return (false, false);
        }

        let log_modified = self.resolve_conflicts_and_append(prev_log_index, entries);
        (true, log_modified)
    }

    /// Walk the incoming entries against the local log: skip duplicates,
    /// truncate at the first term conflict, append what remains. Re-delivery
    /// of an already-applied request finds only duplicates and is a no-op.
    /// Returns true if the log was modified.
    fn resolve_conflicts_and_append(&mut self, prev_log_index: u64, entries: &[LogEntry]) -> bool {
        let mut log_modified = false;
        let mut offset = 0;
        let mut index = prev_log_index + 1;

        while offset < entries.len() {
            match self.log.entry(index) {
                None => {
                    // Past our last entry: everything left is new.
                    self.log.append_from(index, &entries[offset..]);
                    log_modified = true;
                    break;
                }
                Some(existing) if existing.term != entries[offset].term => {
                    // Conflict: this entry and everything after it is invalid.
                    warn!(
                        "Node {} truncating log from index {} (term {} conflicts with {})",
                        self.id, index, existing.term, entries[offset].term
                    );
                    self.log.truncate_from(index);
                    log_modified = true;
                    // The next iteration finds the slot empty and appends.
                }
                Some(_) => {
                    offset += 1;
                    index += 1;
                }
            }
        }

        log_modified
    }

    /// Advance the follower's commit index toward the leader's, capped by the
    /// local log length.
    pub fn follower_update_commit_index(&mut self, leader_commit_index: u64) {
        let old_commit_index = self.commit_index();
        if leader_commit_index > old_commit_index {
            self.commit_index = leader_commit_index.min(self.log_last_index());
            if self.commit_index() > old_commit_index {
                info!(
                    "Node {} updated commit_index from {} to {} (leader_commit: {})",
                    self.id,
                    old_commit_index,
                    self.commit_index(),
                    leader_commit_index
                );
            }
        }
    }
}

// Leader-side replication
impl NodeCore {
    /// Append a new entry to the leader's own log.
    pub fn leader_append_entry(&mut self, command: String) -> bool {
        if self.state != NodeState::Leader {
            warn!("Node {} tried to append entry but is not a Leader", self.id);
            return false;
        }
        let entry = LogEntry::new(self.current_term(), command);
        let index = self.log_last_index() + 1;
        info!("Leader Node {} appending new log entry at index {}: {:?}", self.id, index, entry);
        self.log.append_from(index, std::slice::from_ref(&entry));
        true
    }

    /// Process a follower's response to an AppendEntries request that carried
    /// `entries_len` entries after `prev_log_index`.
    /// Returns `(commit_advanced, old_commit_index, new_commit_index)`.
    pub fn leader_process_append_response(
        &mut self,
        from_id: u64,
        success: bool,
        prev_log_index: u64,
        entries_len: usize,
        total_nodes: u64,
    ) -> (bool, u64, u64) {
        let old_commit_index = self.commit_index();

        if self.state != NodeState::Leader {
            warn!("Node {} tried to process append response but is not a Leader", self.id);
            return (false, old_commit_index, old_commit_index);
        }

        if success {
            let acked_index = prev_log_index + entries_len as u64;

            let current_match_index = self.match_index.entry(from_id).or_insert(0);
            if acked_index > *current_match_index {
                *current_match_index = acked_index;
                debug!(
                    "Node {} (Leader) updated match_index for {} to {}",
                    self.id, from_id, acked_index
                );
            }
            self.next_index.insert(from_id, acked_index + 1);

            self.leader_recompute_commit_index(total_nodes);
        } else {
            // Log inconsistency: back off one entry and retry on the next
            // tick. Never below 1.
            let current_next_index = self.next_index.entry(from_id).or_insert(1);
            if *current_next_index > 1 {
                *current_next_index -= 1;
            }
            info!(
                "Node {} (Leader) append rejected by {}, next_index backed off to {}",
                self.id, from_id, *current_next_index
            );
        }

        let commit_has_advanced = self.commit_index() > old_commit_index;
        (commit_has_advanced, old_commit_index, self.commit_index())
    }

    /// Advance commit_index to the highest index replicated on a majority
    /// whose entry was created in the current term. Entries from older terms
    /// are never committed by counting replicas alone.
    fn leader_recompute_commit_index(&mut self, total_nodes: u64) {
        let majority = total_nodes / 2 + 1;

        // The leader's own log counts toward the majority.
        let mut indices: Vec<u64> = self.match_index.values().copied().collect();
        indices.push(self.log_last_index());
        indices.sort_unstable();

        if indices.len() < majority as usize {
            return;
        }
        // After sorting, this position and everything above it is replicated
        // on at least `majority` nodes.
        let majority_index = indices[indices.len() - majority as usize];

        for candidate in ((self.commit_index() + 1)..=majority_index).rev() {
            match self.log.entry(candidate) {
                Some(entry) if entry.term == self.current_term() => {
                    info!(
                        "Node {} (Leader) advanced commit_index from {} to {}",
                        self.id,
                        self.commit_index(),
                        candidate
                    );
                    self.commit_index = candidate;
                    break;
                }
                Some(_) => {
                    // Older-term entry: keep looking lower, it may not be
                    // committed by replica count alone.
                }
                None => {
                    error!(
                        "Node {} (Leader) match_index points past its log at index {}",
                        self.id, candidate
                    );
                    break;
                }
            }
        }
    }
}
