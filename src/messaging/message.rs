use crate::consensus::LogEntry;

/// A message in the network or a command to a node.
///
/// The RPC surface is a closed set of tagged request/response variants; the
/// command variants inject client/driver actions through the same inbound
/// queue so a node only ever reacts to one message at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Request a vote from other nodes during an election.
    VoteRequest { term: u64, candidate_id: u64, last_log_index: u64, last_log_term: u64 },
    /// Response to a vote request.
    VoteResponse { term: u64, vote_granted: bool, from_id: u64 },
    /// Replicate log entries to a follower; empty `entries` is a heartbeat.
    AppendEntries {
        term: u64,
        leader_id: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    /// Response to an append request.
    AppendResponse { term: u64, success: bool, from_id: u64 },

    /// Command to start an election.
    StartElectionCmd,
    /// Command to append a new entry to the leader's log.
    StartAppendEntriesCmd { command: String },
}
