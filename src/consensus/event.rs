#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusEvent {
    /// A new leader has been elected.
    LeaderElected { leader_id: u64, term: u64 },
    /// A committed entry has been applied to the state machine.
    EntryCommitted { index: u64, entry: String },
}
