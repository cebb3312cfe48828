use serde::{Deserialize, Serialize};

/// A single command entry in the replicated log, tagged with the term in
/// which it was created. Entries are immutable; their index is positional
/// (1-based) and not stored in the entry itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub command: String,
}

impl LogEntry {
    pub fn new(term: u64, command: String) -> Self {
        Self { term, command }
    }
}
