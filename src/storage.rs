use std::{
    fmt::Debug,
    fs::{self, File},
    io::{Read, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};

use crate::consensus::LogEntry;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The durable state a node must recover after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: Vec<LogEntry>,
}

/// Durable storage for a node's term, vote, and log.
///
/// `persist` must complete before any RPC response that depends on the
/// written fields is sent; a node never acknowledges a vote or log write it
/// failed to record.
pub trait Persistence: Send + Sync + Debug {
    fn persist(
        &mut self,
        current_term: u64,
        voted_for: Option<u64>,
        log: &[LogEntry],
    ) -> Result<(), PersistenceError>;

    fn load(&self) -> Result<PersistedState, PersistenceError>;
}

/// In-memory persistence for the simulation and tests. Handles share one
/// underlying state, so a test can keep a clone and inspect what a node
/// recorded.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPersistence {
    state: Arc<Mutex<PersistedState>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the last persisted state.
    pub fn snapshot(&self) -> PersistedState {
        self.state.lock().expect("persistence lock poisoned").clone()
    }
}

impl Persistence for InMemoryPersistence {
    fn persist(
        &mut self,
        current_term: u64,
        voted_for: Option<u64>,
        log: &[LogEntry],
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().expect("persistence lock poisoned");
        state.current_term = current_term;
        state.voted_for = voted_for;
        state.log = log.to_vec();
        Ok(())
    }

    fn load(&self) -> Result<PersistedState, PersistenceError> {
        Ok(self.snapshot())
    }
}

/// File-backed persistence: one JSON file per node, replaced atomically by
/// writing a temp file, syncing it, and renaming over the live file.
#[derive(Debug)]
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    /// Create a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }
}

impl Persistence for FilePersistence {
    fn persist(
        &mut self,
        current_term: u64,
        voted_for: Option<u64>,
        log: &[LogEntry],
    ) -> Result<(), PersistenceError> {
        let state =
            PersistedState { current_term, voted_for, log: log.to_vec() };
        let json = serde_json::to_string_pretty(&state)?;

        let temp_path = self.dir.join("state.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, self.state_path())?;

        Ok(())
    }

    fn load(&self) -> Result<PersistedState, PersistenceError> {
        let path = self.state_path();
        if !path.exists() {
            // A node that has never persisted starts at term 0.
            return Ok(PersistedState::default());
        }

        let mut contents = String::new();
        File::open(&path)?.read_to_string(&mut contents)?;
        Ok(serde_json::from_str(&contents)?)
    }
}
