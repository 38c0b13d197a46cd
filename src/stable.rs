//! Stable key/value store for persisted server state.
//!
//! Any stable backend must implement [`StableStore`]. Writes are durable
//! before they return, so a value observable in an RPC reply has already
//! been persisted. [`StableState`] is the typed wrapper the core uses; it
//! owns the key names.

use std::sync::Arc;

use crate::state::VoteSummary;

/// Key holding the current term.
pub const KEY_CURRENT_TERM: &str = "currentTerm";
/// Key holding the term of the most recent granted vote.
pub const KEY_LAST_VOTE_TERM: &str = "lastVoteTerm";
/// Key holding the candidate of the most recent granted vote.
pub const KEY_LAST_VOTE_CANDIDATE: &str = "lastVoteCandidate";
/// Marker set once the server has bootstrapped its initial configuration.
pub const KEY_BOOTSTRAP: &str = "bootstrap";

/// Durable key-addressed store contract.
///
/// Implementations must make `set` durable (fsync or equivalent) before
/// returning. Absent keys read as `None`.
pub trait StableStore: Send + Sync + 'static {
    fn set(&self, key: &str, value: &[u8]) -> anyhow::Result<()>;
    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
}

/// Typed view over a [`StableStore`], owning the persisted-state keys.
pub struct StableState {
    store: Arc<dyn StableStore>,
}

impl StableState {
    pub fn new(store: Arc<dyn StableStore>) -> Self {
        Self { store }
    }

    fn get_u64(&self, key: &str) -> anyhow::Result<u64> {
        match self.store.get(key)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("stable key {key} holds a malformed u64"))?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    fn set_u64(&self, key: &str, value: u64) -> anyhow::Result<()> {
        self.store.set(key, &value.to_be_bytes())
    }

    pub fn current_term(&self) -> anyhow::Result<u64> {
        self.get_u64(KEY_CURRENT_TERM)
    }

    pub fn set_current_term(&self, term: u64) -> anyhow::Result<()> {
        self.set_u64(KEY_CURRENT_TERM, term)
    }

    pub fn last_vote(&self) -> anyhow::Result<VoteSummary> {
        let term = self.get_u64(KEY_LAST_VOTE_TERM)?;
        let candidate = match self.store.get(KEY_LAST_VOTE_CANDIDATE)? {
            Some(bytes) => String::from_utf8(bytes)
                .map_err(|_| anyhow::anyhow!("stable vote candidate is not valid UTF-8"))?,
            None => String::new(),
        };
        Ok(VoteSummary { term, candidate })
    }

    /// Persist the (term, candidate) vote pair. The term is written last so
    /// a torn write never yields a vote attributed to a newer term.
    pub fn set_last_vote(&self, term: u64, candidate: &str) -> anyhow::Result<()> {
        self.store.set(KEY_LAST_VOTE_CANDIDATE, candidate.as_bytes())?;
        self.set_u64(KEY_LAST_VOTE_TERM, term)
    }

    pub fn bootstrapped(&self) -> anyhow::Result<bool> {
        Ok(self.store.get(KEY_BOOTSTRAP)?.is_some())
    }

    pub fn set_bootstrapped(&self) -> anyhow::Result<()> {
        self.store.set(KEY_BOOTSTRAP, &[1])
    }
}
