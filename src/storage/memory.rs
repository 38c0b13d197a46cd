//! In-memory providers for tests, demos, and single-process clusters.
//!
//! State is held in plain collections behind mutexes; nothing survives a
//! restart. The log keeps a compaction origin `(index, term)` so trimmed
//! and restored logs answer term queries at the snapshot boundary.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::sync::{Arc, Mutex};

use crate::errors::generate_request_id;
use crate::log::LogProvider;
use crate::membership::Configuration;
use crate::message::LogEntry;
use crate::snapshot::{SnapshotMeta, SnapshotProvider, SnapshotSink};
use crate::stable::StableStore;

// -- Log ----------------------------------------------------------------------

/// In-memory [`LogProvider`].
pub struct MemoryLogProvider {
    inner: Mutex<LogInner>,
}

struct LogInner {
    /// Position of the entry just before the first retained one; (0, 0) on
    /// a fresh log.
    origin_index: u64,
    origin_term: u64,
    /// Contiguous entries starting at `origin_index + 1`.
    entries: Vec<LogEntry>,
}

impl MemoryLogProvider {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LogInner {
                origin_index: 0,
                origin_term: 0,
                entries: Vec::new(),
            }),
        }
    }
}

impl Default for MemoryLogProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LogInner {
    fn last_index(&self) -> u64 {
        self.origin_index + self.entries.len() as u64
    }

    fn slot(&self, index: u64) -> Option<usize> {
        if index <= self.origin_index || index > self.last_index() {
            return None;
        }
        Some((index - self.origin_index - 1) as usize)
    }
}

impl LogProvider for MemoryLogProvider {
    fn first_index(&self) -> anyhow::Result<u64> {
        let inner = self.inner.lock().expect("log lock poisoned");
        if inner.origin_index == 0 && inner.entries.is_empty() {
            Ok(0)
        } else {
            Ok(inner.origin_index + 1)
        }
    }

    fn last_index(&self) -> anyhow::Result<u64> {
        Ok(self.inner.lock().expect("log lock poisoned").last_index())
    }

    fn entry(&self, index: u64) -> anyhow::Result<Option<LogEntry>> {
        let inner = self.inner.lock().expect("log lock poisoned");
        Ok(inner.slot(index).map(|slot| inner.entries[slot].clone()))
    }

    fn entries(&self, from: u64, to: u64) -> anyhow::Result<Vec<LogEntry>> {
        let inner = self.inner.lock().expect("log lock poisoned");
        let mut out = Vec::new();
        for index in from..=to {
            if let Some(slot) = inner.slot(index) {
                out.push(inner.entries[slot].clone());
            }
        }
        Ok(out)
    }

    fn last_entry(&self) -> anyhow::Result<Option<LogEntry>> {
        Ok(self
            .inner
            .lock()
            .expect("log lock poisoned")
            .entries
            .last()
            .cloned())
    }

    fn append(&self, entries: Vec<LogEntry>) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("log lock poisoned");
        for entry in entries {
            let expected = inner.last_index() + 1;
            if entry.index != expected {
                anyhow::bail!(
                    "non-contiguous append: index {} where {expected} was expected",
                    entry.index
                );
            }
            inner.entries.push(entry);
        }
        Ok(())
    }

    fn trim_prefix(&self, up_to: u64) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("log lock poisoned");
        if up_to <= inner.origin_index {
            return Ok(());
        }
        let up_to = up_to.min(inner.last_index());
        let slot = match inner.slot(up_to) {
            Some(slot) => slot,
            None => return Ok(()),
        };
        let origin_term = inner.entries[slot].term;
        inner.entries.drain(..=slot);
        inner.origin_index = up_to;
        inner.origin_term = origin_term;
        Ok(())
    }

    fn trim_suffix(&self, from: u64) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("log lock poisoned");
        inner.entries.retain(|entry| entry.index < from);
        Ok(())
    }

    fn reset(&self, index: u64, term: u64) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("log lock poisoned");
        inner.entries.clear();
        inner.origin_index = index;
        inner.origin_term = term;
        Ok(())
    }

    fn term(&self, index: u64) -> anyhow::Result<Option<u64>> {
        let inner = self.inner.lock().expect("log lock poisoned");
        if index > 0 && index == inner.origin_index {
            return Ok(Some(inner.origin_term));
        }
        Ok(inner.slot(index).map(|slot| inner.entries[slot].term))
    }

    fn last_term_index(&self) -> anyhow::Result<(u64, u64)> {
        let inner = self.inner.lock().expect("log lock poisoned");
        Ok(inner
            .entries
            .last()
            .map(|entry| (entry.term, entry.index))
            .unwrap_or((inner.origin_term, inner.origin_index)))
    }
}

// -- Stable -------------------------------------------------------------------

/// In-memory [`StableStore`].
pub struct MemoryStableStore {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStableStore {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StableStore for MemoryStableStore {
    fn set(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.values
            .lock()
            .expect("stable lock poisoned")
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self
            .values
            .lock()
            .expect("stable lock poisoned")
            .get(key)
            .cloned())
    }
}

// -- Snapshots ----------------------------------------------------------------

/// In-memory [`SnapshotProvider`].
pub struct MemorySnapshotStore {
    inner: Arc<Mutex<Vec<(SnapshotMeta, Vec<u8>)>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Default for MemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotProvider for MemorySnapshotStore {
    fn create(
        &self,
        index: u64,
        term: u64,
        configuration: &Configuration,
    ) -> anyhow::Result<Box<dyn SnapshotSink>> {
        Ok(Box::new(MemorySnapshotSink {
            id: format!("{index}-{term}-{}", generate_request_id()),
            index,
            term,
            configuration: configuration.clone(),
            buffer: Vec::new(),
            registry: Arc::clone(&self.inner),
        }))
    }

    fn latest(&self) -> anyhow::Result<Option<SnapshotMeta>> {
        let inner = self.inner.lock().expect("snapshot lock poisoned");
        Ok(inner
            .iter()
            .max_by_key(|(meta, _)| meta.index)
            .map(|(meta, _)| meta.clone()))
    }

    fn open(&self, id: &str) -> anyhow::Result<(SnapshotMeta, Box<dyn Read + Send>)> {
        let inner = self.inner.lock().expect("snapshot lock poisoned");
        let (meta, data) = inner
            .iter()
            .find(|(meta, _)| meta.id == id)
            .ok_or_else(|| anyhow::anyhow!("unknown snapshot {id}"))?;
        Ok((meta.clone(), Box::new(Cursor::new(data.clone()))))
    }
}

struct MemorySnapshotSink {
    id: String,
    index: u64,
    term: u64,
    configuration: Configuration,
    buffer: Vec<u8>,
    registry: Arc<Mutex<Vec<(SnapshotMeta, Vec<u8>)>>>,
}

impl Write for MemorySnapshotSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SnapshotSink for MemorySnapshotSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn finalize(self: Box<Self>) -> anyhow::Result<SnapshotMeta> {
        let meta = SnapshotMeta {
            id: self.id,
            index: self.index,
            term: self.term,
            configuration: self.configuration,
            size: self.buffer.len() as u64,
        };
        self.registry
            .lock()
            .expect("snapshot lock poisoned")
            .push((meta.clone(), self.buffer));
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{Membership, PeerSet};
    use crate::message::{LogBody, Peer};

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            body: LogBody::command(vec![index as u8]),
        }
    }

    fn configuration() -> Configuration {
        Configuration::new(
            Membership::Stable(PeerSet::new(vec![Peer::new("s1", "e1")])),
            1,
        )
    }

    #[test]
    fn fresh_log_reports_zero_range() {
        let log = MemoryLogProvider::new();
        assert_eq!(log.first_index().unwrap(), 0);
        assert_eq!(log.last_index().unwrap(), 0);
        assert!(log.entry(1).unwrap().is_none());
    }

    #[test]
    fn append_and_read_back() {
        let log = MemoryLogProvider::new();
        log.append(vec![entry(1, 1), entry(2, 1), entry(3, 2)]).unwrap();
        assert_eq!(log.first_index().unwrap(), 1);
        assert_eq!(log.last_index().unwrap(), 3);
        assert_eq!(log.entry(2).unwrap().unwrap().term, 1);
        assert_eq!(log.entries(2, 3).unwrap().len(), 2);
        assert_eq!(log.last_term_index().unwrap(), (2, 3));
    }

    #[test]
    fn non_contiguous_append_is_rejected() {
        let log = MemoryLogProvider::new();
        log.append(vec![entry(1, 1)]).unwrap();
        assert!(log.append(vec![entry(3, 1)]).is_err());
    }

    #[test]
    fn trim_suffix_drops_conflicts() {
        let log = MemoryLogProvider::new();
        log.append(vec![entry(1, 1), entry(2, 1), entry(3, 1)]).unwrap();
        log.trim_suffix(2).unwrap();
        assert_eq!(log.last_index().unwrap(), 1);
        assert!(log.entry(2).unwrap().is_none());
    }

    #[test]
    fn trim_prefix_moves_the_origin() {
        let log = MemoryLogProvider::new();
        log.append(vec![entry(1, 1), entry(2, 2), entry(3, 2)]).unwrap();
        log.trim_prefix(2).unwrap();
        assert_eq!(log.first_index().unwrap(), 3);
        assert_eq!(log.last_index().unwrap(), 3);
        assert!(log.entry(2).unwrap().is_none());
        // The origin still answers term queries at the boundary.
        assert_eq!(log.term(2).unwrap(), Some(2));
    }

    #[test]
    fn reset_positions_the_log_after_a_snapshot() {
        let log = MemoryLogProvider::new();
        log.append(vec![entry(1, 1)]).unwrap();
        log.reset(99, 4).unwrap();
        assert_eq!(log.first_index().unwrap(), 100);
        assert_eq!(log.last_index().unwrap(), 99);
        assert_eq!(log.last_term_index().unwrap(), (4, 99));
        log.append(vec![entry(100, 5)]).unwrap();
        assert_eq!(log.entry(100).unwrap().unwrap().term, 5);
    }

    #[test]
    fn snapshot_store_registers_on_finalize_only() {
        let store = MemorySnapshotStore::new();
        assert!(store.latest().unwrap().is_none());

        let mut sink = store.create(5, 2, &configuration()).unwrap();
        sink.write_all(b"payload").unwrap();
        // Not yet registered.
        assert!(store.latest().unwrap().is_none());

        let meta = sink.finalize().unwrap();
        assert_eq!(meta.index, 5);
        assert_eq!(meta.size, 7);
        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.id, meta.id);

        let (opened, mut reader) = store.open(&meta.id).unwrap();
        assert_eq!(opened.term, 2);
        let mut payload = Vec::new();
        reader.read_to_end(&mut payload).unwrap();
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn latest_prefers_the_highest_index() {
        let store = MemorySnapshotStore::new();
        store.create(3, 1, &configuration()).unwrap().finalize().unwrap();
        store.create(9, 2, &configuration()).unwrap().finalize().unwrap();
        assert_eq!(store.latest().unwrap().unwrap().index, 9);
    }
}
