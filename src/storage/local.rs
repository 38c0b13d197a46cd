//! Filesystem snapshot store.
//!
//! Each snapshot lives in its own directory under the root: `meta.json`
//! beside `payload.bin`. Writes go to a staging directory and are renamed
//! into place on finalize, so a crash mid-write never leaves a registered
//! half-snapshot. Payloads carry a SHA-256 hash that is verified on open.

use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::generate_request_id;
use crate::membership::Configuration;
use crate::snapshot::{SnapshotMeta, SnapshotProvider, SnapshotSink};

const META_FILE: &str = "meta.json";
const PAYLOAD_FILE: &str = "payload.bin";

/// On-disk metadata record.
#[derive(Serialize, Deserialize)]
struct MetaFile {
    id: String,
    index: u64,
    term: u64,
    configuration: Configuration,
    size: u64,
    sha256: String,
}

/// Stores snapshots as directories under a root path.
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    /// Create a store rooted at `root`, creating the directory (and the
    /// staging area) if needed.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(".tmp"))?;
        Ok(Self { root })
    }

    fn meta_of(&self, id: &str) -> anyhow::Result<MetaFile> {
        let contents = fs::read_to_string(self.root.join(id).join(META_FILE))?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn list_ids(&self) -> anyhow::Result<Vec<String>> {
        let mut ids = Vec::new();
        for dir_entry in fs::read_dir(&self.root)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name().to_string_lossy().to_string();
            if name == ".tmp" || !dir_entry.file_type()?.is_dir() {
                continue;
            }
            if dir_entry.path().join(META_FILE).exists() {
                ids.push(name);
            }
        }
        Ok(ids)
    }
}

impl From<MetaFile> for SnapshotMeta {
    fn from(meta: MetaFile) -> Self {
        SnapshotMeta {
            id: meta.id,
            index: meta.index,
            term: meta.term,
            configuration: meta.configuration,
            size: meta.size,
        }
    }
}

impl SnapshotProvider for FileSnapshotStore {
    fn create(
        &self,
        index: u64,
        term: u64,
        configuration: &Configuration,
    ) -> anyhow::Result<Box<dyn SnapshotSink>> {
        let id = format!("{index}-{term}-{}", generate_request_id());
        let staging = self.root.join(".tmp").join(&id);
        fs::create_dir_all(&staging)?;
        let payload = File::create(staging.join(PAYLOAD_FILE))?;
        Ok(Box::new(FileSnapshotSink {
            id,
            index,
            term,
            configuration: configuration.clone(),
            staging,
            root: self.root.clone(),
            payload,
            hasher: Sha256::new(),
            size: 0,
        }))
    }

    fn latest(&self) -> anyhow::Result<Option<SnapshotMeta>> {
        let mut best: Option<MetaFile> = None;
        for id in self.list_ids()? {
            match self.meta_of(&id) {
                Ok(meta) => {
                    if best.as_ref().map(|b| meta.index > b.index).unwrap_or(true) {
                        best = Some(meta);
                    }
                }
                Err(err) => {
                    tracing::warn!(%id, error = %err, "skipping unreadable snapshot");
                }
            }
        }
        Ok(best.map(SnapshotMeta::from))
    }

    fn open(&self, id: &str) -> anyhow::Result<(SnapshotMeta, Box<dyn Read + Send>)> {
        let meta = self.meta_of(id)?;
        let payload_path = self.root.join(id).join(PAYLOAD_FILE);

        // Verify integrity before handing out a reader.
        let mut hasher = Sha256::new();
        let mut verify = BufReader::new(File::open(&payload_path)?);
        let mut chunk = [0u8; 8192];
        loop {
            let n = verify.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            hasher.update(&chunk[..n]);
        }
        let digest = hex::encode(hasher.finalize());
        if digest != meta.sha256 {
            anyhow::bail!("snapshot {id} payload hash mismatch");
        }

        let reader = BufReader::new(File::open(&payload_path)?);
        Ok((SnapshotMeta::from(meta), Box::new(reader)))
    }
}

struct FileSnapshotSink {
    id: String,
    index: u64,
    term: u64,
    configuration: Configuration,
    staging: PathBuf,
    root: PathBuf,
    payload: File,
    hasher: Sha256,
    size: u64,
}

impl Write for FileSnapshotSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.payload.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.payload.flush()
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn finalize(mut self: Box<Self>) -> anyhow::Result<SnapshotMeta> {
        self.payload.flush()?;
        self.payload.sync_all()?;

        let meta = MetaFile {
            id: self.id.clone(),
            index: self.index,
            term: self.term,
            configuration: self.configuration.clone(),
            size: self.size,
            sha256: hex::encode(self.hasher.clone().finalize()),
        };
        let mut meta_file = File::create(self.staging.join(META_FILE))?;
        meta_file.write_all(serde_json::to_string_pretty(&meta)?.as_bytes())?;
        meta_file.sync_all()?;

        // Registration is the rename into the root.
        fs::rename(&self.staging, self.root.join(&self.id))?;
        Ok(SnapshotMeta::from(meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{Membership, PeerSet};
    use crate::message::Peer;
    use tempfile::tempdir;

    fn configuration() -> Configuration {
        Configuration::new(
            Membership::Stable(PeerSet::new(vec![Peer::new("s1", "e1")])),
            3,
        )
    }

    #[test]
    fn write_finalize_open_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path()).unwrap();

        let mut sink = store.create(10, 2, &configuration()).unwrap();
        sink.write_all(b"snapshot payload").unwrap();
        let meta = sink.finalize().unwrap();
        assert_eq!(meta.index, 10);
        assert_eq!(meta.size, 16);

        let (opened, mut reader) = store.open(&meta.id).unwrap();
        assert_eq!(opened.term, 2);
        assert_eq!(opened.configuration, configuration());
        let mut payload = Vec::new();
        reader.read_to_end(&mut payload).unwrap();
        assert_eq!(payload, b"snapshot payload");
    }

    #[test]
    fn unfinalized_snapshots_are_not_registered() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path()).unwrap();
        let mut sink = store.create(5, 1, &configuration()).unwrap();
        sink.write_all(b"partial").unwrap();
        drop(sink);
        assert!(store.latest().unwrap().is_none());
    }

    #[test]
    fn latest_survives_reopen_and_prefers_highest_index() {
        let dir = tempdir().unwrap();
        {
            let store = FileSnapshotStore::new(dir.path()).unwrap();
            store.create(4, 1, &configuration()).unwrap().finalize().unwrap();
            store.create(9, 2, &configuration()).unwrap().finalize().unwrap();
        }
        let store = FileSnapshotStore::new(dir.path()).unwrap();
        assert_eq!(store.latest().unwrap().unwrap().index, 9);
    }

    #[test]
    fn corrupted_payload_is_rejected_on_open() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path()).unwrap();
        let mut sink = store.create(7, 1, &configuration()).unwrap();
        sink.write_all(b"good bytes").unwrap();
        let meta = sink.finalize().unwrap();

        fs::write(dir.path().join(&meta.id).join(PAYLOAD_FILE), b"bad bytes").unwrap();
        let err = match store.open(&meta.id) {
            Ok(_) => panic!("expected open to fail"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("hash mismatch"));
    }
}
