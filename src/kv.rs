//! Demo key/value state machine.
//!
//! Commands are UTF-8 text in one of three shapes: `key=value`,
//! `set/key/value`, or `unset/key`. Unparsable commands are logged and
//! skipped; a replicated log may legitimately contain commands meant for a
//! different application build, and skipping deterministically keeps
//! replicas identical.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::message::LogMeta;
use crate::statemachine::{StateMachine, StateMachineSnapshot};

/// A parsed key/value command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvCommand {
    Set { key: String, value: Vec<u8> },
    Unset { key: String },
}

impl KvCommand {
    /// Parse the textual command forms.
    pub fn parse(raw: &[u8]) -> Option<KvCommand> {
        let text = std::str::from_utf8(raw).ok()?;
        if let Some((key, value)) = text.split_once('=') {
            if !key.is_empty() && !key.contains('/') {
                return Some(KvCommand::Set {
                    key: key.to_string(),
                    value: value.as_bytes().to_vec(),
                });
            }
        }
        let mut parts = text.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("set"), Some(key), Some(value)) if !key.is_empty() => Some(KvCommand::Set {
                key: key.to_string(),
                value: value.as_bytes().to_vec(),
            }),
            (Some("unset"), Some(key), None) if !key.is_empty() => Some(KvCommand::Unset {
                key: key.to_string(),
            }),
            _ => None,
        }
    }
}

#[derive(Default, Serialize, Deserialize)]
struct KvInner {
    index: u64,
    term: u64,
    states: BTreeMap<String, Vec<u8>>,
}

/// Key/value store fed by committed log commands.
pub struct KvStateMachine {
    inner: RwLock<KvInner>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(KvInner::default()),
        }
    }

    /// Value stored under `key`, if any.
    pub fn value(&self, key: &str) -> Option<Vec<u8>> {
        self.inner
            .read()
            .expect("kv lock poisoned")
            .states
            .get(key)
            .cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("kv lock poisoned")
            .states
            .keys()
            .cloned()
            .collect()
    }

    pub fn key_values(&self) -> BTreeMap<String, Vec<u8>> {
        self.inner.read().expect("kv lock poisoned").states.clone()
    }

    /// Position of the most recently applied command.
    pub fn applied(&self) -> (u64, u64) {
        let inner = self.inner.read().expect("kv lock poisoned");
        (inner.index, inner.term)
    }
}

impl Default for KvStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&self, meta: LogMeta, command: &[u8]) {
        let mut inner = self.inner.write().expect("kv lock poisoned");
        match KvCommand::parse(command) {
            Some(KvCommand::Set { key, value }) => {
                inner.states.insert(key, value);
            }
            Some(KvCommand::Unset { key }) => {
                inner.states.remove(&key);
            }
            None => {
                tracing::warn!(index = meta.index, "skipping unparsable command");
            }
        }
        inner.index = meta.index;
        inner.term = meta.term;
    }

    fn snapshot(&self) -> anyhow::Result<Box<dyn StateMachineSnapshot>> {
        let inner = self.inner.read().expect("kv lock poisoned");
        Ok(Box::new(KvSnapshot {
            data: KvInner {
                index: inner.index,
                term: inner.term,
                states: inner.states.clone(),
            },
        }))
    }

    fn restore(&self, mut reader: Box<dyn Read + Send>) -> anyhow::Result<()> {
        let mut encoded = Vec::new();
        reader.read_to_end(&mut encoded)?;
        let data: KvInner = serde_json::from_slice(&encoded)?;
        *self.inner.write().expect("kv lock poisoned") = data;
        Ok(())
    }
}

struct KvSnapshot {
    data: KvInner,
}

impl StateMachineSnapshot for KvSnapshot {
    fn write(&self, sink: &mut dyn std::io::Write) -> anyhow::Result<()> {
        serde_json::to_writer(sink, &self.data)?;
        Ok(())
    }
}
