//! SQLite-backed log and stable stores.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite library
//! is required. One database file holds the replicated log, the stable
//! key/value state, and the compaction origin; all trait methods are thin
//! wrappers around synchronous rusqlite calls executed under a `Mutex`.
//!
//! `synchronous = FULL` keeps stable writes durable before they return,
//! which the vote and term persistence rules rely on.

use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::log::LogProvider;
use crate::message::{LogBody, LogEntry, LogKind};
use crate::stable::StableStore;

/// Log, stable, and origin state in a single SQLite database file.
pub struct SqliteStore {
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_db()?;
        Ok(store)
    }

    /// Create the required tables if they do not already exist. Idempotent,
    /// safe to call on every startup.
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;

            -- Replicated log entries
            CREATE TABLE IF NOT EXISTS raft_log (
                idx  INTEGER PRIMARY KEY,
                term INTEGER NOT NULL,
                kind INTEGER NOT NULL,
                data BLOB NOT NULL
            );

            -- Stable key/value state (term, vote, bootstrap marker)
            CREATE TABLE IF NOT EXISTS raft_stable (
                key   TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );

            -- Compaction origin: position of the entry just before the
            -- first retained one
            CREATE TABLE IF NOT EXISTS raft_origin (
                id   INTEGER PRIMARY KEY CHECK (id = 1),
                idx  INTEGER NOT NULL,
                term INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO raft_origin (id, idx, term) VALUES (1, 0, 0);
            ",
        )?;
        Ok(())
    }

    fn origin(conn: &Connection) -> anyhow::Result<(u64, u64)> {
        let (index, term) = conn.query_row(
            "SELECT idx, term FROM raft_origin WHERE id = 1",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        Ok((index as u64, term as u64))
    }

    fn stored_count(conn: &Connection) -> anyhow::Result<u64> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM raft_log", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEntry> {
        let index: i64 = row.get(0)?;
        let term: i64 = row.get(1)?;
        let kind: i64 = row.get(2)?;
        let data: Vec<u8> = row.get(3)?;
        Ok(LogEntry {
            index: index as u64,
            term: term as u64,
            body: LogBody {
                kind: if kind == 1 {
                    LogKind::Configuration
                } else {
                    LogKind::Command
                },
                data,
            },
        })
    }

    fn kind_to_i64(kind: LogKind) -> i64 {
        match kind {
            LogKind::Command => 0,
            LogKind::Configuration => 1,
        }
    }
}

impl LogProvider for SqliteStore {
    fn first_index(&self) -> anyhow::Result<u64> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let (origin_index, _) = Self::origin(&conn)?;
        if origin_index == 0 && Self::stored_count(&conn)? == 0 {
            Ok(0)
        } else {
            Ok(origin_index + 1)
        }
    }

    fn last_index(&self) -> anyhow::Result<u64> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let (origin_index, _) = Self::origin(&conn)?;
        Ok(origin_index + Self::stored_count(&conn)?)
    }

    fn entry(&self, index: u64) -> anyhow::Result<Option<LogEntry>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let entry = conn
            .query_row(
                "SELECT idx, term, kind, data FROM raft_log WHERE idx = ?1",
                params![index as i64],
                Self::row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    fn entries(&self, from: u64, to: u64) -> anyhow::Result<Vec<LogEntry>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut statement = conn.prepare(
            "SELECT idx, term, kind, data FROM raft_log WHERE idx >= ?1 AND idx <= ?2 ORDER BY idx",
        )?;
        let rows = statement.query_map(params![from as i64, to as i64], Self::row_to_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn last_entry(&self) -> anyhow::Result<Option<LogEntry>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let entry = conn
            .query_row(
                "SELECT idx, term, kind, data FROM raft_log ORDER BY idx DESC LIMIT 1",
                [],
                Self::row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    fn append(&self, entries: Vec<LogEntry>) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction()?;
        {
            let (origin_index, _) = Self::origin(&tx)?;
            let mut expected = origin_index + Self::stored_count(&tx)? + 1;
            let mut statement = tx.prepare(
                "INSERT INTO raft_log (idx, term, kind, data) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for entry in &entries {
                if entry.index != expected {
                    anyhow::bail!(
                        "non-contiguous append: index {} where {expected} was expected",
                        entry.index
                    );
                }
                statement.execute(params![
                    entry.index as i64,
                    entry.term as i64,
                    Self::kind_to_i64(entry.body.kind),
                    entry.body.data,
                ])?;
                expected += 1;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn trim_prefix(&self, up_to: u64) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction()?;
        let (origin_index, _) = Self::origin(&tx)?;
        if up_to > origin_index {
            let term: Option<i64> = tx
                .query_row(
                    "SELECT term FROM raft_log WHERE idx = ?1",
                    params![up_to as i64],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(term) = term {
                tx.execute("DELETE FROM raft_log WHERE idx <= ?1", params![up_to as i64])?;
                tx.execute(
                    "UPDATE raft_origin SET idx = ?1, term = ?2 WHERE id = 1",
                    params![up_to as i64, term],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn trim_suffix(&self, from: u64) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute("DELETE FROM raft_log WHERE idx >= ?1", params![from as i64])?;
        Ok(())
    }

    fn reset(&self, index: u64, term: u64) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM raft_log", [])?;
        tx.execute(
            "UPDATE raft_origin SET idx = ?1, term = ?2 WHERE id = 1",
            params![index as i64, term as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn term(&self, index: u64) -> anyhow::Result<Option<u64>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let (origin_index, origin_term) = Self::origin(&conn)?;
        if index > 0 && index == origin_index {
            return Ok(Some(origin_term));
        }
        let term: Option<i64> = conn
            .query_row(
                "SELECT term FROM raft_log WHERE idx = ?1",
                params![index as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(term.map(|t| t as u64))
    }

    fn last_term_index(&self) -> anyhow::Result<(u64, u64)> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let last: Option<(i64, i64)> = conn
            .query_row(
                "SELECT term, idx FROM raft_log ORDER BY idx DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match last {
            Some((term, index)) => Ok((term as u64, index as u64)),
            None => {
                let (origin_index, origin_term) = Self::origin(&conn)?;
                Ok((origin_term, origin_index))
            }
        }
    }
}

impl StableStore for SqliteStore {
    fn set(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO raft_stable (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let value = conn
            .query_row(
                "SELECT value FROM raft_stable WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            body: LogBody::command(format!("cmd-{index}").into_bytes()),
        }
    }

    #[test]
    fn log_roundtrip_in_memory() {
        let store = SqliteStore::new(":memory:").unwrap();
        store.append(vec![entry(1, 1), entry(2, 2)]).unwrap();
        assert_eq!(store.first_index().unwrap(), 1);
        assert_eq!(store.last_index().unwrap(), 2);
        assert_eq!(store.entry(2).unwrap().unwrap().term, 2);
        assert_eq!(store.last_term_index().unwrap(), (2, 2));
        assert_eq!(store.entries(1, 2).unwrap().len(), 2);
    }

    #[test]
    fn rejects_non_contiguous_appends() {
        let store = SqliteStore::new(":memory:").unwrap();
        store.append(vec![entry(1, 1)]).unwrap();
        assert!(store.append(vec![entry(5, 1)]).is_err());
        // The failed transaction must not have stored anything.
        assert_eq!(store.last_index().unwrap(), 1);
    }

    #[test]
    fn trim_prefix_keeps_the_boundary_term() {
        let store = SqliteStore::new(":memory:").unwrap();
        store
            .append(vec![entry(1, 1), entry(2, 3), entry(3, 3)])
            .unwrap();
        store.trim_prefix(2).unwrap();
        assert_eq!(store.first_index().unwrap(), 3);
        assert_eq!(store.term(2).unwrap(), Some(3));
        assert!(store.entry(2).unwrap().is_none());
    }

    #[test]
    fn reset_repositions_after_snapshot() {
        let store = SqliteStore::new(":memory:").unwrap();
        store.append(vec![entry(1, 1), entry(2, 1)]).unwrap();
        store.reset(50, 7).unwrap();
        assert_eq!(store.first_index().unwrap(), 51);
        assert_eq!(store.last_index().unwrap(), 50);
        assert_eq!(store.last_term_index().unwrap(), (7, 50));
        store.append(vec![entry(51, 8)]).unwrap();
        assert_eq!(store.entry(51).unwrap().unwrap().term, 8);
    }

    #[test]
    fn stable_values_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raft.db");
        let path = path.to_str().unwrap();

        {
            let store = SqliteStore::new(path).unwrap();
            store.set("currentTerm", &7u64.to_be_bytes()).unwrap();
            store.append(vec![entry(1, 7)]).unwrap();
        }

        let store = SqliteStore::new(path).unwrap();
        assert_eq!(
            store.get("currentTerm").unwrap().unwrap(),
            7u64.to_be_bytes().to_vec()
        );
        assert_eq!(store.last_index().unwrap(), 1);
        assert!(store.get("missing").unwrap().is_none());
    }
}
