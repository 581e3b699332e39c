//! Durable table of provisioned containers.
//!
//! Only records that have not reached `Deleted` live here; deleting a
//! container removes its row. State changes go exclusively through
//! [`RecordStore::compare_and_set_state`], which is what arbitrates between a
//! manual delete and an expiry firing for the same id.

use crate::error::{Error, Result};
use crate::record::{ContainerRecord, ContainerState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub trait RecordStore: Send + Sync {
    /// Persist a new record. Fails if the id is already present.
    fn insert(&self, record: &ContainerRecord) -> Result<()>;

    fn get(&self, id: &str) -> Result<Option<ContainerRecord>>;

    /// All stored records, oldest first.
    fn list_active(&self) -> Result<Vec<ContainerRecord>>;

    /// Atomically move `id` from `expected` to `new`. Returns `false` when the
    /// record is absent or no longer in `expected`.
    fn compare_and_set_state(
        &self,
        id: &str,
        expected: ContainerState,
        new: ContainerState,
    ) -> Result<bool>;

    /// Remove the record. Returns whether a row was deleted.
    fn delete(&self, id: &str) -> Result<bool>;
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS containers (
        id TEXT PRIMARY KEY,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        ports TEXT NOT NULL,
        state TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_containers_expires_at ON containers(expires_at);
";

type RawRow = (String, i64, i64, String, String);

pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Store(format!("create {}: {}", parent.display(), e)))?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        let store = Self::bootstrap(conn)?;
        info!(path = %path.display(), "Opened container store");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn decode((id, created_at, expires_at, ports, state): RawRow) -> Result<ContainerRecord> {
        let created_at = from_millis(created_at)?;
        let expires_at = from_millis(expires_at)?;
        let ports: Vec<u16> = serde_json::from_str(&ports)
            .map_err(|e| Error::Store(format!("record {}: bad ports: {}", id, e)))?;
        let state = state
            .parse::<ContainerState>()
            .map_err(|e| Error::Store(format!("record {}: {}", id, e)))?;
        Ok(ContainerRecord {
            id,
            created_at,
            expires_at,
            ports,
            state,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Store(format!("timestamp {} out of range", ms)))
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

impl RecordStore for SqliteRecordStore {
    fn insert(&self, record: &ContainerRecord) -> Result<()> {
        if record.state == ContainerState::Deleted {
            return Err(Error::Store(format!(
                "refusing to persist deleted record {}",
                record.id
            )));
        }
        let ports = serde_json::to_string(&record.ports)?;
        self.conn.lock().execute(
            "INSERT INTO containers (id, created_at, expires_at, ports, state)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                record.created_at.timestamp_millis(),
                record.expires_at.timestamp_millis(),
                ports,
                record.state.as_str(),
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<ContainerRecord>> {
        let raw = self
            .conn
            .lock()
            .query_row(
                "SELECT id, created_at, expires_at, ports, state FROM containers WHERE id = ?1",
                params![id],
                read_row,
            )
            .optional()?;
        raw.map(Self::decode).transpose()
    }

    fn list_active(&self) -> Result<Vec<ContainerRecord>> {
        let raw: Vec<RawRow> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT id, created_at, expires_at, ports, state FROM containers
                 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt.query_map([], read_row)?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        raw.into_iter().map(Self::decode).collect()
    }

    fn compare_and_set_state(
        &self,
        id: &str,
        expected: ContainerState,
        new: ContainerState,
    ) -> Result<bool> {
        if !expected.can_transition_to(new) || new == ContainerState::Deleted {
            return Err(Error::Store(format!(
                "illegal transition {} -> {} for {}",
                expected, new, id
            )));
        }
        let changed = self.conn.lock().execute(
            "UPDATE containers SET state = ?3 WHERE id = ?1 AND state = ?2",
            params![id, expected.as_str(), new.as_str()],
        )?;
        Ok(changed == 1)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .lock()
            .execute("DELETE FROM containers WHERE id = ?1", params![id])?;
        Ok(changed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(id: &str, ports: Vec<u16>) -> ContainerRecord {
        let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
        ContainerRecord::running(id, now, chrono::Duration::seconds(60), ports)
    }

    #[test]
    fn insert_then_get_preserves_fields() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let rec = record("c1", vec![40002, 40001]);
        store.insert(&rec).unwrap();

        let loaded = store.get("c1").unwrap().unwrap();
        assert_eq!(loaded, rec);
        assert_eq!(loaded.ports, vec![40002, 40001]);
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn duplicate_insert_is_a_store_error() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        store.insert(&record("dup", vec![1])).unwrap();
        assert!(matches!(
            store.insert(&record("dup", vec![2])),
            Err(Error::Store(_))
        ));
    }

    #[test]
    fn compare_and_set_only_moves_from_expected_state() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        store.insert(&record("c1", vec![1])).unwrap();

        assert!(store
            .compare_and_set_state("c1", ContainerState::Running, ContainerState::Deleting)
            .unwrap());
        assert!(!store
            .compare_and_set_state("c1", ContainerState::Running, ContainerState::Deleting)
            .unwrap());
        assert!(!store
            .compare_and_set_state("nope", ContainerState::Running, ContainerState::Expiring)
            .unwrap());
        assert_eq!(store.get("c1").unwrap().unwrap().state, ContainerState::Deleting);
    }

    #[test]
    fn compare_and_set_rejects_regressions() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        store.insert(&record("c1", vec![1])).unwrap();
        assert!(store
            .compare_and_set_state("c1", ContainerState::Expiring, ContainerState::Running)
            .is_err());
    }

    #[test]
    fn concurrent_compare_and_set_has_one_winner() {
        let store = Arc::new(SqliteRecordStore::open_in_memory().unwrap());
        store.insert(&record("race", vec![1])).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .compare_and_set_state(
                            "race",
                            ContainerState::Running,
                            ContainerState::Deleting,
                        )
                        .unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn list_and_delete() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        store.insert(&record("a", vec![1])).unwrap();
        store.insert(&record("b", vec![2])).unwrap();
        assert_eq!(store.list_active().unwrap().len(), 2);

        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        let remaining: Vec<_> = store.list_active().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(remaining, vec!["b".to_string()]);
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("containers.db");
        let rec = record("persisted", vec![40100, 40101]);
        {
            let store = SqliteRecordStore::open(&path).unwrap();
            store.insert(&rec).unwrap();
        }

        let store = SqliteRecordStore::open(&path).unwrap();
        assert_eq!(store.list_active().unwrap(), vec![rec]);
    }
}
