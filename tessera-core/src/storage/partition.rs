use crate::changelog::{ChangeRecord, Operation};
use crate::error::{Result, TesseraError, lock_poisoned};
use crate::meta::{PartitionKey, PartitionState};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use ulid::Ulid;

pub const DATA_FILE_NAME: &str = "data.sqlite3";
const CURRENT_DIR: &str = "current";
const STAGING_DIR: &str = "staging";
const COMMITTED_OFFSET_KEY: &str = "committed_offset";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Snapshot of a partition's lifecycle and progress.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionStatus {
    pub state: PartitionState,
    /// Highest applied log offset; `None` when nothing was ever applied.
    pub committed_offset: Option<u64>,
    /// Offset carried by the last installed transfer.
    pub snapshot_offset: Option<u64>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PartitionStatus {
    /// First log offset ingestion must read.
    pub fn resume_offset(&self) -> u64 {
        self.committed_offset.map(|offset| offset + 1).unwrap_or(0)
    }
}

/// One locally hosted partition: its SQLite database under
/// `<engine_dir>/p<partition>/current/` plus its state machine.
pub struct PartitionReplica {
    key: PartitionKey,
    dir: PathBuf,
    status: Mutex<PartitionStatus>,
    // Serializes the single writer against snapshot installation.
    write_lock: Mutex<()>,
}

impl PartitionReplica {
    pub fn open(key: PartitionKey, dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(dir.join(CURRENT_DIR))?;

        let replica = Self {
            key,
            dir,
            status: Mutex::new(PartitionStatus {
                state: PartitionState::Unassigned,
                committed_offset: None,
                snapshot_offset: None,
                last_error: None,
                updated_at: Utc::now(),
            }),
            write_lock: Mutex::new(()),
        };

        let conn = replica.get_conn()?;
        init_schema(&conn)?;
        let committed = read_committed_offset(&conn)?;
        replica.lock_status()?.committed_offset = committed;

        tracing::debug!(
            "Opened partition {} (committed offset {:?})",
            replica.key,
            committed
        );
        Ok(replica)
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.join(CURRENT_DIR).join(DATA_FILE_NAME)
    }

    /// Parent directory for in-progress transfer downloads.
    pub fn staging_root(&self) -> PathBuf {
        self.dir.join(STAGING_DIR)
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(self.db_path())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    fn lock_status(&self) -> Result<std::sync::MutexGuard<'_, PartitionStatus>> {
        self.status.lock().map_err(|_| lock_poisoned("partition status"))
    }

    pub fn status(&self) -> Result<PartitionStatus> {
        Ok(self.lock_status()?.clone())
    }

    pub fn state(&self) -> Result<PartitionState> {
        Ok(self.lock_status()?.state)
    }

    pub fn committed_offset(&self) -> Result<Option<u64>> {
        Ok(self.lock_status()?.committed_offset)
    }

    /// Checked state change. Re-entering the current state is a no-op.
    pub fn transition(&self, to: PartitionState) -> Result<PartitionState> {
        self.transition_with(to, None)
    }

    /// Moves to ERROR and records `reason`.
    pub fn fail(&self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        tracing::error!("Partition {} failed: {}", self.key, reason);
        self.transition_with(PartitionState::Error, Some(reason))?;
        Ok(())
    }

    fn transition_with(&self, to: PartitionState, error: Option<String>) -> Result<PartitionState> {
        let mut status = self.lock_status()?;
        let from = status.state;

        if from == to {
            return Ok(from);
        }
        if !from.can_transition_to(to) {
            return Err(TesseraError::InvalidStateTransition {
                partition: self.key.clone(),
                from,
                to,
            });
        }

        status.state = to;
        status.updated_at = Utc::now();
        if error.is_some() || from == PartitionState::Error {
            status.last_error = error;
        }

        tracing::info!("Partition {} {} -> {}", self.key, from, to);
        Ok(from)
    }

    fn ensure_readable(&self) -> Result<()> {
        let state = self.state()?;
        if !state.is_readable() {
            return Err(TesseraError::PartitionUnavailable {
                partition: self.key.clone(),
                state,
            });
        }
        Ok(())
    }

    /// Reads a key when the partition serves current data.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_readable()?;
        self.inspect(key)
    }

    /// Reads a key regardless of partition state.
    pub fn inspect(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let conn = self.get_conn()?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(value)
    }

    /// All pairs in key order, regardless of state.
    pub fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT key, value FROM kv ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut pairs = Vec::new();
        for row in rows {
            pairs.push(row?);
        }
        Ok(pairs)
    }

    /// Single write that does not move the committed offset.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let _writer = self.write_lock.lock().map_err(|_| lock_poisoned("partition writer"))?;
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let _writer = self.write_lock.lock().map_err(|_| lock_poisoned("partition writer"))?;
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(deleted > 0)
    }

    /// Applies `records` and their checkpoint in one transaction.
    ///
    /// Records at or below the committed offset are skipped. Offsets must be
    /// strictly increasing. Returns the committed offset after the batch.
    pub fn apply_batch(&self, records: &[ChangeRecord]) -> Result<Option<u64>> {
        let state = self.state()?;
        if !state.is_consuming() {
            return Err(TesseraError::PartitionUnavailable {
                partition: self.key.clone(),
                state,
            });
        }

        let _writer = self.write_lock.lock().map_err(|_| lock_poisoned("partition writer"))?;
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let base = read_committed_offset(&tx)?;
        let mut committed = base;
        let mut previous: Option<u64> = None;
        let mut applied = 0usize;
        for record in records {
            if let Some(prev) = previous.filter(|prev| record.offset <= *prev) {
                return Err(TesseraError::Consumption {
                    partition: self.key.clone(),
                    offset: record.offset,
                    reason: format!("offset not after {}", prev),
                });
            }
            previous = Some(record.offset);
            if base.is_some_and(|offset| record.offset <= offset) {
                continue;
            }

            match &record.operation {
                Operation::Put(value) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                        params![record.key.as_ref(), value.as_ref()],
                    )?;
                }
                Operation::Delete => {
                    tx.execute("DELETE FROM kv WHERE key = ?1", params![record.key.as_ref()])?;
                }
            }
            committed = Some(record.offset);
            applied += 1;
        }

        if applied > 0 {
            if let Some(offset) = committed {
                write_committed_offset(&tx, offset)?;
            }
            tx.commit()?;

            let mut status = self.lock_status()?;
            status.committed_offset = committed;
            status.updated_at = Utc::now();
        }

        Ok(committed)
    }

    /// Writes a consistent copy of the database to `dest` and returns the
    /// committed offset the copy reflects. Does not block the writer.
    pub fn export_snapshot(&self, dest: &Path) -> Result<Option<u64>> {
        self.ensure_readable()?;

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let dest_str = dest
            .to_str()
            .ok_or_else(|| TesseraError::Storage(format!("non UTF-8 path: {:?}", dest)))?;

        let conn = self.get_conn()?;
        conn.execute_batch(&format!("VACUUM INTO '{}'", dest_str.replace('\'', "''")))?;

        // The copy carries its own checkpoint row.
        let snapshot = Connection::open(dest)?;
        read_committed_offset(&snapshot)
    }

    /// Replaces the partition's database with the file at `staged_db`.
    ///
    /// Only legal while TRANSFERRING. The swap is two directory renames so a
    /// reader opening the database sees either the old or the new file.
    pub fn install_snapshot(&self, staged_db: &Path, snapshot_offset: Option<u64>) -> Result<()> {
        let state = self.state()?;
        if state != PartitionState::Transferring {
            return Err(TesseraError::InvalidStateTransition {
                partition: self.key.clone(),
                from: state,
                to: PartitionState::Ingesting,
            });
        }

        {
            let conn = Connection::open(staged_db)?;
            let integrity: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
            if integrity != "ok" {
                return Err(TesseraError::Transfer(format!(
                    "snapshot for {} failed integrity check: {}",
                    self.key, integrity
                )));
            }
            let embedded = read_committed_offset(&conn)?;
            if embedded != snapshot_offset {
                return Err(TesseraError::Transfer(format!(
                    "snapshot for {} carries offset {:?}, manifest says {:?}",
                    self.key, embedded, snapshot_offset
                )));
            }
        }

        let _writer = self.write_lock.lock().map_err(|_| lock_poisoned("partition writer"))?;

        let incoming = self.dir.join(format!("incoming.{}", Ulid::new()));
        std::fs::create_dir_all(&incoming)?;
        std::fs::rename(staged_db, incoming.join(DATA_FILE_NAME))?;

        let current = self.dir.join(CURRENT_DIR);
        let retired = self.dir.join(format!("retired.{}", Ulid::new()));
        std::fs::rename(&current, &retired)?;
        std::fs::rename(&incoming, &current)?;
        if let Err(e) = std::fs::remove_dir_all(&retired) {
            tracing::warn!("Failed to remove retired data {:?}: {}", retired, e);
        }
        init_schema(&self.get_conn()?)?;

        let mut status = self.lock_status()?;
        status.committed_offset = snapshot_offset;
        status.snapshot_offset = snapshot_offset;
        status.updated_at = Utc::now();

        tracing::info!(
            "Installed snapshot for {} at offset {:?}",
            self.key,
            snapshot_offset
        );
        Ok(())
    }

    /// Folds the WAL back into the database file.
    pub fn flush(&self) -> Result<()> {
        let conn = self.get_conn()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS kv (
            key BLOB PRIMARY KEY,
            value BLOB NOT NULL
        ) WITHOUT ROWID",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS partition_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

fn read_committed_offset(conn: &Connection) -> Result<Option<u64>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM partition_meta WHERE key = ?1",
            params![COMMITTED_OFFSET_KEY],
            |row| row.get(0),
        )
        .optional()?;

    value
        .map(|raw| {
            raw.parse::<u64>().map_err(|e| {
                TesseraError::Storage(format!("bad committed offset {:?}: {}", raw, e))
            })
        })
        .transpose()
}

fn write_committed_offset(conn: &Connection, offset: u64) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO partition_meta (key, value) VALUES (?1, ?2)",
        params![COMMITTED_OFFSET_KEY, offset.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn put(offset: u64, key: &str, value: &str) -> ChangeRecord {
        ChangeRecord {
            offset,
            key: Bytes::copy_from_slice(key.as_bytes()),
            operation: Operation::Put(Bytes::copy_from_slice(value.as_bytes())),
        }
    }

    fn delete(offset: u64, key: &str) -> ChangeRecord {
        ChangeRecord {
            offset,
            key: Bytes::copy_from_slice(key.as_bytes()),
            operation: Operation::Delete,
        }
    }

    fn ingesting_replica(dir: &TempDir) -> PartitionReplica {
        let replica =
            PartitionReplica::open(PartitionKey::new("users", 1, 0), dir.path().join("p0"))
                .unwrap();
        replica.transition(PartitionState::Ingesting).unwrap();
        replica
    }

    #[test]
    fn test_apply_batch_commits_offset_with_data() {
        let dir = TempDir::new().unwrap();
        let replica = ingesting_replica(&dir);

        let committed = replica
            .apply_batch(&[put(0, "a", "1"), put(1, "b", "2"), delete(2, "a")])
            .unwrap();
        assert_eq!(committed, Some(2));
        assert_eq!(replica.get(b"a").unwrap(), None);
        assert_eq!(replica.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(replica.status().unwrap().resume_offset(), 3);
    }

    #[test]
    fn test_replayed_offsets_are_skipped() {
        let dir = TempDir::new().unwrap();
        let replica = ingesting_replica(&dir);

        replica.apply_batch(&[put(0, "a", "1"), put(1, "a", "2")]).unwrap();
        let committed = replica
            .apply_batch(&[put(1, "a", "stale"), put(2, "b", "3")])
            .unwrap();
        assert_eq!(committed, Some(2));
        assert_eq!(replica.get(b"a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_out_of_order_batch_rolls_back() {
        let dir = TempDir::new().unwrap();
        let replica = ingesting_replica(&dir);

        let result = replica.apply_batch(&[put(0, "a", "1"), put(5, "b", "2"), put(4, "c", "3")]);
        assert!(matches!(result, Err(TesseraError::Consumption { offset: 4, .. })));
        assert_eq!(replica.committed_offset().unwrap(), None);
        assert_eq!(replica.inspect(b"a").unwrap(), None);
    }

    #[test]
    fn test_committed_offset_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let replica = ingesting_replica(&dir);
            replica.apply_batch(&[put(0, "a", "1"), put(1, "b", "2")]).unwrap();
            replica.flush().unwrap();
        }

        let reopened =
            PartitionReplica::open(PartitionKey::new("users", 1, 0), dir.path().join("p0"))
                .unwrap();
        assert_eq!(reopened.committed_offset().unwrap(), Some(1));
        assert_eq!(reopened.state().unwrap(), PartitionState::Unassigned);
    }

    #[test]
    fn test_reads_rejected_outside_consuming_states() {
        let dir = TempDir::new().unwrap();
        let replica =
            PartitionReplica::open(PartitionKey::new("users", 1, 0), dir.path().join("p0"))
                .unwrap();
        assert!(matches!(
            replica.get(b"a"),
            Err(TesseraError::PartitionUnavailable {
                state: PartitionState::Unassigned,
                ..
            })
        ));

        replica.transition(PartitionState::Transferring).unwrap();
        assert!(replica.get(b"a").unwrap_err().is_unavailable());

        replica.fail("disk gone").unwrap();
        assert!(replica.get(b"a").unwrap_err().is_unavailable());
        assert_eq!(replica.status().unwrap().last_error.as_deref(), Some("disk gone"));
    }

    #[test]
    fn test_illegal_transition_is_rejected() {
        let dir = TempDir::new().unwrap();
        let replica = ingesting_replica(&dir);
        assert!(matches!(
            replica.transition(PartitionState::Transferring),
            Err(TesseraError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_export_and_install_snapshot() {
        let dir = TempDir::new().unwrap();
        let source = ingesting_replica(&dir);
        source
            .apply_batch(&[put(0, "a", "1"), put(1, "b", "2"), put(2, "c", "3")])
            .unwrap();

        let exported = dir.path().join("export").join(DATA_FILE_NAME);
        let offset = source.export_snapshot(&exported).unwrap();
        assert_eq!(offset, Some(2));

        let target =
            PartitionReplica::open(PartitionKey::new("users", 1, 0), dir.path().join("other"))
                .unwrap();
        target.transition(PartitionState::Transferring).unwrap();
        target.install_snapshot(&exported, offset).unwrap();
        target.transition(PartitionState::Ingesting).unwrap();

        assert_eq!(target.scan().unwrap(), source.scan().unwrap());
        let status = target.status().unwrap();
        assert_eq!(status.snapshot_offset, Some(2));
        assert_eq!(status.resume_offset(), 3);
    }

    #[test]
    fn test_install_rejects_offset_mismatch() {
        let dir = TempDir::new().unwrap();
        let source = ingesting_replica(&dir);
        source.apply_batch(&[put(0, "a", "1")]).unwrap();
        let exported = dir.path().join("export").join(DATA_FILE_NAME);
        source.export_snapshot(&exported).unwrap();

        let target =
            PartitionReplica::open(PartitionKey::new("users", 1, 0), dir.path().join("other"))
                .unwrap();
        target.transition(PartitionState::Transferring).unwrap();
        assert!(target.install_snapshot(&exported, Some(9)).is_err());
        assert_eq!(target.committed_offset().unwrap(), None);
    }
}
