//! Durable downing records
//!
//! One record per view version guards the executor: a version whose record
//! is Applied is never executed again, and a Pending record left behind by a
//! crash is picked up again on restart.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::strategy::{DecisionReason, StrategyDecision};
use crate::error::{ResolverError, ResolverResult};
use crate::types::NodeAddress;

/// Execution status of a downing record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordStatus {
    Pending,
    Applied,
    Failed,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Applied => "applied",
            RecordStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = ResolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "applied" => Ok(RecordStatus::Applied),
            "failed" => Ok(RecordStatus::Failed),
            other => Err(ResolverError::Storage(format!("unknown record status '{}'", other))),
        }
    }
}

/// Persisted outcome of one decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DowningRecord {
    /// View version the decision was computed against
    pub version: u64,
    pub strategy: String,
    pub reason: DecisionReason,
    pub down_set: BTreeSet<NodeAddress>,
    pub status: RecordStatus,
    /// Down-command attempts spent so far
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DowningRecord {
    /// New Pending record for a decision
    pub fn pending(decision: &StrategyDecision) -> Self {
        let now = Utc::now();
        Self {
            version: decision.version,
            strategy: decision.strategy.clone(),
            reason: decision.reason,
            down_set: decision.down_set.clone(),
            status: RecordStatus::Pending,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: RecordStatus) -> Self {
        self.status = status;
        self.updated_at = Utc::now();
        self
    }

    /// Decision this record was created from
    pub fn decision(&self) -> StrategyDecision {
        StrategyDecision {
            strategy: self.strategy.clone(),
            version: self.version,
            down_set: self.down_set.clone(),
            reason: self.reason,
        }
    }
}

/// Storage backend for downing records
pub trait DowningRecordStore: Send + Sync {
    /// Record for a view version
    fn load(&self, version: u64) -> ResolverResult<Option<DowningRecord>>;

    /// Insert or replace the record for `record.version`
    fn save(&self, record: &DowningRecord) -> ResolverResult<()>;

    /// Record with the highest view version
    fn latest(&self) -> ResolverResult<Option<DowningRecord>>;

    fn remove(&self, version: u64) -> ResolverResult<()>;

    /// All records ordered by version
    fn records(&self) -> ResolverResult<Vec<DowningRecord>>;
}

/// Records kept in memory; they do not survive a restart
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<BTreeMap<u64, DowningRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DowningRecordStore for InMemoryRecordStore {
    fn load(&self, version: u64) -> ResolverResult<Option<DowningRecord>> {
        Ok(self.records.lock().get(&version).cloned())
    }

    fn save(&self, record: &DowningRecord) -> ResolverResult<()> {
        self.records.lock().insert(record.version, record.clone());
        Ok(())
    }

    fn latest(&self) -> ResolverResult<Option<DowningRecord>> {
        Ok(self.records.lock().values().next_back().cloned())
    }

    fn remove(&self, version: u64) -> ResolverResult<()> {
        self.records.lock().remove(&version);
        Ok(())
    }

    fn records(&self) -> ResolverResult<Vec<DowningRecord>> {
        Ok(self.records.lock().values().cloned().collect())
    }
}

/// SQLite-backed record store
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS downing_records (
    version     INTEGER PRIMARY KEY,
    strategy    TEXT NOT NULL,
    reason      TEXT NOT NULL,
    down_set    TEXT NOT NULL,
    status      TEXT NOT NULL,
    attempts    INTEGER NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
)";

const SELECT_COLUMNS: &str =
    "SELECT version, strategy, reason, down_set, status, attempts, created_at, updated_at FROM downing_records";

type RawRecord = (i64, String, String, String, String, i64, String, String);

impl SqliteRecordStore {
    pub fn open(path: impl AsRef<Path>) -> ResolverResult<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> ResolverResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> ResolverResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
        ))
    }

    fn decode(raw: RawRecord) -> ResolverResult<DowningRecord> {
        let (version, strategy, reason, down_set, status, attempts, created_at, updated_at) = raw;
        Ok(DowningRecord {
            version: version as u64,
            strategy,
            reason: serde_json::from_str(&reason)?,
            down_set: serde_json::from_str(&down_set)?,
            status: status.parse()?,
            attempts: attempts as u32,
            created_at: parse_time(&created_at)?,
            updated_at: parse_time(&updated_at)?,
        })
    }
}

fn parse_time(value: &str) -> ResolverResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ResolverError::Storage(format!("bad timestamp '{}': {}", value, e)))
}

impl DowningRecordStore for SqliteRecordStore {
    fn load(&self, version: u64) -> ResolverResult<Option<DowningRecord>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("{} WHERE version = ?1", SELECT_COLUMNS),
                params![version as i64],
                Self::read_row,
            )
            .optional()?;
        raw.map(Self::decode).transpose()
    }

    fn save(&self, record: &DowningRecord) -> ResolverResult<()> {
        let reason = serde_json::to_string(&record.reason)?;
        let down_set = serde_json::to_string(&record.down_set)?;
        self.conn.lock().execute(
            "INSERT INTO downing_records
                 (version, strategy, reason, down_set, status, attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(version) DO UPDATE SET
                 strategy = excluded.strategy,
                 reason = excluded.reason,
                 down_set = excluded.down_set,
                 status = excluded.status,
                 attempts = excluded.attempts,
                 updated_at = excluded.updated_at",
            params![
                record.version as i64,
                record.strategy,
                reason,
                down_set,
                record.status.as_str(),
                record.attempts as i64,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn latest(&self) -> ResolverResult<Option<DowningRecord>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("{} ORDER BY version DESC LIMIT 1", SELECT_COLUMNS),
                [],
                Self::read_row,
            )
            .optional()?;
        raw.map(Self::decode).transpose()
    }

    fn remove(&self, version: u64) -> ResolverResult<()> {
        self.conn
            .lock()
            .execute("DELETE FROM downing_records WHERE version = ?1", params![version as i64])?;
        Ok(())
    }

    fn records(&self) -> ResolverResult<Vec<DowningRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{} ORDER BY version", SELECT_COLUMNS))?;
        let rows = stmt
            .query_map([], Self::read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(Self::decode).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(version: u64, down: &[&str]) -> StrategyDecision {
        StrategyDecision {
            strategy: "keep-majority".to_string(),
            version,
            down_set: down.iter().map(|a| NodeAddress::new(*a).unwrap()).collect(),
            reason: DecisionReason::Majority,
        }
    }

    fn exercise(store: &dyn DowningRecordStore) {
        assert!(store.latest().unwrap().is_none());

        let first = DowningRecord::pending(&decision(3, &["a:1"]));
        store.save(&first).unwrap();
        store.save(&DowningRecord::pending(&decision(9, &["b:1", "c:1"]))).unwrap();

        assert_eq!(store.load(3).unwrap().unwrap().status, RecordStatus::Pending);
        assert_eq!(store.latest().unwrap().unwrap().version, 9);

        let applied = first.with_status(RecordStatus::Applied);
        store.save(&applied).unwrap();
        let loaded = store.load(3).unwrap().unwrap();
        assert_eq!(loaded.status, RecordStatus::Applied);
        assert_eq!(loaded.decision(), decision(3, &["a:1"]));

        store.remove(3).unwrap();
        assert!(store.load(3).unwrap().is_none());
        assert_eq!(store.records().unwrap().len(), 1);
    }

    #[test]
    fn test_in_memory_store() {
        exercise(&InMemoryRecordStore::new());
    }

    #[test]
    fn test_sqlite_store() {
        exercise(&SqliteRecordStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("downing.db");

        {
            let store = SqliteRecordStore::open(&path).unwrap();
            let record = DowningRecord::pending(&decision(12, &["a:1", "b:1"])).with_status(RecordStatus::Failed);
            store.save(&record).unwrap();
        }

        let store = SqliteRecordStore::open(&path).unwrap();
        let record = store.latest().unwrap().unwrap();
        assert_eq!(record.version, 12);
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.down_set.len(), 2);
    }

    #[test]
    fn test_status_round_trip_through_text() {
        for status in [RecordStatus::Pending, RecordStatus::Applied, RecordStatus::Failed] {
            assert_eq!(status.as_str().parse::<RecordStatus>().unwrap(), status);
        }
        assert!("done".parse::<RecordStatus>().is_err());
    }
}
