//! Operation storage and persistence.
//!
//! Every read and write goes through an explicit transaction obtained from
//! [`OperationStore::begin`]. Dropping a transaction without committing it
//! rolls it back.

use super::models::*;
use super::schema::OPERATIONS_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::open_versioned;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Transaction factory over the operation table.
pub trait OperationStore: Send + Sync {
    /// Open a new transaction. Fails when the store cannot start one.
    fn begin(&self) -> Result<Box<dyn OperationTx + '_>>;
}

/// Operations available inside a single transaction.
pub trait OperationTx {
    // === Rows ===

    fn create(&self, operation: &Operation) -> Result<()>;

    fn create_multiple(&self, operations: &[Operation]) -> Result<()>;

    /// Persist status, priority, error and timestamps of an existing row.
    fn update(&self, operation: &Operation) -> Result<()>;

    fn get(&self, id: &str) -> Result<Option<Operation>>;

    fn delete(&self, id: &str) -> Result<()>;

    fn delete_multiple(&self, ids: &[String]) -> Result<()>;

    // === Queries ===

    /// Up to `limit` SCHEDULED rows of a type from the priority view,
    /// highest priority first, then insertion order.
    fn list_priority_queue(&self, op_type: OperationType, limit: usize) -> Result<Vec<Operation>>;

    fn list_all_by_type(&self, op_type: OperationType) -> Result<Vec<Operation>>;

    fn get_by_data_and_type(
        &self,
        data: &OperationData,
        op_type: OperationType,
    ) -> Result<Option<Operation>>;

    /// IN_PROGRESS rows of a type last updated before `cutoff`.
    fn list_hanged(&self, op_type: OperationType, cutoff: DateTime<Utc>) -> Result<Vec<Operation>>;

    // === Claim ===

    /// Row-level claim lock. Returns true for exactly one caller while the
    /// row is still SCHEDULED, false if it was claimed or removed meanwhile.
    fn lock_operation(&self, id: &str) -> Result<bool>;

    // === Maintenance ===

    /// IN_PROGRESS rows updated before `cutoff` go back to SCHEDULED.
    fn reschedule_hanged(
        &self,
        op_type: OperationType,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize>;

    /// COMPLETED/FAILED rows updated before `cutoff` go back to SCHEDULED
    /// with low priority.
    fn reschedule_stale(
        &self,
        op_type: OperationType,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize>;

    /// Remove rows in `status` last updated before `cutoff`.
    fn delete_older_than(
        &self,
        op_type: OperationType,
        status: OperationStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<usize>;

    fn commit(self: Box<Self>) -> Result<()>;
}

/// SQLite-backed operation store.
///
/// Transactions are opened with `BEGIN IMMEDIATE`, so replicas sharing the
/// same database file serialize their writes and the claim lock stays
/// exclusive across processes.
pub struct SqliteOperationStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteOperationStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path, OPERATIONS_VERSIONED_SCHEMAS, "operations")?;
        Ok(SqliteOperationStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store for testing.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = crate::sqlite_persistence::open_in_memory(OPERATIONS_VERSIONED_SCHEMAS)?;
        Ok(SqliteOperationStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

impl OperationStore for SqliteOperationStore {
    fn begin(&self) -> Result<Box<dyn OperationTx + '_>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("operations connection mutex poisoned"))?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteOperationTx {
            conn,
            finished: false,
        }))
    }
}

struct SqliteOperationTx<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

const SELECT_OPERATION: &str = "SELECT id, op_type, status, priority, data, error, error_severity, created_at, updated_at, finished_at";

fn row_to_operation(row: &rusqlite::Row) -> rusqlite::Result<Operation> {
    let op_type: String = row.get("op_type")?;
    let status: String = row.get("status")?;
    let severity: String = row.get("error_severity")?;
    let error: Option<String> = row.get("error")?;

    Ok(Operation {
        id: row.get("id")?,
        op_type: OperationType::from_str(&op_type)
            .ok_or_else(|| invalid_column("op_type", op_type.clone()))?,
        status: OperationStatus::from_db_str(&status)
            .ok_or_else(|| invalid_column("status", status.clone()))?,
        priority: row.get("priority")?,
        data: OperationData::from_raw(row.get("data")?),
        error: match error {
            Some(raw) => Some(
                serde_json::from_str(&raw)
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            5,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
            ),
            None => None,
        },
        error_severity: ErrorSeverity::from_db_str(&severity)
            .ok_or_else(|| invalid_column("error_severity", severity.clone()))?,
        created_at: millis_to_datetime(row.get("created_at")?),
        updated_at: millis_to_datetime(row.get("updated_at")?),
        finished_at: row
            .get::<_, Option<i64>>("finished_at")?
            .map(millis_to_datetime),
    })
}

fn invalid_column(column: &str, value: String) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(0, format!("{}={}", column, value), rusqlite::types::Type::Text)
}

fn error_to_json(error: &Option<OperationErrorPayload>) -> Result<Option<String>> {
    Ok(match error {
        Some(payload) => Some(serde_json::to_string(payload)?),
        None => None,
    })
}

impl SqliteOperationTx<'_> {
    fn insert(&self, operation: &Operation) -> Result<()> {
        self.conn.execute(
            r#"INSERT INTO operations (
                id, op_type, status, priority, data, error, error_severity,
                created_at, updated_at, finished_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
            params![
                operation.id,
                operation.op_type.as_str(),
                operation.status.as_db_str(),
                operation.priority,
                operation.data.as_str(),
                error_to_json(&operation.error)?,
                operation.error_severity.as_db_str(),
                operation.created_at.timestamp_millis(),
                operation.updated_at.timestamp_millis(),
                operation.finished_at.map(|t| t.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    fn query_operations(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Operation>> {
        let mut stmt = self.conn.prepare(sql)?;
        let operations = stmt
            .query_map(params, row_to_operation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(operations)
    }
}

impl OperationTx for SqliteOperationTx<'_> {
    fn create(&self, operation: &Operation) -> Result<()> {
        self.insert(operation)
    }

    fn create_multiple(&self, operations: &[Operation]) -> Result<()> {
        for operation in operations {
            self.insert(operation)?;
        }
        Ok(())
    }

    fn update(&self, operation: &Operation) -> Result<()> {
        let updated = self.conn.execute(
            r#"UPDATE operations
               SET status = ?2, priority = ?3, error = ?4, error_severity = ?5,
                   updated_at = ?6, finished_at = ?7
               WHERE id = ?1"#,
            params![
                operation.id,
                operation.status.as_db_str(),
                operation.priority,
                error_to_json(&operation.error)?,
                operation.error_severity.as_db_str(),
                operation.updated_at.timestamp_millis(),
                operation.finished_at.map(|t| t.timestamp_millis()),
            ],
        )?;
        if updated == 0 {
            return Err(anyhow!("operation {} does not exist", operation.id));
        }
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Operation>> {
        let operation = self
            .conn
            .query_row(
                &format!("{} FROM operations WHERE id = ?1", SELECT_OPERATION),
                [id],
                row_to_operation,
            )
            .optional()?;
        Ok(operation)
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM operations WHERE id = ?1", [id])?;
        Ok(())
    }

    fn delete_multiple(&self, ids: &[String]) -> Result<()> {
        let mut stmt = self.conn.prepare("DELETE FROM operations WHERE id = ?1")?;
        for id in ids {
            stmt.execute([id])?;
        }
        Ok(())
    }

    fn list_priority_queue(&self, op_type: OperationType, limit: usize) -> Result<Vec<Operation>> {
        self.query_operations(
            &format!(
                "{} FROM scheduled_operations WHERE op_type = ?1 ORDER BY priority DESC, seq ASC LIMIT ?2",
                SELECT_OPERATION
            ),
            params![op_type.as_str(), limit as i64],
        )
    }

    fn list_all_by_type(&self, op_type: OperationType) -> Result<Vec<Operation>> {
        self.query_operations(
            &format!(
                "{} FROM operations WHERE op_type = ?1 ORDER BY rowid ASC",
                SELECT_OPERATION
            ),
            params![op_type.as_str()],
        )
    }

    fn get_by_data_and_type(
        &self,
        data: &OperationData,
        op_type: OperationType,
    ) -> Result<Option<Operation>> {
        let operation = self
            .conn
            .query_row(
                &format!(
                    "{} FROM operations WHERE op_type = ?1 AND data = ?2 ORDER BY rowid ASC LIMIT 1",
                    SELECT_OPERATION
                ),
                params![op_type.as_str(), data.as_str()],
                row_to_operation,
            )
            .optional()?;
        Ok(operation)
    }

    fn list_hanged(&self, op_type: OperationType, cutoff: DateTime<Utc>) -> Result<Vec<Operation>> {
        self.query_operations(
            &format!(
                "{} FROM operations WHERE op_type = ?1 AND status = 'IN_PROGRESS' AND updated_at < ?2",
                SELECT_OPERATION
            ),
            params![op_type.as_str(), cutoff.timestamp_millis()],
        )
    }

    fn lock_operation(&self, id: &str) -> Result<bool> {
        let locked = self.conn.execute(
            "UPDATE operations SET lock_version = lock_version + 1 WHERE id = ?1 AND status = 'SCHEDULED'",
            [id],
        )?;
        Ok(locked == 1)
    }

    fn reschedule_hanged(
        &self,
        op_type: OperationType,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let count = self.conn.execute(
            r#"UPDATE operations SET status = 'SCHEDULED', updated_at = ?3
               WHERE op_type = ?1 AND status = 'IN_PROGRESS' AND updated_at < ?2"#,
            params![op_type.as_str(), cutoff.timestamp_millis(), now.timestamp_millis()],
        )?;
        Ok(count)
    }

    fn reschedule_stale(
        &self,
        op_type: OperationType,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let count = self.conn.execute(
            r#"UPDATE operations
               SET status = 'SCHEDULED', priority = ?4, updated_at = ?3, finished_at = NULL
               WHERE op_type = ?1 AND status IN ('COMPLETED', 'FAILED') AND updated_at < ?2"#,
            params![
                op_type.as_str(),
                cutoff.timestamp_millis(),
                now.timestamp_millis(),
                OperationPriority::Low.as_i32(),
            ],
        )?;
        Ok(count)
    }

    fn delete_older_than(
        &self,
        op_type: OperationType,
        status: OperationStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<usize> {
        let count = self.conn.execute(
            "DELETE FROM operations WHERE op_type = ?1 AND status = ?2 AND updated_at < ?3",
            params![op_type.as_str(), status.as_db_str(), cutoff.timestamp_millis()],
        )?;
        Ok(count)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteOperationTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!("Failed to roll back operations transaction: {}", e);
            }
        }
    }
}
