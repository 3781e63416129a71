//! SQLite lease table shared by every replica pointing at the same file.

use super::coordinator::{LeaseCoordinator, LeaseKey};
use crate::clock::{system_clock, Clock};
use crate::sqlite_column;
use crate::sqlite_persistence::{open_versioned, Column, SqlType, Table, VersionedSchema};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const LEASES_TABLE_V0: Table = Table {
    name: "leases",
    columns: &[
        sqlite_column!("lease_key", &SqlType::Text, is_primary_key = true),
        sqlite_column!("namespace", &SqlType::Text, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("holder", &SqlType::Text, non_null = true),
        sqlite_column!("acquired_at", &SqlType::Integer, non_null = true),
        sqlite_column!("expires_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
};

pub const LEASES_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[LEASES_TABLE_V0],
    views: &[],
    migration: None,
}];

/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct SqliteLeaseCoordinator {
    conn: Arc<Mutex<Connection>>,
    clock: Clock,
}

impl SqliteLeaseCoordinator {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path, LEASES_VERSIONED_SCHEMAS, "leases")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: system_clock(),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = crate::sqlite_persistence::open_in_memory(LEASES_VERSIONED_SCHEMAS)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: system_clock(),
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Current holder of a lease, if it has not expired.
    pub fn current_holder(&self, key: &LeaseKey) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let now = (self.clock)().timestamp_millis();
        let holder = conn
            .query_row(
                "SELECT holder FROM leases WHERE lease_key = ?1 AND expires_at > ?2",
                params![key.to_string(), now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(holder)
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("lease connection mutex poisoned"))
    }

    fn acquire_blocking(&self, key: &LeaseKey, holder: &str, duration: Duration) -> Result<bool> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let now = (self.clock)().timestamp_millis();
        let expires_at = now + duration.as_millis() as i64;

        let current: Option<(String, i64)> = tx
            .query_row(
                "SELECT holder, expires_at FROM leases WHERE lease_key = ?1",
                params![key.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let acquired = match current {
            None => {
                tx.execute(
                    r#"INSERT INTO leases (lease_key, namespace, name, holder, acquired_at, expires_at)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
                    params![key.to_string(), key.namespace, key.name, holder, now, expires_at],
                )?;
                true
            }
            Some((current_holder, current_expiry)) if current_holder == holder || current_expiry <= now => {
                if current_holder != holder {
                    debug!("Lease {} expired for {}, taking over", key, current_holder);
                }
                tx.execute(
                    "UPDATE leases SET holder = ?2, acquired_at = ?3, expires_at = ?4 WHERE lease_key = ?1",
                    params![key.to_string(), holder, now, expires_at],
                )?;
                true
            }
            Some(_) => false,
        };

        tx.commit()?;
        Ok(acquired)
    }

    fn renew_blocking(&self, key: &LeaseKey, holder: &str, duration: Duration) -> Result<bool> {
        let conn = self.lock_conn()?;
        let now = (self.clock)().timestamp_millis();
        let renewed = conn.execute(
            "UPDATE leases SET expires_at = ?4 WHERE lease_key = ?1 AND holder = ?2 AND expires_at > ?3",
            params![
                key.to_string(),
                holder,
                now,
                now + duration.as_millis() as i64
            ],
        )?;
        Ok(renewed == 1)
    }

    fn release_blocking(&self, key: &LeaseKey, holder: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "DELETE FROM leases WHERE lease_key = ?1 AND holder = ?2",
            params![key.to_string(), holder],
        )?;
        Ok(())
    }
}

// SQLite calls run on the blocking pool, never on a runtime worker.
#[async_trait]
impl LeaseCoordinator for SqliteLeaseCoordinator {
    async fn try_acquire(&self, key: &LeaseKey, holder: &str, duration: Duration) -> Result<bool> {
        let this = self.clone();
        let (key, holder) = (key.clone(), holder.to_string());
        tokio::task::spawn_blocking(move || this.acquire_blocking(&key, &holder, duration))
            .await
            .context("Lease acquire task failed")?
    }

    async fn renew(&self, key: &LeaseKey, holder: &str, duration: Duration) -> Result<bool> {
        let this = self.clone();
        let (key, holder) = (key.clone(), holder.to_string());
        tokio::task::spawn_blocking(move || this.renew_blocking(&key, &holder, duration))
            .await
            .context("Lease renew task failed")?
    }

    async fn release(&self, key: &LeaseKey, holder: &str) -> Result<()> {
        let this = self.clone();
        let (key, holder) = (key.clone(), holder.to_string());
        tokio::task::spawn_blocking(move || this.release_blocking(&key, &holder))
            .await
            .context("Lease release task failed")?
    }
}
