//! Database schema for operations.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema, View};

// =============================================================================
// Operations Table - Version 0
// =============================================================================

const OPERATIONS_TABLE_V0: Table = Table {
    name: "operations",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("op_type", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("priority", &SqlType::Integer, non_null = true),
        sqlite_column!("data", &SqlType::Text, non_null = true),
        sqlite_column!("error", &SqlType::Text),
        sqlite_column!(
            "error_severity",
            &SqlType::Text,
            non_null = true,
            default_value = Some("'NONE'")
        ),
        // Bumped by every successful claim lock
        sqlite_column!(
            "lock_version",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
        sqlite_column!("finished_at", &SqlType::Integer),
    ],
    indices: &[
        ("idx_operations_queue", "op_type, status, priority"),
        ("idx_operations_data", "op_type, data"),
        ("idx_operations_updated", "status, updated_at"),
    ],
};

/// Only schedulable rows, in consumption order. `seq` exposes insertion order.
const SCHEDULED_OPERATIONS_VIEW_V0: View = View {
    name: "scheduled_operations",
    select: "SELECT rowid AS seq, * FROM operations WHERE status = 'SCHEDULED' ORDER BY priority DESC, rowid ASC",
};

pub const OPERATIONS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[OPERATIONS_TABLE_V0],
    views: &[SCHEDULED_OPERATIONS_VIEW_V0],
    migration: None,
}];
