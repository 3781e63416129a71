//! Shared SQLite helpers: declarative versioned schemas and database opening.

mod versioned_schema;

pub use versioned_schema::{
    open_in_memory, open_versioned, Column, SqlType, Table, VersionedSchema, View,
    BASE_DB_VERSION, BUSY_TIMEOUT,
};
