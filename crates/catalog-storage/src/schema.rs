//! SQL schema and connection setup for the durable backend.
//!
//! The table name comes from configuration, so DDL is rendered at runtime
//! with the name quoted as an identifier instead of being embedded as
//! fixed migration files.

use std::time::Duration;

use rusqlite::{params, Connection};

use crate::error::StorageError;

/// Columns of the component table, in declaration order.
pub const COLUMNS: [&str; 7] = [
    "region",
    "name",
    "version",
    "provider",
    "category",
    "deprecated",
    "body",
];

/// Primary key columns, in key order.
pub const KEY_COLUMNS: [&str; 3] = ["region", "name", "version"];

/// Quotes `name` as an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Opens the database file at `path`, or a private in-memory database when
/// `path` is `None`, and applies connection pragmas.
pub fn open_connection(path: Option<&str>, busy_timeout: Option<Duration>) -> Result<Connection, StorageError> {
    let conn = match path {
        Some(path) => Connection::open(path)?,
        None => Connection::open_in_memory()?,
    };
    configure(&conn, busy_timeout)?;
    Ok(conn)
}

fn configure(conn: &Connection, busy_timeout: Option<Duration>) -> Result<(), StorageError> {
    // WAL lets the reader connection proceed while the writer commits.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    if let Some(timeout) = busy_timeout {
        conn.busy_timeout(timeout)?;
    }
    Ok(())
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool, StorageError> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Creates the component table and its provider index if absent.
pub fn create_table(conn: &Connection, table: &str) -> Result<(), StorageError> {
    let quoted = quote_ident(table);
    let index = quote_ident(&format!("{}_provider_idx", table));
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {quoted} (
            region     TEXT    NOT NULL,
            name       TEXT    NOT NULL,
            version    TEXT    NOT NULL,
            provider   TEXT    NOT NULL,
            category   TEXT    NOT NULL,
            deprecated INTEGER NOT NULL DEFAULT 0,
            body       TEXT    NOT NULL,
            PRIMARY KEY (region, name, version)
        ) WITHOUT ROWID;
        CREATE INDEX IF NOT EXISTS {index} ON {quoted} (region, provider);"
    ))?;
    Ok(())
}

/// Checks that `table` exists with the expected columns and primary key.
pub fn verify_table(conn: &Connection, table: &str) -> Result<(), StorageError> {
    let schema_err = |reason: String| StorageError::Schema {
        table: table.to_string(),
        reason,
    };

    if !table_exists(conn, table)? {
        return Err(schema_err("table does not exist".into()));
    }

    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, i64>(5)?)))?;

    let mut columns = Vec::new();
    let mut key = Vec::new();
    for row in rows {
        let (name, pk) = row?;
        if pk > 0 {
            key.push((pk, name.clone()));
        }
        columns.push(name);
    }
    key.sort();

    let missing: Vec<&str> = COLUMNS
        .iter()
        .copied()
        .filter(|c| !columns.iter().any(|have| have == c))
        .collect();
    if !missing.is_empty() {
        return Err(schema_err(format!("missing columns: {}", missing.join(", "))));
    }

    let key: Vec<&str> = key.iter().map(|(_, name)| name.as_str()).collect();
    if key != KEY_COLUMNS {
        return Err(schema_err(format!(
            "primary key is ({}), expected ({})",
            key.join(", "),
            KEY_COLUMNS.join(", ")
        )));
    }

    Ok(())
}
