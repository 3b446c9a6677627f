//! The behavioral contract over the database driver, plus the sink's error
//! model.
//!
//! The facade exists so tests can inject a fake ([`crate::mem::MemDb`]);
//! production has exactly one implementation ([`crate::postgres::PgDb`]).

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::Snafu;

use crate::types::{FullTableName, PgDataType};

/// SQLSTATE for "relation does not exist".
pub(crate) const PG_UNDEFINED_TABLE: &str = "42P01";
/// SQLSTATE for "column does not exist".
pub(crate) const PG_UNDEFINED_COLUMN: &str = "42703";

/// A dynamically typed SQL value: statement parameter or decoded result
/// cell.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum SqlValue {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Jsonb(serde_json::Value),
}

impl SqlValue {
    /// Whether this cell is SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<&data_types::FieldValue> for SqlValue {
    fn from(v: &data_types::FieldValue) -> Self {
        use data_types::FieldValue;
        match v {
            FieldValue::Bool(b) => Self::Bool(*b),
            FieldValue::I64(i) => Self::I64(*i),
            FieldValue::F64(f) => Self::F64(*f),
            FieldValue::Text(s) => Self::Text(s.clone()),
            FieldValue::Bytes(b) => Self::Bytes(b.clone()),
        }
    }
}

/// One decoded result row.
pub type Row = Vec<SqlValue>;

/// Errors surfaced by the sink.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The target table does not exist (SQLSTATE 42P01). Recovered once per
    /// write by creating the table.
    #[snafu(display("table does not exist: {source}"))]
    MissingTable {
        /// The driver error carrying the SQLSTATE.
        source: sqlx::Error,
    },

    /// A referenced column does not exist (SQLSTATE 42703). Recovered once
    /// per write by additive ALTER.
    #[snafu(display("column does not exist: {source}"))]
    MissingColumn {
        /// The driver error carrying the SQLSTATE.
        source: sqlx::Error,
    },

    /// An existing column cannot hold the required data. Never repaired
    /// automatically.
    #[snafu(display(
        "column {column} of table {table} has type {existing} which cannot hold {required}"
    ))]
    SchemaMismatch {
        /// The table that was checked.
        table: String,
        /// The offending column.
        column: String,
        /// The type reported by the catalog.
        existing: String,
        /// The type the incoming data needs.
        required: PgDataType,
    },

    /// The connection to the server is gone. The next write's liveness
    /// check triggers a reset.
    #[snafu(display("connection lost: {source}"))]
    ConnectionLost {
        /// The underlying driver error.
        source: sqlx::Error,
    },

    /// Any other driver error. Returned verbatim; the host retries the
    /// batch.
    #[snafu(display("unhandled sqlx error: {source}"))]
    Sqlx {
        /// The underlying driver error.
        source: sqlx::Error,
    },

    /// A point referenced a column the mapper never planned. Programming
    /// error, fails loudly.
    #[snafu(display("point in measurement {measurement} maps to unknown column {column}"))]
    UnmappedColumn {
        /// The measurement being written.
        measurement: String,
        /// The unplanned column name.
        column: String,
    },

    /// A result cell had a type the facade cannot decode.
    #[snafu(display("cannot decode result column {column} of type {db_type}"))]
    UnknownDbType {
        /// The result column name.
        column: String,
        /// The type reported by the driver.
        db_type: String,
    },

    /// The column-presence query did not report on every required column.
    #[snafu(display("column presence not discovered for all columns of table {table}"))]
    IncompleteColumnInfo {
        /// The table that was checked.
        table: String,
    },

    /// A tag-table statement returned something other than a tag id.
    #[snafu(display("tag table {table} returned no usable tag_id"))]
    InvalidTagId {
        /// The tag table queried.
        table: String,
    },

    /// `write` was called before `connect`.
    #[snafu(display("sink is not connected"))]
    NotConnected,
}

/// A specialized `Result` for sink errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classify a driver error by its SQLSTATE.
///
/// `42P01` becomes [`Error::MissingTable`], `42703` becomes
/// [`Error::MissingColumn`], I/O and pool failures become
/// [`Error::ConnectionLost`], anything else stays [`Error::Sqlx`].
pub fn decode_sqlx_error(e: sqlx::Error) -> Error {
    let code = match &e {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    };
    classify(code.as_deref(), e)
}

fn classify(code: Option<&str>, e: sqlx::Error) -> Error {
    match code {
        Some(PG_UNDEFINED_TABLE) => Error::MissingTable { source: e },
        Some(PG_UNDEFINED_COLUMN) => Error::MissingColumn { source: e },
        Some(_) => Error::Sqlx { source: e },
        None => match e {
            sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
                Error::ConnectionLost { source: e }
            }
            _ => Error::Sqlx { source: e },
        },
    }
}

/// The facade over the database driver.
///
/// All operations are logically synchronous from the caller's point of view:
/// each returns only once the statement is fully applied or failed.
#[async_trait]
pub trait Db: Debug + Send + Sync {
    /// Execute a statement and return the number of rows its command tag
    /// reports.
    async fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Run a query and return every row, dynamically decoded. The result
    /// set is fully drained before returning; nothing stays open.
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Bulk-insert `rows` into `table` via the COPY protocol. Every row
    /// must be aligned with `columns`.
    async fn copy_in(&self, table: &FullTableName, columns: &[String], rows: &[Row])
        -> Result<u64>;

    /// Cheap liveness probe: client-side connection state plus a trivial
    /// round-trip, so half-open connections are detected.
    async fn is_alive(&self) -> bool;

    /// Release the connection.
    async fn close(&self);
}

/// Builds fresh [`Db`] handles; the coordinator uses this to reconnect after
/// the liveness probe fails.
#[async_trait]
pub trait DbConnector: Debug + Send + Sync {
    /// Establish a new connection.
    async fn connect(&self) -> Result<Arc<dyn Db>>;
}
