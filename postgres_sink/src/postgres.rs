//! A Postgres backed implementation of the [`Db`] facade.

use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Pool, Postgres, Row as _, TypeInfo};
use tracing::{debug, info};

use crate::db::{
    decode_sqlx_error, Db, DbConnector, Result, Row, SqlValue, UnknownDbTypeSnafu,
};
use crate::types::{quote_ident, FullTableName};

const MAX_CONNECTIONS: u32 = 5;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const IDLE_TIMEOUT: Duration = Duration::from_secs(500);
const APP_NAME: &str = "postgres_sink";

const CHECK_CONN_QUERY: &str = "SELECT 1";

/// Flush the COPY payload to the server in chunks of roughly this size.
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// The production [`Db`] implementation, backed by a sqlx connection pool.
#[derive(Debug)]
pub struct PgDb {
    pool: Pool<Postgres>,
}

impl PgDb {
    /// Connect to the server described by `dsn`.
    ///
    /// Connection-string parsing is delegated to the driver, which also
    /// honors the standard libpq environment variables for fields the
    /// string leaves out.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let options = PgConnectOptions::from_str(dsn)
            .map_err(decode_sqlx_error)?
            .application_name(APP_NAME);

        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(CONNECT_TIMEOUT)
            .idle_timeout(IDLE_TIMEOUT)
            .test_before_acquire(true)
            .connect_with(options)
            .await
            .map_err(decode_sqlx_error)?;

        info!(application_name = APP_NAME, "connected to postgres");

        Ok(Self { pool })
    }
}

#[async_trait]
impl Db for PgDb {
    async fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        debug!(%sql, "exec");
        let result = bind_params(sqlx::query(sql), params)
            .execute(&self.pool)
            .await
            .map_err(decode_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        debug!(%sql, "query");
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await
            .map_err(decode_sqlx_error)?;
        rows.iter().map(decode_row).collect()
    }

    async fn copy_in(
        &self,
        table: &FullTableName,
        columns: &[String],
        rows: &[Row],
    ) -> Result<u64> {
        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(",");
        let stmt = format!("COPY {table} ({column_list}) FROM STDIN");
        debug!(%stmt, rows = rows.len(), "copy");

        let mut conn = self.pool.acquire().await.map_err(decode_sqlx_error)?;
        let mut copy = conn.copy_in_raw(&stmt).await.map_err(decode_sqlx_error)?;

        let mut buf = String::with_capacity(COPY_BUFFER_SIZE);
        for row in rows {
            encode_copy_row(&mut buf, row);
            if buf.len() >= COPY_BUFFER_SIZE {
                copy.send(buf.as_bytes()).await.map_err(decode_sqlx_error)?;
                buf.clear();
            }
        }
        if !buf.is_empty() {
            copy.send(buf.as_bytes()).await.map_err(decode_sqlx_error)?;
        }

        copy.finish().await.map_err(decode_sqlx_error)
    }

    async fn is_alive(&self) -> bool {
        if self.pool.is_closed() {
            return false;
        }
        sqlx::query(CHECK_CONN_QUERY)
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Builds [`PgDb`] handles from a configured connection string.
#[derive(Debug)]
pub struct PgConnector {
    dsn: String,
}

impl PgConnector {
    /// A connector for `dsn`.
    pub fn new(dsn: impl Into<String>) -> Self {
        Self { dsn: dsn.into() }
    }
}

#[async_trait]
impl DbConnector for PgConnector {
    async fn connect(&self) -> Result<Arc<dyn Db>> {
        Ok(Arc::new(PgDb::connect(&self.dsn).await?))
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &[SqlValue],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::I32(v) => query.bind(*v),
            SqlValue::I64(v) => query.bind(*v),
            SqlValue::F64(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.clone()),
            SqlValue::Bytes(v) => query.bind(v.clone()),
            SqlValue::Timestamp(v) => query.bind(*v),
            SqlValue::Jsonb(v) => query.bind(v.clone()),
        };
    }
    query
}

fn decode_row(row: &PgRow) -> Result<Row> {
    row.columns()
        .iter()
        .map(|column| {
            let idx = column.ordinal();
            let decoded = match column.type_info().name() {
                "BOOL" => row
                    .try_get::<Option<bool>, _>(idx)
                    .map(|v| v.map(SqlValue::Bool)),
                "INT2" => row
                    .try_get::<Option<i16>, _>(idx)
                    .map(|v| v.map(|v| SqlValue::I32(v.into()))),
                "INT4" => row
                    .try_get::<Option<i32>, _>(idx)
                    .map(|v| v.map(SqlValue::I32)),
                "INT8" => row
                    .try_get::<Option<i64>, _>(idx)
                    .map(|v| v.map(SqlValue::I64)),
                "FLOAT4" => row
                    .try_get::<Option<f32>, _>(idx)
                    .map(|v| v.map(|v| SqlValue::F64(v.into()))),
                "FLOAT8" => row
                    .try_get::<Option<f64>, _>(idx)
                    .map(|v| v.map(SqlValue::F64)),
                "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => row
                    .try_get::<Option<String>, _>(idx)
                    .map(|v| v.map(SqlValue::Text)),
                "TIMESTAMPTZ" => row
                    .try_get::<Option<DateTime<Utc>>, _>(idx)
                    .map(|v| v.map(SqlValue::Timestamp)),
                "JSON" | "JSONB" => row
                    .try_get::<Option<serde_json::Value>, _>(idx)
                    .map(|v| v.map(SqlValue::Jsonb)),
                "BYTEA" => row
                    .try_get::<Option<Vec<u8>>, _>(idx)
                    .map(|v| v.map(SqlValue::Bytes)),
                other => {
                    return UnknownDbTypeSnafu {
                        column: column.name(),
                        db_type: other,
                    }
                    .fail()
                }
            };
            decoded
                .map(|v| v.unwrap_or(SqlValue::Null))
                .map_err(decode_sqlx_error)
        })
        .collect()
}

/// Append one row in the text representation COPY expects: tab separated
/// columns, newline terminated, `\N` for NULL.
fn encode_copy_row(buf: &mut String, row: &Row) {
    for (i, value) in row.iter().enumerate() {
        if i > 0 {
            buf.push('\t');
        }
        encode_copy_value(buf, value);
    }
    buf.push('\n');
}

fn encode_copy_value(buf: &mut String, value: &SqlValue) {
    match value {
        SqlValue::Null => buf.push_str(r"\N"),
        SqlValue::Bool(true) => buf.push('t'),
        SqlValue::Bool(false) => buf.push('f'),
        SqlValue::I32(v) => {
            let _ = write!(buf, "{v}");
        }
        SqlValue::I64(v) => {
            let _ = write!(buf, "{v}");
        }
        SqlValue::F64(v) => encode_copy_float(buf, *v),
        SqlValue::Text(s) => push_escaped(buf, s),
        SqlValue::Bytes(b) => {
            // Escaped form of the hex bytea input syntax: `\x` with the
            // backslash itself escaped for the COPY text format.
            buf.push_str(r"\\x");
            for byte in b {
                let _ = write!(buf, "{byte:02x}");
            }
        }
        // Postgres keeps microsecond resolution; everything below is
        // truncated here rather than rounded server-side.
        SqlValue::Timestamp(t) => {
            let _ = write!(buf, "{}", t.format("%Y-%m-%d %H:%M:%S%.6f+00"));
        }
        SqlValue::Jsonb(j) => push_escaped(buf, &j.to_string()),
    }
}

fn encode_copy_float(buf: &mut String, v: f64) {
    if v.is_nan() {
        buf.push_str("NaN");
    } else if v == f64::INFINITY {
        buf.push_str("Infinity");
    } else if v == f64::NEG_INFINITY {
        buf.push_str("-Infinity");
    } else {
        let _ = write!(buf, "{v}");
    }
}

fn push_escaped(buf: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '\\' => buf.push_str(r"\\"),
            '\t' => buf.push_str(r"\t"),
            '\n' => buf.push_str(r"\n"),
            '\r' => buf.push_str(r"\r"),
            _ => buf.push(c),
        }
    }
}
