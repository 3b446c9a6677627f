//! An in-memory implementation of the [`Db`] facade.
//!
//! `MemDb` records every statement it is handed and replays results queued
//! by the test. When a result queue is empty the operation succeeds with an
//! empty outcome, so tests only script the calls they care about.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::db::{Db, DbConnector, Error, Result, Row, SqlValue};
use crate::types::FullTableName;

/// One recorded `copy_in` invocation.
#[derive(Debug, Clone)]
pub struct CopyCall {
    /// The quoted full table name the copy targeted.
    pub table: String,
    /// The column list, in order.
    pub columns: Vec<String>,
    /// The rows handed to the copy.
    pub rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct State {
    exec_results: VecDeque<Result<u64>>,
    query_results: VecDeque<Result<Vec<Row>>>,
    copy_results: VecDeque<Result<u64>>,
    alive_responses: VecDeque<bool>,

    exec_log: Vec<(String, Vec<SqlValue>)>,
    query_log: Vec<(String, Vec<SqlValue>)>,
    copy_log: Vec<CopyCall>,
    alive_probes: usize,
    closed: bool,
}

/// A scriptable in-memory [`Db`].
#[derive(Debug, Default)]
pub struct MemDb {
    state: Mutex<State>,
}

impl MemDb {
    /// A fresh fake with empty logs and queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next unscripted `exec`.
    pub fn push_exec_result(&self, result: Result<u64>) {
        self.state.lock().exec_results.push_back(result);
    }

    /// Queue the result of the next unscripted `query`.
    pub fn push_query_result(&self, result: Result<Vec<Row>>) {
        self.state.lock().query_results.push_back(result);
    }

    /// Queue the result of the next unscripted `copy_in`.
    pub fn push_copy_result(&self, result: Result<u64>) {
        self.state.lock().copy_results.push_back(result);
    }

    /// Queue the response of the next liveness probe.
    pub fn push_alive_response(&self, alive: bool) {
        self.state.lock().alive_responses.push_back(alive);
    }

    /// Every statement handed to `exec`, in order.
    pub fn exec_log(&self) -> Vec<String> {
        self.state.lock().exec_log.iter().map(|(sql, _)| sql.clone()).collect()
    }

    /// Every statement handed to `query`, in order.
    pub fn query_log(&self) -> Vec<String> {
        self.state
            .lock()
            .query_log
            .iter()
            .map(|(sql, _)| sql.clone())
            .collect()
    }

    /// The parameters of the `query` call at `index`.
    pub fn query_params(&self, index: usize) -> Vec<SqlValue> {
        self.state.lock().query_log[index].1.clone()
    }

    /// Every `copy_in` call, in order.
    pub fn copy_calls(&self) -> Vec<CopyCall> {
        self.state.lock().copy_log.clone()
    }

    /// How many times the liveness probe ran.
    pub fn alive_probes(&self) -> usize {
        self.state.lock().alive_probes
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl Db for MemDb {
    async fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let mut state = self.state.lock();
        state.exec_log.push((sql.to_string(), params.to_vec()));
        state.exec_results.pop_front().unwrap_or(Ok(0))
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let mut state = self.state.lock();
        state.query_log.push((sql.to_string(), params.to_vec()));
        state.query_results.pop_front().unwrap_or_else(|| Ok(vec![]))
    }

    async fn copy_in(
        &self,
        table: &FullTableName,
        columns: &[String],
        rows: &[Row],
    ) -> Result<u64> {
        let mut state = self.state.lock();
        let row_count = rows.len() as u64;
        state.copy_log.push(CopyCall {
            table: table.to_string(),
            columns: columns.to_vec(),
            rows: rows.to_vec(),
        });
        state.copy_results.pop_front().unwrap_or(Ok(row_count))
    }

    async fn is_alive(&self) -> bool {
        let mut state = self.state.lock();
        state.alive_probes += 1;
        state.alive_responses.pop_front().unwrap_or(true)
    }

    async fn close(&self) {
        self.state.lock().closed = true;
    }
}

/// Hands out pre-built [`MemDb`] instances, for tests that exercise the
/// coordinator's reconnect path.
#[derive(Debug, Default)]
pub struct MemConnector {
    dbs: Mutex<VecDeque<Arc<MemDb>>>,
}

impl MemConnector {
    /// A connector with an empty queue; `connect` creates fresh fakes on
    /// demand.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a specific fake for the next `connect`.
    pub fn push_db(&self, db: Arc<MemDb>) {
        self.dbs.lock().push_back(db);
    }
}

#[async_trait]
impl DbConnector for MemConnector {
    async fn connect(&self) -> Result<Arc<dyn Db>> {
        let db: Arc<dyn Db> = self
            .dbs
            .lock()
            .pop_front()
            .unwrap_or_else(|| Arc::new(MemDb::new()));
        Ok(db)
    }
}

/// An injected "relation does not exist" failure.
pub fn missing_table_error() -> Error {
    Error::MissingTable {
        source: sqlx::Error::Protocol("injected: undefined table".into()),
    }
}

/// An injected "column does not exist" failure.
pub fn missing_column_error() -> Error {
    Error::MissingColumn {
        source: sqlx::Error::Protocol("injected: undefined column".into()),
    }
}
