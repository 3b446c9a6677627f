//! The sink coordinator: the top-level write path and its recovery loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use data_types::Point;
use tracing::{info, warn};

use crate::columns::ColumnMapper;
use crate::config::SinkConfig;
use crate::db::{Db, DbConnector, Error, NotConnectedSnafu, Result};
use crate::postgres::PgConnector;
use crate::rows::RowTransformer;
use crate::schema::TableManager;
use crate::tag_cache::TagCache;
use crate::types::TargetColumns;

/// Writes batches of points into per-measurement tables, creating and
/// evolving their schemas from the data as needed.
///
/// A write runs sequentially: liveness check (reconnecting if necessary),
/// group points by measurement, then for each group derive the column plan,
/// ensure the schema, materialize rows and bulk copy. A recoverable copy
/// failure gets exactly one structured repair pass; there is no second
/// attempt, which bounds the amortized cost of a poison batch.
#[derive(Debug)]
pub struct PostgresSink {
    config: SinkConfig,
    connector: Arc<dyn DbConnector>,
    db: Option<Arc<dyn Db>>,
    tables: TableManager,
    columns: ColumnMapper,
    rows: RowTransformer,
    tag_cache: TagCache,
}

impl PostgresSink {
    /// A sink talking to the server named by `config.connection`.
    pub fn new(config: SinkConfig) -> Self {
        let connector = Arc::new(PgConnector::new(config.connection.clone()));
        Self::with_connector(config, connector)
    }

    /// A sink using `connector` to obtain connections; this is how tests
    /// inject a fake database.
    pub fn with_connector(config: SinkConfig, connector: Arc<dyn DbConnector>) -> Self {
        let tables = TableManager::new(config.schema.clone(), config.table_template.clone());
        let columns = ColumnMapper::new(
            config.tags_as_foreignkeys,
            config.tags_as_jsonb,
            config.fields_as_jsonb,
        );
        let rows = RowTransformer::new(
            config.tags_as_foreignkeys,
            config.tags_as_jsonb,
            config.fields_as_jsonb,
        );
        let tag_cache = TagCache::new(
            config.schema.clone(),
            config.tag_table_suffix.clone(),
            config.tags_as_jsonb,
            config.cached_tagsets_per_measurement,
        );

        Self {
            config,
            connector,
            db: None,
            tables,
            columns,
            rows,
            tag_cache,
        }
    }

    /// One-line description of what the sink does.
    pub fn description() -> &'static str {
        "Send time-series points to PostgreSQL"
    }

    /// Establish the database connection.
    pub async fn connect(&mut self) -> Result<()> {
        self.db = Some(self.connector.connect().await?);
        info!("sink connected");
        Ok(())
    }

    /// Release the database connection.
    pub async fn close(&mut self) {
        if let Some(db) = self.db.take() {
            db.close().await;
        }
    }

    /// Persist `points`, returning once everything is written or the first
    /// unrecovered error is hit. Side effects up to that error stay in
    /// place; the host treats the whole batch as unpersisted and retries.
    pub async fn write(&mut self, points: &[Point]) -> Result<()> {
        if !self.db()?.is_alive().await {
            self.reset_connection().await?;
        }
        let db = self.db()?;

        for (measurement, group) in group_by_measurement(points) {
            self.write_measurement(db.as_ref(), measurement, &group)
                .await?;
        }
        Ok(())
    }

    async fn write_measurement(
        &mut self,
        db: &dyn Db,
        measurement: &str,
        points: &[&Point],
    ) -> Result<()> {
        let (main_cols, tag_cols) = self.columns.target(points);

        if self.config.do_schema_updates {
            self.prepare_measurement(db, measurement, &main_cols, tag_cols.as_ref())
                .await?;
        }

        match self.copy_points(db, measurement, &main_cols, points).await {
            Ok(()) => Ok(()),
            Err(error) if self.config.do_schema_updates => {
                self.recover(db, measurement, &main_cols, tag_cols.as_ref(), error)
                    .await?;
                self.copy_points(db, measurement, &main_cols, points).await
            }
            Err(error) => Err(error),
        }
    }

    /// Bring both tables of `measurement` in line with the column plans.
    async fn prepare_measurement(
        &self,
        db: &dyn Db,
        measurement: &str,
        main_cols: &TargetColumns,
        tag_cols: Option<&TargetColumns>,
    ) -> Result<()> {
        self.prepare_table(db, measurement, main_cols, false).await?;
        if let Some(tag_cols) = tag_cols {
            self.prepare_table(db, &self.tag_table_name(measurement), tag_cols, true)
                .await?;
        }
        Ok(())
    }

    async fn prepare_table(
        &self,
        db: &dyn Db,
        table: &str,
        cols: &TargetColumns,
        tag_table: bool,
    ) -> Result<()> {
        if !self.tables.exists(db, table).await {
            return self.tables.create_table(db, table, cols, tag_table).await;
        }
        let missing = self.tables.find_column_mismatch(db, table, cols).await?;
        if missing.is_empty() {
            return Ok(());
        }
        self.tables.add_columns(db, table, &missing, cols).await
    }

    async fn copy_points(
        &mut self,
        db: &dyn Db,
        measurement: &str,
        main_cols: &TargetColumns,
        points: &[&Point],
    ) -> Result<()> {
        let mut rows = Vec::with_capacity(points.len());
        for point in points {
            rows.push(
                self.rows
                    .row(db, &mut self.tag_cache, main_cols, point)
                    .await?,
            );
        }

        let table = self.tables.full_name(measurement);
        db.copy_in(&table, &main_cols.names, &rows).await?;
        Ok(())
    }

    /// The single repair pass: create missing tables or add missing columns
    /// for the classified error, anything else is final. The caller
    /// re-copies exactly once afterwards.
    async fn recover(
        &self,
        db: &dyn Db,
        measurement: &str,
        main_cols: &TargetColumns,
        tag_cols: Option<&TargetColumns>,
        error: Error,
    ) -> Result<()> {
        match &error {
            Error::MissingTable { .. } => {
                warn!(measurement, error = %error, "write failed, creating missing tables");
                self.prepare_measurement(db, measurement, main_cols, tag_cols)
                    .await
            }
            Error::MissingColumn { .. } => {
                warn!(measurement, error = %error, "write failed, adding missing columns");
                self.repair_columns(db, measurement, main_cols).await?;
                if let Some(tag_cols) = tag_cols {
                    self.repair_columns(db, &self.tag_table_name(measurement), tag_cols)
                        .await?;
                }
                Ok(())
            }
            _ => Err(error),
        }
    }

    async fn repair_columns(&self, db: &dyn Db, table: &str, cols: &TargetColumns) -> Result<()> {
        let missing = self.tables.find_column_mismatch(db, table, cols).await?;
        if !missing.is_empty() {
            self.tables.add_columns(db, table, &missing, cols).await?;
        }
        Ok(())
    }

    /// Discard the current connection, build a fresh one and drop every
    /// cached tag id; surrogate ids are only valid against a consistent
    /// view of the tag tables.
    async fn reset_connection(&mut self) -> Result<()> {
        warn!("database connection is gone, reconnecting");
        if let Some(db) = self.db.take() {
            db.close().await;
        }
        self.db = Some(self.connector.connect().await?);
        self.tag_cache.clear();
        Ok(())
    }

    fn db(&self) -> Result<Arc<dyn Db>> {
        match &self.db {
            Some(db) => Ok(Arc::clone(db)),
            None => NotConnectedSnafu.fail(),
        }
    }

    fn tag_table_name(&self, measurement: &str) -> String {
        format!("{measurement}{}", self.config.tag_table_suffix)
    }
}

fn group_by_measurement(points: &[Point]) -> BTreeMap<&str, Vec<&Point>> {
    let mut groups: BTreeMap<&str, Vec<&Point>> = BTreeMap::new();
    for point in points {
        groups.entry(point.measurement()).or_default().push(point);
    }
    groups
}
