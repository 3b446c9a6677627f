//! Table existence, creation and additive migration.
//!
//! Nothing here caches what the database looks like: every check is a fresh
//! catalog round-trip, so concurrent writers that mutate schema out-of-band
//! stay correct at the cost of one extra query per batch.

use std::collections::HashMap;

use snafu::ensure;
use tracing::{debug, info, warn};

use crate::db::{
    Db, IncompleteColumnInfoSnafu, Result, SchemaMismatchSnafu, SqlValue,
};
use crate::types::{
    long_to_short_pg_type, quote_ident, quote_literal, ColumnRole, FullTableName, TargetColumns,
};

/// The measurement-table template used when the configuration does not
/// provide one.
pub const DEFAULT_TABLE_TEMPLATE: &str = "CREATE TABLE IF NOT EXISTS {TABLE}({COLUMNS})";

const TAG_TABLE_TEMPLATE: &str =
    r#"CREATE TABLE IF NOT EXISTS {TABLE}({COLUMNS}, PRIMARY KEY("tag_id"))"#;

const ADD_COLUMN_TEMPLATE: &str = "ALTER TABLE {TABLE} ADD COLUMN IF NOT EXISTS {COLUMN} {TYPE}";

const TABLE_EXISTS_QUERY: &str =
    "SELECT tablename FROM pg_tables WHERE tablename = $1 AND schemaname = $2";

// Joins the required column list against the catalog in one round-trip,
// reporting presence and the catalog type for each required column.
const COLUMN_PRESENCE_TEMPLATE: &str = "WITH available AS (SELECT column_name::text AS column_name, data_type::text AS data_type FROM information_schema.columns WHERE table_schema = $1 AND table_name = $2), required AS (SELECT c FROM unnest(array[{COLUMN_LITERALS}]) AS c) SELECT required.c AS column_name, available.column_name IS NOT NULL AS \"exists\", available.data_type FROM required LEFT JOIN available ON required.c = available.column_name";

/// Checks and updates the state of tables in the database.
#[derive(Debug)]
pub struct TableManager {
    schema: String,
    table_template: String,
}

impl TableManager {
    /// A manager creating tables in `schema` with the given measurement
    /// template.
    pub fn new(schema: impl Into<String>, table_template: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table_template: table_template.into(),
        }
    }

    /// Whether `table` is present in the configured schema.
    ///
    /// Errors are logged and reported as "absent"; the create that follows
    /// will surface whatever is actually wrong.
    pub async fn exists(&self, db: &dyn Db, table: &str) -> bool {
        let params = [
            SqlValue::Text(table.to_string()),
            SqlValue::Text(self.schema.clone()),
        ];
        match db.exec(TABLE_EXISTS_QUERY, &params).await {
            Ok(n) => n == 1,
            Err(e) => {
                warn!(table, error = %e, "could not check for table existence");
                false
            }
        }
    }

    /// Create `table` with the columns in `cols`.
    ///
    /// The statement is built from the measurement template (or the fixed
    /// tag-table template) and carries `IF NOT EXISTS`, so two sinks racing
    /// to create the same table both succeed.
    pub async fn create_table(
        &self,
        db: &dyn Db,
        table: &str,
        cols: &TargetColumns,
        tag_table: bool,
    ) -> Result<()> {
        let sql = if tag_table {
            self.render_create(TAG_TABLE_TEMPLATE, table, cols)
        } else {
            self.render_create(&self.table_template, table, cols)
        };
        info!(table, %sql, "creating table");
        db.exec(&sql, &[]).await?;
        Ok(())
    }

    /// Compare `cols` against the live table definition.
    ///
    /// Returns the indices (into `cols`) of columns the table lacks, in
    /// input order. An existing column whose catalog type cannot contain
    /// the required type is fatal and reported as
    /// [`SchemaMismatch`](crate::db::Error::SchemaMismatch); the sink never
    /// attempts that alteration.
    pub async fn find_column_mismatch(
        &self,
        db: &dyn Db,
        table: &str,
        cols: &TargetColumns,
    ) -> Result<Vec<usize>> {
        let presence = self.column_presence(db, table, &cols.names).await?;
        ensure!(
            presence.len() == cols.names.len(),
            IncompleteColumnInfoSnafu { table }
        );

        let mut missing = Vec::new();
        for (index, name) in cols.names.iter().enumerate() {
            let (exists, catalog_type) = presence
                .get(name)
                .ok_or_else(|| IncompleteColumnInfoSnafu { table }.build())?;
            if !exists {
                missing.push(index);
                continue;
            }

            let required = cols.data_types[index];
            let existing = catalog_type.as_deref().unwrap_or("");
            let compatible = long_to_short_pg_type(existing)
                .map(|t| t.can_contain(required))
                .unwrap_or(false);
            ensure!(
                compatible,
                SchemaMismatchSnafu {
                    table,
                    column: name,
                    existing,
                    required,
                }
            );
        }

        debug!(table, missing = missing.len(), "column mismatch discovery");
        Ok(missing)
    }

    /// Add the columns at `indices` to `table`.
    ///
    /// One `ALTER TABLE … ADD COLUMN IF NOT EXISTS` per column; a partial
    /// failure leaves the table in a valid state for the next attempt.
    pub async fn add_columns(
        &self,
        db: &dyn Db,
        table: &str,
        indices: &[usize],
        cols: &TargetColumns,
    ) -> Result<()> {
        let full_name = self.full_name(table).to_string();
        for &index in indices {
            let sql = ADD_COLUMN_TEMPLATE
                .replace("{TABLE}", &full_name)
                .replace("{COLUMN}", &quote_ident(&cols.names[index]))
                .replace("{TYPE}", cols.data_types[index].as_str());
            info!(table, column = %cols.names[index], "adding missing column");
            db.exec(&sql, &[]).await?;
        }
        Ok(())
    }

    /// The schema-qualified name of `table`.
    pub fn full_name(&self, table: &str) -> FullTableName {
        FullTableName::new(&self.schema, table)
    }

    fn render_create(&self, template: &str, table: &str, cols: &TargetColumns) -> String {
        let mut defs = Vec::with_capacity(cols.len());
        let mut key_columns = Vec::new();
        for (index, name) in cols.names.iter().enumerate() {
            defs.push(format!(
                "{} {}",
                quote_ident(name),
                cols.data_types[index].as_str()
            ));
            if cols.roles[index] != ColumnRole::Field {
                key_columns.push(quote_ident(name));
            }
        }

        let full_name = self.full_name(table).to_string();
        template
            .replace("{TABLE}", &full_name)
            .replace("{TABLELITERAL}", &quote_literal(&full_name))
            .replace("{COLUMNS}", &defs.join(","))
            .replace("{KEY_COLUMNS}", &key_columns.join(","))
    }

    async fn column_presence(
        &self,
        db: &dyn Db,
        table: &str,
        names: &[String],
    ) -> Result<HashMap<String, (bool, Option<String>)>> {
        let literals = names
            .iter()
            .map(|n| quote_literal(n))
            .collect::<Vec<_>>()
            .join(",");
        let sql = COLUMN_PRESENCE_TEMPLATE.replace("{COLUMN_LITERALS}", &literals);
        let params = [
            SqlValue::Text(self.schema.clone()),
            SqlValue::Text(table.to_string()),
        ];

        let rows = db.query(&sql, &params).await?;
        let mut presence = HashMap::with_capacity(rows.len());
        for row in rows {
            let mut cells = row.into_iter();
            let (name, exists, data_type) = match (cells.next(), cells.next(), cells.next()) {
                (
                    Some(SqlValue::Text(name)),
                    Some(SqlValue::Bool(exists)),
                    Some(data_type),
                ) => {
                    let data_type = match data_type {
                        SqlValue::Text(t) => Some(t),
                        _ => None,
                    };
                    (name, exists, data_type)
                }
                _ => return IncompleteColumnInfoSnafu { table }.fail(),
            };
            presence.insert(name, (exists, data_type));
        }
        Ok(presence)
    }
}
