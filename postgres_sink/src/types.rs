//! The data-type lattice, column plan and SQL identifier utilities.
//!
//! Every string that ends up inside a SQL statement as a name or a literal
//! must flow through [`quote_ident`] or [`quote_literal`]. No other code
//! path may concatenate user-controlled strings into SQL.

use std::collections::HashMap;
use std::fmt::{self, Display};

use data_types::FieldValue;

/// The Postgres data types the sink knows how to create and reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum PgDataType {
    Timestamptz,
    Int4,
    Int8,
    Float8,
    Bool,
    Text,
    Bytea,
    Jsonb,
    Serial,
}

impl PgDataType {
    /// The spelling used in DDL statements.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timestamptz => "timestamptz",
            Self::Int4 => "int4",
            Self::Int8 => "int8",
            Self::Float8 => "float8",
            Self::Bool => "bool",
            Self::Text => "text",
            Self::Bytea => "bytea",
            Self::Jsonb => "jsonb",
            Self::Serial => "serial",
        }
    }

    /// Whether a column of type `self` can hold values of type `required`
    /// without loss.
    ///
    /// This is the partial order the schema checks rely on to accept a wider
    /// existing column than strictly necessary. Widening in the other
    /// direction is a schema alteration the sink never attempts.
    pub fn can_contain(self, required: Self) -> bool {
        self == required
            || matches!(
                (self, required),
                (Self::Int8, Self::Int4)
                    | (Self::Int8, Self::Serial)
                    | (Self::Int4, Self::Serial)
                    | (Self::Float8, Self::Int4)
            )
    }
}

impl Display for PgDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a catalog-reported type name (`information_schema` uses the
/// verbose SQL standard spellings) to the lattice.
///
/// Returns `None` for types the sink does not understand; an existing column
/// of an unknown type can never satisfy a schema check.
pub fn long_to_short_pg_type(catalog: &str) -> Option<PgDataType> {
    match catalog {
        "timestamp with time zone" => Some(PgDataType::Timestamptz),
        "integer" => Some(PgDataType::Int4),
        "bigint" => Some(PgDataType::Int8),
        "double precision" => Some(PgDataType::Float8),
        "boolean" => Some(PgDataType::Bool),
        "text" | "character varying" => Some(PgDataType::Text),
        "bytea" => Some(PgDataType::Bytea),
        "jsonb" => Some(PgDataType::Jsonb),
        _ => None,
    }
}

/// Map a field value to the column type its first observation creates.
pub fn derive_data_type(value: &FieldValue) -> PgDataType {
    match value {
        FieldValue::Bool(_) => PgDataType::Bool,
        FieldValue::I64(_) => PgDataType::Int8,
        FieldValue::F64(_) => PgDataType::Float8,
        FieldValue::Text(_) => PgDataType::Text,
        FieldValue::Bytes(_) => PgDataType::Bytea,
    }
}

/// Quote `s` as a SQL identifier: embedded double quotes are doubled and the
/// result is wrapped in double quotes.
pub fn quote_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Quote `s` as a SQL string literal: embedded single quotes are doubled and
/// the result is wrapped in single quotes.
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// A schema-qualified table name.
///
/// Displays as the fully quoted compound identifier, e.g.
/// `"public"."cpu"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullTableName {
    schema: String,
    table: String,
}

impl FullTableName {
    /// Compose a full name from a schema and a bare table name.
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// The bare (unquoted) table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// The bare (unquoted) schema name.
    pub fn schema(&self) -> &str {
        &self.schema
    }
}

impl Display for FullTableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}",
            quote_ident(&self.schema),
            quote_ident(&self.table)
        )
    }
}

/// The role a column plays in a measurement table. Any non-[`Field`] role
/// participates in the table's key columns when the create template asks for
/// them.
///
/// [`Field`]: ColumnRole::Field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ColumnRole {
    Time,
    TagsId,
    Tag,
    Field,
}

/// The column plan for one table: parallel vectors of names, data types and
/// roles, plus a name → index lookup used during row materialization.
///
/// Invariants: the three vectors have equal length; `target` is a bijection
/// with `0..names.len()`; exactly one column has role [`ColumnRole::Time`]
/// in a main-table plan and at most one has role [`ColumnRole::TagsId`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetColumns {
    /// Column names, sanitized for DDL by the consumer via [`quote_ident`].
    pub names: Vec<String>,
    /// The data type of each column.
    pub data_types: Vec<PgDataType>,
    /// The role of each column.
    pub roles: Vec<ColumnRole>,
    /// Column name → position in `names`.
    pub target: HashMap<String, usize>,
}

impl TargetColumns {
    /// Append a column, keeping `target` consistent.
    ///
    /// # Panics
    ///
    /// If a column with the same name is already present; callers dedup
    /// before pushing.
    pub fn push(&mut self, name: impl Into<String>, data_type: PgDataType, role: ColumnRole) {
        let name = name.into();
        let previous = self.target.insert(name.clone(), self.names.len());
        assert!(previous.is_none(), "duplicate column {name:?}");
        self.names.push(name);
        self.data_types.push(data_type);
        self.roles.push(role);
    }

    /// Number of columns in the plan.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the plan is empty.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Position of `name` in the plan, if mapped.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.target.get(name).copied()
    }

    /// Whether `name` is already part of the plan.
    pub fn contains(&self, name: &str) -> bool {
        self.target.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_idents() {
        assert_eq!(quote_ident("cpu"), r#""cpu""#);
        assert_eq!(quote_ident("select"), r#""select""#);
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
        // Backslashes are not special inside a quoted identifier.
        assert_eq!(quote_ident(r"back\slash"), r#""back\slash""#);
        assert_eq!(quote_ident("tag name"), r#""tag name""#);
    }

    #[test]
    fn quotes_literals() {
        assert_eq!(quote_literal("v"), "'v'");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_literal(r"a\b"), r"'a\b'");
    }

    #[test]
    fn full_table_name_quotes_both_parts() {
        let name = FullTableName::new("public", "cpu metrics");
        assert_eq!(name.to_string(), r#""public"."cpu metrics""#);
        assert_eq!(name.table(), "cpu metrics");
    }

    #[test]
    fn type_containment_is_a_partial_order() {
        use PgDataType::*;

        for t in [Timestamptz, Int4, Int8, Float8, Bool, Text, Bytea, Jsonb, Serial] {
            assert!(t.can_contain(t));
        }

        assert!(Int8.can_contain(Int4));
        assert!(Float8.can_contain(Int4));
        assert!(Int4.can_contain(Serial));
        assert!(Int8.can_contain(Serial));

        // No widening in the other direction.
        assert!(!Int4.can_contain(Int8));
        assert!(!Int4.can_contain(Float8));
        assert!(!Float8.can_contain(Int8));
        assert!(!Text.can_contain(Float8));
        assert!(!Text.can_contain(Jsonb));
    }

    #[test]
    fn normalizes_catalog_type_names() {
        assert_eq!(
            long_to_short_pg_type("timestamp with time zone"),
            Some(PgDataType::Timestamptz)
        );
        assert_eq!(long_to_short_pg_type("integer"), Some(PgDataType::Int4));
        assert_eq!(long_to_short_pg_type("bigint"), Some(PgDataType::Int8));
        assert_eq!(
            long_to_short_pg_type("double precision"),
            Some(PgDataType::Float8)
        );
        assert_eq!(
            long_to_short_pg_type("character varying"),
            Some(PgDataType::Text)
        );
        assert_eq!(long_to_short_pg_type("interval"), None);
    }

    #[test]
    fn derives_types_from_field_values() {
        assert_eq!(
            derive_data_type(&FieldValue::Bool(true)),
            PgDataType::Bool
        );
        assert_eq!(derive_data_type(&FieldValue::I64(3)), PgDataType::Int8);
        assert_eq!(derive_data_type(&FieldValue::F64(0.5)), PgDataType::Float8);
        assert_eq!(
            derive_data_type(&FieldValue::Text("x".into())),
            PgDataType::Text
        );
        assert_eq!(
            derive_data_type(&FieldValue::Bytes(vec![0])),
            PgDataType::Bytea
        );
    }

    #[test]
    fn target_columns_keep_the_bijection() {
        let mut cols = TargetColumns::default();
        cols.push("time", PgDataType::Timestamptz, ColumnRole::Time);
        cols.push("host", PgDataType::Text, ColumnRole::Tag);
        cols.push("load", PgDataType::Float8, ColumnRole::Field);

        assert_eq!(cols.len(), 3);
        assert_eq!(cols.index_of("host"), Some(1));
        assert_eq!(cols.index_of("missing"), None);
        assert!(cols.contains("load"));
    }

    #[test]
    #[should_panic(expected = "duplicate column")]
    fn target_columns_reject_duplicates() {
        let mut cols = TargetColumns::default();
        cols.push("time", PgDataType::Timestamptz, ColumnRole::Time);
        cols.push("time", PgDataType::Timestamptz, ColumnRole::Time);
    }
}
