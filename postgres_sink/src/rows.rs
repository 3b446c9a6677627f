//! Materializes one point into a column-aligned row vector.
//!
//! Pure except for the tag cache, which may reach the database to resolve a
//! surrogate id; those errors propagate to the write coordinator untouched.

use base64::Engine;
use data_types::{Field, FieldValue, Point, Tag};
use serde_json::{Map, Value};
use snafu::OptionExt;

use crate::columns::{FIELDS_JSON_COLUMN, TAGS_JSON_COLUMN};
use crate::db::{Db, Result, Row, SqlValue, UnmappedColumnSnafu};
use crate::tag_cache::TagCache;
use crate::types::TargetColumns;

/// Turns points into rows aligned with a [`TargetColumns`] plan.
#[derive(Debug, Clone, Copy)]
pub struct RowTransformer {
    tags_as_fk: bool,
    tags_as_json: bool,
    fields_as_json: bool,
}

impl RowTransformer {
    /// A transformer for the given storage modes.
    pub fn new(tags_as_fk: bool, tags_as_json: bool, fields_as_json: bool) -> Self {
        Self {
            tags_as_fk,
            tags_as_json,
            fields_as_json,
        }
    }

    /// Build the row for `point`, length-aligned with `cols` and pre-filled
    /// with NULLs. Columns the point has no value for stay NULL; a key the
    /// plan does not know is a programming error and fails loudly.
    pub async fn row(
        &self,
        db: &dyn Db,
        tag_cache: &mut TagCache,
        cols: &TargetColumns,
        point: &Point,
    ) -> Result<Row> {
        let mut row = vec![SqlValue::Null; cols.len()];
        row[0] = SqlValue::Timestamp(point.timestamp());

        if self.tags_as_fk {
            if let Some(tag_id) = tag_cache.tag_id(db, point).await? {
                row[1] = SqlValue::I32(tag_id);
            }
        } else if self.tags_as_json {
            if !point.tags().is_empty() {
                let index = self.index_of(cols, point, TAGS_JSON_COLUMN)?;
                row[index] = SqlValue::Jsonb(tags_to_json(point.tags()));
            }
        } else {
            for tag in point.tags() {
                let index = self.index_of(cols, point, &tag.key)?;
                row[index] = SqlValue::Text(tag.value.clone());
            }
        }

        if self.fields_as_json {
            let index = self.index_of(cols, point, FIELDS_JSON_COLUMN)?;
            row[index] = SqlValue::Jsonb(fields_to_json(point.fields()));
        } else {
            for field in point.fields() {
                let index = self.index_of(cols, point, &field.key)?;
                row[index] = SqlValue::from(&field.value);
            }
        }

        Ok(row)
    }

    fn index_of(&self, cols: &TargetColumns, point: &Point, key: &str) -> Result<usize> {
        cols.index_of(key).context(UnmappedColumnSnafu {
            measurement: point.measurement(),
            column: key,
        })
    }
}

/// The JSON document for a tag set: an object keyed by tag key. The
/// document is key-sorted, so equal tag sets serialize identically.
pub(crate) fn tags_to_json(tags: &[Tag]) -> Value {
    let mut doc = Map::new();
    for tag in tags {
        doc.insert(tag.key.clone(), Value::String(tag.value.clone()));
    }
    Value::Object(doc)
}

/// The JSON document for a field set. Values keep their runtime kind;
/// binary values are base64 encoded since JSON has no byte-string type.
pub(crate) fn fields_to_json(fields: &[Field]) -> Value {
    let mut doc = Map::new();
    for field in fields {
        let value = match &field.value {
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::I64(i) => Value::from(*i),
            FieldValue::F64(f) => Value::from(*f),
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Bytes(b) => {
                Value::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
        };
        doc.insert(field.key.clone(), value);
    }
    Value::Object(doc)
}
