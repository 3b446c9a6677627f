//! The per-measurement cache mapping a tag set to its surrogate id.
//!
//! Only active in foreign-key mode. Entries live for the process lifetime
//! bounded by LRU eviction; a connection reset clears everything because
//! surrogate ids are only meaningful relative to a consistent view of the
//! tag table.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use data_types::{Point, Tag};
use lru::LruCache;
use tracing::debug;

use crate::db::{Db, InvalidTagIdSnafu, Result, SqlValue};
use crate::columns::TAGS_JSON_COLUMN;
use crate::rows::tags_to_json;
use crate::types::{quote_ident, FullTableName};

/// Joins the sorted `key=value` pairs of a canonical cache key. Cannot
/// appear in a tag key.
const KEY_DELIMITER: char = '\u{1f}';

/// Canonical serialization of a tag set: pairs sorted by key, each emitted
/// as `key=value`, joined by [`KEY_DELIMITER`]. Equal tag sets always
/// produce equal keys.
pub(crate) fn canonical_tag_key(tags: &[Tag]) -> String {
    let mut pairs: Vec<&Tag> = tags.iter().collect();
    pairs.sort_by(|a, b| a.key.cmp(&b.key));
    let mut out = String::new();
    for (i, tag) in pairs.iter().enumerate() {
        if i > 0 {
            out.push(KEY_DELIMITER);
        }
        out.push_str(&tag.key);
        out.push('=');
        out.push_str(&tag.value);
    }
    out
}

/// Bounded per-measurement map from canonical tag set to surrogate id, with
/// a database-backed upsert on miss.
#[derive(Debug)]
pub struct TagCache {
    per_measurement: HashMap<String, LruCache<String, i32>>,
    /// Entries kept per measurement; `0` means unbounded.
    limit: usize,
    schema: String,
    tag_table_suffix: String,
    tags_as_json: bool,
}

impl TagCache {
    /// A cache for tag tables in `schema` named with `tag_table_suffix`.
    pub fn new(
        schema: impl Into<String>,
        tag_table_suffix: impl Into<String>,
        tags_as_json: bool,
        limit: usize,
    ) -> Self {
        Self {
            per_measurement: HashMap::new(),
            limit,
            schema: schema.into(),
            tag_table_suffix: tag_table_suffix.into(),
            tags_as_json,
        }
    }

    /// Drop every cached entry, for all measurements.
    pub fn clear(&mut self) {
        self.per_measurement.clear();
    }

    /// Number of entries cached for `measurement`.
    pub fn len(&self, measurement: &str) -> usize {
        self.per_measurement
            .get(measurement)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// The surrogate id for this point's tag set, or `None` when the point
    /// carries no tags (an untagged point keeps a NULL `tag_id`).
    ///
    /// Resolution order: cache, tag-table SELECT, tag-table INSERT with
    /// `RETURNING`. Database errors propagate untouched so the write
    /// coordinator's single recovery pass can classify them.
    pub async fn tag_id(&mut self, db: &dyn Db, point: &Point) -> Result<Option<i32>> {
        if point.tags().is_empty() {
            return Ok(None);
        }

        let measurement = point.measurement();
        let cache_key = canonical_tag_key(point.tags());
        if let Some(cache) = self.per_measurement.get_mut(measurement) {
            if let Some(&id) = cache.get(&cache_key) {
                return Ok(Some(id));
            }
        }

        let table = format!("{measurement}{}", self.tag_table_suffix);
        let full_name = FullTableName::new(&self.schema, &table);
        let (where_columns, params) = self.tag_predicates(point.tags());

        let select = format!(
            "SELECT tag_id FROM {full_name} WHERE {}",
            where_columns
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{} = ${}", quote_ident(c), i + 1))
                .collect::<Vec<_>>()
                .join(" AND ")
        );
        let rows = db.query(&select, &params).await?;
        if let Some(row) = rows.first() {
            let id = extract_tag_id(row, &table)?;
            self.insert(measurement, cache_key, id);
            return Ok(Some(id));
        }

        let insert = format!(
            "INSERT INTO {full_name}({}) VALUES({}) RETURNING tag_id",
            where_columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(","),
            (1..=where_columns.len())
                .map(|i| format!("${i}"))
                .collect::<Vec<_>>()
                .join(",")
        );
        let rows = db.query(&insert, &params).await?;
        let row = rows
            .first()
            .ok_or_else(|| InvalidTagIdSnafu { table: table.as_str() }.build())?;
        let id = extract_tag_id(row, &table)?;
        debug!(measurement, tag_id = id, "registered new tag set");
        self.insert(measurement, cache_key, id);
        Ok(Some(id))
    }

    fn tag_predicates(&self, tags: &[Tag]) -> (Vec<String>, Vec<SqlValue>) {
        if self.tags_as_json {
            return (
                vec![TAGS_JSON_COLUMN.to_string()],
                vec![SqlValue::Jsonb(tags_to_json(tags))],
            );
        }
        let columns = tags.iter().map(|t| t.key.clone()).collect();
        let values = tags
            .iter()
            .map(|t| SqlValue::Text(t.value.clone()))
            .collect();
        (columns, values)
    }

    fn insert(&mut self, measurement: &str, cache_key: String, id: i32) {
        let limit = self.limit;
        let cache = self
            .per_measurement
            .entry(measurement.to_string())
            .or_insert_with(|| match NonZeroUsize::new(limit) {
                Some(capacity) => LruCache::new(capacity),
                None => LruCache::unbounded(),
            });
        cache.put(cache_key, id);
    }
}

fn extract_tag_id(row: &[SqlValue], table: &str) -> Result<i32> {
    match row.first() {
        Some(SqlValue::I32(id)) => Ok(*id),
        Some(SqlValue::I64(id)) => Ok(*id as i32),
        _ => InvalidTagIdSnafu { table }.fail(),
    }
}
