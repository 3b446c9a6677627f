//! Derives the column plan for a batch of points from one measurement.

use std::collections::HashSet;

use data_types::Point;

use crate::types::{derive_data_type, ColumnRole, PgDataType, TargetColumns};

/// Name of the timestamp column, always first in a main table.
pub const TIME_COLUMN: &str = "time";
/// Name of the surrogate-key column in foreign-key mode.
pub const TAG_ID_COLUMN: &str = "tag_id";
/// Name of the single JSON document column holding all tags.
pub const TAGS_JSON_COLUMN: &str = "tags";
/// Name of the single JSON document column holding all fields.
pub const FIELDS_JSON_COLUMN: &str = "fields";

/// Maps a slice of same-measurement points to the column layout of the main
/// table and, in foreign-key mode, the companion tag table.
#[derive(Debug, Clone, Copy)]
pub struct ColumnMapper {
    tags_as_fk: bool,
    tags_as_json: bool,
    fields_as_json: bool,
}

impl ColumnMapper {
    /// A mapper for the given storage modes.
    pub fn new(tags_as_fk: bool, tags_as_json: bool, fields_as_json: bool) -> Self {
        Self {
            tags_as_fk,
            tags_as_json,
            fields_as_json,
        }
    }

    /// Derive `(main_columns, tag_columns)` for `points`.
    ///
    /// The result is the union of tag and field keys observed across the
    /// batch, in order of first appearance, behind the fixed prefix the
    /// storage modes dictate. The data type of a field column is decided by
    /// the first value observed for its key; later observations of another
    /// kind do not alter it. A key claimed by a tag is not re-mapped when a
    /// field of the same name shows up later (and vice versa).
    pub fn target(&self, points: &[&Point]) -> (TargetColumns, Option<TargetColumns>) {
        let (mut main, mut tag_cols) = self.initial_columns();

        if self.tags_as_json {
            let target = if self.tags_as_fk {
                tag_cols.as_mut().expect("fk mode has a tag table plan")
            } else {
                &mut main
            };
            target.push(TAGS_JSON_COLUMN, PgDataType::Jsonb, ColumnRole::Tag);
        }
        if self.fields_as_json {
            main.push(FIELDS_JSON_COLUMN, PgDataType::Jsonb, ColumnRole::Field);
        }
        if self.tags_as_json && self.fields_as_json {
            // Nothing left depends on the points themselves.
            return (main, tag_cols);
        }

        // The prefix names claim their spot before any tag or field does.
        let mut already_mapped: HashSet<String> = main
            .names
            .iter()
            .chain(tag_cols.iter().flat_map(|t| t.names.iter()))
            .cloned()
            .collect();

        for point in points {
            if !self.tags_as_json {
                let target = if self.tags_as_fk {
                    tag_cols.as_mut().expect("fk mode has a tag table plan")
                } else {
                    &mut main
                };
                for tag in point.tags() {
                    if already_mapped.insert(tag.key.clone()) {
                        target.push(&tag.key, PgDataType::Text, ColumnRole::Tag);
                    }
                }
            }

            if !self.fields_as_json {
                for field in point.fields() {
                    if already_mapped.insert(field.key.clone()) {
                        main.push(
                            &field.key,
                            derive_data_type(&field.value),
                            ColumnRole::Field,
                        );
                    }
                }
            }
        }

        (main, tag_cols)
    }

    fn initial_columns(&self) -> (TargetColumns, Option<TargetColumns>) {
        let mut main = TargetColumns::default();
        main.push(TIME_COLUMN, PgDataType::Timestamptz, ColumnRole::Time);

        if !self.tags_as_fk {
            return (main, None);
        }

        main.push(TAG_ID_COLUMN, PgDataType::Int4, ColumnRole::TagsId);
        let mut tag_cols = TargetColumns::default();
        tag_cols.push(TAG_ID_COLUMN, PgDataType::Serial, ColumnRole::TagsId);
        (main, Some(tag_cols))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn points() -> Vec<Point> {
        vec![
            Point::new("m", Utc::now())
                .with_tag("t1", "a")
                .with_field("f1", 2_i64)
                .with_field("f2", 2.0),
            Point::new("m", Utc::now())
                .with_tag("t2", "b")
                .with_field("f2", 3.0)
                .with_field("f3", "x"),
        ]
    }

    fn refs(points: &[Point]) -> Vec<&Point> {
        points.iter().collect()
    }

    #[test]
    fn inline_columns_are_the_union_in_first_appearance_order() {
        let points = points();
        let (main, tag_cols) = ColumnMapper::new(false, false, false).target(&refs(&points));

        assert!(tag_cols.is_none());
        assert_eq!(main.names, ["time", "t1", "f1", "f2", "t2", "f3"]);
        assert_eq!(
            main.data_types,
            [
                PgDataType::Timestamptz,
                PgDataType::Text,
                PgDataType::Int8,
                PgDataType::Float8,
                PgDataType::Text,
                PgDataType::Text,
            ]
        );
        assert_eq!(
            main.roles,
            [
                ColumnRole::Time,
                ColumnRole::Tag,
                ColumnRole::Field,
                ColumnRole::Field,
                ColumnRole::Tag,
                ColumnRole::Field,
            ]
        );
        assert_eq!(main.index_of("t2"), Some(4));
    }

    #[test]
    fn first_observation_wins_for_field_types() {
        let points = vec![
            Point::new("m", Utc::now()).with_field("f", 1_i64),
            Point::new("m", Utc::now()).with_field("f", 1.5),
        ];
        let (main, _) = ColumnMapper::new(false, false, false).target(&refs(&points));
        assert_eq!(main.data_types[1], PgDataType::Int8);
    }

    #[test]
    fn tag_field_name_collision_resolves_to_first_observation() {
        let points = vec![Point::new("m", Utc::now())
            .with_tag("dup", "a")
            .with_field("dup", 1_i64)];
        let (main, _) = ColumnMapper::new(false, false, false).target(&refs(&points));
        assert_eq!(main.names, ["time", "dup"]);
        assert_eq!(main.roles[1], ColumnRole::Tag);
    }

    #[test]
    fn foreign_key_mode_splits_tags_into_their_own_plan() {
        let points = points();
        let (main, tag_cols) = ColumnMapper::new(true, false, false).target(&refs(&points));
        let tag_cols = tag_cols.unwrap();

        assert_eq!(main.names, ["time", "tag_id", "f1", "f2", "f3"]);
        assert_eq!(main.roles[1], ColumnRole::TagsId);
        assert_eq!(main.data_types[1], PgDataType::Int4);

        assert_eq!(tag_cols.names, ["tag_id", "t1", "t2"]);
        assert_eq!(tag_cols.data_types[0], PgDataType::Serial);
        assert_eq!(
            tag_cols.roles,
            [ColumnRole::TagsId, ColumnRole::Tag, ColumnRole::Tag]
        );
    }

    #[test]
    fn json_tags_collapse_into_one_column() {
        let points = points();
        let (main, tag_cols) = ColumnMapper::new(false, true, false).target(&refs(&points));

        assert!(tag_cols.is_none());
        assert_eq!(main.names, ["time", "tags", "f1", "f2", "f3"]);
        assert_eq!(main.data_types[1], PgDataType::Jsonb);
    }

    #[test]
    fn json_everything_needs_no_batch_walk() {
        let points = points();
        let (main, tag_cols) = ColumnMapper::new(false, true, true).target(&refs(&points));

        assert!(tag_cols.is_none());
        assert_eq!(main.names, ["time", "tags", "fields"]);
    }

    #[test]
    fn json_everything_with_foreign_keys() {
        let points = points();
        let (main, tag_cols) = ColumnMapper::new(true, true, true).target(&refs(&points));
        let tag_cols = tag_cols.unwrap();

        assert_eq!(main.names, ["time", "tag_id", "fields"]);
        assert_eq!(tag_cols.names, ["tag_id", "tags"]);
        assert_eq!(tag_cols.data_types, [PgDataType::Serial, PgDataType::Jsonb]);
    }
}
