//! The data model for telemetry points delivered to the sink: a measurement
//! name, an unordered set of text tags, an unordered set of typed fields and
//! a UTC timestamp.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{DateTime, Utc};

/// A dimensional attribute of a [`Point`]. Text keyed, text valued, low
/// cardinality expected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// The tag key.
    pub key: String,
    /// The tag value.
    pub value: String,
}

/// A measured value of a [`Point`].
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// The field key.
    pub key: String,
    /// The field value.
    pub value: FieldValue,
}

/// The runtime type of a field value.
///
/// Points carry heterogeneous values; every value is one of these variants
/// and keeps its kind all the way to the database.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// A boolean value.
    Bool(bool),
    /// A 64-bit signed integer value.
    I64(i64),
    /// A 64-bit float value.
    F64(f64),
    /// A text value.
    Text(String),
    /// An opaque binary value.
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// A short name for the variant, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::I64(_) => "i64",
            Self::F64(_) => "f64",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// One observation in a measurement stream.
///
/// Duplicate tag or field keys within a single point are disallowed by
/// contract; the builder methods enforce this in debug builds. Points are
/// immutable once handed to the sink and are consumed once per write.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: String,
    timestamp: DateTime<Utc>,
    tags: Vec<Tag>,
    fields: Vec<Field>,
}

impl Point {
    /// Create a point with no tags and no fields.
    ///
    /// # Panics
    ///
    /// If `measurement` is empty.
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        let measurement = measurement.into();
        assert!(!measurement.is_empty(), "measurement name must not be empty");
        Self {
            measurement,
            timestamp,
            tags: Vec::new(),
            fields: Vec::new(),
        }
    }

    /// Append a tag, consuming and returning the point.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        debug_assert!(
            !self.tags.iter().any(|t| t.key == key),
            "duplicate tag key {key:?}"
        );
        self.tags.push(Tag {
            key,
            value: value.into(),
        });
        self
    }

    /// Append a field, consuming and returning the point.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        let key = key.into();
        debug_assert!(
            !self.fields.iter().any(|f| f.key == key),
            "duplicate field key {key:?}"
        );
        self.fields.push(Field {
            key,
            value: value.into(),
        });
        self
    }

    /// The measurement this point belongs to.
    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// The observation timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The tag list, in insertion order.
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// The field list, in insertion order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }
}
