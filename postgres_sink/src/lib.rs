//! An output sink that writes time-series telemetry into PostgreSQL.
//!
//! Batches of points are grouped by measurement and persisted into
//! per-measurement tables whose schemas are inferred from the data and
//! evolved online: unknown tables are created, new tag or field keys become
//! new columns, and rows travel over the bulk COPY protocol. Tags can be
//! stored inline, as a single JSONB document, or normalized into a
//! companion tag table behind an integer surrogate key with a bounded
//! per-measurement cache.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr,
    clippy::todo,
    clippy::dbg_macro
)]

pub mod columns;
pub mod config;
pub mod db;
pub mod mem;
pub mod postgres;
pub mod rows;
pub mod schema;
pub mod sink;
pub mod tag_cache;
pub mod types;

pub use config::SinkConfig;
pub use db::{Db, DbConnector, Error, Result, SqlValue};
pub use sink::PostgresSink;
