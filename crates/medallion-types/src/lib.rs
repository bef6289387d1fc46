//! Shared medallion record, schema, and pipeline state types.
//!
//! This crate has no I/O: it is the vocabulary shared by the state backend,
//! the engine, and the CLI.

pub mod error;
pub mod record;
pub mod schema;
pub mod state;
pub mod value;

pub use record::Record;
pub use schema::{ColumnSchema, ColumnType, Schema};
pub use value::Value;
