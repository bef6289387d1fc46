//! Incremental bronze/silver/gold pipeline engine.
//!
//! Streaming tables ingest files from a directory under schema evolution,
//! joined tables enrich and validate them, and aggregate tables summarize
//! the result. [`Pipeline`] schedules the stages over their dependency
//! graph and persists progress in a [`medallion_state::StateBackend`].

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::cast_precision_loss)]

pub mod bronze;
pub mod config;
pub mod constraints;
pub mod dag;
pub mod errors;
pub mod expr;
pub mod gold;
pub(crate) mod key;
pub mod query;
pub mod result;
pub mod scheduler;
pub mod silver;
pub mod source;
pub mod table;

// Re-export public API for convenience
pub use config::{parse_pipeline, validate_pipeline, PipelineConfig};
pub use errors::PipelineError;
pub use result::{CheckResult, PipelineReport, StageOutcome, StageReport, TableStatus};
pub use scheduler::Pipeline;
pub use table::{TableSnapshot, TableStore};
