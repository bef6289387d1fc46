//! Pipeline state persistence for the medallion engine.
//!
//! Provides the [`StateBackend`] trait and a [`SqliteStateBackend`]
//! implementation for source watermarks, stage cursors, stage status,
//! run history, table schemas, and constraint violation records.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod sqlite;

pub use backend::StateBackend;
pub use error::StateError;
pub use sqlite::SqliteStateBackend;

/// Common imports for state backend consumers.
pub mod prelude {
    pub use crate::backend::StateBackend;
    pub use crate::error::StateError;
    pub use crate::sqlite::SqliteStateBackend;
    pub use medallion_types::state::{
        CursorState, PipelineId, ProcessedFile, RunRecord, RunStats, StageState, StageStatus,
        TableName, TriggerOutcome, ViolationPolicy, ViolationRecord,
    };
}
