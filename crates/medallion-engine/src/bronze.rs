//! Bronze ingestion: raw source records appended under schema evolution.

use std::collections::HashSet;

use medallion_types::schema::{SchemaEvolutionPolicy, SchemaMerge};
use medallion_types::state::TableName;
use medallion_types::{Record, Schema, Value};

use crate::errors::PipelineError;
use crate::source::infer::conform;
use crate::source::SourceFile;
use crate::table::TableSnapshot;

/// Rows ready to append plus the schema they were conformed to.
#[derive(Debug, Default)]
pub struct BronzeBatch {
    pub schema: Schema,
    pub rows: Vec<Record>,
    /// Schema changes applied across all files of the batch.
    pub evolution: SchemaMerge,
    pub parse_errors: u64,
}

impl BronzeBatch {
    #[must_use]
    pub fn schema_changed(&self) -> bool {
        !self.evolution.is_unchanged()
    }
}

/// Appends watcher output to one bronze table.
#[derive(Debug, Clone)]
pub struct BronzeIngestor {
    table: TableName,
    policy: SchemaEvolutionPolicy,
}

impl BronzeIngestor {
    #[must_use]
    pub fn new(table: TableName, policy: SchemaEvolutionPolicy) -> Self {
        Self { table, policy }
    }

    /// Merge each file's schema into the table schema, in file order, and
    /// conform its records to the result.
    ///
    /// Values are coerced to their column's merged type. Columns the policy
    /// ignores are dropped; values that cannot be coerced (type changes
    /// under the `null` policy) become null.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::SchemaEvolution`] when the policy rejects a
    /// change. Nothing from the batch may be committed in that case.
    pub fn ingest(
        &self,
        current: &TableSnapshot,
        files: &[SourceFile],
    ) -> Result<BronzeBatch, PipelineError> {
        let mut schema = current.schema().clone();
        let mut batch = BronzeBatch::default();

        for file in files {
            let merge = schema
                .merge(&file.schema, self.policy)
                .map_err(|source| PipelineError::SchemaEvolution {
                    table: self.table.to_string(),
                    source,
                })?;

            if !merge.is_unchanged() {
                tracing::info!(
                    table = %self.table,
                    path = %file.entry.path.display(),
                    added = ?merge.added,
                    widened = merge.widened.len(),
                    schema_version = schema.version(),
                    "Schema evolved"
                );
            }
            for column in &merge.nulled {
                tracing::warn!(
                    table = %self.table,
                    column = %column,
                    path = %file.entry.path.display(),
                    "Incompatible values nulled"
                );
            }

            let ignored: HashSet<&str> = merge.ignored.iter().map(String::as_str).collect();
            for record in &file.records {
                batch.rows.push(conform_row(record, &schema, &ignored));
            }
            batch.parse_errors += file.errors.len() as u64;
            accumulate(&mut batch.evolution, merge);
        }

        // Earlier rows of the batch pick up widenings made by later files.
        if batch.schema_changed() {
            for row in &mut batch.rows {
                conform(row, &schema);
            }
        }
        batch.schema = schema;
        Ok(batch)
    }
}

fn conform_row(record: &Record, schema: &Schema, ignored: &HashSet<&str>) -> Record {
    let mut row = Record::with_capacity(schema.len());
    for (name, value) in record.iter() {
        if ignored.contains(name) {
            continue;
        }
        let Some(target) = schema.column_type(name) else {
            continue;
        };
        row.insert(name, value.coerce_to(target).unwrap_or(Value::Null));
    }
    row.project(schema)
}

fn accumulate(total: &mut SchemaMerge, next: SchemaMerge) {
    total.added.extend(next.added);
    total.widened.extend(next.widened);
    for column in next.ignored {
        if !total.ignored.contains(&column) {
            total.ignored.push(column);
        }
    }
    for column in next.nulled {
        if !total.nulled.contains(&column) {
            total.nulled.push(column);
        }
    }
    total.typed.extend(next.typed);
}
