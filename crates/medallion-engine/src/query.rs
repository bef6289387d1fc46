//! Read-only query surface: Arrow conversion of table snapshots.

use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{
    ArrayRef, BooleanBuilder, Date32Builder, Float64Builder, Int64Builder, StringBuilder,
};
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use chrono::Datelike;
use medallion_types::{ColumnType, Record, Value};

use crate::table::TableSnapshot;

/// Days from 0001-01-01 (CE day 1) to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

fn arrow_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::Integer => DataType::Int64,
        ColumnType::Float => DataType::Float64,
        ColumnType::String => DataType::Utf8,
        ColumnType::Date => DataType::Date32,
        ColumnType::Boolean => DataType::Boolean,
    }
}

/// Build one column. Cells that cannot be coerced to the schema type
/// become nulls.
fn build_column(rows: &[Record], name: &str, column_type: ColumnType) -> ArrayRef {
    let cells = rows
        .iter()
        .map(|row| row.get(name).coerce_to(column_type).unwrap_or(Value::Null));

    match column_type {
        ColumnType::Integer => {
            let mut b = Int64Builder::with_capacity(rows.len());
            for cell in cells {
                match cell {
                    Value::Integer(v) => b.append_value(v),
                    _ => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
        ColumnType::Float => {
            let mut b = Float64Builder::with_capacity(rows.len());
            for cell in cells {
                match cell.as_f64() {
                    Some(v) => b.append_value(v),
                    None => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
        ColumnType::String => {
            let mut b = StringBuilder::new();
            for cell in cells {
                match cell {
                    Value::String(s) => b.append_value(s),
                    _ => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
        ColumnType::Date => {
            let mut b = Date32Builder::with_capacity(rows.len());
            for cell in cells {
                match cell {
                    Value::Date(d) => b.append_value(d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE),
                    _ => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
        ColumnType::Boolean => {
            let mut b = BooleanBuilder::with_capacity(rows.len());
            for cell in cells {
                match cell {
                    Value::Boolean(v) => b.append_value(v),
                    _ => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
    }
}

/// Convert the first `limit` rows of a snapshot (all when `None`) into a
/// single `RecordBatch`. Every column is nullable.
pub fn snapshot_to_record_batch(snapshot: &TableSnapshot, limit: Option<usize>) -> Result<RecordBatch> {
    let rows = match limit {
        Some(n) => &snapshot.rows()[..n.min(snapshot.len())],
        None => snapshot.rows(),
    };

    let fields: Vec<Field> = snapshot
        .schema()
        .columns()
        .iter()
        .map(|c| Field::new(&c.name, arrow_type(c.column_type), true))
        .collect();
    let columns: Vec<ArrayRef> = snapshot
        .schema()
        .columns()
        .iter()
        .map(|c| build_column(rows, &c.name, c.column_type))
        .collect();

    let options = RecordBatchOptions::new().with_row_count(Some(rows.len()));
    RecordBatch::try_new_with_options(Arc::new(ArrowSchema::new(fields)), columns, &options)
        .with_context(|| format!("Failed to build RecordBatch for table '{}'", snapshot.name()))
}

/// Render a snapshot as an ASCII table.
pub fn format_snapshot(snapshot: &TableSnapshot, limit: Option<usize>) -> Result<String> {
    let batch = snapshot_to_record_batch(snapshot, limit)?;
    let rendered = arrow::util::pretty::pretty_format_batches(&[batch])
        .context("Failed to format RecordBatch")?;
    Ok(rendered.to_string())
}

impl TableSnapshot {
    /// Whole snapshot as an Arrow `RecordBatch`.
    ///
    /// # Errors
    ///
    /// Returns an error if Arrow rejects the assembled columns.
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        snapshot_to_record_batch(self, None)
    }
}
