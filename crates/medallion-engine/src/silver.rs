//! Silver stage: left join against a reference table, derived columns,
//! then expectations.

use std::collections::HashMap;

use medallion_types::schema::{ColumnSchema, SchemaEvolutionPolicy};
use medallion_types::{Record, Schema, Value};

use crate::config::types::{JoinConfig, TableConfig};
use crate::constraints::{evaluate_batch, BatchEvaluation, Constraint};
use crate::errors::PipelineError;
use crate::expr::{EvalContext, Expr};
use crate::key::KeyPart;
use crate::source::infer::{conform, SchemaBuilder};
use crate::table::TableSnapshot;

/// A computed column.
#[derive(Debug, Clone)]
pub struct DerivedColumn {
    pub name: String,
    pub expr: Expr,
}

/// Compiled definition of a joined table.
#[derive(Debug, Clone)]
pub struct SilverSpec {
    pub table: String,
    pub join: Option<JoinConfig>,
    pub derive: Vec<DerivedColumn>,
    pub constraints: Vec<Constraint>,
}

impl SilverSpec {
    /// Compile derived columns and expectations of a `joined` table.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Expression`] if any expression fails to parse.
    pub fn from_config(config: &TableConfig) -> Result<Self, PipelineError> {
        let derive = config
            .derive
            .iter()
            .map(|d| {
                Ok(DerivedColumn {
                    name: d.name.clone(),
                    expr: Expr::parse(&d.expr)?,
                })
            })
            .collect::<Result<Vec<_>, PipelineError>>()?;
        let constraints = config
            .expectations
            .iter()
            .map(Constraint::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            table: config.name.clone(),
            join: config.join.clone(),
            derive,
            constraints,
        })
    }
}

/// Rows produced by one silver trigger.
#[derive(Debug)]
pub struct TransformOutput {
    /// Schema of the produced rows.
    pub schema: Schema,
    pub evaluation: BatchEvaluation,
    /// Rows after the join, before expectations.
    pub joined: u64,
}

/// Reference columns carried into the output, with their types.
fn reference_columns(
    join: &JoinConfig,
    primary: &Schema,
    reference: &Schema,
    table: &str,
) -> Result<Vec<ColumnSchema>, PipelineError> {
    let requested: Vec<&str> = if join.columns.is_empty() {
        reference
            .names()
            .filter(|n| *n != join.right_key)
            .collect()
    } else {
        join.columns.iter().map(String::as_str).collect()
    };

    let mut out = Vec::with_capacity(requested.len());
    for name in requested {
        if primary.contains(name) {
            tracing::debug!(table, column = name, "Reference column shadowed by primary column");
            continue;
        }
        let column = match reference.get(name) {
            Some(column) => column.clone(),
            None if reference.is_empty() => ColumnSchema::placeholder(name),
            None => {
                return Err(PipelineError::config(
                    table,
                    format!("join column '{name}' does not exist in the reference table"),
                ));
            }
        };
        out.push(column);
    }
    Ok(out)
}

/// Join `input` to `reference`, derive columns, and evaluate expectations.
///
/// Every primary row yields at least one joined row: one per matching
/// reference row, or a single row with null reference columns when none
/// match. Null keys never match.
///
/// # Errors
///
/// Returns [`PipelineError::Config`] when a join key or requested join
/// column is missing from a non-empty schema.
pub fn transform(
    input: &[Record],
    primary_schema: &Schema,
    reference: Option<&TableSnapshot>,
    spec: &SilverSpec,
    ctx: &EvalContext,
) -> Result<TransformOutput, PipelineError> {
    let table = spec.table.as_str();
    let mut columns: Vec<ColumnSchema> = primary_schema.columns().to_vec();
    let mut joined: Vec<Record> = Vec::with_capacity(input.len());

    match (&spec.join, reference) {
        (Some(join), Some(reference)) => {
            if !primary_schema.is_empty() && !primary_schema.contains(&join.left_key) {
                return Err(PipelineError::config(
                    table,
                    format!("join key '{}' does not exist in the primary table", join.left_key),
                ));
            }
            if !reference.schema().is_empty() && !reference.schema().contains(&join.right_key) {
                return Err(PipelineError::config(
                    table,
                    format!(
                        "join key '{}' does not exist in the reference table",
                        join.right_key
                    ),
                ));
            }
            let carried = reference_columns(join, primary_schema, reference.schema(), table)?;

            let mut index: HashMap<KeyPart, Vec<&Record>> = HashMap::new();
            for row in reference.rows() {
                if let Some(key) = KeyPart::join(row.get(&join.right_key)) {
                    index.entry(key).or_default().push(row);
                }
            }

            for row in input {
                let matches = KeyPart::join(row.get(&join.left_key)).and_then(|k| index.get(&k));
                match matches {
                    Some(refs) => {
                        for reference_row in refs {
                            let mut out = row.clone();
                            for c in &carried {
                                out.insert(c.name.clone(), reference_row.get(&c.name).clone());
                            }
                            joined.push(out);
                        }
                    }
                    None => {
                        let mut out = row.clone();
                        for c in &carried {
                            out.insert(c.name.clone(), Value::Null);
                        }
                        joined.push(out);
                    }
                }
            }
            columns.extend(carried);
        }
        _ => joined.extend(input.iter().cloned()),
    }

    let mut schema = Schema::from_columns(columns);
    if !spec.derive.is_empty() {
        let mut derived_types = SchemaBuilder::new();
        for d in &spec.derive {
            derived_types.declare(&d.name);
        }
        for row in &mut joined {
            for d in &spec.derive {
                let value = d.expr.evaluate(row, ctx);
                derived_types.observe(&d.name, &value);
                row.insert(d.name.clone(), value);
            }
        }
        schema
            .merge(&derived_types.finish(), SchemaEvolutionPolicy::default())
            .map_err(|source| PipelineError::SchemaEvolution {
                table: table.to_string(),
                source,
            })?;
    }

    for row in &mut joined {
        conform(row, &schema);
        *row = row.project(&schema);
    }

    let joined_count = joined.len() as u64;
    let evaluation = evaluate_batch(table, joined, &spec.constraints, ctx);
    Ok(TransformOutput {
        schema,
        evaluation,
        joined: joined_count,
    })
}
