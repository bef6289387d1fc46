//! File readers for CSV and newline-delimited JSON sources.
//!
//! Readers never fail on bad rows: every malformed row becomes a
//! [`ParseError`] and reading continues. Only storage failures abort.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use medallion_types::error::ParseError;
use medallion_types::{Record, Schema};

use super::infer::{conform, infer_json, infer_text, SchemaBuilder};
use crate::errors::PipelineError;

/// Parsed content of one file.
#[derive(Debug, Default)]
pub struct Parsed {
    pub schema: Schema,
    pub records: Vec<Record>,
    pub errors: Vec<ParseError>,
}

fn parse_error(path: &Path, line: Option<u64>, message: impl Into<String>) -> ParseError {
    ParseError {
        file: path.display().to_string(),
        line,
        message: message.into(),
    }
}

fn finish(builder: SchemaBuilder, mut records: Vec<Record>, errors: Vec<ParseError>) -> Parsed {
    let schema = builder.finish();
    for record in &mut records {
        conform(record, &schema);
    }
    Parsed {
        schema,
        records,
        errors,
    }
}

/// Read a CSV file with a header row.
///
/// # Errors
///
/// Returns [`PipelineError::Io`] if the file cannot be opened or read.
pub fn read_csv(path: &Path, delimiter: u8, infer: bool) -> Result<Parsed, PipelineError> {
    let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(BufReader::new(file));

    let headers: Vec<String> = match reader.byte_headers() {
        Ok(raw) => {
            let mut names = Vec::with_capacity(raw.len());
            for field in raw {
                match std::str::from_utf8(field) {
                    Ok(name) => names.push(name.trim().to_string()),
                    Err(_) => {
                        return Ok(Parsed {
                            errors: vec![parse_error(path, Some(1), "header is not valid UTF-8")],
                            ..Parsed::default()
                        });
                    }
                }
            }
            names
        }
        Err(e) => match classify(e) {
            CsvFailure::Io(io) => return Err(PipelineError::io(path, io)),
            CsvFailure::Row(message) => {
                return Ok(Parsed {
                    errors: vec![parse_error(path, Some(1), message)],
                    ..Parsed::default()
                });
            }
        },
    };
    if headers.iter().all(String::is_empty) {
        return Ok(Parsed::default());
    }

    let mut builder = SchemaBuilder::new();
    for name in &headers {
        builder.declare(name);
    }
    let mut records = Vec::new();
    let mut errors = Vec::new();

    for row in reader.byte_records() {
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                let line = e.position().map(csv::Position::line);
                match classify(e) {
                    CsvFailure::Io(io) => return Err(PipelineError::io(path, io)),
                    CsvFailure::Row(message) => errors.push(parse_error(path, line, message)),
                }
                continue;
            }
        };
        let line = row.position().map(csv::Position::line);
        if row.len() != headers.len() {
            errors.push(parse_error(
                path,
                line,
                format!("expected {} fields, found {}", headers.len(), row.len()),
            ));
            continue;
        }

        let mut record = Record::with_capacity(headers.len());
        let mut bad_utf8 = false;
        for (name, field) in headers.iter().zip(row.iter()) {
            let Ok(text) = std::str::from_utf8(field) else {
                bad_utf8 = true;
                break;
            };
            let value = infer_text(text, infer);
            builder.observe(name, &value);
            record.insert(name.clone(), value);
        }
        if bad_utf8 {
            errors.push(parse_error(path, line, "row is not valid UTF-8"));
            continue;
        }
        records.push(record);
    }

    Ok(finish(builder, records, errors))
}

enum CsvFailure {
    Io(std::io::Error),
    Row(String),
}

/// Storage failures stay I/O errors; anything else is row-level.
fn classify(err: csv::Error) -> CsvFailure {
    let message = err.to_string();
    match err.into_kind() {
        csv::ErrorKind::Io(io) => CsvFailure::Io(io),
        _ => CsvFailure::Row(message),
    }
}

/// Read newline-delimited JSON objects. Blank lines are skipped.
///
/// # Errors
///
/// Returns [`PipelineError::Io`] if the file cannot be opened or read.
pub fn read_ndjson(path: &Path, infer: bool) -> Result<Parsed, PipelineError> {
    let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
    let mut builder = SchemaBuilder::new();
    let mut records = Vec::new();
    let mut errors = Vec::new();

    for (idx, chunk) in BufReader::new(file).split(b'\n').enumerate() {
        let line_no = Some(idx as u64 + 1);
        let bytes = chunk.map_err(|e| PipelineError::io(path, e))?;
        let Ok(text) = std::str::from_utf8(&bytes) else {
            errors.push(parse_error(path, line_no, "line is not valid UTF-8"));
            continue;
        };
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(serde_json::Value::Object(object)) => {
                let mut record = Record::with_capacity(object.len());
                for (key, cell) in &object {
                    let value = infer_json(cell, infer);
                    builder.observe(key, &value);
                    record.insert(key.clone(), value);
                }
                records.push(record);
            }
            Ok(_) => errors.push(parse_error(path, line_no, "line is not a JSON object")),
            Err(e) => errors.push(parse_error(path, line_no, format!("invalid JSON: {e}"))),
        }
    }

    Ok(finish(builder, records, errors))
}
