//! Source watcher: discovers new files in a storage directory.
//!
//! A file's identity is its path plus size and modification time. Files
//! already recorded in the state backend's watermark are skipped; the
//! watermark itself is only advanced by the caller once the records have
//! been committed downstream, so a crash between parse and commit re-reads
//! the file instead of losing it.

pub mod infer;
pub mod reader;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use medallion_state::StateBackend;
use medallion_types::error::ParseError;
use medallion_types::state::{PipelineId, ProcessedFile, TableName};
use medallion_types::{Record, Schema};

use crate::config::types::{SourceConfig, SourceFormat};
use crate::errors::PipelineError;

/// A candidate file found by a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    pub modified_ms: i64,
}

impl FileEntry {
    fn key(&self) -> (String, u64, i64) {
        (path_key(&self.path), self.size, self.modified_ms)
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// One newly discovered file and everything parsed from it.
#[derive(Debug)]
pub struct SourceFile {
    pub entry: FileEntry,
    /// Types inferred from this file alone.
    pub schema: Schema,
    pub records: Vec<Record>,
    pub errors: Vec<ParseError>,
}

impl SourceFile {
    /// Watermark row to persist once this file's records are committed.
    #[must_use]
    pub fn watermark_entry(&self) -> ProcessedFile {
        ProcessedFile {
            path: path_key(&self.entry.path),
            size: self.entry.size,
            modified_ms: self.entry.modified_ms,
            records: self.records.len() as u64,
            parse_errors: self.errors.len() as u64,
        }
    }
}

/// Result of one poll, files in discovery order.
#[derive(Debug, Default)]
pub struct PollBatch {
    pub files: Vec<SourceFile>,
}

impl PollBatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.files.iter().map(|f| f.records.len() as u64).sum()
    }

    #[must_use]
    pub fn watermark_entries(&self) -> Vec<ProcessedFile> {
        self.files.iter().map(SourceFile::watermark_entry).collect()
    }
}

/// Watches one source directory on behalf of one bronze table.
pub struct SourceWatcher {
    pipeline: PipelineId,
    table: TableName,
    config: SourceConfig,
    state: Arc<dyn StateBackend>,
}

impl SourceWatcher {
    pub fn new(
        pipeline: PipelineId,
        table: TableName,
        config: SourceConfig,
        state: Arc<dyn StateBackend>,
    ) -> Self {
        Self {
            pipeline,
            table,
            config,
            state,
        }
    }

    /// Unprocessed files, ordered by (modification time, path).
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] if the directory cannot be listed and
    /// [`PipelineError::State`] if the watermark cannot be read.
    pub fn pending(&self) -> Result<Vec<FileEntry>, PipelineError> {
        let seen: HashSet<(String, u64, i64)> = self
            .state
            .processed_files(&self.pipeline, &self.table)?
            .into_iter()
            .map(|f| (f.path, f.size, f.modified_ms))
            .collect();

        let mut pending: Vec<FileEntry> = list_files(&self.config.path, self.config.format)?
            .into_iter()
            .filter(|entry| !seen.contains(&entry.key()))
            .collect();
        sort_entries(&mut pending);
        Ok(pending)
    }

    /// Parse every pending file.
    ///
    /// Malformed rows are collected per file and never fail the poll.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] on storage failures, including a file
    /// that vanished between listing and reading.
    pub fn poll(&self) -> Result<PollBatch, PipelineError> {
        self.read_entries(self.pending()?)
    }

    /// Parse every file in the directory regardless of the watermark, in
    /// the same order as [`SourceWatcher::poll`]. Used to rebuild a table
    /// from scratch.
    ///
    /// # Errors
    ///
    /// Same as [`SourceWatcher::poll`].
    pub fn rescan(&self) -> Result<PollBatch, PipelineError> {
        let mut entries = list_files(&self.config.path, self.config.format)?;
        sort_entries(&mut entries);
        self.read_entries(entries)
    }

    fn read_entries(&self, entries: Vec<FileEntry>) -> Result<PollBatch, PipelineError> {
        let mut files = Vec::new();
        for entry in entries {
            let parsed = match self.config.format {
                SourceFormat::Csv => {
                    let delimiter = u8::try_from(self.config.delimiter).map_err(|_| {
                        PipelineError::config(
                            self.table.as_str(),
                            "CSV delimiter must be a single ASCII character",
                        )
                    })?;
                    reader::read_csv(&entry.path, delimiter, self.config.infer_column_types)?
                }
                SourceFormat::Json => {
                    reader::read_ndjson(&entry.path, self.config.infer_column_types)?
                }
                SourceFormat::Avro => {
                    return Err(PipelineError::config(
                        self.table.as_str(),
                        "source format 'avro' is not supported by this build",
                    ));
                }
            };
            for error in &parsed.errors {
                tracing::warn!(table = %self.table, error = %error, "Skipping malformed record");
            }
            tracing::debug!(
                table = %self.table,
                path = %entry.path.display(),
                records = parsed.records.len(),
                parse_errors = parsed.errors.len(),
                "Parsed source file"
            );
            files.push(SourceFile {
                entry,
                schema: parsed.schema,
                records: parsed.records,
                errors: parsed.errors,
            });
        }
        Ok(PollBatch { files })
    }
}

fn sort_entries(entries: &mut [FileEntry]) {
    entries.sort_by(|a, b| {
        a.modified_ms
            .cmp(&b.modified_ms)
            .then_with(|| a.path.cmp(&b.path))
    });
}

fn matches_format(path: &Path, format: SourceFormat) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let ext = ext.to_ascii_lowercase();
    match format {
        SourceFormat::Csv => ext == "csv",
        SourceFormat::Json => matches!(ext.as_str(), "json" | "jsonl" | "ndjson"),
        SourceFormat::Avro => ext == "avro",
    }
}

/// Regular files in `dir` with a matching extension. Hidden and
/// `_`-prefixed names are skipped.
fn list_files(dir: &Path, format: SourceFormat) -> Result<Vec<FileEntry>, PipelineError> {
    let mut entries = Vec::new();
    for item in std::fs::read_dir(dir).map_err(|e| PipelineError::io(dir, e))? {
        let item = item.map_err(|e| PipelineError::io(dir, e))?;
        let path = item.path();
        let hidden = item
            .file_name()
            .to_str()
            .map_or(true, |n| n.starts_with('.') || n.starts_with('_'));
        if hidden || !matches_format(&path, format) {
            continue;
        }
        let meta = item.metadata().map_err(|e| PipelineError::io(&path, e))?;
        if !meta.is_file() {
            continue;
        }
        let modified_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .and_then(|d| i64::try_from(d.as_millis()).ok())
            .unwrap_or(0);
        entries.push(FileEntry {
            path,
            size: meta.len(),
            modified_ms,
        });
    }
    Ok(entries)
}
