//! Materialized tables and their immutable snapshots.
//!
//! Each table has exactly one writer (its producing stage) and any number
//! of readers. A commit builds the next [`TableSnapshot`] off to the side,
//! persists it when the store is disk-backed, and only then swaps the
//! `Arc` readers see. A reader therefore never observes a half-written
//! table.
//!
//! On disk a table is a directory of JSON-lines part files plus a
//! `_schema.json` manifest naming the schema, version, and live parts.
//! The manifest is written to a temp file and renamed; that rename is the
//! commit point.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use medallion_types::state::TableName;
use medallion_types::{Record, Schema};
use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::source::infer::conform;

const MANIFEST_FILE: &str = "_schema.json";

/// Immutable view of a table at one version.
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    name: TableName,
    schema: Schema,
    rows: Arc<Vec<Record>>,
    version: u64,
    epoch: u64,
}

impl TableSnapshot {
    #[must_use]
    pub fn empty(name: TableName) -> Self {
        Self {
            name,
            schema: Schema::new(),
            rows: Arc::new(Vec::new()),
            version: 0,
            epoch: 0,
        }
    }

    #[must_use]
    pub fn name(&self) -> &TableName {
        &self.name
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Rows in arrival order.
    #[must_use]
    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    /// Rows appended at or after `offset`.
    #[must_use]
    pub fn rows_from(&self, offset: usize) -> &[Record] {
        self.rows.get(offset..).unwrap_or(&[])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Commit counter; 0 means the table was never written.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Version of the last commit that replaced rows or changed the type of
    /// existing rows, 0 if neither ever happened. Row offsets and values
    /// are stable while this is unchanged.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// How a commit changes the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Append,
    Replace,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    schema: Schema,
    version: u64,
    #[serde(default)]
    epoch: u64,
    parts: Vec<String>,
}

/// Registry of the current snapshot of every table.
#[derive(Debug, Default)]
pub struct TableStore {
    tables: RwLock<HashMap<TableName, Arc<TableSnapshot>>>,
    /// Parts backing each table on disk, in commit order.
    parts: RwLock<HashMap<TableName, Vec<String>>>,
    root: Option<PathBuf>,
}

impl TableStore {
    /// Store that keeps every table in memory only.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a disk-backed store rooted at `root`, loading every table
    /// directory that has a manifest.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] when the root cannot be created or a
    /// manifest or part cannot be read, and [`PipelineError::Infrastructure`]
    /// when one cannot be decoded.
    pub fn open(root: &Path) -> Result<Self, PipelineError> {
        fs::create_dir_all(root).map_err(|e| PipelineError::io(root, e))?;

        let mut tables = HashMap::new();
        let mut parts = HashMap::new();
        for entry in fs::read_dir(root).map_err(|e| PipelineError::io(root, e))? {
            let entry = entry.map_err(|e| PipelineError::io(root, e))?;
            let dir = entry.path();
            if !dir.join(MANIFEST_FILE).is_file() {
                continue;
            }
            let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let name = TableName::new(name);
            let (snapshot, table_parts) = load_table(&dir, name.clone())?;
            tracing::debug!(
                table = %name,
                rows = snapshot.len(),
                version = snapshot.version(),
                "Loaded table from disk"
            );
            tables.insert(name.clone(), Arc::new(snapshot));
            parts.insert(name, table_parts);
        }

        Ok(Self {
            tables: RwLock::new(tables),
            parts: RwLock::new(parts),
            root: Some(root.to_path_buf()),
        })
    }

    /// Current snapshot of `name`, or `None` if it was never committed.
    #[must_use]
    pub fn snapshot(&self, name: &str) -> Option<Arc<TableSnapshot>> {
        self.tables
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Current snapshot of `name`, or an empty version-0 snapshot.
    #[must_use]
    pub fn snapshot_or_empty(&self, name: &TableName) -> Arc<TableSnapshot> {
        self.snapshot(name.as_str())
            .unwrap_or_else(|| Arc::new(TableSnapshot::empty(name.clone())))
    }

    /// Names of every committed table, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<TableName> {
        let mut names: Vec<_> = self
            .tables
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Publish a new snapshot of `name`.
    ///
    /// `Append` keeps existing rows and adds `rows` after them; `Replace`
    /// discards them. Either way `schema` becomes the table schema and the
    /// version is bumped. A commit with no rows and an unchanged schema is
    /// still a commit.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] if persisting the snapshot fails; the
    /// previously published snapshot stays current in that case.
    pub fn commit(
        &self,
        name: &TableName,
        schema: Schema,
        rows: Vec<Record>,
        mode: WriteMode,
    ) -> Result<Arc<TableSnapshot>, PipelineError> {
        let current = self.snapshot_or_empty(name);
        let version = current.version + 1;
        // Rows already published must keep matching the column types.
        let retyped = mode == WriteMode::Append
            && !current.is_empty()
            && current.schema().retyped_in(&schema);
        // Readers that consumed the old values must start over.
        let epoch = if mode == WriteMode::Replace || retyped {
            version
        } else {
            current.epoch
        };
        let all_rows = match mode {
            WriteMode::Append if current.is_empty() => rows.clone(),
            WriteMode::Append => {
                let mut all = Vec::with_capacity(current.len() + rows.len());
                all.extend_from_slice(current.rows());
                if retyped {
                    for row in &mut all {
                        conform(row, &schema);
                    }
                }
                all.extend(rows.iter().cloned());
                all
            }
            WriteMode::Replace => rows.clone(),
        };

        if let Some(root) = &self.root {
            let previous = self
                .parts
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(name)
                .cloned()
                .unwrap_or_default();
            // A retyped append rewrites every part under the new types.
            let (written, disk_mode) = if retyped {
                (all_rows.as_slice(), WriteMode::Replace)
            } else {
                (rows.as_slice(), mode)
            };
            let live = persist_commit(
                root,
                name,
                &schema,
                (version, epoch),
                written,
                disk_mode,
                &previous,
            )?;
            self.parts
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(name.clone(), live);
        }

        let snapshot = Arc::new(TableSnapshot {
            name: name.clone(),
            schema,
            rows: Arc::new(all_rows),
            version,
            epoch,
        });
        self.tables
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.clone(), Arc::clone(&snapshot));

        tracing::debug!(
            table = %name,
            version,
            rows = snapshot.len(),
            mode = ?mode,
            "Committed table snapshot"
        );
        Ok(snapshot)
    }

    /// Forget `name` entirely, deleting its directory when disk-backed.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] if the table directory cannot be removed.
    pub fn drop_table(&self, name: &TableName) -> Result<(), PipelineError> {
        if let Some(root) = &self.root {
            let dir = root.join(name.as_str());
            if dir.exists() {
                fs::remove_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
            }
        }
        self.tables
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(name.as_str());
        self.parts
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(name.as_str());
        Ok(())
    }
}

// ── Disk persistence ────────────────────────────────────────────────

fn persist_commit(
    root: &Path,
    name: &TableName,
    schema: &Schema,
    (version, epoch): (u64, u64),
    rows: &[Record],
    mode: WriteMode,
    previous: &[String],
) -> Result<Vec<String>, PipelineError> {
    let dir = root.join(name.as_str());
    fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;

    let mut live = match mode {
        WriteMode::Append => previous.to_vec(),
        WriteMode::Replace => Vec::new(),
    };
    if !rows.is_empty() {
        let part = format!("part-{version:08}.jsonl");
        write_atomically(&dir.join(&part), |w| {
            for row in rows {
                serde_json::to_writer(&mut *w, &row.to_json())
                    .map_err(std::io::Error::other)?;
                w.write_all(b"\n")?;
            }
            Ok(())
        })?;
        live.push(part);
    }

    let manifest = Manifest {
        schema: schema.clone(),
        version,
        epoch,
        parts: live.clone(),
    };
    write_atomically(&dir.join(MANIFEST_FILE), |w| {
        serde_json::to_writer_pretty(&mut *w, &manifest).map_err(std::io::Error::other)
    })?;

    if mode == WriteMode::Replace {
        for stale in previous.iter().filter(|p| !live.contains(p)) {
            let path = dir.join(stale);
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale part");
            }
        }
    }

    Ok(live)
}

/// Write via a sibling temp file and rename over `path`.
fn write_atomically<F>(path: &Path, write: F) -> Result<(), PipelineError>
where
    F: FnOnce(&mut BufWriter<fs::File>) -> std::io::Result<()>,
{
    let tmp = path.with_extension("tmp");
    let result = (|| {
        let mut writer = BufWriter::new(fs::File::create(&tmp)?);
        write(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&tmp, path)
    })();
    result.map_err(|e| {
        let _ = fs::remove_file(&tmp);
        PipelineError::io(path, e)
    })
}

fn load_table(dir: &Path, name: TableName) -> Result<(TableSnapshot, Vec<String>), PipelineError> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let raw = fs::read_to_string(&manifest_path).map_err(|e| PipelineError::io(&manifest_path, e))?;
    let manifest: Manifest = serde_json::from_str(&raw).map_err(|e| {
        anyhow::anyhow!("corrupt manifest {}: {e}", manifest_path.display())
    })?;

    let mut rows = Vec::new();
    for part in &manifest.parts {
        let path = dir.join(part);
        let file = fs::File::open(&path).map_err(|e| PipelineError::io(&path, e))?;
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| PipelineError::io(&path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&line)
                .map_err(|e| {
                    anyhow::anyhow!("corrupt part {} line {}: {e}", path.display(), idx + 1)
                })?;
            rows.push(Record::from_json(&object, &manifest.schema));
        }
    }

    Ok((
        TableSnapshot {
            name,
            schema: manifest.schema,
            rows: Arc::new(rows),
            version: manifest.version,
            epoch: manifest.epoch,
        },
        manifest.parts,
    ))
}
