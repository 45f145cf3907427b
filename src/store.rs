use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use csv::{ReaderBuilder, WriterBuilder};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::records::Record;

/// Row counts around a merge, for the cycle summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOutcome {
    pub rows_before: usize,
    pub rows_after: usize,
}

impl MergeOutcome {
    pub fn rows_added(&self) -> i64 {
        self.rows_after as i64 - self.rows_before as i64
    }
}

/// Load a canonical table file. A missing file is an empty table.
pub fn load<R: Record>(path: &Path) -> Result<Vec<R>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("open {}", path.display()))?;
    let mut rows = Vec::new();
    for rec in rdr.deserialize::<R>() {
        rows.push(rec.with_context(|| format!("deserialize row in {}", path.display()))?);
    }
    Ok(rows)
}

/// Write a full table to a temp sibling and atomically rename over the target.
/// Readers observe either the old file or the new one, never a partial write.
pub fn write_atomic<R: Record>(path: &Path, rows: &[R]) -> Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent).ok();
    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file beside {}", path.display()))?;
    {
        let mut wtr = WriterBuilder::new()
            .has_headers(true)
            .from_writer(tmp.as_file_mut());
        for row in rows {
            wtr.serialize(row)?;
        }
        wtr.flush()?;
    }
    tmp.persist(path)
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Incrementally merge a normalized slice into a canonical table file.
///
/// Within the slice's inclusive settlement range `[t_min, t_max]` the slice is
/// authoritative: existing rows whose key reappears are replaced, existing
/// rows whose key does not (gaps in the slice) survive. Rows outside the range
/// are untouched. The result is key-deduplicated, key-sorted, optionally
/// pruned to `retention_cutoff`, and published atomically.
pub fn merge<R: Record>(
    path: &Path,
    slice: Vec<R>,
    retention_cutoff: Option<NaiveDateTime>,
) -> Result<MergeOutcome> {
    if slice.is_empty() {
        debug!("empty slice for {}, nothing to merge", path.display());
        return Ok(MergeOutcome::default());
    }

    let existing: Vec<R> = match load(path) {
        Ok(rows) => rows,
        Err(e) => {
            warn!(
                "could not load {}, rebuilding from new slice: {e:#}",
                path.display()
            );
            Vec::new()
        }
    };
    let rows_before = existing.len();

    let t_min = slice.iter().map(|r| r.settlement()).min().unwrap();
    let t_max = slice.iter().map(|r| r.settlement()).max().unwrap();
    let new_keys: BTreeSet<_> = slice.iter().map(Record::key).collect();

    // BTreeMap gives key-sorted dedup; later inserts win, so slice rows
    // override surviving overlap rows on collision.
    let mut merged: BTreeMap<(NaiveDateTime, String), R> = BTreeMap::new();
    for row in existing {
        let t = row.settlement();
        let inside = t >= t_min && t <= t_max;
        if !inside || !new_keys.contains(&row.key()) {
            merged.insert(row.key(), row);
        }
    }
    for row in slice {
        merged.insert(row.key(), row);
    }

    if let Some(cutoff) = retention_cutoff {
        let before = merged.len();
        merged.retain(|(t, _), _| *t >= cutoff);
        let pruned = before - merged.len();
        if pruned > 0 {
            info!("pruned {pruned} rows older than {cutoff} from {}", path.display());
        }
    }

    let rows: Vec<R> = merged.into_values().collect();
    let rows_after = rows.len();
    write_atomic(path, &rows)
        .with_context(|| format!("merge failed for {}", path.display()))?;

    Ok(MergeOutcome {
        rows_before,
        rows_after,
    })
}
