//! `srcomb filter`: keep the relevant rows of CheckMATE `total_results.txt` tables.

use crate::discover::find_point_dirs;
use crate::table::{FILTERED_COLUMNS, WhitespaceTable, format_g};
use anyhow::{Context, Result};
use serde::Serialize;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

/// Name of the per-point table written by the filter.
pub const FILTERED_FILE: &str = "filtered_regions.txt";

/// Row selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterMode {
    /// `rexpcons > threshold`; points with no such row are skipped.
    Fixed { threshold: f64 },
    /// Best rows first: those over `min_threshold`, padded up to `min_keep`
    /// with the next best and capped at `max_keep`.
    Adaptive { min_threshold: f64, min_keep: usize, max_keep: usize },
}

/// Outcome for one model point folder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterReport {
    pub folder: String,
    /// Rows written, `0` when nothing passed the filter
    pub kept: usize,
    pub error: Option<String>,
}

impl std::fmt::Display for FilterReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error {
            Some(e) => write!(f, "{}: Error: {}", self.folder, e),
            None => write!(f, "{}: {}", self.folder, self.kept),
        }
    }
}

/// Row indices kept by `mode`, in output order.
pub fn select_rows(rexpcons: &[f64], mode: FilterMode) -> Vec<usize> {
    match mode {
        FilterMode::Fixed { threshold } => {
            (0..rexpcons.len()).filter(|&i| rexpcons[i] > threshold).collect()
        }
        FilterMode::Adaptive { min_threshold, min_keep, max_keep } => {
            let mut order: Vec<usize> = (0..rexpcons.len()).collect();
            // Stable: equal values keep file order.
            order.sort_by(|&a, &b| {
                rexpcons[b].partial_cmp(&rexpcons[a]).unwrap_or(Ordering::Equal)
            });
            let passing = order.iter().filter(|&&i| rexpcons[i] > min_threshold).count();
            let keep = if passing < min_keep {
                min_keep.min(order.len())
            } else {
                passing.min(max_keep)
            };
            // Sorted descending, so the passing rows are a prefix.
            order.truncate(keep);
            order
        }
    }
}

/// Filter one `total_results.txt` into `out_file`; returns rows written.
pub fn filter_table(input: &Path, out_file: &Path, mode: FilterMode) -> Result<usize> {
    let table = WhitespaceTable::read(input)?;
    table.require(&FILTERED_COLUMNS, input)?;

    let r: Vec<f64> = (0..table.rows.len())
        .map(|i| table.required_number(i, "rexpcons"))
        .collect::<Result<_>>()
        .with_context(|| format!("read rexpcons of {}", input.display()))?;
    let rows = select_rows(&r, mode);
    if rows.is_empty() {
        return Ok(0);
    }

    if let Some(dir) = out_file.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(out_file)
        .with_context(|| format!("create {}", out_file.display()))?;
    wtr.write_record(FILTERED_COLUMNS)?;
    for &i in &rows {
        let mut record = Vec::with_capacity(FILTERED_COLUMNS.len());
        for col in FILTERED_COLUMNS {
            let cell = match col {
                "analysis" | "sr" => table.text(i, col).unwrap_or_default().to_string(),
                _ => format_g(table.required_number(i, col)?, 5),
            };
            record.push(cell);
        }
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(rows.len())
}

/// Filter every `<results>/<prefix>*/evaluation/total_results.txt`.
///
/// A failing folder is reported and the others continue.
pub fn filter_results(
    results: &Path,
    out_root: &Path,
    prefix: &str,
    mode: FilterMode,
) -> Result<Vec<FilterReport>> {
    let mut reports = Vec::new();
    for dir in find_point_dirs(results, prefix)? {
        let input: PathBuf = dir.join("evaluation").join("total_results.txt");
        if !input.is_file() {
            continue;
        }
        let folder = dir.file_name().and_then(|s| s.to_str()).unwrap_or_default().to_string();
        let out_file = out_root.join(&folder).join(FILTERED_FILE);

        let report = match filter_table(&input, &out_file, mode) {
            Ok(0) => continue,
            Ok(kept) => FilterReport { folder, kept, error: None },
            Err(e) => {
                tracing::warn!(folder = %folder, error = %format!("{e:#}"), "filter failed");
                FilterReport { folder, kept: 0, error: Some(format!("{e:#}")) }
            }
        };
        tracing::info!(folder = %report.folder, kept = report.kept, "filtered");
        reports.push(report);
    }
    Ok(reports)
}
