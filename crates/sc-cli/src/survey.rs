//! `srcomb regions`: which signal regions rank highest across a scan.

use crate::discover::find_point_dirs;
use crate::table::{WhitespaceTable, format_g};
use anyhow::{Context, Result, bail};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::Path;

/// Per-point table ranked by the survey.
pub const BEST_FILE: &str = "best_signal_regions.txt";

/// One ranked `(analysis, sr)` pair and the point it scored best at.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedRegion {
    pub point: String,
    pub analysis: String,
    pub sr: String,
    pub rexpcons: f64,
}

fn by_rexpcons_desc(a: &RankedRegion, b: &RankedRegion) -> Ordering {
    b.rexpcons.partial_cmp(&a.rexpcons).unwrap_or(Ordering::Equal)
}

/// The `top` best rows of one table.
pub fn top_rows(table: &WhitespaceTable, point: &str, top: usize) -> Result<Vec<RankedRegion>> {
    let mut rows = Vec::with_capacity(table.rows.len());
    for i in 0..table.rows.len() {
        rows.push(RankedRegion {
            point: point.to_string(),
            analysis: table.text(i, "analysis").unwrap_or_default().to_string(),
            sr: table.text(i, "sr").unwrap_or_default().to_string(),
            rexpcons: table.required_number(i, "rexpcons")?,
        });
    }
    rows.sort_by(by_rexpcons_desc);
    rows.truncate(top);
    Ok(rows)
}

/// Best row per `(analysis, sr)`, sorted by `rexpcons` descending.
///
/// Ties keep the earlier entry.
pub fn dedup_best(mut rows: Vec<RankedRegion>) -> Vec<RankedRegion> {
    rows.sort_by(by_rexpcons_desc);
    let mut seen = HashSet::new();
    rows.retain(|r| seen.insert((r.analysis.clone(), r.sr.clone())));
    rows
}

/// Survey every `<results>/<prefix>*/evaluation/best_signal_regions.txt`.
///
/// Unreadable tables are logged and skipped.
pub fn survey_results(results: &Path, prefix: &str, top: usize) -> Result<Vec<RankedRegion>> {
    let mut all = Vec::new();
    let mut tables = 0usize;
    for dir in find_point_dirs(results, prefix)? {
        let path = dir.join("evaluation").join(BEST_FILE);
        if !path.is_file() {
            continue;
        }
        let point = dir.file_name().and_then(|s| s.to_str()).unwrap_or_default();
        let ranked = WhitespaceTable::read(&path)
            .and_then(|t| {
                t.require(&["analysis", "sr", "rexpcons"], &path)?;
                top_rows(&t, point, top)
            })
            .with_context(|| format!("rank {}", path.display()));
        match ranked {
            Ok(rows) => {
                tables += 1;
                all.extend(rows);
            }
            Err(e) => tracing::warn!(point, error = %format!("{e:#}"), "table skipped"),
        }
    }
    if tables == 0 {
        bail!(sc_core::Error::MissingInput(format!(
            "no readable {} under {} for prefix `{}`",
            BEST_FILE,
            results.display(),
            prefix
        )));
    }
    tracing::info!(tables, candidates = all.len(), "survey ranked");
    Ok(dedup_best(all))
}

/// Tab-separated `point analysis sr rexpcons`.
pub fn write_survey<W: std::io::Write>(out: W, rows: &[RankedRegion]) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new().delimiter(b'\t').from_writer(out);
    wtr.write_record(["point", "analysis", "sr", "rexpcons"])?;
    for r in rows {
        let rexpcons = format_g(r.rexpcons, 5);
        wtr.write_record([r.point.as_str(), &r.analysis, &r.sr, &rexpcons])?;
    }
    wtr.flush()?;
    Ok(())
}
