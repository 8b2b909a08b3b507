//! `srcomb batch`: grouping search over every model point of a filtered tree.

use crate::discover::find_point_tables;
use crate::filter::FILTERED_FILE;
use crate::table::{format_g, read_region_table};
use anyhow::{Context, Result, bail};
use rayon::prelude::*;
use sc_core::types::LuminosityFactor;
use sc_inference::{GroupingSearch, OverlapPolicy, PointSummary};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

/// Model point parsed from a folder name like `fpvdm_Mtp2000DMV100`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointId {
    pub mtp: u64,
    pub dmv: f64,
}

impl PointId {
    /// Parse `<prefix>[Mtp]<int>DMV<number>`; anything after the number is ignored.
    pub fn parse(folder: &str, prefix: &str) -> Option<Self> {
        let rest = folder.strip_prefix(prefix)?;
        let rest = rest.strip_prefix("Mtp").unwrap_or(rest);

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return None;
        }
        let mtp = rest[..digits].parse().ok()?;
        let rest = rest[digits..].strip_prefix("DMV")?;

        let int_len = rest.bytes().take_while(u8::is_ascii_digit).count();
        if int_len == 0 {
            return None;
        }
        let mut end = int_len;
        if let Some(frac) = rest[int_len..].strip_prefix('.') {
            let frac_len = frac.bytes().take_while(u8::is_ascii_digit).count();
            if frac_len > 0 {
                end += 1 + frac_len;
            }
        }
        let dmv = rest[..end].parse().ok()?;
        Some(Self { mtp, dmv })
    }

    fn cmp_key(&self, other: &Self) -> Ordering {
        self.mtp.cmp(&other.mtp).then(self.dmv.partial_cmp(&other.dmv).unwrap_or(Ordering::Equal))
    }
}

/// One output row.
#[derive(Debug, Clone)]
pub struct PointRow {
    pub point: PointId,
    pub lumi: f64,
    pub summary: PointSummary,
}

/// `Mtp DMV Lumi Best_Individual Best_<DET>... Best_Combined Overall_Best`
pub fn header(detectors: &[&str]) -> Vec<String> {
    let mut h: Vec<String> = ["Mtp", "DMV", "Lumi", "Best_Individual"].map(String::from).to_vec();
    h.extend(detectors.iter().map(|d| format!("Best_{d}")));
    h.push("Best_Combined".to_string());
    h.push("Overall_Best".to_string());
    h
}

impl PointRow {
    /// Cells in [`header`] order; absent values print as `-1`.
    pub fn cells(&self, detectors: &[&str]) -> Vec<String> {
        let r = |c: Option<&sc_inference::Candidate>| format_g(c.map_or(-1.0, |c| c.r_exp_cons), 4);
        let s = &self.summary;
        let mut out = vec![
            self.point.mtp.to_string(),
            format_g(self.point.dmv, 4),
            format_g(self.lumi, 4),
            r(Some(&s.best_individual)),
        ];
        out.extend(detectors.iter().map(|d| r(s.detector(d))));
        out.push(r(s.combined.as_ref()));
        out.push(r(Some(&s.overall_best)));
        out
    }
}

/// Evaluate one `filtered_regions.txt`; `Ok(None)` for an empty table.
pub fn process_point<P: OverlapPolicy>(
    path: &Path,
    prefix: &str,
    search: &GroupingSearch<P>,
    k: LuminosityFactor,
) -> Result<Option<PointRow>> {
    let folder = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let Some(point) = PointId::parse(folder, prefix) else {
        bail!("cannot parse model point from folder name `{folder}`");
    };

    let regions = read_region_table(path)?;
    if regions.is_empty() {
        return Ok(None);
    }
    let summary = search
        .evaluate(&regions, k)
        .with_context(|| format!("grouping search for {folder}"))?;
    Ok(Some(PointRow { point, lumi: k.value(), summary }))
}

/// Every point under `root`, in parallel; failing points are logged and skipped.
pub fn run_batch<P: OverlapPolicy>(
    root: &Path,
    prefix: &str,
    search: &GroupingSearch<P>,
    k: LuminosityFactor,
) -> Result<Vec<PointRow>> {
    let tables: Vec<PathBuf> = find_point_tables(root, FILTERED_FILE)?;
    tracing::info!(root = %root.display(), points = tables.len(), "batch start");

    let mut rows: Vec<PointRow> = tables
        .par_iter()
        .filter_map(|path| match process_point(path, prefix, search, k) {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %format!("{e:#}"), "point skipped");
                None
            }
        })
        .collect();
    rows.sort_by(|a, b| a.point.cmp_key(&b.point));
    tracing::info!(rows = rows.len(), "batch done");
    Ok(rows)
}

/// Tab-separated summary table.
pub fn write_summary<W: std::io::Write>(
    out: W,
    rows: &[PointRow],
    detectors: &[&str],
) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new().delimiter(b'\t').from_writer(out);
    wtr.write_record(header(detectors))?;
    for row in rows {
        wtr.write_record(row.cells(detectors))?;
    }
    wtr.flush()?;
    Ok(())
}
