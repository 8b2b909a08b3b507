//! Delimited-text tables: region TSVs, CheckMATE result tables, `%g` formatting.

use anyhow::{Context, Result, bail};
use sc_core::Error;
use sc_core::types::SignalRegionYield;
use std::path::Path;

/// Columns every region table must carry.
pub const REGION_COLUMNS: [&str; 6] = ["analysis", "sr", "b", "db", "s", "ds"];

/// Columns of `filtered_regions.txt`, in output order.
pub const FILTERED_COLUMNS: [&str; 7] = ["analysis", "sr", "b", "db", "s", "ds", "rexpcons"];

fn check_columns(found: &[&str], required: &[&str], path: &Path) -> Result<()> {
    let missing: Vec<&str> = required.iter().copied().filter(|c| !found.contains(c)).collect();
    if !missing.is_empty() {
        return Err(Error::MissingInput(format!(
            "{}: missing column(s) {}",
            path.display(),
            missing.join(", ")
        ))
        .into());
    }
    Ok(())
}

/// Read a tab-separated region table (`filtered_regions.txt` layout).
pub fn read_region_table(path: &Path) -> Result<Vec<SignalRegionYield>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("open {}", path.display()))?;

    let headers =
        rdr.headers().with_context(|| format!("read header of {}", path.display()))?.clone();
    let names: Vec<&str> = headers.iter().collect();
    check_columns(&names, &REGION_COLUMNS, path)?;

    let mut out = Vec::new();
    for (i, row) in rdr.deserialize::<SignalRegionYield>().enumerate() {
        out.push(row.with_context(|| format!("{}: row {}", path.display(), i + 1))?);
    }
    Ok(out)
}

/// Whitespace-separated table with a header line; `#` lines are comments.
#[derive(Debug, Clone, PartialEq)]
pub struct WhitespaceTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl WhitespaceTable {
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text
            .lines()
            .map(str::trim)
            .enumerate()
            .filter(|(_, l)| !l.is_empty() && !l.starts_with('#'));

        let Some((_, head)) = lines.next() else {
            return Err(Error::MissingInput("table has no header line".to_string()).into());
        };
        let header: Vec<String> = head.split_whitespace().map(str::to_string).collect();

        let mut rows = Vec::new();
        for (lineno, line) in lines {
            let fields: Vec<String> = line.split_whitespace().map(str::to_string).collect();
            if fields.len() != header.len() {
                bail!(
                    "line {}: {} fields, header has {}",
                    lineno + 1,
                    fields.len(),
                    header.len()
                );
            }
            rows.push(fields);
        }
        Ok(Self { header, rows })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parse {}", path.display()))
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    pub fn require(&self, names: &[&str], path: &Path) -> Result<()> {
        let found: Vec<&str> = self.header.iter().map(String::as_str).collect();
        check_columns(&found, names, path)
    }

    /// Numeric cell; `None` for a missing column.
    pub fn number(&self, row: usize, column: &str) -> Result<Option<f64>> {
        let Some(c) = self.column(column) else {
            return Ok(None);
        };
        let cell = &self.rows[row][c];
        let v = cell.parse::<f64>().with_context(|| {
            format!("row {}: `{}` is not a number in column {}", row + 1, cell, column)
        })?;
        Ok(Some(v))
    }

    pub fn text(&self, row: usize, column: &str) -> Option<&str> {
        self.column(column).map(|c| self.rows[row][c].as_str())
    }

    /// Numeric cell of a column already checked with [`Self::require`].
    pub fn required_number(&self, row: usize, column: &str) -> Result<f64> {
        self.number(row, column)?
            .ok_or_else(|| Error::MissingInput(format!("column {}", column)).into())
    }
}

/// C `printf("%.{sig}g")`.
pub fn format_g(x: f64, sig: usize) -> String {
    if x.is_nan() {
        return "nan".to_string();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if x == 0.0 {
        return "0".to_string();
    }
    let sig = sig.max(1);

    // `{:e}` rounds to `sig` digits and gives the post-rounding exponent.
    let sci = format!("{:.*e}", sig - 1, x);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };

    if exp < -4 || exp >= sig as i32 {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", trim_zeros(mantissa), sign, exp.abs())
    } else {
        let decimals = (sig as i32 - 1 - exp).max(0) as usize;
        trim_zeros(&format!("{:.*}", decimals, x)).to_string()
    }
}

fn trim_zeros(s: &str) -> &str {
    if s.contains('.') { s.trim_end_matches('0').trim_end_matches('.') } else { s }
}
