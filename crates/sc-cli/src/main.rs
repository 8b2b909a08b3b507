//! srcomb CLI

mod batch;
mod config;
mod discover;
mod filter;
mod survey;
mod table;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sc_core::types::{CombinationResult, LuminosityFactor};
use sc_inference::{
    CrossDetectorMode, GroupingSearch, LimitCalculator, RegionCombiner, Significance,
};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::{SrcombConfig, load_config};
use crate::filter::FilterMode;
use crate::table::{WhitespaceTable, read_region_table};

#[derive(Parser)]
#[command(name = "srcomb")]
#[command(about = "srcomb - signal-region combination and expected CLs limits")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    /// YAML (or .json) config with optional `limit` and `taxonomy` sections
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Limit-setting overrides shared by the computing commands.
#[derive(clap::Args, Debug, Clone, Default)]
struct LimitArgs {
    /// Multiplier on `1.64 * ds` in r_exp_cons (0 reproduces the unshifted ratio)
    #[arg(long)]
    signal_shift: Option<f64>,

    /// Initial POI upper bound of the limit search
    #[arg(long)]
    poi_upper_bound: Option<f64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    BestUnion,
    AllPairs,
}

impl From<ModeArg> for CrossDetectorMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::BestUnion => CrossDetectorMode::BestUnion,
            ModeArg::AllPairs => CrossDetectorMode::AllPairs,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Expected limit and r_exp_cons of one region
    Limit {
        /// Signal yield
        s: f64,
        /// Signal uncertainty
        ds: f64,
        /// Background yield
        b: f64,
        /// Background uncertainty
        db: f64,

        /// Luminosity factor (repeatable)
        #[arg(long = "lumi", default_values_t = [1.0])]
        lumi: Vec<f64>,

        /// Also report the expected s95 band (-2, -1, 0, +1, +2 sigma)
        #[arg(long)]
        band: bool,

        #[command(flatten)]
        limit: LimitArgs,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Combine every row of a region table into one grouping
    Combine {
        /// Tab-separated region table
        #[arg(short, long)]
        input: PathBuf,

        /// Luminosity factor (repeatable)
        #[arg(long = "lumi", default_values_t = [1.0])]
        lumi: Vec<f64>,

        #[command(flatten)]
        limit: LimitArgs,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Grouping search on one region table
    Best {
        /// Tab-separated region table
        #[arg(short, long)]
        input: PathBuf,

        /// Luminosity factor
        #[arg(long, default_value = "1.0")]
        lumi: f64,

        /// Cross-detector combination (overrides the taxonomy)
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        #[command(flatten)]
        limit: LimitArgs,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Grouping search over every `<root>/<point>/filtered_regions.txt`
    Batch {
        /// Directory holding one folder per model point
        #[arg(long, default_value = "filtered_regions")]
        root: PathBuf,

        /// Folder-name prefix before the point identifiers
        #[arg(long, default_value = "fpvdm_")]
        prefix: String,

        /// Luminosity factor
        #[arg(long, default_value = "1.0", conflicts_with = "target_lumi")]
        lumi: f64,

        /// Project to this integrated luminosity (fb^-1) instead of `--lumi`
        #[arg(long)]
        target_lumi: Option<f64>,

        /// Integrated luminosity of the inputs (fb^-1)
        #[arg(long, default_value = "139.0")]
        baseline_lumi: f64,

        /// Cross-detector combination (overrides the taxonomy)
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        #[command(flatten)]
        limit: LimitArgs,

        /// Output file (tab-separated). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Threads (0 = auto).
        #[arg(long, default_value = "0")]
        threads: usize,
    },

    /// Keep the relevant rows of CheckMATE `total_results.txt` tables
    Filter {
        /// CheckMATE results directory
        #[arg(long)]
        results: PathBuf,

        /// Output root (one folder per model point)
        #[arg(long, default_value = "filtered_regions")]
        out: PathBuf,

        /// Only folders starting with this prefix
        #[arg(long, default_value = "fpvdm_")]
        prefix: String,

        /// Keep rows with rexpcons above this value
        #[arg(long, default_value = "0.15")]
        threshold: f64,

        /// Rank rows and keep between `--min-keep` and `--max-keep` of them
        #[arg(long)]
        adaptive: bool,

        /// Adaptive mode: rexpcons threshold
        #[arg(long, default_value = "0.05", requires = "adaptive")]
        min_threshold: f64,

        /// Adaptive mode: minimum rows kept
        #[arg(long, default_value = "4", requires = "adaptive")]
        min_keep: usize,

        /// Adaptive mode: maximum rows kept
        #[arg(long, default_value = "20", requires = "adaptive")]
        max_keep: usize,
    },

    /// Rank the signal regions of every `best_signal_regions.txt` across a scan
    Regions {
        /// CheckMATE results directory
        #[arg(long)]
        results: PathBuf,

        /// Only folders starting with this prefix
        #[arg(long, default_value = "fpvdm_")]
        prefix: String,

        /// Rows taken from each point before merging
        #[arg(long, default_value = "5")]
        top: usize,

        /// Output file (tab-separated). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Discovery significances of the best row of a CheckMATE table
    Significance {
        /// Whitespace-separated CheckMATE table (e.g. best_signal_regions.txt)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the grouping taxonomy in use as YAML
    Taxonomy,

    /// Print version
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cfg = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Limit { s, ds, b, db, lumi, band, limit, output } => {
            cmd_limit(&cfg, [s, ds, b, db], &lumi, band, &limit, output.as_deref())
        }
        Commands::Combine { input, lumi, limit, output } => {
            cmd_combine(&cfg, &input, &lumi, &limit, output.as_deref())
        }
        Commands::Best { input, lumi, mode, limit, output } => {
            cmd_best(&cfg, &input, lumi, mode, &limit, output.as_deref())
        }
        Commands::Batch {
            root,
            prefix,
            lumi,
            target_lumi,
            baseline_lumi,
            mode,
            limit,
            output,
            threads,
        } => {
            let k = match target_lumi {
                Some(target) => LuminosityFactor::from_luminosities(target, baseline_lumi)?,
                None => LuminosityFactor::new(lumi)?,
            };
            cmd_batch(&cfg, &root, &prefix, k, mode, &limit, output.as_deref(), threads)
        }
        Commands::Filter {
            results,
            out,
            prefix,
            threshold,
            adaptive,
            min_threshold,
            min_keep,
            max_keep,
        } => {
            let mode = if adaptive {
                FilterMode::Adaptive { min_threshold, min_keep, max_keep }
            } else {
                FilterMode::Fixed { threshold }
            };
            cmd_filter(&results, &out, &prefix, mode)
        }
        Commands::Regions { results, prefix, top, output } => {
            cmd_regions(&results, &prefix, top, output.as_deref())
        }
        Commands::Significance { input, output } => cmd_significance(&input, output.as_deref()),
        Commands::Taxonomy => {
            print!("{}", serde_yaml_ng::to_string(&cfg.taxonomy)?);
            Ok(())
        }
        Commands::Version => {
            println!("srcomb {}", sc_core::VERSION);
            Ok(())
        }
    }
}

fn calculator(cfg: &SrcombConfig, args: &LimitArgs) -> Result<LimitCalculator> {
    let mut limit = cfg.limit.clone();
    if let Some(shift) = args.signal_shift {
        limit.signal_shift = shift;
    }
    if let Some(bound) = args.poi_upper_bound {
        limit.poi_upper_bound = bound;
    }
    Ok(LimitCalculator::new(limit)?)
}

fn grouping_search(
    cfg: &SrcombConfig,
    mode: Option<ModeArg>,
    args: &LimitArgs,
) -> Result<GroupingSearch> {
    let mut taxonomy = cfg.taxonomy.clone();
    if let Some(m) = mode {
        taxonomy.cross_detector = m.into();
    }
    Ok(GroupingSearch::new(taxonomy, RegionCombiner::new(calculator(cfg, args)?))?)
}

fn factors(values: &[f64]) -> Result<Vec<LuminosityFactor>> {
    values.iter().map(|&k| LuminosityFactor::new(k).map_err(anyhow::Error::from)).collect()
}

#[derive(Debug, Serialize)]
struct LimitOutput {
    #[serde(flatten)]
    result: CombinationResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    s95_expected_band: Option<[f64; 5]>,
}

fn cmd_limit(
    cfg: &SrcombConfig,
    [s, ds, b, db]: [f64; 4],
    lumi: &[f64],
    band: bool,
    args: &LimitArgs,
    output: Option<&Path>,
) -> Result<()> {
    let calc = calculator(cfg, args)?;
    let region = sc_core::SignalRegionYield::new("cli", "region", s, ds, b, db);
    let ks = factors(lumi)?;

    let results = calc.compute_scaled(&region, &ks)?;
    let mut out = Vec::with_capacity(results.len());
    for (result, k) in results.into_iter().zip(&ks) {
        let s95_expected_band = if band {
            let scaled = region.scaled(*k);
            Some(calc.expected_band(scaled.s, scaled.ds, scaled.b, scaled.db)?)
        } else {
            None
        };
        tracing::info!(lumi = k.value(), s95exp = result.s95exp, r = result.r_exp_cons, "limit");
        out.push(LimitOutput { result, s95_expected_band });
    }
    write_json(output, &out)
}

fn cmd_combine(
    cfg: &SrcombConfig,
    input: &Path,
    lumi: &[f64],
    args: &LimitArgs,
    output: Option<&Path>,
) -> Result<()> {
    let regions = read_region_table(input)?;
    tracing::info!(path = %input.display(), regions = regions.len(), "table loaded");
    let combiner = RegionCombiner::new(calculator(cfg, args)?);
    let results = combiner
        .combine(&regions, &factors(lumi)?)
        .with_context(|| format!("combine {}", input.display()))?;
    write_json(output, &results)
}

fn cmd_best(
    cfg: &SrcombConfig,
    input: &Path,
    lumi: f64,
    mode: Option<ModeArg>,
    args: &LimitArgs,
    output: Option<&Path>,
) -> Result<()> {
    let regions = read_region_table(input)?;
    let search = grouping_search(cfg, mode, args)?;
    let summary = search.evaluate(&regions, LuminosityFactor::new(lumi)?)?;
    write_json(output, &summary)
}

#[allow(clippy::too_many_arguments)]
fn cmd_batch(
    cfg: &SrcombConfig,
    root: &Path,
    prefix: &str,
    k: LuminosityFactor,
    mode: Option<ModeArg>,
    args: &LimitArgs,
    output: Option<&Path>,
    threads: usize,
) -> Result<()> {
    if threads > 0 {
        // Best-effort; if a global pool already exists, keep going.
        let _ = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global();
    }
    let search = grouping_search(cfg, mode, args)?;
    let rows = batch::run_batch(root, prefix, &search, k)?;
    let detectors = search.taxonomy().detector_names();

    match output {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("create {}", path.display()))?;
            batch::write_summary(file, &rows, &detectors)?;
            tracing::info!(path = %path.display(), rows = rows.len(), "summary written");
        }
        None => batch::write_summary(std::io::stdout().lock(), &rows, &detectors)?,
    }
    Ok(())
}

fn cmd_filter(results: &Path, out: &Path, prefix: &str, mode: FilterMode) -> Result<()> {
    let reports = filter::filter_results(results, out, prefix, mode)?;
    println!("Summary:");
    for r in &reports {
        println!("{r}");
    }
    Ok(())
}

fn cmd_regions(results: &Path, prefix: &str, top: usize, output: Option<&Path>) -> Result<()> {
    let rows = survey::survey_results(results, prefix, top)?;
    match output {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("create {}", path.display()))?;
            survey::write_survey(file, &rows)?;
            tracing::info!(path = %path.display(), rows = rows.len(), "survey written");
        }
        None => survey::write_survey(std::io::stdout().lock(), &rows)?,
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct SignificanceOutput {
    analysis: String,
    sr: String,
    s: f64,
    b: f64,
    db: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    s95exp: Option<f64>,
    rexpcons: f64,
    #[serde(flatten)]
    significance: Significance,
}

fn cmd_significance(input: &Path, output: Option<&Path>) -> Result<()> {
    let table = WhitespaceTable::read(input)?;
    table.require(&["analysis", "sr", "s", "b", "db", "rexpcons"], input)?;

    let mut best: Option<(usize, f64)> = None;
    for i in 0..table.rows.len() {
        let r = table.required_number(i, "rexpcons")?;
        if best.is_none_or(|(_, b)| r > b) {
            best = Some((i, r));
        }
    }
    let Some((row, rexpcons)) = best else {
        anyhow::bail!("{}: table has no rows", input.display());
    };

    let (s, b, db) = (
        table.required_number(row, "s")?,
        table.required_number(row, "b")?,
        table.required_number(row, "db")?,
    );
    let out = SignificanceOutput {
        analysis: table.text(row, "analysis").unwrap_or_default().to_string(),
        sr: table.text(row, "sr").unwrap_or_default().to_string(),
        s,
        b,
        db,
        s95exp: table.number(row, "s95exp")?,
        rexpcons,
        significance: Significance::new(s, b, db),
    };
    write_json(output, &out)
}

fn write_json<T: Serialize + ?Sized>(output: Option<&Path>, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    if let Some(path) = output {
        std::fs::write(path, text).with_context(|| format!("write {}", path.display()))?;
    } else {
        println!("{text}");
    }
    Ok(())
}
