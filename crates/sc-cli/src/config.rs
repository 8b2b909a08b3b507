//! `--config` file: limit settings and grouping taxonomy.

use anyhow::{Context, Result};
use sc_inference::{LimitConfig, Taxonomy};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level config; absent sections take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SrcombConfig {
    pub limit: LimitConfig,
    pub taxonomy: Taxonomy,
}

impl SrcombConfig {
    pub fn validate(&self) -> Result<()> {
        self.limit.validate().context("invalid `limit` section")?;
        self.taxonomy.validate().context("invalid `taxonomy` section")?;
        Ok(())
    }
}

/// Read a YAML config, or JSON when the extension says so.
pub fn read_config(path: &Path) -> Result<SrcombConfig> {
    let bytes = std::fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("").to_ascii_lowercase();
    let cfg: SrcombConfig = if ext == "json" {
        serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?
    } else {
        serde_yaml_ng::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?
    };
    cfg.validate()?;
    Ok(cfg)
}

/// Config from `--config`, or defaults.
pub fn load_config(path: Option<&Path>) -> Result<SrcombConfig> {
    match path {
        Some(p) => {
            tracing::info!(path = %p.display(), "loading config");
            read_config(p)
        }
        None => Ok(SrcombConfig::default()),
    }
}
