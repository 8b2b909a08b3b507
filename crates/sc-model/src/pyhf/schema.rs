//! Workspace JSON for binned counting models.
//!
//! Field names follow the pyhf interchange format so workspaces written by
//! pyhf load unchanged. Only the two modifiers a signal-region likelihood
//! needs are understood: a free signal strength (`normfactor`) and a
//! normalization uncertainty (`normsys`). Any other modifier type fails to
//! deserialize.

use serde::{Deserialize, Serialize};

/// A complete likelihood description: regions, their data and the fit setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    /// Signal regions with their expected yields
    pub channels: Vec<Channel>,
    /// Observed counts, matched to channels by name
    pub observations: Vec<Observation>,
    /// Fit setups; the first one is used
    pub measurements: Vec<Measurement>,
    /// Format version string, not checked
    #[serde(default)]
    pub version: Option<String>,
}

/// One signal region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    /// Region name
    pub name: String,
    /// Contributions summed into the expected count
    pub samples: Vec<Sample>,
}

/// One contribution to a region, e.g. `signal` or `background`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    /// Process name
    pub name: String,
    /// Nominal yield per bin
    pub data: Vec<f64>,
    /// Multiplicative factors applied to `data`
    pub modifiers: Vec<Modifier>,
}

/// Multiplicative factor on a sample, tied to the parameter of the same name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Modifier {
    /// Unconstrained scale; the signal strength `mu` is one of these
    #[serde(rename = "normfactor")]
    NormFactor {
        /// Parameter name
        name: String,
        /// Ignored
        #[serde(default)]
        data: Option<serde_json::Value>,
    },

    /// Gaussian-constrained rate uncertainty, interpolated between `lo` and `hi`
    #[serde(rename = "normsys")]
    NormSys {
        /// Parameter name
        name: String,
        /// Scale at `-1` and `+1` sigma
        data: NormSysData,
    },
}

impl Modifier {
    /// Name of the parameter this modifier depends on.
    pub fn name(&self) -> &str {
        match self {
            Modifier::NormFactor { name, .. } | Modifier::NormSys { name, .. } => name,
        }
    }
}

/// Sample scale at `+1` sigma (`hi`) and `-1` sigma (`lo`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NormSysData {
    /// Up scale
    pub hi: f64,
    /// Down scale
    pub lo: f64,
}

/// Observed counts of one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// Channel the counts belong to
    pub name: String,
    /// Counts per bin
    pub data: Vec<f64>,
}

/// Named fit setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measurement {
    /// Setup name
    pub name: String,
    /// POI and parameter overrides
    pub config: MeasurementConfig,
}

/// Which parameter is tested, and overrides for the others.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementConfig {
    /// Parameter of interest
    pub poi: String,
    /// Overrides keyed by parameter name
    #[serde(default)]
    pub parameters: Vec<ParameterConfig>,
}

/// Per-parameter overrides; empty lists keep the modifier defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterConfig {
    /// Parameter the overrides apply to
    pub name: String,
    /// Starting value (one entry)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inits: Vec<f64>,
    /// Allowed range as `[[min, max]]`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bounds: Vec<[f64; 2]>,
    /// Held at its starting value in every fit
    #[serde(default)]
    pub fixed: bool,
    /// Center of the Gaussian constraint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auxdata: Vec<f64>,
    /// Width of the Gaussian constraint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sigmas: Vec<f64>,
}
