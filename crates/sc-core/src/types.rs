//! Signal-region data model
//!
//! Column names follow the CheckMATE result tables (`analysis`, `sr`, `b`, `db`,
//! `s`, `ds`) so rows deserialize straight from the delimited-text inputs.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Yields of one signal region of one analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRegionYield {
    /// Analysis identifier (e.g. `atlas_2004_14060`).
    pub analysis: String,
    /// Signal-region name within the analysis.
    #[serde(rename = "sr")]
    pub region: String,
    /// Expected signal yield.
    pub s: f64,
    /// Absolute uncertainty on `s`.
    pub ds: f64,
    /// Expected background yield.
    pub b: f64,
    /// Absolute uncertainty on `b`.
    pub db: f64,
}

impl SignalRegionYield {
    /// Create a region from its labels and yields.
    pub fn new(
        analysis: impl Into<String>,
        region: impl Into<String>,
        s: f64,
        ds: f64,
        b: f64,
        db: f64,
    ) -> Self {
        Self { analysis: analysis.into(), region: region.into(), s, ds, b, db }
    }

    /// `analysis:region`, used in logs and summaries.
    pub fn label(&self) -> String {
        format!("{}:{}", self.analysis, self.region)
    }

    /// Check that every yield is finite and non-negative.
    ///
    /// `b == 0` passes here; the limit model rejects it later, which keeps
    /// zero-background regions loadable for inspection.
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [("s", self.s), ("ds", self.ds), ("b", self.b), ("db", self.db)] {
            if !v.is_finite() || v < 0.0 {
                return Err(Error::Validation(format!(
                    "{}: {} must be finite and >= 0, got {}",
                    self.label(),
                    name,
                    v
                )));
            }
        }
        Ok(())
    }

    /// Yields at luminosity factor `k`: `s·k`, `ds·√k`, `b·k`, `db·√k`.
    pub fn scaled(&self, k: LuminosityFactor) -> ScaledRegion {
        let root = k.sqrt();
        ScaledRegion {
            s: self.s * k.value(),
            ds: self.ds * root,
            b: self.b * k.value(),
            db: self.db * root,
        }
    }
}

/// Multiplicative luminosity scaling `k > 0` applied to baseline yields.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct LuminosityFactor(f64);

impl LuminosityFactor {
    /// No rescaling.
    pub const IDENTITY: LuminosityFactor = LuminosityFactor(1.0);

    /// Validated constructor: `k` must be finite and `> 0`.
    pub fn new(k: f64) -> Result<Self> {
        if !k.is_finite() || k <= 0.0 {
            return Err(Error::Validation(format!(
                "luminosity factor must be finite and > 0, got {}",
                k
            )));
        }
        Ok(Self(k))
    }

    /// Factor projecting a `baseline` integrated luminosity to `target`
    /// (e.g. `3000 / 139` fb⁻¹).
    pub fn from_luminosities(target: f64, baseline: f64) -> Result<Self> {
        if !baseline.is_finite() || baseline <= 0.0 {
            return Err(Error::Validation(format!(
                "baseline luminosity must be finite and > 0, got {}",
                baseline
            )));
        }
        Self::new(target / baseline)
    }

    /// Raw factor.
    pub fn value(self) -> f64 {
        self.0
    }

    /// `√k`, the scaling of absolute uncertainties.
    pub fn sqrt(self) -> f64 {
        self.0.sqrt()
    }
}

impl TryFrom<f64> for LuminosityFactor {
    type Error = Error;

    fn try_from(k: f64) -> Result<Self> {
        Self::new(k)
    }
}

impl From<LuminosityFactor> for f64 {
    fn from(k: LuminosityFactor) -> f64 {
        k.0
    }
}

impl std::fmt::Display for LuminosityFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Yields after luminosity scaling; also carries the totals of a combined grouping.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScaledRegion {
    /// Signal yield.
    pub s: f64,
    /// Signal uncertainty.
    pub ds: f64,
    /// Background yield.
    pub b: f64,
    /// Background uncertainty.
    pub db: f64,
}

/// Expected-limit result of one grouping at one luminosity factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinationResult {
    /// Luminosity factor this result was computed at.
    pub luminosity_factor: f64,
    /// Combined (scaled) signal yield.
    pub s: f64,
    /// Combined signal uncertainty.
    pub ds: f64,
    /// Combined background yield.
    pub b: f64,
    /// Combined background uncertainty.
    pub db: f64,
    /// Expected 95% CL upper limit on the signal yield.
    pub s95exp: f64,
    /// Conservative expected exclusion ratio `(s - 1.64 ds) / s95exp`.
    pub r_exp_cons: f64,
}

impl CombinationResult {
    /// Combined yields as a [`ScaledRegion`].
    pub fn totals(&self) -> ScaledRegion {
        ScaledRegion { s: self.s, ds: self.ds, b: self.b, db: self.db }
    }
}
