//! HistFactory model representation
//!
//! Compiles a pyhf [`Workspace`] into a parameter vector plus per-sample
//! modifier lists, and evaluates the binned Poisson likelihood with Gaussian
//! constraints on `normsys` nuisance parameters.

use super::schema::*;
use sc_core::traits::LogDensityModel;
use sc_core::{Error, Result};
use std::collections::HashMap;

/// Default bounds of a free normalization factor (pyhf `normfactor`).
const NORMFACTOR_BOUNDS: (f64, f64) = (0.0, 10.0);
/// Default bounds of a `normsys` nuisance parameter (pyhf).
const NORMSYS_BOUNDS: (f64, f64) = (-5.0, 5.0);

/// HistFactory model
#[derive(Debug, Clone)]
pub struct HistFactoryModel {
    /// Model parameters
    parameters: Vec<Parameter>,
    /// Parameter of interest index
    poi_index: Option<usize>,
    /// Channels
    channels: Vec<ModelChannel>,
}

/// Model parameter
#[derive(Debug, Clone)]
pub struct Parameter {
    /// Parameter name
    pub name: String,
    /// Initial value
    pub init: f64,
    /// Bounds (min, max)
    pub bounds: (f64, f64),
    /// Is this a nuisance parameter with constraint?
    pub constrained: bool,
    /// Constraint center (for constrained NP)
    pub constraint_center: Option<f64>,
    /// Constraint width (for constrained NP)
    pub constraint_width: Option<f64>,
}

#[derive(Debug, Clone)]
struct ModelChannel {
    name: String,
    samples: Vec<ModelSample>,
    observed: Vec<f64>,
}

#[derive(Debug, Clone)]
struct ModelSample {
    nominal: Vec<f64>,
    modifiers: Vec<ModelModifier>,
}

#[derive(Debug, Clone, Copy)]
enum ModelModifier {
    NormFactor { param_idx: usize },
    NormSys { param_idx: usize, hi: f64, lo: f64 },
}

impl ModelModifier {
    fn param_idx(&self) -> usize {
        match *self {
            ModelModifier::NormFactor { param_idx } | ModelModifier::NormSys { param_idx, .. } => {
                param_idx
            }
        }
    }

    /// Multiplicative factor and its derivative with respect to the parameter.
    fn factor_and_derivative(&self, params: &[f64]) -> (f64, f64) {
        match *self {
            ModelModifier::NormFactor { param_idx } => (params[param_idx], 1.0),
            ModelModifier::NormSys { param_idx, hi, lo } => {
                normsys_code4(params[param_idx], hi, lo)
            }
        }
    }
}

impl HistFactoryModel {
    fn validate_params_len(&self, got: usize) -> Result<()> {
        let expected = self.parameters.len();
        if got != expected {
            return Err(Error::Validation(format!(
                "Parameter length mismatch: expected {}, got {}",
                expected, got
            )));
        }
        Ok(())
    }

    /// Create model from pyhf workspace
    pub fn from_workspace(ws: &Workspace) -> Result<Self> {
        let poi_name = ws
            .measurements
            .first()
            .map(|m| m.config.poi.clone())
            .ok_or_else(|| Error::Validation("Workspace has no measurement".to_string()))?;

        let mut parameters: Vec<Parameter> = Vec::new();
        let mut param_map: HashMap<String, usize> = HashMap::new();
        let mut channels = Vec::with_capacity(ws.channels.len());

        for channel in &ws.channels {
            let n_bins = channel.samples.first().map(|s| s.data.len()).ok_or_else(|| {
                Error::Validation(format!("Channel '{}' has no samples", channel.name))
            })?;

            let mut samples = Vec::with_capacity(channel.samples.len());
            for sample in &channel.samples {
                if sample.data.len() != n_bins {
                    return Err(Error::Validation(format!(
                        "Sample '{}' in channel '{}' has {} bins, expected {}",
                        sample.name,
                        channel.name,
                        sample.data.len(),
                        n_bins
                    )));
                }

                let mut modifiers = Vec::with_capacity(sample.modifiers.len());
                for modifier in &sample.modifiers {
                    let name = modifier.name();
                    let param_idx = match param_map.get(name) {
                        Some(&idx) => idx,
                        None => {
                            let idx = parameters.len();
                            parameters.push(match modifier {
                                Modifier::NormFactor { .. } => Parameter {
                                    name: name.to_string(),
                                    init: 1.0,
                                    bounds: NORMFACTOR_BOUNDS,
                                    constrained: false,
                                    constraint_center: None,
                                    constraint_width: None,
                                },
                                Modifier::NormSys { .. } => Parameter {
                                    name: name.to_string(),
                                    init: 0.0,
                                    bounds: NORMSYS_BOUNDS,
                                    constrained: true,
                                    constraint_center: Some(0.0),
                                    constraint_width: Some(1.0),
                                },
                            });
                            param_map.insert(name.to_string(), idx);
                            idx
                        }
                    };

                    modifiers.push(match modifier {
                        Modifier::NormFactor { .. } => ModelModifier::NormFactor { param_idx },
                        Modifier::NormSys { data, .. } => {
                            if !(data.hi.is_finite() && data.lo.is_finite()) {
                                return Err(Error::Validation(format!(
                                    "normsys '{}' has non-finite factors hi={} lo={}",
                                    name, data.hi, data.lo
                                )));
                            }
                            ModelModifier::NormSys { param_idx, hi: data.hi, lo: data.lo }
                        }
                    });
                }

                samples.push(ModelSample { nominal: sample.data.clone(), modifiers });
            }

            let observed = ws
                .observations
                .iter()
                .find(|o| o.name == channel.name)
                .map(|o| o.data.clone())
                .ok_or_else(|| {
                    Error::Validation(format!("No observation for channel '{}'", channel.name))
                })?;
            if observed.len() != n_bins {
                return Err(Error::Validation(format!(
                    "Observation for channel '{}' has {} bins, expected {}",
                    channel.name,
                    observed.len(),
                    n_bins
                )));
            }

            channels.push(ModelChannel { name: channel.name.clone(), samples, observed });
        }

        let poi_index = param_map.get(&poi_name).copied().ok_or_else(|| {
            Error::Validation(format!("POI '{}' is not a modifier of any sample", poi_name))
        })?;

        if let Some(measurement) = ws.measurements.first() {
            for cfg in &measurement.config.parameters {
                let Some(&idx) = param_map.get(&cfg.name) else {
                    log::warn!("measurement config for unknown parameter '{}' ignored", cfg.name);
                    continue;
                };
                let p = &mut parameters[idx];
                if let Some(&[lo, hi]) = cfg.bounds.first() {
                    if !(lo <= hi) {
                        return Err(Error::Validation(format!(
                            "Invalid bounds for '{}': [{}, {}]",
                            cfg.name, lo, hi
                        )));
                    }
                    p.bounds = (lo, hi);
                }
                if let Some(&init) = cfg.inits.first() {
                    p.init = init;
                }
                if p.constrained {
                    if let Some(&center) = cfg.auxdata.first() {
                        p.constraint_center = Some(center);
                    }
                    if let Some(&width) = cfg.sigmas.first() {
                        p.constraint_width = Some(width);
                    }
                }
                if cfg.fixed {
                    p.bounds = (p.init, p.init);
                }
                p.init = p.init.clamp(p.bounds.0, p.bounds.1);
            }
        }

        Ok(Self { parameters, poi_index: Some(poi_index), channels })
    }

    /// Number of parameters
    pub fn n_params(&self) -> usize {
        self.parameters.len()
    }

    /// Total number of main bins across channels.
    pub fn n_main_bins(&self) -> usize {
        self.channels.iter().map(|c| c.observed.len()).sum()
    }

    /// Get POI index
    pub fn poi_index(&self) -> Option<usize> {
        self.poi_index
    }

    /// Get parameters
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Observed main data, flattened in channel order.
    pub fn observed_main(&self) -> Vec<f64> {
        self.channels.iter().flat_map(|c| c.observed.iter().copied()).collect()
    }

    /// Create a copy with one parameter fixed at a given value.
    ///
    /// The parameter bounds are clamped to that value so the optimizer
    /// cannot move it.
    pub fn with_fixed_param(&self, param_idx: usize, value: f64) -> Self {
        let mut out = self.clone();
        if let Some(p) = out.parameters.get_mut(param_idx) {
            p.init = value;
            p.bounds = (value, value);
        }
        out
    }

    /// Create a copy of the model with overridden observed (main) data.
    ///
    /// `observed_main` is flat over channels in model order.
    pub fn with_observed_main(&self, observed_main: &[f64]) -> Result<Self> {
        let expected_len = self.n_main_bins();
        if observed_main.len() != expected_len {
            return Err(Error::Validation(format!(
                "Observed main data length mismatch: expected {}, got {}",
                expected_len,
                observed_main.len()
            )));
        }

        let mut out = self.clone();
        let mut offset = 0;
        for channel in &mut out.channels {
            let n_bins = channel.observed.len();
            channel.observed.copy_from_slice(&observed_main[offset..offset + n_bins]);
            offset += n_bins;
        }
        Ok(out)
    }

    /// Create a copy with updated constraint centers for constrained parameters.
    ///
    /// For an Asimov dataset the auxiliary measurements equal the nuisance values
    /// the dataset was generated with, which removes pulls while keeping widths.
    pub fn with_constraint_centers(&self, centers: &[f64]) -> Result<Self> {
        self.validate_params_len(centers.len())?;
        let mut out = self.clone();
        for (p, &c) in out.parameters.iter_mut().zip(centers) {
            if p.constrained && p.constraint_center.is_some() {
                p.constraint_center = Some(c);
            }
        }
        Ok(out)
    }

    /// Expected main-bin counts at `params`, flat in channel order.
    pub fn expected_data(&self, params: &[f64]) -> Result<Vec<f64>> {
        self.validate_params_len(params.len())?;
        let mut out = Vec::with_capacity(self.n_main_bins());
        for channel in &self.channels {
            let mut bins = vec![0.0; channel.observed.len()];
            for sample in &channel.samples {
                let factor: f64 =
                    sample.modifiers.iter().map(|m| m.factor_and_derivative(params).0).product();
                for (acc, &nom) in bins.iter_mut().zip(&sample.nominal) {
                    *acc += nom * factor;
                }
            }
            out.extend(bins);
        }
        Ok(out)
    }

    /// Negative log-likelihood: Poisson main bins plus Gaussian constraints.
    pub fn nll(&self, params: &[f64]) -> Result<f64> {
        let expected = self.expected_data(params)?;
        let observed = self.channels.iter().flat_map(|c| c.observed.iter());

        let mut nll: f64 =
            observed.zip(&expected).map(|(&n, &lambda)| sc_prob::poisson::nll(n, lambda)).sum();

        for (p, &value) in self.parameters.iter().zip(params) {
            if let Some((center, width)) = constraint_of(p) {
                nll += sc_prob::normal::nll(value, center, width)?;
            }
        }
        Ok(nll)
    }

    /// Analytic gradient of [`Self::nll`].
    pub fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let expected = self.expected_data(params)?;
        let mut grad = vec![0.0; params.len()];

        let mut bin_offset = 0;
        for channel in &self.channels {
            let n_bins = channel.observed.len();
            let weights: Vec<f64> = channel
                .observed
                .iter()
                .zip(&expected[bin_offset..bin_offset + n_bins])
                .map(|(&n, &lambda)| sc_prob::poisson::dnll_dlambda(n, lambda))
                .collect();

            for sample in &channel.samples {
                // d(sum_i w_i * nom_i * F) / d theta = (sum_i w_i nom_i) * dF/dtheta
                let weighted: f64 = weights.iter().zip(&sample.nominal).map(|(w, n)| w * n).sum();
                if weighted == 0.0 {
                    continue;
                }
                let fd: Vec<(f64, f64)> =
                    sample.modifiers.iter().map(|m| m.factor_and_derivative(params)).collect();
                for (k, m) in sample.modifiers.iter().enumerate() {
                    let others: f64 =
                        fd.iter().enumerate().filter(|(j, _)| *j != k).map(|(_, f)| f.0).product();
                    grad[m.param_idx()] += weighted * fd[k].1 * others;
                }
            }
            bin_offset += n_bins;
        }

        for (i, p) in self.parameters.iter().enumerate() {
            if let Some((center, width)) = constraint_of(p) {
                grad[i] += (params[i] - center) / (width * width);
            }
        }
        Ok(grad)
    }
}

fn constraint_of(p: &Parameter) -> Option<(f64, f64)> {
    if !p.constrained {
        return None;
    }
    match (p.constraint_center, p.constraint_width) {
        (Some(c), Some(w)) if w > 0.0 => Some((c, w)),
        _ => None,
    }
}

impl LogDensityModel for HistFactoryModel {
    fn dim(&self) -> usize {
        self.parameters.len()
    }

    fn parameter_names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }

    fn parameter_bounds(&self) -> Vec<(f64, f64)> {
        self.parameters.iter().map(|p| p.bounds).collect()
    }

    fn parameter_init(&self) -> Vec<f64> {
        self.parameters.iter().map(|p| p.init).collect()
    }

    fn nll(&self, params: &[f64]) -> Result<f64> {
        HistFactoryModel::nll(self, params)
    }

    fn grad_nll(&self, params: &[f64]) -> Result<Vec<f64>> {
        self.gradient(params)
    }
}

fn normsys_code4_coeffs(hi: f64, lo: f64) -> [f64; 6] {
    // pyhf.interpolators.code4 with alpha0 = 1.
    const A_INV: [[f64; 6]; 6] = [
        [15.0 / 16.0, -15.0 / 16.0, -7.0 / 16.0, -7.0 / 16.0, 1.0 / 16.0, -1.0 / 16.0],
        [3.0 / 2.0, 3.0 / 2.0, -9.0 / 16.0, 9.0 / 16.0, 1.0 / 16.0, 1.0 / 16.0],
        [-5.0 / 8.0, 5.0 / 8.0, 5.0 / 8.0, 5.0 / 8.0, -1.0 / 8.0, 1.0 / 8.0],
        [-3.0 / 2.0, -3.0 / 2.0, 7.0 / 8.0, -7.0 / 8.0, -1.0 / 8.0, -1.0 / 8.0],
        [3.0 / 16.0, -3.0 / 16.0, -3.0 / 16.0, -3.0 / 16.0, 1.0 / 16.0, -1.0 / 16.0],
        [1.0 / 2.0, 1.0 / 2.0, -5.0 / 16.0, 5.0 / 16.0, 1.0 / 16.0, 1.0 / 16.0],
    ];

    let (ln_hi, ln_lo) = (hi.ln(), lo.ln());
    let b = [hi - 1.0, lo - 1.0, hi * ln_hi, -lo * ln_lo, hi * ln_hi * ln_hi, lo * ln_lo * ln_lo];

    let mut a = [0.0; 6];
    for (row, out) in A_INV.iter().zip(a.iter_mut()) {
        *out = row.iter().zip(&b).map(|(x, y)| x * y).sum();
    }
    a
}

/// normsys `code4` interpolation: `(factor, d factor / d alpha)`.
///
/// Exponential outside `|alpha| < 1`, a 6th-order polynomial inside. Non-positive
/// `hi`/`lo` (background uncertainty of 100% or more) fall back to linear
/// interpolation; the expected-count floor keeps the Poisson term finite.
pub(crate) fn normsys_code4(alpha: f64, hi: f64, lo: f64) -> (f64, f64) {
    if hi <= 0.0 || lo <= 0.0 {
        return if alpha >= 0.0 {
            (1.0 + alpha * (hi - 1.0), hi - 1.0)
        } else {
            (1.0 + alpha * (1.0 - lo), 1.0 - lo)
        };
    }

    if alpha >= 1.0 {
        let v = hi.powf(alpha);
        return (v, v * hi.ln());
    }
    if alpha <= -1.0 {
        let v = lo.powf(-alpha);
        return (v, -v * lo.ln());
    }

    let a = normsys_code4_coeffs(hi, lo);
    let mut value = 1.0;
    let mut deriv = 0.0;
    let mut pow = 1.0; // alpha^(k-1)
    for (k, &ak) in a.iter().enumerate() {
        deriv += (k as f64 + 1.0) * ak * pow;
        pow *= alpha;
        value += ak * pow;
    }
    (value, deriv)
}
