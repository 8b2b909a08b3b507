//! Expected 95% CL signal-yield limits for one signal region.
//!
//! A region `(s, ds, b, db)` becomes a one-bin counting model whose data is the
//! background-only Asimov expectation. The CLs upper limit on the signal
//! strength of a unit template is then the expected limit on the signal
//! yield, `s95exp`, and
//!
//! ```text
//! r_exp_cons = (s - 1.64 * signal_shift * ds) / s95exp
//! ```
//!
//! is the conservative expected exclusion ratio (`> 1` means excluded).

use crate::MaximumLikelihoodEstimator;
use crate::hypotest::{AsymptoticCLsContext, LimitSearch, NSIGMA_ORDER};
use crate::optimizer::OptimizerConfig;
use sc_core::types::{CombinationResult, LuminosityFactor, ScaledRegion, SignalRegionYield};
use sc_core::{Error, Result};
use sc_model::HistFactoryModel;
use sc_model::pyhf::simplemodels::signal_region_model;
use serde::{Deserialize, Serialize};

/// One-sided z-shift applied to the signal uncertainty in `r_exp_cons`.
pub const CONSERVATIVE_Z: f64 = 1.64;

/// Yield of the signal template the POI scales.
const SIGNAL_TEMPLATE: f64 = 1.0;

/// Limit-search settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitConfig {
    /// CLs threshold (`0.05` for 95% CL)
    pub alpha: f64,
    /// Initial upper bound of the POI
    pub poi_upper_bound: f64,
    /// The first bracket is at least `bound_yield_scale * (sqrt(b) + db)`; `0` disables
    pub bound_yield_scale: f64,
    /// How many times the POI bound may grow tenfold when the limit lies above it
    pub max_bound_expansions: u32,
    /// Relative bracket width at which bisection stops
    pub rtol: f64,
    /// Bisection step cap
    pub max_iter: usize,
    /// Signal strength the Asimov dataset is generated with
    pub asimov_mu: f64,
    /// Multiplier on `1.64 * ds` in `r_exp_cons`
    pub signal_shift: f64,
    /// Settings of every profile fit
    pub optimizer: OptimizerConfig,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            poi_upper_bound: 1000.0,
            bound_yield_scale: 10.0,
            max_bound_expansions: 3,
            rtol: 1e-6,
            max_iter: 200,
            asimov_mu: 0.0,
            signal_shift: 1.0,
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl LimitConfig {
    /// Check ranges.
    pub fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(Error::Validation(format!("alpha must be in (0,1), got {}", self.alpha)));
        }
        if !(self.poi_upper_bound.is_finite() && self.poi_upper_bound > 0.0) {
            return Err(Error::Validation(format!(
                "poi_upper_bound must be finite and > 0, got {}",
                self.poi_upper_bound
            )));
        }
        if !(self.bound_yield_scale.is_finite() && self.bound_yield_scale >= 0.0) {
            return Err(Error::Validation(format!(
                "bound_yield_scale must be finite and >= 0, got {}",
                self.bound_yield_scale
            )));
        }
        if !(self.rtol > 0.0 && self.rtol < 1.0) {
            return Err(Error::Validation(format!("rtol must be in (0,1), got {}", self.rtol)));
        }
        if self.max_iter == 0 {
            return Err(Error::Validation("max_iter must be > 0".to_string()));
        }
        if !(self.asimov_mu.is_finite() && self.asimov_mu >= 0.0) {
            return Err(Error::Validation(format!(
                "asimov_mu must be finite and >= 0, got {}",
                self.asimov_mu
            )));
        }
        if !(self.signal_shift.is_finite() && self.signal_shift >= 0.0) {
            return Err(Error::Validation(format!(
                "signal_shift must be finite and >= 0, got {}",
                self.signal_shift
            )));
        }
        self.optimizer.validate()
    }
}

/// Expected limit for one set of yields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitEstimate {
    /// Signal yield
    pub s: f64,
    /// Signal uncertainty
    pub ds: f64,
    /// Background yield
    pub b: f64,
    /// Background uncertainty
    pub db: f64,
    /// Expected 95% CL upper limit on the signal yield
    pub s95exp: f64,
    /// `(s - 1.64 * signal_shift * ds) / s95exp`
    pub r_exp_cons: f64,
    /// Upper limit on the signal strength of the unit template
    pub mu_up: f64,
    /// POI bound in force when the limit was found (after any expansion)
    pub poi_upper_bound: f64,
}

impl LimitEstimate {
    /// Tag with the luminosity factor the yields were scaled by.
    pub fn into_combination(self, k: LuminosityFactor) -> CombinationResult {
        CombinationResult {
            luminosity_factor: k.value(),
            s: self.s,
            ds: self.ds,
            b: self.b,
            db: self.db,
            s95exp: self.s95exp,
            r_exp_cons: self.r_exp_cons,
        }
    }
}

/// Computes expected CLs limits and `r_exp_cons` for signal regions.
#[derive(Debug, Clone)]
pub struct LimitCalculator {
    config: LimitConfig,
    mle: MaximumLikelihoodEstimator,
}

impl Default for LimitCalculator {
    fn default() -> Self {
        let config = LimitConfig::default();
        let mle = MaximumLikelihoodEstimator::with_config(config.optimizer.clone());
        Self { config, mle }
    }
}

impl LimitCalculator {
    /// Calculator with validated settings.
    pub fn new(config: LimitConfig) -> Result<Self> {
        config.validate()?;
        let mle = MaximumLikelihoodEstimator::with_config(config.optimizer.clone());
        Ok(Self { config, mle })
    }

    /// Settings in use.
    pub fn config(&self) -> &LimitConfig {
        &self.config
    }

    /// Expected limit and `r_exp_cons` for yields `s ± ds`, `b ± db`.
    ///
    /// # Errors
    /// [`Error::InvalidModel`] for non-finite or negative inputs, `b <= 0`, a
    /// free fit that fails to converge, a limit beyond every expanded POI bound,
    /// or bisection that cannot reach `rtol`.
    pub fn compute_limit(&self, s: f64, ds: f64, b: f64, db: f64) -> Result<LimitEstimate> {
        check_yields(s, ds, b, db)?;

        let ([mu_up], bound) = self.search(b, db, |ctx, mle, hi| {
            let cfg = &self.config;
            Ok([ctx.upper_limit_qtilde(mle, cfg.alpha, hi, cfg.rtol, cfg.max_iter)?])
        })?;

        let s95exp = mu_up * SIGNAL_TEMPLATE;
        if !(s95exp.is_finite() && s95exp > 0.0) {
            return Err(Error::InvalidModel(format!(
                "expected limit is not positive: s95exp={} (s={}, ds={}, b={}, db={})",
                s95exp, s, ds, b, db
            )));
        }
        let r_exp_cons = (s - CONSERVATIVE_Z * self.config.signal_shift * ds) / s95exp;
        log::debug!("s={s} ds={ds} b={b} db={db}: s95exp={s95exp:.6} r_exp_cons={r_exp_cons:.6}");

        Ok(LimitEstimate { s, ds, b, db, s95exp, r_exp_cons, mu_up, poi_upper_bound: bound })
    }

    /// [`Self::compute_limit`] on already-scaled or combined yields.
    pub fn compute_region(&self, region: &ScaledRegion) -> Result<LimitEstimate> {
        self.compute_limit(region.s, region.ds, region.b, region.db)
    }

    /// One result per luminosity factor, in input order, for a single region.
    pub fn compute_scaled(
        &self,
        region: &SignalRegionYield,
        factors: &[LuminosityFactor],
    ) -> Result<Vec<CombinationResult>> {
        factors
            .iter()
            .map(|&k| Ok(self.compute_region(&region.scaled(k))?.into_combination(k)))
            .collect()
    }

    /// Expected `s95` at `n_sigma = [2, 1, 0, -1, -2]` from the Asimov CLs band.
    ///
    /// All five bands share one bracket, which grows while any of them lies above it.
    pub fn expected_band(&self, s: f64, ds: f64, b: f64, db: f64) -> Result<[f64; 5]> {
        check_yields(s, ds, b, db)?;
        let (mu_up, _) = self.search(b, db, |ctx, mle, hi| {
            let cfg = &self.config;
            ctx.expected_upper_limits(mle, cfg.alpha, hi, cfg.rtol, cfg.max_iter)
        })?;
        for (n_sigma, mu) in NSIGMA_ORDER.iter().zip(&mu_up) {
            log::debug!("expected band n_sigma={}: mu_up={}", n_sigma, mu);
        }
        Ok(mu_up.map(|mu| mu * SIGNAL_TEMPLATE))
    }

    /// First POI bracket for background `b ± db`.
    pub fn initial_bound(&self, b: f64, db: f64) -> f64 {
        self.config.poi_upper_bound.max(self.config.bound_yield_scale * (b.sqrt() + db))
    }

    fn asimov_model(&self, b: f64, db: f64, bound: f64) -> Result<HistFactoryModel> {
        let model = signal_region_model(b, db, bound)?;
        let poi = model
            .poi_index()
            .ok_or_else(|| Error::InvalidModel("signal-region model has no POI".to_string()))?;
        let mut params: Vec<f64> = model.parameters().iter().map(|p| p.init).collect();
        params[poi] = self.config.asimov_mu;
        let asimov = model.expected_data(&params)?;
        model.with_observed_main(&asimov)
    }

    fn context(&self, model: &HistFactoryModel) -> Result<AsymptoticCLsContext> {
        if self.config.asimov_mu == 0.0 {
            AsymptoticCLsContext::for_asimov_data(&self.mle, model)
        } else {
            AsymptoticCLsContext::new(&self.mle, model)
        }
    }

    /// Run `find` on `[0, bound]`, growing the bound tenfold while any limit lies above it.
    fn search<const N: usize, F>(&self, b: f64, db: f64, find: F) -> Result<([f64; N], f64)>
    where
        F: Fn(&AsymptoticCLsContext, &MaximumLikelihoodEstimator, f64) -> Result<[LimitSearch; N]>,
    {
        let mut bound = self.initial_bound(b, db);
        let mut expansions = 0;
        loop {
            let ctx = self.context(&self.asimov_model(b, db, bound)?)?;
            let searches = find(&ctx, &self.mle, bound)?;
            let above = searches
                .iter()
                .filter_map(|s| match *s {
                    LimitSearch::AboveBracket { cls_hi } => Some(cls_hi),
                    LimitSearch::Found { .. } => None,
                })
                .reduce(f64::max);
            match above {
                None => {
                    let mut mu_up = [0.0; N];
                    for (slot, s) in mu_up.iter_mut().zip(&searches) {
                        if let LimitSearch::Found { mu_up: mu, iterations } = *s {
                            log::debug!("limit mu_up={} after {} bisection steps", mu, iterations);
                            *slot = mu;
                        }
                    }
                    return Ok((mu_up, bound));
                }
                Some(cls_hi) if expansions < self.config.max_bound_expansions => {
                    log::warn!(
                        "CLs({})={:.4} above alpha={} (b={}, db={}); raising POI bound to {}",
                        bound,
                        cls_hi,
                        self.config.alpha,
                        b,
                        db,
                        bound * 10.0
                    );
                    bound *= 10.0;
                    expansions += 1;
                }
                Some(cls_hi) => {
                    return Err(Error::InvalidModel(format!(
                        "limit lies above POI bound {} after {} expansions (CLs={}, b={}, db={})",
                        bound, expansions, cls_hi, b, db
                    )));
                }
            }
        }
    }
}

fn check_yields(s: f64, ds: f64, b: f64, db: f64) -> Result<()> {
    for (name, v) in [("s", s), ("ds", ds), ("b", b), ("db", db)] {
        if !v.is_finite() || v < 0.0 {
            return Err(Error::InvalidModel(format!("{} must be finite and >= 0, got {}", name, v)));
        }
    }
    if b <= 0.0 {
        return Err(Error::InvalidModel(format!("background must be > 0, got {}", b)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn test_single_region_closed_form() {
        let calc = LimitCalculator::default();
        let est = calc.compute_limit(50.0, 0.1, 100.0, 0.0).unwrap();
        assert_relative_eq!(est.s95exp, 20.900500796461515, max_relative = 1e-4);
        assert_relative_eq!(est.r_exp_cons, 2.3844404727583037, max_relative = 1e-4);
        assert_eq!(est.poi_upper_bound, 1000.0);
    }

    #[test]
    fn test_zero_background_is_invalid_model() {
        let err = LimitCalculator::default().compute_limit(5.0, 0.3, 0.0, 0.0).unwrap_err();
        assert!(matches!(err, Error::InvalidModel(_)), "{err}");
    }

    #[test]
    fn test_negative_and_nan_inputs_are_invalid_model() {
        let calc = LimitCalculator::default();
        for (s, ds, b, db) in
            [(-1.0, 0.0, 1.0, 0.0), (1.0, -0.1, 1.0, 0.0), (1.0, 0.0, 1.0, f64::NAN)]
        {
            let err = calc.compute_limit(s, ds, b, db).unwrap_err();
            assert!(matches!(err, Error::InvalidModel(_)), "{err}");
        }
    }

    #[test]
    fn test_signal_shift_zero_uses_bare_signal() {
        let calc =
            LimitCalculator::new(LimitConfig { signal_shift: 0.0, ..Default::default() }).unwrap();
        let est = calc.compute_limit(30.0, 5.0, 100.0, 0.0).unwrap();
        assert_relative_eq!(est.r_exp_cons, 30.0 / est.s95exp, epsilon = 1e-12);
    }

    #[test]
    fn test_unshifted_ratio_reproduces_printed_reference() {
        let calc =
            LimitCalculator::new(LimitConfig { signal_shift: 0.0, ..Default::default() }).unwrap();
        let est = calc.compute_limit(50.0, 0.1, 100.0, 0.0).unwrap();
        assert_relative_eq!(est.r_exp_cons, 2.3922871746912913, max_relative = 1e-4);
        let region = SignalRegionYield::new("atlas_x", "SR", 50.0, 0.1, 100.0, 0.0);
        let k4 = calc.compute_scaled(&region, &[LuminosityFactor::new(4.0).unwrap()]).unwrap();
        assert_relative_eq!(k4[0].r_exp_cons, 4.939480582871706, max_relative = 1e-4);
    }

    #[test]
    fn test_large_background_seeds_wider_bracket() {
        let calc = LimitCalculator::default();
        assert_eq!(calc.initial_bound(100.0, 0.0), 1000.0);
        assert_relative_eq!(calc.initial_bound(1e6, 5e5), 5.01e6, max_relative = 1e-12);

        // Profiling the background down by ~2 sigma frees about 0.74 b of room.
        let est = calc.compute_limit(1e5, 1e3, 2e6, 1e6).unwrap();
        assert!(est.s95exp.is_finite() && est.s95exp > 1e6, "{est:?}");
        assert!(est.s95exp < est.poi_upper_bound, "{est:?}");
    }

    #[test]
    fn test_bound_expansion_finds_limit_above_initial_bound() {
        let config =
            LimitConfig { poi_upper_bound: 5.0, bound_yield_scale: 0.0, ..Default::default() };
        let calc = LimitCalculator::new(config).unwrap();
        let est = calc.compute_limit(10.0, 0.0, 100.0, 0.0).unwrap();
        assert_eq!(est.poi_upper_bound, 50.0);
        assert_relative_eq!(est.s95exp, 20.900500796461515, max_relative = 1e-4);
    }

    #[test]
    fn test_bound_expansion_exhausted_is_invalid_model() {
        let config = LimitConfig {
            poi_upper_bound: 1.0,
            bound_yield_scale: 0.0,
            max_bound_expansions: 1,
            ..Default::default()
        };
        let calc = LimitCalculator::new(config).unwrap();
        let err = calc.compute_limit(10.0, 0.0, 100.0, 0.0).unwrap_err();
        assert!(matches!(err, Error::InvalidModel(_)), "{err}");
    }

    #[test]
    fn test_background_uncertainty_weakens_limit() {
        let calc = LimitCalculator::default();
        let none = calc.compute_limit(10.0, 1.0, 40.0, 0.0).unwrap();
        let some = calc.compute_limit(10.0, 1.0, 40.0, 8.0).unwrap();
        let lots = calc.compute_limit(10.0, 1.0, 40.0, 20.0).unwrap();
        assert!(some.s95exp > none.s95exp);
        assert!(lots.s95exp > some.s95exp);
    }

    #[test]
    fn test_full_background_uncertainty_still_finite() {
        // db == b drives the normsys down factor to zero.
        let est = LimitCalculator::default().compute_limit(3.0, 0.5, 2.0, 2.0).unwrap();
        assert!(est.s95exp.is_finite() && est.s95exp > 0.0, "{est:?}");
    }

    #[test]
    fn test_compute_scaled_keeps_factor_order() {
        let calc = LimitCalculator::default();
        let region = SignalRegionYield::new("atlas_x", "SR", 50.0, 0.1, 100.0, 0.0);
        let factors = [LuminosityFactor::new(4.0).unwrap(), LuminosityFactor::IDENTITY];
        let out = calc.compute_scaled(&region, &factors).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].luminosity_factor, 4.0);
        assert_eq!(out[0].s, 200.0);
        assert_eq!(out[0].ds, 0.2);
        assert_eq!(out[0].b, 400.0);
        assert_relative_eq!(out[0].s95exp, 40.49008729653197, max_relative = 1e-4);
        assert_relative_eq!(out[0].r_exp_cons, 4.931379834715797, max_relative = 1e-4);
        assert_relative_eq!(out[1].s95exp, 20.900500796461515, max_relative = 1e-4);
    }

    #[test]
    fn test_expected_band_brackets_median() {
        let calc = LimitCalculator::default();
        let band = calc.expected_band(10.0, 1.0, 20.0, 2.0).unwrap();
        let median = calc.compute_limit(10.0, 1.0, 20.0, 2.0).unwrap().s95exp;
        assert_relative_eq!(band[2], median, max_relative = 1e-5);
        for w in band.windows(2) {
            assert!(w[0] < w[1], "{band:?}");
        }
    }

    #[test]
    fn test_non_zero_asimov_mu_raises_limit() {
        let injected = LimitCalculator::new(LimitConfig { asimov_mu: 10.0, ..Default::default() });
        let with_signal = injected.unwrap().compute_limit(10.0, 0.0, 50.0, 0.0).unwrap();
        let bkg_only = LimitCalculator::default().compute_limit(10.0, 0.0, 50.0, 0.0).unwrap();
        assert!(with_signal.s95exp > bkg_only.s95exp);
    }

    #[test]
    fn test_config_rejects_out_of_range() {
        assert!(LimitConfig { alpha: 1.5, ..Default::default() }.validate().is_err());
        assert!(LimitConfig { poi_upper_bound: 0.0, ..Default::default() }.validate().is_err());
        assert!(LimitConfig { rtol: 0.0, ..Default::default() }.validate().is_err());
        assert!(LimitConfig { bound_yield_scale: -1.0, ..Default::default() }.validate().is_err());
        assert!(LimitConfig { signal_shift: -1.0, ..Default::default() }.validate().is_err());
        assert!(LimitCalculator::new(LimitConfig { max_iter: 0, ..Default::default() }).is_err());
    }

    #[test]
    fn test_config_from_partial_yaml() {
        let cfg: LimitConfig =
            serde_yaml_ng::from_str("alpha: 0.1\noptimizer:\n  tol: 1.0e-8\n").unwrap();
        assert_eq!(cfg.alpha, 0.1);
        assert_eq!(cfg.optimizer.tol, 1e-8);
        assert_eq!(cfg.optimizer.m, 10);
        assert_eq!(cfg.poi_upper_bound, 1000.0);
        assert!(serde_yaml_ng::from_str::<LimitConfig>("alpah: 0.1\n").is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn prop_limit_is_positive_and_finite(
            s in 0.0f64..200.0,
            ds in 0.0f64..20.0,
            b in 1.0f64..300.0,
            rel in 0.0f64..0.8,
        ) {
            let est = LimitCalculator::default().compute_limit(s, ds, b, rel * b).unwrap();
            prop_assert!(est.s95exp > 0.0 && est.s95exp.is_finite());
            prop_assert!(est.r_exp_cons.is_finite());
        }
    }
}
