//! Asymptotic CLs hypothesis tests with the `qtilde` test statistic.
//!
//! Follows `pyhf.infer.calculators.AsymptoticCalculator`: the distributions of the
//! test statistic are evaluated in `-muhat/sigma` space, with the Asimov
//! dataset generated at `mu = 0` from nuisance parameters fitted to the data.

use crate::MaximumLikelihoodEstimator;
use sc_core::{Error, Result};
use sc_model::HistFactoryModel;
use sc_prob::normal;

/// Expected-set ordering in `-muhat/sigma` space: `n_sigma = [2, 1, 0, -1, -2]`.
pub const NSIGMA_ORDER: [f64; 5] = [2.0, 1.0, 0.0, -1.0, -2.0];

const CLB_MIN: f64 = 1e-300;

fn safe_cls(clsb: f64, clb: f64) -> f64 {
    if !(clsb.is_finite() && clb.is_finite()) {
        return 0.0;
    }
    // Both tails underflow together far from the null; the ratio tends to 0 there.
    if clb <= CLB_MIN {
        return if clsb <= CLB_MIN { 0.0 } else { 1.0 };
    }
    (clsb / clb).clamp(0.0, 1.0)
}

/// Expected CLs values for a given Asimov `sqrt(q_mu,A)`, in [`NSIGMA_ORDER`].
pub fn expected_cls_band(sqrtq_a: f64) -> [f64; 5] {
    NSIGMA_ORDER.map(|t| safe_cls(normal::cdf(-(t + sqrtq_a)), normal::cdf(-t)))
}

/// One hypothesis test at a tested POI value.
#[derive(Debug, Clone)]
pub struct HypotestResult {
    /// Tested POI value
    pub mu_test: f64,
    /// CLs
    pub cls: f64,
    /// CLs+b
    pub clsb: f64,
    /// CLb
    pub clb: f64,
    /// Test statistic in `-muhat/sigma` space
    pub teststat: f64,
    /// `qtilde_mu` on the data
    pub q_mu: f64,
    /// `qtilde_mu` on the Asimov dataset
    pub q_mu_a: f64,
    /// Unconditional best-fit POI on the data
    pub mu_hat: f64,
}

/// Outcome of a CLs upper-limit search over `[0, hi]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LimitSearch {
    /// `CLs(mu_up) = alpha` within the requested relative tolerance.
    Found {
        /// Upper limit on the POI
        mu_up: f64,
        /// Bisection steps used
        iterations: usize,
    },
    /// `CLs(hi)` is still above `alpha`: the limit lies beyond the bracket.
    AboveBracket {
        /// CLs at the upper end of the bracket
        cls_hi: f64,
    },
}

impl LimitSearch {
    /// Limit if one was found.
    pub fn mu_up(&self) -> Option<f64> {
        match *self {
            LimitSearch::Found { mu_up, .. } => Some(mu_up),
            LimitSearch::AboveBracket { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FreeFit {
    nll: f64,
    mu_hat: f64,
}

fn free_fit(
    mle: &MaximumLikelihoodEstimator,
    model: &HistFactoryModel,
    poi: usize,
    what: &str,
) -> Result<FreeFit> {
    let fit = mle.fit_minimum(model)?;
    if !fit.converged {
        return Err(Error::InvalidModel(format!(
            "free fit on {} did not converge: {}",
            what, fit.message
        )));
    }
    Ok(FreeFit { nll: fit.fval, mu_hat: fit.parameters[poi] })
}

/// `qtilde_mu` for one dataset: profile-likelihood ratio at `mu_test`, zero when
/// the best fit already exceeds it.
fn qtilde(
    mle: &MaximumLikelihoodEstimator,
    model: &HistFactoryModel,
    free: FreeFit,
    poi: usize,
    mu_test: f64,
) -> Result<f64> {
    if free.mu_hat > mu_test {
        return Ok(0.0);
    }
    let fixed = mle.fit_minimum(&model.with_fixed_param(poi, mu_test))?;
    if !fixed.converged {
        log::warn!(
            "fixed-POI fit did not converge at mu={}: {} (using best point found)",
            mu_test,
            fixed.message
        );
    }
    Ok((2.0 * (fixed.fval - free.nll)).max(0.0))
}

/// Cached free fits and Asimov model for repeated CLs evaluations.
#[derive(Debug, Clone)]
pub struct AsymptoticCLsContext {
    poi: usize,
    data_model: HistFactoryModel,
    asimov_model: HistFactoryModel,
    free_data: FreeFit,
    free_asimov: FreeFit,
    data_is_asimov: bool,
}

impl AsymptoticCLsContext {
    /// Context for the observed data held by `model`.
    ///
    /// The Asimov dataset uses nuisance values from a fit to the data with
    /// `mu = 0`; constraint centers move with them.
    pub fn new(mle: &MaximumLikelihoodEstimator, model: &HistFactoryModel) -> Result<Self> {
        let poi = poi_index(model)?;
        let free_data = free_fit(mle, model, poi, "data")?;

        let bkg_only = mle.fit_minimum(&model.with_fixed_param(poi, 0.0))?;
        if !bkg_only.converged {
            return Err(Error::InvalidModel(format!(
                "background-only fit for the Asimov dataset did not converge: {}",
                bkg_only.message
            )));
        }
        let asimov_main = model.expected_data(&bkg_only.parameters)?;
        let asimov_model = model
            .with_observed_main(&asimov_main)?
            .with_constraint_centers(&bkg_only.parameters)?;
        let free_asimov = free_fit(mle, &asimov_model, poi, "Asimov data")?;

        Ok(Self {
            poi,
            data_model: model.clone(),
            asimov_model,
            free_data,
            free_asimov,
            data_is_asimov: false,
        })
    }

    /// Context whose data already is the background-only Asimov dataset.
    ///
    /// Data and Asimov coincide, so one free fit and one fixed fit per tested
    /// POI value serve both.
    pub fn for_asimov_data(
        mle: &MaximumLikelihoodEstimator,
        model: &HistFactoryModel,
    ) -> Result<Self> {
        let poi = poi_index(model)?;
        let free = free_fit(mle, model, poi, "Asimov data")?;
        Ok(Self {
            poi,
            data_model: model.clone(),
            asimov_model: model.clone(),
            free_data: free,
            free_asimov: free,
            data_is_asimov: true,
        })
    }

    /// Index of the POI.
    pub fn poi(&self) -> usize {
        self.poi
    }

    /// Model holding the Asimov dataset.
    pub fn asimov_model(&self) -> &HistFactoryModel {
        &self.asimov_model
    }

    /// Unconditional best-fit POI on the data.
    pub fn mu_hat(&self) -> f64 {
        self.free_data.mu_hat
    }

    /// CLs at `mu_test` (`test_stat="qtilde"`, `calc_base_dist="normal"`).
    pub fn hypotest_qtilde(
        &self,
        mle: &MaximumLikelihoodEstimator,
        mu_test: f64,
    ) -> Result<HypotestResult> {
        let q_mu_a = qtilde(mle, &self.asimov_model, self.free_asimov, self.poi, mu_test)?;
        let q_mu = if self.data_is_asimov {
            q_mu_a
        } else {
            qtilde(mle, &self.data_model, self.free_data, self.poi, mu_test)?
        };

        let sqrtq = q_mu.sqrt();
        let sqrtq_a = q_mu_a.sqrt();
        let teststat = if sqrtq <= sqrtq_a {
            sqrtq - sqrtq_a
        } else {
            (q_mu - q_mu_a) / (2.0 * sqrtq_a.max(1e-16))
        };

        let clsb = normal::cdf(-(teststat + sqrtq_a));
        let clb = normal::cdf(-teststat);
        Ok(HypotestResult {
            mu_test,
            cls: safe_cls(clsb, clb),
            clsb,
            clb,
            teststat,
            q_mu,
            q_mu_a,
            mu_hat: self.free_data.mu_hat,
        })
    }

    /// Expected CLs band at `mu_test`, in [`NSIGMA_ORDER`].
    pub fn expected_cls_at(
        &self,
        mle: &MaximumLikelihoodEstimator,
        mu_test: f64,
    ) -> Result<[f64; 5]> {
        let q_mu_a = qtilde(mle, &self.asimov_model, self.free_asimov, self.poi, mu_test)?;
        Ok(expected_cls_band(q_mu_a.sqrt()))
    }

    /// Bisect `CLs(mu) = alpha` on `[0, hi]`.
    pub fn upper_limit_qtilde(
        &self,
        mle: &MaximumLikelihoodEstimator,
        alpha: f64,
        hi: f64,
        rtol: f64,
        max_iter: usize,
    ) -> Result<LimitSearch> {
        bisect_cls(alpha, hi, rtol, max_iter, |mu| Ok(self.hypotest_qtilde(mle, mu)?.cls))
    }

    /// Bisect each expected band `CLs_k(mu) = alpha` on `[0, hi]`, in [`NSIGMA_ORDER`].
    pub fn expected_upper_limits(
        &self,
        mle: &MaximumLikelihoodEstimator,
        alpha: f64,
        hi: f64,
        rtol: f64,
        max_iter: usize,
    ) -> Result<[LimitSearch; 5]> {
        let mut out = [LimitSearch::AboveBracket { cls_hi: 1.0 }; 5];
        for (k, slot) in out.iter_mut().enumerate() {
            *slot = bisect_cls(alpha, hi, rtol, max_iter, |mu| {
                Ok(self.expected_cls_at(mle, mu)?[k])
            })?;
        }
        Ok(out)
    }
}

fn poi_index(model: &HistFactoryModel) -> Result<usize> {
    model.poi_index().ok_or_else(|| Error::Validation("model has no POI".to_string()))
}

/// Bisection for the first `mu` with `cls(mu) <= alpha` on `[0, hi]`.
///
/// Stops once `(hi - lo) / max(hi, 1) < rtol`. Running out of `max_iter` steps
/// first is an [`Error::InvalidModel`].
pub fn bisect_cls<F>(alpha: f64, hi: f64, rtol: f64, max_iter: usize, cls: F) -> Result<LimitSearch>
where
    F: Fn(f64) -> Result<f64>,
{
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(Error::Validation(format!("alpha must be in (0,1), got {}", alpha)));
    }
    if !(hi.is_finite() && hi > 0.0) {
        return Err(Error::Validation(format!("upper bracket must be finite and > 0, got {}", hi)));
    }
    if !(rtol > 0.0) {
        return Err(Error::Validation(format!("rtol must be > 0, got {}", rtol)));
    }

    let mut lo = 0.0;
    let mut cls_lo = cls(lo)?;
    if cls_lo < alpha {
        return Err(Error::Computation(format!(
            "CLs(0) = {} is already below alpha = {}",
            cls_lo, alpha
        )));
    }

    let cls_hi = cls(hi)?;
    if cls_hi > alpha {
        return Ok(LimitSearch::AboveBracket { cls_hi });
    }

    let mut hi = hi;
    for iteration in 1..=max_iter {
        let mid = 0.5 * (lo + hi);
        let cls_mid = cls(mid)?;
        if cls_mid > cls_lo + 1e-9 {
            log::warn!("non-monotonic CLs: CLs({})={} > CLs({})={}", mid, cls_mid, lo, cls_lo);
        }
        if cls_mid > alpha {
            lo = mid;
            cls_lo = cls_mid;
        } else {
            hi = mid;
        }
        if (hi - lo) / hi.max(1.0) < rtol {
            return Ok(LimitSearch::Found { mu_up: 0.5 * (lo + hi), iterations: iteration });
        }
    }

    Err(Error::InvalidModel(format!(
        "upper-limit bisection did not reach rtol={} within {} iterations (bracket [{}, {}])",
        rtol, max_iter, lo, hi
    )))
}
