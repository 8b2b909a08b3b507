//! Combination of statistically independent signal regions.
//!
//! Regions of a grouping are treated as one counting experiment: yields add,
//! absolute uncertainties add in quadrature. Luminosity scaling is applied per
//! region before summation.

use crate::limit::LimitCalculator;
use sc_core::types::{CombinationResult, LuminosityFactor, ScaledRegion, SignalRegionYield};
use sc_core::{Error, Result};
use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt::Debug;

/// Scale every region by `k` and sum them into one set of yields.
pub fn aggregate<R: Borrow<SignalRegionYield>>(
    regions: &[R],
    k: LuminosityFactor,
) -> Result<ScaledRegion> {
    if regions.is_empty() {
        return Err(Error::EmptyGrouping);
    }

    let mut total = ScaledRegion::default();
    let (mut ds2, mut db2) = (0.0, 0.0);
    for region in regions {
        let region: &SignalRegionYield = region.borrow();
        region.validate()?;
        let scaled = region.scaled(k);
        total.s += scaled.s;
        total.b += scaled.b;
        ds2 += scaled.ds * scaled.ds;
        db2 += scaled.db * scaled.db;
    }
    total.ds = ds2.sqrt();
    total.db = db2.sqrt();
    Ok(total)
}

/// Check that regions may be combined as independent measurements.
pub trait OverlapPolicy: Debug + Send + Sync {
    /// `Err(Error::Overlap)` when the regions are known to overlap.
    fn check(&self, regions: &[&SignalRegionYield]) -> Result<()>;
}

/// Accept any grouping.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeIndependent;

impl OverlapPolicy for AssumeIndependent {
    fn check(&self, _regions: &[&SignalRegionYield]) -> Result<()> {
        Ok(())
    }
}

/// Reject groupings listing the same `analysis:region` twice.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectDuplicates;

impl OverlapPolicy for RejectDuplicates {
    fn check(&self, regions: &[&SignalRegionYield]) -> Result<()> {
        let mut seen = HashSet::with_capacity(regions.len());
        for region in regions {
            if !seen.insert((region.analysis.as_str(), region.region.as_str())) {
                return Err(Error::Overlap(format!(
                    "{} appears more than once in the grouping",
                    region.label()
                )));
            }
        }
        Ok(())
    }
}

/// Combined expected limits for groupings of signal regions.
#[derive(Debug, Clone)]
pub struct RegionCombiner<P: OverlapPolicy = RejectDuplicates> {
    calculator: LimitCalculator,
    policy: P,
}

impl RegionCombiner<RejectDuplicates> {
    /// Combiner rejecting duplicate regions.
    pub fn new(calculator: LimitCalculator) -> Self {
        Self { calculator, policy: RejectDuplicates }
    }
}

impl Default for RegionCombiner<RejectDuplicates> {
    fn default() -> Self {
        Self::new(LimitCalculator::default())
    }
}

impl<P: OverlapPolicy> RegionCombiner<P> {
    /// Combiner with a custom overlap policy.
    pub fn with_policy(calculator: LimitCalculator, policy: P) -> Self {
        Self { calculator, policy }
    }

    /// Underlying limit calculator.
    pub fn calculator(&self) -> &LimitCalculator {
        &self.calculator
    }

    /// One result per luminosity factor, in input order.
    ///
    /// Calculator failures come back as [`Error::Combination`] naming the
    /// grouping and factor; [`Error::root`] recovers the original kind.
    pub fn combine<R: Borrow<SignalRegionYield>>(
        &self,
        regions: &[R],
        factors: &[LuminosityFactor],
    ) -> Result<Vec<CombinationResult>> {
        if regions.is_empty() {
            return Err(Error::EmptyGrouping);
        }
        let refs: Vec<&SignalRegionYield> =
            regions.iter().map(Borrow::<SignalRegionYield>::borrow).collect();
        self.policy.check(&refs)?;

        factors.iter().map(|&k| self.combine_checked(&refs, k)).collect()
    }

    /// [`Self::combine`] at a single factor.
    pub fn combine_at<R: Borrow<SignalRegionYield>>(
        &self,
        regions: &[R],
        k: LuminosityFactor,
    ) -> Result<CombinationResult> {
        let mut out = self.combine(regions, &[k])?;
        out.pop().ok_or_else(|| Error::Computation("combination produced no result".to_string()))
    }

    /// Combined `r_exp_cons` of a grouping at factor `k`.
    pub fn combined_r<R: Borrow<SignalRegionYield>>(
        &self,
        regions: &[R],
        k: LuminosityFactor,
    ) -> Result<f64> {
        Ok(self.combine_at(regions, k)?.r_exp_cons)
    }

    fn combine_checked(
        &self,
        regions: &[&SignalRegionYield],
        k: LuminosityFactor,
    ) -> Result<CombinationResult> {
        let total = aggregate(regions, k)?;
        self.calculator
            .compute_region(&total)
            .map(|est| est.into_combination(k))
            .map_err(|source| Error::Combination {
                regions: regions.iter().map(|r| r.label()).collect(),
                lumi_factor: k.value(),
                source: Box::new(source),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sr(analysis: &str, region: &str, s: f64, ds: f64, b: f64, db: f64) -> SignalRegionYield {
        SignalRegionYield::new(analysis, region, s, ds, b, db)
    }

    fn combiner() -> RegionCombiner {
        RegionCombiner::new(LimitCalculator::default())
    }

    fn k(v: f64) -> LuminosityFactor {
        LuminosityFactor::new(v).unwrap()
    }

    #[test]
    fn test_aggregate_sums_in_quadrature() {
        let regions = [sr("a", "1", 3.0, 3.0, 10.0, 1.0), sr("a", "2", 5.0, 4.0, 20.0, 2.0)];
        let total = aggregate(&regions, LuminosityFactor::IDENTITY).unwrap();
        assert_eq!(total.s, 8.0);
        assert_eq!(total.b, 30.0);
        assert_relative_eq!(total.ds, 5.0, epsilon = 1e-12);
        assert_relative_eq!(total.db, 5f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_aggregate_single_region_equals_scaling() {
        let r = sr("cms_1908_04722", "bin7", 12.5, 1.5, 33.0, 4.0);
        for factor in [0.5, 1.0, 3000.0 / 139.0] {
            assert_eq!(aggregate(&[&r], k(factor)).unwrap(), r.scaled(k(factor)));
        }
    }

    #[test]
    fn test_aggregate_is_associative_in_totals() {
        let a = sr("a", "1", 3.0, 0.3, 10.0, 1.0);
        let b = sr("a", "2", 5.0, 0.4, 20.0, 2.0);
        let c = sr("b", "1", 7.0, 0.9, 5.0, 0.5);
        let ab = aggregate(&[&a, &b], k(2.0)).unwrap();
        let abc = aggregate(&[&a, &b, &c], k(2.0)).unwrap();
        let c2 = c.scaled(k(2.0));
        assert_relative_eq!(abc.s, ab.s + c2.s, epsilon = 1e-12);
        assert_relative_eq!(abc.b, ab.b + c2.b, epsilon = 1e-12);
        assert_relative_eq!(abc.ds, (ab.ds.powi(2) + c2.ds.powi(2)).sqrt(), epsilon = 1e-12);
        assert_relative_eq!(abc.db, (ab.db.powi(2) + c2.db.powi(2)).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_empty_grouping() {
        let combiner = combiner();
        let none: [SignalRegionYield; 0] = [];
        assert!(matches!(aggregate(&none, LuminosityFactor::IDENTITY), Err(Error::EmptyGrouping)));
        assert!(matches!(
            combiner.combine(&none, &[LuminosityFactor::IDENTITY]),
            Err(Error::EmptyGrouping)
        ));
    }

    #[test]
    fn test_two_region_golden() {
        let combiner = combiner();
        let regions = [sr("x", "A", 50.0, 0.1, 100.0, 0.0), sr("x", "B", 50.0, 0.05, 100.0, 0.0)];
        let out = combiner.combine(&regions, &[LuminosityFactor::IDENTITY, k(4.0)]).unwrap();
        assert_eq!(out.len(), 2);
        assert_relative_eq!(out[0].s95exp, 29.01308052207711, max_relative = 1e-4);
        assert_relative_eq!(out[0].r_exp_cons, 3.440401385502339, max_relative = 1e-4);
        assert_eq!(out[1].luminosity_factor, 4.0);
        assert_relative_eq!(out[1].s95exp, 56.72396552504097, max_relative = 1e-4);
        assert_relative_eq!(out[1].r_exp_cons, 7.045228258508667, max_relative = 1e-4);
    }

    #[test]
    fn test_single_region_combination_matches_scaled_limit() {
        let combiner = combiner();
        let r = sr("atlas_2004_14060", "SRA-TT", 9.0, 1.2, 14.0, 3.0);
        let combined = combiner.combine_at(&[&r], k(2.5)).unwrap();
        let direct = combiner.calculator().compute_region(&r.scaled(k(2.5))).unwrap();
        assert_eq!(combined.s95exp, direct.s95exp);
        assert_eq!(combined.r_exp_cons, direct.r_exp_cons);
    }

    #[test]
    fn test_calculator_error_is_wrapped_with_context() {
        let combiner = combiner();
        let regions = [sr("cms_sus_19_005", "HT1", 5.0, 0.3, 0.0, 0.0)];
        let err = combiner.combine(&regions, &[k(2.0)]).unwrap_err();
        match &err {
            Error::Combination { regions, lumi_factor, .. } => {
                assert_eq!(regions, &vec!["cms_sus_19_005:HT1".to_string()]);
                assert_eq!(*lumi_factor, 2.0);
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(matches!(err.root(), Error::InvalidModel(_)));
    }

    #[test]
    fn test_duplicate_regions_rejected_by_default() {
        let r = sr("atlas_2101_01629", "SR2J-1600", 4.0, 0.4, 8.0, 1.0);
        let err = combiner().combined_r(&[&r, &r], LuminosityFactor::IDENTITY);
        assert!(matches!(err, Err(Error::Overlap(_))));

        let lenient = RegionCombiner::with_policy(LimitCalculator::default(), AssumeIndependent);
        let doubled = lenient.combine_at(&[&r, &r], LuminosityFactor::IDENTITY).unwrap();
        assert_eq!(doubled.s, 8.0);
    }

    #[test]
    fn test_empty_factor_list_gives_no_results() {
        let r = sr("a", "1", 1.0, 0.1, 2.0, 0.2);
        let out = combiner().combine(&[r], &[]).unwrap();
        assert!(out.is_empty());
    }
}
