//! # sc-inference
//!
//! Expected-limit inference for signal-region combination.
//!
//! - bounded L-BFGS fits of pyhf-style models
//! - asymptotic CLs with the `qtilde` statistic on Asimov data
//! - the limit calculator producing `s95exp` and `r_exp_cons`
//! - combination of independent regions and the grouping search over them
//!
//! Everything here is synchronous; callers parallelize over model points.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Region aggregation and combined limits.
pub mod combine;
/// Taxonomy-driven search for the best grouping of regions.
pub mod grouping;
/// Frequentist hypothesis testing (asymptotic CLs).
pub mod hypotest;
/// Expected 95% CL limit on a signal yield.
pub mod limit;
/// Maximum-likelihood estimation via L-BFGS-B.
pub mod mle;
/// Generic numerical optimizer (L-BFGS-B backend).
pub mod optimizer;
/// Closed-form discovery significances.
pub mod significance;

pub use combine::{AssumeIndependent, OverlapPolicy, RegionCombiner, RejectDuplicates, aggregate};
pub use grouping::{
    Candidate, CrossDetectorMode, DetectorRules, DetectorSummary, GroupingRule, GroupingSearch,
    PointSummary, RegionSelector, Taxonomy,
};
pub use hypotest::{AsymptoticCLsContext, HypotestResult, LimitSearch};
pub use limit::{CONSERVATIVE_Z, LimitCalculator, LimitConfig, LimitEstimate};
pub use mle::MaximumLikelihoodEstimator;
pub use optimizer::{LbfgsbOptimizer, ObjectiveFunction, OptimizationResult, OptimizerConfig};
pub use significance::{Significance, asimov_significance, cowan_significance};
