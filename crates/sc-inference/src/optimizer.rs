//! Box-constrained minimization
//!
//! L-BFGS from `argmin` with a More-Thuente line search. Bounds are enforced by
//! clamping every trial point into the box, and gradient components that point
//! out of an active bound are projected to zero so the solver can declare
//! convergence on the boundary (a POI pinned at `mu = 0` is the common case).

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use sc_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Distance from a bound inside which the bound counts as active.
const ACTIVE_BOUND_EPS: f64 = 1e-12;

/// L-BFGS settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Iteration cap per minimization
    pub max_iter: u64,
    /// Gradient-norm tolerance; the cost tolerance is derived from it
    pub tol: f64,
    /// L-BFGS history length
    pub m: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { max_iter: 1000, tol: 1e-6, m: 10 }
    }
}

impl OptimizerConfig {
    /// Reject settings argmin would refuse or that can never converge.
    pub fn validate(&self) -> Result<()> {
        if self.max_iter == 0 {
            return Err(Error::Validation("optimizer max_iter must be > 0".to_string()));
        }
        if !self.tol.is_finite() || self.tol < 0.0 {
            return Err(Error::Validation(format!(
                "optimizer tol must be finite and >= 0, got {}",
                self.tol
            )));
        }
        if self.m == 0 {
            return Err(Error::Validation("optimizer history m must be > 0".to_string()));
        }
        Ok(())
    }

    fn cost_tolerance(&self) -> f64 {
        if self.tol == 0.0 { 0.0 } else { (0.1 * self.tol).max(1e-12) }
    }
}

/// Outcome of one minimization
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// Best point found, inside the bounds
    pub parameters: Vec<f64>,
    /// Objective at `parameters`
    pub fval: f64,
    /// Solver iterations
    pub n_iter: u64,
    /// Objective evaluations
    pub n_fev: usize,
    /// Gradient evaluations
    pub n_gev: usize,
    /// Whether argmin reported convergence (not an iteration cap)
    pub converged: bool,
    /// argmin termination status
    pub message: String,
}

impl fmt::Display for OptimizationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fval={:.8} iter={} fev={} gev={} converged={} ({})",
            self.fval, self.n_iter, self.n_fev, self.n_gev, self.converged, self.message
        )
    }
}

/// Function to be minimized
pub trait ObjectiveFunction: Send + Sync {
    /// Objective value
    fn eval(&self, params: &[f64]) -> Result<f64>;

    /// Gradient; central differences unless overridden
    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let mut out = Vec::with_capacity(params.len());
        let mut work = params.to_vec();
        for i in 0..params.len() {
            let h = 1e-8 * params[i].abs().max(1.0);
            work[i] = params[i] + h;
            let up = self.eval(&work)?;
            work[i] = params[i] - h;
            let down = self.eval(&work)?;
            work[i] = params[i];
            out.push((up - down) / (2.0 * h));
        }
        Ok(out)
    }
}

fn clamp_into(params: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    params.iter().zip(bounds).map(|(&x, &(lo, hi))| x.clamp(lo, hi)).collect()
}

fn to_argmin(e: Error) -> argmin::core::Error {
    argmin::core::Error::msg(e.to_string())
}

#[derive(Default)]
struct EvalCounts {
    cost: AtomicUsize,
    grad: AtomicUsize,
}

struct BoxedProblem<'a> {
    objective: &'a dyn ObjectiveFunction,
    bounds: &'a [(f64, f64)],
    counts: Arc<EvalCounts>,
}

impl CostFunction for BoxedProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<f64, argmin::core::Error> {
        self.counts.cost.fetch_add(1, Ordering::Relaxed);
        self.objective.eval(&clamp_into(params, self.bounds)).map_err(to_argmin)
    }
}

impl Gradient for BoxedProblem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, params: &Self::Param) -> std::result::Result<Vec<f64>, argmin::core::Error> {
        self.counts.grad.fetch_add(1, Ordering::Relaxed);
        let x = clamp_into(params, self.bounds);
        let mut g = self.objective.gradient(&x).map_err(to_argmin)?;

        // Project out components pushing through an active bound.
        for ((gi, &xi), &(lo, hi)) in g.iter_mut().zip(&x).zip(self.bounds) {
            let at_lo = xi <= lo + ACTIVE_BOUND_EPS && *gi > 0.0;
            let at_hi = xi >= hi - ACTIVE_BOUND_EPS && *gi < 0.0;
            if at_lo || at_hi {
                *gi = 0.0;
            }
        }
        Ok(g)
    }
}

/// Bounded L-BFGS minimizer
#[derive(Debug, Clone, Default)]
pub struct LbfgsbOptimizer {
    config: OptimizerConfig,
}

impl LbfgsbOptimizer {
    /// Minimizer with the given settings
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Settings in use
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Minimize `objective` from `init` within `bounds` (one `(lo, hi)` per parameter).
    ///
    /// `init` is clamped into the box first. A parameter with `lo == hi` is held fixed.
    pub fn minimize(
        &self,
        objective: &dyn ObjectiveFunction,
        init: &[f64],
        bounds: &[(f64, f64)],
    ) -> Result<OptimizationResult> {
        if init.len() != bounds.len() {
            return Err(Error::Validation(format!(
                "{} initial values for {} bounds",
                init.len(),
                bounds.len()
            )));
        }
        if let Some((lo, hi)) = bounds.iter().find(|(lo, hi)| !(lo <= hi)) {
            return Err(Error::Validation(format!("invalid bound ({}, {})", lo, hi)));
        }
        self.config.validate()?;

        let counts = Arc::new(EvalCounts::default());
        let problem = BoxedProblem { objective, bounds, counts: Arc::clone(&counts) };

        let solver = LBFGS::new(MoreThuenteLineSearch::new(), self.config.m)
            .with_tolerance_grad(self.config.tol)
            .and_then(|s| s.with_tolerance_cost(self.config.cost_tolerance()))
            .map_err(|e| Error::Validation(format!("optimizer configuration rejected: {e}")))?;

        let start = clamp_into(init, bounds);
        let max_iter = self.config.max_iter;
        let res = Executor::new(problem, solver)
            .configure(|state| state.param(start).max_iters(max_iter))
            .run()
            .map_err(|e| Error::Computation(format!("minimization failed: {e}")))?;

        let state = res.state();
        let best = state
            .get_best_param()
            .ok_or_else(|| Error::Computation("minimizer returned no parameters".to_string()))?;
        let status = state.get_termination_status();
        let converged = matches!(
            status,
            TerminationStatus::Terminated(
                TerminationReason::SolverConverged | TerminationReason::TargetCostReached
            )
        );

        Ok(OptimizationResult {
            parameters: clamp_into(best, bounds),
            fval: state.get_best_cost(),
            n_iter: state.get_iter(),
            n_fev: counts.cost.load(Ordering::Relaxed),
            n_gev: counts.grad.load(Ordering::Relaxed),
            converged,
            message: status.to_string(),
        })
    }
}
