//! Maximum-likelihood fits

use crate::optimizer::{LbfgsbOptimizer, ObjectiveFunction, OptimizationResult, OptimizerConfig};
use sc_core::traits::LogDensityModel;
use sc_core::{Error, Result};
use std::sync::Mutex;

/// Minimizes a model's negative log-likelihood within its parameter bounds.
#[derive(Debug, Clone, Default)]
pub struct MaximumLikelihoodEstimator {
    config: OptimizerConfig,
}

impl MaximumLikelihoodEstimator {
    /// Estimator with default optimizer settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Estimator with custom optimizer settings
    pub fn with_config(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Optimizer settings in use
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Minimize NLL starting from the model's suggested initial values.
    pub fn fit_minimum(&self, model: &impl LogDensityModel) -> Result<OptimizationResult> {
        self.fit_minimum_from(model, &model.parameter_init())
    }

    /// Minimize NLL from an explicit starting point.
    ///
    /// Lets callers warm-start a fit from a neighbouring solution.
    pub fn fit_minimum_from(
        &self,
        model: &impl LogDensityModel,
        init: &[f64],
    ) -> Result<OptimizationResult> {
        if init.len() != model.dim() {
            return Err(Error::Validation(format!(
                "fit_minimum_from: {} initial values for a model of dimension {}",
                init.len(),
                model.dim()
            )));
        }
        let bounds = model.parameter_bounds();
        let objective = NllObjective { model, last: Mutex::new(None) };
        LbfgsbOptimizer::new(self.config.clone()).minimize(&objective, init, &bounds)
    }
}

/// NLL objective remembering the last `(params, nll)` pair.
///
/// The line search re-evaluates the accepted point, which then hits the cache.
struct NllObjective<'a, M: LogDensityModel + ?Sized> {
    model: &'a M,
    last: Mutex<Option<(Vec<f64>, f64)>>,
}

impl<M: LogDensityModel + ?Sized> ObjectiveFunction for NllObjective<'_, M> {
    fn eval(&self, params: &[f64]) -> Result<f64> {
        let mut last = self.last.lock().map_err(|_| {
            Error::Computation("NLL cache poisoned by a panicking evaluation".to_string())
        })?;
        if let Some((p, v)) = last.as_ref() {
            if p.as_slice() == params {
                return Ok(*v);
            }
        }
        let v = self.model.nll(params)?;
        if !v.is_finite() {
            return Err(Error::Computation(format!("non-finite NLL {} at {:?}", v, params)));
        }
        *last = Some((params.to_vec(), v));
        Ok(v)
    }

    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        self.model.grad_nll(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use sc_model::pyhf::simplemodels::signal_region_model;

    #[test]
    fn test_free_fit_recovers_observed_excess() {
        // Observation [b] = [40]; swap in n = 52 so mu_hat = 12.
        let model =
            signal_region_model(40.0, 4.0, 100.0).unwrap().with_observed_main(&[52.0]).unwrap();
        let mle = MaximumLikelihoodEstimator::new();
        let r = mle.fit_minimum(&model).unwrap();
        assert!(r.converged, "{r}");
        assert_relative_eq!(r.parameters[0], 12.0, epsilon = 1e-2);
        assert!(r.parameters[1].abs() < 1e-2, "{r}");
    }

    #[test]
    fn test_fixed_poi_fit_pulls_nuisance() {
        let model =
            signal_region_model(40.0, 4.0, 100.0).unwrap().with_observed_main(&[52.0]).unwrap();
        let fixed = model.with_fixed_param(0, 0.0);
        let mle = MaximumLikelihoodEstimator::new();
        let r = mle.fit_minimum(&fixed).unwrap();
        assert!(r.converged, "{r}");
        assert_eq!(r.parameters[0], 0.0);
        // The background scales up to cover part of the excess.
        assert!(r.parameters[1] > 0.5, "{r}");

        let free = mle.fit_minimum(&model).unwrap();
        assert!(r.fval >= free.fval);
    }

    #[test]
    fn test_warm_start_length_is_checked() {
        let model = signal_region_model(10.0, 1.0, 50.0).unwrap();
        let mle = MaximumLikelihoodEstimator::new();
        assert!(mle.fit_minimum_from(&model, &[1.0]).is_err());
        let r = mle.fit_minimum_from(&model, &[0.0, 0.0]).unwrap();
        assert!(r.converged, "{r}");
    }
}
