//! Core traits for srcomb
//!
//! The optimizer and maximum-likelihood fits are written against
//! [`LogDensityModel`] rather than a concrete likelihood.

use crate::Result;

/// Model interface consumed by the maximum-likelihood machinery.
pub trait LogDensityModel: Send + Sync {
    /// Number of parameters.
    fn dim(&self) -> usize;

    /// Parameter names (stable order).
    fn parameter_names(&self) -> Vec<String>;

    /// Parameter bounds (min, max) (stable order).
    fn parameter_bounds(&self) -> Vec<(f64, f64)>;

    /// Suggested initial values (stable order).
    fn parameter_init(&self) -> Vec<f64>;

    /// Negative log-likelihood.
    fn nll(&self, params: &[f64]) -> Result<f64>;

    /// Gradient of NLL.
    ///
    /// The default is a central finite difference; models with a closed form
    /// should override it.
    fn grad_nll(&self, params: &[f64]) -> Result<Vec<f64>> {
        let mut grad = vec![0.0; params.len()];
        let mut work = params.to_vec();
        for i in 0..params.len() {
            let eps = 1e-8 * params[i].abs().max(1.0);
            work[i] = params[i] + eps;
            let f_plus = self.nll(&work)?;
            work[i] = params[i] - eps;
            let f_minus = self.nll(&work)?;
            work[i] = params[i];
            grad[i] = (f_plus - f_minus) / (2.0 * eps);
        }
        Ok(grad)
    }
}
