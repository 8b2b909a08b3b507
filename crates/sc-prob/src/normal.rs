//! Normal distribution utilities.

use sc_core::{Error, Result};

/// Natural log of `sqrt(2π)`.
const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_7;

/// Log-PDF of a Normal distribution `N(mu, sigma)` at `x`.
///
/// `log p(x) = -0.5 * ((x-mu)/sigma)^2 - ln(sigma) - ln(sqrt(2π))`
pub fn logpdf(x: f64, mu: f64, sigma: f64) -> Result<f64> {
    if !sigma.is_finite() || sigma <= 0.0 {
        return Err(Error::Validation(format!("sigma must be finite and > 0, got {}", sigma)));
    }
    let z = (x - mu) / sigma;
    Ok(-0.5 * z * z - sigma.ln() - LN_SQRT_2PI)
}

/// Negative log-likelihood for a Normal distribution `N(mu, sigma)` at `x`.
pub fn nll(x: f64, mu: f64, sigma: f64) -> Result<f64> {
    Ok(-logpdf(x, mu, sigma)?)
}

/// Standard normal CDF `Φ(x)`.
///
/// Evaluated as `0.5 * erfc(-x / √2)`, which stays accurate deep in the lower tail
/// where CLs+b and CLb both become tiny.
pub fn cdf(x: f64) -> f64 {
    0.5 * statrs::function::erf::erfc(-x / std::f64::consts::SQRT_2)
}
