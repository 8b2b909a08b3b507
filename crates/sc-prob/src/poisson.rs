//! Poisson likelihood terms.

use statrs::function::gamma::ln_gamma;

/// Floor applied to expected counts before taking logarithms.
pub const MIN_EXPECTED: f64 = 1e-10;

/// `ln Γ(n+1)`, the generalized `ln n!` for non-integer (Asimov) counts.
pub fn ln_factorial(n: f64) -> f64 {
    ln_gamma(n + 1.0)
}

/// Negative log of the Poisson probability of observing `n` given mean `lambda`.
///
/// `lambda` is floored at [`MIN_EXPECTED`]; `n == 0` reduces to `lambda`.
pub fn nll(n: f64, lambda: f64) -> f64 {
    let lambda = lambda.max(MIN_EXPECTED);
    if n > 0.0 { lambda - n * lambda.ln() + ln_factorial(n) } else { lambda }
}

/// Derivative of [`nll`] with respect to `lambda`.
pub fn dnll_dlambda(n: f64, lambda: f64) -> f64 {
    if lambda <= MIN_EXPECTED {
        return 0.0;
    }
    1.0 - n / lambda
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_ln_factorial_integers() {
        assert_relative_eq!(ln_factorial(0.0), 0.0, epsilon = 1e-12);
        assert_relative_eq!(ln_factorial(4.0), 24f64.ln(), epsilon = 1e-10);
    }

    #[test]
    fn test_nll_matches_pmf() {
        // P(3 | 2.5) = e^-2.5 2.5^3 / 3!
        let p: f64 = (-2.5f64).exp() * 2.5f64.powi(3) / 6.0;
        assert_relative_eq!(nll(3.0, 2.5), -p.ln(), epsilon = 1e-10);
        assert_relative_eq!(nll(0.0, 2.5), 2.5, epsilon = 1e-12);
    }

    #[test]
    fn test_nll_minimum_at_observed() {
        let n = 7.3;
        let at = nll(n, n);
        assert!(nll(n, n * 1.01) > at);
        assert!(nll(n, n * 0.99) > at);
        assert!(dnll_dlambda(n, n).abs() < 1e-12);
    }
}
