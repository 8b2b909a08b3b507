//! Probability building blocks for srcomb.
//!
//! Small, dependency-light helpers shared by the likelihood model and the
//! asymptotic CLs calculator:
//! - normal distribution (log-pdf, cdf)
//! - Poisson log-likelihood terms

pub mod normal;
pub mod poisson;
