//! Closed-form discovery significances for a counting experiment.
//!
//! Both estimators are the asymptotic median significance of an `s` signal
//! over a `b` background (Cowan, Cranmer, Gross, Vitells, Eur.Phys.J. C71 (2011) 1554);
//! [`cowan_significance`] profiles an absolute background uncertainty `db`.

use serde::{Deserialize, Serialize};

/// `Z_A = sqrt(2((s+b) ln(1+s/b) - s))`, `0` for `s <= 0` or `b <= 0`.
pub fn asimov_significance(s: f64, b: f64) -> f64 {
    if b <= 0.0 || s <= 0.0 {
        return 0.0;
    }
    let q = 2.0 * ((s + b) * (s / b).ln_1p() - s);
    q.max(0.0).sqrt()
}

/// Asimov significance with background uncertainty `db`; `0` if any input is `<= 0`.
///
/// Tends to [`asimov_significance`] as `db -> 0`.
pub fn cowan_significance(s: f64, b: f64, db: f64) -> f64 {
    if b <= 0.0 || db <= 0.0 || s <= 0.0 {
        return 0.0;
    }
    let sb2 = db * db;
    let n = s + b;
    let term1 = n * ((n * (b + sb2)) / (b * b + n * sb2)).ln();
    let term2 = (b * b / sb2) * (sb2 * s / (b * (b + sb2))).ln_1p();
    (2.0 * (term1 - term2)).max(0.0).sqrt()
}

/// Both estimators for one region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Significance {
    /// [`asimov_significance`]
    pub asimov: f64,
    /// [`cowan_significance`]
    pub cowan: f64,
}

impl Significance {
    /// Evaluate both estimators.
    pub fn new(s: f64, b: f64, db: f64) -> Self {
        Self { asimov: asimov_significance(s, b), cowan: cowan_significance(s, b, db) }
    }
}
