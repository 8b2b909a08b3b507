//! Single-region counting models.
//!
//! Builds the one-bin workspace used for expected limits: a unit signal
//! template scaled by the POI `mu`, and a background sample with a `normsys`
//! uncertainty.

use super::model::HistFactoryModel;
use super::schema::{
    Channel, Measurement, MeasurementConfig, Modifier, NormSysData, Observation, ParameterConfig,
    Sample, Workspace,
};
use sc_core::{Error, Result};

/// Name of the signal-strength parameter.
pub const POI_NAME: &str = "mu";
/// Name of the background normalization nuisance parameter.
pub const BKG_NUISANCE: &str = "bkg_unc";
/// Channel name of the single signal region.
pub const CHANNEL_NAME: &str = "signal_region";

/// Build a one-bin workspace for a signal region with background `b ± db`.
///
/// The signal template is `[1.0]`, so a limit on `mu` is a limit on the signal
/// yield. The background uncertainty is a relative `normsys` with
/// `hi = 1 + db/b`, `lo = 1 - db/b`. The observation is the background-only
/// expectation `[b]`; limit code replaces it with an Asimov dataset.
///
/// # Errors
/// [`Error::InvalidModel`] if `b` is not positive, `db` is negative, any input is
/// non-finite, or the POI bound is not positive.
pub fn signal_region(b: f64, db: f64, poi_upper_bound: f64) -> Result<Workspace> {
    if !b.is_finite() || b <= 0.0 {
        return Err(Error::InvalidModel(format!("background must be finite and > 0, got {}", b)));
    }
    if !db.is_finite() || db < 0.0 {
        return Err(Error::InvalidModel(format!(
            "background uncertainty must be finite and >= 0, got {}",
            db
        )));
    }
    if !poi_upper_bound.is_finite() || poi_upper_bound <= 0.0 {
        return Err(Error::InvalidModel(format!(
            "POI upper bound must be finite and > 0, got {}",
            poi_upper_bound
        )));
    }

    let rel = db / b;
    Ok(Workspace {
        channels: vec![Channel {
            name: CHANNEL_NAME.to_string(),
            samples: vec![
                Sample {
                    name: "signal".to_string(),
                    data: vec![1.0],
                    modifiers: vec![Modifier::NormFactor {
                        name: POI_NAME.to_string(),
                        data: None,
                    }],
                },
                Sample {
                    name: "background".to_string(),
                    data: vec![b],
                    modifiers: vec![Modifier::NormSys {
                        name: BKG_NUISANCE.to_string(),
                        data: NormSysData { hi: 1.0 + rel, lo: 1.0 - rel },
                    }],
                },
            ],
        }],
        observations: vec![Observation { name: CHANNEL_NAME.to_string(), data: vec![b] }],
        measurements: vec![Measurement {
            name: "expected_limit".to_string(),
            config: MeasurementConfig {
                poi: POI_NAME.to_string(),
                parameters: vec![ParameterConfig {
                    name: POI_NAME.to_string(),
                    bounds: vec![[0.0, poi_upper_bound]],
                    ..Default::default()
                }],
            },
        }],
        version: Some("1.0.0".to_string()),
    })
}

/// [`signal_region`] compiled into a [`HistFactoryModel`].
pub fn signal_region_model(b: f64, db: f64, poi_upper_bound: f64) -> Result<HistFactoryModel> {
    HistFactoryModel::from_workspace(&signal_region(b, db, poi_upper_bound)?)
}
