//! Error types for srcomb

use thiserror::Error;

/// srcomb error type
#[derive(Error, Debug)]
pub enum Error {
    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),

    /// The statistical model cannot be built, or its limit search failed.
    #[error("Invalid model: {0}")]
    InvalidModel(String),

    /// A combination was requested over zero signal regions.
    #[error("Empty grouping: at least one signal region is required")]
    EmptyGrouping,

    /// An expected table, column or file is absent.
    #[error("Missing input: {0}")]
    MissingInput(String),

    /// Regions passed together are not statistically independent.
    #[error("Overlapping regions: {0}")]
    Overlap(String),

    /// Failure while combining a specific grouping at a specific luminosity factor.
    #[error("combination of [{}] at lumi x{lumi_factor} failed: {source}", regions.join(", "))]
    Combination {
        /// Labels (`analysis:region`) of the grouping.
        regions: Vec<String>,
        /// Luminosity factor being evaluated.
        lumi_factor: f64,
        /// Underlying error.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Innermost error, looking through [`Error::Combination`] context layers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Combination { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
