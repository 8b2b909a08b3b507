//! # sc-core
//!
//! Core types, traits, and error handling for srcomb.
//!
//! This crate provides:
//! - The shared error type
//! - Model traits used by the inference layer
//! - The signal-region data model (yields, luminosity factors, combination results)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::LogDensityModel;
pub use types::{CombinationResult, LuminosityFactor, ScaledRegion, SignalRegionYield};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
