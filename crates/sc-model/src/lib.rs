//! # sc-model
//!
//! Statistical models for signal-region limits.
//!
//! Models are described with a subset of the pyhf JSON workspace schema
//! (`normfactor` and `normsys` modifiers) and compiled into a
//! [`HistFactoryModel`] that exposes NLL, gradient and expected data to the
//! inference layer.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod pyhf;

pub use pyhf::{HistFactoryModel, Parameter, Workspace};
