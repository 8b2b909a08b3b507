//! pyhf JSON workspace subset

pub mod model;
pub mod schema;
pub mod simplemodels;


pub use model::*;
pub use schema::*;
