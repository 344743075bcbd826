//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - configuration enums (`WeightingMode`, `DerivativeMode`, `ConvolverKind`)
//! - session/model/transform settings (`FitterConfig`, `ModelConfig`, ...)
//! - fit outputs (`FitOutcome`, `LinearResults`, `ResultsFile`)

pub mod types;

pub use types::*;
