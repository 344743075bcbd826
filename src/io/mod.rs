//! Input/output helpers.
//!
//! - results JSON read/write (`results`)
//! - per-region CSV export (`export`)

pub mod export;
pub mod results;

pub use export::*;
pub use results::*;
