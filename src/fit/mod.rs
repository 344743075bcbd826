//! Global fitting orchestration.
//!
//! Responsibilities:
//!
//! - split regions into worker groups balanced by observation count
//! - project each region onto its NNLS amplitudes (parallel)
//! - drive the Levenberg-Marquardt minimizer over the shared nonlinear parameters
//! - maintain per-observation weights, progress and cancellation

pub mod fitter;
pub mod partition;
pub mod progress;
pub mod projector;
pub mod weighting;

pub use fitter::VariableProjectionFitter;
pub use partition::{Group, Partition};
pub use progress::ProgressReporter;
pub use projector::{ProjectorScratch, RegionProjector, RegionRows};
pub use weighting::{initial_weights, refresh_weights};
