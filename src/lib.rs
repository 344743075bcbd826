//! `flim-fit` library crate.
//!
//! The binary (`flimfit`) is a thin wrapper around this library so that:
//!
//! - the fitting engine is testable without spawning processes
//! - the engine is reusable by other front ends (GUI, bindings, notebooks)
//!
//! Layering, leaf first: `math` (SVD least squares, NNLS) ->
//! `convolve` (IRF kernels) -> `models` (design matrices) -> `fit` (projector,
//! partition, weighting, session) -> `app` (pipeline and CLI).

pub mod app;
pub mod cli;
pub mod convolve;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod models;
pub mod plot;
pub mod report;
