//! Decay models.
//!
//! A model owns the convolution kernels' configuration and turns nonlinear
//! parameters into per-region design matrices, so fitting code can stay
//! generic over the model.

pub mod model;

pub use model::*;
