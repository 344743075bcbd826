//! Error types for the fitting engine and its front end.
//!
//! Only failures that abort a session are errors. Numerical trouble inside a
//! region is absorbed by the projector, and minimizer failures are reported
//! through [`crate::domain::FitStatus`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FitError {
    /// Invalid thread count, region size, parameter layout or settings.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A session buffer could not be allocated.
    #[error("Allocation failure: {0}")]
    Allocation(String),

    /// The dataset is unusable (e.g. every region was excluded).
    #[error("Data error: {0}")]
    Data(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FitError {
    pub fn config(message: impl Into<String>) -> Self {
        FitError::Configuration(message.into())
    }

    pub fn data(message: impl Into<String>) -> Self {
        FitError::Data(message.into())
    }

    /// Process exit code used by the `flimfit` binary.
    pub fn exit_code(&self) -> u8 {
        match self {
            FitError::Configuration(_) | FitError::Io(_) | FitError::Json(_) => 2,
            FitError::Allocation(_) | FitError::Data(_) => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, FitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_class() {
        assert_eq!(FitError::config("bad threads").exit_code(), 2);
        assert_eq!(FitError::Allocation("fjac".into()).exit_code(), 3);
        assert_eq!(FitError::data("empty").exit_code(), 3);
    }

    #[test]
    fn display_includes_message() {
        let err = FitError::config("n_thread must be >= 1");
        assert_eq!(err.to_string(), "Configuration error: n_thread must be >= 1");
    }
}
