//! Input data: acquisition grid, instrument response, regions and the
//! synthetic sample generator.

pub mod acquisition;
pub mod dataset;
pub mod sample;

pub use acquisition::{Acquisition, InstrumentResponse};
pub use dataset::{transform, Dataset, Exclusion, FitRegion, Region, TransformedData};
pub use sample::{generate_sample, SampleData};
