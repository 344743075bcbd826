//! Regions of photon counts and the transformation into fit-ready data.
//!
//! A [`Dataset`] holds raw histograms on the full time grid. [`transform`]
//! applies the data settings in this order:
//!
//! 1. saturation: regions with any raw bin above `limit` are dropped
//! 2. gating: only bins inside `[t_start, t_stop]` are kept
//! 3. background: the constant `background` is subtracted from every bin
//! 4. threshold: regions whose total gated counts fall below `threshold` are dropped

use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::data::Acquisition;
use crate::domain::TransformSettings;
use crate::error::{FitError, Result};

/// One spatial region: a multi-channel photon-count histogram.
#[derive(Debug, Clone)]
pub struct Region {
    pub label: String,
    /// Channel-major counts on the full time grid.
    pub counts: Vec<f64>,
    /// Which IRF of the instrument response applies to this region.
    pub irf_idx: usize,
}

#[derive(Debug, Clone)]
pub struct Dataset {
    acquisition: Acquisition,
    regions: Vec<Region>,
}

impl Dataset {
    pub fn new(acquisition: Acquisition) -> Self {
        Self {
            acquisition,
            regions: Vec::new(),
        }
    }

    pub fn push_region(&mut self, region: Region) -> Result<()> {
        let expected = self.acquisition.n_chan() * self.acquisition.n_t_full();
        if region.counts.len() != expected {
            return Err(FitError::data(format!(
                "Region '{}' has {} values, expected {expected}.",
                region.label,
                region.counts.len()
            )));
        }
        if region.counts.iter().any(|v| !v.is_finite()) {
            return Err(FitError::data(format!("Region '{}' has non-finite counts.", region.label)));
        }
        self.regions.push(region);
        Ok(())
    }

    pub fn acquisition(&self) -> &Acquisition {
        &self.acquisition
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn n_regions(&self) -> usize {
        self.regions.len()
    }
}

/// A region after transformation, ready for the projector.
#[derive(Debug, Clone)]
pub struct FitRegion {
    pub label: String,
    /// Index of the source region in the dataset.
    pub source: usize,
    pub irf_idx: usize,
    /// Gated, background-subtracted counts, channel-major (`n_chan * n_t`).
    pub counts: Vec<f64>,
}

/// Why a region was left out of the fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exclusion {
    BelowThreshold,
    Saturated,
}

#[derive(Debug, Clone)]
pub struct TransformedData {
    acquisition: Arc<Acquisition>,
    regions: Vec<FitRegion>,
    excluded: Vec<(String, Exclusion)>,
}

impl TransformedData {
    /// The gated acquisition.
    pub fn acquisition(&self) -> &Arc<Acquisition> {
        &self.acquisition
    }

    pub fn regions(&self) -> &[FitRegion] {
        &self.regions
    }

    pub fn n_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn excluded(&self) -> &[(String, Exclusion)] {
        &self.excluded
    }
}

pub fn transform(dataset: &Dataset, settings: &TransformSettings) -> Result<TransformedData> {
    if !(settings.background.is_finite() && settings.threshold.is_finite() && settings.limit.is_finite()) {
        return Err(FitError::config("Background, threshold and limit must be finite."));
    }
    if settings.limit < 0.0 {
        return Err(FitError::config(format!("Saturation limit must be >= 0 (got {}).", settings.limit)));
    }

    let acquisition = dataset
        .acquisition()
        .clone()
        .with_gate(settings.t_start, settings.t_stop)?;
    let gate = acquisition.gate();
    let n_t_full = acquisition.n_t_full();

    let mut regions = Vec::with_capacity(dataset.n_regions());
    let mut excluded = Vec::new();

    for (source, region) in dataset.regions().iter().enumerate() {
        if settings.limit > 0.0 && region.counts.iter().any(|&v| v > settings.limit) {
            excluded.push((region.label.clone(), Exclusion::Saturated));
            continue;
        }

        let counts: Vec<f64> = region
            .counts
            .chunks(n_t_full)
            .flat_map(|chan| chan[gate.clone()].iter().map(|v| v - settings.background))
            .collect();

        let total: f64 = counts.iter().sum();
        if total < settings.threshold {
            excluded.push((region.label.clone(), Exclusion::BelowThreshold));
            continue;
        }

        regions.push(FitRegion {
            label: region.label.clone(),
            source,
            irf_idx: region.irf_idx,
            counts,
        });
    }

    if regions.is_empty() {
        return Err(FitError::data(format!(
            "No regions left to fit after transformation ({} excluded).",
            excluded.len()
        )));
    }

    info!(
        "Transformed data: {} regions kept, {} excluded, gate {:?} ({} bins/channel)",
        regions.len(),
        excluded.len(),
        gate,
        acquisition.n_t()
    );
    for (label, why) in &excluded {
        debug!("Excluded region {label}: {why:?}");
    }

    Ok(TransformedData {
        acquisition: Arc::new(acquisition),
        regions,
        excluded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> Dataset {
        let acq = Acquisition::new(2, 5, 0.0, 1.0).unwrap();
        let mut data = Dataset::new(acq);
        let regions = [
            ("bright", [10.0, 20.0, 30.0, 20.0, 10.0]),
            ("dim", [0.0, 1.0, 1.0, 0.0, 0.0]),
            ("hot", [10.0, 500.0, 30.0, 20.0, 10.0]),
        ];
        for (label, chan) in regions {
            let mut counts = chan.to_vec();
            counts.extend_from_slice(&chan);
            data.push_region(Region {
                label: label.to_string(),
                counts,
                irf_idx: 0,
            })
            .unwrap();
        }
        data
    }

    #[test]
    fn gate_and_background_are_applied_per_channel() {
        let settings = TransformSettings {
            t_start: 1.0,
            t_stop: 4.0,
            background: 1.0,
            ..TransformSettings::default()
        };
        let out = transform(&dataset(), &settings).unwrap();
        assert_eq!(out.acquisition().n_t(), 3);
        assert_eq!(out.regions()[0].counts, vec![19.0, 29.0, 19.0, 19.0, 29.0, 19.0]);
        assert_eq!(out.regions()[0].source, 0);
    }

    #[test]
    fn threshold_and_limit_exclude_regions() {
        let settings = TransformSettings {
            threshold: 10.0,
            limit: 100.0,
            ..TransformSettings::default()
        };
        let out = transform(&dataset(), &settings).unwrap();
        assert_eq!(out.n_regions(), 1);
        assert_eq!(out.regions()[0].label, "bright");
        assert_eq!(
            out.excluded(),
            &[
                ("dim".to_string(), Exclusion::BelowThreshold),
                ("hot".to_string(), Exclusion::Saturated)
            ]
        );
    }

    #[test]
    fn empty_result_is_a_data_error() {
        let settings = TransformSettings {
            threshold: 1e9,
            ..TransformSettings::default()
        };
        let err = transform(&dataset(), &settings).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn wrong_region_length_is_rejected() {
        let mut data = Dataset::new(Acquisition::new(1, 4, 0.0, 1.0).unwrap());
        let region = Region {
            label: "short".to_string(),
            counts: vec![1.0; 3],
            irf_idx: 0,
        };
        assert!(data.push_region(region).is_err());
    }
}
