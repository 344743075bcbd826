//! Global variable-projection fitting session.
//!
//! Given:
//! - a decay model (nonlinear parameters shared by every region)
//! - transformed regions of photon counts
//! - a weighting policy and a worker count
//!
//! the session minimizes the sum of squared projected residuals over the
//! nonlinear parameters, solving each region's amplitudes by NNLS inside every
//! residual evaluation.
//!
//! Execution model:
//! - one rayon pool per session; each pass spawns one task per region group
//!   inside `pool.scope`, the scope end is the barrier
//! - the residual, Jacobian and fitted-curve buffers are allocated once and
//!   split into disjoint row ranges per group, so workers never share memory
//! - `levenberg_marquardt` runs on the calling thread and sees the session as
//!   a `LeastSquaresProblem` over dynamic dimensions
//!
//! Iterative weighting runs the minimizer in rounds: weights are fixed within
//! a round and rebuilt from the fitted curve of the round's result until the
//! parameters stop moving.

use std::cell::RefCell;
use std::sync::Arc;

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use log::{debug, info, warn};
use nalgebra::storage::Owned;
use nalgebra::{DMatrix, DVector, Dyn};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::data::{FitRegion, TransformedData};
use crate::domain::{DerivativeMode, FitOutcome, FitStatus, FitterConfig, LinearResults, RegionResult, WeightingMode};
use crate::error::{FitError, Result};
use crate::fit::partition::Partition;
use crate::fit::progress::ProgressReporter;
use crate::fit::projector::{ProjectorScratch, RegionProjector, RegionRows};
use crate::fit::weighting::{initial_weights, refresh_weights};
use crate::math::{try_zeroed, NnlsStatus, NonNegativeLeastSquares};
use crate::models::DecayModel;

/// Reweighting rounds stop once no parameter moves by more than this,
/// relative to `max(|x|, 1)`.
const REWEIGHT_TOL: f64 = 1e-8;
const MAX_REWEIGHT_ROUNDS: usize = 10;

/// Residual evaluations allowed per iteration, times `n_params + 1`.
const PATIENCE_PER_ITERATION: usize = 10;

/// Lower bound on the forward-difference step scale.
const FD_MIN_SCALE: f64 = 1e-4;

/// Everything a pass needs.
struct PassEngine {
    model: Arc<dyn DecayModel>,
    data: Arc<TransformedData>,
    config: FitterConfig,
    reporter: Arc<ProgressReporter>,
    pool: ThreadPool,
    partition: Partition,
    nnls: NonNegativeLeastSquares,
    scratch: Vec<ProjectorScratch>,
    n_residuals: usize,
    n_params: usize,

    /// Observed counts, concatenated over regions.
    counts: Vec<f64>,
    targets: Vec<f64>,
    weights: Vec<f64>,
    /// Unweighted model curve of the last pass.
    fitted: Vec<f64>,
    residuals: Vec<f64>,
    /// Row-major `n_residuals × n_params`, valid after a Jacobian pass.
    jacobian: Vec<f64>,
    coefficients: Vec<f64>,
    statuses: Vec<NnlsStatus>,

    weights_frozen: bool,
}

/// One group's inputs and output rows for a pass.
struct GroupTask<'a> {
    regions: &'a [FitRegion],
    targets: &'a [f64],
    weights: &'a [f64],
    fvec: &'a mut [f64],
    fitted: &'a mut [f64],
    fjac: Option<&'a mut [f64]>,
    coefficients: &'a mut [f64],
    statuses: &'a mut [NnlsStatus],
    scratch: &'a mut ProjectorScratch,
}

impl GroupTask<'_> {
    fn run(self, projector: &RegionProjector<'_>, params: &[f64], rows: usize, n_cols: usize) {
        let n_params = params.len();
        let mut fjac_chunks = self.fjac.map(|j| j.chunks_mut(rows * n_params));
        let per_region = self
            .regions
            .iter()
            .zip(self.fvec.chunks_mut(rows))
            .zip(self.fitted.chunks_mut(rows))
            .zip(self.coefficients.chunks_mut(n_cols))
            .zip(self.statuses.iter_mut())
            .enumerate();
        for (i, ((((region, fvec), fitted), coefficients), status)) in per_region {
            let out = RegionRows {
                fvec,
                fitted,
                fjac: fjac_chunks.as_mut().and_then(|it| it.next()),
                coefficients,
            };
            let r = i * rows..(i + 1) * rows;
            *status = projector.project(
                params,
                region,
                &self.targets[r.clone()],
                &self.weights[r],
                self.scratch,
                out,
            );
        }
    }
}

impl PassEngine {
    /// Run every region at `params`, refreshing residuals, fitted curves,
    /// coefficients and, when asked, the Jacobian rows.
    fn run_pass(&mut self, params: &[f64], with_jacobian: bool) {
        let mut fvec = std::mem::take(&mut self.residuals);
        let mut fjac = std::mem::take(&mut self.jacobian);
        self.dispatch(params, &mut fvec, with_jacobian.then_some(fjac.as_mut_slice()));
        self.residuals = fvec;
        self.jacobian = fjac;
    }

    fn dispatch(&mut self, params: &[f64], fvec: &mut [f64], fjac: Option<&mut [f64]>) {
        let n_params = params.len();
        let n_cols = self.model.n_columns();
        let rows = self.model.rows_per_region();
        let regions = self.data.regions();

        let mut fvec_rest = fvec;
        let mut fitted_rest = self.fitted.as_mut_slice();
        let mut fjac_rest = fjac;
        let mut coeff_rest = self.coefficients.as_mut_slice();
        let mut status_rest = self.statuses.as_mut_slice();

        let mut tasks = Vec::with_capacity(self.partition.len());
        for (group, scratch) in self.partition.groups().iter().zip(self.scratch.iter_mut()) {
            let n_rows = group.rows.len();
            let n_regions = group.regions.len();

            let (fvec, rest) = std::mem::take(&mut fvec_rest).split_at_mut(n_rows);
            fvec_rest = rest;
            let (fitted, rest) = std::mem::take(&mut fitted_rest).split_at_mut(n_rows);
            fitted_rest = rest;
            let (coefficients, rest) = std::mem::take(&mut coeff_rest).split_at_mut(n_regions * n_cols);
            coeff_rest = rest;
            let (statuses, rest) = std::mem::take(&mut status_rest).split_at_mut(n_regions);
            status_rest = rest;
            let fjac = fjac_rest.take().map(|j| {
                let (mine, rest) = j.split_at_mut(n_rows * n_params);
                fjac_rest = Some(rest);
                mine
            });

            tasks.push(GroupTask {
                regions: &regions[group.regions.clone()],
                targets: &self.targets[group.rows.clone()],
                weights: &self.weights[group.rows.clone()],
                fvec,
                fitted,
                fjac,
                coefficients,
                statuses,
                scratch,
            });
        }

        let projector = RegionProjector::new(self.model.as_ref(), &self.nnls);
        let projector = &projector;
        self.pool.scope(|s| {
            for task in tasks {
                s.spawn(move |_| task.run(projector, params, rows, n_cols));
            }
        });
    }

    fn chi2(&self) -> f64 {
        self.residuals.iter().map(|r| r * r).sum()
    }

    fn count_status(&self, status: NnlsStatus) -> usize {
        self.statuses.iter().filter(|s| **s == status).count()
    }

    fn reweighting(&self) -> bool {
        self.config.weighting == WeightingMode::Iterative && !self.weights_frozen
    }
}

/// Bookkeeping shared by every round of one `fit` call.
#[derive(Debug, Default)]
struct Tracker {
    /// Jacobians requested, i.e. minimizer iterations started.
    iterations: usize,
    /// Residual passes, including finite-difference evaluations.
    evaluations: usize,
    /// Lowest chi-squared of the current round and where it was reached.
    best: Option<(f64, DVector<f64>)>,
    iteration_cap: bool,
    cancelled: bool,
}

/// The session seen as a least-squares problem for one minimizer round.
///
/// Weights stay fixed for the whole round. Cancellation is polled before
/// every pass; a cancelled pass makes the callback return `None`, which
/// stops the minimizer.
struct PassContext<'a> {
    engine: RefCell<&'a mut PassEngine>,
    tracker: RefCell<Tracker>,
    params: DVector<f64>,
    max_iterations: usize,
}

impl PassContext<'_> {
    /// Residuals at the admissible point nearest to `params`.
    fn residuals_at(&self, params: &DVector<f64>, track: bool) -> Option<DVector<f64>> {
        let mut engine = self.engine.borrow_mut();
        let mut tracker = self.tracker.borrow_mut();
        if engine.reporter.is_cancelled() {
            tracker.cancelled = true;
            return None;
        }
        let mut x = params.clone();
        engine.model.project(x.as_mut_slice());
        engine.run_pass(x.as_slice(), false);
        tracker.evaluations += 1;

        let chi2 = engine.chi2();
        if track && chi2.is_finite() && tracker.best.as_ref().is_none_or(|(best, _)| chi2 < *best) {
            tracker.best = Some((chi2, x));
        }
        Some(DVector::from_column_slice(&engine.residuals))
    }

    /// Iteration cap, cancellation and progress, once per Jacobian request.
    fn begin_iteration(&self) -> bool {
        let engine = self.engine.borrow();
        let mut tracker = self.tracker.borrow_mut();
        if tracker.iterations >= self.max_iterations {
            tracker.iteration_cap = true;
            return false;
        }
        if engine.reporter.is_cancelled() {
            tracker.cancelled = true;
            return false;
        }
        let chi2 = tracker.best.as_ref().map_or(f64::NAN, |(c, _)| *c);
        engine.reporter.update(tracker.iterations, chi2);
        tracker.iterations += 1;
        true
    }

    fn analytic_jacobian(&self) -> Option<DMatrix<f64>> {
        let mut engine = self.engine.borrow_mut();
        if engine.reporter.is_cancelled() {
            self.tracker.borrow_mut().cancelled = true;
            return None;
        }
        engine.run_pass(self.params.as_slice(), true);
        self.tracker.borrow_mut().evaluations += 1;
        Some(DMatrix::from_row_slice(engine.n_residuals, engine.n_params, &engine.jacobian))
    }

    /// Jacobian from whole-residual passes, `h_j = sqrt(eps) * max(|x_j|, 1e-4)`.
    fn forward_difference_jacobian(&self) -> Option<DMatrix<f64>> {
        let base = self.residuals_at(&self.params, false)?;
        let mut jac = DMatrix::zeros(base.len(), self.params.len());
        let mut shifted = self.params.clone();
        for j in 0..self.params.len() {
            let x = self.params[j];
            shifted[j] = x + f64::EPSILON.sqrt() * x.abs().max(FD_MIN_SCALE);
            let h = shifted[j] - x;
            let r = self.residuals_at(&shifted, false)?;
            jac.set_column(j, &((r - &base) / h));
            shifted[j] = x;
        }
        Some(jac)
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for PassContext<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.copy_from(x);
        self.engine.get_mut().model.project(self.params.as_mut_slice());
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        self.residuals_at(&self.params, true)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        if !self.begin_iteration() {
            return None;
        }
        let derivatives = self.engine.borrow().config.derivatives;
        match derivatives {
            DerivativeMode::Analytic => self.analytic_jacobian(),
            DerivativeMode::Numerical => self.forward_difference_jacobian(),
        }
    }
}

/// Where one minimizer round ended.
struct RoundResult {
    termination: TerminationReason,
    params: Vec<f64>,
    chi2: f64,
}

fn classify(termination: &TerminationReason, tracker: &Tracker) -> (FitStatus, String) {
    match termination {
        TerminationReason::User(_) if tracker.cancelled => (FitStatus::Cancelled, "stopped by request".to_string()),
        TerminationReason::User(_) if tracker.iteration_cap => {
            (FitStatus::MaxIterationsReached, "iteration limit reached".to_string())
        }
        TerminationReason::LostPatience => {
            (FitStatus::MaxIterationsReached, "evaluation budget exhausted".to_string())
        }
        TerminationReason::ResidualsZero => (FitStatus::Converged, "residual is exactly zero".to_string()),
        TerminationReason::Orthogonal => (
            FitStatus::Converged,
            "gradient orthogonal to residual within gtol".to_string(),
        ),
        TerminationReason::Converged { ftol, xtol } => {
            let reason = match (*ftol, *xtol) {
                (true, true) => "relative reduction below ftol and step below xtol",
                (true, false) => "relative reduction in chi-squared below ftol",
                _ => "relative step size below xtol",
            };
            (FitStatus::Converged, reason.to_string())
        }
        TerminationReason::NoImprovementPossible(what) => (
            FitStatus::Converged,
            format!("no further improvement possible at machine precision ({what})"),
        ),
        other => (FitStatus::NumericalFailure, format!("minimizer stopped: {other:?}")),
    }
}

fn relative_shift(from: &[f64], to: &[f64]) -> f64 {
    from.iter()
        .zip(to)
        .map(|(a, b)| (a - b).abs() / a.abs().max(1.0))
        .fold(0.0, f64::max)
}

/// A fitting session: one model, one dataset, one worker pool.
pub struct VariableProjectionFitter {
    engine: PassEngine,
    last_status: Option<FitStatus>,
}

impl VariableProjectionFitter {
    pub fn new(
        model: Arc<dyn DecayModel>,
        data: Arc<TransformedData>,
        config: FitterConfig,
        reporter: Arc<ProgressReporter>,
    ) -> Result<Self> {
        if config.n_thread == 0 {
            return Err(FitError::config("Thread count must be >= 1."));
        }
        let rows = model.rows_per_region();
        if rows == 0 || rows > config.max_region_size {
            return Err(FitError::config(format!(
                "Region size {rows} is outside 1..={} observations.",
                config.max_region_size
            )));
        }
        if data.acquisition().n_rows() != rows {
            return Err(FitError::config(format!(
                "Model expects {rows} observations per region, data has {}.",
                data.acquisition().n_rows()
            )));
        }
        for tol in [config.ftol, config.xtol, config.gtol] {
            if !(tol.is_finite() && tol >= 0.0) {
                return Err(FitError::config(format!("Tolerances must be finite and >= 0 (got {tol}).")));
            }
        }
        let n_irf = model.irf().n_irf();
        if let Some(r) = data.regions().iter().find(|r| r.irf_idx >= n_irf) {
            return Err(FitError::config(format!(
                "Region '{}' refers to IRF {} but only {n_irf} are loaded.",
                r.label, r.irf_idx
            )));
        }
        if data.n_regions() == 0 {
            return Err(FitError::data("No regions to fit."));
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(config.n_thread)
            .thread_name(|i| format!("flimfit-worker-{i}"))
            .build()
            .map_err(|e| FitError::config(format!("Failed to create thread pool: {e}")))?;

        let n_regions = data.n_regions();
        let n_params = model.n_nonlinear();
        let partition = Partition::balanced(&vec![rows; n_regions], config.n_thread);
        let m = rows.checked_mul(n_regions).ok_or_else(|| {
            FitError::Allocation(format!("{n_regions} regions of {rows} rows overflow"))
        })?;
        let jac_len = m.checked_mul(n_params).ok_or_else(|| {
            FitError::Allocation(format!("Jacobian of {m} x {n_params} overflows"))
        })?;

        let mut counts = try_zeroed(m, "count buffer")?;
        for (chunk, region) in counts.chunks_mut(rows).zip(data.regions()) {
            chunk.copy_from_slice(&region.counts);
        }
        let mut targets = try_zeroed(m, "target buffer")?;
        let mut weights = try_zeroed(m, "weight buffer")?;
        initial_weights(config.weighting, &counts, &mut targets, &mut weights);

        let coeff_len = n_regions * model.n_columns();
        let scratch = (0..partition.len()).map(|_| ProjectorScratch::new(model.as_ref())).collect();

        info!(
            "Fit session: {n_regions} regions x {rows} rows, {n_params} nonlinear / {} linear parameters, \
             {} groups on {} threads, {:?} weighting, {:?} derivatives",
            model.n_columns(),
            partition.len(),
            config.n_thread,
            config.weighting,
            config.derivatives
        );

        let engine = PassEngine {
            fitted: try_zeroed(m, "fitted curve buffer")?,
            residuals: try_zeroed(m, "residual buffer")?,
            jacobian: try_zeroed(jac_len, "Jacobian")?,
            coefficients: try_zeroed(coeff_len, "coefficient buffer")?,
            statuses: vec![NnlsStatus::Optimal; n_regions],
            n_residuals: m,
            n_params,
            counts,
            targets,
            weights,
            model,
            data,
            config,
            reporter,
            pool,
            partition,
            nnls: NonNegativeLeastSquares::new(),
            scratch,
            weights_frozen: false,
        };

        Ok(Self {
            engine,
            last_status: None,
        })
    }

    pub fn n_regions(&self) -> usize {
        self.engine.data.n_regions()
    }

    pub fn n_groups(&self) -> usize {
        self.engine.partition.len()
    }

    fn check_len(&self, params: &[f64]) -> Result<()> {
        let n_params = self.engine.n_params;
        if params.len() != n_params {
            return Err(FitError::config(format!(
                "Expected {n_params} parameters, got {}.",
                params.len()
            )));
        }
        Ok(())
    }

    /// Minimize over the nonlinear parameters starting from `initial`.
    pub fn fit(&mut self, initial: &[f64], max_iterations: usize) -> Result<FitOutcome> {
        self.check_len(initial)?;
        if initial.iter().any(|v| !v.is_finite()) {
            return Err(FitError::config("Initial parameters must be finite."));
        }

        let solver = LevenbergMarquardt::new()
            .with_ftol(self.engine.config.ftol)
            .with_xtol(self.engine.config.xtol)
            .with_gtol(self.engine.config.gtol)
            .with_patience(max_iterations.max(1) * PATIENCE_PER_ITERATION);
        self.engine.reporter.start(max_iterations);

        let mut x = initial.to_vec();
        self.engine.model.project(&mut x);
        let mut tracker = Tracker::default();
        let mut round = 0;
        let last = loop {
            let result = self.minimize_round(&solver, &x, max_iterations, &mut tracker);
            round += 1;
            let shift = relative_shift(&x, &result.params);
            x.clone_from(&result.params);

            let (status, _) = classify(&result.termination, &tracker);
            if !self.engine.reweighting() || status != FitStatus::Converged {
                break result;
            }
            if round > 1 && shift <= REWEIGHT_TOL {
                debug!("Reweighting settled after {round} rounds (shift {shift:.3e})");
                break result;
            }
            if round == MAX_REWEIGHT_ROUNDS {
                debug!("Reweighting stopped after {round} rounds (shift {shift:.3e})");
                break result;
            }
            self.refresh_weights_at(&x);
            debug!("Reweighting round {round}: shift {shift:.3e}, chi2={:.6e}", result.chi2);
        };

        let (status, reason) = classify(&last.termination, &tracker);
        self.last_status = Some(status);
        self.engine.reporter.update(tracker.iterations, last.chi2);

        let n_linear = self.n_regions() * self.engine.model.n_columns();
        let dof = self
            .engine
            .n_residuals
            .saturating_sub(self.engine.n_params + n_linear)
            .max(1);
        let outcome = FitOutcome {
            parameters: last.params,
            parameter_names: self.engine.model.parameter_names(),
            iterations: tracker.iterations,
            evaluations: tracker.evaluations,
            status,
            reason,
            chi2: last.chi2,
            reduced_chi2: last.chi2 / dof as f64,
        };

        let n_limit = self.engine.count_status(NnlsStatus::IterationLimit);
        if n_limit > 0 {
            warn!("{n_limit} regions hit the NNLS iteration limit in the last pass");
        }
        match status {
            FitStatus::NumericalFailure => warn!("Fit stopped on numerical failure: {}", outcome.reason),
            FitStatus::Cancelled => warn!("Fit cancelled after {} iterations", outcome.iterations),
            _ => {}
        }
        info!(
            "Fit {} after {} iterations ({} evaluations): chi2={:.6e}, reduced={:.4}",
            status.display_name(),
            outcome.iterations,
            outcome.evaluations,
            outcome.chi2,
            outcome.reduced_chi2
        );
        debug!("Final parameters: {:?}", outcome.parameters);

        Ok(outcome)
    }

    /// One minimizer run at fixed weights. Returns the lowest-chi2 point the
    /// minimizer evaluated, or `start` when nothing was evaluated.
    fn minimize_round(
        &mut self,
        solver: &LevenbergMarquardt<f64>,
        start: &[f64],
        max_iterations: usize,
        tracker: &mut Tracker,
    ) -> RoundResult {
        tracker.best = None;
        let ctx = PassContext {
            engine: RefCell::new(&mut self.engine),
            tracker: RefCell::new(std::mem::take(tracker)),
            params: DVector::from_column_slice(start),
            max_iterations,
        };
        let (ctx, report) = solver.minimize(ctx);
        *tracker = ctx.tracker.into_inner();

        let (chi2, params) = match tracker.best.take() {
            Some((chi2, x)) => (chi2, x.as_slice().to_vec()),
            None => (f64::NAN, start.to_vec()),
        };
        debug!(
            "Minimizer round ended: {:?} after {} evaluations",
            report.termination, report.number_of_evaluations
        );
        RoundResult {
            termination: report.termination,
            params,
            chi2,
        }
    }

    /// Rebuild model-based weights from the fitted curve at `params`.
    fn refresh_weights_at(&mut self, params: &[f64]) {
        let engine = &mut self.engine;
        engine.run_pass(params, false);
        refresh_weights(&engine.fitted, &mut engine.weights);
    }

    /// Re-solve every region at `params` and collect the linear results.
    pub fn linear_params(&mut self, params: &[f64]) -> Result<LinearResults> {
        self.check_len(params)?;
        let engine = &mut self.engine;
        let mut params = params.to_vec();
        engine.model.project(&mut params);
        engine.run_pass(&params, false);

        let rows = engine.model.rows_per_region();
        let n_cols = engine.model.n_columns();
        let n_exp = if engine.model.has_offset() { n_cols - 1 } else { n_cols };
        let dof = rows.saturating_sub(n_cols).max(1) as f64;

        let regions = engine
            .data
            .regions()
            .iter()
            .enumerate()
            .map(|(i, region)| {
                let coeffs = &engine.coefficients[i * n_cols..(i + 1) * n_cols];
                let r = &engine.residuals[i * rows..(i + 1) * rows];
                RegionResult {
                    label: region.label.clone(),
                    amplitudes: coeffs[..n_exp].to_vec(),
                    offset: engine.model.has_offset().then(|| coeffs[n_exp]),
                    chi2: r.iter().map(|v| v * v).sum::<f64>() / dof,
                    status: engine.statuses[i],
                    observed: engine.counts[i * rows..(i + 1) * rows].to_vec(),
                    fitted: engine.fitted[i * rows..(i + 1) * rows].to_vec(),
                }
            })
            .collect();

        let n_degenerate = engine.count_status(NnlsStatus::Degenerate);
        let n_iteration_limit = engine.count_status(NnlsStatus::IterationLimit);
        if n_iteration_limit > 0 {
            warn!("{n_iteration_limit} regions hit the NNLS iteration limit");
        }
        Ok(LinearResults {
            regions,
            n_degenerate,
            n_iteration_limit,
        })
    }

    /// Keep the current weights for all further passes.
    ///
    /// Only meaningful with iterative weighting: the weights stop tracking the
    /// model curve.
    pub fn freeze_weights(&mut self) {
        self.engine.weights_frozen = true;
    }

    /// Set the weights implied by the fitted curve at `params`, then freeze
    /// them.
    ///
    /// The curve is solved with the weights in place, as the last reweighting
    /// round would have done.
    pub fn freeze_weights_at(&mut self, params: &[f64]) -> Result<()> {
        self.check_len(params)?;
        let mut params = params.to_vec();
        self.engine.model.project(&mut params);
        self.refresh_weights_at(&params);
        self.engine.weights_frozen = true;
        Ok(())
    }

    /// Current per-observation weights (`1/σ`), concatenated over regions.
    pub fn weights(&self) -> &[f64] {
        &self.engine.weights
    }

    /// Whether the last `fit` produced a usable result.
    pub fn fit_successful(&self) -> bool {
        self.last_status.is_some_and(FitStatus::is_successful)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use levenberg_marquardt::differentiate_numerically;

    use crate::data::{transform, Acquisition, Dataset, InstrumentResponse, Region};
    use crate::domain::{IrfSettings, ModelConfig, TransformSettings};
    use crate::fit::weighting::initial_weights;
    use crate::models::MultiExponentialModel;

    const RATE: f64 = 0.5;

    fn model_with_irf(irf: InstrumentResponse) -> Arc<MultiExponentialModel> {
        let acq = Arc::new(Acquisition::new(1, 120, 0.0, 0.1).unwrap());
        let config = ModelConfig {
            n_exp: 1,
            ..ModelConfig::default()
        };
        Arc::new(MultiExponentialModel::new(config, acq, Arc::new(irf)).unwrap())
    }

    fn model() -> Arc<MultiExponentialModel> {
        let settings = IrfSettings {
            timebin_width: 0.1,
            ..IrfSettings::default()
        };
        model_with_irf(InstrumentResponse::gaussian(&settings, 1, 16, 0.5, 0.2).unwrap())
    }

    /// Regions with the given amplitudes at `rate`; `wobble` adds a fixed
    /// zero-mean pattern so the optimum has a nonzero residual.
    fn data_at(model: &MultiExponentialModel, rate: f64, amplitudes: &[f64], wobble: f64) -> Arc<TransformedData> {
        let mut scratch = model.new_scratch();
        let mut a = DMatrix::zeros(model.rows_per_region(), model.n_columns());
        model.evaluate(&[rate], 0, &mut scratch, &mut a, None);

        let mut dataset = Dataset::new(model.acquisition().as_ref().clone());
        for (r, &amp) in amplitudes.iter().enumerate() {
            let counts = a
                .column(0)
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    let pattern = ((i * 5 + r * 3) % 7) as f64 - 3.0;
                    (amp * v + wobble * pattern * (amp * v).sqrt()).max(0.0)
                })
                .collect();
            dataset
                .push_region(Region {
                    label: format!("R{r:04}"),
                    counts,
                    irf_idx: 0,
                })
                .unwrap();
        }
        Arc::new(transform(&dataset, &TransformSettings::default()).unwrap())
    }

    fn data(model: &MultiExponentialModel, amplitudes: &[f64], wobble: f64) -> Arc<TransformedData> {
        data_at(model, RATE, amplitudes, wobble)
    }

    fn session(
        data: &Arc<TransformedData>,
        model: &Arc<MultiExponentialModel>,
        config: FitterConfig,
    ) -> Result<VariableProjectionFitter> {
        VariableProjectionFitter::new(model.clone(), data.clone(), config, Arc::new(ProgressReporter::new()))
    }

    fn config(n_thread: usize, weighting: WeightingMode) -> FitterConfig {
        FitterConfig {
            n_thread,
            weighting,
            ..FitterConfig::default()
        }
    }

    #[test]
    fn recovers_lifetime_and_amplitudes_from_noise_free_data() {
        let model = model();
        let amplitudes = [1000.0, 400.0, 2500.0, 50.0];
        let data = data(&model, &amplitudes, 0.0);
        let mut fitter = session(&data, &model, config(2, WeightingMode::Uniform)).unwrap();

        let outcome = fitter.fit(&[1.0 / 1.2], 100).unwrap();
        assert_eq!(outcome.status, FitStatus::Converged, "{}", outcome.reason);
        assert!(fitter.fit_successful());
        assert!((outcome.parameters[0] - RATE).abs() < 1e-6 * RATE, "{:?}", outcome.parameters);
        assert_eq!(outcome.parameter_names, vec!["k1".to_string()]);

        let linear = fitter.linear_params(&outcome.parameters).unwrap();
        assert_eq!(linear.regions.len(), amplitudes.len());
        for (region, truth) in linear.regions.iter().zip(amplitudes) {
            assert!((region.amplitudes[0] - truth).abs() < 1e-5 * truth, "{}", region.label);
            assert!(region.offset.is_none());
            assert_eq!(region.observed.len(), region.fitted.len());
        }
        assert_eq!(linear.n_degenerate, 0);
    }

    #[test]
    fn delta_irf_single_exponential_is_recovered_exactly() {
        // Gamma weighting moves the optimum on noise-free counts (target y + 1
        // in the tail), so exact recovery is checked with uniform weights.
        let model = model_with_irf(InstrumentResponse::delta(1, 0.0, 1e-6).unwrap());
        let amplitudes = [1000.0, 3000.0];
        let data = data_at(&model, 0.4, &amplitudes, 0.0);
        let mut fitter = session(&data, &model, config(2, WeightingMode::Uniform)).unwrap();

        let outcome = fitter.fit(&[1.0], 50).unwrap();
        assert_eq!(outcome.status, FitStatus::Converged, "{}", outcome.reason);
        assert!(outcome.iterations <= 50);
        assert!((outcome.parameters[0] - 0.4).abs() < 1e-6 * 0.4, "{:?}", outcome.parameters);

        let linear = fitter.linear_params(&outcome.parameters).unwrap();
        for (region, truth) in linear.regions.iter().zip(amplitudes) {
            assert!((region.amplitudes[0] - truth).abs() < 1e-6 * truth, "{}", region.label);
        }
    }

    #[test]
    fn projected_jacobian_matches_numerical_differentiation() {
        let model = model();
        let data = data(&model, &[700.0, 1300.0], 1.0);
        let mut fitter = session(&data, &model, config(2, WeightingMode::Poisson)).unwrap();
        let mut ctx = PassContext {
            engine: RefCell::new(&mut fitter.engine),
            tracker: RefCell::new(Tracker::default()),
            params: DVector::from_element(1, 0.7),
            max_iterations: usize::MAX,
        };

        let analytic = ctx.analytic_jacobian().unwrap();
        let numerical = differentiate_numerically(&mut ctx).unwrap();
        assert_eq!(analytic.shape(), numerical.shape());
        let scale = analytic.amax();
        assert!(scale > 0.0);
        assert!((&analytic - &numerical).amax() < 1e-6 * scale);
    }

    #[test]
    fn numerical_derivatives_reach_the_same_optimum() {
        let model = model();
        let data = data(&model, &[800.0, 1500.0], 0.0);
        let config = FitterConfig {
            derivatives: DerivativeMode::Numerical,
            ..config(1, WeightingMode::Uniform)
        };
        let mut fitter = session(&data, &model, config).unwrap();
        let outcome = fitter.fit(&[1.0], 200).unwrap();
        assert!(outcome.status.is_successful(), "{}", outcome.reason);
        assert!((outcome.parameters[0] - RATE).abs() < 1e-5 * RATE);
    }

    #[test]
    fn repeated_sessions_are_bit_identical() {
        let model = model();
        let data = data(&model, &[900.0, 300.0, 1200.0, 700.0, 2000.0], 1.0);
        let run = || {
            let mut fitter = session(&data, &model, config(3, WeightingMode::Poisson)).unwrap();
            let outcome = fitter.fit(&[1.0], 100).unwrap();
            let linear = fitter.linear_params(&outcome.parameters).unwrap();
            (outcome, linear)
        };
        let (o1, l1) = run();
        let (o2, l2) = run();
        assert_eq!(o1.parameters[0].to_bits(), o2.parameters[0].to_bits());
        assert_eq!(o1.chi2.to_bits(), o2.chi2.to_bits());
        for (a, b) in l1.regions.iter().zip(&l2.regions) {
            assert_eq!(a.amplitudes[0].to_bits(), b.amplitudes[0].to_bits());
            assert_eq!(a.chi2.to_bits(), b.chi2.to_bits());
        }
    }

    #[test]
    fn thread_count_does_not_change_the_optimum() {
        let model = model();
        let amplitudes: Vec<f64> = (0..9).map(|i| 300.0 + 150.0 * i as f64).collect();
        let data = data(&model, &amplitudes, 1.0);

        let mut single = session(&data, &model, config(1, WeightingMode::Poisson)).unwrap();
        let mut multi = session(&data, &model, config(4, WeightingMode::Poisson)).unwrap();
        assert_eq!(single.n_groups(), 1);
        assert_eq!(multi.n_groups(), 4);

        let a = single.fit(&[1.0], 100).unwrap();
        let b = multi.fit(&[1.0], 100).unwrap();
        assert!((a.parameters[0] - b.parameters[0]).abs() < 1e-6 * a.parameters[0]);
        assert!((a.chi2 - b.chi2).abs() < 1e-8 * a.chi2);
    }

    #[test]
    fn iterative_weights_follow_the_model_until_frozen() {
        let model = model();
        let data = data(&model, &[600.0, 1800.0, 1100.0], 1.0);
        let mut fitter = session(&data, &model, config(2, WeightingMode::Iterative)).unwrap();

        let counts: Vec<f64> = data.regions().iter().flat_map(|r| r.counts.iter().copied()).collect();
        let mut targets = vec![0.0; counts.len()];
        let mut initial = vec![0.0; counts.len()];
        initial_weights(WeightingMode::Iterative, &counts, &mut targets, &mut initial);

        let first = fitter.fit(&[1.0 / 0.8], 100).unwrap();
        assert_eq!(first.status, FitStatus::Converged, "{}", first.reason);
        assert!(first.iterations > 1);
        assert_ne!(fitter.weights(), initial.as_slice());
        assert!(fitter.weights().iter().all(|w| *w > 0.0 && *w <= 1.0));

        // Weights implied by the converged curve must reproduce the solution.
        fitter.freeze_weights_at(&first.parameters).unwrap();
        let frozen = fitter.weights().to_vec();
        let second = fitter.fit(&first.parameters, 100).unwrap();
        assert!(second.status.is_successful(), "{}", second.reason);
        assert_eq!(fitter.weights(), frozen.as_slice());
        let k = first.parameters[0];
        assert!((second.parameters[0] - k).abs() < 1e-6 * k, "{} vs {k}", second.parameters[0]);
    }

    #[test]
    fn freezing_checks_the_parameter_count() {
        let model = model();
        let data = data(&model, &[600.0], 0.0);
        let mut fitter = session(&data, &model, config(1, WeightingMode::Iterative)).unwrap();
        assert!(matches!(fitter.freeze_weights_at(&[0.5, 1.0]), Err(FitError::Configuration(_))));
    }

    #[test]
    fn empty_region_is_degenerate_but_fit_succeeds() {
        let model = model();
        let data = data(&model, &[800.0, 0.0, 1200.0], 0.0);
        let mut fitter = session(&data, &model, config(2, WeightingMode::Poisson)).unwrap();

        let outcome = fitter.fit(&[1.0], 100).unwrap();
        assert!(fitter.fit_successful(), "{}", outcome.reason);

        let linear = fitter.linear_params(&outcome.parameters).unwrap();
        assert_eq!(linear.n_degenerate, 1);
        let empty = &linear.regions[1];
        assert_eq!(empty.status, NnlsStatus::Degenerate);
        assert_eq!(empty.amplitudes, vec![0.0]);
        assert!(empty.fitted.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn invalid_sessions_are_rejected() {
        let model = model();
        let data = data(&model, &[500.0], 0.0);

        let err = session(&data, &model, config(0, WeightingMode::Uniform)).err().unwrap();
        assert!(matches!(err, FitError::Configuration(_)));

        let small = FitterConfig {
            max_region_size: 10,
            ..config(1, WeightingMode::Uniform)
        };
        let err = session(&data, &model, small).err().unwrap();
        assert!(matches!(err, FitError::Configuration(_)));

        let mut fitter = session(&data, &model, config(1, WeightingMode::Uniform)).unwrap();
        assert!(matches!(fitter.fit(&[1.0, 2.0], 10), Err(FitError::Configuration(_))));
        assert!(matches!(fitter.fit(&[f64::NAN], 10), Err(FitError::Configuration(_))));
        assert!(matches!(fitter.linear_params(&[]), Err(FitError::Configuration(_))));
    }

    #[test]
    fn cancelled_session_reports_cancelled() {
        let model = model();
        let data = data(&model, &[500.0, 700.0], 0.0);
        let reporter = Arc::new(ProgressReporter::new());
        let mut fitter = VariableProjectionFitter::new(
            model.clone(),
            data,
            config(2, WeightingMode::Uniform),
            reporter.clone(),
        )
        .unwrap();

        reporter.cancel();
        let outcome = fitter.fit(&[1.0], 50).unwrap();
        assert_eq!(outcome.status, FitStatus::Cancelled);
        assert!(!fitter.fit_successful());
        assert_eq!(outcome.iterations, 0);
    }
}
