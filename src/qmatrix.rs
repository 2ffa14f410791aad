//! Iterative area-weight splitting: the proportion-matrix engine.
//!
//! The solver owns an N×D proportion matrix `Q` in which `Q[i,j]` is the
//! fraction of unit `i`'s national weight allocated to area `j`. Each
//! iteration calibrates every area's column against that area's targets,
//! renormalizes rows so every unit's allocation still partitions its national
//! weight, and tracks the best iterate seen so far. The per-area updates only
//! read the previous `Q` snapshot, so they run in parallel; renormalization
//! waits for all of them.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::calibrate::{
    AreaCalibrator, DistanceCalibrator, Objective, RakingCalibrator, SMALL_DIVISOR,
};
use crate::data::{GeoProblem, InitialProportions};
use crate::error::{GeoError, Result};

/// Maps an area index to the target columns ignored for that area.
pub type DropSpec = BTreeMap<usize, Vec<usize>>;

/// Builds the D×k exclusion mask from a drop specification.
///
/// Entries are `true` where a target is dropped; the default is nothing
/// dropped. Out-of-range areas or columns are rejected up front.
pub fn build_drop_mask(
    areas: usize,
    characteristics: usize,
    drops: Option<&DropSpec>,
) -> Result<DMatrix<bool>> {
    let mut mask = DMatrix::from_element(areas, characteristics, false);
    if let Some(spec) = drops {
        for (&area, columns) in spec {
            if area >= areas {
                return Err(GeoError::DropAreaOutOfRange { area, areas });
            }
            for &column in columns {
                if column >= characteristics {
                    return Err(GeoError::DropColumnOutOfRange {
                        area,
                        column,
                        columns: characteristics,
                    });
                }
                mask[(area, column)] = true;
            }
        }
    }
    Ok(mask)
}

/// Inner-solver selection for the iterator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Method {
    /// Calib-style raking on target totals, self-contained.
    Raking(RakingCalibrator),
    /// Distance calibration of weighted means (entropy or quadratic).
    DistanceCalibration(DistanceCalibrator),
}

impl Method {
    /// Raking with default controls.
    pub fn raking() -> Self {
        Self::Raking(RakingCalibrator::default())
    }

    /// Distance calibration with default controls for `objective`.
    pub fn distance(objective: Objective) -> Self {
        Self::DistanceCalibration(DistanceCalibrator::new(objective))
    }

    fn calibrator(&self) -> &dyn AreaCalibrator {
        match self {
            Self::Raking(inner) => inner,
            Self::DistanceCalibration(inner) => inner,
        }
    }
}

impl Default for Method {
    fn default() -> Self {
        Self::raking()
    }
}

/// Configuration for [`solve`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QMatrixOptions {
    /// Per-area inner solver.
    pub method: Method,
    /// Cap on outer iterations.
    pub max_iterations: usize,
    /// Relative target tolerance; `5e-4` means every used target must sit
    /// within 0.05% of its desired value.
    pub tolerance: f64,
    /// Starting proportion matrix.
    pub initial: InitialProportions,
    /// Targets to ignore per area, if any.
    pub drops: Option<DropSpec>,
}

impl Default for QMatrixOptions {
    fn default() -> Self {
        Self {
            method: Method::default(),
            max_iterations: 20,
            tolerance: 5e-4,
            initial: InitialProportions::Uniform,
            drops: None,
        }
    }
}

impl QMatrixOptions {
    /// Overrides the inner solver while keeping other defaults.
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Sets the cap on outer iterations.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Sets the relative target tolerance.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Sets the starting proportion matrix.
    pub fn with_initial(mut self, initial: InitialProportions) -> Self {
        self.initial = initial;
        self
    }

    /// Sets the targets to ignore per area.
    pub fn with_drops(mut self, drops: DropSpec) -> Self {
        self.drops = Some(drops);
        self
    }
}

/// Diagnostics recorded after each completed iteration.
#[derive(Clone, Debug, Serialize)]
pub struct IterationRecord {
    /// One-based iteration index.
    pub iteration: usize,
    /// Largest `|row sum − 1|` across units before renormalization.
    pub max_weight_gap: f64,
    /// Largest absolute percent difference across used targets.
    pub max_abs_pct_diff: f64,
    /// 95th percentile of absolute percent differences across used targets.
    pub p95_abs_pct_diff: f64,
    /// Areas whose inner solve failed this iteration (identity ratios applied).
    pub fallback_areas: Vec<usize>,
}

/// Best-seen output of the iterative solver.
#[derive(Clone, Debug)]
pub struct QMatrixResult {
    /// Wall-clock time spent in the solve.
    pub elapsed: Duration,
    /// Best-seen proportion matrix (rows sum to one).
    pub proportions: DMatrix<f64>,
    /// Best-seen unit×area weights (rows sum to the national weights).
    pub weights: DMatrix<f64>,
    /// Area totals implied by the best-seen weights.
    pub achieved_targets: DMatrix<f64>,
    /// Percent differences `(achieved − desired)/desired × 100` at the best.
    pub pct_diff: DMatrix<f64>,
    /// Iteration at which the best was recorded (0 = starting state).
    pub best_iteration: usize,
    /// Whether the tolerance was met before the iteration cap.
    pub converged: bool,
    /// Per-iteration diagnostics, in order.
    pub iterations: Vec<IterationRecord>,
}

struct Snapshot {
    q: DMatrix<f64>,
    whs: DMatrix<f64>,
    achieved: DMatrix<f64>,
    pct: DMatrix<f64>,
    iteration: usize,
    score: f64,
}

/// Splits national weights across areas until targets are met or the
/// iteration cap is reached.
///
/// Never fails on numerically degenerate iterations: an area whose inner
/// solve does not converge keeps its column for that round, and the returned
/// bundle is always the best-seen snapshot.
pub fn solve(problem: &GeoProblem, options: &QMatrixOptions) -> Result<QMatrixResult> {
    let start = Instant::now();
    let n = problem.unit_count();
    let d = problem.area_count();
    let k = problem.characteristic_count();

    let dropped = build_drop_mask(d, k, options.drops.as_ref())?;
    let used_columns: Vec<Vec<usize>> = (0..d)
        .map(|j| (0..k).filter(|&m| !dropped[(j, m)]).collect())
        .collect();

    let mut q = options.initial.materialize(problem)?;

    // The weighted design is constant across iterations; calib would have
    // rebuilt it per call.
    let mut xmat_wh = problem.xmat().clone();
    for i in 0..n {
        let wi = problem.wh()[i];
        xmat_wh.row_mut(i).scale_mut(wi);
    }

    let whs = problem.weight_matrix(&q);
    let achieved = problem.implied_targets(&whs);
    let pct = percent_diff(&achieved, problem.geotargets());
    let mut best = Snapshot {
        q: q.clone(),
        whs,
        achieved,
        pct,
        iteration: 0,
        score: f64::INFINITY,
    };

    let calibrator = options.method.calibrator();
    let mut records = Vec::with_capacity(options.max_iterations);
    let mut converged = false;

    for iteration in 1..=options.max_iterations {
        let updates: Vec<Option<DVector<f64>>> = (0..d)
            .into_par_iter()
            .map(|j| {
                let columns = &used_columns[j];
                if columns.is_empty() {
                    return None;
                }
                let covariates = select_columns(&xmat_wh, columns);
                let baseline = q.column(j).into_owned();
                let targets = DVector::from_iterator(
                    columns.len(),
                    columns.iter().map(|&m| problem.geotargets()[(j, m)]),
                );
                let ratios = calibrator.calibrate_one_area(&covariates, &baseline, &targets)?;
                if ratios.iter().any(|g| !g.is_finite() || *g <= 0.0) {
                    return None;
                }
                Some(ratios)
            })
            .collect();

        let mut fallback_areas = Vec::new();
        for (j, update) in updates.iter().enumerate() {
            match update {
                Some(ratios) => {
                    for i in 0..n {
                        q[(i, j)] *= ratios[i];
                    }
                }
                None => fallback_areas.push(j),
            }
        }
        if !fallback_areas.is_empty() {
            warn!(
                "iteration {iteration}: identity-ratio fallback for areas {:?}",
                fallback_areas
            );
        }

        // Weight-sum deviation is measured before the rows are recalibrated.
        let mut max_weight_gap = 0.0f64;
        for i in 0..n {
            let sum = q.row(i).sum();
            max_weight_gap = max_weight_gap.max((sum - 1.0).abs());
        }
        for i in 0..n {
            let sum = q.row(i).sum();
            if sum.is_finite() && sum > 0.0 {
                q.row_mut(i).unscale_mut(sum);
            }
        }

        let whs = problem.weight_matrix(&q);
        let achieved = problem.implied_targets(&whs);
        let pct = percent_diff(&achieved, problem.geotargets());

        let mut used_values: Vec<f64> = Vec::with_capacity(d * k);
        for j in 0..d {
            for m in 0..k {
                if !dropped[(j, m)] {
                    used_values.push(pct[(j, m)].abs());
                }
            }
        }
        let max_abs = used_values.iter().cloned().fold(0.0f64, f64::max);
        let p95 = percentile(&mut used_values, 0.95);

        debug!(
            "iteration {iteration}: weight gap {max_weight_gap:.6}, \
             max target diff {max_abs:.4}%, p95 {p95:.4}%"
        );
        records.push(IterationRecord {
            iteration,
            max_weight_gap,
            max_abs_pct_diff: max_abs,
            p95_abs_pct_diff: p95,
            fallback_areas,
        });

        if max_abs < best.score {
            best = Snapshot {
                q: q.clone(),
                whs,
                achieved,
                pct,
                iteration,
                score: max_abs,
            };
        }
        if max_abs <= options.tolerance * 100.0 {
            converged = true;
            break;
        }
    }

    if !converged {
        warn!(
            "iteration cap {} reached without meeting tolerance; returning best iterate {}",
            options.max_iterations, best.iteration
        );
    }

    Ok(QMatrixResult {
        elapsed: start.elapsed(),
        proportions: best.q,
        weights: best.whs,
        achieved_targets: best.achieved,
        pct_diff: best.pct,
        best_iteration: best.iteration,
        converged,
        iterations: records,
    })
}

impl GeoProblem {
    /// Convenience wrapper for [`solve`](crate::qmatrix::solve).
    pub fn solve_qmatrix(&self, options: &QMatrixOptions) -> Result<QMatrixResult> {
        solve(self, options)
    }
}

/// Percent differences with zero targets floored to keep every cell finite.
fn percent_diff(achieved: &DMatrix<f64>, desired: &DMatrix<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(desired.nrows(), desired.ncols(), |j, m| {
        let target = desired[(j, m)];
        let denom = target.abs().max(SMALL_DIVISOR);
        (achieved[(j, m)] - target) / denom * 100.0
    })
}

fn select_columns(matrix: &DMatrix<f64>, columns: &[usize]) -> DMatrix<f64> {
    let mut selected = DMatrix::zeros(matrix.nrows(), columns.len());
    for (slot, &column) in columns.iter().enumerate() {
        selected.column_mut(slot).copy_from(&matrix.column(column));
    }
    selected
}

/// Linearly interpolated percentile over the (sorted in place) values.
fn percentile(values: &mut Vec<f64>, quantile: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = quantile * (values.len() - 1) as f64;
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    values[low] + (values[high] - values[low]) * (rank - low as f64)
}
