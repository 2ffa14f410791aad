//! One-shot Poisson-model solver for area weights.
//!
//! Instead of iterating on a proportion matrix, this route fits a log-linear
//! model: unit `i`'s weight in area `j` is `exp(β_j·x_i + δ_i)`, where the
//! per-unit constant `δ_i` is chosen analytically so that every unit's area
//! weights sum to its national weight for *any* coefficient matrix. That
//! leaves a free-standing nonlinear least-squares problem in β alone: make
//! the implied area totals match the targets. The trust-region solve is
//! delegated to `levenberg_marquardt` with a forward-difference Jacobian.

use std::time::{Duration, Instant};

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, MinimizationReport};
use log::warn;
use nalgebra::storage::Owned;
use nalgebra::{DMatrix, DVector, Dyn};
use serde::{Deserialize, Serialize};

use crate::data::GeoProblem;
use crate::error::Result;

/// Residual weight applied to zero-valued targets: large enough to punish any
/// implied mass against them without dividing by zero.
const ZERO_TARGET_WEIGHT: f64 = 1e6;

/// Saturation bound for residual entries; overflowed exponentials are routed
/// around rather than treated as fatal.
const RESIDUAL_CAP: f64 = 1e12;

/// Configuration for the least-squares fit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoissonOptions {
    /// Relative reduction tolerance on the sum of squares.
    pub ftol: f64,
    /// Relative change tolerance on the coefficient vector.
    pub xtol: f64,
    /// Forward-difference step scale for the numeric Jacobian.
    pub step: f64,
}

impl Default for PoissonOptions {
    fn default() -> Self {
        Self {
            ftol: 1e-10,
            xtol: 1e-10,
            step: 1e-8,
        }
    }
}

/// Output of the Poisson-model solve.
#[derive(Debug)]
pub struct PoissonResult {
    /// Wall-clock time spent in the solve.
    pub elapsed: Duration,
    /// Fitted unit×area weights (rows sum to the national weights).
    pub weights: DMatrix<f64>,
    /// Area totals implied by the fitted weights.
    pub achieved_targets: DMatrix<f64>,
    /// Fitted coefficients, one row per area.
    pub beta: DMatrix<f64>,
    /// Per-unit normalizing constants implied by the fitted coefficients.
    pub delta: DVector<f64>,
    /// The optimizer's own termination report, surfaced verbatim.
    pub report: MinimizationReport<f64>,
}

struct PoissonModel<'a> {
    problem: &'a GeoProblem,
    diff_weights: DMatrix<f64>,
    beta: DVector<f64>,
    step: f64,
}

impl PoissonModel<'_> {
    fn beta_matrix(flat: &DVector<f64>, areas: usize, characteristics: usize) -> DMatrix<f64> {
        DMatrix::from_fn(areas, characteristics, |j, m| flat[j * characteristics + m])
    }

    /// Implied weights and constants for a flattened coefficient vector.
    ///
    /// Row `i` of the weight matrix is `wh[i]` times the softmax of the
    /// scores `β_j·x_i`, so row sums equal the national weights by
    /// construction; the max-score shift keeps the exponentials bounded.
    fn weights_for(&self, flat: &DVector<f64>) -> (DMatrix<f64>, DVector<f64>) {
        let n = self.problem.unit_count();
        let d = self.problem.area_count();
        let k = self.problem.characteristic_count();
        let beta = Self::beta_matrix(flat, d, k);
        let scores = self.problem.xmat() * beta.transpose();

        let mut weights = DMatrix::zeros(n, d);
        let mut delta = DVector::zeros(n);
        for i in 0..n {
            let shift = scores.row(i).max();
            let mut denom = 0.0;
            for j in 0..d {
                denom += (scores[(i, j)] - shift).exp();
            }
            let wi = self.problem.wh()[i];
            delta[i] = wi.ln() - (shift + denom.ln());
            for j in 0..d {
                weights[(i, j)] = wi * (scores[(i, j)] - shift).exp() / denom;
            }
        }
        (weights, delta)
    }

    fn residuals_for(&self, flat: &DVector<f64>) -> DVector<f64> {
        let d = self.problem.area_count();
        let k = self.problem.characteristic_count();
        let (weights, _) = self.weights_for(flat);
        let achieved = self.problem.implied_targets(&weights);

        let mut residuals = DVector::zeros(d * k);
        for j in 0..d {
            for m in 0..k {
                let gap = achieved[(j, m)] - self.problem.geotargets()[(j, m)];
                residuals[j * k + m] = saturate(gap * self.diff_weights[(j, m)]);
            }
        }
        residuals
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for PoissonModel<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, flat: &DVector<f64>) {
        self.beta.copy_from(flat);
    }

    fn params(&self) -> DVector<f64> {
        self.beta.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.residuals_for(&self.beta))
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let parameters = self.beta.len();
        let base = self.residuals_for(&self.beta);
        let mut jacobian = DMatrix::zeros(base.len(), parameters);
        for column in 0..parameters {
            let h = self.step * self.beta[column].abs().max(1.0);
            let mut shifted = self.beta.clone();
            shifted[column] += h;
            let perturbed = self.residuals_for(&shifted);
            jacobian.set_column(column, &((perturbed - &base) / h));
        }
        Some(jacobian)
    }
}

fn saturate(value: f64) -> f64 {
    if value.is_nan() {
        RESIDUAL_CAP
    } else {
        value.clamp(-RESIDUAL_CAP, RESIDUAL_CAP)
    }
}

/// Residual weights: reciprocal targets, with a sentinel where a target is zero.
fn diff_weights(geotargets: &DMatrix<f64>) -> DMatrix<f64> {
    geotargets.map(|target| {
        if target != 0.0 {
            1.0 / target
        } else {
            ZERO_TARGET_WEIGHT
        }
    })
}

/// Fits the log-linear model and derives the full weight matrix from it.
///
/// The fit starts at β = 0 (uniform splitting) and runs to the optimizer's
/// own convergence; whatever coefficients it terminates with are used, and
/// its termination report is passed through for the caller to judge.
pub fn solve(problem: &GeoProblem, options: &PoissonOptions) -> Result<PoissonResult> {
    let start = Instant::now();
    let d = problem.area_count();
    let k = problem.characteristic_count();

    let model = PoissonModel {
        problem,
        diff_weights: diff_weights(problem.geotargets()),
        beta: DVector::zeros(d * k),
        step: options.step,
    };

    let (model, report) = LevenbergMarquardt::new()
        .with_ftol(options.ftol)
        .with_xtol(options.xtol)
        .minimize(model);
    if !report.termination.was_successful() {
        warn!(
            "least-squares fit stopped without convergence: {:?}",
            report.termination
        );
    }

    let (weights, delta) = model.weights_for(&model.beta);
    let achieved = problem.implied_targets(&weights);
    let beta = PoissonModel::beta_matrix(&model.beta, d, k);

    Ok(PoissonResult {
        elapsed: start.elapsed(),
        weights,
        achieved_targets: achieved,
        beta,
        delta,
        report,
    })
}

impl GeoProblem {
    /// Convenience wrapper for [`solve`](crate::poisson::solve).
    pub fn solve_poisson(&self, options: &PoissonOptions) -> Result<PoissonResult> {
        solve(self, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn count_problem() -> GeoProblem {
        let wh = DVector::from_vec(vec![10.0, 20.0, 30.0]);
        let xmat = DMatrix::from_element(3, 1, 1.0);
        let geotargets = DMatrix::from_row_slice(2, 1, &[25.0, 35.0]);
        GeoProblem::new(wh, xmat, geotargets).expect("valid problem")
    }

    #[test]
    fn row_sums_hold_for_any_coefficients() {
        let problem = count_problem();
        let model = PoissonModel {
            problem: &problem,
            diff_weights: diff_weights(problem.geotargets()),
            beta: DVector::zeros(2),
            step: 1e-8,
        };
        let flat = DVector::from_vec(vec![3.5, -40.0]);
        let (weights, delta) = model.weights_for(&flat);
        for i in 0..3 {
            assert_relative_eq!(weights.row(i).sum(), problem.wh()[i], epsilon = 1e-9);
            assert!(delta[i].is_finite());
        }
    }

    #[test]
    fn zero_targets_get_the_sentinel_weight() {
        let geotargets = DMatrix::from_row_slice(2, 2, &[25.0, 0.0, 35.0, 4.0]);
        let weights = diff_weights(&geotargets);
        assert_relative_eq!(weights[(0, 0)], 1.0 / 25.0, epsilon = 1e-12);
        assert_relative_eq!(weights[(0, 1)], ZERO_TARGET_WEIGHT, epsilon = 1e-12);
        assert_relative_eq!(weights[(1, 1)], 0.25, epsilon = 1e-12);
    }

    #[test]
    fn jacobian_is_finite_at_the_starting_point() {
        let problem = count_problem();
        let model = PoissonModel {
            problem: &problem,
            diff_weights: diff_weights(problem.geotargets()),
            beta: DVector::zeros(2),
            step: 1e-8,
        };
        let jacobian = model.jacobian().expect("jacobian");
        assert_eq!(jacobian.nrows(), 2);
        assert_eq!(jacobian.ncols(), 2);
        assert!(jacobian.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn saturate_caps_overflow_and_nan() {
        assert_relative_eq!(saturate(1.0), 1.0, epsilon = 1e-12);
        assert_relative_eq!(saturate(f64::INFINITY), RESIDUAL_CAP, epsilon = 1e-12);
        assert_relative_eq!(saturate(f64::NEG_INFINITY), -RESIDUAL_CAP, epsilon = 1e-12);
        assert_relative_eq!(saturate(f64::NAN), RESIDUAL_CAP, epsilon = 1e-12);
    }

    #[test]
    fn count_split_matches_column_targets() {
        let problem = count_problem();
        let result = solve(&problem, &PoissonOptions::default()).expect("solved");

        for i in 0..3 {
            assert_relative_eq!(
                result.weights.row(i).sum(),
                problem.wh()[i],
                epsilon = 1e-9
            );
        }
        assert_relative_eq!(result.achieved_targets[(0, 0)], 25.0, epsilon = 1e-2);
        assert_relative_eq!(result.achieved_targets[(1, 0)], 35.0, epsilon = 1e-2);
        assert!(result.beta.iter().all(|v| v.is_finite()));
        assert!(result.delta.iter().all(|v| v.is_finite()));
    }
}
