//! Per-area calibration primitives: the calib-style raking fixed point and
//! distance-based calibration of weighted means.
//!
//! Both primitives answer the same question for one area: given covariates,
//! baseline weights, and target totals, find a ratio vector `g` such that the
//! reweighted totals `Σ dᵢ·gᵢ·xᵢ` match the targets. The outer iterator treats
//! them interchangeably through [`AreaCalibrator`].

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Floor substituted for zero divisors when converting totals to means or
/// relative differences.
pub(crate) const SMALL_DIVISOR: f64 = 1e-12;

/// Guard against exact-zero baseline weights blowing up the ratio step.
const RATIO_EPS: f64 = 1e-15;

/// Threshold below which the pseudo-inverse treats singular values as zero.
const PINV_EPS: f64 = 1e-15;

/// Distance objective for [`DistanceCalibrator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Objective {
    /// Kullback-Leibler distance from the baseline; ratios stay positive.
    Entropy,
    /// Chi-squared distance from the baseline; ratios may reach zero or below.
    Quadratic,
}

/// Common contract for the per-area inner solvers.
///
/// Returns the ratio vector on success, or `None` when the primitive failed
/// to converge or produced unusable values. Implementations must be `Sync`;
/// the outer iterator calibrates areas in parallel.
pub trait AreaCalibrator: Sync {
    /// Calibrates one area: find `g` with `Σ dᵢ·gᵢ·xᵢ ≈ targets`.
    fn calibrate_one_area(
        &self,
        covariates: &DMatrix<f64>,
        baseline: &DVector<f64>,
        targets: &DVector<f64>,
    ) -> Option<DVector<f64>>;
}

/// Newton-Raphson raking on total constraints, the `calib` algorithm.
///
/// This is the self-contained primitive: it iterates on the Lagrange
/// multipliers of the entropy distance directly, without a normalization
/// constraint, and matches target *totals*.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RakingCalibrator {
    /// Hard cap on multiplier updates.
    pub max_iterations: usize,
    /// Largest acceptable relative error of any implied total.
    pub tolerance: f64,
}

impl Default for RakingCalibrator {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            tolerance: 1e-8,
        }
    }
}

impl AreaCalibrator for RakingCalibrator {
    fn calibrate_one_area(
        &self,
        covariates: &DMatrix<f64>,
        baseline: &DVector<f64>,
        targets: &DVector<f64>,
    ) -> Option<DVector<f64>> {
        lagrange_ratios(
            covariates,
            baseline,
            targets,
            self.max_iterations,
            self.tolerance,
        )
    }
}

/// Mean-space calibration against a chosen distance objective.
///
/// Converts the area's target totals to per-capita means by dividing by the
/// baseline-weight total, then solves the mean-matching problem with an
/// explicit normalization constraint (a unit column in the design). The
/// entropy objective reuses the same Newton fixed point as
/// [`RakingCalibrator`]; the quadratic objective is the one-shot
/// Deville-Särndal linear solve.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DistanceCalibrator {
    /// Distance kept small between baseline and calibrated weights.
    pub objective: Objective,
    /// Hard cap on Newton updates (entropy objective only).
    pub max_iterations: usize,
    /// Largest acceptable relative error of any implied mean.
    pub tolerance: f64,
}

impl DistanceCalibrator {
    /// Creates a calibrator for `objective` with default controls.
    pub fn new(objective: Objective) -> Self {
        Self {
            objective,
            max_iterations: 10,
            tolerance: 1e-8,
        }
    }
}

impl Default for DistanceCalibrator {
    fn default() -> Self {
        Self::new(Objective::Entropy)
    }
}

impl AreaCalibrator for DistanceCalibrator {
    fn calibrate_one_area(
        &self,
        covariates: &DMatrix<f64>,
        baseline: &DVector<f64>,
        targets: &DVector<f64>,
    ) -> Option<DVector<f64>> {
        let n = covariates.nrows();
        let k = covariates.ncols();

        let floored = baseline.map(|v| if v > 0.0 { v } else { RATIO_EPS });
        let pop = floored.sum().max(SMALL_DIVISOR);
        let dnorm = floored / pop;

        // Augmented design: the unit column pins the probability mass to one,
        // the remaining columns pin the weighted means.
        let mut design = DMatrix::from_element(n, k + 1, 1.0);
        for i in 0..n {
            for m in 0..k {
                design[(i, m + 1)] = covariates[(i, m)];
            }
        }
        let mut goals = DVector::zeros(k + 1);
        goals[0] = 1.0;
        for m in 0..k {
            goals[m + 1] = targets[m] / pop;
        }

        let ratios = match self.objective {
            Objective::Entropy => lagrange_ratios(
                &design,
                &dnorm,
                &goals,
                self.max_iterations,
                self.tolerance,
            )?,
            Objective::Quadratic => linear_ratios(&design, &dnorm, &goals)?,
        };

        let achieved = design.transpose() * dnorm.component_mul(&ratios);
        debug!(
            "distance calibration fit norm {:.3e} over {} constraints",
            (achieved - goals).norm(),
            k + 1
        );
        Some(ratios)
    }
}

/// Shared Newton fixed point: find `g = w1/d` with `Σ dᵢ·gᵢ·xᵢ ≈ total`.
///
/// Multipliers update through the Moore-Penrose pseudo-inverse so
/// rank-deficient covariates shrink the step instead of exploding it.
pub(crate) fn lagrange_ratios(
    covariates: &DMatrix<f64>,
    baseline: &DVector<f64>,
    total: &DVector<f64>,
    max_iterations: usize,
    tolerance: f64,
) -> Option<DVector<f64>> {
    let n = covariates.nrows();
    let k = covariates.ncols();

    let d = baseline.map(|v| if v == 0.0 { RATIO_EPS } else { v });
    let mut lam = DVector::<f64>::zeros(k);
    let mut w1 = d.clone();

    for _ in 0..max_iterations {
        let phi = covariates.transpose() * &w1 - total;
        let mut weighted = covariates.clone();
        for i in 0..n {
            let wi = w1[i];
            weighted.row_mut(i).scale_mut(wi);
        }
        let curvature = weighted.transpose() * covariates;
        let pinv = match curvature.pseudo_inverse(PINV_EPS) {
            Ok(p) => p,
            Err(_) => {
                warn!("raking curvature pseudo-inverse failed; discarding result");
                return None;
            }
        };
        lam -= pinv * phi;

        let scores = covariates * &lam;
        for i in 0..n {
            w1[i] = d[i] * scores[i].exp();
        }
        if w1.iter().any(|v| !v.is_finite()) {
            warn!("raking produced non-finite ratios; discarding result");
            return None;
        }

        let achieved = covariates.transpose() * &w1;
        let mut worst = 0.0f64;
        for m in 0..k {
            let denom = total[m].abs().max(SMALL_DIVISOR);
            worst = worst.max((achieved[m] - total[m]).abs() / denom);
        }
        if worst < tolerance {
            return Some(w1.component_div(&d));
        }
    }

    warn!("raking did not converge within {max_iterations} iterations");
    None
}

/// One-shot chi-squared calibration: `g = 1 + A·λ` with
/// `(Aᵀ·diag(d)·A)·λ = b − Aᵀ·d`.
fn linear_ratios(
    design: &DMatrix<f64>,
    baseline: &DVector<f64>,
    goals: &DVector<f64>,
) -> Option<DVector<f64>> {
    let n = design.nrows();

    let mut weighted = design.clone();
    for i in 0..n {
        let di = baseline[i];
        weighted.row_mut(i).scale_mut(di);
    }
    let system = design.transpose() * &weighted;
    let shortfall = goals - design.transpose() * baseline;

    let pinv = match system.pseudo_inverse(PINV_EPS) {
        Ok(p) => p,
        Err(_) => {
            warn!("quadratic calibration pseudo-inverse failed; discarding result");
            return None;
        }
    };
    let lam = pinv * shortfall;

    let ratios = DVector::from_element(n, 1.0) + design * lam;
    if ratios.iter().any(|v| !v.is_finite()) {
        warn!("quadratic calibration produced non-finite ratios; discarding result");
        return None;
    }
    Some(ratios)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn raking_hits_a_reachable_total() {
        let covariates = DMatrix::from_row_slice(3, 1, &[10.0, 20.0, 30.0]);
        let baseline = DVector::from_element(3, 0.5);
        let targets = DVector::from_vec(vec![25.0]);

        let ratios = RakingCalibrator::default()
            .calibrate_one_area(&covariates, &baseline, &targets)
            .expect("converged");

        let mut achieved = 0.0;
        for i in 0..3 {
            achieved += baseline[i] * ratios[i] * covariates[(i, 0)];
        }
        assert_relative_eq!(achieved, 25.0, epsilon = 1e-6);
        assert!(ratios.iter().all(|g| *g > 0.0));
    }

    #[test]
    fn raking_gives_up_on_an_unreachable_total() {
        // A zero covariate column can never produce a nonzero total.
        let covariates = DMatrix::zeros(3, 1);
        let baseline = DVector::from_element(3, 1.0);
        let targets = DVector::from_vec(vec![5.0]);

        let result = RakingCalibrator::default().calibrate_one_area(
            &covariates,
            &baseline,
            &targets,
        );
        assert!(result.is_none());
    }

    #[test]
    fn entropy_calibration_matches_totals_and_mass() {
        let covariates = DMatrix::from_row_slice(4, 1, &[1.0, 2.0, 3.0, 4.0]);
        let baseline = DVector::from_element(4, 1.0);
        let targets = DVector::from_vec(vec![12.0]);

        let ratios = DistanceCalibrator::new(Objective::Entropy)
            .calibrate_one_area(&covariates, &baseline, &targets)
            .expect("converged");

        let mut total = 0.0;
        let mut mass = 0.0;
        for i in 0..4 {
            total += baseline[i] * ratios[i] * covariates[(i, 0)];
            mass += baseline[i] * ratios[i];
        }
        assert_relative_eq!(total, 12.0, epsilon = 1e-6);
        assert_relative_eq!(mass, 4.0, epsilon = 1e-6);
        assert!(ratios.iter().all(|g| *g > 0.0));
    }

    #[test]
    fn quadratic_calibration_matches_totals_and_mass() {
        let covariates = DMatrix::from_row_slice(4, 1, &[1.0, 2.0, 3.0, 4.0]);
        let baseline = DVector::from_element(4, 1.0);
        let targets = DVector::from_vec(vec![12.0]);

        let ratios = DistanceCalibrator::new(Objective::Quadratic)
            .calibrate_one_area(&covariates, &baseline, &targets)
            .expect("solved");

        let mut total = 0.0;
        let mut mass = 0.0;
        for i in 0..4 {
            total += baseline[i] * ratios[i] * covariates[(i, 0)];
            mass += baseline[i] * ratios[i];
        }
        assert_relative_eq!(total, 12.0, epsilon = 1e-8);
        assert_relative_eq!(mass, 4.0, epsilon = 1e-8);
    }

    #[test]
    fn zero_baseline_weights_do_not_poison_the_ratios() {
        let covariates = DMatrix::from_row_slice(3, 1, &[10.0, 20.0, 30.0]);
        let baseline = DVector::from_vec(vec![0.0, 0.5, 0.5]);
        let targets = DVector::from_vec(vec![24.0]);

        let ratios = RakingCalibrator::default()
            .calibrate_one_area(&covariates, &baseline, &targets)
            .expect("converged");
        assert!(ratios.iter().all(|g| g.is_finite()));
    }
}
