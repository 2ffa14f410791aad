//! Problem containers and validation utilities shared by both solvers.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{GeoError, Result};

/// A national sample together with the area targets it should be split against.
///
/// Holds the national weight vector `wh` (length N), the unit characteristic
/// matrix `xmat` (N×k), and the area target matrix `geotargets` (D×k) where
/// row `j` carries area `j`'s desired weighted totals for every
/// characteristic.
#[derive(Clone, Debug)]
pub struct GeoProblem {
    wh: DVector<f64>,
    xmat: DMatrix<f64>,
    geotargets: DMatrix<f64>,
}

impl GeoProblem {
    /// Creates a `GeoProblem` from validated components.
    pub fn new(wh: DVector<f64>, xmat: DMatrix<f64>, geotargets: DMatrix<f64>) -> Result<Self> {
        GeoProblemBuilder::new(wh)
            .xmat(xmat)
            .geotargets(geotargets)
            .build()
    }

    /// Number of sampled units (households).
    pub fn unit_count(&self) -> usize {
        self.wh.len()
    }

    /// Number of areas (states), one per target row.
    pub fn area_count(&self) -> usize {
        self.geotargets.nrows()
    }

    /// Number of characteristics per unit.
    pub fn characteristic_count(&self) -> usize {
        self.xmat.ncols()
    }

    /// Returns a read-only view of the national weights.
    pub fn wh(&self) -> &DVector<f64> {
        &self.wh
    }

    /// Returns a read-only view of the unit characteristic matrix.
    pub fn xmat(&self) -> &DMatrix<f64> {
        &self.xmat
    }

    /// Returns a read-only view of the area target matrix.
    pub fn geotargets(&self) -> &DMatrix<f64> {
        &self.geotargets
    }

    /// Expands a proportion matrix into unit×area weights: `whs[i,j] = wh[i]·Q[i,j]`.
    pub fn weight_matrix(&self, proportions: &DMatrix<f64>) -> DMatrix<f64> {
        let mut whs = proportions.clone();
        for i in 0..whs.nrows() {
            let wi = self.wh[i];
            whs.row_mut(i).scale_mut(wi);
        }
        whs
    }

    /// Area totals implied by a unit×area weight matrix: `whsᵀ·xmat` (D×k).
    pub fn implied_targets(&self, weights: &DMatrix<f64>) -> DMatrix<f64> {
        weights.transpose() * &self.xmat
    }
}

/// Builder that validates dimensions before constructing [`GeoProblem`].
#[derive(Debug)]
pub struct GeoProblemBuilder {
    wh: DVector<f64>,
    xmat: Option<DMatrix<f64>>,
    geotargets: Option<DMatrix<f64>>,
}

impl GeoProblemBuilder {
    /// Start building a problem from the national weight vector.
    pub fn new(wh: DVector<f64>) -> Self {
        Self {
            wh,
            xmat: None,
            geotargets: None,
        }
    }

    /// Sets the unit characteristic matrix (N×k).
    pub fn xmat(mut self, matrix: DMatrix<f64>) -> Self {
        self.xmat = Some(matrix);
        self
    }

    /// Sets the area target matrix (D×k).
    pub fn geotargets(mut self, matrix: DMatrix<f64>) -> Self {
        self.geotargets = Some(matrix);
        self
    }

    /// Finalizes construction after validating shapes and weight positivity.
    pub fn build(self) -> Result<GeoProblem> {
        let n = self.wh.len();
        if n == 0 {
            return Err(GeoError::dimension_mismatch("national weights", 1, 0));
        }
        for (index, weight) in self.wh.iter().enumerate() {
            if !(weight.is_finite() && *weight > 0.0) {
                return Err(GeoError::NonPositiveWeight {
                    index,
                    weight: *weight,
                });
            }
        }

        let xmat = self
            .xmat
            .ok_or_else(|| GeoError::dimension_mismatch("xmat", n, 0))?;
        if xmat.nrows() != n {
            return Err(GeoError::dimension_mismatch("xmat rows", n, xmat.nrows()));
        }
        let k = xmat.ncols();
        if k == 0 {
            return Err(GeoError::dimension_mismatch("xmat columns", 1, 0));
        }

        let geotargets = self
            .geotargets
            .ok_or_else(|| GeoError::dimension_mismatch("geotargets", 1, 0))?;
        if geotargets.ncols() != k {
            return Err(GeoError::dimension_mismatch(
                "geotargets columns",
                k,
                geotargets.ncols(),
            ));
        }
        if geotargets.nrows() == 0 {
            return Err(GeoError::dimension_mismatch("geotargets rows", 1, 0));
        }

        Ok(GeoProblem {
            wh: self.wh,
            xmat,
            geotargets,
        })
    }
}

/// Where the iterative solver starts its proportion matrix.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum InitialProportions {
    /// Every unit splits its weight evenly across areas (`1/D` per cell).
    Uniform,
    /// Every unit starts at each area's share of the designated
    /// population-count target column. The caller must name the column; there
    /// is no safe default to guess.
    PopulationShares { column: usize },
    /// A caller-supplied N×D starting matrix. Entries must be finite and
    /// non-negative with positive row sums; rows are normalized on entry so
    /// the partition invariant holds from iteration one.
    Supplied(DMatrix<f64>),
}

impl Default for InitialProportions {
    fn default() -> Self {
        Self::Uniform
    }
}

impl InitialProportions {
    /// Builds the concrete N×D starting matrix for `problem`.
    pub(crate) fn materialize(&self, problem: &GeoProblem) -> Result<DMatrix<f64>> {
        let n = problem.unit_count();
        let d = problem.area_count();
        match self {
            Self::Uniform => Ok(DMatrix::from_element(n, d, 1.0 / d as f64)),
            Self::PopulationShares { column } => {
                let k = problem.characteristic_count();
                if *column >= k {
                    return Err(GeoError::PopulationColumnOutOfRange {
                        column: *column,
                        columns: k,
                    });
                }
                let mut total = 0.0;
                for j in 0..d {
                    let value = problem.geotargets()[(j, *column)];
                    if !(value.is_finite() && value >= 0.0) {
                        return Err(GeoError::NonPositivePopulation { column: *column });
                    }
                    total += value;
                }
                if total <= 0.0 {
                    return Err(GeoError::NonPositivePopulation { column: *column });
                }
                Ok(DMatrix::from_fn(n, d, |_, j| {
                    problem.geotargets()[(j, *column)] / total
                }))
            }
            Self::Supplied(matrix) => {
                if matrix.nrows() != n {
                    return Err(GeoError::dimension_mismatch(
                        "starting proportion rows",
                        n,
                        matrix.nrows(),
                    ));
                }
                if matrix.ncols() != d {
                    return Err(GeoError::dimension_mismatch(
                        "starting proportion columns",
                        d,
                        matrix.ncols(),
                    ));
                }
                let mut q = matrix.clone();
                for row in 0..n {
                    let mut sum = 0.0;
                    for col in 0..d {
                        let value = q[(row, col)];
                        if !(value.is_finite() && value >= 0.0) {
                            return Err(GeoError::InvalidProportion { row, col, value });
                        }
                        sum += value;
                    }
                    if sum <= 0.0 {
                        return Err(GeoError::EmptyProportionRow { row, sum });
                    }
                    q.row_mut(row).unscale_mut(sum);
                }
                Ok(q)
            }
        }
    }
}
