//! Sub-national weight splitting for national survey microdata.
//!
//! Every unit in a national sample (a household, a tax return) carries a
//! known national weight. This crate computes per-area weights such that
//!
//! - each unit's area weights sum to its national weight, and
//! - area-level weighted totals of selected characteristics come as close as
//!   practical to externally supplied target totals.
//!
//! The approach follows Randrianasolo and Tillé, "Small Area Estimation by
//! Splitting the Sampling Weights" (Electronic Journal of Statistics, 2013).
//! Two solution routes are provided:
//!
//! - an iterative proportion-splitting engine (`qmatrix` module) that
//!   repeatedly calibrates each area's share of every unit's weight against
//!   that area's targets, using either calib-style raking or distance
//!   calibration as the per-area primitive (`calibrate` module), and
//! - a one-shot Poisson-model solver (`poisson` module) that fits log-linear
//!   coefficients by nonlinear least squares and derives the full weight
//!   matrix from them.
//!
//! # Quick start
//!
//! ```no_run
//! use georake::data::GeoProblem;
//! use georake::qmatrix::QMatrixOptions;
//! use nalgebra::{DMatrix, DVector};
//!
//! // Three households, one pure-count characteristic, two areas whose
//! // target counts partition the national weight total.
//! let wh = DVector::from_vec(vec![10.0, 20.0, 30.0]);
//! let xmat = DMatrix::from_element(3, 1, 1.0);
//! let geotargets = DMatrix::from_row_slice(2, 1, &[25.0, 35.0]);
//!
//! let problem = GeoProblem::new(wh, xmat, geotargets).expect("validated inputs");
//! let result = problem
//!     .solve_qmatrix(&QMatrixOptions::default())
//!     .expect("solved");
//! println!(
//!     "converged: {}, best iteration: {}",
//!     result.converged, result.best_iteration
//! );
//! ```
//!
//! Numerically degenerate iterations never abort a solve: a non-converging
//! area keeps its current allocation for that round, and the returned bundle
//! is always the best iterate seen, with per-iteration diagnostics attached.

pub mod calibrate;
pub mod data;
pub mod error;
pub mod poisson;
pub mod qmatrix;

pub use calibrate::{AreaCalibrator, DistanceCalibrator, Objective, RakingCalibrator};
pub use data::{GeoProblem, GeoProblemBuilder, InitialProportions};
pub use error::{GeoError, Result};
pub use poisson::{PoissonOptions, PoissonResult};
pub use qmatrix::{
    build_drop_mask, DropSpec, IterationRecord, Method, QMatrixOptions, QMatrixResult,
};
