use thiserror::Error;

/// Unified error type for `georake` operations.
#[derive(Debug, Error)]
pub enum GeoError {
    /// Raised when provided vectors or matrices have incompatible dimensions.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required dimension, often implied by the problem shape.
        expected: usize,
        /// The dimension that was actually supplied.
        found: usize,
    },

    /// Raised when a national weight is zero, negative, or not finite.
    #[error("national weight at index {index} must be positive, found {weight}")]
    NonPositiveWeight { index: usize, weight: f64 },

    /// Raised when a supplied starting proportion is unusable.
    #[error("starting proportion at ({row}, {col}) must be finite and non-negative, found {value}")]
    InvalidProportion { row: usize, col: usize, value: f64 },

    /// Raised when a supplied starting proportion row carries no mass at all.
    #[error("starting proportion row {row} sums to {sum}; every unit needs a positive row sum")]
    EmptyProportionRow { row: usize, sum: f64 },

    /// Raised when the designated population column does not exist.
    #[error("population column {column} is out of range for {columns} characteristics")]
    PopulationColumnOutOfRange { column: usize, columns: usize },

    /// Raised when the designated population column cannot yield area shares.
    #[error("population column {column} must carry a positive total to build starting shares")]
    NonPositivePopulation { column: usize },

    /// Raised when a drop specification names an area outside the target matrix.
    #[error("drop specification names area {area}, but only {areas} areas exist")]
    DropAreaOutOfRange { area: usize, areas: usize },

    /// Raised when a drop specification names a target column outside the target matrix.
    #[error("drop specification for area {area} names column {column}, but only {columns} targets exist")]
    DropColumnOutOfRange {
        area: usize,
        column: usize,
        columns: usize,
    },
}

impl GeoError {
    /// Helper to format a [`DimensionMismatch`](GeoError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, GeoError>;
