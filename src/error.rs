use crate::faer_ndarray::FaerLinalgError;
use thiserror::Error;

/// Error type for every fallible operation in the crate.
///
/// All shape and domain validation runs before any output buffer is
/// mutated, so a returned error implies no partial writes.
#[derive(Debug, Error)]
pub enum FitError {
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("matrix must be square: {0}")]
    NotSquare(String),

    #[error("regularization matrix is singular (zero diagonal entry)")]
    SingularRegularizer,

    #[error("largest singular value must be positive")]
    NonPositiveSingularValue,

    #[error("smoothing-operator Gram matrix is not positive definite")]
    NotPositiveDefinite,

    #[error("weighted fits are not supported for a rank-deficient regularization matrix")]
    UnsupportedWeights,

    #[error("L-curve points are nearly colinear; no finite curvature radius found")]
    DegenerateCurve,

    #[error(transparent)]
    Linalg(#[from] FaerLinalgError),
}
