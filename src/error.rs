//! Error types shared by the transform, index and pool layers

use thiserror::Error;

/// Failure of a coordinate conversion or of a local model fit
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransfoError {
    /// The coordinate lies outside the domain where the model is defined
    #[error("coordinate ({x}, {y}) is outside the model domain")]
    OutOfDomain { x: f64, y: f64 },

    /// The homogeneous weight vanished for this coordinate
    #[error("coordinate ({x}, {y}) is projected to infinity")]
    PointAtInfinity { x: f64, y: f64 },

    /// An iterative inverse did not settle
    #[error("inverse conversion of ({x}, {y}) did not converge")]
    NoConvergence { x: f64, y: f64 },

    /// The control points do not determine a unique model
    #[error("control points are degenerate, no {kind} model can be fitted")]
    SingularFit { kind: &'static str },

    /// The control point lists cannot be paired
    #[error("expected matching control point lists of at least 3 points, got {src} and {dst}")]
    ControlPointMismatch { src: usize, dst: usize },

    /// The model has no inverse
    #[error("model matrix is not invertible")]
    NotInvertible,

    /// Bad arguments given to a precision study
    #[error("invalid precision study: {0}")]
    InvalidStudy(String),
}

pub type TransfoResult<T> = Result<T, TransfoError>;

/// Failure of the compressible vector pool
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("compression failed")]
    Compression(#[source] std::io::Error),

    #[error("decompression failed")]
    Decompression(#[source] std::io::Error),

    /// Inflated payload size does not match what was discarded
    #[error("inflated payload is {actual} bytes, expected {expected}")]
    CorruptPayload { expected: usize, actual: usize },

    /// Evicting every other pooled vector still leaves too little budget
    #[error("cannot reserve {requested} elements within a pool limit of {limit}")]
    BudgetExhausted { requested: usize, limit: usize },

    /// The handle is not (or no longer) known to the pool
    #[error("unknown pool slot {0}")]
    UnknownSlot(u64),

    #[error("index {index} out of bounds for length {len}")]
    OutOfBounds { index: usize, len: usize },
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Failure of a spatial index insertion
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndexError {
    #[error("item extent lies outside the fixed index extent")]
    OutsideFixedExtent,

    #[error("item extent is undefined")]
    UndefinedExtent,
}
