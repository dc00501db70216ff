use thiserror::Error;

use crate::pnp::PnpError;

/// Malformed cycle inputs, rejected before the pipeline runs.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InputError {
    #[error("{side} feature set is empty")]
    EmptyFeatures { side: &'static str },
    #[error("{keypoints} keypoints but {descriptors} descriptors")]
    DescriptorCountMismatch { keypoints: usize, descriptors: usize },
    #[error("depth map dimension mismatch: expected {expected} samples, got {actual}")]
    DepthShapeMismatch { expected: usize, actual: usize },
    #[error("image dimension mismatch: expected {expected} pixels, got {actual}")]
    ImageShapeMismatch { expected: usize, actual: usize },
    #[error("depth map is empty")]
    EmptyDepthMap,
    #[error("pinhole intrinsics require finite fx, fy > 0 (fx={fx}, fy={fy})")]
    InvalidIntrinsics { fx: f64, fy: f64 },
    #[error(
        "correspondence index out of range: source {source_idx} (len {source_len}), reference {reference_idx} (len {reference_len})"
    )]
    CorrespondenceOutOfRange {
        source_idx: usize,
        source_len: usize,
        reference_idx: usize,
        reference_len: usize,
    },
    #[error("no valid depth at reference pixel ({x}, {y})")]
    MissingDepth { x: i64, y: i64 },
}

/// Reasons the detector capability produced nothing usable.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DetectError {
    #[error("no features found")]
    NoFeatures,
    #[error("no descriptors")]
    NoDescriptors,
}

/// A cycle that ran but whose estimate did not pass the validation gate.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Rejection {
    #[error("insufficient correspondences ({count} < {required})")]
    InsufficientCorrespondences { count: usize, required: usize },
    #[error("solve failed: {0}")]
    SolveFailed(PnpError),
    #[error("insufficient inliers ({count} < {required})")]
    InsufficientInliers { count: usize, required: usize },
    #[error("reprojection error too high ({error:.3}px > {threshold:.3}px)")]
    ReprojectionErrorTooHigh { error: f64, threshold: f64 },
    #[error("height above max ({height:.3}m > {max:.3}m)")]
    HeightAboveMax { height: f64, max: f64 },
    #[error("height below min ({height:.3}m < {min:.3}m)")]
    HeightBelowMin { height: f64, min: f64 },
    #[error("orientation deviation too high ({angle_deg:.2}deg > {max_deg:.2}deg)")]
    OrientationDeviationTooHigh { angle_deg: f64, max_deg: f64 },
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::InsufficientCorrespondences { .. } => "insufficient_correspondences",
            Rejection::SolveFailed(_) => "solve_failed",
            Rejection::InsufficientInliers { .. } => "insufficient_inliers",
            Rejection::ReprojectionErrorTooHigh { .. } => "reprojection_error_too_high",
            Rejection::HeightAboveMax { .. } => "height_above_max",
            Rejection::HeightBelowMin { .. } => "height_below_min",
            Rejection::OrientationDeviationTooHigh { .. } => "orientation_deviation_too_high",
        }
    }
}

/// Every non-accepted outcome of one update.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CycleError {
    #[error("invalid input: {0}")]
    Input(#[from] InputError),
    #[error(transparent)]
    Detect(#[from] DetectError),
    #[error("estimate rejected: {0}")]
    Rejected(#[from] Rejection),
}

impl CycleError {
    pub fn code(&self) -> &'static str {
        match self {
            CycleError::Input(_) => "invalid_input",
            CycleError::Detect(DetectError::NoFeatures) => "no_features",
            CycleError::Detect(DetectError::NoDescriptors) => "no_descriptors",
            CycleError::Rejected(rejection) => rejection.code(),
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            CycleError::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }
}
