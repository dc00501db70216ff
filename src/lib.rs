//! Registers a mobile camera against a fixed RGB-D reference camera.
//!
//! One [`PoseEstimator`] per tracked device takes matched sparse features from
//! both cameras plus the reference depth plane, and produces either a
//! world-frame [`PoseEstimate`] or a typed [`CycleError`].

pub mod config;
pub mod depth_repair;
pub mod error;
pub mod estimator;
pub mod features;
pub mod gate;
pub mod geometry;
pub mod logio;
pub mod memory;
pub mod pnp;
pub mod reconstruct;
pub mod resolver;
pub mod solver;
pub mod types;

#[cfg(feature = "python")]
mod python;

#[cfg(test)]
mod test_helpers;

pub use config::{ConfigError, ExtrinsicConfig, Parameters, RegistrationConfig};
pub use depth_repair::DepthRepairer;
pub use error::{CycleError, DetectError, InputError, Rejection};
pub use estimator::{EstimatorState, PoseEstimator, Registration};
pub use features::{BruteForceMatcher, DescriptorMatcher, FeatureDetector};
pub use gate::{GatePass, ValidationGate};
pub use geometry::invert_pose;
pub use logio::{CycleLogReader, CycleLogWriter, CycleRecord, LogError};
pub use memory::{FeatureMemory, InMemoryFeatureMemory, MemoryError, MemoryFeature};
pub use pnp::{PnpError, PnpSolution, PnpSolver, RansacParams, RansacPnp};
pub use reconstruct::reconstruct;
pub use resolver::MatchConsistencyResolver;
pub use solver::{PoseSolver, SolvedPose};
pub use types::{
    Correspondence, DepthMap, Descriptor, FeatureSet, GrayImage, Intrinsics, Keypoint,
    PoseEstimate, ReconstructedPoint, ReferenceObservation, SourceObservation, Timestamp,
};
