use nalgebra::Isometry3;

use crate::config::Parameters;
use crate::error::Rejection;
use crate::geometry::optical_axis_deviation_deg;
use crate::pnp::{PnpError, MIN_POINTS};
use crate::solver::SolvedPose;

/// An estimate that passed every acceptance check.
#[derive(Clone, Debug, PartialEq)]
pub struct GatePass {
    pub world_pose: Isometry3<f64>,
    pub camera_in_reference: Isometry3<f64>,
    pub inliers: Vec<usize>,
    pub reprojection_error: f64,
}

impl GatePass {
    pub fn inlier_count(&self) -> usize {
        self.inliers.len()
    }
}

/// Ordered, short-circuiting acceptance checks for one cycle.
///
/// 1. enough correspondences to attempt a solve
/// 2. the solve itself
/// 3. enough inliers
/// 4. mean inlier reprojection error
/// 5. world height inside `[min, max]`, upper bound first
/// 6. optical axis tilt relative to the reference camera
#[derive(Clone, Debug)]
pub struct ValidationGate {
    required_points: usize,
    reprojection_discard_threshold_px: f64,
    min_height_m: f64,
    max_height_m: f64,
    max_orientation_deviation_deg: f64,
    reference_to_world: Isometry3<f64>,
}

impl ValidationGate {
    pub fn new(params: &Parameters, reference_to_world: Isometry3<f64>) -> Self {
        Self {
            required_points: MIN_POINTS.max(params.min_correspondences),
            reprojection_discard_threshold_px: params.reprojection_discard_threshold_px,
            min_height_m: params.min_pose_height_m,
            max_height_m: params.max_pose_height_m,
            max_orientation_deviation_deg: params.max_orientation_deviation_deg,
            reference_to_world,
        }
    }

    /// Both the correspondence and the inlier checks use this floor.
    pub fn required_points(&self) -> usize {
        self.required_points
    }

    pub fn reference_to_world(&self) -> &Isometry3<f64> {
        &self.reference_to_world
    }

    pub fn check_correspondences(&self, count: usize) -> Result<(), Rejection> {
        if count < self.required_points {
            return Err(Rejection::InsufficientCorrespondences {
                count,
                required: self.required_points,
            });
        }
        Ok(())
    }

    pub fn check_solution(&self, solved: SolvedPose) -> Result<GatePass, Rejection> {
        let count = solved.inliers.len();
        if count < self.required_points {
            return Err(Rejection::InsufficientInliers {
                count,
                required: self.required_points,
            });
        }

        if !(solved.reprojection_error <= self.reprojection_discard_threshold_px) {
            return Err(Rejection::ReprojectionErrorTooHigh {
                error: solved.reprojection_error,
                threshold: self.reprojection_discard_threshold_px,
            });
        }

        let world_pose = self.reference_to_world * solved.camera_in_reference;
        let height = world_pose.translation.vector.z;
        if height > self.max_height_m {
            return Err(Rejection::HeightAboveMax {
                height,
                max: self.max_height_m,
            });
        }
        if height < self.min_height_m {
            return Err(Rejection::HeightBelowMin {
                height,
                min: self.min_height_m,
            });
        }

        // Both optical axes are rotated by the same extrinsic, so the angle is
        // the same in the world frame.
        let angle_deg = optical_axis_deviation_deg(&solved.camera_in_reference);
        if angle_deg > self.max_orientation_deviation_deg {
            return Err(Rejection::OrientationDeviationTooHigh {
                angle_deg,
                max_deg: self.max_orientation_deviation_deg,
            });
        }

        Ok(GatePass {
            world_pose,
            camera_in_reference: solved.camera_in_reference,
            inliers: solved.inliers,
            reprojection_error: solved.reprojection_error,
        })
    }

    /// Runs every stage in order. `solve` is only invoked once the
    /// correspondence count is known to be sufficient.
    pub fn evaluate<F>(&self, correspondences: usize, solve: F) -> Result<GatePass, Rejection>
    where
        F: FnOnce() -> Result<SolvedPose, PnpError>,
    {
        self.check_correspondences(correspondences)?;
        let solved = solve().map_err(Rejection::SolveFailed)?;
        self.check_solution(solved)
    }
}
