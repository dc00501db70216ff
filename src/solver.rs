use nalgebra::{Isometry3, Point2, Point3};

use crate::geometry::invert_pose;
use crate::pnp::{PnpError, PnpSolution, PnpSolver, RansacParams};
use crate::types::{Intrinsics, ReconstructedPoint};

/// A solved source camera pose, expressed in the reference camera frame.
#[derive(Clone, Debug, PartialEq)]
pub struct SolvedPose {
    pub camera_in_reference: Isometry3<f64>,
    /// Indices into the reconstructed points.
    pub inliers: Vec<usize>,
    /// Mean pixel distance between observed and projected inliers.
    pub reprojection_error: f64,
}

/// Wraps a PnP backend with the camera-pose conventions used by the pipeline.
#[derive(Clone, Debug, Default)]
pub struct PoseSolver<S> {
    backend: S,
}

impl<S: PnpSolver> PoseSolver<S> {
    pub fn new(backend: S) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }

    /// `previous` is the last accepted camera pose in the reference frame, used
    /// to seed the backend.
    pub fn solve(
        &self,
        points: &[ReconstructedPoint],
        intrinsics: &Intrinsics,
        params: &RansacParams,
        previous: Option<&Isometry3<f64>>,
    ) -> Result<SolvedPose, PnpError> {
        let object: Vec<Point3<f64>> = points.iter().map(|p| p.position).collect();
        let image: Vec<Point2<f64>> = points.iter().map(|p| p.source_pixel).collect();
        let seed = previous.map(invert_pose);

        let PnpSolution {
            object_to_camera,
            inliers,
            ..
        } = self
            .backend
            .solve(&object, &image, intrinsics, params, seed.as_ref())?;

        let reprojection_error =
            mean_reprojection_error(&object_to_camera, &object, &image, &inliers, intrinsics);
        Ok(SolvedPose {
            camera_in_reference: invert_pose(&object_to_camera),
            inliers,
            reprojection_error,
        })
    }
}

/// Mean reprojection error over `inliers`. A point behind the camera counts as
/// infinitely far off.
pub fn mean_reprojection_error(
    object_to_camera: &Isometry3<f64>,
    object: &[Point3<f64>],
    image: &[Point2<f64>],
    inliers: &[usize],
    intrinsics: &Intrinsics,
) -> f64 {
    if inliers.is_empty() {
        return f64::INFINITY;
    }
    let total: f64 = inliers
        .iter()
        .map(|&i| {
            intrinsics
                .project(&(object_to_camera * object[i]))
                .map_or(f64::INFINITY, |p| (p - image[i]).norm())
        })
        .sum();
    total / inliers.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pnp::RansacPnp;
    use crate::test_helpers::{source_intrinsics, SyntheticScene};
    use approx::assert_relative_eq;
    use std::cell::RefCell;

    /// Records the seed it was handed and answers with a fixed transform.
    struct Recording {
        answer: Isometry3<f64>,
        seen: RefCell<Option<Isometry3<f64>>>,
    }

    impl PnpSolver for Recording {
        fn solve(
            &self,
            object: &[Point3<f64>],
            _image: &[Point2<f64>],
            _intrinsics: &Intrinsics,
            _params: &RansacParams,
            seed: Option<&Isometry3<f64>>,
        ) -> Result<PnpSolution, PnpError> {
            *self.seen.borrow_mut() = seed.copied();
            Ok(PnpSolution {
                object_to_camera: self.answer,
                inliers: (0..object.len()).collect(),
                iterations: 1,
            })
        }
    }

    fn params() -> RansacParams {
        RansacParams {
            iterations: 100,
            confidence: 0.99,
            reprojection_threshold_px: 2.0,
        }
    }

    #[test]
    fn result_is_camera_pose_not_object_transform() {
        let scene = SyntheticScene::new();
        let points = scene.reconstructed_points();
        let solver = PoseSolver::new(RansacPnp::new());
        let solved = solver
            .solve(&points, &source_intrinsics(), &params(), None)
            .expect("solve");
        let truth = scene.camera_in_reference();
        // Source keypoints are stored as f32, so allow for that rounding.
        assert!((solved.camera_in_reference.translation.vector - truth.translation.vector).norm() < 1e-4);
        assert!(solved.camera_in_reference.rotation.angle_to(&truth.rotation) < 1e-4);
        assert_eq!(solved.inliers.len(), points.len());
        assert!(solved.reprojection_error < 1e-3);
    }

    #[test]
    fn previous_camera_pose_is_inverted_into_a_seed() {
        let answer = Isometry3::new(
            nalgebra::Vector3::new(0.0, 0.0, 1.0),
            nalgebra::Vector3::new(0.0, 0.1, 0.0),
        );
        let backend = Recording {
            answer,
            seen: RefCell::new(None),
        };
        let solver = PoseSolver::new(backend);
        let previous = Isometry3::new(
            nalgebra::Vector3::new(0.5, 0.2, -0.3),
            nalgebra::Vector3::new(0.1, 0.0, 0.2),
        );
        let points = SyntheticScene::new().reconstructed_points();
        let solved = solver
            .solve(&points, &source_intrinsics(), &params(), Some(&previous))
            .expect("solve");

        let seen = solver.backend().seen.borrow().expect("seed passed");
        assert_relative_eq!(
            seen.to_homogeneous(),
            previous.inverse().to_homogeneous(),
            epsilon = 1e-12
        );
        assert_relative_eq!(
            solved.camera_in_reference.to_homogeneous(),
            answer.inverse().to_homogeneous(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn reprojection_error_is_mean_over_inliers() {
        let k = source_intrinsics();
        let pose = Isometry3::identity();
        let object = vec![
            Point3::new(0.0, 0.0, 2.0),
            Point3::new(0.2, 0.0, 2.0),
            Point3::new(0.0, 0.2, 2.0),
        ];
        let mut image: Vec<Point2<f64>> = object.iter().filter_map(|p| k.project(p)).collect();
        image[0].x += 3.0;
        image[1].y -= 1.0;
        image[2].x += 100.0;
        let err = mean_reprojection_error(&pose, &object, &image, &[0, 1], &k);
        assert_relative_eq!(err, 2.0, epsilon = 1e-9);
    }
}
