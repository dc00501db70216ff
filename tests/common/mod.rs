#![allow(dead_code)]

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rgbd_registration::{
    invert_pose, Correspondence, DepthMap, Descriptor, FeatureSet, Intrinsics, Keypoint,
    Parameters, PoseEstimator, ReferenceObservation, SourceObservation, Timestamp,
};

/// Reference pixels and their depth (mm), not coplanar.
pub const POINTS: [(i64, i64, u16); 10] = [
    (170, 130, 2000),
    (260, 140, 2600),
    (380, 125, 3100),
    (470, 150, 2300),
    (180, 240, 3500),
    (300, 230, 2800),
    (450, 250, 4000),
    (190, 350, 2400),
    (320, 345, 3300),
    (460, 355, 2900),
];

pub fn parameters() -> Parameters {
    Parameters {
        ransac_iterations: 200,
        ransac_confidence: 0.99,
        ransac_reprojection_threshold_px: 2.0,
        match_distance_threshold: 50.0,
        keypoint_merge_distance_px: 3.0,
        reprojection_discard_threshold_px: 1.0,
        min_correspondences: 6,
        min_pose_height_m: 0.0,
        max_pose_height_m: 3.0,
        max_orientation_deviation_deg: 45.0,
        depth_search_radius_px: 100.0,
        enable_feature_memory: false,
    }
}

pub fn source_intrinsics() -> Intrinsics {
    Intrinsics::new(640, 480, 500.0, 500.0, 320.0, 240.0).expect("intrinsics")
}

pub fn reference_intrinsics() -> Intrinsics {
    Intrinsics::new(640, 480, 525.0, 525.0, 320.0, 240.0).expect("intrinsics")
}

pub fn reference_to_world() -> Isometry3<f64> {
    Isometry3::from_parts(Translation3::new(0.0, 0.0, 1.5), UnitQuaternion::identity())
}

/// Ground truth source camera pose in the reference frame.
pub fn camera_in_reference() -> Isometry3<f64> {
    Isometry3::new(Vector3::new(0.2, -0.1, 0.3), Vector3::new(0.05, -0.1, 0.02))
}

pub fn descriptors(count: usize, seed: u64) -> Vec<Descriptor> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| Descriptor::new((0..32).map(|_| rng.gen()).collect()))
        .collect()
}

pub fn estimator(params: Parameters) -> PoseEstimator {
    PoseEstimator::new("phone-1", "world", params, reference_to_world()).expect("estimator")
}

/// A source/reference pair where every reference point is seen by the source
/// camera at `camera_in_reference()`.
pub struct Scene {
    pub reference_keypoints: Vec<Keypoint>,
    pub source_keypoints: Vec<Keypoint>,
    pub depth: DepthMap,
}

impl Scene {
    pub fn new() -> Self {
        let reference = reference_intrinsics();
        let source = source_intrinsics();
        let to_camera = invert_pose(&camera_in_reference());
        let mut depth = DepthMap::zeros(reference.width, reference.height);
        let mut reference_keypoints = Vec::new();
        let mut source_keypoints = Vec::new();
        for &(x, y, d) in &POINTS {
            depth.set(x, y, d);
            let p = reference.deproject(x as f64, y as f64, d as f64 / 1000.0);
            let pixel = source.project(&(to_camera * p)).expect("in front of camera");
            reference_keypoints.push(Keypoint::at(x as f32, y as f32));
            source_keypoints.push(Keypoint::at(pixel.x as f32, pixel.y as f32));
        }
        Self {
            reference_keypoints,
            source_keypoints,
            depth,
        }
    }

    pub fn source(&self, nanos: i64) -> SourceObservation {
        SourceObservation {
            features: FeatureSet::new(
                self.source_keypoints.clone(),
                descriptors(self.source_keypoints.len(), 17),
            )
            .expect("source features"),
            intrinsics: source_intrinsics(),
            timestamp: Timestamp::from_nanos(nanos),
        }
    }

    pub fn reference(&self) -> ReferenceObservation {
        ReferenceObservation {
            features: FeatureSet::new(
                self.reference_keypoints.clone(),
                descriptors(self.reference_keypoints.len(), 17),
            )
            .expect("reference features"),
            intrinsics: reference_intrinsics(),
            depth: self.depth.clone(),
        }
    }

    pub fn identity_matches(&self) -> Vec<Correspondence> {
        (0..self.source_keypoints.len().min(self.reference_keypoints.len()))
            .map(|i| Correspondence::new(i, i, 10.0))
            .collect()
    }
}
