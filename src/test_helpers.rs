#![allow(dead_code)]

use nalgebra::{Isometry3, Point2, Translation3, UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::Parameters;
use crate::geometry::invert_pose;
use crate::types::{
    Correspondence, DepthMap, Descriptor, FeatureSet, Intrinsics, Keypoint, ReconstructedPoint,
    ReferenceObservation, SourceObservation, Timestamp,
};

pub(crate) const DESCRIPTOR_BYTES: usize = 32;

/// Reference pixels with their depth in millimetres. Spread out and at varying
/// depth so the scene is not planar.
pub(crate) const SCENE_PIXELS: [(i64, i64, u16); 10] = [
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

pub(crate) fn test_parameters() -> Parameters {
    Parameters {
        ransac_iterations: 100,
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

pub(crate) fn source_intrinsics() -> Intrinsics {
    Intrinsics {
        width: 640,
        height: 480,
        fx: 500.0,
        fy: 500.0,
        ppx: 320.0,
        ppy: 240.0,
    }
}

pub(crate) fn reference_intrinsics() -> Intrinsics {
    Intrinsics {
        width: 640,
        height: 480,
        fx: 525.0,
        fy: 525.0,
        ppx: 320.0,
        ppy: 240.0,
    }
}

pub(crate) fn descriptors(count: usize, seed: u64) -> Vec<Descriptor> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| Descriptor::new((0..DESCRIPTOR_BYTES).map(|_| rng.gen()).collect()))
        .collect()
}

/// A source camera looking at ten depth-backed reference features.
#[derive(Clone, Debug)]
pub(crate) struct SyntheticScene {
    pub camera_in_reference: Isometry3<f64>,
    pub reference_to_world: Isometry3<f64>,
    pub pixels: Vec<(i64, i64, u16)>,
}

impl SyntheticScene {
    pub fn new() -> Self {
        Self {
            camera_in_reference: Isometry3::new(
                Vector3::new(0.2, -0.1, 0.3),
                Vector3::new(0.05, -0.1, 0.02),
            ),
            reference_to_world: Isometry3::from_parts(
                Translation3::new(0.0, 0.0, 1.5),
                UnitQuaternion::identity(),
            ),
            pixels: SCENE_PIXELS.to_vec(),
        }
    }

    pub fn camera_in_reference(&self) -> Isometry3<f64> {
        self.camera_in_reference
    }

    pub fn camera_in_world(&self) -> Isometry3<f64> {
        self.reference_to_world * self.camera_in_reference
    }

    pub fn depth_map(&self) -> DepthMap {
        let k = reference_intrinsics();
        let mut depth = DepthMap::zeros(k.width, k.height);
        for &(x, y, d) in &self.pixels {
            depth.set(x, y, d);
        }
        depth
    }

    pub fn reference_keypoints(&self) -> Vec<Keypoint> {
        self.pixels
            .iter()
            .map(|&(x, y, _)| Keypoint::at(x as f32, y as f32))
            .collect()
    }

    /// Where each reference point lands in the source image.
    pub fn source_pixels(&self) -> Vec<Point2<f64>> {
        let reference = reference_intrinsics();
        let source = source_intrinsics();
        let reference_to_camera = invert_pose(&self.camera_in_reference);
        self.pixels
            .iter()
            .filter_map(|&(x, y, d)| {
                let p = reference.deproject(x as f64, y as f64, d as f64 / 1000.0);
                source.project(&(reference_to_camera * p))
            })
            .collect()
    }

    pub fn source_keypoints(&self) -> Vec<Keypoint> {
        self.source_pixels()
            .iter()
            .map(|p| Keypoint::at(p.x as f32, p.y as f32))
            .collect()
    }

    pub fn reference_features(&self) -> FeatureSet {
        FeatureSet::new(self.reference_keypoints(), descriptors(self.pixels.len(), 17))
            .expect("aligned reference features")
    }

    pub fn source_features(&self) -> FeatureSet {
        FeatureSet::new(self.source_keypoints(), descriptors(self.pixels.len(), 17))
            .expect("aligned source features")
    }

    pub fn reference_observation(&self) -> ReferenceObservation {
        ReferenceObservation {
            features: self.reference_features(),
            intrinsics: reference_intrinsics(),
            depth: self.depth_map(),
        }
    }

    pub fn source_observation(&self, nanos: i64) -> SourceObservation {
        SourceObservation {
            features: self.source_features(),
            intrinsics: source_intrinsics(),
            timestamp: Timestamp::from_nanos(nanos),
        }
    }

    pub fn raw_correspondences(&self) -> Vec<Correspondence> {
        (0..self.pixels.len())
            .map(|i| Correspondence::new(i, i, 10.0))
            .collect()
    }

    pub fn reconstructed_points(&self) -> Vec<ReconstructedPoint> {
        let reference = reference_intrinsics();
        self.pixels
            .iter()
            .zip(self.source_keypoints())
            .map(|(&(x, y, d), kp)| ReconstructedPoint {
                position: reference.deproject(x as f64, y as f64, d as f64 / 1000.0),
                source_pixel: kp.pixel(),
            })
            .collect()
    }
}
