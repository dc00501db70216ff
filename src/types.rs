use bincode::{Decode, Encode};
use nalgebra::{Isometry3, Point2, Point3, Translation3, UnitQuaternion, Vector3};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::InputError;

/// Raw depth units per meter (depth maps are stored in millimetres).
pub const DEPTH_UNITS_PER_METER: f64 = 1000.0;

#[derive(Clone, Copy, PartialEq, Eq, Debug, PartialOrd, Ord, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn from_nanos(ns: i64) -> Self {
        Self(ns)
    }

    pub fn as_nanos(&self) -> i64 {
        self.0
    }
}

/// A detected feature. Only `x`/`y` are interpreted by the pipeline, the rest is
/// carried through untouched.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Encode, Decode)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub size: f32,
    pub angle: f32,
    pub response: f32,
    pub octave: i32,
    pub class_id: i32,
}

impl Keypoint {
    pub fn at(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            size: 31.0,
            angle: -1.0,
            response: 0.0,
            octave: 0,
            class_id: -1,
        }
    }

    pub fn pixel(&self) -> Point2<f64> {
        Point2::new(self.x as f64, self.y as f64)
    }

    pub fn distance_to(&self, other: &Keypoint) -> f64 {
        (self.pixel() - other.pixel()).norm()
    }

    /// Nearest integer pixel, the one used for depth lookups. Halves round to
    /// even, like OpenCV's `cvRound`.
    pub fn rounded(&self) -> (i64, i64) {
        (self.x.round_ties_even() as i64, self.y.round_ties_even() as i64)
    }
}

/// Binary feature descriptor (ORB-style), compared with the Hamming distance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Descriptor(Vec<u8>);

impl Descriptor {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn hamming(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// Keypoints with their index-aligned descriptors.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Encode, Decode)]
pub struct FeatureSet {
    keypoints: Vec<Keypoint>,
    descriptors: Vec<Descriptor>,
}

impl FeatureSet {
    pub fn new(keypoints: Vec<Keypoint>, descriptors: Vec<Descriptor>) -> Result<Self, InputError> {
        if keypoints.len() != descriptors.len() {
            return Err(InputError::DescriptorCountMismatch {
                keypoints: keypoints.len(),
                descriptors: descriptors.len(),
            });
        }
        Ok(Self {
            keypoints,
            descriptors,
        })
    }

    pub fn keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn push(&mut self, keypoint: Keypoint, descriptor: Descriptor) {
        self.keypoints.push(keypoint);
        self.descriptors.push(descriptor);
    }
}

/// Candidate link between a source (mobile) feature and a reference (fixed) feature.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Correspondence {
    pub source_idx: usize,
    pub reference_idx: usize,
    pub distance: f32,
}

impl Correspondence {
    pub fn new(source_idx: usize, reference_idx: usize, distance: f32) -> Self {
        Self {
            source_idx,
            reference_idx,
            distance,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Intrinsics {
    pub width: usize,
    pub height: usize,
    pub fx: f64,
    pub fy: f64,
    pub ppx: f64,
    pub ppy: f64,
}

impl Intrinsics {
    pub fn new(
        width: usize,
        height: usize,
        fx: f64,
        fy: f64,
        ppx: f64,
        ppy: f64,
    ) -> Result<Self, InputError> {
        let intrinsics = Self {
            width,
            height,
            fx,
            fy,
            ppx,
            ppy,
        };
        intrinsics.validate()?;
        Ok(intrinsics)
    }

    pub fn validate(&self) -> Result<(), InputError> {
        let finite = [self.fx, self.fy, self.ppx, self.ppy]
            .iter()
            .all(|v| v.is_finite());
        if !finite || self.fx <= 0.0 || self.fy <= 0.0 {
            return Err(InputError::InvalidIntrinsics {
                fx: self.fx,
                fy: self.fy,
            });
        }
        Ok(())
    }

    /// Pinhole back-projection of pixel `(u, v)` at `z` meters.
    pub fn deproject(&self, u: f64, v: f64, z: f64) -> Point3<f64> {
        Point3::new((u - self.ppx) * z / self.fx, (v - self.ppy) * z / self.fy, z)
    }

    /// Projects a camera-frame point, `None` when it is not in front of the camera.
    pub fn project(&self, p: &Point3<f64>) -> Option<Point2<f64>> {
        if p.z <= f64::EPSILON {
            return None;
        }
        Some(Point2::new(
            self.fx * p.x / p.z + self.ppx,
            self.fy * p.y / p.z + self.ppy,
        ))
    }

    /// Pixel to normalized image plane coordinates (K⁻¹ applied).
    pub fn normalize(&self, pixel: &Point2<f64>) -> Point2<f64> {
        Point2::new(
            (pixel.x - self.ppx) / self.fx,
            (pixel.y - self.ppy) / self.fy,
        )
    }
}

/// Dense depth image in millimetres, zero marks an invalid sample.
#[derive(Clone, Debug, PartialEq)]
pub struct DepthMap {
    data: Array2<u16>,
}

impl DepthMap {
    pub fn new(width: usize, height: usize, data: Vec<u16>) -> Result<Self, InputError> {
        let expected = width.saturating_mul(height);
        if data.len() != expected {
            return Err(InputError::DepthShapeMismatch {
                expected,
                actual: data.len(),
            });
        }
        let actual = data.len();
        let data = Array2::from_shape_vec((height, width), data)
            .map_err(|_| InputError::DepthShapeMismatch { expected, actual })?;
        Ok(Self { data })
    }

    pub fn from_array(data: Array2<u16>) -> Self {
        Self { data }
    }

    pub fn zeros(width: usize, height: usize) -> Self {
        Self {
            data: Array2::zeros((height, width)),
        }
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_array(&self) -> &Array2<u16> {
        &self.data
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && (x as usize) < self.width() && (y as usize) < self.height()
    }

    /// Raw sample at `(x, y)`, `None` outside the image.
    pub fn get(&self, x: i64, y: i64) -> Option<u16> {
        if !self.contains(x, y) {
            return None;
        }
        self.data.get((y as usize, x as usize)).copied()
    }

    pub fn set(&mut self, x: i64, y: i64, value: u16) {
        if self.contains(x, y) {
            self.data[(y as usize, x as usize)] = value;
        }
    }

    /// Depth in meters at `(x, y)` when the sample is valid.
    pub fn meters_at(&self, x: i64, y: i64) -> Option<f64> {
        match self.get(x, y)? {
            0 => None,
            raw => Some(raw as f64 / DEPTH_UNITS_PER_METER),
        }
    }

    /// Row-major copy of the samples.
    pub fn to_vec(&self) -> Vec<u16> {
        self.data.iter().copied().collect()
    }
}

/// 8-bit grayscale image handed to a feature detector.
#[derive(Clone, Debug, PartialEq)]
pub struct GrayImage {
    pixels: Array2<u8>,
}

impl GrayImage {
    pub fn new(width: usize, height: usize, data: Vec<u8>) -> Result<Self, InputError> {
        let expected = width.saturating_mul(height);
        if data.len() != expected || expected == 0 {
            return Err(InputError::ImageShapeMismatch {
                expected,
                actual: data.len(),
            });
        }
        let actual = data.len();
        let pixels = Array2::from_shape_vec((height, width), data)
            .map_err(|_| InputError::ImageShapeMismatch { expected, actual })?;
        Ok(Self { pixels })
    }

    pub fn width(&self) -> usize {
        self.pixels.ncols()
    }

    pub fn height(&self) -> usize {
        self.pixels.nrows()
    }

    pub fn pixels(&self) -> &Array2<u8> {
        &self.pixels
    }
}

/// A reference-frame 3D point and the source pixel it was observed at.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconstructedPoint {
    pub position: Point3<f64>,
    pub source_pixel: Point2<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PoseEstimate {
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
    pub frame_id: String,
    pub timestamp: Timestamp,
    pub inlier_count: usize,
    pub reprojection_error: f64,
}

impl PoseEstimate {
    pub fn isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.position), self.orientation)
    }
}

/// What the mobile device sent for one cycle.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct SourceObservation {
    pub features: FeatureSet,
    pub intrinsics: Intrinsics,
    pub timestamp: Timestamp,
}

/// What the fixed reference camera saw for one cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct ReferenceObservation {
    pub features: FeatureSet,
    pub intrinsics: Intrinsics,
    pub depth: DepthMap,
}
