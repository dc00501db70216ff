use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use ndarray::ArrayView2;
use numpy::{PyArray1, PyReadonlyArray2};
use pyo3::exceptions::{PyIOError, PyValueError};
use pyo3::prelude::*;

use crate::config::RegistrationConfig;
use crate::estimator::PoseEstimator;
use crate::logio::{CycleLogWriter, CycleRecord};
use crate::memory::InMemoryFeatureMemory;
use crate::types::{
    DepthMap, Descriptor, FeatureSet, Intrinsics, Keypoint, PoseEstimate, ReferenceObservation,
    SourceObservation, Timestamp,
};

/// Python wrapper for camera intrinsics
#[pyclass]
#[derive(Clone, Copy)]
pub struct PyIntrinsics {
    #[pyo3(get)]
    pub width: usize,
    #[pyo3(get)]
    pub height: usize,
    #[pyo3(get)]
    pub fx: f64,
    #[pyo3(get)]
    pub fy: f64,
    #[pyo3(get)]
    pub ppx: f64,
    #[pyo3(get)]
    pub ppy: f64,
}

#[pymethods]
impl PyIntrinsics {
    #[new]
    fn new(width: usize, height: usize, fx: f64, fy: f64, ppx: f64, ppy: f64) -> Self {
        Self { width, height, fx, fy, ppx, ppy }
    }

    fn __repr__(&self) -> String {
        format!(
            "PyIntrinsics({}x{}, fx={:.2}, fy={:.2}, ppx={:.2}, ppy={:.2})",
            self.width, self.height, self.fx, self.fy, self.ppx, self.ppy
        )
    }
}

impl PyIntrinsics {
    fn to_intrinsics(self) -> PyResult<Intrinsics> {
        Intrinsics::new(self.width, self.height, self.fx, self.fy, self.ppx, self.ppy)
            .map_err(|e| PyValueError::new_err(e.to_string()))
    }
}

/// Accepted world-frame pose
#[pyclass]
#[derive(Clone)]
pub struct PyPoseEstimate {
    #[pyo3(get)]
    pub frame_id: String,
    #[pyo3(get)]
    pub timestamp_ns: i64,
    #[pyo3(get)]
    pub inlier_count: usize,
    #[pyo3(get)]
    pub reprojection_error: f64,
    position: [f64; 3],
    orientation_xyzw: [f64; 4],
}

#[pymethods]
impl PyPoseEstimate {
    /// `[x, y, z]` in meters
    fn position<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        PyArray1::from_slice_bound(py, &self.position)
    }

    /// Quaternion as `[x, y, z, w]`
    fn orientation<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        PyArray1::from_slice_bound(py, &self.orientation_xyzw)
    }

    fn __repr__(&self) -> String {
        let [x, y, z] = self.position;
        format!(
            "PyPoseEstimate([{x:.3}, {y:.3}, {z:.3}] in {}, inliers={}, err={:.3}px)",
            self.frame_id, self.inlier_count, self.reprojection_error
        )
    }
}

impl From<&PoseEstimate> for PyPoseEstimate {
    fn from(estimate: &PoseEstimate) -> Self {
        let p = estimate.position;
        let q = estimate.orientation.quaternion();
        Self {
            frame_id: estimate.frame_id.clone(),
            timestamp_ns: estimate.timestamp.as_nanos(),
            inlier_count: estimate.inlier_count,
            reprojection_error: estimate.reprojection_error,
            position: [p.x, p.y, p.z],
            orientation_xyzw: [q.i, q.j, q.k, q.w],
        }
    }
}

/// Outcome of one update: either an estimate or a rejection code
#[pyclass]
#[derive(Clone)]
pub struct PyUpdateResult {
    #[pyo3(get)]
    pub accepted: bool,
    #[pyo3(get)]
    pub code: String,
    #[pyo3(get)]
    pub message: String,
    #[pyo3(get)]
    pub estimate: Option<PyPoseEstimate>,
}

#[pymethods]
impl PyUpdateResult {
    fn __repr__(&self) -> String {
        format!("PyUpdateResult({}: {})", self.code, self.message)
    }
}

#[pyclass]
pub struct PyPoseEstimator {
    estimator: PoseEstimator,
    recorder: Option<CycleLogWriter<BufWriter<File>>>,
}

#[pymethods]
impl PyPoseEstimator {
    /// Builds an estimator from a JSON configuration string
    #[new]
    fn new(config_json: &str) -> PyResult<Self> {
        let config = RegistrationConfig::from_json_str(config_json)
            .map_err(|e| PyValueError::new_err(e.to_string()))?;
        Self::build(&config)
    }

    #[staticmethod]
    fn from_file(path: PathBuf) -> PyResult<Self> {
        let config =
            RegistrationConfig::load(&path).map_err(|e| PyValueError::new_err(e.to_string()))?;
        Self::build(&config)
    }

    /// Attaches a bounded feature memory, optionally restored from a snapshot
    #[pyo3(signature = (capacity, occlusion_tolerance_mm, snapshot=None))]
    fn enable_feature_memory(
        &mut self,
        capacity: usize,
        occlusion_tolerance_mm: u16,
        snapshot: Option<PathBuf>,
    ) -> PyResult<()> {
        let memory = match snapshot {
            Some(path) => {
                InMemoryFeatureMemory::load_from_path(&path, capacity, occlusion_tolerance_mm)
                    .map_err(|e| PyIOError::new_err(e.to_string()))?
            }
            None => InMemoryFeatureMemory::new(capacity, occlusion_tolerance_mm),
        };
        self.estimator.set_feature_memory(memory);
        Ok(())
    }

    /// Runs one cycle. Keypoints are `(N, 2)` pixel positions or `(N, 7)` rows
    /// of `x, y, size, angle, response, octave, class_id`. Descriptors are
    /// `(N, D)` bytes, depth is `(H, W)` millimetres.
    #[allow(clippy::too_many_arguments)]
    #[pyo3(signature = (
        timestamp_ns,
        source_keypoints,
        source_descriptors,
        source_intrinsics,
        reference_keypoints,
        reference_descriptors,
        reference_intrinsics,
        depth
    ))]
    fn update<'py>(
        &mut self,
        timestamp_ns: i64,
        source_keypoints: PyReadonlyArray2<'py, f32>,
        source_descriptors: PyReadonlyArray2<'py, u8>,
        source_intrinsics: PyIntrinsics,
        reference_keypoints: PyReadonlyArray2<'py, f32>,
        reference_descriptors: PyReadonlyArray2<'py, u8>,
        reference_intrinsics: PyIntrinsics,
        depth: PyReadonlyArray2<'py, u16>,
    ) -> PyResult<PyUpdateResult> {
        let source = SourceObservation {
            features: feature_set(source_keypoints.as_array(), source_descriptors.as_array())?,
            intrinsics: source_intrinsics.to_intrinsics()?,
            timestamp: Timestamp::from_nanos(timestamp_ns),
        };
        let mut reference = ReferenceObservation {
            features: feature_set(reference_keypoints.as_array(), reference_descriptors.as_array())?,
            intrinsics: reference_intrinsics.to_intrinsics()?,
            depth: DepthMap::from_array(depth.as_array().to_owned()),
        };

        if let Some(recorder) = self.recorder.as_mut() {
            let record = CycleRecord {
                source: source.clone(),
                reference: reference.clone(),
            };
            recorder
                .write(&record)
                .map_err(|e| PyIOError::new_err(e.to_string()))?;
        }

        Ok(match self.estimator.update_from_features(&source, &mut reference) {
            Ok(registration) => PyUpdateResult {
                accepted: true,
                code: "accepted".into(),
                message: format!("{} inliers", registration.estimate.inlier_count),
                estimate: Some(PyPoseEstimate::from(&registration.estimate)),
            },
            Err(err) => PyUpdateResult {
                accepted: false,
                code: err.code().into(),
                message: err.to_string(),
                estimate: None,
            },
        })
    }

    /// Records every subsequent cycle to `path`
    fn start_recording(&mut self, path: PathBuf) -> PyResult<()> {
        self.stop_recording()?;
        let writer =
            CycleLogWriter::create(&path).map_err(|e| PyIOError::new_err(e.to_string()))?;
        self.recorder = Some(writer);
        Ok(())
    }

    fn stop_recording(&mut self) -> PyResult<()> {
        if let Some(mut recorder) = self.recorder.take() {
            recorder
                .flush()
                .map_err(|e| PyIOError::new_err(e.to_string()))?;
        }
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    fn has_estimate(&self) -> bool {
        self.estimator.has_estimate()
    }

    fn last_estimate(&self) -> Option<PyPoseEstimate> {
        self.estimator.last_estimate().map(PyPoseEstimate::from)
    }

    fn get_stats(&self) -> String {
        let state = self.estimator.state();
        format!(
            "device: {}, has estimate: {}, last matches: {}, last error: {:.3}px",
            self.estimator.device_id(),
            state.has_estimate(),
            state.last_match_count(),
            state.last_reprojection_error()
        )
    }
}

impl PyPoseEstimator {
    fn build(config: &RegistrationConfig) -> PyResult<Self> {
        let estimator =
            PoseEstimator::from_config(config).map_err(|e| PyValueError::new_err(e.to_string()))?;
        Ok(Self {
            estimator,
            recorder: None,
        })
    }
}

fn feature_set(keypoints: ArrayView2<'_, f32>, descriptors: ArrayView2<'_, u8>) -> PyResult<FeatureSet> {
    let columns = keypoints.ncols();
    if columns != 2 && columns != 7 {
        return Err(PyValueError::new_err(format!(
            "keypoints must have 2 or 7 columns, got {columns}"
        )));
    }
    let keypoints = keypoints
        .rows()
        .into_iter()
        .map(|row| {
            let mut kp = Keypoint::at(row[0], row[1]);
            if columns == 7 {
                kp.size = row[2];
                kp.angle = row[3];
                kp.response = row[4];
                kp.octave = row[5] as i32;
                kp.class_id = row[6] as i32;
            }
            kp
        })
        .collect();
    let descriptors = descriptors
        .rows()
        .into_iter()
        .map(|row| Descriptor::new(row.to_vec()))
        .collect();
    FeatureSet::new(keypoints, descriptors).map_err(|e| PyValueError::new_err(e.to_string()))
}

/// Python module definition
#[pymodule]
fn rgbd_registration(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyPoseEstimator>()?;
    m.add_class::<PyIntrinsics>()?;
    m.add_class::<PyPoseEstimate>()?;
    m.add_class::<PyUpdateResult>()?;
    Ok(())
}
