use std::time::Instant;

use nalgebra::{Isometry3, Vector3};

use crate::config::{ConfigError, Parameters, RegistrationConfig};
use crate::depth_repair::DepthRepairer;
use crate::error::{CycleError, DetectError, InputError};
use crate::features::{BruteForceMatcher, DescriptorMatcher, FeatureDetector};
use crate::gate::{GatePass, ValidationGate};
use crate::geometry::invert_pose;
use crate::memory::{FeatureMemory, MemoryFeature};
use crate::pnp::{PnpSolver, RansacParams, RansacPnp};
use crate::reconstruct::reconstruct;
use crate::resolver::MatchConsistencyResolver;
use crate::solver::PoseSolver;
use crate::types::{
    Correspondence, DepthMap, FeatureSet, GrayImage, Intrinsics, PoseEstimate,
    ReconstructedPoint, ReferenceObservation, SourceObservation,
};

/// What the estimator remembers between cycles. Only an accepted cycle
/// changes it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EstimatorState {
    last_estimate: Option<PoseEstimate>,
    last_match_count: usize,
    last_reprojection_error: f64,
}

impl EstimatorState {
    pub fn has_estimate(&self) -> bool {
        self.last_estimate.is_some()
    }

    pub fn last_estimate(&self) -> Option<&PoseEstimate> {
        self.last_estimate.as_ref()
    }

    /// Correspondences that survived depth repair in the last accepted cycle.
    pub fn last_match_count(&self) -> usize {
        self.last_match_count
    }

    pub fn last_reprojection_error(&self) -> f64 {
        self.last_reprojection_error
    }
}

/// An accepted cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct Registration {
    pub estimate: PoseEstimate,
    /// Correspondences that reached the solver.
    pub correspondence_count: usize,
    /// The correspondences the accepted pose agrees with.
    pub inliers: Vec<Correspondence>,
}

/// Reference-side inputs of one cycle, split so the feature set can be
/// augmented without touching the caller's.
struct ReferenceView<'a> {
    features: &'a FeatureSet,
    intrinsics: &'a Intrinsics,
    depth: &'a mut DepthMap,
    /// Features at or past this index came from memory.
    fresh: usize,
}

/// Registers one mobile device against a fixed depth camera.
pub struct PoseEstimator<S = RansacPnp, M = BruteForceMatcher> {
    device_id: String,
    world_frame_id: String,
    params: Parameters,
    ransac: RansacParams,
    resolver: MatchConsistencyResolver,
    repairer: DepthRepairer,
    solver: PoseSolver<S>,
    gate: ValidationGate,
    matcher: M,
    memory: Option<Box<dyn FeatureMemory + Send>>,
    state: EstimatorState,
}

impl PoseEstimator {
    pub fn new(
        device_id: impl Into<String>,
        world_frame_id: impl Into<String>,
        params: Parameters,
        reference_to_world: Isometry3<f64>,
    ) -> Result<Self, ConfigError> {
        params.validate()?;
        Ok(Self {
            device_id: device_id.into(),
            world_frame_id: world_frame_id.into(),
            ransac: RansacParams::from_parameters(&params),
            resolver: MatchConsistencyResolver::from_parameters(&params),
            repairer: DepthRepairer::new(params.depth_search_radius_px),
            solver: PoseSolver::new(RansacPnp::new()),
            gate: ValidationGate::new(&params, reference_to_world),
            matcher: BruteForceMatcher,
            memory: None,
            state: EstimatorState::default(),
            params,
        })
    }

    pub fn from_config(config: &RegistrationConfig) -> Result<Self, ConfigError> {
        Self::new(
            config.device_id.clone(),
            config.world_frame_id.clone(),
            config.parameters.clone(),
            config.reference_to_world.to_isometry()?,
        )
    }
}

impl<S: PnpSolver, M: DescriptorMatcher> PoseEstimator<S, M> {
    pub fn with_solver<T: PnpSolver>(self, backend: T) -> PoseEstimator<T, M> {
        PoseEstimator {
            device_id: self.device_id,
            world_frame_id: self.world_frame_id,
            params: self.params,
            ransac: self.ransac,
            resolver: self.resolver,
            repairer: self.repairer,
            solver: PoseSolver::new(backend),
            gate: self.gate,
            matcher: self.matcher,
            memory: self.memory,
            state: self.state,
        }
    }

    pub fn with_matcher<N: DescriptorMatcher>(self, matcher: N) -> PoseEstimator<S, N> {
        PoseEstimator {
            device_id: self.device_id,
            world_frame_id: self.world_frame_id,
            params: self.params,
            ransac: self.ransac,
            resolver: self.resolver,
            repairer: self.repairer,
            solver: self.solver,
            gate: self.gate,
            matcher,
            memory: self.memory,
            state: self.state,
        }
    }

    pub fn with_feature_memory(mut self, memory: impl FeatureMemory + Send + 'static) -> Self {
        self.set_feature_memory(memory);
        self
    }

    /// Replaces the attached feature memory, if any.
    pub fn set_feature_memory(&mut self, memory: impl FeatureMemory + Send + 'static) {
        self.memory = Some(Box::new(memory));
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    pub fn state(&self) -> &EstimatorState {
        &self.state
    }

    pub fn has_estimate(&self) -> bool {
        self.state.has_estimate()
    }

    pub fn last_estimate(&self) -> Option<&PoseEstimate> {
        self.state.last_estimate()
    }

    pub fn feature_memory(&self) -> Option<&(dyn FeatureMemory + Send)> {
        self.memory.as_deref()
    }

    /// Core pipeline on caller-supplied correspondences. The reference depth
    /// map is repaired in place.
    pub fn register(
        &mut self,
        raw: &[Correspondence],
        source: &SourceObservation,
        reference: &mut ReferenceObservation,
    ) -> Result<Registration, CycleError> {
        let fresh = reference.features.len();
        let view = ReferenceView {
            features: &reference.features,
            intrinsics: &reference.intrinsics,
            depth: &mut reference.depth,
            fresh,
        };
        self.run_cycle(raw, source, view)
    }

    /// Matches descriptors (including remembered reference features when
    /// memory is enabled) and runs the core pipeline.
    pub fn update_from_features(
        &mut self,
        source: &SourceObservation,
        reference: &mut ReferenceObservation,
    ) -> Result<Registration, CycleError> {
        self.update_reference_parts(
            source,
            &reference.features,
            &reference.intrinsics,
            &mut reference.depth,
        )
    }

    /// Detects reference features on `image` first.
    pub fn update_from_image<D: FeatureDetector>(
        &mut self,
        detector: &mut D,
        source: &SourceObservation,
        image: &GrayImage,
        reference_intrinsics: &Intrinsics,
        depth: &mut DepthMap,
    ) -> Result<Registration, CycleError> {
        let started = Instant::now();
        let features = detector.detect(image)?;
        if features.is_empty() {
            return Err(DetectError::NoFeatures.into());
        }
        tracing::debug!(
            features = features.len(),
            "reference detection in {:?}",
            started.elapsed()
        );
        self.update_reference_parts(source, &features, reference_intrinsics, depth)
    }

    fn update_reference_parts(
        &mut self,
        source: &SourceObservation,
        features: &FeatureSet,
        intrinsics: &Intrinsics,
        depth: &mut DepthMap,
    ) -> Result<Registration, CycleError> {
        check_features(&source.features, "source")?;
        check_features(features, "reference")?;

        let fresh = features.len();
        let mut augmented;
        let mut reference_features = features;
        if self.params.enable_feature_memory {
            if let Some(memory) = self.memory.as_mut() {
                memory.retain_foreground(depth);
                let remembered = memory.list_features();
                if !remembered.is_empty() {
                    augmented = features.clone();
                    for f in remembered {
                        augmented.push(f.keypoint, f.descriptor);
                    }
                    tracing::debug!(
                        fresh,
                        remembered = augmented.len() - fresh,
                        "augmented reference features"
                    );
                    reference_features = &augmented;
                }
            }
        }

        let raw = self.matcher.match_descriptors(
            source.features.descriptors(),
            reference_features.descriptors(),
        );
        let view = ReferenceView {
            features: reference_features,
            intrinsics,
            depth,
            fresh,
        };
        self.run_cycle(&raw, source, view)
    }

    fn run_cycle(
        &mut self,
        raw: &[Correspondence],
        source: &SourceObservation,
        reference: ReferenceView<'_>,
    ) -> Result<Registration, CycleError> {
        let result = self.run_pipeline(raw, source, reference);
        if let Err(err) = &result {
            tracing::warn!(
                device = %self.device_id,
                code = err.code(),
                "registration rejected: {err}"
            );
        }
        result
    }

    fn run_pipeline(
        &mut self,
        raw: &[Correspondence],
        source: &SourceObservation,
        reference: ReferenceView<'_>,
    ) -> Result<Registration, CycleError> {
        let t0 = Instant::now();
        check_inputs(source, &reference)?;
        let source_kps = source.features.keypoints();
        let reference_kps = reference.features.keypoints();

        // 1. disambiguate ----------------------------------------------------
        let resolved = self.resolver.resolve(raw, source_kps, reference_kps)?;

        // 2. fill depth holes -------------------------------------------------
        let repaired = self.repairer.repair(&resolved, reference_kps, reference.depth);

        // 3. back-project -----------------------------------------------------
        let points = reconstruct(
            &repaired,
            source_kps,
            reference_kps,
            reference.depth,
            reference.intrinsics,
        )?;
        tracing::debug!(
            raw = raw.len(),
            resolved = resolved.len(),
            repaired = repaired.len(),
            "correspondences prepared in {:?}",
            t0.elapsed()
        );

        // 4. solve and gate ---------------------------------------------------
        let previous = self.previous_camera_in_reference();
        let t1 = Instant::now();
        let solver = &self.solver;
        let ransac = &self.ransac;
        let pass = self.gate.evaluate(points.len(), || {
            solver.solve(&points, &source.intrinsics, ransac, previous.as_ref())
        })?;
        tracing::debug!(inliers = pass.inlier_count(), "pose solved in {:?}", t1.elapsed());

        // 5. commit -----------------------------------------------------------
        let registration = self.accept(pass, &repaired, &points, source, &reference);
        tracing::info!(
            device = %self.device_id,
            x = registration.estimate.position.x,
            y = registration.estimate.position.y,
            z = registration.estimate.position.z,
            inliers = registration.estimate.inlier_count,
            reprojection_error = registration.estimate.reprojection_error,
            "registration accepted in {:?}",
            t0.elapsed()
        );
        Ok(registration)
    }

    /// Last accepted world pose, brought back into the reference frame.
    fn previous_camera_in_reference(&self) -> Option<Isometry3<f64>> {
        let world_to_reference = invert_pose(self.gate.reference_to_world());
        self.state
            .last_estimate()
            .map(|estimate| world_to_reference * estimate.isometry())
    }

    fn accept(
        &mut self,
        pass: GatePass,
        correspondences: &[Correspondence],
        points: &[ReconstructedPoint],
        source: &SourceObservation,
        reference: &ReferenceView<'_>,
    ) -> Registration {
        let estimate = PoseEstimate {
            position: pass.world_pose.translation.vector,
            orientation: pass.world_pose.rotation,
            frame_id: self.world_frame_id.clone(),
            timestamp: source.timestamp,
            inlier_count: pass.inlier_count(),
            reprojection_error: pass.reprojection_error,
        };

        self.state = EstimatorState {
            last_estimate: Some(estimate.clone()),
            last_match_count: correspondences.len(),
            last_reprojection_error: pass.reprojection_error,
        };

        if self.params.enable_feature_memory {
            if let Some(memory) = self.memory.as_mut() {
                let observer = pass.camera_in_reference.translation.vector;
                let mut appended = 0usize;
                for &i in &pass.inliers {
                    let c = correspondences[i];
                    if c.reference_idx >= reference.fresh {
                        continue;
                    }
                    if let Some(feature) = memory_feature(c, &points[i], &observer, reference) {
                        memory.append(feature);
                        appended += 1;
                    }
                }
                tracing::debug!(appended, "feature memory updated");
            }
        }

        Registration {
            estimate,
            correspondence_count: correspondences.len(),
            inliers: pass.inliers.iter().map(|&i| correspondences[i]).collect(),
        }
    }
}

fn memory_feature(
    c: Correspondence,
    point: &ReconstructedPoint,
    observer: &Vector3<f64>,
    reference: &ReferenceView<'_>,
) -> Option<MemoryFeature> {
    let keypoint = reference.features.keypoints()[c.reference_idx];
    let (x, y) = keypoint.rounded();
    let raw_depth_mm = reference.depth.get(x, y).filter(|&d| d > 0)?;
    let offset = point.position.coords - observer;
    let distance = offset.norm();
    if !(distance > 0.0) {
        return None;
    }
    let direction = offset / distance;
    Some(MemoryFeature {
        keypoint,
        descriptor: reference.features.descriptors()[c.reference_idx].clone(),
        observer_distance_m: distance,
        observer_direction: [direction.x, direction.y, direction.z],
        raw_depth_mm,
    })
}

fn check_features(features: &FeatureSet, side: &'static str) -> Result<(), InputError> {
    if features.is_empty() {
        return Err(InputError::EmptyFeatures { side });
    }
    Ok(())
}

fn check_inputs(source: &SourceObservation, reference: &ReferenceView<'_>) -> Result<(), InputError> {
    source.intrinsics.validate()?;
    reference.intrinsics.validate()?;
    if source.features.is_empty() {
        return Err(InputError::EmptyFeatures { side: "source" });
    }
    if reference.features.is_empty() {
        return Err(InputError::EmptyFeatures { side: "reference" });
    }
    if reference.depth.is_empty() {
        return Err(InputError::EmptyDepthMap);
    }
    let (w, h) = (reference.intrinsics.width, reference.intrinsics.height);
    if reference.depth.width() != w || reference.depth.height() != h {
        return Err(InputError::DepthShapeMismatch {
            expected: w.saturating_mul(h),
            actual: reference.depth.width() * reference.depth.height(),
        });
    }
    Ok(())
}
