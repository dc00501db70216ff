use std::path::Path;

use nalgebra::{Isometry3, Quaternion, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid parameter `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Tuning for one registration cycle. Every field must be supplied; the
/// pipeline never falls back to baked-in values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Parameters {
    pub ransac_iterations: usize,
    pub ransac_confidence: f64,
    pub ransac_reprojection_threshold_px: f64,
    /// Maximum descriptor distance for a correspondence to survive.
    pub match_distance_threshold: f32,
    pub keypoint_merge_distance_px: f64,
    pub reprojection_discard_threshold_px: f64,
    pub min_correspondences: usize,
    pub min_pose_height_m: f64,
    pub max_pose_height_m: f64,
    pub max_orientation_deviation_deg: f64,
    /// Radius of the nearest-valid-depth search.
    pub depth_search_radius_px: f64,
    pub enable_feature_memory: bool,
}

impl Parameters {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let params: Parameters = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if self.ransac_iterations == 0 {
            return Err(invalid("ransac_iterations", "must be > 0"));
        }
        if !(self.ransac_confidence > 0.0 && self.ransac_confidence < 1.0) {
            return Err(invalid("ransac_confidence", "must be in (0, 1)"));
        }
        let positive = [
            (
                "ransac_reprojection_threshold_px",
                self.ransac_reprojection_threshold_px,
            ),
            (
                "reprojection_discard_threshold_px",
                self.reprojection_discard_threshold_px,
            ),
            ("depth_search_radius_px", self.depth_search_radius_px),
            (
                "max_orientation_deviation_deg",
                self.max_orientation_deviation_deg,
            ),
        ];
        for (field, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(field, format!("must be finite and > 0, got {value}")));
            }
        }
        if !(self.keypoint_merge_distance_px.is_finite() && self.keypoint_merge_distance_px >= 0.0) {
            return Err(invalid("keypoint_merge_distance_px", "must be finite and >= 0"));
        }
        if !(self.match_distance_threshold.is_finite() && self.match_distance_threshold >= 0.0) {
            return Err(invalid("match_distance_threshold", "must be finite and >= 0"));
        }
        if !self.min_pose_height_m.is_finite() || !self.max_pose_height_m.is_finite() {
            return Err(invalid("min_pose_height_m", "height bounds must be finite"));
        }
        if self.min_pose_height_m > self.max_pose_height_m {
            return Err(invalid(
                "min_pose_height_m",
                format!(
                    "min {} exceeds max {}",
                    self.min_pose_height_m, self.max_pose_height_m
                ),
            ));
        }
        Ok(())
    }
}

/// Fixed reference-camera → world transform as it appears in config files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtrinsicConfig {
    pub translation: [f64; 3],
    /// Quaternion as `[x, y, z, w]`.
    pub rotation_xyzw: [f64; 4],
}

impl ExtrinsicConfig {
    pub fn to_isometry(&self) -> Result<Isometry3<f64>, ConfigError> {
        let [x, y, z, w] = self.rotation_xyzw;
        let q = Quaternion::new(w, x, y, z);
        if !(q.norm() > 1e-9 && q.norm().is_finite()) {
            return Err(ConfigError::Invalid {
                field: "rotation_xyzw",
                reason: "quaternion must be non-zero and finite".into(),
            });
        }
        let [tx, ty, tz] = self.translation;
        Ok(Isometry3::from_parts(
            Translation3::from(Vector3::new(tx, ty, tz)),
            UnitQuaternion::from_quaternion(q),
        ))
    }
}

/// Everything needed to stand up one estimator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistrationConfig {
    pub device_id: String,
    pub world_frame_id: String,
    pub parameters: Parameters,
    pub reference_to_world: ExtrinsicConfig,
}

impl RegistrationConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: RegistrationConfig = serde_json::from_str(json)?;
        config.parameters.validate()?;
        config.reference_to_world.to_isometry()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }
}
