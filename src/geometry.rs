use nalgebra::{Isometry3, Translation3, Vector3};

/// Inverse of a rigid transform: `R' = Rᵀ`, `t' = -Rᵀ t`.
///
/// Object→camera results from the solver go through here to become camera
/// poses, and previous camera poses come back through here to seed the solver.
pub fn invert_pose(pose: &Isometry3<f64>) -> Isometry3<f64> {
    let rotation = pose.rotation.inverse();
    let translation = -(rotation * pose.translation.vector);
    Isometry3::from_parts(Translation3::from(translation), rotation)
}

/// Angle in degrees between the optical (z) axis of a camera posed at
/// `camera_in_reference` and the optical axis of the reference camera.
pub fn optical_axis_deviation_deg(camera_in_reference: &Isometry3<f64>) -> f64 {
    let axis = camera_in_reference.rotation * Vector3::z();
    axis.dot(&Vector3::z()).clamp(-1.0, 1.0).acos().to_degrees()
}
