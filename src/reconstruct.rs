use crate::error::InputError;
use crate::types::{Correspondence, DepthMap, Intrinsics, Keypoint, ReconstructedPoint};

/// Back-projects every correspondence's reference pixel into the reference
/// camera frame. The output is index-aligned with `correspondences`.
///
/// Depth must already have been repaired, a zero sample here is an input error.
pub fn reconstruct(
    correspondences: &[Correspondence],
    source: &[Keypoint],
    reference: &[Keypoint],
    depth: &DepthMap,
    intrinsics: &Intrinsics,
) -> Result<Vec<ReconstructedPoint>, InputError> {
    let mut out = Vec::with_capacity(correspondences.len());

    for c in correspondences {
        // 1. look up depth at the integer pixel
        let (u, v) = reference[c.reference_idx].rounded();
        let z = depth
            .meters_at(u, v)
            .ok_or(InputError::MissingDepth { x: u, y: v })?;

        // 2. de-project
        let position = intrinsics.deproject(u as f64, v as f64, z);

        out.push(ReconstructedPoint {
            position,
            source_pixel: source[c.source_idx].pixel(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn intrinsics() -> Intrinsics {
        Intrinsics::new(640, 480, 525.0, 520.0, 320.0, 240.0).expect("intrinsics")
    }

    #[test]
    fn deprojection_round_trips_through_projection() {
        let k = intrinsics();
        let mut depth = DepthMap::zeros(640, 480);
        let pixels = [(100_i64, 50_i64, 1234_u16), (320, 240, 2000), (600, 400, 3550)];
        for &(x, y, d) in &pixels {
            depth.set(x, y, d);
        }
        let reference: Vec<Keypoint> = pixels
            .iter()
            .map(|&(x, y, _)| Keypoint::at(x as f32, y as f32))
            .collect();
        let source: Vec<Keypoint> = (0..3).map(|i| Keypoint::at(i as f32, 7.0)).collect();
        let corrs: Vec<_> = (0..3).map(|i| Correspondence::new(2 - i, i, 1.0)).collect();

        let points = reconstruct(&corrs, &source, &reference, &depth, &k).expect("points");
        assert_eq!(points.len(), corrs.len());
        for (i, p) in points.iter().enumerate() {
            let (x, y, d) = pixels[i];
            assert_relative_eq!(p.position.z, d as f64 / 1000.0);
            let back = k.project(&p.position).expect("in front");
            assert_relative_eq!(back.x, x as f64, epsilon = 1e-9);
            assert_relative_eq!(back.y, y as f64, epsilon = 1e-9);
            assert_eq!(p.source_pixel, source[2 - i].pixel());
        }
    }

    #[test]
    fn principal_point_lies_on_the_optical_axis() {
        let k = intrinsics();
        let mut depth = DepthMap::zeros(640, 480);
        depth.set(320, 240, 1500);
        let kp = vec![Keypoint::at(320.2, 239.8)];
        let points = reconstruct(&[Correspondence::new(0, 0, 0.0)], &kp, &kp, &depth, &k)
            .expect("points");
        assert_relative_eq!(points[0].position.x, 0.0);
        assert_relative_eq!(points[0].position.y, 0.0);
        assert_relative_eq!(points[0].position.z, 1.5);
    }

    #[test]
    fn zero_depth_is_an_input_error() {
        let depth = DepthMap::zeros(10, 10);
        let kp = vec![Keypoint::at(4.0, 5.0)];
        let err = reconstruct(&[Correspondence::new(0, 0, 0.0)], &kp, &kp, &depth, &intrinsics())
            .expect_err("missing depth");
        assert_eq!(err, InputError::MissingDepth { x: 4, y: 5 });
    }
}
