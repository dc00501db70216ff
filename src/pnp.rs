//! Robust perspective-n-point pose estimation.
//!
//! The pipeline only depends on the [`PnpSolver`] trait. [`RansacPnp`] is the
//! in-crate backend:
//! - minimal models come from a normalized DLT (6 points) or, for coplanar
//!   samples, a plane-to-image homography (4 points);
//! - the RANSAC loop stops early once the inlier ratio makes further sampling
//!   pointless at the requested confidence;
//! - the winning model is polished with Levenberg-Marquardt on its inliers.

use itertools::Itertools;
use nalgebra::{
    DMatrix, Isometry3, Matrix2x3, Matrix3, Matrix3x4, Matrix3x6, Matrix6, Point2, Point3,
    Rotation3, SymmetricEigen, Translation3, UnitQuaternion, Vector2, Vector3, Vector6,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;

use crate::config::Parameters;
use crate::types::Intrinsics;

/// Fewest correspondences any pose can be solved from.
pub const MIN_POINTS: usize = 4;

const DLT_SAMPLE: usize = 6;
const PLANAR_SAMPLE: usize = 4;
/// Eigenvalue ratio of the point scatter below which a direction is considered flat.
const FLATNESS_RATIO: f64 = 1e-5;
const LM_MAX_ITERATIONS: usize = 30;
const LM_INITIAL_LAMBDA: f64 = 1e-3;
const LM_MAX_LAMBDA: f64 = 1e8;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PnpError {
    #[error("pnp requires at least {required} points, got {actual}")]
    NotEnoughPoints { required: usize, actual: usize },
    #[error("{object} object points but {image} image points")]
    MismatchedLengths { object: usize, image: usize },
    #[error("ransac found no consensus pose")]
    NoConsensus,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RansacParams {
    pub iterations: usize,
    pub confidence: f64,
    pub reprojection_threshold_px: f64,
}

impl RansacParams {
    pub fn from_parameters(params: &Parameters) -> Self {
        Self {
            iterations: params.ransac_iterations,
            confidence: params.ransac_confidence,
            reprojection_threshold_px: params.ransac_reprojection_threshold_px,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PnpSolution {
    /// Maps object (reference-frame) points into the camera frame.
    pub object_to_camera: Isometry3<f64>,
    /// Sorted indices of the points consistent with `object_to_camera`.
    pub inliers: Vec<usize>,
    pub iterations: usize,
}

pub trait PnpSolver {
    /// Robustly estimates the object→camera transform.
    ///
    /// `seed` is a candidate object→camera transform, typically the previous
    /// frame's. Implementations must verify it against the current data.
    fn solve(
        &self,
        object: &[Point3<f64>],
        image: &[Point2<f64>],
        intrinsics: &Intrinsics,
        params: &RansacParams,
        seed: Option<&Isometry3<f64>>,
    ) -> Result<PnpSolution, PnpError>;
}

#[derive(Clone, Copy, Debug)]
pub struct RansacPnp {
    rng_seed: u64,
}

impl Default for RansacPnp {
    fn default() -> Self {
        Self::new()
    }
}

impl RansacPnp {
    pub fn new() -> Self {
        Self::with_seed(0x5EED)
    }

    pub fn with_seed(rng_seed: u64) -> Self {
        Self { rng_seed }
    }
}

impl PnpSolver for RansacPnp {
    fn solve(
        &self,
        object: &[Point3<f64>],
        image: &[Point2<f64>],
        intrinsics: &Intrinsics,
        params: &RansacParams,
        seed: Option<&Isometry3<f64>>,
    ) -> Result<PnpSolution, PnpError> {
        let n = object.len();
        if image.len() != n {
            return Err(PnpError::MismatchedLengths {
                object: n,
                image: image.len(),
            });
        }
        if n < MIN_POINTS {
            return Err(PnpError::NotEnoughPoints {
                required: MIN_POINTS,
                actual: n,
            });
        }

        let problem = Problem::new(object, image, intrinsics, params.reprojection_threshold_px);
        let sample_size = if n >= DLT_SAMPLE { DLT_SAMPLE } else { PLANAR_SAMPLE };
        let mut rng = StdRng::seed_from_u64(self.rng_seed);

        let mut best: Option<(Isometry3<f64>, Vec<usize>)> = None;
        if let Some(seed) = seed {
            let inliers = problem.inliers(seed);
            if inliers.len() >= MIN_POINTS {
                best = Some(problem.polish(*seed, inliers));
            } else {
                tracing::debug!(inliers = inliers.len(), "seed pose not supported by data");
            }
        }

        let ratio = |inliers: &[usize]| inliers.len() as f64 / n as f64;
        let mut needed = best.as_ref().map_or(usize::MAX, |(_, inliers)| {
            adaptive_iterations(params.confidence, ratio(inliers), sample_size)
        });

        let mut iterations = 0usize;
        while iterations < params.iterations.min(needed) {
            iterations += 1;
            let sample = rand::seq::index::sample(&mut rng, n, sample_size).into_vec();
            let Some(pose) = problem.fit_minimal(&sample) else {
                continue;
            };
            let inliers = problem.inliers(&pose);
            if inliers.len() > best.as_ref().map_or(0, |(_, b)| b.len()) {
                needed = adaptive_iterations(params.confidence, ratio(&inliers), sample_size);
                best = Some((pose, inliers));
            }
        }

        let (pose, inliers) = best.ok_or(PnpError::NoConsensus)?;
        if inliers.len() < MIN_POINTS {
            return Err(PnpError::NoConsensus);
        }
        let (object_to_camera, inliers) = problem.polish(pose, inliers);

        tracing::debug!(
            points = n,
            inliers = inliers.len(),
            iterations,
            "ransac pnp"
        );
        Ok(PnpSolution {
            object_to_camera,
            inliers,
            iterations,
        })
    }
}

/// Number of samples needed to draw one all-inlier sample with probability
/// `confidence`, given the current inlier ratio.
pub(crate) fn adaptive_iterations(confidence: f64, inlier_ratio: f64, sample_size: usize) -> usize {
    if inlier_ratio >= 1.0 {
        return 0;
    }
    let denom = (1.0 - inlier_ratio.powi(sample_size as i32)).ln();
    if !(denom < 0.0) {
        return usize::MAX;
    }
    let k = ((1.0 - confidence).ln() / denom).ceil();
    if k.is_finite() && k >= 0.0 {
        k as usize
    } else {
        usize::MAX
    }
}

struct Problem<'a> {
    object: &'a [Point3<f64>],
    image: &'a [Point2<f64>],
    normalized: Vec<Point2<f64>>,
    intrinsics: &'a Intrinsics,
    threshold_px: f64,
}

impl<'a> Problem<'a> {
    fn new(
        object: &'a [Point3<f64>],
        image: &'a [Point2<f64>],
        intrinsics: &'a Intrinsics,
        threshold_px: f64,
    ) -> Self {
        let normalized = image.iter().map(|p| intrinsics.normalize(p)).collect();
        Self {
            object,
            image,
            normalized,
            intrinsics,
            threshold_px,
        }
    }

    fn residual(&self, pose: &Isometry3<f64>, i: usize) -> Option<f64> {
        let projected = self.intrinsics.project(&(pose * self.object[i]))?;
        Some((projected - self.image[i]).norm())
    }

    fn inliers(&self, pose: &Isometry3<f64>) -> Vec<usize> {
        (0..self.object.len())
            .filter(|&i| {
                self.residual(pose, i)
                    .is_some_and(|err| err <= self.threshold_px)
            })
            .collect()
    }

    /// Refines on the inliers and keeps the result only if no inlier is lost.
    fn polish(&self, pose: Isometry3<f64>, inliers: Vec<usize>) -> (Isometry3<f64>, Vec<usize>) {
        let refined = self.refine(pose, &inliers);
        let refined_inliers = self.inliers(&refined);
        if refined_inliers.len() >= inliers.len() {
            (refined, refined_inliers)
        } else {
            (pose, inliers)
        }
    }

    fn fit_minimal(&self, sample: &[usize]) -> Option<Isometry3<f64>> {
        let points: Vec<Point3<f64>> = sample.iter().map(|&i| self.object[i]).collect();
        let rays: Vec<Point2<f64>> = sample.iter().map(|&i| self.normalized[i]).collect();
        let spread = Spread::of(&points)?;
        if spread.planar {
            planar_pose(&points, &rays, &spread)
        } else if points.len() >= DLT_SAMPLE {
            dlt_pose(&points, &rays)
        } else {
            // Too few points for the DLT: start from the best-fit plane and let
            // the sample itself pull the pose into place.
            let approx = planar_pose(&points, &rays, &spread)?;
            Some(self.refine(approx, sample))
        }
    }

    /// Sum of squared pixel residuals, `None` if any point is behind the camera.
    fn cost(&self, pose: &Isometry3<f64>, indices: &[usize]) -> Option<f64> {
        indices.iter().try_fold(0.0_f64, |acc, &i| {
            let err = self.residual(pose, i)?;
            Some(acc + err * err)
        })
    }

    fn normal_equations(
        &self,
        pose: &Isometry3<f64>,
        indices: &[usize],
    ) -> Option<(Matrix6<f64>, Vector6<f64>)> {
        let k = self.intrinsics;
        let mut h = Matrix6::zeros();
        let mut g = Vector6::zeros();
        for &i in indices {
            let pc = pose * self.object[i];
            if pc.z <= f64::EPSILON {
                return None;
            }
            let iz = 1.0 / pc.z;
            let r = Vector2::new(
                k.fx * pc.x * iz + k.ppx - self.image[i].x,
                k.fy * pc.y * iz + k.ppy - self.image[i].y,
            );
            let j_proj = Matrix2x3::new(
                k.fx * iz,
                0.0,
                -k.fx * pc.x * iz * iz,
                0.0,
                k.fy * iz,
                -k.fy * pc.y * iz * iz,
            );
            // Left-multiplied update: p' = exp(phi) p + rho.
            let mut j_pose = Matrix3x6::zeros();
            j_pose
                .fixed_view_mut::<3, 3>(0, 0)
                .copy_from(&Matrix3::identity());
            j_pose
                .fixed_view_mut::<3, 3>(0, 3)
                .copy_from(&(-pc.coords.cross_matrix()));
            let j = j_proj * j_pose;
            h += j.transpose() * j;
            g += j.transpose() * r;
        }
        Some((h, g))
    }

    /// Levenberg-Marquardt over se(3) on the given points.
    fn refine(&self, initial: Isometry3<f64>, indices: &[usize]) -> Isometry3<f64> {
        let Some(mut cost) = self.cost(&initial, indices) else {
            return initial;
        };
        let mut pose = initial;
        let mut lambda = LM_INITIAL_LAMBDA;

        for _ in 0..LM_MAX_ITERATIONS {
            let Some((h, g)) = self.normal_equations(&pose, indices) else {
                break;
            };
            let mut damped = h;
            for d in 0..6 {
                damped[(d, d)] += lambda * h[(d, d)].max(1e-9);
            }
            let Some(chol) = damped.cholesky() else {
                lambda *= 10.0;
                if lambda > LM_MAX_LAMBDA {
                    break;
                }
                continue;
            };
            let delta = chol.solve(&(-g));
            let step = Isometry3::new(
                delta.fixed_rows::<3>(0).into_owned(),
                delta.fixed_rows::<3>(3).into_owned(),
            );
            let candidate = step * pose;
            match self.cost(&candidate, indices) {
                Some(next) if next < cost => {
                    let gain = cost - next;
                    pose = candidate;
                    cost = next;
                    lambda = (lambda / 10.0).max(1e-12);
                    if gain <= 1e-12 * (1.0 + cost) || delta.norm() < 1e-12 {
                        break;
                    }
                }
                _ => {
                    lambda *= 10.0;
                    if lambda > LM_MAX_LAMBDA {
                        break;
                    }
                }
            }
        }
        pose
    }
}

/// Principal axes of a point sample.
struct Spread {
    centroid: Vector3<f64>,
    /// Columns: major axis, minor in-plane axis, plane normal. Right-handed.
    basis: Matrix3<f64>,
    planar: bool,
}

impl Spread {
    /// `None` for collinear or coincident samples, which fix no pose.
    fn of(points: &[Point3<f64>]) -> Option<Self> {
        let n = points.len() as f64;
        let centroid = points.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / n;
        let scatter = points.iter().fold(Matrix3::zeros(), |acc, p| {
            let d = p.coords - centroid;
            acc + d * d.transpose()
        });
        let eig = SymmetricEigen::new(scatter);
        let mut order = [0usize, 1, 2];
        order.sort_by(|&a, &b| eig.eigenvalues[a].total_cmp(&eig.eigenvalues[b]));
        let largest = eig.eigenvalues[order[2]];
        if !(largest > 0.0) || eig.eigenvalues[order[1]] / largest < FLATNESS_RATIO {
            return None;
        }
        let major: Vector3<f64> = eig.eigenvectors.column(order[2]).into_owned();
        let minor: Vector3<f64> = eig.eigenvectors.column(order[1]).into_owned();
        let normal = major.cross(&minor);
        Some(Self {
            centroid,
            basis: Matrix3::from_columns(&[major, minor, normal]),
            planar: eig.eigenvalues[order[0]].max(0.0) / largest < FLATNESS_RATIO,
        })
    }
}

fn isometry_from(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Isometry3<f64> {
    Isometry3::from_parts(
        Translation3::from(translation),
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation)),
    )
}

/// Closest rotation in the Frobenius sense.
fn nearest_rotation(m: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = m.svd(true, true);
    let mut u = svd.u?;
    let v_t = svd.v_t?;
    if (u * v_t).determinant() < 0.0 {
        u.column_mut(2).neg_mut();
    }
    Some(u * v_t)
}

/// Eigenvector of `AᵀA` with the smallest eigenvalue.
fn null_vector(a: &DMatrix<f64>) -> Option<Vec<f64>> {
    let eig = SymmetricEigen::new(a.transpose() * a);
    let min = eig
        .eigenvalues
        .iter()
        .position_min_by(|x, y| x.total_cmp(y))?;
    Some(eig.eigenvectors.column(min).iter().copied().collect())
}

/// Direct linear transform on normalized image rays, with the object points
/// centred and scaled first.
fn dlt_pose(points: &[Point3<f64>], rays: &[Point2<f64>]) -> Option<Isometry3<f64>> {
    let n = points.len();
    let centroid = points.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / n as f64;
    let mean_dist = points.iter().map(|p| (p.coords - centroid).norm()).sum::<f64>() / n as f64;
    if mean_dist <= 1e-12 {
        return None;
    }
    let s = 3f64.sqrt() / mean_dist;

    let mut a = DMatrix::<f64>::zeros(2 * n, 12);
    for (i, (p, ray)) in points.iter().zip(rays).enumerate() {
        let x = (p.coords - centroid) * s;
        let (u, v) = (ray.x, ray.y);
        for c in 0..3 {
            a[(2 * i, c)] = x[c];
            a[(2 * i, 8 + c)] = -u * x[c];
            a[(2 * i + 1, 4 + c)] = x[c];
            a[(2 * i + 1, 8 + c)] = -v * x[c];
        }
        a[(2 * i, 3)] = 1.0;
        a[(2 * i, 11)] = -u;
        a[(2 * i + 1, 7)] = 1.0;
        a[(2 * i + 1, 11)] = -v;
    }

    let p = null_vector(&a)?;
    let mut projection = Matrix3x4::from_row_slice(&p);
    if projection.fixed_view::<3, 3>(0, 0).into_owned().determinant() < 0.0 {
        projection = -projection;
    }
    // projection ~ alpha * [R / s | R c + t]
    let m: Matrix3<f64> = projection.fixed_view::<3, 3>(0, 0).into_owned();
    let scale = m.svd(false, false).singular_values.mean();
    if !(scale > 1e-12) {
        return None;
    }
    let rotation = nearest_rotation(&m)?;
    let alpha = scale * s;
    let translation = projection.column(3).into_owned() / alpha - rotation * centroid;
    Some(isometry_from(rotation, translation))
}

/// Pose from a plane-to-image homography, with the plane expressed in the
/// sample's own principal axes.
fn planar_pose(points: &[Point3<f64>], rays: &[Point2<f64>], spread: &Spread) -> Option<Isometry3<f64>> {
    let plane: Vec<[f64; 2]> = points
        .iter()
        .map(|p| {
            let q = spread.basis.transpose() * (p.coords - spread.centroid);
            [q.x, q.y]
        })
        .collect();
    let image: Vec<[f64; 2]> = rays.iter().map(|r| [r.x, r.y]).collect();
    let h = homography_dlt(&plane, &image)?;

    let (h1, h2, h3) = (
        h.column(0).into_owned(),
        h.column(1).into_owned(),
        h.column(2).into_owned(),
    );
    let lambda = 2.0 / (h1.norm() + h2.norm());
    if !lambda.is_finite() {
        return None;
    }
    // The plane origin is the sample centroid, which must sit in front of the camera.
    let sign = if h3.z < 0.0 { -lambda } else { lambda };
    let (r1, r2, t) = (h1 * sign, h2 * sign, h3 * sign);
    let r_plane = nearest_rotation(&Matrix3::from_columns(&[r1, r2, r1.cross(&r2)]))?;

    let rotation = r_plane * spread.basis.transpose();
    let translation = t - rotation * spread.centroid;
    Some(isometry_from(rotation, translation))
}

/// Similarity taking the centroid to the origin with mean distance √2.
fn hartley(points: &[[f64; 2]]) -> (Matrix3<f64>, Vec<[f64; 2]>) {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p[0]).sum::<f64>() / n;
    let cy = points.iter().map(|p| p[1]).sum::<f64>() / n;
    let mean = points
        .iter()
        .map(|p| ((p[0] - cx).powi(2) + (p[1] - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean > 1e-15 {
        std::f64::consts::SQRT_2 / mean
    } else {
        1.0
    };
    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let out = points
        .iter()
        .map(|p| [s * (p[0] - cx), s * (p[1] - cy)])
        .collect();
    (t, out)
}

fn homography_dlt(src: &[[f64; 2]], dst: &[[f64; 2]]) -> Option<Matrix3<f64>> {
    let n = src.len();
    if n < PLANAR_SAMPLE || dst.len() != n {
        return None;
    }
    let (t_src, src_n) = hartley(src);
    let (t_dst, dst_n) = hartley(dst);

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for i in 0..n {
        let [sx, sy] = src_n[i];
        let [dx, dy] = dst_n[i];
        a[(2 * i, 3)] = -sx;
        a[(2 * i, 4)] = -sy;
        a[(2 * i, 5)] = -1.0;
        a[(2 * i, 6)] = dy * sx;
        a[(2 * i, 7)] = dy * sy;
        a[(2 * i, 8)] = dy;

        a[(2 * i + 1, 0)] = sx;
        a[(2 * i + 1, 1)] = sy;
        a[(2 * i + 1, 2)] = 1.0;
        a[(2 * i + 1, 6)] = -dx * sx;
        a[(2 * i + 1, 7)] = -dx * sy;
        a[(2 * i + 1, 8)] = -dx;
    }

    let h = null_vector(&a)?;
    let h_n = Matrix3::from_row_slice(&h);
    let t_dst_inv = t_dst.try_inverse()?;
    Some(t_dst_inv * h_n * t_src)
}
