use crate::types::{Correspondence, DepthMap, Keypoint};

/// Width of the ring searched for the foreground depth once the nearest valid
/// sample is known.
pub const RING_WIDTH_PX: f64 = 10.0;

/// Fills holes in the reference depth map at matched keypoints.
///
/// Structured-light and stereo sensors leave zeros along object edges, which is
/// where keypoints like to sit. The repaired value is the lowest (nearest to the
/// camera) sample in a thin ring around the closest valid pixel, so an edge
/// keypoint takes the depth of the foreground object rather than the wall
/// behind it.
#[derive(Clone, Copy, Debug)]
pub struct DepthRepairer {
    search_radius_px: f64,
}

impl DepthRepairer {
    pub fn new(search_radius_px: f64) -> Self {
        Self { search_radius_px }
    }

    /// Repairs the depth at every correspondence's reference pixel in place and
    /// returns the correspondences that ended up with a valid sample, in order.
    /// Indices must already be validated against `reference`.
    pub fn repair(
        &self,
        correspondences: &[Correspondence],
        reference: &[Keypoint],
        depth: &mut DepthMap,
    ) -> Vec<Correspondence> {
        let kept: Vec<Correspondence> = correspondences
            .iter()
            .filter(|c| {
                let (x, y) = reference[c.reference_idx].rounded();
                self.repair_pixel(depth, x, y).is_some()
            })
            .copied()
            .collect();
        tracing::debug!(
            input = correspondences.len(),
            kept = kept.len(),
            "depth repair"
        );
        kept
    }

    /// Writes the repaired depth into `(x, y)` and returns it, or `None` when
    /// there is no valid sample strictly inside the search radius.
    pub fn repair_pixel(&self, depth: &mut DepthMap, x: i64, y: i64) -> Option<u16> {
        if !depth.contains(x, y) {
            return None;
        }
        let nearest_d2 = nearest_nonzero_d2(depth, x, y, self.search_radius_px)?;
        let value = lowest_nonzero_in_ring(depth, x, y, nearest_d2)?;
        depth.set(x, y, value);
        Some(value)
    }
}

/// Integer pixel window `[lo, hi]` around `c` clipped to `[0, len)`.
fn window(c: i64, radius: f64, len: usize) -> Option<(i64, i64)> {
    let r = radius.floor() as i64;
    let lo = (c - r).max(0);
    let hi = (c + r).min(len as i64 - 1);
    (lo <= hi).then_some((lo, hi))
}

/// Squared distance to the closest valid sample, scanning row-major.
fn nearest_nonzero_d2(depth: &DepthMap, x: i64, y: i64, radius: f64) -> Option<i64> {
    let r2 = radius * radius;
    let (x0, x1) = window(x, radius, depth.width())?;
    let (y0, y1) = window(y, radius, depth.height())?;
    let mut best: Option<i64> = None;
    for v in y0..=y1 {
        for u in x0..=x1 {
            let d2 = (u - x).pow(2) + (v - y).pow(2);
            if d2 as f64 >= r2 {
                continue;
            }
            if matches!(depth.get(u, v), Some(0) | None) {
                continue;
            }
            if best.map_or(true, |b| d2 < b) {
                best = Some(d2);
            }
        }
    }
    best
}

/// Lowest valid sample with `d0 <= distance <= d0 + RING_WIDTH_PX`, where
/// `d0² = inner_d2`. The inner bound is compared in integers so the sample
/// that defined `d0` is always inside the ring.
fn lowest_nonzero_in_ring(depth: &DepthMap, x: i64, y: i64, inner_d2: i64) -> Option<u16> {
    let outer = (inner_d2 as f64).sqrt() + RING_WIDTH_PX;
    let outer2 = outer * outer;
    let (x0, x1) = window(x, outer, depth.width())?;
    let (y0, y1) = window(y, outer, depth.height())?;
    let mut lowest: Option<u16> = None;
    for v in y0..=y1 {
        for u in x0..=x1 {
            let d2 = (u - x).pow(2) + (v - y).pow(2);
            if d2 < inner_d2 || d2 as f64 > outer2 {
                continue;
            }
            match depth.get(u, v) {
                Some(0) | None => {}
                Some(value) => {
                    if lowest.map_or(true, |l| value < l) {
                        lowest = Some(value);
                    }
                }
            }
        }
    }
    lowest
}
