use itertools::Itertools;

use crate::error::DetectError;
use crate::types::{Correspondence, Descriptor, FeatureSet, GrayImage};

/// Keypoint detection and description on the reference image.
pub trait FeatureDetector {
    fn detect(&mut self, image: &GrayImage) -> Result<FeatureSet, DetectError>;
}

/// Nearest-neighbour descriptor matching, one correspondence per query.
pub trait DescriptorMatcher {
    /// `query` descriptors become `source_idx`, `train` descriptors become
    /// `reference_idx`.
    fn match_descriptors(&self, query: &[Descriptor], train: &[Descriptor]) -> Vec<Correspondence>;
}

/// Exhaustive Hamming-distance matcher without cross-checking. Ties go to the
/// lowest train index.
#[derive(Clone, Copy, Debug, Default)]
pub struct BruteForceMatcher;

impl DescriptorMatcher for BruteForceMatcher {
    fn match_descriptors(&self, query: &[Descriptor], train: &[Descriptor]) -> Vec<Correspondence> {
        query
            .iter()
            .enumerate()
            .filter_map(|(qi, q)| {
                let distances: Vec<u32> = train.iter().map(|t| q.hamming(t)).collect();
                let best = distances.iter().position_min()?;
                Some(Correspondence::new(qi, best, distances[best] as f32))
            })
            .collect()
    }
}
