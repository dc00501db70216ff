//! Duplicate and ambiguous correspondence removal.
//!
//! A descriptor matcher without cross-checking happily links several nearby
//! source features to the same reference feature (or to several different
//! ones). Groups of source features closer than the merge distance are either
//! collapsed into a single correspondence, when their reference features agree,
//! or dropped entirely when they point at different places.

use itertools::Itertools;

use crate::config::Parameters;
use crate::error::InputError;
use crate::types::{Correspondence, Keypoint};

#[derive(Clone, Copy, Debug)]
pub struct MatchConsistencyResolver {
    match_distance_threshold: f32,
    merge_distance_px: f64,
}

impl MatchConsistencyResolver {
    pub fn new(match_distance_threshold: f32, merge_distance_px: f64) -> Self {
        Self {
            match_distance_threshold,
            merge_distance_px,
        }
    }

    pub fn from_parameters(params: &Parameters) -> Self {
        Self::new(
            params.match_distance_threshold,
            params.keypoint_merge_distance_px,
        )
    }

    /// Returns correspondences in their original order, with each source
    /// neighbourhood mapped to at most one reference location.
    pub fn resolve(
        &self,
        raw: &[Correspondence],
        source: &[Keypoint],
        reference: &[Keypoint],
    ) -> Result<Vec<Correspondence>, InputError> {
        check_indices(raw, source.len(), reference.len())?;

        let mut kept: Vec<Correspondence> = raw
            .iter()
            .filter(|c| c.distance <= self.match_distance_threshold)
            .copied()
            .collect();
        let mut discarded = vec![false; kept.len()];

        for i in 0..kept.len() {
            if discarded[i] {
                continue;
            }
            let anchor = &source[kept[i].source_idx];
            let group: Vec<usize> = (i..kept.len())
                .filter(|&j| !discarded[j])
                .filter(|&j| anchor.distance_to(&source[kept[j].source_idx]) <= self.merge_distance_px)
                .collect();
            if group.len() <= 1 {
                continue;
            }

            let consistent = group.iter().tuple_combinations().all(|(&a, &b)| {
                let ra = &reference[kept[a].reference_idx];
                let rb = &reference[kept[b].reference_idx];
                ra.distance_to(rb) <= self.merge_distance_px
            });

            if !consistent {
                for &j in &group {
                    discarded[j] = true;
                }
                continue;
            }

            let mean = group.iter().map(|&j| kept[j].distance).sum::<f32>() / group.len() as f32;
            kept[i].distance = mean;
            for &j in &group[1..] {
                discarded[j] = true;
            }
        }

        let resolved: Vec<Correspondence> = kept
            .into_iter()
            .zip(discarded)
            .filter_map(|(c, gone)| (!gone).then_some(c))
            .collect();

        tracing::debug!(
            raw = raw.len(),
            resolved = resolved.len(),
            "resolved correspondences"
        );
        Ok(resolved)
    }
}

pub(crate) fn check_indices(
    correspondences: &[Correspondence],
    source_len: usize,
    reference_len: usize,
) -> Result<(), InputError> {
    match correspondences
        .iter()
        .find(|c| c.source_idx >= source_len || c.reference_idx >= reference_len)
    {
        Some(bad) => Err(InputError::CorrespondenceOutOfRange {
            source_idx: bad.source_idx,
            source_len,
            reference_idx: bad.reference_idx,
            reference_len,
        }),
        None => Ok(()),
    }
}
