use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{DepthMap, Descriptor, Keypoint};

const SNAPSHOT_ZSTD_LEVEL: i32 = 3;

/// A reference-camera feature remembered from an accepted cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct MemoryFeature {
    pub keypoint: Keypoint,
    pub descriptor: Descriptor,
    /// Distance from the registered device to the point, in meters.
    pub observer_distance_m: f64,
    /// Unit vector from the registered device towards the point, in the
    /// reference camera frame.
    pub observer_direction: [f64; 3],
    /// Depth sample the point was reconstructed from.
    pub raw_depth_mm: u16,
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("snapshot i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encode: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("snapshot decode: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Long-lived store of reference features that were part of accepted poses.
pub trait FeatureMemory {
    fn list_features(&self) -> Vec<MemoryFeature>;

    /// Drops features that something now stands in front of.
    fn retain_foreground(&mut self, depth: &DepthMap);

    fn append(&mut self, feature: MemoryFeature);
}

/// Bounded FIFO feature memory.
#[derive(Clone, Debug)]
pub struct InMemoryFeatureMemory {
    capacity: usize,
    occlusion_tolerance_mm: u16,
    features: VecDeque<MemoryFeature>,
}

impl InMemoryFeatureMemory {
    pub fn new(capacity: usize, occlusion_tolerance_mm: u16) -> Self {
        Self {
            capacity,
            occlusion_tolerance_mm,
            features: VecDeque::with_capacity(capacity.min(4096)),
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// bincode, then zstd.
    pub fn save_snapshot<W: Write>(&self, mut writer: W) -> Result<(), MemoryError> {
        let features: Vec<&MemoryFeature> = self.features.iter().collect();
        let encoded = bincode::encode_to_vec(&features, bincode::config::standard())?;
        let compressed = zstd::encode_all(&encoded[..], SNAPSHOT_ZSTD_LEVEL)?;
        writer.write_all(&compressed)?;
        writer.flush()?;
        Ok(())
    }

    /// Restores a snapshot. When it holds more than `capacity` features only
    /// the newest are kept.
    pub fn load_snapshot<R: Read>(
        reader: R,
        capacity: usize,
        occlusion_tolerance_mm: u16,
    ) -> Result<Self, MemoryError> {
        let decompressed = zstd::decode_all(reader)?;
        let (features, _): (Vec<MemoryFeature>, usize) =
            bincode::decode_from_slice(&decompressed, bincode::config::standard())?;
        let mut memory = Self::new(capacity, occlusion_tolerance_mm);
        for feature in features {
            memory.append(feature);
        }
        Ok(memory)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), MemoryError> {
        self.save_snapshot(BufWriter::new(File::create(path)?))
    }

    pub fn load_from_path(
        path: &Path,
        capacity: usize,
        occlusion_tolerance_mm: u16,
    ) -> Result<Self, MemoryError> {
        Self::load_snapshot(
            BufReader::new(File::open(path)?),
            capacity,
            occlusion_tolerance_mm,
        )
    }
}

impl FeatureMemory for InMemoryFeatureMemory {
    fn list_features(&self) -> Vec<MemoryFeature> {
        self.features.iter().cloned().collect()
    }

    fn retain_foreground(&mut self, depth: &DepthMap) {
        let tolerance = self.occlusion_tolerance_mm;
        let before = self.features.len();
        self.features.retain(|f| {
            let (x, y) = f.keypoint.rounded();
            match depth.get(x, y) {
                Some(0) | None => true,
                Some(now) => now.saturating_add(tolerance) >= f.raw_depth_mm,
            }
        });
        let dropped = before - self.features.len();
        if dropped > 0 {
            tracing::debug!(dropped, kept = self.features.len(), "occluded memory features");
        }
    }

    fn append(&mut self, feature: MemoryFeature) {
        if self.capacity == 0 {
            return;
        }
        while self.features.len() >= self.capacity {
            self.features.pop_front();
        }
        self.features.push_back(feature);
    }
}
