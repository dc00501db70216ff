use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use snap::raw::Decoder;

use super::{CycleRecord, LogError, KIND_CYCLE};
use crate::types::{DepthMap, FeatureSet, Intrinsics, ReferenceObservation, SourceObservation};

/// Iterates over the records of a cycle log. Stops cleanly at end of file and
/// yields an error for a truncated or corrupt record.
pub struct CycleLogReader<R: Read> {
    inner: R,
    decoder: Decoder,
    failed: bool,
}

impl CycleLogReader<BufReader<File>> {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: Read> CycleLogReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: Decoder::new(),
            failed: false,
        }
    }

    fn read_record(&mut self, kind: u8) -> Result<CycleRecord, LogError> {
        if kind != KIND_CYCLE {
            return Err(LogError::UnknownKind(kind));
        }
        let config = bincode::config::standard();
        let timestamp_ns = self.inner.read_i64::<LittleEndian>()?;

        let source = self.decoder.decompress_vec(&read_chunk(&mut self.inner)?)?;
        let (source, _): (SourceObservation, usize) = bincode::decode_from_slice(&source, config)?;
        if source.timestamp.as_nanos() != timestamp_ns {
            return Err(LogError::Corrupt(format!(
                "frame timestamp {timestamp_ns} does not match payload {}",
                source.timestamp.as_nanos()
            )));
        }

        let reference = self.decoder.decompress_vec(&read_chunk(&mut self.inner)?)?;
        let ((features, intrinsics), _): ((FeatureSet, Intrinsics), usize) =
            bincode::decode_from_slice(&reference, config)?;

        let width = self.inner.read_u32::<LittleEndian>()? as usize;
        let height = self.inner.read_u32::<LittleEndian>()? as usize;
        let depth = decode_depth(width, height, &read_chunk(&mut self.inner)?)?;

        Ok(CycleRecord {
            source,
            reference: ReferenceObservation {
                features,
                intrinsics,
                depth,
            },
        })
    }
}

impl<R: Read> Iterator for CycleLogReader<R> {
    type Item = Result<CycleRecord, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let kind = match self.inner.read_u8() {
            Ok(kind) => kind,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return None,
            Err(e) => {
                self.failed = true;
                return Some(Err(e.into()));
            }
        };
        let record = self.read_record(kind);
        self.failed = record.is_err();
        Some(record)
    }
}

fn read_chunk<R: Read>(r: &mut R) -> Result<Vec<u8>, LogError> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn decode_depth(width: usize, height: usize, payload: &[u8]) -> Result<DepthMap, LogError> {
    let bytes = zstd::decode_all(payload)?;
    let expected = width.saturating_mul(height);
    if bytes.len() != expected * 2 {
        return Err(LogError::Corrupt(format!(
            "depth plane {width}x{height} needs {} bytes, got {}",
            expected * 2,
            bytes.len()
        )));
    }
    let mut samples = vec![0u16; expected];
    bytemuck::cast_slice_mut::<u16, u8>(&mut samples).copy_from_slice(&bytes);
    for s in samples.iter_mut() {
        *s = u16::from_le(*s);
    }
    DepthMap::new(width, height, samples).map_err(|e| LogError::Corrupt(e.to_string()))
}
