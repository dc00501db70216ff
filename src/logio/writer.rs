use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use snap::raw::Encoder;

use super::{CycleRecord, LogError, DEPTH_ZSTD_LEVEL, KIND_CYCLE};
use crate::types::DepthMap;

pub struct CycleLogWriter<W: Write> {
    inner: W,
    encoder: Encoder,
}

impl CycleLogWriter<BufWriter<File>> {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> CycleLogWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            encoder: Encoder::new(),
        }
    }

    pub fn write(&mut self, record: &CycleRecord) -> Result<(), LogError> {
        let config = bincode::config::standard();
        let source = bincode::encode_to_vec(&record.source, config)?;
        let reference = bincode::encode_to_vec(
            (&record.reference.features, &record.reference.intrinsics),
            config,
        )?;
        let source = self.encoder.compress_vec(&source)?;
        let reference = self.encoder.compress_vec(&reference)?;
        let depth = encode_depth(&record.reference.depth)?;

        self.inner.write_u8(KIND_CYCLE)?;
        self.inner
            .write_i64::<LittleEndian>(record.source.timestamp.as_nanos())?;
        write_chunk(&mut self.inner, &source)?;
        write_chunk(&mut self.inner, &reference)?;
        self.inner
            .write_u32::<LittleEndian>(to_u32(record.reference.depth.width())?)?;
        self.inner
            .write_u32::<LittleEndian>(to_u32(record.reference.depth.height())?)?;
        write_chunk(&mut self.inner, &depth)?;
        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn to_u32(n: usize) -> Result<u32, LogError> {
    u32::try_from(n).map_err(|_| LogError::TooLarge(n))
}

fn write_chunk<W: Write>(w: &mut W, payload: &[u8]) -> Result<(), LogError> {
    w.write_u32::<LittleEndian>(to_u32(payload.len())?)?;
    w.write_all(payload)?;
    Ok(())
}

fn encode_depth(depth: &DepthMap) -> Result<Vec<u8>, LogError> {
    let samples: Vec<u16> = depth.to_vec().into_iter().map(u16::to_le).collect();
    let bytes: &[u8] = bytemuck::cast_slice(&samples[..]);
    Ok(zstd::encode_all(bytes, DEPTH_ZSTD_LEVEL)?)
}
