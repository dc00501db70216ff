//! On-disk cycle log.
//!
//! Each record is framed as
//! `kind: u8 | timestamp_ns: i64 LE | len: u32 LE | source payload | len: u32 LE | reference payload | width: u32 LE | height: u32 LE | len: u32 LE | depth payload`.
//! Feature payloads are bincode compressed with snappy, the depth plane is raw
//! little-endian `u16` samples compressed with zstd.

mod reader;
mod writer;

pub use reader::CycleLogReader;
pub use writer::CycleLogWriter;

use thiserror::Error;

use crate::types::{ReferenceObservation, SourceObservation};

pub(crate) const KIND_CYCLE: u8 = 0;
pub(crate) const DEPTH_ZSTD_LEVEL: i32 = 3;

/// One recorded registration cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct CycleRecord {
    pub source: SourceObservation,
    pub reference: ReferenceObservation,
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("log encode: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("log decode: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("snappy: {0}")]
    Snap(#[from] snap::Error),
    #[error("unknown record kind {0}")]
    UnknownKind(u8),
    #[error("record too large for a u32 length: {0} bytes")]
    TooLarge(usize),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::SyntheticScene;

    #[test]
    fn reader_reads_what_writer_wrote() {
        let scene = SyntheticScene::new();
        let records: Vec<CycleRecord> = (0..3)
            .map(|t| CycleRecord {
                source: scene.source_observation(1_000 * t),
                reference: scene.reference_observation(),
            })
            .collect();

        let mut bytes = Vec::new();
        {
            let mut writer = CycleLogWriter::new(&mut bytes);
            for record in &records {
                writer.write(record).expect("write");
            }
            writer.flush().expect("flush");
        }

        let read: Vec<CycleRecord> = CycleLogReader::new(&bytes[..])
            .collect::<Result<_, _>>()
            .expect("read");
        assert_eq!(read, records);
    }

    #[test]
    fn truncated_log_reports_an_error() {
        let scene = SyntheticScene::new();
        let mut bytes = Vec::new();
        CycleLogWriter::new(&mut bytes)
            .write(&CycleRecord {
                source: scene.source_observation(1),
                reference: scene.reference_observation(),
            })
            .expect("write");
        bytes.truncate(bytes.len() - 5);

        let mut reader = CycleLogReader::new(&bytes[..]);
        assert!(matches!(reader.next(), Some(Err(_))));
    }

    #[test]
    fn unknown_record_kind_is_rejected() {
        let bytes = [7u8, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut reader = CycleLogReader::new(&bytes[..]);
        assert!(matches!(reader.next(), Some(Err(LogError::UnknownKind(7)))));
    }

    #[test]
    fn empty_log_has_no_records() {
        let mut reader = CycleLogReader::new(&[][..]);
        assert!(reader.next().is_none());
    }
}
