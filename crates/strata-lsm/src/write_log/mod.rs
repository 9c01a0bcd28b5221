//! The checksummed, block-framed record log used by MANIFEST files.
//!
//! Records are split into physical fragments of at most one 32 KiB block, each carrying a
//! masked crc32c over its type byte and payload.

mod reader;
mod writer;

pub(crate) use self::{
    reader::{LogReadError, WriteLogReader},
    writer::{LogWriteError, WriteLogWriter},
};


/// The block size of the log format.
pub(crate) const WRITE_LOG_BLOCK_SIZE: usize = 1 << 15;

/// The header of each physical record: checksum, fragment length, record type.
pub(crate) const HEADER_SIZE: usize = size_of::<u32>() + size_of::<u16>() + size_of::<u8>();

const CHECKSUM_MASK_DELTA: u32 = 0xa282_ead8;

/// Mask a crc32c so that computing the checksum of data containing embedded checksums does
/// not degrade the crc.
#[inline]
#[must_use]
pub(crate) const fn mask_checksum(checksum: u32) -> u32 {
    (checksum.rotate_right(15)).wrapping_add(CHECKSUM_MASK_DELTA)
}

#[inline]
#[must_use]
pub(crate) const fn unmask_checksum(masked: u32) -> u32 {
    masked.wrapping_sub(CHECKSUM_MASK_DELTA).rotate_left(15)
}

/// The type byte of a physical record. Part of the persistent format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RecordType {
    /// Historical; produced by mmap-based writers that zero-filled blocks.
    Zero   = 0,
    Full   = 1,
    First  = 2,
    Middle = 3,
    Last   = 4,
}

impl RecordType {
    pub(crate) const ALL_TYPES: [Self; 5] =
        [Self::Zero, Self::Full, Self::First, Self::Middle, Self::Last];
}

impl From<RecordType> for u8 {
    #[inline]
    fn from(record_type: RecordType) -> Self {
        record_type as Self
    }
}

impl TryFrom<u8> for RecordType {
    type Error = ();

    #[inline]
    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::Zero),
            1 => Ok(Self::Full),
            2 => Ok(Self::First),
            3 => Ok(Self::Middle),
            4 => Ok(Self::Last),
            _ => Err(()),
        }
    }
}


#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;


    fn written_records(records: &[&[u8]]) -> Vec<u8> {
        let mut sink = TestSink::default();
        {
            let mut writer = WriteLogWriter::new_empty(&mut sink);
            for record in records {
                writer.add_record(record).unwrap();
            }
        }
        sink.0
    }

    #[derive(Debug, Default)]
    struct TestSink(Vec<u8>);

    impl crate::filesystem::WritableFile for &mut TestSink {
        fn append(&mut self, data: &[u8]) -> std::io::Result<()> {
            self.0.extend_from_slice(data);
            Ok(())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }

        fn sync_data(&mut self) -> std::io::Result<()> {
            Ok(())
        }

        fn close(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn checksum_masking_round_trips() {
        for checksum in [0, 1, 0xdead_beef, u32::MAX] {
            assert_eq!(unmask_checksum(mask_checksum(checksum)), checksum);
        }
    }

    #[test]
    fn records_round_trip() {
        let big = vec![0xab_u8; WRITE_LOG_BLOCK_SIZE * 2 + 17];
        let records: Vec<&[u8]> = vec![b"first record", b"", &big, b"tail"];
        let encoded = written_records(&records);

        let mut reader = WriteLogReader::new(Cursor::new(encoded));
        let mut decoded = Vec::new();
        while let Some(record) = reader.read_record() {
            decoded.push(record);
        }

        assert_eq!(decoded.len(), records.len());
        for (actual, expected) in decoded.iter().zip(records) {
            assert_eq!(actual.as_slice(), expected);
        }
        assert!(reader.errors().is_empty());
    }

    #[test]
    fn corrupt_fragment_is_dropped() {
        let mut encoded = written_records(&[b"one", b"two"]);
        // Flip a payload byte of the first record; its checksum no longer matches.
        encoded[HEADER_SIZE] ^= 0xff;

        let mut reader = WriteLogReader::new(Cursor::new(encoded));
        let mut decoded = Vec::new();
        while let Some(record) = reader.read_record() {
            decoded.push(record);
        }

        // The damaged block is skipped entirely; both records shared it.
        assert!(decoded.is_empty());
        assert!(!reader.errors().is_empty());
    }
}
