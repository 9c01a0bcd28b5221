use std::io::{Error as IoError, ErrorKind, Read};
use std::fmt::{Debug, Formatter, Result as FmtResult};

use thiserror::Error;

use super::{HEADER_SIZE, RecordType, WRITE_LOG_BLOCK_SIZE, unmask_checksum};


/// A reader for the block-framed log format.
///
/// Damaged fragments are skipped rather than failing the whole read: the reader keeps
/// scanning for the next intact record and collects the errors it saw, so that the caller
/// can decide whether a replayed log was clean.
pub(crate) struct WriteLogReader<File> {
    log_file:        File,
    /// Bytes of the current block. Shorter than [`WRITE_LOG_BLOCK_SIZE`] only at end of file.
    block:           Vec<u8>,
    offset_in_block: usize,
    reached_eof:     bool,
    errors:          Vec<LogReadError>,
}

impl<File: Read> WriteLogReader<File> {
    #[must_use]
    pub fn new(log_file: File) -> Self {
        Self {
            log_file,
            block:           Vec::new(),
            offset_in_block: 0,
            reached_eof:     false,
            errors:          Vec::new(),
        }
    }

    /// The errors encountered so far. Nonempty after replay means the log was damaged.
    #[must_use]
    pub fn errors(&self) -> &[LogReadError] {
        &self.errors
    }

    /// Read the next intact logical record.
    ///
    /// Returns `None` at end of file. An incomplete trailing record (a crashed writer's last
    /// append) is dropped silently, matching the durability contract: only synced data is
    /// guaranteed to survive.
    pub fn read_record(&mut self) -> Option<Vec<u8>> {
        let mut assembled: Option<Vec<u8>> = None;

        loop {
            let (record_type, fragment) = match self.read_physical_record() {
                PhysicalRecord::Fragment(record_type, fragment) => (record_type, fragment),
                PhysicalRecord::EndOfFile => return None,
                PhysicalRecord::Damaged => {
                    if assembled.take().is_some() {
                        self.errors.push(LogReadError::ErrorInFragmentedRecord);
                    }
                    continue;
                }
            };

            match record_type {
                RecordType::Full => {
                    if assembled.is_some() {
                        self.errors.push(LogReadError::FullInFragmentedRecord);
                    }
                    return Some(fragment);
                }
                RecordType::First => {
                    if assembled.is_some() {
                        self.errors.push(LogReadError::ExtraFirstInFragmentedRecord);
                    }
                    assembled = Some(fragment);
                }
                RecordType::Middle => {
                    if let Some(buffer) = assembled.as_mut() {
                        buffer.extend_from_slice(&fragment);
                    } else {
                        self.errors.push(LogReadError::MiddleWithoutFirst);
                    }
                }
                RecordType::Last => {
                    if let Some(mut buffer) = assembled.take() {
                        buffer.extend_from_slice(&fragment);
                        return Some(buffer);
                    } else {
                        self.errors.push(LogReadError::LastWithoutFirst);
                    }
                }
                RecordType::Zero => {
                    self.errors.push(LogReadError::ZeroRecord);
                    assembled = None;
                }
            }
        }
    }

    fn read_physical_record(&mut self) -> PhysicalRecord {
        if self.offset_in_block + HEADER_SIZE > self.block.len() {
            // Skip any trailer (or incomplete header) bytes and read the next block.
            if !self.fill_block() {
                return PhysicalRecord::EndOfFile;
            }
            if self.offset_in_block + HEADER_SIZE > self.block.len() {
                return PhysicalRecord::EndOfFile;
            }
        }

        let header = &self.block[self.offset_in_block..];
        let masked_checksum = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
        let fragment_len = usize::from(u16::from_le_bytes(header[4..6].try_into().expect("2 bytes")));
        let raw_type = header[6];

        let len_with_header = HEADER_SIZE + fragment_len;
        let len_to_block_end = self.block.len() - self.offset_in_block;

        if len_with_header > WRITE_LOG_BLOCK_SIZE - self.offset_in_block {
            // The length field cannot be trusted; skip the rest of the block.
            self.errors.push(LogReadError::CorruptedRecordLength);
            self.offset_in_block = self.block.len();
            return PhysicalRecord::Damaged;
        }

        if len_with_header > len_to_block_end {
            // A truncated final fragment: the writer crashed before completing it.
            return PhysicalRecord::EndOfFile;
        }

        let Ok(record_type) = RecordType::try_from(raw_type) else {
            self.errors.push(LogReadError::UnknownRecordType(raw_type));
            self.offset_in_block = self.block.len();
            return PhysicalRecord::Damaged;
        };

        // The checksum covers the type byte and the payload.
        let checked = &header[6..len_with_header];
        if crc32c::crc32c(checked) != unmask_checksum(masked_checksum) {
            self.errors.push(LogReadError::ChecksumMismatch);
            self.offset_in_block = self.block.len();
            return PhysicalRecord::Damaged;
        }

        let fragment = header[HEADER_SIZE..len_with_header].to_vec();
        self.offset_in_block += len_with_header;
        PhysicalRecord::Fragment(record_type, fragment)
    }

    /// Read the next block. Returns false at end of file or on a read error.
    fn fill_block(&mut self) -> bool {
        if self.reached_eof {
            return false;
        }

        self.block.clear();
        self.block.resize(WRITE_LOG_BLOCK_SIZE, 0);
        self.offset_in_block = 0;

        let mut filled = 0_usize;
        while filled < WRITE_LOG_BLOCK_SIZE {
            match self.log_file.read(&mut self.block[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(io_err) if io_err.kind() == ErrorKind::Interrupted => {}
                Err(io_err) => {
                    self.errors.push(LogReadError::FileReadError(io_err));
                    self.block.clear();
                    self.reached_eof = true;
                    return false;
                }
            }
        }

        if filled < WRITE_LOG_BLOCK_SIZE {
            self.reached_eof = true;
        }
        self.block.truncate(filled);
        filled > 0
    }
}

impl<File> Debug for WriteLogReader<File> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("WriteLogReader")
            .field("log_file",        &"<File>")
            .field("block",           &format!("[{} bytes]", self.block.len()))
            .field("offset_in_block", &self.offset_in_block)
            .field("reached_eof",     &self.reached_eof)
            .field("errors",          &self.errors)
            .finish()
    }
}

#[derive(Debug)]
enum PhysicalRecord {
    Fragment(RecordType, Vec<u8>),
    EndOfFile,
    Damaged,
}

/// The ways reading the log format can go wrong. None are automatically recoverable;
/// dropping the affected record is the only reasonable response.
#[derive(Error, Debug)]
pub(crate) enum LogReadError {
    #[error("physical record checksum mismatch")]
    ChecksumMismatch,
    #[error("physical record header had corrupted length field")]
    CorruptedRecordLength,
    #[error("physical record header had unknown record type `{0}`")]
    UnknownRecordType(u8),
    #[error("a Full physical record occurred in a fragmented logical record")]
    FullInFragmentedRecord,
    #[error("an extra First physical record occurred in a fragmented logical record")]
    ExtraFirstInFragmentedRecord,
    #[error("a Middle physical record occurred outside a fragmented logical record")]
    MiddleWithoutFirst,
    #[error("a Last physical record occurred outside a fragmented logical record")]
    LastWithoutFirst,
    #[error("a Zero physical record was encountered")]
    ZeroRecord,
    #[error("failed to read a log file: {0}")]
    FileReadError(IoError),
    #[error("discarded a fragmented logical record due to a physical record error")]
    ErrorInFragmentedRecord,
}
