use std::io::Error as IoError;
use std::fmt::{Debug, Formatter, Result as FmtResult};

use thiserror::Error;

use crate::filesystem::WritableFile;

use super::{HEADER_SIZE, RecordType, WRITE_LOG_BLOCK_SIZE, mask_checksum};


/// A writer for the block-framed log format, used for MANIFEST files.
pub(crate) struct WriteLogWriter<File> {
    log_file:        File,
    /// crc32c of each record type's single type byte, used to seed fragment checksums.
    type_checksums:  [u32; RecordType::ALL_TYPES.len()],
    /// The space remaining in the current block of [`WRITE_LOG_BLOCK_SIZE`] bytes.
    ///
    /// This stays in the range `1..=WRITE_LOG_BLOCK_SIZE`; `0` is immediately rolled over
    /// to a fresh block.
    remaining_space: usize,
}

impl<File: WritableFile> WriteLogWriter<File> {
    #[must_use]
    pub fn new_empty(log_file: File) -> Self {
        let type_checksums = RecordType::ALL_TYPES.map(|record_type| {
            crc32c::crc32c(&[u8::from(record_type)])
        });
        Self {
            log_file,
            type_checksums,
            remaining_space: WRITE_LOG_BLOCK_SIZE,
        }
    }

    /// Make everything written so far durable.
    pub fn sync_log_data(&mut self) -> Result<(), IoError> {
        self.log_file.sync_data()
    }

    /// A failure to add a record is fatal for further writes to this log; the database must
    /// go through recovery before the log can be trusted again.
    pub fn add_record(&mut self, record: &[u8]) -> Result<(), LogWriteError> {
        // This wrapper's sole task is to ensure that the buffer is flushed, so that
        // `inner_add_record` can have early returns without fear.
        let result = self.inner_add_record(record);
        let flush_result = self.log_file.flush();
        result.or(flush_result).map_err(LogWriteError)
    }

    fn inner_add_record(&mut self, mut record: &[u8]) -> Result<(), IoError> {
        let mut first_physical = true;
        let max_trailer = [0_u8; HEADER_SIZE - 1];

        // An empty record is written as a zero-length Full fragment; the reader handles it.
        while !record.is_empty() || first_physical {
            if let Some(trailer) = max_trailer.get(..self.remaining_space) {
                // Fewer than HEADER_SIZE bytes remain in this block: emit a zeroed trailer
                // and move to the next block.
                self.log_file.append(trailer)?;
                self.remaining_space = WRITE_LOG_BLOCK_SIZE;
            }

            let fragment_len = record.len().min(self.remaining_space - HEADER_SIZE);
            let last_physical = fragment_len == record.len();

            let record_type = match (first_physical, last_physical) {
                (true,  true)  => RecordType::Full,
                (true,  false) => RecordType::First,
                (false, false) => RecordType::Middle,
                (false, true)  => RecordType::Last,
            };

            let (fragment, remaining) = record.split_at(fragment_len);

            let checksum = crc32c::crc32c_append(self.checksum_for_type(record_type), fragment);
            let masked_checksum = mask_checksum(checksum);
            // `fragment_len < WRITE_LOG_BLOCK_SIZE == 1 << 15`, so it fits in two bytes.
            let fragment_len_u16 = fragment_len as u16;

            self.log_file.append(&masked_checksum.to_le_bytes())?;
            self.log_file.append(&fragment_len_u16.to_le_bytes())?;
            self.log_file.append(&[u8::from(record_type)])?;
            self.log_file.append(fragment)?;

            record = remaining;
            first_physical = false;
            self.remaining_space -= HEADER_SIZE + fragment_len;
        }

        Ok(())
    }

    #[inline]
    #[must_use]
    fn checksum_for_type(&self, record_type: RecordType) -> u32 {
        self.type_checksums[u8::from(record_type) as usize]
    }
}

impl<File> Debug for WriteLogWriter<File> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("WriteLogWriter")
            .field("log_file",        &"<File>")
            .field("type_checksums",  &self.type_checksums)
            .field("remaining_space", &self.remaining_space)
            .finish()
    }
}

/// A MANIFEST log could not be written to.
///
/// Partial fragment data may now be sitting in the file, so no further records may be
/// appended; the database must be closed and recovered before writes are permissible again.
#[derive(Error, Debug)]
#[repr(transparent)]
#[error("fatal error writing a log record: {0}")]
pub(crate) struct LogWriteError(pub IoError);
