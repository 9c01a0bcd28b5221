use std::collections::BTreeSet;

use integer_encoding::{VarInt as _, VarIntWriter as _};

use crate::{
    error::{Error, Result},
    format::{EncodedInternalKey, FileNumber, InternalKey, InternalKeyBuf, SequenceNumber},
    levels::{DeltaRing, LazyLevel, Level, LogicalLevel},
};


/// Tag numbers of the manifest record fields. These are written to disk and must not be
/// changed. Tag 8 is reserved (it once carried large-value references).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum EditTag {
    Comparator       = 1,
    LogNumber        = 2,
    NextFileNumber   = 3,
    LastSequence     = 4,
    CompactPointer   = 5,
    DeletedFile      = 6,
    NewFile          = 7,
    PrevLogNumber    = 9,
    DeletedLazyFile  = 10,
    NewLazyFile      = 11,
    DeltaLevelOffset = 12,
}

impl TryFrom<u32> for EditTag {
    type Error = ();

    fn try_from(raw: u32) -> std::result::Result<Self, ()> {
        match raw {
            1  => Ok(Self::Comparator),
            2  => Ok(Self::LogNumber),
            3  => Ok(Self::NextFileNumber),
            4  => Ok(Self::LastSequence),
            5  => Ok(Self::CompactPointer),
            6  => Ok(Self::DeletedFile),
            7  => Ok(Self::NewFile),
            9  => Ok(Self::PrevLogNumber),
            10 => Ok(Self::DeletedLazyFile),
            11 => Ok(Self::NewLazyFile),
            12 => Ok(Self::DeltaLevelOffset),
            _  => Err(()),
        }
    }
}

/// A file added by an edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NewFileEntry {
    pub file_number: FileNumber,
    pub file_size:   u64,
    pub smallest:    InternalKeyBuf,
    pub largest:     InternalKeyBuf,
}

/// A delta to apply to a version: files added and deleted per level (both eager and lazy),
/// compaction pointer updates, log and sequence numbers, and the per-logical-level
/// delta-ring offsets.
///
/// Encoding is stable: the same edit always serialises to identical bytes.
#[derive(Debug, Default)]
pub(crate) struct VersionEdit {
    pub comparator_name:    Option<String>,
    pub log_number:         Option<FileNumber>,
    pub prev_log_number:    Option<FileNumber>,
    pub next_file_number:   Option<FileNumber>,
    pub last_sequence:      Option<SequenceNumber>,
    pub compact_pointers:   Vec<(Level, InternalKeyBuf)>,
    pub deleted_files:      BTreeSet<(Level, FileNumber)>,
    pub new_files:          Vec<(Level, NewFileEntry)>,
    pub deleted_lazy_files: BTreeSet<(LazyLevel, FileNumber)>,
    pub new_lazy_files:     Vec<(LazyLevel, NewFileEntry)>,
    /// Snapshot of every logical level's delta-ring offsets, in logical-level order.
    pub delta_offsets:      Vec<(LogicalLevel, DeltaRing)>,
}

impl VersionEdit {
    #[must_use]
    pub fn new_empty() -> Self {
        Self::default()
    }

    pub fn add_file(
        &mut self,
        level:       Level,
        file_number: FileNumber,
        file_size:   u64,
        smallest:    InternalKeyBuf,
        largest:     InternalKeyBuf,
    ) {
        self.new_files.push((level, NewFileEntry {
            file_number,
            file_size,
            smallest,
            largest,
        }));
    }

    pub fn delete_file(&mut self, level: Level, file_number: FileNumber) {
        self.deleted_files.insert((level, file_number));
    }

    pub fn add_lazy_file(
        &mut self,
        level:       LazyLevel,
        file_number: FileNumber,
        file_size:   u64,
        smallest:    InternalKeyBuf,
        largest:     InternalKeyBuf,
    ) {
        self.new_lazy_files.push((level, NewFileEntry {
            file_number,
            file_size,
            smallest,
            largest,
        }));
    }

    pub fn delete_lazy_file(&mut self, level: LazyLevel, file_number: FileNumber) {
        self.deleted_lazy_files.insert((level, file_number));
    }

    pub fn set_compact_pointer(&mut self, level: Level, key: InternalKeyBuf) {
        self.compact_pointers.push((level, key));
    }

    pub fn encode(&self, output: &mut Vec<u8>) {
        if let Some(comparator_name) = &self.comparator_name {
            write_tag(output, EditTag::Comparator);
            write_length_prefixed(output, comparator_name.as_bytes());
        }
        if let Some(log_number) = self.log_number {
            write_tag(output, EditTag::LogNumber);
            write_file_number(output, log_number);
        }
        if let Some(prev_log_number) = self.prev_log_number {
            write_tag(output, EditTag::PrevLogNumber);
            write_file_number(output, prev_log_number);
        }
        if let Some(next_file_number) = self.next_file_number {
            write_tag(output, EditTag::NextFileNumber);
            write_file_number(output, next_file_number);
        }
        if let Some(last_sequence) = self.last_sequence {
            write_tag(output, EditTag::LastSequence);
            write_varint_u64(output, last_sequence.inner());
        }
        for (level, key) in &self.compact_pointers {
            write_tag(output, EditTag::CompactPointer);
            write_varint_u32(output, u32::from(level.inner()));
            write_internal_key(output, key.as_key());
        }
        for (logical, ring) in &self.delta_offsets {
            let (start, clear, active) = ring.offsets();
            write_tag(output, EditTag::DeltaLevelOffset);
            write_varint_u32(output, u32::from(logical.inner()));
            write_varint_u32(output, start);
            write_varint_u32(output, clear);
            write_varint_u32(output, active);
        }
        for (level, file_number) in &self.deleted_files {
            write_tag(output, EditTag::DeletedFile);
            write_varint_u32(output, u32::from(level.inner()));
            write_file_number(output, *file_number);
        }
        for (level, file_number) in &self.deleted_lazy_files {
            write_tag(output, EditTag::DeletedLazyFile);
            write_varint_u32(output, level.raw());
            write_file_number(output, *file_number);
        }
        for (level, entry) in &self.new_files {
            write_tag(output, EditTag::NewFile);
            write_varint_u32(output, u32::from(level.inner()));
            write_new_file_entry(output, entry);
        }
        for (level, entry) in &self.new_lazy_files {
            write_tag(output, EditTag::NewLazyFile);
            write_varint_u32(output, level.raw());
            write_new_file_entry(output, entry);
        }
    }

    /// Decode one manifest record.
    ///
    /// `num_lazy_levels` bounds the lazy-level indices; a basic (non-hybrid) caller passes
    /// zero and any lazy field is rejected as corruption. Unknown tags are corruption.
    pub fn decode(mut input: &[u8], num_lazy_levels: usize) -> Result<Self> {
        let mut edit = Self::new_empty();

        while !input.is_empty() {
            let tag = read_varint_u32(&mut input, "field tag")?;
            let tag = EditTag::try_from(tag)
                .map_err(|()| Error::corruption(format!("unknown manifest tag {tag}")))?;

            match tag {
                EditTag::Comparator => {
                    let name = read_length_prefixed(&mut input, "comparator name")?;
                    let name = String::from_utf8(name.to_vec())
                        .map_err(|_| Error::corruption("comparator name is not UTF-8"))?;
                    edit.comparator_name = Some(name);
                }
                EditTag::LogNumber => {
                    edit.log_number = Some(read_file_number(&mut input, "log number")?);
                }
                EditTag::PrevLogNumber => {
                    edit.prev_log_number =
                        Some(read_file_number(&mut input, "previous log number")?);
                }
                EditTag::NextFileNumber => {
                    edit.next_file_number =
                        Some(read_file_number(&mut input, "next file number")?);
                }
                EditTag::LastSequence => {
                    let raw = read_varint_u64(&mut input, "last sequence")?;
                    let sequence = SequenceNumber::new(raw)
                        .ok_or_else(|| Error::corruption("last sequence out of range"))?;
                    edit.last_sequence = Some(sequence);
                }
                EditTag::CompactPointer => {
                    let level = read_level(&mut input, "compaction pointer")?;
                    let key = read_internal_key(&mut input, "compaction pointer")?;
                    edit.compact_pointers.push((level, key));
                }
                EditTag::DeltaLevelOffset => {
                    let logical = read_varint_u32(&mut input, "delta level offset")?;
                    let start = read_varint_u32(&mut input, "delta level offset")?;
                    let clear = read_varint_u32(&mut input, "delta level offset")?;
                    let active = read_varint_u32(&mut input, "delta level offset")?;

                    let logical = u8::try_from(logical)
                        .ok()
                        .filter(|&logical| logical < crate::levels::NUM_LEVELS / 2)
                        .map(LogicalLevel::new)
                        .ok_or_else(|| Error::corruption("delta offset logical level"))?;

                    let mut ring = DeltaRing::new();
                    ring.set_offsets(start, clear, active);
                    edit.delta_offsets.push((logical, ring));
                }
                EditTag::DeletedFile => {
                    let level = read_level(&mut input, "deleted file")?;
                    let file_number = read_file_number(&mut input, "deleted file")?;
                    edit.deleted_files.insert((level, file_number));
                }
                EditTag::DeletedLazyFile => {
                    let level = read_lazy_level(&mut input, num_lazy_levels, "deleted lazy file")?;
                    let file_number = read_file_number(&mut input, "deleted lazy file")?;
                    edit.deleted_lazy_files.insert((level, file_number));
                }
                EditTag::NewFile => {
                    let level = read_level(&mut input, "new-file entry")?;
                    let entry = read_new_file_entry(&mut input, "new-file entry")?;
                    edit.new_files.push((level, entry));
                }
                EditTag::NewLazyFile => {
                    let level = read_lazy_level(&mut input, num_lazy_levels, "new-lazy-file entry")?;
                    let entry = read_new_file_entry(&mut input, "new-lazy-file entry")?;
                    edit.new_lazy_files.push((level, entry));
                }
            }
        }

        Ok(edit)
    }
}

fn corruption(field: &str) -> Error {
    Error::corruption(format!("manifest record: bad {field}"))
}

fn read_varint_u32(input: &mut &[u8], field: &str) -> Result<u32> {
    let (num, num_len) = u32::decode_var(input).ok_or_else(|| corruption(field))?;
    *input = &input[num_len..];
    Ok(num)
}

fn write_varint_u32(output: &mut Vec<u8>, value: u32) {
    output.write_varint(value).expect("writing to a Vec does not fail");
}

fn read_varint_u64(input: &mut &[u8], field: &str) -> Result<u64> {
    let (num, num_len) = u64::decode_var(input).ok_or_else(|| corruption(field))?;
    *input = &input[num_len..];
    Ok(num)
}

fn write_varint_u64(output: &mut Vec<u8>, value: u64) {
    output.write_varint(value).expect("writing to a Vec does not fail");
}

fn read_length_prefixed<'a>(input: &mut &'a [u8], field: &str) -> Result<&'a [u8]> {
    let len = read_varint_u32(input, field)? as usize;
    if input.len() < len {
        return Err(corruption(field));
    }
    let (bytes, rest) = input.split_at(len);
    *input = rest;
    Ok(bytes)
}

fn write_length_prefixed(output: &mut Vec<u8>, bytes: &[u8]) {
    let len = u32::try_from(bytes.len()).expect("length-prefixed field exceeded 4 GiB");
    output.write_varint(len).expect("writing to a Vec does not fail");
    output.extend(bytes);
}

fn read_internal_key(input: &mut &[u8], field: &str) -> Result<InternalKeyBuf> {
    let encoded = read_length_prefixed(input, field)?;
    let key = InternalKey::decode(EncodedInternalKey(encoded))
        .map_err(|()| corruption(field))?;
    Ok(key.to_buf())
}

fn write_internal_key(output: &mut Vec<u8>, key: InternalKey<'_>) {
    let len = u32::try_from(key.encoded_len()).expect("internal key exceeded 4 GiB");
    output.write_varint(len).expect("writing to a Vec does not fail");
    key.append_encoded(output);
}

fn read_file_number(input: &mut &[u8], field: &str) -> Result<FileNumber> {
    read_varint_u64(input, field).map(FileNumber)
}

fn write_file_number(output: &mut Vec<u8>, file_number: FileNumber) {
    write_varint_u64(output, file_number.0);
}

fn read_level(input: &mut &[u8], field: &str) -> Result<Level> {
    let raw = read_varint_u32(input, field)?;
    Level::try_from(raw).map_err(|()| corruption(field))
}

fn read_lazy_level(input: &mut &[u8], num_lazy_levels: usize, field: &str) -> Result<LazyLevel> {
    let raw = read_varint_u32(input, field)?;
    LazyLevel::new(raw as usize, num_lazy_levels).ok_or_else(|| corruption(field))
}

fn read_new_file_entry(input: &mut &[u8], field: &str) -> Result<NewFileEntry> {
    let file_number = read_file_number(input, field)?;
    let file_size = read_varint_u64(input, field)?;
    let smallest = read_internal_key(input, field)?;
    let largest = read_internal_key(input, field)?;
    Ok(NewFileEntry {
        file_number,
        file_size,
        smallest,
        largest,
    })
}

fn write_new_file_entry(output: &mut Vec<u8>, entry: &NewFileEntry) {
    write_file_number(output, entry.file_number);
    write_varint_u64(output, entry.file_size);
    write_internal_key(output, entry.smallest.as_key());
    write_internal_key(output, entry.largest.as_key());
}

fn write_tag(output: &mut Vec<u8>, tag: EditTag) {
    write_varint_u32(output, tag as u32);
}
