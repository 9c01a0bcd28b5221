use std::cmp::Ordering;


// ================================================================
//  Key and entry formats
// ================================================================

/// A reference to a byte slice of user key data.
///
/// The engine never interprets user-key bytes; they are ordered bytewise.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct UserKey<'a>(pub &'a [u8]);

/// A possibly-valid encoding of an [`InternalKey`].
///
/// The referenced byte slice _should_ consist of user key data followed by 8 bytes: a
/// little-endian 64-bit integer whose most significant 56 bits hold the [`SequenceNumber`]
/// and whose least significant 8 bits hold the [`EntryType`].
///
/// This value must be validated; methods taking an `EncodedInternalKey` return a result.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct EncodedInternalKey<'a>(pub &'a [u8]);

impl<'a> EncodedInternalKey<'a> {
    fn split(self) -> Result<(UserKey<'a>, u64), ()> {
        let user_key_len = self.0.len()
            .checked_sub(8)
            .ok_or(())?;

        let (user_key, last_eight_bytes) = self.0.split_at(user_key_len);
        let last_eight_bytes: [u8; 8] = last_eight_bytes.try_into()
            .map_err(|_| ())?;

        Ok((
            UserKey(user_key),
            u64::from_le_bytes(last_eight_bytes),
        ))
    }
}

/// The type of an entry: a value write or a deletion tombstone.
///
/// The discriminants are part of the persistent format and must not be changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EntryType {
    Deletion = 0,
    Value    = 1,
}

impl EntryType {
    /// The greatest valid entry type, used when forming lookup keys: for a fixed user key and
    /// sequence number, `Value` sorts before `Deletion` under the internal comparator.
    pub(crate) const MAX_TYPE: Self = Self::Value;
}

impl TryFrom<u8> for EntryType {
    type Error = ();

    #[inline]
    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::Deletion),
            1 => Ok(Self::Value),
            _ => Err(()),
        }
    }
}

/// The sequence number of a write. Strictly increasing across all writes to one database.
///
/// Must fit in 56 bits so that it can share a `u64` with an [`EntryType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub const ZERO: Self = Self(0);
    pub const MAX:  Self = Self((1 << 56) - 1);

    #[inline]
    #[must_use]
    pub const fn new(sequence: u64) -> Option<Self> {
        if sequence <= Self::MAX.0 {
            Some(Self(sequence))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn inner(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        debug_assert!(self.0 < Self::MAX.0);
        Self(self.0 + 1)
    }
}

#[inline]
#[must_use]
pub(crate) const fn sequence_and_type_tag(sequence: SequenceNumber, entry_type: EntryType) -> u64 {
    (sequence.0 << 8) | (entry_type as u64)
}

/// A decoded internal key: user key plus the sequence/type tag.
#[derive(Debug, Clone, Copy)]
pub struct InternalKey<'a> {
    pub user_key:   UserKey<'a>,
    pub sequence:   SequenceNumber,
    pub entry_type: EntryType,
}

impl<'a> InternalKey<'a> {
    pub(crate) fn decode(key: EncodedInternalKey<'a>) -> Result<Self, ()> {
        let (user_key, tag) = key.split()?;

        let sequence = SequenceNumber(tag >> 8);
        let entry_type = EntryType::try_from((tag & 0xff) as u8)?;

        Ok(Self {
            user_key,
            sequence,
            entry_type,
        })
    }

    #[inline]
    #[must_use]
    pub(crate) fn tag(&self) -> u64 {
        sequence_and_type_tag(self.sequence, self.entry_type)
    }

    #[inline]
    #[must_use]
    pub const fn encoded_len(&self) -> usize {
        self.user_key.0.len() + 8
    }

    /// Extends the `output` buffer with the [`EncodedInternalKey`] slice corresponding to `self`.
    #[inline]
    pub(crate) fn append_encoded(&self, output: &mut Vec<u8>) {
        output.extend(self.user_key.0);
        output.extend(self.tag().to_le_bytes());
    }

    #[must_use]
    pub(crate) fn to_buf(self) -> InternalKeyBuf {
        InternalKeyBuf {
            user_key:   self.user_key.0.to_owned(),
            sequence:   self.sequence,
            entry_type: self.entry_type,
        }
    }
}

/// An owned internal key, used where key data must outlive the buffer it was decoded from
/// (file metadata bounds, compaction pointers, decoded manifest records).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKeyBuf {
    user_key:   Vec<u8>,
    sequence:   SequenceNumber,
    entry_type: EntryType,
}

impl InternalKeyBuf {
    #[must_use]
    pub fn new(user_key: Vec<u8>, sequence: SequenceNumber, entry_type: EntryType) -> Self {
        Self {
            user_key,
            sequence,
            entry_type,
        }
    }

    #[inline]
    #[must_use]
    pub fn as_key(&self) -> InternalKey<'_> {
        InternalKey {
            user_key:   UserKey(&self.user_key),
            sequence:   self.sequence,
            entry_type: self.entry_type,
        }
    }

    #[inline]
    #[must_use]
    pub fn user_key(&self) -> UserKey<'_> {
        UserKey(&self.user_key)
    }
}

// ================================================================
//  File numbers
// ================================================================

/// A globally unique 64-bit identifier assigned to every file the engine creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FileNumber(pub u64);

impl FileNumber {
    pub const ZERO: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        debug_assert!(self.0 < u64::MAX);
        Self(self.0 + 1)
    }
}

// ================================================================
//  Internal comparator
// ================================================================

/// Orders internal keys by user key ascending, then sequence number descending, then entry
/// type descending, so that for one user key the newest entry sorts first.
///
/// User keys are compared bytewise; the engine supports no other total order.
#[derive(Debug, Clone, Copy, Default)]
pub struct InternalComparator;

impl InternalComparator {
    /// The name persisted in the manifest. Recovery refuses a database whose manifest names
    /// a different comparator.
    pub const NAME: &'static str = "leveldb.BytewiseComparator";

    #[inline]
    #[must_use]
    pub fn cmp_user(&self, lhs: UserKey<'_>, rhs: UserKey<'_>) -> Ordering {
        lhs.0.cmp(rhs.0)
    }

    #[must_use]
    pub fn cmp_internal(&self, lhs: InternalKey<'_>, rhs: InternalKey<'_>) -> Ordering {
        self.cmp_user(lhs.user_key, rhs.user_key)
            .then_with(|| rhs.sequence.cmp(&lhs.sequence))
            .then_with(|| (rhs.entry_type as u8).cmp(&(lhs.entry_type as u8)))
    }
}


#[cfg(test)]
mod tests {
    use super::*;


    #[test]
    fn internal_key_round_trip() {
        let sequence = SequenceNumber::new((1 << 50) + 7).unwrap();
        let key = InternalKey {
            user_key:   UserKey(b"some user key"),
            sequence,
            entry_type: EntryType::Value,
        };

        let mut encoded = Vec::new();
        key.append_encoded(&mut encoded);
        assert_eq!(encoded.len(), key.encoded_len());

        let decoded = InternalKey::decode(EncodedInternalKey(&encoded)).unwrap();
        assert_eq!(decoded.user_key.0, b"some user key");
        assert_eq!(decoded.sequence, sequence);
        assert_eq!(decoded.entry_type, EntryType::Value);
    }

    #[test]
    fn decode_rejects_short_input() {
        assert!(InternalKey::decode(EncodedInternalKey(b"short")).is_err());
    }

    #[test]
    fn newer_entries_sort_first() {
        let cmp = InternalComparator;
        let old = InternalKey {
            user_key:   UserKey(b"k"),
            sequence:   SequenceNumber::new(5).unwrap(),
            entry_type: EntryType::Value,
        };
        let new = InternalKey {
            user_key:   UserKey(b"k"),
            sequence:   SequenceNumber::new(9).unwrap(),
            entry_type: EntryType::Value,
        };
        let other = InternalKey {
            user_key:   UserKey(b"l"),
            sequence:   SequenceNumber::ZERO,
            entry_type: EntryType::Deletion,
        };

        assert_eq!(cmp.cmp_internal(new, old), Ordering::Less);
        assert_eq!(cmp.cmp_internal(old, other), Ordering::Less);
    }
}
