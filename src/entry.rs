//! Log entry framing and typed payload codecs.
//!
//! Every entry is framed as `type: u8, length: u32 LE, payload[length]`.
//! Payload layouts:
//!
//! ```text
//! SegmentHeader: segment_id u64 | creation_ts u32 | segment_size u32
//! Object:        table_id u64 | timestamp u32 | key_len u16 | key | value
//! Tombstone:     table_id u64 | key_len u16 | key | segment_id u64 | timestamp u32
//! SegmentFooter: checksum u64
//! ```
//!
//! Entries are immutable once appended; these codecs are the only place the
//! byte layouts are known.

use bytes::Bytes;

/// Size of the per-entry frame: type byte plus little-endian length.
pub const ENTRY_HEADER_SIZE: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated input")]
    Truncated,

    #[error("unknown entry type: {0}")]
    UnknownType(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryType {
    /// First entry of every segment; identifies it on backups.
    SegmentHeader = 0,
    /// A key's current value.
    Object = 1,
    /// Asserts that a prior object with the same key is dead.
    Tombstone = 2,
    /// Last entry of a closed segment; carries the checksum.
    SegmentFooter = 3,
}

/// Number of entry types; sizes the per-type counter arrays.
pub const ENTRY_TYPE_COUNT: usize = 4;

impl EntryType {
    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Self::SegmentHeader),
            1 => Ok(Self::Object),
            2 => Ok(Self::Tombstone),
            3 => Ok(Self::SegmentFooter),
            other => Err(DecodeError::UnknownType(other)),
        }
    }

    /// Metadata entries belong to the segment itself and are never counted
    /// live or relocated.
    pub fn is_segment_metadata(self) -> bool {
        matches!(self, Self::SegmentHeader | Self::SegmentFooter)
    }
}

/// An object record: the current value for `(table_id, key)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub table_id: u64,
    /// Creation time in wall seconds; the disk cleaner sorts survivors by it.
    pub timestamp: u32,
    pub key: Bytes,
    pub value: Bytes,
}

impl Object {
    pub fn new(table_id: u64, key: impl Into<Bytes>, value: impl Into<Bytes>, timestamp: u32) -> Self {
        Self {
            table_id,
            timestamp,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        8 + 4 + 2 + self.key.len() + self.value.len()
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let key_len: u16 = self.key.len().try_into().expect("key too large to encode");
        buf.extend_from_slice(&self.table_id.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&key_len.to_le_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode(input: &[u8]) -> Result<Self, DecodeError> {
        if input.len() < 14 {
            return Err(DecodeError::Truncated);
        }
        let table_id = u64::from_le_bytes(input[0..8].try_into().unwrap());
        let timestamp = u32::from_le_bytes(input[8..12].try_into().unwrap());
        let key_len = u16::from_le_bytes(input[12..14].try_into().unwrap()) as usize;
        if input.len() < 14 + key_len {
            return Err(DecodeError::Truncated);
        }
        let key = Bytes::copy_from_slice(&input[14..14 + key_len]);
        let value = Bytes::copy_from_slice(&input[14 + key_len..]);
        Ok(Self {
            table_id,
            timestamp,
            key,
            value,
        })
    }
}

/// A tombstone: kills the prior object for `(table_id, key)` that lived in
/// `segment_id`. The tombstone itself stays live until that segment has been
/// cleaned off disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    pub table_id: u64,
    pub key: Bytes,
    /// Segment holding the object this tombstone kills.
    pub segment_id: u64,
    pub timestamp: u32,
}

impl Tombstone {
    pub fn new(table_id: u64, key: impl Into<Bytes>, segment_id: u64, timestamp: u32) -> Self {
        Self {
            table_id,
            key: key.into(),
            segment_id,
            timestamp,
        }
    }

    pub fn encoded_len(&self) -> usize {
        8 + 2 + self.key.len() + 8 + 4
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let key_len: u16 = self.key.len().try_into().expect("key too large to encode");
        buf.extend_from_slice(&self.table_id.to_le_bytes());
        buf.extend_from_slice(&key_len.to_le_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.segment_id.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode(input: &[u8]) -> Result<Self, DecodeError> {
        if input.len() < 10 {
            return Err(DecodeError::Truncated);
        }
        let table_id = u64::from_le_bytes(input[0..8].try_into().unwrap());
        let key_len = u16::from_le_bytes(input[8..10].try_into().unwrap()) as usize;
        if input.len() < 10 + key_len + 12 {
            return Err(DecodeError::Truncated);
        }
        let key = Bytes::copy_from_slice(&input[10..10 + key_len]);
        let rest = &input[10 + key_len..];
        let segment_id = u64::from_le_bytes(rest[0..8].try_into().unwrap());
        let timestamp = u32::from_le_bytes(rest[8..12].try_into().unwrap());
        Ok(Self {
            table_id,
            key,
            segment_id,
            timestamp,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub segment_id: u64,
    pub creation_ts: u32,
    pub segment_size: u32,
}

impl SegmentHeader {
    pub const ENCODED_LEN: usize = 16;

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.segment_id.to_le_bytes());
        buf.extend_from_slice(&self.creation_ts.to_le_bytes());
        buf.extend_from_slice(&self.segment_size.to_le_bytes());
    }

    pub fn decode(input: &[u8]) -> Result<Self, DecodeError> {
        if input.len() < Self::ENCODED_LEN {
            return Err(DecodeError::Truncated);
        }
        Ok(Self {
            segment_id: u64::from_le_bytes(input[0..8].try_into().unwrap()),
            creation_ts: u32::from_le_bytes(input[8..12].try_into().unwrap()),
            segment_size: u32::from_le_bytes(input[12..16].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentFooter {
    /// crc32c over all bytes from the start of the segment header entry
    /// through the start of this footer entry, zero-extended to 64 bits.
    pub checksum: u64,
}

impl SegmentFooter {
    pub const ENCODED_LEN: usize = 8;

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.checksum.to_le_bytes());
    }

    pub fn decode(input: &[u8]) -> Result<Self, DecodeError> {
        if input.len() < Self::ENCODED_LEN {
            return Err(DecodeError::Truncated);
        }
        Ok(Self {
            checksum: u64::from_le_bytes(input[0..8].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_roundtrip() {
        let obj = Object::new(7, Bytes::from_static(b"k"), Bytes::from_static(b"v"), 42);
        let enc = obj.encode_to_vec();
        assert_eq!(enc.len(), obj.encoded_len());
        assert_eq!(Object::decode(&enc).unwrap(), obj);
    }

    #[test]
    fn object_empty_value_roundtrip() {
        let obj = Object::new(1, Bytes::from_static(b"key"), Bytes::new(), 0);
        assert_eq!(Object::decode(&obj.encode_to_vec()).unwrap(), obj);
    }

    #[test]
    fn tombstone_roundtrip() {
        let tomb = Tombstone::new(7, Bytes::from_static(b"k"), 3, 99);
        let enc = tomb.encode_to_vec();
        assert_eq!(enc.len(), tomb.encoded_len());
        assert_eq!(Tombstone::decode(&enc).unwrap(), tomb);
    }

    #[test]
    fn truncated_payloads_fail() {
        let obj = Object::new(7, Bytes::from_static(b"key"), Bytes::from_static(b"v"), 0);
        let enc = obj.encode_to_vec();
        assert!(matches!(
            Object::decode(&enc[..13]),
            Err(DecodeError::Truncated)
        ));

        let tomb = Tombstone::new(7, Bytes::from_static(b"key"), 3, 0);
        let enc = tomb.encode_to_vec();
        assert!(matches!(
            Tombstone::decode(&enc[..enc.len() - 1]),
            Err(DecodeError::Truncated)
        ));
    }

    #[test]
    fn unknown_entry_type_rejected() {
        assert!(matches!(
            EntryType::from_u8(9),
            Err(DecodeError::UnknownType(9))
        ));
        assert_eq!(EntryType::from_u8(2).unwrap(), EntryType::Tombstone);
    }

    #[test]
    fn metadata_classification() {
        assert!(EntryType::SegmentHeader.is_segment_metadata());
        assert!(EntryType::SegmentFooter.is_segment_metadata());
        assert!(!EntryType::Object.is_segment_metadata());
        assert!(!EntryType::Tombstone.is_segment_metadata());
    }
}
