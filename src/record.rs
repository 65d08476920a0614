//! Fixed-width record layout and ordering.
//!
//! Every record is a `(key, value, weight, header)` tuple. The header packs
//! a tombstone flag in bit 0, a delete tag in bit 1, and the record's
//! within-memtable slot in the remaining bits; the slot acts as a tie-breaker
//! so records with equal key and value sort in insertion order. Records
//! compare by `(key, value, header)`. The weight is carried for
//! weight-proportional sampling and takes no part in identity or ordering.

use std::cmp::Ordering;
use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;

/// Record key type.
pub type Key = u64;

/// Record value type.
pub type Value = u64;

/// Header bit marking a tombstone.
pub const TOMBSTONE_FLAG: u32 = 0x1;

/// Header bit marking a delete-tagged record.
pub const DELETE_FLAG: u32 = 0x2;

/// Shift for the within-memtable slot stored in the header's upper bits.
pub const SLOT_SHIFT: u32 = 2;

/// Encoded length of one record on disk: key, value, weight, header.
pub const ENCODED_LEN: usize = 8 + 8 + 8 + 4;

/// A fixed-width record.
#[derive(Debug, Clone, Copy, Default)]
pub struct Record {
    pub key: Key,
    pub value: Value,
    pub weight: f64,
    pub header: u32,
}

impl Record {
    /// Create a live record with the given sampling weight.
    pub fn new(key: Key, value: Value, weight: f64) -> Self {
        Self {
            key,
            value,
            weight,
            header: 0,
        }
    }

    /// Create a tombstone for `(key, value)`. Tombstones carry no weight.
    pub fn tombstone(key: Key, value: Value) -> Self {
        Self {
            key,
            value,
            weight: 0.0,
            header: TOMBSTONE_FLAG,
        }
    }

    /// Return this record with the memtable slot packed into the header.
    pub fn with_slot(mut self, slot: u32) -> Self {
        self.header = (slot << SLOT_SHIFT) | (self.header & (TOMBSTONE_FLAG | DELETE_FLAG));
        self
    }

    /// Return this record with the slot bits masked off, keeping only the
    /// tombstone and delete flags. Applied when a record moves from the
    /// memtable into a run.
    pub fn strip_slot(mut self) -> Self {
        self.header &= TOMBSTONE_FLAG | DELETE_FLAG;
        self
    }

    /// Return this record with the delete tag set.
    pub fn tag_deleted(mut self) -> Self {
        self.header |= DELETE_FLAG;
        self
    }

    pub fn is_tombstone(&self) -> bool {
        self.header & TOMBSTONE_FLAG != 0
    }

    pub fn is_delete_tagged(&self) -> bool {
        self.header & DELETE_FLAG != 0
    }

    /// True if key and value both match. Flags are not compared, so a
    /// tombstone matches the record it shadows.
    pub fn matches(&self, key: Key, value: Value) -> bool {
        self.key == key && self.value == value
    }

    /// True if this record shadows the same `(key, value)` pair as `other`.
    pub fn matches_record(&self, other: &Record) -> bool {
        self.matches(other.key, other.value)
    }

    /// Write the fixed-width encoding.
    pub fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u64::<BigEndian>(self.key)?;
        writer.write_u64::<BigEndian>(self.value)?;
        writer.write_f64::<BigEndian>(self.weight)?;
        writer.write_u32::<BigEndian>(self.header)?;
        Ok(())
    }

    /// Read the fixed-width encoding.
    pub fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let key = reader.read_u64::<BigEndian>()?;
        let value = reader.read_u64::<BigEndian>()?;
        let weight = reader.read_f64::<BigEndian>()?;
        let header = reader.read_u32::<BigEndian>()?;
        Ok(Self {
            key,
            value,
            weight,
            header,
        })
    }
}

// Identity and ordering follow (key, value, header); the weight is payload.
impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.value == other.value && self.header == other.header
    }
}

impl Eq for Record {}

impl PartialOrd for Record {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Record {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then(self.value.cmp(&other.value))
            .then(self.header.cmp(&other.header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let rec = Record::new(1, 2, 1.0);
        assert!(!rec.is_tombstone());
        assert!(!rec.is_delete_tagged());

        let ts = Record::tombstone(1, 2);
        assert!(ts.is_tombstone());
        assert_eq!(ts.weight, 0.0);

        let tagged = rec.tag_deleted();
        assert!(tagged.is_delete_tagged());
        assert!(!tagged.is_tombstone());
    }

    #[test]
    fn test_slot_round_trip() {
        let rec = Record::tombstone(7, 9).with_slot(1234);
        assert!(rec.is_tombstone());
        assert_eq!(rec.header >> SLOT_SHIFT, 1234);

        let stripped = rec.strip_slot();
        assert_eq!(stripped.header, TOMBSTONE_FLAG);
        assert!(stripped.is_tombstone());
    }

    #[test]
    fn test_ordering() {
        let a = Record::new(1, 1, 1.0);
        let b = Record::new(1, 2, 1.0);
        let c = Record::new(2, 0, 1.0);
        assert!(a < b);
        assert!(b < c);

        // Same key and value: a live record sorts before its tombstone.
        let live = Record::new(5, 5, 1.0);
        let ts = Record::tombstone(5, 5);
        assert!(live < ts);

        // Slot bits order same-pair records by insertion position.
        let first = Record::new(5, 5, 1.0).with_slot(3);
        let second = Record::tombstone(5, 5).with_slot(8);
        assert!(first < second);
    }

    #[test]
    fn test_weight_is_not_identity() {
        let a = Record::new(1, 1, 1.0);
        let b = Record::new(1, 1, 99.0);
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), Ordering::Equal);
    }

    #[test]
    fn test_encode_decode() {
        let rec = Record::new(u64::MAX, 42, 2.5).tag_deleted();
        let mut buf = Vec::new();
        rec.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), ENCODED_LEN);

        let decoded = Record::decode(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, rec);
        assert_eq!(decoded.weight, 2.5);
    }

    #[test]
    fn test_matches() {
        let rec = Record::new(3, 4, 1.0);
        let ts = Record::tombstone(3, 4);
        assert!(ts.matches_record(&rec));
        assert!(!ts.matches(3, 5));
    }
}
