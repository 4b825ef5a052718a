//! The append-only data file record codec.
//!
//! A data file is a sequence of records, each aligned to a 256-byte
//! boundary. The structure of a record is:
//!
//! - crc as little-endian u32; zero marks an invalid record and ends the
//!   file's valid prefix.
//! - tstamp as little-endian i32, the write time in Unix seconds.
//! - flag as little-endian i32; bit 0x00010000 means the value bytes are
//!   stored compressed.
//! - ver as little-endian i32; negative versions are tombstones.
//! - ksz and vsz as little-endian u32, the key and stored value lengths.
//! - Key and value as raw bytes.
//! - NUL padding up to the next 256-byte boundary.
//!
//! Rewrites preserve a record's stored bytes verbatim; compressed values
//! are decompressed only to fingerprint their contents.

use crate::errdata;
use crate::error::{Error, Result};
use crate::hash::content_hash;

use std::io::{Read, Write};
use std::path::Path;

/// The fixed record header size in bytes.
pub const HEADER_SIZE: u32 = 24;

/// Record alignment. Record start offsets are always multiples of this,
/// which is what lets hint records store a 24-bit offset.
pub const RECORD_ALIGN: u32 = 256;

/// Flag bit marking a compressed value.
pub const FLAG_COMPRESSED: i32 = 0x0001_0000;

/// A single data file record.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    /// Byte offset of the record header in its data file.
    pub datapos: u32,
    /// Non-zero for valid records.
    pub crc: u32,
    /// Write time in Unix seconds.
    pub tstamp: i32,
    /// Flag bitfield, see [`FLAG_COMPRESSED`].
    pub flag: i32,
    /// Version; negative marks a tombstone.
    pub ver: i32,
    pub key: Vec<u8>,
    /// Value bytes as stored on disk, possibly compressed.
    pub value: Vec<u8>,
    /// Content hash of the logical (decompressed) value.
    pub hash: u32,
}

/// Returns the padding needed to align a record of the given size.
fn padding(size: u32) -> u32 {
    (RECORD_ALIGN - size % RECORD_ALIGN) % RECORD_ALIGN
}

impl Record {
    /// Builds a new record, filling in the crc. The value is stored as
    /// given, uncompressed.
    pub fn new(key: &[u8], value: &[u8], ver: i32, tstamp: i32) -> Self {
        Self::build(key, value.to_vec(), ver, tstamp, 0, content_hash(value))
    }

    /// Builds a new record with the value stored compressed.
    pub fn new_compressed(key: &[u8], value: &[u8], ver: i32, tstamp: i32) -> Self {
        let stored = lz4_flex::compress_prepend_size(value);
        Self::build(key, stored, ver, tstamp, FLAG_COMPRESSED, content_hash(value))
    }

    /// Builds a tombstone record marking the key as deleted. Tombstone
    /// versions are negative.
    pub fn tombstone(key: &[u8], ver: i32, tstamp: i32) -> Self {
        debug_assert!(ver < 0, "tombstone version must be negative");
        Self::build(key, Vec::new(), ver, tstamp, 0, content_hash(&[]))
    }

    fn build(key: &[u8], value: Vec<u8>, ver: i32, tstamp: i32, flag: i32, hash: u32) -> Self {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&tstamp.to_le_bytes());
        hasher.update(&flag.to_le_bytes());
        hasher.update(&ver.to_le_bytes());
        hasher.update(&(key.len() as u32).to_le_bytes());
        hasher.update(&(value.len() as u32).to_le_bytes());
        hasher.update(key);
        hasher.update(&value);
        // A zero crc would read back as an invalid record.
        let crc = hasher.finalize().max(1);
        Self { datapos: 0, crc, tstamp, flag, ver, key: key.to_vec(), value, hash }
    }

    /// The record's total on-disk size including padding.
    pub fn aligned_size(&self) -> u64 {
        let size = HEADER_SIZE + self.key.len() as u32 + self.value.len() as u32;
        (size + padding(size)) as u64
    }

    /// True if this record marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.ver < 0
    }

    /// Reads the record starting at `pos`, which must be 256-aligned, and
    /// consumes it and its padding from the reader. Returns None for a zero
    /// crc, which ends the file's valid prefix. `file_len` bounds the record
    /// against truncated files.
    pub fn read_from(r: &mut impl Read, pos: u64, file_len: u64) -> Result<Option<Self>> {
        let mut header = [0u8; HEADER_SIZE as usize];
        r.read_exact(&mut header)?;
        let crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let tstamp = i32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let flag = i32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        let ver = i32::from_le_bytes([header[12], header[13], header[14], header[15]]);
        let ksz = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
        let vsz = u32::from_le_bytes([header[20], header[21], header[22], header[23]]);

        if crc == 0 {
            log::warn!("invalid record at position {pos}");
            return Ok(None);
        }

        let size = HEADER_SIZE as u64 + ksz as u64 + vsz as u64;
        if pos + size > file_len {
            return errdata!("record at position {pos} extends beyond end of file");
        }

        let mut key = vec![0; ksz as usize];
        r.read_exact(&mut key)?;
        let mut value = vec![0; vsz as usize];
        r.read_exact(&mut value)?;

        let pad = padding(size as u32) as usize;
        let mut padbuf = [0u8; RECORD_ALIGN as usize];
        r.read_exact(&mut padbuf[..pad])?;

        let hash = if flag & FLAG_COMPRESSED != 0 {
            content_hash(&lz4_flex::decompress_size_prepended(&value)?)
        } else {
            content_hash(&value)
        };
        let datapos = u32::try_from(pos)
            .map_err(|_| Error::InvalidData(format!("record position {pos} overflows 32 bits")))?;
        Ok(Some(Self { datapos, crc, tstamp, flag, ver, key, value, hash }))
    }

    /// Writes the record's stored bytes and padding, returning the aligned
    /// size written. The payload is passed through unchanged, never
    /// re-encoded.
    pub fn write_to(&self, w: &mut impl Write) -> Result<u64> {
        w.write_all(&self.crc.to_le_bytes())?;
        w.write_all(&self.tstamp.to_le_bytes())?;
        w.write_all(&self.flag.to_le_bytes())?;
        w.write_all(&self.ver.to_le_bytes())?;
        w.write_all(&(self.key.len() as u32).to_le_bytes())?;
        w.write_all(&(self.value.len() as u32).to_le_bytes())?;
        w.write_all(&self.key)?;
        w.write_all(&self.value)?;
        let size = HEADER_SIZE + self.key.len() as u32 + self.value.len() as u32;
        let pad = padding(size) as usize;
        w.write_all(&[0u8; RECORD_ALIGN as usize][..pad])?;
        Ok(self.aligned_size())
    }
}

/// Writes a sequence of records to a new data file, replacing any existing
/// file. Used by writers and the compactor self-test; the compactor itself
/// streams records through [`Record::write_to`].
pub fn write_data_file(path: &Path, records: &[Record]) -> Result<()> {
    use std::io::BufWriter;
    let file = std::fs::OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
    let mut w = BufWriter::new(file);
    for record in records {
        record.write_to(&mut w)?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    fn roundtrip(record: &Record) -> Record {
        let mut buf = Vec::new();
        let size = record.write_to(&mut buf).expect("write failed");
        assert_eq!(size as usize, buf.len());
        assert_eq!(buf.len() % RECORD_ALIGN as usize, 0);
        let mut r = std::io::Cursor::new(&buf);
        Record::read_from(&mut r, 0, buf.len() as u64)
            .expect("read failed")
            .expect("no record")
    }

    #[test]
    fn record_roundtrip() {
        let record = Record::new(b"key", b"value", 3, 1700000000);
        let decoded = roundtrip(&record);
        assert_eq!(decoded, record);
    }

    #[test]
    fn compressed_roundtrip_preserves_stored_bytes() {
        let value = vec![b'x'; 4000];
        let record = Record::new_compressed(b"key", &value, 1, 1700000000);
        assert_ne!(record.value, value);
        assert!(record.flag & FLAG_COMPRESSED != 0);
        let decoded = roundtrip(&record);
        // The stored (compressed) bytes survive unchanged, and the hash is
        // computed over the decompressed value.
        assert_eq!(decoded.value, record.value);
        assert_eq!(decoded.hash, content_hash(&value));
    }

    #[test]
    fn tombstone_is_tombstone() {
        let record = Record::tombstone(b"key", -1, 1700000000);
        assert!(record.is_tombstone());
        assert!(!Record::new(b"key", b"v", 1, 1700000000).is_tombstone());
    }

    #[test]
    fn zero_crc_reads_as_none() {
        let buf = vec![0u8; RECORD_ALIGN as usize];
        let mut r = std::io::Cursor::new(&buf);
        let result = Record::read_from(&mut r, 0, buf.len() as u64).expect("read failed");
        assert_eq!(result, None);
    }

    #[test]
    fn truncated_record_errors() {
        let record = Record::new(b"key", b"value", 1, 1700000000);
        let mut buf = Vec::new();
        record.write_to(&mut buf).expect("write failed");
        buf.truncate(30);
        let mut r = std::io::Cursor::new(&buf);
        assert!(Record::read_from(&mut r, 0, buf.len() as u64).is_err());
    }

    /// A file of several records must scan back with 256-aligned positions.
    #[test]
    fn positions_are_aligned() -> crate::error::Result<()> {
        let dir = tempfile::TempDir::with_prefix("beancask")?;
        let path = dir.path().join("000.data");
        let medium = vec![b'x'; 300];
        let records = vec![
            Record::new(b"a", b"1", 1, 1700000000),
            Record::new(b"b", &medium, 1, 1700000000),
            Record::new(b"c", b"3", 1, 1700000000),
        ];
        write_data_file(&path, &records)?;

        let file = std::fs::File::open(&path)?;
        let len = file.metadata()?.len();
        let mut r = BufReader::new(file);
        let mut pos = 0;
        let mut read = Vec::new();
        while pos < len {
            assert_eq!(pos % RECORD_ALIGN as u64, 0);
            let record = Record::read_from(&mut r, pos, len)?.expect("no record");
            assert_eq!(record.datapos as u64, pos);
            pos += record.aligned_size();
            read.push(record);
        }
        assert_eq!(read.len(), 3);
        assert_eq!(read[0].key, b"a");
        assert_eq!(read[1].value.len(), 300);
        Ok(())
    }

    /// The first record's exact byte layout: little-endian header, key,
    /// value, NUL padding.
    #[test]
    fn wire_layout() {
        let record = Record::new(b"k", b"v", 1, 2);
        let mut buf = Vec::new();
        record.write_to(&mut buf).expect("write failed");
        assert_eq!(buf.len(), 256);
        assert_eq!(hex::encode(&buf[..4]), hex::encode(record.crc.to_le_bytes()));
        assert_eq!(&buf[4..8], &2i32.to_le_bytes());
        assert_eq!(&buf[8..12], &0i32.to_le_bytes());
        assert_eq!(&buf[12..16], &1i32.to_le_bytes());
        assert_eq!(&buf[16..20], &1u32.to_le_bytes());
        assert_eq!(&buf[20..24], &1u32.to_le_bytes());
        assert_eq!(buf[24], b'k');
        assert_eq!(buf[25], b'v');
        assert!(buf[26..].iter().all(|&b| b == 0));
    }

    #[test]
    fn write_data_file_replaces() -> crate::error::Result<()> {
        let dir = tempfile::TempDir::with_prefix("beancask")?;
        let path = dir.path().join("000.data");
        write_data_file(&path, &[Record::new(b"a", b"1", 1, 0)])?;
        write_data_file(&path, &[Record::new(b"b", b"2", 1, 0)])?;
        assert_eq!(std::fs::metadata(&path)?.len(), 256);
        let mut r = BufReader::new(std::fs::File::open(&path)?);
        let record = Record::read_from(&mut r, 0, 256)?.expect("no record");
        assert_eq!(record.key, b"b");
        Ok(())
    }
}
