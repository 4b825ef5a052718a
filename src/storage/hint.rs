//! Hint file sidecars: a compressed index next to each data file, mapping
//! keys to their record offset, version, and a 16-bit content hash, so the
//! data file doesn't have to be rescanned to rebuild an index.
//!
//! A hint record is packed little-endian as:
//!
//! - One u32 word holding the record offset and the key size: offsets are
//!   256-aligned so their low 8 bits are zero, and the key size occupies
//!   them.
//! - ver as little-endian i32.
//! - The low 16 bits of the value's content hash as little-endian u16.
//! - The key bytes, followed by one NUL byte.
//!
//! A hint file is the compressed concatenation of its records.

use crate::errdata;
use crate::error::Result;

use std::path::{Path, PathBuf};

/// Hint file suffix, replacing a data file's `.data`.
pub const HINT_SUFFIX: &str = "hint.lz4";

/// Fixed hint record size excluding the key: word, ver, hash, NUL.
const FIXED_SIZE: usize = 4 + 4 + 2 + 1;

/// A single hint file entry.
#[derive(Clone, Debug, PartialEq)]
pub struct HintEntry {
    /// Byte offset of the record header in the data file. Always a
    /// multiple of 256.
    pub datapos: u32,
    pub ver: i32,
    /// Low 16 bits of the value's content hash.
    pub hash: u16,
    pub key: Vec<u8>,
}

/// Returns the hint file path for a data file: `X.data` becomes
/// `X.hint.lz4`.
pub fn hint_path(data_path: &Path) -> PathBuf {
    data_path.with_extension(HINT_SUFFIX)
}

/// Encodes and compresses hint entries into hint file contents.
pub fn encode(entries: &[HintEntry]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for entry in entries {
        if entry.key.is_empty() || entry.key.len() > 0xff {
            return errdata!("hint key length {} not in 1..=255", entry.key.len());
        }
        if entry.datapos & 0xff != 0 {
            return errdata!("hint record offset {} is not 256-aligned", entry.datapos);
        }
        let word = entry.datapos | entry.key.len() as u32;
        buf.extend_from_slice(&word.to_le_bytes());
        buf.extend_from_slice(&entry.ver.to_le_bytes());
        buf.extend_from_slice(&entry.hash.to_le_bytes());
        buf.extend_from_slice(&entry.key);
        buf.push(0);
    }
    Ok(lz4_flex::compress_prepend_size(&buf))
}

/// Decompresses and decodes hint file contents.
pub fn decode(data: &[u8]) -> Result<Vec<HintEntry>> {
    let buf = lz4_flex::decompress_size_prepended(data)?;
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        if pos + FIXED_SIZE > buf.len() {
            return errdata!("truncated hint record at offset {pos}");
        }
        let word = u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
        let ver = i32::from_le_bytes([buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]]);
        let hash = u16::from_le_bytes([buf[pos + 8], buf[pos + 9]]);
        let ksz = (word & 0xff) as usize;
        let datapos = word & !0xff;
        if ksz == 0 {
            return errdata!("zero key length in hint record at offset {pos}");
        }
        if pos + FIXED_SIZE + ksz > buf.len() {
            return errdata!("truncated hint key at offset {pos}");
        }
        let key = buf[pos + 10..pos + 10 + ksz].to_vec();
        entries.push(HintEntry { datapos, ver, hash, key });
        pos += FIXED_SIZE + ksz;
    }
    Ok(entries)
}

/// Writes a hint file, replacing any existing file.
pub fn write_hint_file(path: &Path, entries: &[HintEntry]) -> Result<()> {
    std::fs::write(path, encode(entries)?)?;
    Ok(())
}

/// Reads and decodes a hint file.
pub fn read_hint_file(path: &Path) -> Result<Vec<HintEntry>> {
    decode(&std::fs::read(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<HintEntry> {
        vec![
            HintEntry { datapos: 0, ver: 1, hash: 0xbeef, key: b"alpha".to_vec() },
            HintEntry { datapos: 256, ver: -2, hash: 0x0001, key: b"beta".to_vec() },
            HintEntry { datapos: 0x0123_4500, ver: 7, hash: 0, key: vec![0xff; 255] },
        ]
    }

    #[test]
    fn roundtrip() {
        let entries = entries();
        let encoded = encode(&entries).expect("encode failed");
        assert_eq!(decode(&encoded).expect("decode failed"), entries);
    }

    /// The offset/keysize word packs the 256-aligned offset into the upper
    /// 24 bits, with the key size in the low 8.
    #[test]
    fn word_packing() {
        let entry = HintEntry { datapos: 0x0123_4500, ver: 1, hash: 2, key: b"abc".to_vec() };
        let encoded = encode(&[entry]).expect("encode failed");
        let raw = lz4_flex::decompress_size_prepended(&encoded).expect("decompress failed");
        assert_eq!(&raw[..4], &0x0123_4503u32.to_le_bytes());
        assert_eq!(&raw[4..8], &1i32.to_le_bytes());
        assert_eq!(&raw[8..10], &2u16.to_le_bytes());
        assert_eq!(&raw[10..13], b"abc");
        assert_eq!(raw[13], 0);
        assert_eq!(raw.len(), 14);
    }

    #[test]
    fn unaligned_offset_rejected() {
        let entry = HintEntry { datapos: 100, ver: 1, hash: 0, key: b"k".to_vec() };
        assert!(encode(&[entry]).is_err());
    }

    #[test]
    fn oversized_key_rejected() {
        let entry = HintEntry { datapos: 0, ver: 1, hash: 0, key: vec![b'k'; 256] };
        assert!(encode(&[entry]).is_err());
    }

    #[test]
    fn truncated_hint_rejected() {
        let encoded = encode(&entries()).expect("encode failed");
        let mut raw = lz4_flex::decompress_size_prepended(&encoded).expect("decompress failed");
        raw.pop();
        let reencoded = lz4_flex::compress_prepend_size(&raw);
        assert!(decode(&reencoded).is_err());
    }

    #[test]
    fn hint_path_replaces_data_suffix() {
        assert_eq!(
            hint_path(Path::new("/var/db/016.data")),
            PathBuf::from("/var/db/016.hint.lz4")
        );
    }

    #[test]
    fn file_roundtrip() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("beancask")?;
        let path = dir.path().join("000.hint.lz4");
        let entries = entries();
        write_hint_file(&path, &entries)?;
        assert_eq!(read_hint_file(&path)?, entries);
        Ok(())
    }
}
