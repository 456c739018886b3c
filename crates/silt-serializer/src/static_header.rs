//! The static header block at offset 0 of the database file.
//!
//! One fixed-size block recording the on-disk format version and the
//! software that created the file. The metablock region begins after it. A
//! freshly created (zero-filled) device has no header yet and gets one
//! written during recovery.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{SerializerError, SerializerResult};

pub const STATIC_HEADER_LEN: usize = 4096;

/// Current on-disk format version.
pub const STATIC_HEADER_VERSION: u32 = 1;

const MAGIC: &[u8; 8] = b"siltser\0";
const SOFTWARE_TAG_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticHeader {
    pub format_version: u32,
    /// NUL-padded name and version of the software that formatted the file.
    pub software: [u8; SOFTWARE_TAG_LEN],
}

impl StaticHeader {
    pub fn current() -> Self {
        let mut software = [0u8; SOFTWARE_TAG_LEN];
        let tag = concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"));
        let len = tag.len().min(SOFTWARE_TAG_LEN);
        software[..len].copy_from_slice(&tag.as_bytes()[..len]);
        Self {
            format_version: STATIC_HEADER_VERSION,
            software,
        }
    }

    pub fn encode_into(&self, buf: &mut [u8]) {
        assert!(
            buf.len() >= STATIC_HEADER_LEN,
            "static header buffer too small"
        );
        buf[..STATIC_HEADER_LEN].fill(0);
        buf[0..8].copy_from_slice(MAGIC);
        LittleEndian::write_u32(&mut buf[8..12], self.format_version);
        buf[12..12 + SOFTWARE_TAG_LEN].copy_from_slice(&self.software);
    }

    /// `Ok(None)` means the block is still zeroed: a freshly created device
    /// that has never been formatted.
    pub fn decode(buf: &[u8]) -> SerializerResult<Option<Self>> {
        if buf.len() < STATIC_HEADER_LEN {
            return Err(SerializerError::corruption("static header truncated"));
        }
        if buf[..STATIC_HEADER_LEN].iter().all(|&byte| byte == 0) {
            return Ok(None);
        }
        if &buf[0..8] != MAGIC {
            return Err(SerializerError::corruption(
                "static header magic mismatch",
            ));
        }
        let format_version = LittleEndian::read_u32(&buf[8..12]);
        if format_version != STATIC_HEADER_VERSION {
            return Err(SerializerError::UnsupportedFormat(format_version));
        }
        let mut software = [0u8; SOFTWARE_TAG_LEN];
        software.copy_from_slice(&buf[12..12 + SOFTWARE_TAG_LEN]);
        Ok(Some(Self {
            format_version,
            software,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let header = StaticHeader::current();
        let mut buf = vec![0u8; STATIC_HEADER_LEN];
        header.encode_into(&mut buf);
        let decoded = StaticHeader::decode(&buf).expect("decode").expect("present");
        assert_eq!(decoded, header);
    }

    #[test]
    fn zeroed_block_reads_as_absent() {
        let buf = vec![0u8; STATIC_HEADER_LEN];
        assert!(StaticHeader::decode(&buf).expect("decode").is_none());
    }

    #[test]
    fn garbage_magic_is_corruption() {
        let mut buf = vec![0u8; STATIC_HEADER_LEN];
        buf[0..8].copy_from_slice(b"notsiltx");
        assert!(matches!(
            StaticHeader::decode(&buf),
            Err(SerializerError::Corruption(_))
        ));
    }

    #[test]
    fn future_format_version_is_refused() {
        let mut buf = vec![0u8; STATIC_HEADER_LEN];
        StaticHeader::current().encode_into(&mut buf);
        LittleEndian::write_u32(&mut buf[8..12], STATIC_HEADER_VERSION + 1);
        assert!(matches!(
            StaticHeader::decode(&buf),
            Err(SerializerError::UnsupportedFormat(v)) if v == STATIC_HEADER_VERSION + 1
        ));
    }
}
