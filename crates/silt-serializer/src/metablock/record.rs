//! On-disk CRC record wrapping one metablock.
//!
//! Layout (little-endian, fixed size):
//!
//! | field     | size               |
//! |-----------|--------------------|
//! | `crc`     | 4 B                |
//! | `version` | 8 B                |
//! | `payload` | `M::ENCODED_LEN` B |
//!
//! The CRC covers `version || payload`, so a bit flip in the version field
//! cannot silently reorder recovery.

use byteorder::{ByteOrder, LittleEndian};

pub const RECORD_HEADER_LEN: usize = 12;

/// A metablock payload: a fixed-size blob owned by the serializer above
/// this layer. Encoding must fill exactly [`MetablockPayload::ENCODED_LEN`]
/// bytes; decoding must accept any byte pattern (the record CRC is the only
/// integrity check).
pub trait MetablockPayload: Clone + 'static {
    const ENCODED_LEN: usize;

    fn encode_into(&self, buf: &mut [u8]);

    fn decode(buf: &[u8]) -> Self;
}

/// Total on-disk size of one slot for payload type `M`.
pub fn record_len<M: MetablockPayload>() -> usize {
    RECORD_HEADER_LEN + M::ENCODED_LEN
}

#[derive(Debug, Clone)]
pub struct CrcMetablock<M> {
    pub version: u64,
    pub payload: M,
}

impl<M: MetablockPayload> CrcMetablock<M> {
    pub fn encode_into(&self, buf: &mut [u8]) {
        assert!(
            buf.len() >= record_len::<M>(),
            "metablock record buffer too small"
        );
        let (header, payload) = buf.split_at_mut(RECORD_HEADER_LEN);
        self.payload.encode_into(&mut payload[..M::ENCODED_LEN]);
        LittleEndian::write_u64(&mut header[4..12], self.version);
        let crc = record_crc(self.version, &payload[..M::ENCODED_LEN]);
        LittleEndian::write_u32(&mut header[0..4], crc);
    }

    /// Returns `None` on CRC mismatch. Torn and never-written slots are
    /// expected to fail this check; it is not an error.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < record_len::<M>() {
            return None;
        }
        let stored_crc = LittleEndian::read_u32(&buf[0..4]);
        let version = LittleEndian::read_u64(&buf[4..12]);
        let payload_bytes = &buf[RECORD_HEADER_LEN..record_len::<M>()];
        if stored_crc != record_crc(version, payload_bytes) {
            return None;
        }
        Some(Self {
            version,
            payload: M::decode(payload_bytes),
        })
    }
}

fn record_crc(version: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&version.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Blob([u8; 20]);

    impl MetablockPayload for Blob {
        const ENCODED_LEN: usize = 20;

        fn encode_into(&self, buf: &mut [u8]) {
            buf[..20].copy_from_slice(&self.0);
        }

        fn decode(buf: &[u8]) -> Self {
            let mut bytes = [0u8; 20];
            bytes.copy_from_slice(&buf[..20]);
            Self(bytes)
        }
    }

    fn record() -> CrcMetablock<Blob> {
        CrcMetablock {
            version: 7,
            payload: Blob([0x5a; 20]),
        }
    }

    #[test]
    fn roundtrip() {
        let mut buf = vec![0u8; record_len::<Blob>()];
        record().encode_into(&mut buf);
        let decoded = CrcMetablock::<Blob>::decode(&buf).expect("valid record");
        assert_eq!(decoded.version, 7);
        assert_eq!(decoded.payload, Blob([0x5a; 20]));
    }

    #[test]
    fn zeroed_slot_is_invalid() {
        let buf = vec![0u8; record_len::<Blob>()];
        assert!(CrcMetablock::<Blob>::decode(&buf).is_none());
    }

    #[test]
    fn payload_corruption_is_detected() {
        let mut buf = vec![0u8; record_len::<Blob>()];
        record().encode_into(&mut buf);
        buf[RECORD_HEADER_LEN + 3] ^= 0x01;
        assert!(CrcMetablock::<Blob>::decode(&buf).is_none());
    }

    #[test]
    fn version_corruption_is_detected() {
        // The version sits under the CRC, so a flipped version bit cannot
        // masquerade as a newer record.
        let mut buf = vec![0u8; record_len::<Blob>()];
        record().encode_into(&mut buf);
        buf[4] ^= 0x80;
        assert!(CrcMetablock::<Blob>::decode(&buf).is_none());
    }

    #[test]
    fn torn_tail_is_detected() {
        let mut buf = vec![0u8; record_len::<Blob>()];
        record().encode_into(&mut buf);
        let len = buf.len();
        buf[len - 4..].fill(0);
        assert!(CrcMetablock::<Blob>::decode(&buf).is_none());
    }
}
