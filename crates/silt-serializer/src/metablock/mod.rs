//! The metablock ring: the durability anchor of the log-structured
//! serializer.
//!
//! A small set of extents near the start of the database file is reserved
//! for fixed-size, CRC-protected records. Commits advance through the slots
//! round-robin; recovery reads the ring and resumes from the valid record
//! with the highest version. Because every commit lands in a fresh slot, a
//! crash mid-write can only tear the slot being written - the previous
//! metablock is untouched and recovery falls back to it.

mod head;
mod manager;
mod record;

pub use head::{RingGeometry, METABLOCK_EXTENT_COUNT, METABLOCK_EXTENT_SEPARATION};
pub use manager::{MetablockManager, ReadCallback, WriteCallback};
pub use record::{record_len, CrcMetablock, MetablockPayload, RECORD_HEADER_LEN};
