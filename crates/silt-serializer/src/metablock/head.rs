//! Ring geometry and the head cursor that walks it.

use crate::error::{SerializerError, SerializerResult};
use crate::static_header::STATIC_HEADER_LEN;

/// Number of extents in the metablock ring. Hard-coded: recovery must know
/// where to look before anything else is readable.
pub const METABLOCK_EXTENT_COUNT: u32 = 2;

/// Every `METABLOCK_EXTENT_SEPARATION`-th extent belongs to the ring, up to
/// [`METABLOCK_EXTENT_COUNT`] of them.
pub const METABLOCK_EXTENT_SEPARATION: u64 = 4;

/// Placement of the metablock ring inside the database file.
#[derive(Debug, Clone, Copy)]
pub struct RingGeometry {
    pub extent_size: u64,
    pub record_len: usize,
    pub static_header_len: u64,
}

impl RingGeometry {
    pub fn new(extent_size: u64, record_len: usize) -> Self {
        Self {
            extent_size,
            record_len,
            static_header_len: STATIC_HEADER_LEN as u64,
        }
    }

    pub fn validate(&self) -> SerializerResult<()> {
        if self.record_len == 0 {
            return Err(SerializerError::invalid_config(
                "metablock record length must be non-zero",
            ));
        }
        if self.extent_size < self.record_len as u64 {
            return Err(SerializerError::invalid_config(format!(
                "extent size {} cannot hold a single {}-byte metablock record",
                self.extent_size, self.record_len
            )));
        }
        Ok(())
    }

    pub fn slots_per_extent(&self) -> u32 {
        (self.extent_size / self.record_len as u64) as u32
    }

    pub fn total_slots(&self) -> u32 {
        METABLOCK_EXTENT_COUNT * self.slots_per_extent()
    }

    /// File offset of slot `slot` in ring extent `extent`.
    pub fn slot_offset(&self, extent: u32, slot: u32) -> u64 {
        self.static_header_len
            + u64::from(extent) * METABLOCK_EXTENT_SEPARATION * self.extent_size
            + u64::from(slot) * self.record_len as u64
    }

    /// End of the byte range the ring can ever touch; the file must be at
    /// least this large before the scan starts.
    pub fn region_end(&self) -> u64 {
        self.slot_offset(METABLOCK_EXTENT_COUNT - 1, self.slots_per_extent() - 1)
            + self.record_len as u64
    }
}

/// Cursor over the ring: which slot gets the next read or write. Carries a
/// single-level saved snapshot used during recovery to remember the last
/// slot whose CRC validated.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Head {
    extent: u32,
    slot: u32,
    saved_extent: u32,
    saved_slot: u32,
    /// Set once the cursor has advanced past the end of the region back to
    /// the first slot; only meaningful during the startup scan.
    pub(crate) wraparound: bool,
}

impl Head {
    pub(crate) fn new() -> Self {
        Self {
            extent: 0,
            slot: 0,
            saved_extent: 0,
            saved_slot: 0,
            wraparound: false,
        }
    }

    /// Move to the next slot, rolling into the next extent and around the
    /// ring as needed.
    pub(crate) fn advance(&mut self, slots_per_extent: u32) {
        self.slot += 1;
        if self.slot == slots_per_extent {
            self.slot = 0;
            self.extent = (self.extent + 1) % METABLOCK_EXTENT_COUNT;
        }
        if self.extent == 0 && self.slot == 0 {
            self.wraparound = true;
        }
    }

    pub(crate) fn offset(&self, geometry: &RingGeometry) -> u64 {
        geometry.slot_offset(self.extent, self.slot)
    }

    /// Save the current position (stack of depth one).
    pub(crate) fn push(&mut self) {
        self.saved_extent = self.extent;
        self.saved_slot = self.slot;
    }

    /// Restore the previously saved position.
    pub(crate) fn pop(&mut self) {
        self.extent = self.saved_extent;
        self.slot = self.saved_slot;
    }

    pub(crate) fn position(&self) -> (u32, u32) {
        (self.extent, self.slot)
    }

    pub(crate) fn saved_position(&self) -> (u32, u32) {
        (self.saved_extent, self.saved_slot)
    }

    pub(crate) fn clear_wraparound(&mut self) {
        self.wraparound = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> RingGeometry {
        // Four 64-byte slots per extent, two extents.
        RingGeometry::new(256, 64)
    }

    #[test]
    fn offsets_respect_extent_separation() {
        let geometry = geometry();
        let base = STATIC_HEADER_LEN as u64;
        assert_eq!(geometry.slot_offset(0, 0), base);
        assert_eq!(geometry.slot_offset(0, 3), base + 3 * 64);
        assert_eq!(
            geometry.slot_offset(1, 0),
            base + METABLOCK_EXTENT_SEPARATION * 256
        );
        assert_eq!(geometry.region_end(), geometry.slot_offset(1, 3) + 64);
    }

    #[test]
    fn advance_walks_the_ring_and_flags_wraparound() {
        let geometry = geometry();
        let mut head = Head::new();
        let mut visited = Vec::new();
        for _ in 0..geometry.total_slots() {
            visited.push(head.position());
            assert!(!head.wraparound);
            head.advance(geometry.slots_per_extent());
        }
        assert_eq!(visited.len(), 8);
        assert_eq!(visited[3], (0, 3));
        assert_eq!(visited[4], (1, 0));
        assert_eq!(head.position(), (0, 0));
        assert!(head.wraparound, "a full pass wraps back to the first slot");
    }

    #[test]
    fn push_pop_remembers_one_position() {
        let geometry = geometry();
        let mut head = Head::new();
        head.advance(geometry.slots_per_extent());
        head.advance(geometry.slots_per_extent());
        head.push();
        let saved = head.position();
        head.advance(geometry.slots_per_extent());
        head.advance(geometry.slots_per_extent());
        assert_ne!(head.position(), saved);
        head.pop();
        assert_eq!(head.position(), saved);
    }

    #[test]
    fn undersized_extent_is_rejected() {
        let geometry = RingGeometry::new(32, 64);
        assert!(geometry.validate().is_err());
    }
}
