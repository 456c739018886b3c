//! Extent accounting for the database file.
//!
//! The serializer proper allocates and frees extents through a richer
//! interface; the metablock layer only needs to mark its own extents as
//! off-limits before anything else can claim them.

use std::collections::HashSet;

use crate::config::MetablockConfig;
use crate::error::{SerializerError, SerializerResult};

pub struct ExtentManager {
    extent_size: u64,
    reserved: HashSet<u64>,
}

impl ExtentManager {
    pub fn new(extent_size: u64) -> SerializerResult<Self> {
        if extent_size == 0 {
            return Err(SerializerError::invalid_config(
                "extent size must be non-zero",
            ));
        }
        Ok(Self {
            extent_size,
            reserved: HashSet::new(),
        })
    }

    pub fn with_config(config: &MetablockConfig) -> SerializerResult<Self> {
        config.validate()?;
        Self::new(config.extent_size)
    }

    pub fn extent_size(&self) -> u64 {
        self.extent_size
    }

    /// Mark the extent at `index` as non-allocatable for the rest of the
    /// engine. Reserving the same extent twice is a caller bug.
    pub fn reserve_extent(&mut self, index: u64) {
        assert!(
            self.reserved.insert(index),
            "extent {index} reserved twice"
        );
    }

    pub fn is_reserved(&self, index: u64) -> bool {
        self.reserved.contains(&index)
    }
}
