//! Log-structured serializer core.
//!
//! This crate holds the on-disk durability anchor of the storage engine:
//! the [`metablock`] ring and its collaborators (the static header block
//! and extent reservation). It runs on a single worker of the
//! `silt-runtime` thread pool and does all file I/O asynchronously through
//! that worker.

pub mod config;
pub mod error;
pub mod extent;
pub mod metablock;
pub mod static_header;

pub use config::MetablockConfig;
pub use error::{SerializerError, SerializerResult};
pub use extent::ExtentManager;
pub use metablock::{
    record_len, CrcMetablock, MetablockManager, MetablockPayload, RingGeometry,
    METABLOCK_EXTENT_COUNT, METABLOCK_EXTENT_SEPARATION, RECORD_HEADER_LEN,
};
pub use static_header::{StaticHeader, STATIC_HEADER_LEN, STATIC_HEADER_VERSION};
