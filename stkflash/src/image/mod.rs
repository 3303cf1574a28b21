//! Intel HEX image access.
//!
//! - [`store`]: the storage collaborator, opening images by name
//! - [`reader`]: byte-level cursor over the HEX text
//! - [`decoder`]: record-spanning payload decoder
//! - [`stats`]: one-pass summary of an image

pub mod decoder;
pub mod reader;
pub mod stats;
pub mod store;

pub use decoder::{CHUNK_CAPACITY, Chunk, HexDecoder, SENTINEL};
pub use reader::HexReader;
pub use stats::ImageStats;
pub use store::{DirStore, ImageStore, MemoryStore};
