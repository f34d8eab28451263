//! The binary terrain format.
//!
//! It is a tree of versioned chunks, where the height and delta data is split into
//! one zlib compressed chunk per lod level, so that lods can be streamed in on demand.

pub mod chunk;
pub mod terrain_file;
