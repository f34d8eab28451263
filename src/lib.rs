//! This crate streams large height-field terrains in and out of memory and picks
//! the geometry to render for each of them.
//!
//! # Background
//! A world is split into a grid of equally sized square terrains, which are paged in and out
//! around the viewers by a [`PagedWorldSection`](paging::PagedWorldSection).
//! Each slot of the grid is addressed by a [`GridKey`](math::GridKey) and managed by a
//! [`TerrainGroup`](terrain_group::TerrainGroup), which defines, loads, saves and links the
//! terrains of the slots with their neighbours.
//!
//! ## How to store and stream the height data?
//! A terrain file stores the heights of each lod level in a separate compressed chunk.
//! Only the coarsest levels are read when a terrain is loaded, finer levels are streamed
//! in by the [`LodManager`](terrain_data::lod_manager::LodManager) as the viewer approaches,
//! and dropped again once it moves away.
//!
//! ## How to approximate the terrain geometry?
//! Each terrain is covered by a [`QuadTree`](terrain_data::quadtree::QuadTree) of vertex batches.
//! Every frame the tree selects the coarsest lod per node whose projected error stays below
//! a pixel threshold, morphing between lods with per vertex height deltas to avoid popping.
//! See the [`terrain_data`] module for more information.
//!
//! Vertex and index data is handed to a [`GpuBufferProvider`](gpu::GpuBufferProvider),
//! so that the crate stays independent of the render back end.

pub mod error;
pub mod formats;
pub mod gpu;
pub mod math;
pub mod options;
pub mod paging;
pub mod plugin;
pub mod terrain;
pub mod terrain_data;
pub mod terrain_group;
pub mod work;

#[allow(missing_docs)]
pub mod prelude {
    #[doc(hidden)]
    pub use crate::{
        error::{TerrainError, TerrainResult},
        gpu::{CpuBufferProvider, GpuBufferProvider},
        math::{Alignment, GridKey, TerrainRect},
        options::{PagingConfig, TerrainOptions},
        paging::{DefaultTerrainDefiner, PagedWorldSection, TerrainDefiner},
        plugin::{TerrainPagingPlugin, TerrainPagingSettings, TerrainViewer},
        terrain::{DerivedDataMask, HeightSource, ImportData, Terrain, TerrainHandle},
        terrain_group::{TerrainDefinition, TerrainGroup, TerrainSlot},
    };
}
