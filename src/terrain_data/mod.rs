//! The level of detail data structures of a single terrain.
//!
//! # Explanation
//! Each terrain is subdivided by a [`QuadTree`](quadtree::QuadTree), whose nodes render
//! batches of at most `max_batch_size` vertices per edge.
//! Leaf nodes render several lods out of the same vertex data by skipping vertices,
//! while inner nodes render a single coarser lod.
//!
//! Which depth range of the tree backs which lod level is described by the
//! [`LodInfoTable`](lod_info::LodInfoTable).
//! The [`LodManager`](lod_manager::LodManager) streams the per lod height and delta data in
//! from disk and promotes it into the quadtree, so that only the lods currently required are resident.

use crate::{
    error::{TerrainError, TerrainResult},
    math::Alignment,
    terrain_data::lod_info::{determine_lod_levels, LodLevels, MAX_BATCH_SIZE},
};
use bevy::math::Vec3;

pub mod batch;
pub mod deltas;
pub mod lod_info;
pub mod lod_manager;
pub mod quadtree;

fn is_power_of_two_plus_one(value: u16) -> bool {
    value > 1 && (value - 1).is_power_of_two()
}

/// Checks the size constraints every terrain has to satisfy.
pub fn validate_sizes(size: u16, max_batch_size: u16, min_batch_size: u16) -> TerrainResult<()> {
    if !is_power_of_two_plus_one(size)
        || !is_power_of_two_plus_one(max_batch_size)
        || !is_power_of_two_plus_one(min_batch_size)
    {
        return Err(TerrainError::SizeNotPowerOfTwoPlusOne);
    }

    if min_batch_size > max_batch_size {
        return Err(TerrainError::MinBatchLargerThanMax);
    }

    if max_batch_size > MAX_BATCH_SIZE {
        return Err(TerrainError::MaxBatchTooLarge {
            max: MAX_BATCH_SIZE,
        });
    }

    if max_batch_size > size {
        return Err(TerrainError::BatchLargerThanTerrain);
    }

    Ok(())
}

/// The geometric parameters of a terrain and the conversions between its coordinate spaces.
///
/// Vertex space addresses the height array by `(x, y)`, terrain space is `(x, y, height)`
/// in world units centred on the terrain, and local space is terrain space rotated by the
/// [`Alignment`], relative to the terrain position.
#[derive(Clone, Debug, PartialEq)]
pub struct TerrainGeometry {
    pub alignment: Alignment,
    pub size: u16,
    pub world_size: f32,
    pub max_batch_size: u16,
    pub min_batch_size: u16,
    pub position: Vec3,
    pub skirt_size: f32,
    pub lod_levels: LodLevels,
}

impl TerrainGeometry {
    pub fn new(
        alignment: Alignment,
        size: u16,
        world_size: f32,
        max_batch_size: u16,
        min_batch_size: u16,
    ) -> TerrainResult<Self> {
        validate_sizes(size, max_batch_size, min_batch_size)?;

        Ok(Self {
            alignment,
            size,
            world_size,
            max_batch_size,
            min_batch_size,
            position: Vec3::ZERO,
            skirt_size: 30.0,
            lod_levels: determine_lod_levels(size, max_batch_size, min_batch_size),
        })
    }

    #[inline]
    pub fn num_lod_levels(&self) -> u16 {
        self.lod_levels.num_lod_levels
    }

    /// The terrain space coordinate of vertex `0`.
    #[inline]
    pub fn base(&self) -> f32 {
        -self.world_size * 0.5
    }

    /// The world space distance between two adjacent vertices.
    #[inline]
    pub fn scale(&self) -> f32 {
        self.world_size / (self.size - 1) as f32
    }

    /// The terrain space position of a vertex, the height is in the `z` component.
    #[inline]
    pub fn point_xy(&self, x: i64, y: i64, height: f32) -> Vec3 {
        Vec3::new(
            x as f32 * self.scale() + self.base(),
            y as f32 * self.scale() + self.base(),
            height,
        )
    }

    /// The local space position of a vertex.
    #[inline]
    pub fn point(&self, x: i64, y: i64, height: f32) -> Vec3 {
        self.alignment
            .terrain_to_world(self.point_xy(x, y, height))
    }

    /// The world space position of a vertex.
    pub fn world_point(&self, x: i64, y: i64, height: f32) -> Vec3 {
        self.point(x, y, height) + self.position
    }

    /// Converts a world space position into normalized terrain space, where `x` and `y` range
    /// from `0` to `1` across the terrain and `z` is the height above the terrain origin.
    pub fn terrain_position(&self, world: Vec3) -> Vec3 {
        let v = self.alignment.world_to_terrain(world - self.position);
        let inv = 1.0 / self.world_size;

        Vec3::new((v.x - self.base()) * inv, (v.y - self.base()) * inv, v.z)
    }

    /// Inverse of [`Self::terrain_position`].
    pub fn world_position(&self, terrain: Vec3) -> Vec3 {
        let v = Vec3::new(
            terrain.x * self.world_size + self.base(),
            terrain.y * self.world_size + self.base(),
            terrain.z,
        );

        self.alignment.terrain_to_world(v) + self.position
    }

    /// The lod at which a row or column of vertices is dropped.
    /// Rows of the coarsest lod are never dropped and return `num_lod_levels`.
    pub fn lod_level_when_eliminated(&self, row_or_column: i64) -> u16 {
        let mut eliminate = ((self.size - 1) / (self.min_batch_size - 1)) as i64;
        let mut lod = self.num_lod_levels();

        while row_or_column % eliminate != 0 {
            eliminate /= 2;
            lod -= 1;
        }

        lod
    }

    pub fn lod_level_when_vertex_eliminated(&self, x: i64, y: i64) -> u16 {
        self.lod_level_when_eliminated(x)
            .min(self.lod_level_when_eliminated(y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_validation() {
        assert!(validate_sizes(513, 65, 33).is_ok());
        assert!(matches!(
            validate_sizes(500, 65, 33),
            Err(TerrainError::SizeNotPowerOfTwoPlusOne)
        ));
        assert!(matches!(
            validate_sizes(513, 33, 65),
            Err(TerrainError::MinBatchLargerThanMax)
        ));
        assert!(matches!(
            validate_sizes(1025, 257, 33),
            Err(TerrainError::MaxBatchTooLarge { max: 129 })
        ));
        assert_eq!(
            TerrainError::SizeNotPowerOfTwoPlusOne.to_string(),
            "terrainSize, minBatchSize and maxBatchSize must all be n^2 + 1"
        );
    }

    #[test]
    fn vertex_elimination() {
        let geometry = TerrainGeometry::new(Alignment::XZ, 513, 1000.0, 65, 33).unwrap();

        assert_eq!(geometry.lod_level_when_eliminated(0), 5);
        assert_eq!(geometry.lod_level_when_eliminated(16), 5);
        assert_eq!(geometry.lod_level_when_eliminated(8), 4);
        assert_eq!(geometry.lod_level_when_eliminated(1), 1);
        assert_eq!(geometry.lod_level_when_vertex_eliminated(16, 3), 1);
    }

    #[test]
    fn position_conversion() {
        let mut geometry = TerrainGeometry::new(Alignment::XZ, 513, 1000.0, 65, 33).unwrap();
        geometry.position = Vec3::new(100.0, 0.0, 100.0);

        assert_eq!(geometry.world_point(0, 0, 0.0), Vec3::new(-400.0, 0.0, 600.0));
        assert_eq!(
            geometry.world_point(512, 512, 5.0),
            Vec3::new(600.0, 5.0, -400.0)
        );

        let terrain = geometry.terrain_position(Vec3::new(100.0, 7.0, 100.0));
        assert_eq!(terrain, Vec3::new(0.5, 0.5, 7.0));
        assert_eq!(geometry.world_position(terrain), Vec3::new(100.0, 7.0, 100.0));
    }
}
