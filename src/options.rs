use anyhow::{Context, Result};
use bevy::math::Vec3;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

/// Options shared by all terrains of a [`TerrainGroup`](crate::terrain_group::TerrainGroup).
///
/// The group resolves these once and hands each of its terrains a shared copy at construction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TerrainOptions {
    /// The depth of the skirts hanging below each batch to hide cracks between lods.
    pub skirt_size: f32,
    /// The maximum screen space error in pixels a lod may introduce before switching to a finer one.
    pub max_pixel_error: f32,
    /// The direction the light map is baked for (world space, need not be normalized).
    pub light_map_direction: [f32; 3],
    /// The edge length of the light map in texels.
    pub light_map_size: u16,
    /// The edge length of the composite map in texels.
    pub composite_map_size: u16,
    /// The distance at which the composite map replaces the layered material.
    pub composite_map_distance: f32,
    /// The edge length of each layer blend map in texels.
    pub layer_blend_map_size: u16,
    pub normal_map_required: bool,
    pub light_map_required: bool,
    pub composite_map_required: bool,
    /// Whether terrains cast shadows onto their neighbours' light maps.
    pub cast_shadows: bool,
    /// Runs every background job on the calling thread.
    pub force_synchronous: bool,
    /// The coarsest lod level a streamed prepare reads, `None` reads every level up front.
    pub initial_lod_level: Option<u16>,
    /// Extra distance a viewer has to move away before a finer lod is released again.
    pub lod_hold_distance: f32,
}

impl Default for TerrainOptions {
    fn default() -> Self {
        Self {
            skirt_size: 30.0,
            max_pixel_error: 3.0,
            light_map_direction: [1.0, -1.0, 0.0],
            light_map_size: 1024,
            composite_map_size: 1024,
            composite_map_distance: 4000.0,
            layer_blend_map_size: 1024,
            normal_map_required: true,
            light_map_required: false,
            composite_map_required: true,
            cast_shadows: false,
            force_synchronous: false,
            initial_lod_level: None,
            lod_hold_distance: 0.0,
        }
    }
}

impl TerrainOptions {
    pub fn light_direction(&self) -> Vec3 {
        Vec3::from_array(self.light_map_direction).normalize_or(Vec3::NEG_Y)
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let encoded = fs::read_to_string(path)
            .with_context(|| format!("failed to read terrain options {}", path.display()))?;
        Ok(ron::from_str(&encoded)?)
    }

    pub fn save_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let encoded = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, encoded)?;
        Ok(())
    }
}

/// Controls how a [`PagedWorldSection`](crate::paging::PagedWorldSection) streams its pages.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PagingConfig {
    /// Pages whose centre lies within this distance of a viewer are loaded.
    pub load_radius: f32,
    /// Loaded pages are kept until their centre is further away than this distance.
    pub hold_radius: f32,
    /// The inclusive range of page coordinates that may be loaded.
    pub min_page: (i32, i32),
    pub max_page: (i32, i32),
    /// The minimum time between two consecutive page loads.
    pub load_interval: Duration,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            load_radius: 2000.0,
            hold_radius: 3000.0,
            min_page: (-10, -10),
            max_page: (10, 10),
            load_interval: Duration::from_millis(900),
        }
    }
}

impl PagingConfig {
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let encoded = fs::read_to_string(path)
            .with_context(|| format!("failed to read paging config {}", path.display()))?;
        Ok(ron::from_str(&encoded)?)
    }

    pub fn save_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let encoded = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, encoded)?;
        Ok(())
    }
}
