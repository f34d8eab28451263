//! Building the cpu side data of a terrain, from import data or from a terrain file.
//!
//! Preparing never touches gpu state, so it is safe to run on a worker thread.

use crate::{
    error::{TerrainError, TerrainResult},
    formats::{chunk::ChunkReader, terrain_file::{read_terrain, LodSection}},
    math::Alignment,
    options::TerrainOptions,
    terrain::layers::{BlendMap, LayerDeclaration, LayerInstance, MAX_LAYERS},
    terrain_data::TerrainGeometry,
};
use anyhow::{Context, Result};
use bevy::math::Vec3;
use image::{imageops::FilterType, DynamicImage};
use ndarray::Array2;
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

/// Where the heights of an imported terrain come from.
#[derive(Clone, Debug)]
pub enum HeightSource {
    /// Every vertex has the same height.
    Constant(f32),
    /// One value per vertex, row by row, starting at the south west corner.
    Values(Vec<f32>),
    /// A greyscale image, resampled to the terrain size. The top row of the image is north.
    Image(DynamicImage),
}

/// Describes a terrain built from raw data instead of a terrain file.
#[derive(Clone, Debug)]
pub struct ImportData {
    pub alignment: Alignment,
    pub size: u16,
    pub world_size: f32,
    pub max_batch_size: u16,
    pub min_batch_size: u16,
    pub position: Vec3,
    pub source: HeightSource,
    /// Applied to every imported value: `height = value * input_scale + input_bias`.
    pub input_scale: f32,
    pub input_bias: f32,
    pub layer_declaration: LayerDeclaration,
    pub layers: Vec<LayerInstance>,
    /// Whether the import data may be released once the terrain is loaded.
    /// Kept import data allows reloading the terrain after it was unloaded.
    pub delete_input_data: bool,
}

impl Default for ImportData {
    fn default() -> Self {
        Self {
            alignment: Alignment::XZ,
            size: 1025,
            world_size: 1000.0,
            max_batch_size: 65,
            min_batch_size: 17,
            position: Vec3::ZERO,
            source: HeightSource::Constant(0.0),
            input_scale: 1.0,
            input_bias: 0.0,
            layer_declaration: LayerDeclaration::default(),
            layers: Vec::new(),
            delete_input_data: false,
        }
    }
}

impl ImportData {
    fn heights(&self) -> TerrainResult<Array2<f32>> {
        let size = self.size as usize;
        let scale = |value: f32| value * self.input_scale + self.input_bias;

        let heights = match &self.source {
            HeightSource::Constant(height) => Array2::from_elem((size, size), *height),
            HeightSource::Values(values) => {
                if values.len() != size * size {
                    return Err(TerrainError::HeightDataMismatch {
                        expected: size * size,
                        actual: values.len(),
                    });
                }

                Array2::from_shape_fn((size, size), |(y, x)| scale(values[y * size + x]))
            }
            HeightSource::Image(image) => {
                let image = image
                    .resize_exact(self.size as u32, self.size as u32, FilterType::Triangle)
                    .to_luma32f();

                Array2::from_shape_fn((size, size), |(y, x)| {
                    scale(image.get_pixel(x as u32, (size - 1 - y) as u32).0[0])
                })
            }
        };

        Ok(heights)
    }
}

/// How the lod levels of a prepared terrain are resident.
#[derive(Clone, Debug, PartialEq)]
pub enum LodPreparation {
    /// Every level is in memory.
    All,
    /// The levels finer than `lowest_level` still have to be read from the file.
    Streamed {
        path: PathBuf,
        section: LodSection,
        lowest_level: u16,
    },
}

/// The cpu side data of a terrain.
#[derive(Clone, Debug)]
pub struct PreparedTerrain {
    pub geometry: TerrainGeometry,
    pub heights: Array2<f32>,
    pub deltas: Array2<f32>,
    pub layer_declaration: LayerDeclaration,
    pub layers: Vec<LayerInstance>,
    pub blend_map_size: u16,
    pub blend_maps: Vec<BlendMap>,
    pub normal_map: Option<Vec<u8>>,
    pub light_map: Option<(u16, Vec<u8>)>,
    pub composite_map: Option<(u16, u32)>,
    /// Empty if the height deltas still have to be calculated.
    pub quadtree_deltas: Vec<f32>,
    pub lod: LodPreparation,
    pub file: Option<PathBuf>,
    /// Set for imported terrains, which have never been saved.
    pub modified: bool,
}

impl PreparedTerrain {
    pub fn from_import(import: &ImportData, options: &TerrainOptions) -> TerrainResult<Self> {
        let mut geometry = TerrainGeometry::new(
            import.alignment,
            import.size,
            import.world_size,
            import.max_batch_size,
            import.min_batch_size,
        )?;
        geometry.position = import.position;
        geometry.skirt_size = options.skirt_size;

        if !import.layers.is_empty() && import.layer_declaration.is_empty() {
            return Err(TerrainError::MissingLayerDeclaration);
        }

        if !import.layer_declaration.is_valid() {
            return Err(TerrainError::InvalidLayerElement);
        }

        let layers = import
            .layers
            .iter()
            .take(MAX_LAYERS)
            .map(|layer| {
                let mut layer = layer.clone();
                layer
                    .texture_names
                    .resize(import.layer_declaration.samplers.len(), String::new());
                layer
            })
            .collect::<Vec<_>>();

        let blend_map_size = options.layer_blend_map_size;
        let blend_maps = (1..layers.len())
            .map(|_| BlendMap::new(blend_map_size))
            .collect();

        let size = import.size as usize;

        Ok(Self {
            heights: import.heights()?,
            deltas: Array2::zeros((size, size)),
            geometry,
            layer_declaration: import.layer_declaration.clone(),
            layers,
            blend_map_size,
            blend_maps,
            normal_map: None,
            light_map: None,
            composite_map: None,
            quadtree_deltas: Vec::new(),
            lod: LodPreparation::All,
            file: None,
            modified: true,
        })
    }

    /// Reads a terrain file. With [`TerrainOptions::initial_lod_level`] set only the coarse levels
    /// are read, the rest is streamed in on demand.
    pub fn from_file<P: AsRef<Path>>(path: P, options: &TerrainOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open terrain file {}", path.display()))?;
        let mut reader = ChunkReader::new(BufReader::new(file));

        let read = read_terrain(&mut reader, options.initial_lod_level.unwrap_or(0))
            .with_context(|| format!("failed to read terrain file {}", path.display()))?;
        let header = &read.file.header;

        let mut geometry = TerrainGeometry::new(
            header.alignment,
            header.size,
            header.world_size,
            header.max_batch_size,
            header.min_batch_size,
        )
        .with_context(|| format!("invalid terrain file {}", path.display()))?;
        geometry.position = header.position;
        geometry.skirt_size = options.skirt_size;

        if read.lod_section.num_levels != geometry.num_lod_levels() {
            return Err(TerrainError::InvalidLodLevelCount {
                count: read.lod_section.num_levels,
                size: header.size,
            })
            .with_context(|| format!("invalid terrain file {}", path.display()));
        }

        let lod = if read.lowest_level > 0 {
            LodPreparation::Streamed {
                path: path.to_path_buf(),
                section: read.lod_section,
                lowest_level: read.lowest_level,
            }
        } else {
            LodPreparation::All
        };

        let file = read.file;

        Ok(Self {
            geometry,
            heights: read.heights,
            deltas: read.deltas,
            layer_declaration: file.layer_declaration,
            layers: file.layers,
            blend_map_size: file.blend_map_size,
            blend_maps: file.blend_maps,
            normal_map: file.normal_map,
            light_map: file.light_map,
            composite_map: file.composite_map,
            quadtree_deltas: file.quadtree_deltas,
            lod,
            file: Some(path.to_path_buf()),
            modified: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terrain::layers::{ElementSemantic, SamplerFormat};
    use image::{GrayImage, Luma};

    #[test]
    fn import_validation() {
        let options = TerrainOptions::default();

        let import = ImportData {
            size: 1000,
            ..Default::default()
        };
        assert_eq!(
            PreparedTerrain::from_import(&import, &options)
                .unwrap_err()
                .to_string(),
            "terrainSize, minBatchSize and maxBatchSize must all be n^2 + 1"
        );

        let import = ImportData {
            layers: vec![LayerInstance::default()],
            ..Default::default()
        };
        assert!(matches!(
            PreparedTerrain::from_import(&import, &options),
            Err(TerrainError::MissingLayerDeclaration)
        ));

        let import = ImportData {
            layer_declaration: LayerDeclaration::new([("albedo", SamplerFormat::Rgba8)])
                .with_element(0, ElementSemantic::Albedo, 0, 3)
                .with_element(1, ElementSemantic::Normal, 0, 3),
            ..Default::default()
        };
        assert!(matches!(
            PreparedTerrain::from_import(&import, &options),
            Err(TerrainError::InvalidLayerElement)
        ));

        let import = ImportData {
            size: 129,
            source: HeightSource::Values(vec![0.0; 10]),
            ..Default::default()
        };
        assert!(matches!(
            PreparedTerrain::from_import(&import, &options),
            Err(TerrainError::HeightDataMismatch {
                expected: 16641,
                actual: 10
            })
        ));
    }

    #[test]
    fn imported_values_are_scaled() {
        let import = ImportData {
            size: 17,
            max_batch_size: 17,
            min_batch_size: 9,
            source: HeightSource::Values((0..17 * 17).map(|i| i as f32).collect()),
            input_scale: 2.0,
            input_bias: 1.0,
            layer_declaration: LayerDeclaration::new([("albedo", SamplerFormat::Rgba8)]),
            layers: vec![LayerInstance::default(); 3],
            ..Default::default()
        };

        let prepared = PreparedTerrain::from_import(&import, &TerrainOptions::default()).unwrap();

        assert_eq!(prepared.heights[(0, 3)], 7.0);
        assert_eq!(prepared.heights[(1, 0)], 35.0);
        assert_eq!(prepared.blend_maps.len(), 2);
        assert_eq!(prepared.layers[0].texture_names.len(), 1);
        assert!(prepared.modified);
    }

    #[test]
    fn image_rows_are_flipped() {
        let mut image = GrayImage::new(17, 17);
        for x in 0..17 {
            // bright row on top of the image
            image.put_pixel(x, 0, Luma([255]));
        }

        let import = ImportData {
            size: 17,
            max_batch_size: 17,
            min_batch_size: 9,
            source: HeightSource::Image(DynamicImage::ImageLuma8(image)),
            input_scale: 100.0,
            ..Default::default()
        };

        let prepared = PreparedTerrain::from_import(&import, &TerrainOptions::default()).unwrap();

        assert!((prepared.heights[(16, 8)] - 100.0).abs() < 1e-3);
        assert_eq!(prepared.heights[(0, 8)], 0.0);
    }
}
