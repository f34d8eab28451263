//! The persisted terrain format.
//!
//! ```text
//! TERR header, layers, blend maps, derived data, quadtree deltas
//! ├── TLDC layer declaration
//! ├── TLIN layer instances
//! ├── TDDA derived data (one chunk per kind)
//! ├── TQDT max height delta per quadtree node and lod
//! └── TLOD lod level count
//!     └── TLVL one chunk per lod level, coarsest first, each compressed on its own
//! ```
//!
//! Because the lod levels are stored coarsest first and each level is compressed on its own,
//! reading levels `k..=0` only requires skipping `num_levels - 1 - k` chunks by their length.

use crate::{
    error::{TerrainError, TerrainResult},
    formats::chunk::{bytes_to_f32s, f32s_to_bytes, ChunkReader, ChunkWriter},
    math::Alignment,
    terrain::layers::{
        BlendMap, ElementSemantic, LayerDeclaration, LayerInstance, LayerSampler,
        LayerSamplerElement, SamplerFormat,
    },
};
use bevy::math::Vec3;
use itertools::iproduct;
use ndarray::Array2;
use std::io::{Read, Seek};

pub const TERRAIN_CHUNK_ID: &[u8; 4] = b"TERR";
pub const TERRAIN_CHUNK_VERSION: u16 = 1;
const LAYER_DECLARATION_CHUNK_ID: &[u8; 4] = b"TLDC";
const LAYER_INSTANCE_CHUNK_ID: &[u8; 4] = b"TLIN";
const DERIVED_DATA_CHUNK_ID: &[u8; 4] = b"TDDA";
const QUADTREE_DELTA_CHUNK_ID: &[u8; 4] = b"TQDT";
const LOD_CHUNK_ID: &[u8; 4] = b"TLOD";
const LOD_LEVEL_CHUNK_ID: &[u8; 4] = b"TLVL";

const NORMAL_MAP: u8 = 0;
const LIGHT_MAP: u8 = 1;
const COMPOSITE_MAP: u8 = 2;

/// The geometry parameters of a terrain.
#[derive(Clone, Debug, PartialEq)]
pub struct TerrainHeader {
    pub alignment: Alignment,
    pub size: u16,
    pub world_size: f32,
    pub max_batch_size: u16,
    pub min_batch_size: u16,
    pub position: Vec3,
}

/// Everything stored in a terrain file except the lod level payloads.
#[derive(Clone, Debug)]
pub struct TerrainFile {
    pub header: TerrainHeader,
    pub layer_declaration: LayerDeclaration,
    pub layers: Vec<LayerInstance>,
    pub blend_map_size: u16,
    pub blend_maps: Vec<BlendMap>,
    /// Rgb8 normals, `size * size * 3` bytes.
    pub normal_map: Option<Vec<u8>>,
    /// Luminance light map and its edge length.
    pub light_map: Option<(u16, Vec<u8>)>,
    /// Edge length and revision counter of the composite map.
    pub composite_map: Option<(u16, u32)>,
    /// Max height deltas of the quadtree in depth first order.
    pub quadtree_deltas: Vec<f32>,
}

/// Where the lod level chunks of a terrain file start.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LodSection {
    pub offset: u64,
    pub size: u16,
    pub num_levels: u16,
}

/// The height and delta values of a single lod level, in [`lod_level_points`] order.
#[derive(Clone, Debug, PartialEq)]
pub struct LodLevelData {
    pub level: u16,
    pub heights: Vec<f32>,
    pub deltas: Vec<f32>,
}

/// Iterates the vertices first introduced by `level`, row by row.
///
/// The coarsest level contains every vertex on its grid, all finer levels only the vertices
/// that are not part of the next coarser one.
pub fn lod_level_points(
    size: u16,
    level: u16,
    num_levels: u16,
) -> impl Iterator<Item = (usize, usize)> {
    let step = 1usize << level;
    let coarsest = level + 1 >= num_levels;

    iproduct!((0..size as usize).step_by(step), (0..size as usize).step_by(step))
        .map(|(y, x)| (x, y))
        .filter(move |&(x, y)| coarsest || x % (step * 2) != 0 || y % (step * 2) != 0)
}

impl LodLevelData {
    pub fn extract(
        size: u16,
        level: u16,
        num_levels: u16,
        heights: &Array2<f32>,
        deltas: &Array2<f32>,
    ) -> Self {
        let (heights, deltas) = lod_level_points(size, level, num_levels)
            .map(|(x, y)| (heights[(y, x)], deltas[(y, x)]))
            .unzip();

        Self {
            level,
            heights,
            deltas,
        }
    }

    /// Scatters the values of this level back into the full resolution arrays.
    ///
    /// The level has to match the arrays, which [`read_lod_levels`] verifies for every chunk.
    pub fn apply(
        &self,
        size: u16,
        num_levels: u16,
        heights: &mut Array2<f32>,
        deltas: &mut Array2<f32>,
    ) {
        for (i, (x, y)) in lod_level_points(size, self.level, num_levels).enumerate() {
            heights[(y, x)] = self.heights[i];
            deltas[(y, x)] = self.deltas[i];
        }
    }

    fn write(&self, writer: &mut ChunkWriter) -> TerrainResult<()> {
        writer.write_chunk(LOD_LEVEL_CHUNK_ID, 1, |w| {
            w.write_u16(self.level);
            w.write_u32(self.heights.len() as u32);
            let mut raw = f32s_to_bytes(&self.heights);
            raw.extend(f32s_to_bytes(&self.deltas));
            w.write_compressed(&raw)
        })
    }

    /// Reads the next level chunk, which has to hold `level` of a terrain with `num_levels` levels.
    fn read<R: Read + Seek>(
        reader: &mut ChunkReader<R>,
        size: u16,
        level: u16,
        num_levels: u16,
    ) -> TerrainResult<Self> {
        reader.begin_chunk(LOD_LEVEL_CHUNK_ID, 1)?;
        let found = reader.read_u16()?;
        let count = reader.read_u32()? as usize;
        let expected_count = lod_level_points(size, level, num_levels).count();

        if found != level || count != expected_count {
            return Err(TerrainError::LodLevelMismatch {
                expected: level,
                expected_count,
                found,
                count,
            });
        }

        let raw = bytes_to_f32s(&reader.read_compressed()?);

        if raw.len() != count * 2 {
            return Err(TerrainError::DecompressedSizeMismatch {
                expected: count * 8,
                actual: raw.len() * 4,
            });
        }

        let (heights, deltas) = raw.split_at(count);

        Ok(Self {
            level,
            heights: heights.to_vec(),
            deltas: deltas.to_vec(),
        })
    }
}

/// Whether `num_levels` lod levels fit a terrain of `size` vertices per edge.
fn lod_level_count_fits(size: u16, num_levels: u16) -> bool {
    num_levels == 0
        || 1u32
            .checked_shl(num_levels as u32 - 1)
            .is_some_and(|step| step < size as u32)
}

/// Writes a complete terrain, including every lod level.
pub fn write_terrain(
    writer: &mut ChunkWriter,
    file: &TerrainFile,
    heights: &Array2<f32>,
    deltas: &Array2<f32>,
    num_lod_levels: u16,
) -> TerrainResult<()> {
    let header = &file.header;

    writer.write_chunk(TERRAIN_CHUNK_ID, TERRAIN_CHUNK_VERSION, |w| {
        w.write_u8(header.alignment.id());
        w.write_u16(header.size);
        w.write_f32(header.world_size);
        w.write_u16(header.max_batch_size);
        w.write_u16(header.min_batch_size);
        w.write_vec3(header.position);

        w.write_chunk(LAYER_DECLARATION_CHUNK_ID, 1, |w| {
            w.write_u8(file.layer_declaration.samplers.len() as u8);
            for sampler in &file.layer_declaration.samplers {
                w.write_str(&sampler.alias);
                w.write_u8(sampler.format.id());
            }
            w.write_u8(file.layer_declaration.elements.len() as u8);
            for element in &file.layer_declaration.elements {
                w.write_u8(element.source);
                w.write_u8(element.semantic.id());
                w.write_u8(element.start);
                w.write_u8(element.count);
            }
            Ok(())
        })?;

        w.write_chunk(LAYER_INSTANCE_CHUNK_ID, 1, |w| {
            w.write_u8(file.layers.len() as u8);
            for layer in &file.layers {
                w.write_f32(layer.world_size);
                w.write_u8(layer.texture_names.len() as u8);
                layer.texture_names.iter().for_each(|name| w.write_str(name));
            }
            Ok(())
        })?;

        w.write_u16(file.blend_map_size);
        w.write_u8(file.blend_maps.len() as u8);
        for blend_map in &file.blend_maps {
            w.write_compressed(blend_map.data.as_slice().unwrap_or(&[]))?;
        }

        let derived_count = file.normal_map.is_some() as u8
            + file.light_map.is_some() as u8
            + file.composite_map.is_some() as u8;
        w.write_u8(derived_count);

        if let Some(normal_map) = &file.normal_map {
            w.write_chunk(DERIVED_DATA_CHUNK_ID, 1, |w| {
                w.write_u8(NORMAL_MAP);
                w.write_u16(header.size);
                w.write_compressed(normal_map)
            })?;
        }
        if let Some((size, light_map)) = &file.light_map {
            w.write_chunk(DERIVED_DATA_CHUNK_ID, 1, |w| {
                w.write_u8(LIGHT_MAP);
                w.write_u16(*size);
                w.write_compressed(light_map)
            })?;
        }
        if let Some((size, revision)) = file.composite_map {
            w.write_chunk(DERIVED_DATA_CHUNK_ID, 1, |w| {
                w.write_u8(COMPOSITE_MAP);
                w.write_u16(size);
                w.write_u32(revision);
                Ok(())
            })?;
        }

        w.write_chunk(QUADTREE_DELTA_CHUNK_ID, 1, |w| {
            w.write_u32(file.quadtree_deltas.len() as u32);
            w.write_f32s(&file.quadtree_deltas);
            Ok(())
        })?;

        w.write_chunk(LOD_CHUNK_ID, 1, |w| {
            w.write_u16(num_lod_levels);
            for level in (0..num_lod_levels).rev() {
                LodLevelData::extract(header.size, level, num_lod_levels, heights, deltas)
                    .write(w)?;
            }
            Ok(())
        })
    })
}

/// A terrain read from a stream, with every lod level from the coarsest down to `lowest_level`.
pub struct ReadTerrain {
    pub file: TerrainFile,
    pub heights: Array2<f32>,
    pub deltas: Array2<f32>,
    pub lod_section: LodSection,
    pub lowest_level: u16,
}

/// Reads a terrain, including the lod levels from the coarsest down to `lowest_level`.
///
/// Vertices of levels that were not read are interpolated from the finest level that was.
pub fn read_terrain<R: Read + Seek>(
    reader: &mut ChunkReader<R>,
    lowest_level: u16,
) -> TerrainResult<ReadTerrain> {
    reader.begin_chunk(TERRAIN_CHUNK_ID, TERRAIN_CHUNK_VERSION)?;

    let alignment = Alignment::from_id(reader.read_u8()?).unwrap_or_default();
    let header = TerrainHeader {
        alignment,
        size: reader.read_u16()?,
        world_size: reader.read_f32()?,
        max_batch_size: reader.read_u16()?,
        min_batch_size: reader.read_u16()?,
        position: reader.read_vec3()?,
    };

    reader.begin_chunk(LAYER_DECLARATION_CHUNK_ID, 1)?;
    let sampler_count = reader.read_u8()?;
    let mut layer_declaration = LayerDeclaration::default();
    for _ in 0..sampler_count {
        layer_declaration.samplers.push(LayerSampler {
            alias: reader.read_str()?,
            format: SamplerFormat::from_id(reader.read_u8()?),
        });
    }
    let element_count = reader.read_u8()?;
    for _ in 0..element_count {
        layer_declaration.elements.push(LayerSamplerElement {
            source: reader.read_u8()?,
            semantic: ElementSemantic::from_id(reader.read_u8()?),
            start: reader.read_u8()?,
            count: reader.read_u8()?,
        });
    }

    reader.begin_chunk(LAYER_INSTANCE_CHUNK_ID, 1)?;
    let layer_count = reader.read_u8()?;
    let mut layers = Vec::with_capacity(layer_count as usize);
    for _ in 0..layer_count {
        let world_size = reader.read_f32()?;
        let texture_count = reader.read_u8()?;
        let texture_names = (0..texture_count)
            .map(|_| reader.read_str())
            .collect::<TerrainResult<Vec<_>>>()?;
        layers.push(LayerInstance {
            world_size,
            texture_names,
        });
    }

    let blend_map_size = reader.read_u16()?;
    let blend_map_count = reader.read_u8()?;
    let mut blend_maps = Vec::with_capacity(blend_map_count as usize);
    for _ in 0..blend_map_count {
        let raw = reader.read_compressed()?;
        let size = blend_map_size as usize;
        let actual = raw.len();
        let data = Array2::from_shape_vec((size, size), raw).map_err(|_| {
            TerrainError::DecompressedSizeMismatch {
                expected: size * size,
                actual,
            }
        })?;
        blend_maps.push(BlendMap {
            data,
            dirty_rect: Default::default(),
        });
    }

    let mut normal_map = None;
    let mut light_map = None;
    let mut composite_map = None;
    for _ in 0..reader.read_u8()? {
        reader.begin_chunk(DERIVED_DATA_CHUNK_ID, 1)?;
        let kind = reader.read_u8()?;
        let size = reader.read_u16()?;
        match kind {
            NORMAL_MAP => normal_map = Some(reader.read_compressed()?),
            LIGHT_MAP => light_map = Some((size, reader.read_compressed()?)),
            _ => composite_map = Some((size, reader.read_u32()?)),
        }
    }

    reader.begin_chunk(QUADTREE_DELTA_CHUNK_ID, 1)?;
    let delta_count = reader.read_u32()? as usize;
    let quadtree_deltas = reader.read_f32s(delta_count)?;

    reader.begin_chunk(LOD_CHUNK_ID, 1)?;
    let num_levels = reader.read_u16()?;
    if !lod_level_count_fits(header.size, num_levels) {
        return Err(TerrainError::InvalidLodLevelCount {
            count: num_levels,
            size: header.size,
        });
    }

    let lod_section = LodSection {
        offset: reader.position()?,
        size: header.size,
        num_levels,
    };

    let size = header.size as usize;
    let mut heights = Array2::zeros((size, size));
    let mut deltas = Array2::zeros((size, size));
    let lowest_level = lowest_level.min(num_levels.saturating_sub(1));

    if num_levels > 0 {
        for level in read_lod_levels(reader, lod_section, num_levels - 1, lowest_level)? {
            level.apply(header.size, num_levels, &mut heights, &mut deltas);
        }
    }

    if lowest_level > 0 {
        fill_unresolved_heights(&mut heights, 1 << lowest_level);
    }

    Ok(ReadTerrain {
        file: TerrainFile {
            header,
            layer_declaration,
            layers,
            blend_map_size,
            blend_maps,
            normal_map,
            light_map,
            composite_map,
            quadtree_deltas,
        },
        heights,
        deltas,
        lod_section,
        lowest_level,
    })
}

/// Reads the lod levels `coarsest..=finest` (in that order) of a lod section.
pub fn read_lod_levels<R: Read + Seek>(
    reader: &mut ChunkReader<R>,
    section: LodSection,
    coarsest: u16,
    finest: u16,
) -> TerrainResult<Vec<LodLevelData>> {
    reader.seek_to(section.offset)?;

    for _ in coarsest + 1..section.num_levels {
        reader.skip_chunk()?;
    }

    (finest..=coarsest)
        .rev()
        .map(|level| LodLevelData::read(reader, section.size, level, section.num_levels))
        .collect()
}

/// Bilinearly interpolates every vertex that is not on the grid of `step` from that grid.
fn fill_unresolved_heights(heights: &mut Array2<f32>, step: usize) {
    let size = heights.nrows();

    for (y, x) in iproduct!(0..size, 0..size) {
        if x % step == 0 && y % step == 0 {
            continue;
        }

        let x0 = x / step * step;
        let y0 = y / step * step;
        let x1 = (x0 + step).min(size - 1);
        let y1 = (y0 + step).min(size - 1);
        let tx = (x - x0) as f32 / step as f32;
        let ty = (y - y0) as f32 / step as f32;

        let top = heights[(y0, x0)] * (1.0 - tx) + heights[(y0, x1)] * tx;
        let bottom = heights[(y1, x0)] * (1.0 - tx) + heights[(y1, x1)] * tx;
        heights[(y, x)] = top * (1.0 - ty) + bottom * ty;
    }
}
