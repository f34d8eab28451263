//! A single terrain instance: its heights, derived data, layers and neighbours.
//!
//! # Lifecycle
//! A [`Terrain`] starts out empty. [`Terrain::prepare`] installs cpu side data, which may be built
//! on a worker thread via [`PreparedTerrain`]. [`Terrain::load`] builds the quadtree and makes the
//! terrain renderable, [`Terrain::unload`] releases it again while keeping the cpu data, and
//! [`Terrain::unprepare`] drops that as well.
//!
//! Edits are tracked as dirty rectangles per data kind. Overlapping edits coalesce and are only
//! processed by the next [`Terrain::update`].

use crate::{
    error::{TerrainError, TerrainResult},
    formats::{
        chunk::{ChunkReader, ChunkWriter},
        terrain_file::{read_lod_levels, write_terrain, TerrainFile, TerrainHeader},
    },
    gpu::{GpuBufferProvider, TerrainId},
    math::{Alignment, GridKey, TerrainRect},
    options::TerrainOptions,
    terrain_data::{
        deltas::{calculate_height_deltas, LodCell},
        lod_info::LodInfoTable,
        lod_manager::LodManager,
        quadtree::{QuadTree, RenderBatch},
        TerrainGeometry,
    },
    work::BackgroundJob,
};
use anyhow::{Context, Result};
use bevy::{
    log::{debug, error, warn},
    math::Vec3,
};
use itertools::iproduct;
use ndarray::Array2;
use std::{
    fs::File,
    io::{BufReader, BufWriter},
    mem,
    path::{Path, PathBuf},
    sync::{Arc, RwLock, Weak},
};

pub mod derived;
pub mod handle;
pub mod layers;
pub mod neighbours;
pub mod prepare;

pub use derived::DerivedDataMask;
pub use handle::TerrainHandle;
pub use neighbours::{Neighbour, NeighbourLink};
pub use prepare::{HeightSource, ImportData, LodPreparation, PreparedTerrain};

use derived::{point_from_self_or_neighbour, DerivedInput, DerivedPass, NeighbourHeights};
use layers::{BlendMap, LayerDeclaration, LayerInstance, MAX_LAYERS};

/// The cpu side data of a prepared terrain.
struct TerrainData {
    geometry: TerrainGeometry,
    heights: Arc<Array2<f32>>,
    deltas: Array2<f32>,
    layer_declaration: LayerDeclaration,
    layers: Vec<LayerInstance>,
    blend_map_size: u16,
    blend_maps: Vec<BlendMap>,
    normal_map: Option<Vec<u8>>,
    light_map: Option<(u16, Vec<u8>)>,
    composite_map: Option<(u16, u32)>,
    quadtree_deltas: Vec<f32>,
    lod: LodPreparation,
}

struct LoadedTerrain {
    quadtree: QuadTree,
    lod_manager: LodManager,
}

/// The state of the derived data passes.
///
/// A run consists of one pass per requested kind. Requests arriving while a run is in progress
/// are collected and start the next run once the current one finished.
#[derive(Default)]
struct DerivedUpdate {
    job: Option<BackgroundJob<(DerivedPass, TerrainRect)>>,
    remaining: DerivedDataMask,
    rect: TerrainRect,
    lightmap_rect: TerrainRect,
    synchronous: bool,
    pending: DerivedDataMask,
    pending_rect: TerrainRect,
    pending_lightmap_rect: TerrainRect,
}

pub struct Terrain {
    id: TerrainId,
    options: Arc<TerrainOptions>,
    provider: Arc<dyn GpuBufferProvider>,
    alignment: Alignment,
    position: Vec3,
    data: Option<TerrainData>,
    loaded: Option<LoadedTerrain>,
    file: Option<PathBuf>,
    modified: bool,
    dirty_geometry_rect: TerrainRect,
    dirty_derived_rect: TerrainRect,
    dirty_neighbour_rect: TerrainRect,
    dirty_composite_rect: TerrainRect,
    dirty_lightmap_rect: TerrainRect,
    derived: DerivedUpdate,
    neighbours: [Option<NeighbourLink>; 8],
    key: Option<GridKey>,
    pub(crate) self_link: Weak<RwLock<Terrain>>,
}

impl Terrain {
    pub fn new(options: Arc<TerrainOptions>, provider: Arc<dyn GpuBufferProvider>) -> Self {
        Self {
            id: TerrainId::next(),
            options,
            provider,
            alignment: Alignment::default(),
            position: Vec3::ZERO,
            data: None,
            loaded: None,
            file: None,
            modified: false,
            dirty_geometry_rect: TerrainRect::NULL,
            dirty_derived_rect: TerrainRect::NULL,
            dirty_neighbour_rect: TerrainRect::NULL,
            dirty_composite_rect: TerrainRect::NULL,
            dirty_lightmap_rect: TerrainRect::NULL,
            derived: DerivedUpdate::default(),
            neighbours: Default::default(),
            key: None,
            self_link: Weak::new(),
        }
    }

    pub fn id(&self) -> TerrainId {
        self.id
    }

    pub fn options(&self) -> &TerrainOptions {
        &self.options
    }

    /// The grid slot of this terrain, if it belongs to a group.
    pub fn key(&self) -> Option<GridKey> {
        self.key
    }

    pub(crate) fn set_key(&mut self, key: Option<GridKey>) {
        self.key = key;
    }

    pub fn geometry(&self) -> Option<&TerrainGeometry> {
        self.data.as_ref().map(|data| &data.geometry)
    }

    /// The vertex count along one edge, `0` while unprepared.
    pub fn size(&self) -> u16 {
        self.geometry().map_or(0, |geometry| geometry.size)
    }

    pub fn world_size(&self) -> f32 {
        self.geometry().map_or(0.0, |geometry| geometry.world_size)
    }

    pub fn alignment(&self) -> Alignment {
        self.alignment
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
        if let Some(data) = &mut self.data {
            data.geometry.position = position;
        }
    }

    /// Changes the alignment. Loaded terrains keep theirs until they are reloaded.
    pub fn set_alignment(&mut self, alignment: Alignment) {
        if self.loaded.is_some() {
            warn!("the alignment of a loaded terrain can not change");
            return;
        }

        self.alignment = alignment;
        if let Some(data) = &mut self.data {
            data.geometry.alignment = alignment;
        }
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn is_prepared(&self) -> bool {
        self.data.is_some()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// Whether the terrain changed since it was last saved.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn quadtree(&self) -> Option<&QuadTree> {
        self.loaded.as_ref().map(|loaded| &loaded.quadtree)
    }

    pub fn lod_manager(&self) -> Option<&LodManager> {
        self.loaded.as_ref().map(|loaded| &loaded.lod_manager)
    }

    /// Installs prepared cpu data, replacing everything the terrain held before.
    pub fn prepare(&mut self, prepared: PreparedTerrain) {
        self.unload();

        let PreparedTerrain {
            geometry,
            heights,
            deltas,
            layer_declaration,
            layers,
            blend_map_size,
            blend_maps,
            normal_map,
            light_map,
            composite_map,
            quadtree_deltas,
            lod,
            file,
            modified,
        } = prepared;

        self.alignment = geometry.alignment;
        self.position = geometry.position;
        self.file = file;
        self.modified = modified;

        self.data = Some(TerrainData {
            geometry,
            heights: Arc::new(heights),
            deltas,
            layer_declaration,
            layers,
            blend_map_size,
            blend_maps,
            normal_map,
            light_map,
            composite_map,
            quadtree_deltas,
            lod,
        });
    }

    pub fn prepare_import(&mut self, import: &ImportData) -> TerrainResult<()> {
        let prepared = PreparedTerrain::from_import(import, &self.options)?;
        self.prepare(prepared);
        Ok(())
    }

    pub fn prepare_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let prepared = PreparedTerrain::from_file(path, &self.options)?;
        self.prepare(prepared);
        Ok(())
    }

    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.prepare_file(path)?;
        self.load()?;
        Ok(())
    }

    /// Builds the quadtree and loads every prepared lod level. Main thread only.
    ///
    /// Missing quadtree deltas are calculated right away, missing derived data is marked dirty
    /// and created by the next [`Self::update`].
    pub fn load(&mut self) -> TerrainResult<()> {
        if self.loaded.is_some() {
            return Ok(());
        }

        let data = self.data.as_mut().ok_or(TerrainError::NotPrepared)?;
        let geometry = &data.geometry;
        let size = geometry.size;
        let full = TerrainRect::full(size);

        let mut quadtree = QuadTree::new(geometry, self.id, self.provider.clone());
        let mut lod_manager = LodManager::new(
            LodInfoTable::build(size, geometry.max_batch_size, geometry.min_batch_size),
            size,
        );

        match &data.lod {
            LodPreparation::All => lod_manager.prepare_all(),
            LodPreparation::Streamed {
                path,
                section,
                lowest_level,
            } => lod_manager.prepare_streamed(path, *section, *lowest_level),
        }

        if !quadtree.set_max_height_delta_table(&data.quadtree_deltas) {
            let mut tree = quadtree.delta_tree();
            calculate_height_deltas(
                &data.geometry,
                &data.heights,
                &mut data.deltas,
                &mut tree,
                &full,
            );
            quadtree.set_delta_tree(tree);
            quadtree.finalise_delta_values(&full);
            data.quadtree_deltas = quadtree.max_height_delta_table();
        }

        lod_manager.load(&mut quadtree, &data.heights, &data.deltas);

        if (self.options.normal_map_required && data.normal_map.is_none())
            || (self.options.light_map_required && data.light_map.is_none())
        {
            self.dirty_derived_rect.merge(&full);
            self.dirty_lightmap_rect.merge(&full);
        }

        if self.options.composite_map_required && data.composite_map.is_none() {
            data.composite_map = Some((self.options.composite_map_size, 0));
            self.dirty_composite_rect.merge(&full);
        }

        debug!(
            "loaded terrain {:?} with {} lod levels, finest loaded lod {}",
            self.id,
            lod_manager.num_lod_levels(),
            lod_manager.highest_lod_loaded()
        );

        self.loaded = Some(LoadedTerrain {
            quadtree,
            lod_manager,
        });

        Ok(())
    }

    /// Releases the quadtree and its buffers, keeping the cpu data. Running background work
    /// is completed first.
    pub fn unload(&mut self) {
        self.wait_for_derived_data();

        let Some(LoadedTerrain {
            mut quadtree,
            mut lod_manager,
        }) = self.loaded.take()
        else {
            return;
        };

        if let Some(data) = &mut self.data {
            lod_manager.wait(
                &mut quadtree,
                Arc::make_mut(&mut data.heights),
                &mut data.deltas,
            );
            data.quadtree_deltas = quadtree.max_height_delta_table();

            // levels streamed in stay resident
            let prepared = lod_manager.highest_lod_prepared();
            if prepared == 0 {
                data.lod = LodPreparation::All;
            } else if let LodPreparation::Streamed { lowest_level, .. } = &mut data.lod {
                *lowest_level = prepared;
            }
        }

        lod_manager.unload_all(&mut quadtree);
        debug!("unloaded terrain {:?}", self.id);
    }

    /// Drops all cpu data.
    pub fn unprepare(&mut self) {
        self.unload();
        self.data = None;
    }

    /// Writes the terrain to `path`, reading lod levels that were not streamed in yet first.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.wait_for_derived_data();

        let data = self.data.as_mut().ok_or(TerrainError::NotPrepared)?;

        let prepared = match &mut self.loaded {
            Some(loaded) => {
                loaded.lod_manager.wait(
                    &mut loaded.quadtree,
                    Arc::make_mut(&mut data.heights),
                    &mut data.deltas,
                );
                data.quadtree_deltas = loaded.quadtree.max_height_delta_table();
                loaded.lod_manager.highest_lod_prepared()
            }
            None => match &data.lod {
                LodPreparation::All => 0,
                LodPreparation::Streamed { lowest_level, .. } => *lowest_level,
            },
        };

        let mut refined = self
            .loaded
            .as_mut()
            .is_some_and(|loaded| loaded.lod_manager.take_refined());

        let missing = match &data.lod {
            LodPreparation::Streamed { path, section, .. } if prepared > 0 => {
                Some((path.clone(), *section))
            }
            _ => None,
        };

        if let Some((source, section)) = missing {
            let file = File::open(&source)
                .with_context(|| format!("failed to open {}", source.display()))?;
            let mut reader = ChunkReader::new(BufReader::new(file));
            let levels = read_lod_levels(&mut reader, section, prepared - 1, 0)
                .with_context(|| format!("failed to read lod levels of {}", source.display()))?;

            let size = data.geometry.size;
            let num_lod_levels = data.geometry.num_lod_levels();
            let heights = Arc::make_mut(&mut data.heights);
            for level in &levels {
                level.apply(size, num_lod_levels, heights, &mut data.deltas);
            }

            data.lod = LodPreparation::All;
            if let Some(loaded) = &mut self.loaded {
                loaded.lod_manager.mark_all_prepared();
                refined = true;
            }
        }

        let geometry = &data.geometry;
        let file = TerrainFile {
            header: TerrainHeader {
                alignment: geometry.alignment,
                size: geometry.size,
                world_size: geometry.world_size,
                max_batch_size: geometry.max_batch_size,
                min_batch_size: geometry.min_batch_size,
                position: geometry.position,
            },
            layer_declaration: data.layer_declaration.clone(),
            layers: data.layers.clone(),
            blend_map_size: data.blend_map_size,
            blend_maps: data.blend_maps.clone(),
            normal_map: data.normal_map.clone(),
            light_map: data.light_map.clone(),
            composite_map: data.composite_map,
            quadtree_deltas: data.quadtree_deltas.clone(),
        };

        let mut writer = ChunkWriter::new();
        write_terrain(
            &mut writer,
            &file,
            &data.heights,
            &data.deltas,
            geometry.num_lod_levels(),
        )?;

        let mut output = BufWriter::new(
            File::create(path)
                .with_context(|| format!("failed to create terrain file {}", path.display()))?,
        );
        writer
            .write_to(&mut output)
            .with_context(|| format!("failed to write terrain file {}", path.display()))?;

        self.file = Some(path.to_path_buf());
        self.modified = false;
        if refined {
            self.dirty_derived_everywhere();
        }

        Ok(())
    }

    pub fn heights(&self) -> Option<&Array2<f32>> {
        self.data.as_ref().map(|data| data.heights.as_ref())
    }

    pub fn deltas(&self) -> Option<&Array2<f32>> {
        self.data.as_ref().map(|data| &data.deltas)
    }

    pub fn height_at_point(&self, x: i64, y: i64) -> Option<f32> {
        let data = self.data.as_ref()?;
        let max = data.geometry.size as i64 - 1;

        Some(data.heights[(y.clamp(0, max) as usize, x.clamp(0, max) as usize)])
    }

    pub fn set_height_at_point(&mut self, x: i64, y: i64, height: f32) -> TerrainResult<()> {
        let data = self.data.as_mut().ok_or(TerrainError::NotPrepared)?;
        if self.loaded.is_none() {
            return Err(TerrainError::NotLoaded);
        }

        let max = data.geometry.size as i64 - 1;
        let (x, y) = (x.clamp(0, max), y.clamp(0, max));

        Arc::make_mut(&mut data.heights)[(y as usize, x as usize)] = height;
        self.dirty_rect(&TerrainRect::new(x, y, x + 1, y + 1))
    }

    /// The interpolated height at a normalized terrain position, split into triangles like the
    /// rendered geometry.
    pub fn height_at_terrain_position(&self, x: f32, y: f32) -> Option<f32> {
        let data = self.data.as_ref()?;
        let geometry = &data.geometry;
        let factor = (geometry.size - 1) as f32;
        let last_cell = geometry.size as i64 - 2;

        let fx = (x * factor).clamp(0.0, factor);
        let fy = (y * factor).clamp(0.0, factor);
        let cx = (fx.floor() as i64).min(last_cell);
        let cy = (fy.floor() as i64).min(last_cell);

        let point = |x: i64, y: i64| {
            geometry.point_xy(x, y, data.heights[(y as usize, x as usize)])
        };

        let cell = LodCell::new(
            point(cx, cy),
            point(cx + 1, cy),
            point(cx, cy + 1),
            point(cx + 1, cy + 1),
            cy % 2 == 1,
        );

        Some(cell.interpolate(
            fx - cx as f32,
            fy - cy as f32,
            fx * geometry.scale() + geometry.base(),
            fy * geometry.scale() + geometry.base(),
        ))
    }

    /// The world height along the terrain up axis below or above `position`.
    pub fn height_at_world_position(&self, position: Vec3) -> Option<f32> {
        let geometry = self.geometry()?;
        let terrain = geometry.terrain_position(position);
        let height = self.height_at_terrain_position(terrain.x, terrain.y)?;

        Some(
            geometry
                .world_position(Vec3::new(terrain.x, terrain.y, height))
                .dot(self.alignment.up()),
        )
    }

    pub fn min_height(&self) -> Option<f32> {
        self.heights()
            .map(|heights| heights.iter().copied().fold(f32::INFINITY, f32::min))
    }

    pub fn max_height(&self) -> Option<f32> {
        self.heights()
            .map(|heights| heights.iter().copied().fold(f32::NEG_INFINITY, f32::max))
    }

    /// The world space bounds of the terrain.
    pub fn world_aabb(&self) -> Option<(Vec3, Vec3)> {
        let geometry = self.geometry()?;
        let last = geometry.size as i64 - 1;
        let a = geometry.world_point(0, 0, self.min_height()?);
        let b = geometry.world_point(last, last, self.max_height()?);

        Some((a.min(b), b.max(a)))
    }

    pub fn bounding_radius(&self) -> f32 {
        if let Some(quadtree) = self.quadtree() {
            if quadtree.bounding_radius() > 0.0 {
                return quadtree.bounding_radius();
            }
        }

        self.world_aabb()
            .map_or(0.0, |(min, max)| (max - min).length() * 0.5)
    }

    /// The world position of a vertex.
    pub fn point(&self, x: i64, y: i64) -> Option<Vec3> {
        let height = self.height_at_point(x, y)?;
        Some(self.geometry()?.world_point(x, y, height))
    }

    /// Converts a normalized terrain position into world space.
    pub fn position_of(&self, terrain: Vec3) -> Option<Vec3> {
        Some(self.geometry()?.world_position(terrain))
    }

    /// Converts a world position into normalized terrain space.
    pub fn terrain_position(&self, world: Vec3) -> Option<Vec3> {
        Some(self.geometry()?.terrain_position(world))
    }

    pub fn terrain_vector(&self, world: Vec3) -> Vec3 {
        self.alignment.world_to_terrain(world)
    }

    pub fn world_vector(&self, terrain: Vec3) -> Vec3 {
        self.alignment.terrain_to_world(terrain)
    }

    pub fn dirty_geometry_rect(&self) -> TerrainRect {
        self.dirty_geometry_rect
    }

    pub fn dirty_derived_rect(&self) -> TerrainRect {
        self.dirty_derived_rect
    }

    pub fn dirty_lightmap_rect(&self) -> TerrainRect {
        self.dirty_lightmap_rect
    }

    pub fn dirty_composite_rect(&self) -> TerrainRect {
        self.dirty_composite_rect
    }

    /// Marks the whole terrain as changed.
    pub fn dirty(&mut self) -> TerrainResult<()> {
        self.dirty_rect(&TerrainRect::full(self.size()))
    }

    /// Marks the heights inside of `rect` as changed. Only loaded terrains track changes.
    pub fn dirty_rect(&mut self, rect: &TerrainRect) -> TerrainResult<()> {
        if self.loaded.is_none() {
            return Err(TerrainError::NotLoaded);
        }

        let rect = rect.clamp_to(self.size());
        if rect.is_null() {
            return Ok(());
        }

        self.dirty_geometry_rect.merge(&rect);
        self.dirty_derived_rect.merge(&rect);
        self.dirty_neighbour_rect.merge(&rect);
        self.dirty_composite_rect.merge(&rect);
        self.dirty_lightmap_rect.merge(&rect);
        self.modified = true;

        Ok(())
    }

    pub fn dirty_lightmap_rect_for(&mut self, rect: &TerrainRect) {
        self.dirty_lightmap_rect
            .merge(&rect.clamp_to(self.size()));
    }

    pub fn dirty_lightmap(&mut self) {
        self.dirty_lightmap_rect_for(&TerrainRect::full(self.size()));
    }

    /// Pushes pending geometry changes and starts recalculating all derived data.
    pub fn update(&mut self, synchronous: bool) {
        self.update_geometry();
        self.update_derived_data(synchronous, DerivedDataMask::ALL);
    }

    /// Uploads the changed heights to the quadtree and passes changed edges on to the neighbours.
    pub fn update_geometry(&mut self) {
        let (Some(data), Some(loaded)) = (&self.data, &mut self.loaded) else {
            return;
        };

        let rect = mem::take(&mut self.dirty_geometry_rect);
        if !rect.is_null() {
            loaded
                .quadtree
                .update_vertex_data(true, false, &rect, &data.heights, &data.deltas);
        }

        self.notify_neighbours();
    }

    /// Recalculates the derived data of the kinds in `mask` inside of the dirty rectangles.
    ///
    /// Only one run is in flight at a time, later requests are merged and follow once it completes.
    pub fn update_derived_data(&mut self, synchronous: bool, mask: DerivedDataMask) {
        if self.loaded.is_none() {
            return;
        }

        let mask = self.required_derived_data(mask);
        let rect = mem::take(&mut self.dirty_derived_rect);
        let lightmap_rect = mem::take(&mut self.dirty_lightmap_rect).merged(&rect);

        if self.derived.job.is_some() {
            self.derived.pending |= mask;
            self.derived.pending_rect.merge(&rect);
            self.derived.pending_lightmap_rect.merge(&lightmap_rect);
        } else {
            self.start_derived_run(mask, rect, lightmap_rect, synchronous);
        }

        if synchronous {
            self.wait_for_derived_data();
        }
    }

    pub fn is_derived_data_update_in_progress(&self) -> bool {
        self.derived.job.is_some()
    }

    /// Blocks until every derived data run, including pending ones, completed.
    pub fn wait_for_derived_data(&mut self) {
        while let Some(job) = self.derived.job.take() {
            let result = job.wait();
            self.finish_derived_pass(result);
        }
    }

    /// Applies finished background work. Returns whether anything changed.
    pub fn poll(&mut self) -> bool {
        let mut changed = false;

        if let (Some(data), Some(loaded)) = (&mut self.data, &mut self.loaded) {
            if loaded.lod_manager.is_busy() {
                changed |= loaded.lod_manager.poll(
                    &mut loaded.quadtree,
                    Arc::make_mut(&mut data.heights),
                    &mut data.deltas,
                );
            }
        }
        self.dirty_refined_heights();

        if let Some(job) = &mut self.derived.job {
            if let Some(result) = job.poll() {
                self.derived.job = None;
                self.finish_derived_pass(result);
                changed = true;
            }
        }

        changed
    }

    fn required_derived_data(&self, mask: DerivedDataMask) -> DerivedDataMask {
        let mut required = DerivedDataMask::DELTAS;
        if self.options.normal_map_required {
            required |= DerivedDataMask::NORMALS;
        }
        if self.options.light_map_required {
            required |= DerivedDataMask::LIGHTMAP;
        }

        mask & required
    }

    fn start_derived_run(
        &mut self,
        mut mask: DerivedDataMask,
        rect: TerrainRect,
        lightmap_rect: TerrainRect,
        synchronous: bool,
    ) {
        if rect.is_null() {
            mask -= DerivedDataMask::DELTAS | DerivedDataMask::NORMALS;
        }
        if lightmap_rect.is_null() {
            mask -= DerivedDataMask::LIGHTMAP;
        }

        self.derived.remaining = mask;
        self.derived.rect = rect;
        self.derived.lightmap_rect = lightmap_rect;
        self.derived.synchronous = synchronous;

        self.dispatch_derived_pass();
    }

    /// Starts the next pass of the current run, or finishes the run.
    fn dispatch_derived_pass(&mut self) {
        let (Some(data), Some(loaded)) = (&self.data, &self.loaded) else {
            self.derived.remaining = DerivedDataMask::empty();
            return;
        };

        let size = data.geometry.size as usize;
        let remaining = self.derived.remaining;

        let (pass, rect) = if remaining.contains(DerivedDataMask::DELTAS) {
            let pass = DerivedPass::Deltas {
                deltas: data.deltas.clone(),
                tree: loaded.quadtree.delta_tree(),
            };
            (pass, self.derived.rect)
        } else if remaining.contains(DerivedDataMask::NORMALS) {
            let normal_map = data
                .normal_map
                .clone()
                .unwrap_or_else(|| vec![0; size * size * 3]);
            (DerivedPass::Normals { normal_map }, self.derived.rect)
        } else if remaining.contains(DerivedDataMask::LIGHTMAP) {
            let (size, light_map) = data.light_map.clone().unwrap_or_else(|| {
                let size = self.options.light_map_size;
                (size, vec![255; size as usize * size as usize])
            });
            (DerivedPass::Lightmap { size, light_map }, self.derived.lightmap_rect)
        } else {
            self.finish_derived_run();
            return;
        };

        self.derived.remaining -= pass.kind();

        let input = DerivedInput {
            geometry: data.geometry.clone(),
            heights: data.heights.clone(),
            neighbours: self.neighbour_heights(),
            light_direction: self.terrain_vector(self.options.light_direction()),
            rect,
        };

        let synchronous = self.derived.synchronous || self.options.force_synchronous;
        self.derived.job = Some(BackgroundJob::spawn(synchronous, move || {
            Ok(pass.run(input))
        }));
    }

    fn finish_derived_pass(&mut self, result: Result<(DerivedPass, TerrainRect)>) {
        match result {
            Ok((pass, rect)) => self.finalise_derived_pass(pass, &rect),
            Err(err) => {
                error!("derived data update of terrain {:?} failed: {err:?}", self.id);
                self.derived.remaining = DerivedDataMask::empty();
            }
        }

        self.dispatch_derived_pass();
    }

    fn finalise_derived_pass(&mut self, pass: DerivedPass, rect: &TerrainRect) {
        let Some(data) = &mut self.data else {
            return;
        };

        match pass {
            DerivedPass::Deltas { deltas, tree } => {
                // only the calculated rectangle, streaming may have filled in other levels meanwhile
                for (y, x) in iproduct!(rect.top..rect.bottom, rect.left..rect.right) {
                    let index = (y as usize, x as usize);
                    data.deltas[index] = deltas[index];
                }

                if let Some(loaded) = &mut self.loaded {
                    loaded.quadtree.set_delta_tree(tree);
                }
                self.finalise_height_deltas(rect);
            }
            DerivedPass::Normals { normal_map } => self.finalise_normals(normal_map, rect),
            DerivedPass::Lightmap { size, light_map } => {
                self.finalise_lightmap(size, light_map, rect)
            }
        }
    }

    /// Installs a recalculated normal map, `rect` is the part that changed.
    pub fn finalise_normals(&mut self, normal_map: Vec<u8>, rect: &TerrainRect) {
        if let Some(data) = &mut self.data {
            data.normal_map = Some(normal_map);
            self.dirty_composite_rect.merge(rect);
        }
    }

    pub fn finalise_lightmap(&mut self, size: u16, light_map: Vec<u8>, rect: &TerrainRect) {
        if let Some(data) = &mut self.data {
            data.light_map = Some((size, light_map));
            self.dirty_composite_rect.merge(rect);
        }
    }

    fn finish_derived_run(&mut self) {
        self.update_composite_map();

        if !self.derived.pending.is_empty() {
            let mask = mem::take(&mut self.derived.pending);
            let rect = mem::take(&mut self.derived.pending_rect);
            let lightmap_rect = mem::take(&mut self.derived.pending_lightmap_rect);
            let synchronous = self.derived.synchronous;

            self.start_derived_run(mask, rect, lightmap_rect, synchronous);
        }
    }

    /// Calculates the height deltas inside of `rect` on the calling thread and applies them.
    /// Returns the rectangle of changed vertices.
    pub fn calculate_height_deltas(&mut self, rect: &TerrainRect) -> TerrainRect {
        let (Some(data), Some(loaded)) = (&mut self.data, &mut self.loaded) else {
            return TerrainRect::NULL;
        };

        let mut tree = loaded.quadtree.delta_tree();
        let changed = calculate_height_deltas(
            &data.geometry,
            &data.heights,
            &mut data.deltas,
            &mut tree,
            rect,
        );
        loaded.quadtree.set_delta_tree(tree);

        self.finalise_height_deltas(&changed);
        changed
    }

    /// Makes the calculated deltas inside of `rect` active and uploads them.
    pub fn finalise_height_deltas(&mut self, rect: &TerrainRect) {
        let (Some(data), Some(loaded)) = (&mut self.data, &mut self.loaded) else {
            return;
        };

        loaded.quadtree.finalise_delta_values(rect);
        loaded
            .quadtree
            .update_vertex_data(false, true, rect, &data.heights, &data.deltas);
        data.quadtree_deltas = loaded.quadtree.max_height_delta_table();
    }

    /// Calculates the normals inside of `rect` on the calling thread.
    pub fn calculate_normals(&mut self, rect: &TerrainRect) {
        let neighbours = self.neighbour_heights();
        let Some(data) = &mut self.data else {
            return;
        };

        let size = data.geometry.size as usize;
        let normal_map = data
            .normal_map
            .get_or_insert_with(|| vec![0; size * size * 3]);

        derived::calculate_normals(&data.geometry, &data.heights, &neighbours, normal_map, rect);
        self.dirty_composite_rect.merge(rect);
    }

    pub fn normal_map(&self) -> Option<&[u8]> {
        self.data.as_ref()?.normal_map.as_deref()
    }

    /// Calculates the light map inside of `rect` on the calling thread.
    pub fn calculate_lightmap(&mut self, rect: &TerrainRect) {
        let neighbours = self.neighbour_heights();
        let light_direction = self.terrain_vector(self.options.light_direction());
        let light_map_size = self.options.light_map_size;
        let Some(data) = &mut self.data else {
            return;
        };

        let (size, light_map) = data
            .light_map
            .get_or_insert_with(|| {
                (
                    light_map_size,
                    vec![255; light_map_size as usize * light_map_size as usize],
                )
            });

        let march =
            derived::LightMarch::new(&data.geometry, &data.heights, &neighbours, light_direction);
        derived::calculate_light_map(march.as_ref(), data.geometry.size, *size, light_map, rect);
        self.dirty_composite_rect.merge(rect);
    }

    pub fn light_map(&self) -> Option<(u16, &[u8])> {
        let (size, light_map) = self.data.as_ref()?.light_map.as_ref()?;
        Some((*size, light_map))
    }

    /// Bumps the composite map revision if anything it shows changed.
    pub fn update_composite_map(&mut self) -> bool {
        if self.dirty_composite_rect.is_null() || !self.options.composite_map_required {
            return false;
        }

        let Some(data) = &mut self.data else {
            return false;
        };

        let composite_map_size = self.options.composite_map_size;
        data.composite_map
            .get_or_insert((composite_map_size, 0))
            .1 += 1;
        self.dirty_composite_rect = TerrainRect::NULL;

        true
    }

    /// The revision of the composite map, it changes whenever the map has to be regenerated.
    pub fn composite_map_revision(&self) -> Option<u32> {
        self.data.as_ref()?.composite_map.map(|(_, revision)| revision)
    }

    /// Requests `level` as the finest lod, see [`LodManager::update_to_lod_level`].
    pub fn update_lod_level(&mut self, level: u16, synchronous: bool) {
        let (Some(data), Some(loaded)) = (&mut self.data, &mut self.loaded) else {
            return;
        };

        loaded.lod_manager.update_to_lod_level(
            level,
            synchronous,
            &mut loaded.quadtree,
            Arc::make_mut(&mut data.heights),
            &mut data.deltas,
        );

        self.dirty_refined_heights();
    }

    /// Streamed levels replace interpolated heights, so everything derived from them is stale.
    fn dirty_refined_heights(&mut self) {
        let refined = self
            .loaded
            .as_mut()
            .is_some_and(|loaded| loaded.lod_manager.take_refined());

        if refined {
            self.dirty_derived_everywhere();
        }
    }

    fn dirty_derived_everywhere(&mut self) {
        let full = TerrainRect::full(self.size());

        self.dirty_derived_rect.merge(&full);
        self.dirty_lightmap_rect.merge(&full);
        self.dirty_composite_rect.merge(&full);
        self.dirty_neighbour_rect.merge(&full);
    }

    /// Streams lods in or out depending on the distance of a world space viewpoint.
    ///
    /// Finer lods are requested as soon as they are needed, but only released once the viewpoint
    /// moved the hold distance further away.
    pub fn auto_update_lod(&mut self, viewpoint: Vec3, cfactor: f32, synchronous: bool) {
        let Some(loaded) = &self.loaded else {
            return;
        };

        let quadtree = &loaded.quadtree;
        let local = viewpoint - self.position;
        let current = loaded.lod_manager.target_lod_level();
        let needed = quadtree.finest_lod_within(local, cfactor);

        let target = if needed < current {
            needed
        } else {
            let offset = local - quadtree.root().local_centre;
            let hold = self.options.lod_hold_distance.min(offset.length());
            let held = local - offset.normalize_or_zero() * hold;

            quadtree.finest_lod_within(held, cfactor).max(current)
        };

        if target != current {
            self.update_lod_level(target, synchronous);
        }
    }

    /// Selects the lod of every quadtree node for a world space viewpoint.
    pub fn calculate_lod(&mut self, viewpoint: Vec3, cfactor: f32) {
        let local = viewpoint - self.position;

        if let Some(loaded) = &mut self.loaded {
            let min_lod = loaded.lod_manager.highest_lod_loaded();
            loaded
                .quadtree
                .calculate_current_lod(local, cfactor, min_lod);
        }
    }

    pub fn render_batches(&self) -> Vec<RenderBatch> {
        self.quadtree()
            .map(QuadTree::render_batches)
            .unwrap_or_default()
    }

    pub fn layer_declaration(&self) -> Option<&LayerDeclaration> {
        self.data.as_ref().map(|data| &data.layer_declaration)
    }

    pub fn layers(&self) -> &[LayerInstance] {
        self.data.as_ref().map_or(&[], |data| &data.layers)
    }

    pub fn layer_count(&self) -> usize {
        self.layers().len()
    }

    /// Inserts a layer at `index`, or on top if `None`. Every layer above the base layer gets a
    /// blend map. Returns `false` if the terrain already has [`MAX_LAYERS`] layers.
    pub fn add_layer(
        &mut self,
        index: Option<usize>,
        world_size: f32,
        mut texture_names: Vec<String>,
    ) -> bool {
        let Some(data) = &mut self.data else {
            return false;
        };

        if data.layers.len() >= MAX_LAYERS {
            warn!("a terrain can not have more than {MAX_LAYERS} layers");
            return false;
        }

        let index = index.unwrap_or(data.layers.len()).min(data.layers.len());
        texture_names.resize(data.layer_declaration.samplers.len(), String::new());
        data.layers.insert(
            index,
            LayerInstance {
                world_size,
                texture_names,
            },
        );

        if data.layers.len() > 1 {
            data.blend_maps
                .insert(index.saturating_sub(1), BlendMap::new(data.blend_map_size));
        }

        let full = TerrainRect::full(data.geometry.size);
        self.dirty_composite_rect.merge(&full);
        self.modified = true;

        true
    }

    pub fn remove_layer(&mut self, index: usize) {
        let Some(data) = &mut self.data else {
            return;
        };

        if index >= data.layers.len() {
            return;
        }

        data.layers.remove(index);
        if !data.blend_maps.is_empty() {
            data.blend_maps.remove(index.saturating_sub(1));
        }

        let full = TerrainRect::full(data.geometry.size);
        self.dirty_composite_rect.merge(&full);
        self.modified = true;
    }

    pub fn replace_layer(
        &mut self,
        index: usize,
        keep_blend_map: bool,
        world_size: f32,
        mut texture_names: Vec<String>,
    ) {
        let Some(data) = &mut self.data else {
            return;
        };

        let Some(layer) = data.layers.get_mut(index) else {
            return;
        };

        texture_names.resize(data.layer_declaration.samplers.len(), String::new());
        *layer = LayerInstance {
            world_size,
            texture_names,
        };

        if !keep_blend_map && index > 0 {
            data.blend_maps[index - 1] = BlendMap::new(data.blend_map_size);
        }

        let full = TerrainRect::full(data.geometry.size);
        self.dirty_composite_rect.merge(&full);
        self.modified = true;
    }

    pub fn layer_world_size(&self, index: usize) -> Option<f32> {
        self.layers().get(index).map(|layer| layer.world_size)
    }

    pub fn set_layer_world_size(&mut self, index: usize, world_size: f32) {
        if let Some(layer) = self
            .data
            .as_mut()
            .and_then(|data| data.layers.get_mut(index))
        {
            layer.world_size = world_size;
            self.modified = true;
        }
    }

    pub fn layer_texture_name(&self, index: usize, sampler: usize) -> Option<&str> {
        self.layers()
            .get(index)?
            .texture_names
            .get(sampler)
            .map(String::as_str)
    }

    pub fn set_layer_texture_name(&mut self, index: usize, sampler: usize, name: &str) {
        if let Some(texture) = self
            .data
            .as_mut()
            .and_then(|data| data.layers.get_mut(index))
            .and_then(|layer| layer.texture_names.get_mut(sampler))
        {
            *texture = name.to_string();
            self.modified = true;
        }
    }

    /// The blend map of a layer, the base layer `0` has none.
    pub fn blend_map(&self, layer: usize) -> Option<&BlendMap> {
        self.data.as_ref()?.blend_maps.get(layer.checked_sub(1)?)
    }

    pub fn blend_map_mut(&mut self, layer: usize) -> Option<&mut BlendMap> {
        self.data.as_mut()?.blend_maps.get_mut(layer.checked_sub(1)?)
    }

    /// Moves the dirty rectangles of the blend maps into the composite map.
    pub fn update_blend_maps(&mut self) {
        let Some(data) = &mut self.data else {
            return;
        };

        let size = data.geometry.size;
        for blend_map in &mut data.blend_maps {
            let rect = mem::take(&mut blend_map.dirty_rect);
            if rect.is_null() {
                continue;
            }

            let ratio = (size - 1) as f32 / (blend_map.size().max(2) - 1) as f32;
            let scaled = TerrainRect::new(
                (rect.left as f32 * ratio).floor() as i64,
                (rect.top as f32 * ratio).floor() as i64,
                (rect.right as f32 * ratio).ceil() as i64,
                (rect.bottom as f32 * ratio).ceil() as i64,
            )
            .clamp_to(size);

            self.dirty_composite_rect.merge(&scaled);
            self.modified = true;
        }
    }

    pub fn neighbour_link(&self, neighbour: Neighbour) -> Option<&NeighbourLink> {
        self.neighbours[neighbour.index()].as_ref()
    }

    pub fn neighbour(&self, neighbour: Neighbour) -> Option<TerrainHandle> {
        self.neighbour_link(neighbour)
            .and_then(TerrainHandle::from_link)
    }

    /// Links `other` as the neighbour in direction `neighbour`, or clears the link.
    ///
    /// With `recalculate` the derived data along the shared edge is marked dirty,
    /// with `notify_other` the other terrain links back in the opposite direction.
    pub fn set_neighbour(
        &mut self,
        neighbour: Neighbour,
        other: Option<&TerrainHandle>,
        recalculate: bool,
        notify_other: bool,
    ) {
        let previous = mem::take(&mut self.neighbours[neighbour.index()]);
        let own_link = NeighbourLink {
            key: self.key,
            terrain: self.self_link.clone(),
        };

        if notify_other {
            if let Some(previous) = previous.as_ref().and_then(TerrainHandle::from_link) {
                if !other.is_some_and(|other| other.ptr_eq(&previous)) {
                    previous
                        .write()
                        .unlink_from(neighbour.opposite(), &own_link);
                }
            }
        }

        self.neighbours[neighbour.index()] = other.map(TerrainHandle::link);

        if recalculate {
            self.dirty_neighbour_edge(neighbour);
        }

        if notify_other {
            if let Some(other) = other {
                other
                    .write()
                    .set_neighbour_link(neighbour.opposite(), own_link, recalculate);
            }
        }
    }

    fn set_neighbour_link(&mut self, neighbour: Neighbour, link: NeighbourLink, recalculate: bool) {
        self.neighbours[neighbour.index()] = Some(link);

        if recalculate {
            self.dirty_neighbour_edge(neighbour);
        }
    }

    fn unlink_from(&mut self, neighbour: Neighbour, link: &NeighbourLink) {
        let slot = &mut self.neighbours[neighbour.index()];

        if slot
            .as_ref()
            .is_some_and(|current| Weak::ptr_eq(&current.terrain, &link.terrain))
        {
            *slot = None;
        }
    }

    fn dirty_neighbour_edge(&mut self, neighbour: Neighbour) {
        let rect = self.edge_rect(neighbour, 2);

        self.dirty_derived_rect.merge(&rect);
        self.dirty_lightmap_rect.merge(&rect);
    }

    /// Removes this terrain from all of its neighbours.
    pub fn detach_neighbours(&mut self) {
        for neighbour in Neighbour::ALL {
            let Some(link) = self.neighbours[neighbour.index()].take() else {
                continue;
            };

            if let Some(handle) = TerrainHandle::from_link(&link) {
                let own_link = NeighbourLink {
                    key: self.key,
                    terrain: self.self_link.clone(),
                };
                handle.write().unlink_from(neighbour.opposite(), &own_link);
            }
        }
    }

    /// The neighbour a vertex coordinate outside of this terrain belongs to.
    pub fn neighbour_index(&self, x: i64, y: i64) -> Option<Neighbour> {
        neighbours::neighbour_point_overflow(self.size(), x, y).map(|(neighbour, ..)| neighbour)
    }

    pub fn edge_rect(&self, neighbour: Neighbour, range: i64) -> TerrainRect {
        neighbour.edge_rect(self.size(), range)
    }

    /// Converts a rectangle of this terrain into the coordinates of a neighbour.
    pub fn neighbour_edge_rect(&self, neighbour: Neighbour, rect: &TerrainRect) -> TerrainRect {
        neighbour.neighbour_rect(self.size(), rect)
    }

    pub fn neighbour_point(&self, neighbour: Neighbour, x: i64, y: i64) -> (i64, i64) {
        neighbour.neighbour_point(self.size(), x, y)
    }

    pub fn neighbour_point_overflow(&self, x: i64, y: i64) -> Option<(Neighbour, i64, i64)> {
        neighbours::neighbour_point_overflow(self.size(), x, y)
    }

    /// A snapshot of the heights of all neighbours with the same size.
    pub fn neighbour_heights(&self) -> NeighbourHeights {
        let size = self.size();

        std::array::from_fn(|index| {
            let handle = self.neighbour(Neighbour::from_index(index))?;
            let terrain = handle.read();
            let data = terrain.data.as_ref()?;
            let heights = (data.geometry.size == size).then(|| data.heights.clone());
            heights
        })
    }

    /// The terrain space point of a vertex, read from a neighbour if it lies outside.
    pub fn point_from_self_or_neighbour(&self, x: i64, y: i64) -> Option<Vec3> {
        let data = self.data.as_ref()?;
        point_from_self_or_neighbour(&data.geometry, &data.heights, &self.neighbour_heights(), x, y)
    }

    /// Tells the neighbours about heights that changed along their edges.
    pub fn notify_neighbours(&mut self) {
        let rect = mem::take(&mut self.dirty_neighbour_rect);
        let Some(data) = &self.data else {
            return;
        };
        if rect.is_null() {
            return;
        }

        let size = data.geometry.size;
        let shadow_range = if self.options.cast_shadows {
            let neighbours = NeighbourHeights::default();
            derived::LightMarch::new(
                &data.geometry,
                &data.heights,
                &neighbours,
                self.terrain_vector(self.options.light_direction()),
            )
            .map(|march| march.run(self.min_height().unwrap_or_default()))
        } else {
            None
        };

        for neighbour in Neighbour::ALL {
            let Some(handle) = self.neighbour(neighbour) else {
                continue;
            };

            let edge = self.edge_rect(neighbour, 2).intersect(&rect);
            let edge = if edge.is_null() {
                TerrainRect::NULL
            } else {
                neighbour.neighbour_rect(size, &edge.widen(1))
            };

            let shadow = shadow_range.map_or(TerrainRect::NULL, |range| {
                neighbour.neighbour_rect(size, &rect.widen(range))
            });

            if edge.is_null() && shadow.is_null() {
                continue;
            }

            handle
                .write()
                .neighbour_modified(neighbour.opposite(), &edge, &shadow, self);
        }
    }

    /// Reacts to a change of the neighbour `source` in direction `neighbour`.
    ///
    /// Shared edge heights that differ are taken over from the neighbour, the derived data along
    /// the edge and the light map inside of `shadow_rect` are marked dirty.
    pub fn neighbour_modified(
        &mut self,
        neighbour: Neighbour,
        edge_rect: &TerrainRect,
        shadow_rect: &TerrainRect,
        source: &Terrain,
    ) {
        let (Some(data), Some(source_data)) = (&mut self.data, &source.data) else {
            return;
        };

        let size = data.geometry.size;
        if source_data.geometry.size != size {
            return;
        }

        if !edge_rect.is_null() {
            let shared = neighbour.edge_rect(size, 1).intersect(edge_rect);
            let mut changed = TerrainRect::NULL;

            for (y, x) in iproduct!(shared.top..shared.bottom, shared.left..shared.right) {
                let (sx, sy) = neighbour.neighbour_point(size, x, y);
                let Some(&height) = source_data.heights.get((sy as usize, sx as usize)) else {
                    continue;
                };

                let index = (y as usize, x as usize);
                if (data.heights[index] - height).abs() > 1e-3 {
                    Arc::make_mut(&mut data.heights)[index] = height;
                    changed.merge(&TerrainRect::new(x, y, x + 1, y + 1));
                }
            }

            if !changed.is_null() {
                self.dirty_geometry_rect.merge(&changed);
                self.dirty_composite_rect.merge(&changed);
                self.modified = true;
            }

            self.dirty_derived_rect.merge(edge_rect);
            self.dirty_lightmap_rect.merge(edge_rect);
        }

        if !shadow_rect.is_null() {
            self.dirty_lightmap_rect.merge(shadow_rect);
        }
    }
}

impl Drop for Terrain {
    fn drop(&mut self) {
        self.detach_neighbours();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{gpu::CpuBufferProvider, terrain::layers::SamplerFormat};
    use tempfile::tempdir;

    const SIZE: u16 = 65;

    fn import(source: HeightSource) -> ImportData {
        ImportData {
            size: SIZE,
            world_size: 640.0,
            max_batch_size: 33,
            min_batch_size: 17,
            source,
            ..Default::default()
        }
    }

    fn terrain(options: TerrainOptions) -> Terrain {
        Terrain::new(Arc::new(options), Arc::new(CpuBufferProvider::default()))
    }

    fn loaded(source: HeightSource) -> Terrain {
        let mut terrain = terrain(TerrainOptions::default());
        terrain.prepare_import(&import(source)).unwrap();
        terrain.load().unwrap();
        terrain
    }

    fn bumpy() -> HeightSource {
        HeightSource::Values(
            (0..SIZE as usize * SIZE as usize)
                .map(|i| ((i % 65) as f32 * 0.3).sin() * 10.0 + (i / 65) as f32 * 0.5)
                .collect(),
        )
    }

    #[test]
    fn lifecycle() {
        let mut terrain = terrain(TerrainOptions::default());
        assert!(matches!(terrain.load(), Err(TerrainError::NotPrepared)));

        terrain.prepare_import(&import(bumpy())).unwrap();
        assert!(terrain.is_prepared() && !terrain.is_loaded());
        assert!(terrain.is_modified());

        terrain.load().unwrap();
        assert!(terrain.is_loaded());
        assert_eq!(terrain.lod_manager().unwrap().highest_lod_loaded(), 0);
        assert!(terrain.render_batches().is_empty());
        terrain.calculate_lod(Vec3::new(0.0, 1000.0, 0.0), 1.0);
        assert!(!terrain.render_batches().is_empty());

        terrain.unload();
        assert!(!terrain.is_loaded());
        assert!(terrain.heights().is_some());

        terrain.unprepare();
        assert!(!terrain.is_prepared());
    }

    #[test]
    fn dirty_rects_coalesce() {
        let mut terrain = loaded(bumpy());
        terrain.update(true);
        assert!(terrain.dirty_derived_rect().is_null());

        terrain.dirty_rect(&TerrainRect::new(10, 10, 20, 20)).unwrap();
        terrain.dirty_rect(&TerrainRect::new(15, 5, 30, 18)).unwrap();

        assert_eq!(terrain.dirty_derived_rect(), TerrainRect::new(10, 5, 30, 20));
        assert_eq!(terrain.dirty_geometry_rect(), TerrainRect::new(10, 5, 30, 20));

        terrain.update(true);

        assert!(terrain.dirty_derived_rect().is_null());
        assert!(terrain.dirty_geometry_rect().is_null());
        assert!(!terrain.is_derived_data_update_in_progress());
    }

    #[test]
    fn derived_data_created_on_first_update() {
        let mut terrain = loaded(HeightSource::Constant(3.0));
        assert!(terrain.normal_map().is_none());

        terrain.update(true);

        let normal_map = terrain.normal_map().unwrap();
        assert_eq!(normal_map.len(), 65 * 65 * 3);
        assert_eq!(&normal_map[..3], &[128, 128, 255]);
        assert!(terrain.composite_map_revision().unwrap() >= 1);
    }

    #[test]
    fn requests_during_a_run_are_merged() {
        let mut terrain = loaded(bumpy());
        terrain.update(true);

        terrain.dirty_rect(&TerrainRect::new(0, 0, 4, 4)).unwrap();
        terrain.update_derived_data(false, DerivedDataMask::ALL);
        terrain.dirty_rect(&TerrainRect::new(60, 60, 65, 65)).unwrap();
        terrain.update_derived_data(false, DerivedDataMask::ALL);

        terrain.wait_for_derived_data();

        assert!(!terrain.is_derived_data_update_in_progress());
        assert!(terrain.derived.pending.is_empty());
        assert!(terrain.derived.pending_rect.is_null());
    }

    #[test]
    fn height_edits_reach_the_deltas() {
        let mut terrain = loaded(HeightSource::Constant(0.0));
        terrain.update(true);
        assert_eq!(terrain.deltas().unwrap()[(5, 5)], 0.0);

        terrain.set_height_at_point(5, 5, 40.0).unwrap();
        terrain.update(true);

        assert_eq!(terrain.deltas().unwrap()[(5, 5)], -40.0);
        assert_eq!(terrain.max_height(), Some(40.0));
        let (min, max) = terrain.quadtree().unwrap().aabb().unwrap();
        assert_eq!((min.y, max.y), (0.0, 40.0));
    }

    #[test]
    fn heights_interpolate_across_cells() {
        let heights = (0..65 * 65)
            .map(|i| (i % 65) as f32 * 3.0 + (i / 65) as f32 * 2.0)
            .collect();
        let mut terrain = terrain(TerrainOptions::default());
        terrain.prepare_import(&import(HeightSource::Values(heights))).unwrap();
        terrain.set_position(Vec3::new(0.0, 100.0, 0.0));

        let height = terrain
            .height_at_terrain_position(10.5 / 64.0, 21.25 / 64.0)
            .unwrap();
        assert!((height - 74.0).abs() < 1e-3);

        // terrain x maps to world x, terrain y to world -z
        let world = terrain.position_of(Vec3::new(0.5, 0.5, 0.0)).unwrap();
        assert_eq!(world, Vec3::new(0.0, 100.0, 0.0));
        let height = terrain.height_at_world_position(world).unwrap();
        assert!((height - (100.0 + 32.0 * 5.0)).abs() < 1e-3);
    }

    #[test]
    fn save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("terrain.dat");

        let mut terrain = loaded(bumpy());
        terrain.update(true);
        terrain.save(&path).unwrap();
        assert!(!terrain.is_modified());

        let mut reloaded = self::terrain(TerrainOptions::default());
        reloaded.load_file(&path).unwrap();

        assert!(!reloaded.is_modified());
        assert_eq!(reloaded.heights(), terrain.heights());
        assert_eq!(reloaded.deltas(), terrain.deltas());
        assert_eq!(reloaded.normal_map(), terrain.normal_map());
        assert_eq!(
            reloaded.quadtree().unwrap().max_height_delta_table(),
            terrain.quadtree().unwrap().max_height_delta_table()
        );
        assert_eq!(reloaded.file(), Some(path.as_path()));
    }

    #[test]
    fn streamed_terrain_refines_near_the_viewer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("terrain.dat");
        loaded(bumpy()).save(&path).unwrap();

        let mut terrain = terrain(TerrainOptions {
            initial_lod_level: Some(2),
            ..TerrainOptions::default()
        });
        terrain.load_file(&path).unwrap();
        assert_eq!(terrain.lod_manager().unwrap().highest_lod_loaded(), 2);

        terrain.auto_update_lod(Vec3::new(0.0, 10.0, 0.0), 1e6, true);

        let manager = terrain.lod_manager().unwrap();
        assert_eq!(manager.highest_lod_loaded(), 0);
        assert_eq!(manager.read_log(), &[(1, 0)]);

        // saving a fully streamed terrain needs no further reads
        terrain.save(dir.path().join("copy.dat")).unwrap();
        assert_eq!(terrain.lod_manager().unwrap().read_log().len(), 1);
    }

    #[test]
    fn streamed_levels_invalidate_derived_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("terrain.dat");
        loaded(bumpy()).save(&path).unwrap();

        let mut terrain = terrain(TerrainOptions {
            initial_lod_level: Some(2),
            ..TerrainOptions::default()
        });
        terrain.load_file(&path).unwrap();
        terrain.update(true);
        assert!(terrain.dirty_derived_rect().is_null());

        terrain.update_lod_level(0, true);

        let full = TerrainRect::full(65);
        assert_eq!(terrain.dirty_derived_rect(), full);
        assert_eq!(terrain.dirty_lightmap_rect(), full);
        assert_eq!(terrain.dirty_composite_rect(), full);
        // the quadtree already took the streamed heights and the file is unchanged
        assert!(terrain.dirty_geometry_rect().is_null());
        assert!(!terrain.is_modified());

        terrain.update(true);
        assert!(terrain.dirty_derived_rect().is_null());

        // nothing new was streamed
        terrain.update_lod_level(0, true);
        assert!(terrain.dirty_derived_rect().is_null());
    }

    #[test]
    fn edits_need_a_loaded_terrain() {
        let mut prepared = terrain(TerrainOptions::default());
        prepared.prepare_import(&import(bumpy())).unwrap();
        assert!(prepared.is_prepared() && !prepared.is_loaded());
        let before = prepared.height_at_point(3, 3);

        assert!(matches!(
            prepared.set_height_at_point(3, 3, 99.0),
            Err(TerrainError::NotLoaded)
        ));
        assert!(matches!(
            prepared.dirty_rect(&TerrainRect::new(0, 0, 8, 8)),
            Err(TerrainError::NotLoaded)
        ));
        assert!(matches!(prepared.dirty(), Err(TerrainError::NotLoaded)));

        assert_eq!(prepared.height_at_point(3, 3), before);
        assert!(prepared.dirty_derived_rect().is_null());
        assert!(prepared.dirty_geometry_rect().is_null());

        let mut unprepared = terrain(TerrainOptions::default());
        assert!(matches!(
            unprepared.set_height_at_point(0, 0, 1.0),
            Err(TerrainError::NotPrepared)
        ));
    }

    #[test]
    fn layers_own_blend_maps() {
        let mut terrain = terrain(TerrainOptions {
            layer_blend_map_size: 32,
            ..TerrainOptions::default()
        });
        terrain
            .prepare_import(&ImportData {
                layer_declaration: LayerDeclaration::new([
                    ("albedo", SamplerFormat::Rgba8),
                    ("normal", SamplerFormat::Rgba8),
                ]),
                layers: vec![LayerInstance::default(); 2],
                ..import(HeightSource::Constant(0.0))
            })
            .unwrap();

        assert_eq!(terrain.layer_count(), 2);
        assert!(terrain.blend_map(0).is_none());
        assert_eq!(terrain.blend_map(1).unwrap().size(), 32);

        assert!(terrain.add_layer(None, 8.0, vec!["rock".to_string()]));
        assert_eq!(terrain.layer_count(), 3);
        assert_eq!(terrain.layer_texture_name(2, 0), Some("rock"));
        assert_eq!(terrain.layer_texture_name(2, 1), Some(""));

        terrain.blend_map_mut(2).unwrap().set_blend_value(0, 0, 1.0);
        terrain.update_blend_maps();
        assert_eq!(terrain.dirty_composite_rect(), TerrainRect::new(0, 0, 3, 3));

        terrain.remove_layer(1);
        assert_eq!(terrain.layer_count(), 2);
        assert_eq!(terrain.layer_world_size(1), Some(8.0));
        assert_eq!(terrain.blend_map(1).unwrap().blend_value(0, 0), 1.0);

        for _ in 0..6 {
            terrain.add_layer(None, 1.0, Vec::new());
        }
        assert_eq!(terrain.layer_count(), MAX_LAYERS);
        assert!(!terrain.add_layer(None, 1.0, Vec::new()));
    }

    #[test]
    fn neighbours_link_symmetrically() {
        let options = Arc::new(TerrainOptions::default());
        let provider: Arc<dyn GpuBufferProvider> = Arc::new(CpuBufferProvider::default());

        let west = TerrainHandle::new(options.clone(), provider.clone());
        let east = TerrainHandle::new(options, provider);
        for handle in [&west, &east] {
            let mut terrain = handle.write();
            terrain.prepare_import(&import(HeightSource::Constant(0.0))).unwrap();
            terrain.load().unwrap();
            terrain.update(true);
        }

        west.write()
            .set_neighbour(Neighbour::East, Some(&east), true, true);

        assert!(west.read().neighbour(Neighbour::East).unwrap().ptr_eq(&east));
        assert!(east.read().neighbour(Neighbour::West).unwrap().ptr_eq(&west));
        assert!(!east.read().dirty_derived_rect().is_null());

        // an edit on the shared edge is copied over
        {
            let mut terrain = west.write();
            terrain.set_height_at_point(64, 10, 50.0).unwrap();
            terrain.update(true);
        }
        assert_eq!(east.read().height_at_point(0, 10), Some(50.0));
        assert_eq!(
            east.read().dirty_geometry_rect(),
            TerrainRect::new(0, 10, 1, 11)
        );

        drop(west);
        assert!(east.read().neighbour_link(Neighbour::West).is_none());
    }
}
