//! A sparse grid of terrains sharing alignment, size and world size.
//!
//! Slots are defined first, which only records where the terrain comes from. Loading a slot
//! prepares the terrain on a worker thread and finishes the load on the main thread in
//! [`TerrainGroup::process_responses`], where the terrain is also linked to its loaded neighbours.

use crate::{
    error::{TerrainError, TerrainResult},
    gpu::{GpuBufferProvider, TerrainId},
    math::{Alignment, GridKey},
    options::TerrainOptions,
    terrain::{
        layers::LayerInstance, DerivedDataMask, HeightSource, ImportData, Neighbour,
        PreparedTerrain, TerrainHandle,
    },
    terrain_data::validate_sizes,
    work::ResponseQueue,
};
use anyhow::{Context, Result};
use bevy::{
    log::{debug, error, info, warn},
    math::Vec3,
    utils::HashMap,
};
use image::DynamicImage;
use std::{
    mem,
    path::{Path, PathBuf},
    sync::Arc,
};

/// A ray gives up after crossing this many empty slots in a row.
const MAX_RAY_GAPS: f32 = 6.0;
const RAY_REFINE_STEPS: usize = 16;

/// Where the terrain of a slot comes from.
#[derive(Clone, Debug)]
pub enum TerrainDefinition {
    File(PathBuf),
    Import(Box<ImportData>),
}

impl TerrainDefinition {
    pub fn is_import(&self) -> bool {
        matches!(self, TerrainDefinition::Import(_))
    }
}

#[derive(Clone, Default)]
pub enum SlotInstance {
    #[default]
    Empty,
    /// Allocated on the main thread, waiting for its background prepare.
    Loading(TerrainHandle),
    Loaded(TerrainHandle),
}

/// One cell of the grid.
///
/// The definition is released once consumed if the import data asks for it,
/// a slot without definition and instance can not be loaded again.
pub struct TerrainSlot {
    pub x: i32,
    pub y: i32,
    definition: Option<TerrainDefinition>,
    instance: SlotInstance,
}

impl TerrainSlot {
    fn new(x: i32, y: i32) -> Self {
        Self {
            x,
            y,
            definition: None,
            instance: SlotInstance::Empty,
        }
    }

    pub fn key(&self) -> GridKey {
        GridKey::new(self.x, self.y)
    }

    pub fn definition(&self) -> Option<&TerrainDefinition> {
        self.definition.as_ref()
    }

    pub fn instance(&self) -> &SlotInstance {
        &self.instance
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.instance, SlotInstance::Loaded(_))
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.instance, SlotInstance::Loading(_))
    }

    fn terrain(&self) -> Option<&TerrainHandle> {
        match &self.instance {
            SlotInstance::Empty => None,
            SlotInstance::Loading(terrain) | SlotInstance::Loaded(terrain) => Some(terrain),
        }
    }

    fn loaded_terrain(&self) -> Option<&TerrainHandle> {
        match &self.instance {
            SlotInstance::Loaded(terrain) => Some(terrain),
            _ => None,
        }
    }

    /// Drops the instance, removing it from its neighbours first.
    fn free_instance(&mut self) -> bool {
        let Some(terrain) = mem::take(&mut self.instance).terrain_handle() else {
            return false;
        };

        let mut terrain = terrain.write();
        terrain.detach_neighbours();
        terrain.unprepare();

        true
    }
}

impl SlotInstance {
    fn terrain_handle(self) -> Option<TerrainHandle> {
        match self {
            SlotInstance::Empty => None,
            SlotInstance::Loading(terrain) | SlotInstance::Loaded(terrain) => Some(terrain),
        }
    }
}

struct LoadResponse {
    key: GridKey,
    terrain: TerrainId,
    result: Result<PreparedTerrain>,
}

/// The result of [`TerrainGroup::ray_intersects`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RayHit {
    pub key: GridKey,
    pub position: Vec3,
    pub distance: f32,
}

pub struct TerrainGroup {
    alignment: Alignment,
    terrain_size: u16,
    terrain_world_size: f32,
    origin: Vec3,
    directory: PathBuf,
    filename_prefix: String,
    filename_extension: String,
    default_import_data: ImportData,
    options: Arc<TerrainOptions>,
    provider: Arc<dyn GpuBufferProvider>,
    slots: HashMap<GridKey, TerrainSlot>,
    responses: ResponseQueue<LoadResponse>,
}

impl TerrainGroup {
    pub fn new(
        alignment: Alignment,
        terrain_size: u16,
        terrain_world_size: f32,
        options: TerrainOptions,
        provider: Arc<dyn GpuBufferProvider>,
    ) -> Self {
        Self {
            alignment,
            terrain_size,
            terrain_world_size,
            origin: Vec3::ZERO,
            directory: PathBuf::new(),
            filename_prefix: "terrain".to_string(),
            filename_extension: "dat".to_string(),
            default_import_data: ImportData {
                alignment,
                size: terrain_size,
                world_size: terrain_world_size,
                ..Default::default()
            },
            options: Arc::new(options),
            provider,
            slots: HashMap::default(),
            responses: ResponseQueue::default(),
        }
    }

    pub fn alignment(&self) -> Alignment {
        self.alignment
    }

    pub fn terrain_size(&self) -> u16 {
        self.terrain_size
    }

    pub fn terrain_world_size(&self) -> f32 {
        self.terrain_world_size
    }

    pub fn options(&self) -> &Arc<TerrainOptions> {
        &self.options
    }

    pub fn origin(&self) -> Vec3 {
        self.origin
    }

    /// Moves the whole grid, repositioning every instance.
    pub fn set_origin(&mut self, origin: Vec3) {
        if origin == self.origin {
            return;
        }

        self.origin = origin;

        for slot in self.slots.values() {
            if let Some(terrain) = slot.terrain() {
                let position = self.terrain_slot_position(slot.x, slot.y);
                terrain.write().set_position(position);
            }
        }
    }

    /// Changes the vertex count of future terrains, only allowed while no terrain exists.
    pub fn set_terrain_size(&mut self, size: u16) -> TerrainResult<()> {
        self.ensure_empty()?;
        self.terrain_size = size;
        self.default_import_data.size = size;
        Ok(())
    }

    pub fn set_terrain_world_size(&mut self, world_size: f32) -> TerrainResult<()> {
        self.ensure_empty()?;
        self.terrain_world_size = world_size;
        self.default_import_data.world_size = world_size;
        Ok(())
    }

    fn ensure_empty(&self) -> TerrainResult<()> {
        if self.slots.values().any(|slot| slot.terrain().is_some()) {
            return Err(TerrainError::GroupNotEmpty);
        }

        Ok(())
    }

    /// The directory default file names are resolved against.
    pub fn set_directory<P: Into<PathBuf>>(&mut self, directory: P) {
        self.directory = directory.into();
    }

    pub fn set_filename_prefix(&mut self, prefix: &str) {
        self.filename_prefix = prefix.to_string();
    }

    pub fn set_filename_extension(&mut self, extension: &str) {
        self.filename_extension = extension.to_string();
    }

    pub fn set_filename_convention(&mut self, prefix: &str, extension: &str) {
        self.set_filename_prefix(prefix);
        self.set_filename_extension(extension);
    }

    pub fn generate_filename(&self, x: i32, y: i32) -> PathBuf {
        self.directory.join(
            GridKey::new(x, y).filename(&self.filename_prefix, &self.filename_extension),
        )
    }

    /// The template every import definition starts from.
    pub fn default_import_data(&self) -> &ImportData {
        &self.default_import_data
    }

    pub fn default_import_data_mut(&mut self) -> &mut ImportData {
        &mut self.default_import_data
    }

    fn slot_mut(&mut self, x: i32, y: i32) -> &mut TerrainSlot {
        self.slots
            .entry(GridKey::new(x, y))
            .or_insert_with(|| TerrainSlot::new(x, y))
    }

    fn set_definition(&mut self, x: i32, y: i32, definition: TerrainDefinition) {
        let slot = self.slot_mut(x, y);
        slot.free_instance();
        slot.definition = Some(definition);

        debug!("defined terrain slot ({x}, {y})");
    }

    /// Defines the slot to load from its default file name.
    pub fn define_terrain(&mut self, x: i32, y: i32) {
        let path = self.generate_filename(x, y);
        self.define_terrain_file(x, y, path);
    }

    pub fn define_terrain_file<P: Into<PathBuf>>(&mut self, x: i32, y: i32, path: P) {
        self.set_definition(x, y, TerrainDefinition::File(path.into()));
    }

    pub fn define_terrain_constant(&mut self, x: i32, y: i32, height: f32) -> TerrainResult<()> {
        self.define_terrain_source(x, y, HeightSource::Constant(height), None)
    }

    /// Defines the slot from one height per vertex, row by row.
    pub fn define_terrain_heights(
        &mut self,
        x: i32,
        y: i32,
        heights: Vec<f32>,
        layers: Option<Vec<LayerInstance>>,
    ) -> TerrainResult<()> {
        let expected = self.terrain_size as usize * self.terrain_size as usize;
        if heights.len() != expected {
            return Err(TerrainError::HeightDataMismatch {
                expected,
                actual: heights.len(),
            });
        }

        self.define_terrain_source(x, y, HeightSource::Values(heights), layers)
    }

    pub fn define_terrain_image(
        &mut self,
        x: i32,
        y: i32,
        image: DynamicImage,
        layers: Option<Vec<LayerInstance>>,
    ) -> TerrainResult<()> {
        self.define_terrain_source(x, y, HeightSource::Image(image), layers)
    }

    fn define_terrain_source(
        &mut self,
        x: i32,
        y: i32,
        source: HeightSource,
        layers: Option<Vec<LayerInstance>>,
    ) -> TerrainResult<()> {
        let mut import = self.default_import_data.clone();
        import.source = source;
        if let Some(layers) = layers {
            import.layers = layers;
        }

        self.define_terrain_import(x, y, import)
    }

    /// Defines the slot from import data. Alignment, size and world size are taken from the group.
    pub fn define_terrain_import(
        &mut self,
        x: i32,
        y: i32,
        mut import: ImportData,
    ) -> TerrainResult<()> {
        import.alignment = self.alignment;
        import.size = self.terrain_size;
        import.world_size = self.terrain_world_size;

        validate_sizes(import.size, import.max_batch_size, import.min_batch_size)?;
        if !import.layers.is_empty() && import.layer_declaration.is_empty() {
            return Err(TerrainError::MissingLayerDeclaration);
        }
        if !import.layer_declaration.is_valid() {
            return Err(TerrainError::InvalidLayerElement);
        }

        self.set_definition(x, y, TerrainDefinition::Import(Box::new(import)));
        Ok(())
    }

    /// Starts loading a defined slot, see [`Self::process_responses`].
    /// Slots which are already loading or loaded are left alone.
    pub fn load_terrain(&mut self, x: i32, y: i32, synchronous: bool) -> TerrainResult<()> {
        self.load_slot(GridKey::new(x, y), synchronous)
    }

    pub fn load_all_terrains(&mut self, synchronous: bool) {
        let keys = self.slots.keys().copied().collect::<Vec<_>>();

        for key in keys {
            if let Err(err) = self.load_slot(key, synchronous) {
                warn!("{err}");
            }
        }
    }

    fn load_slot(&mut self, key: GridKey, synchronous: bool) -> TerrainResult<()> {
        let options = self.options.clone();
        let provider = self.provider.clone();
        let synchronous = synchronous || options.force_synchronous;

        let slot = self
            .slots
            .get_mut(&key)
            .ok_or(TerrainError::Undefined(key))?;
        if slot.terrain().is_some() {
            return Ok(());
        }
        let definition = slot
            .definition
            .clone()
            .ok_or(TerrainError::Undefined(key))?;

        // allocated right away, so the slot is known to be loading
        let terrain = TerrainHandle::new(options.clone(), provider);
        let id = {
            let mut terrain = terrain.write();
            terrain.set_key(Some(key));
            terrain.id()
        };
        slot.instance = SlotInstance::Loading(terrain);

        debug!("loading terrain slot ({}, {})", slot.x, slot.y);

        let request = move || LoadResponse {
            key,
            terrain: id,
            result: match definition {
                TerrainDefinition::File(path) => PreparedTerrain::from_file(path, &options),
                TerrainDefinition::Import(import) => {
                    PreparedTerrain::from_import(&import, &options).map_err(Into::into)
                }
            },
        };

        if synchronous {
            let response = request();
            self.handle_response(response);
        } else {
            self.responses.add_request(request);
        }

        Ok(())
    }

    /// Finishes the background prepares that completed since the last call and polls the
    /// background work of every loaded terrain. Returns the number of terrains that finished loading.
    pub fn process_responses(&mut self) -> usize {
        let mut loaded = 0;

        while let Some(response) = self.responses.try_next() {
            loaded += self.handle_response(response) as usize;
        }

        for slot in self.slots.values() {
            if let Some(terrain) = slot.loaded_terrain() {
                terrain.write().poll();
            }
        }

        loaded
    }

    /// Blocks until every requested load was processed.
    pub fn wait_for_loads(&mut self) -> usize {
        let mut loaded = 0;

        while let Some(response) = self.responses.next_blocking() {
            loaded += self.handle_response(response) as usize;
        }

        loaded
    }

    pub fn loads_in_flight(&self) -> usize {
        self.responses.in_flight()
    }

    fn handle_response(&mut self, response: LoadResponse) -> bool {
        let LoadResponse {
            key,
            terrain: id,
            result,
        } = response;

        let position = self.terrain_slot_position(key.x(), key.y());
        let Some(slot) = self.slots.get_mut(&key) else {
            debug!("discarding the load of removed terrain slot {key}");
            return false;
        };

        let terrain = match &slot.instance {
            SlotInstance::Loading(terrain) if terrain.read().id() == id => terrain.clone(),
            _ => {
                debug!("discarding the outdated load of terrain slot {key}");
                return false;
            }
        };

        let prepared = match result {
            Ok(prepared) => prepared,
            Err(err) => {
                error!(
                    "failed to prepare the terrain at ({}, {}): {err:?}",
                    slot.x, slot.y
                );
                slot.instance = SlotInstance::Empty;
                return false;
            }
        };

        let loaded = {
            let mut terrain = terrain.write();
            terrain.prepare(prepared);
            terrain.set_position(position);
            terrain.load()
        };

        if let Err(err) = loaded {
            error!(
                "failed to load the terrain at ({}, {}): {err}",
                slot.x, slot.y
            );
            slot.instance = SlotInstance::Empty;
            return false;
        }

        let imported = match &slot.definition {
            Some(TerrainDefinition::Import(import)) => {
                if import.delete_input_data {
                    slot.definition = None;
                }
                true
            }
            _ => false,
        };

        slot.instance = SlotInstance::Loaded(terrain.clone());
        info!("loaded terrain ({}, {})", slot.x, slot.y);

        self.connect_neighbours(key, &terrain, imported);

        true
    }

    /// Links a freshly loaded terrain with every loaded terrain around it, in both directions.
    fn connect_neighbours(&self, key: GridKey, terrain: &TerrainHandle, recalculate: bool) {
        for neighbour in Neighbour::ALL {
            let (dx, dy) = neighbour.offset();
            let Some(other) = self
                .slots
                .get(&key.offset(dx, dy))
                .and_then(TerrainSlot::loaded_terrain)
            else {
                continue;
            };

            terrain
                .write()
                .set_neighbour(neighbour, Some(other), recalculate, true);
        }
    }

    /// Drops the instance of a slot but keeps its definition.
    pub fn unload_terrain(&mut self, x: i32, y: i32) {
        if let Some(slot) = self.slots.get_mut(&GridKey::new(x, y)) {
            if slot.free_instance() {
                debug!("unloaded terrain ({x}, {y})");
            }
        }
    }

    pub fn remove_terrain(&mut self, x: i32, y: i32) {
        if let Some(mut slot) = self.slots.remove(&GridKey::new(x, y)) {
            slot.free_instance();
            debug!("removed terrain slot ({x}, {y})");
        }
    }

    pub fn remove_all_terrains(&mut self) {
        for (_, mut slot) in self.slots.drain() {
            slot.free_instance();
        }

        debug!("removed all terrain slots");
    }

    /// Saves loaded terrains to their definition file, or their default file name.
    ///
    /// With `replace_manual_filenames` every terrain is saved under its default file name
    /// and its definition changed accordingly.
    pub fn save_all_terrains(
        &mut self,
        only_if_modified: bool,
        replace_manual_filenames: bool,
    ) -> Result<()> {
        let keys = self.slots.keys().copied().collect::<Vec<_>>();

        for key in keys {
            let default_path = self.generate_filename(key.x(), key.y());
            let Some(slot) = self.slots.get_mut(&key) else {
                continue;
            };
            let Some(terrain) = slot.loaded_terrain().cloned() else {
                continue;
            };

            let mut terrain = terrain.write();
            if only_if_modified && !terrain.is_modified() {
                continue;
            }

            if replace_manual_filenames {
                slot.definition = Some(TerrainDefinition::File(default_path.clone()));
            }

            let path = match &slot.definition {
                Some(TerrainDefinition::File(path)) => path.clone(),
                _ => default_path,
            };

            terrain
                .save(&path)
                .with_context(|| format!("failed to save terrain ({}, {})", slot.x, slot.y))?;

            // without import data the slot can only be reloaded from the saved file
            if slot.definition.is_none() {
                slot.definition = Some(TerrainDefinition::File(path));
            }
        }

        Ok(())
    }

    pub fn terrain_definition(&self, x: i32, y: i32) -> Option<&TerrainDefinition> {
        self.terrain_slot(x, y)?.definition()
    }

    /// The instance of a slot, which may still be loading.
    pub fn terrain(&self, x: i32, y: i32) -> Option<TerrainHandle> {
        self.terrain_slot(x, y)?.terrain().cloned()
    }

    pub fn loaded_terrain(&self, x: i32, y: i32) -> Option<TerrainHandle> {
        self.terrain_slot(x, y)?.loaded_terrain().cloned()
    }

    pub fn terrain_slot(&self, x: i32, y: i32) -> Option<&TerrainSlot> {
        self.slots.get(&GridKey::new(x, y))
    }

    pub fn slots(&self) -> impl Iterator<Item = &TerrainSlot> {
        self.slots.values()
    }

    /// All loaded terrains.
    pub fn terrains(&self) -> impl Iterator<Item = (GridKey, &TerrainHandle)> {
        self.slots
            .iter()
            .filter_map(|(key, slot)| Some((*key, slot.loaded_terrain()?)))
    }

    pub fn convert_world_position_to_terrain_slot(&self, position: Vec3) -> (i32, i32) {
        let terrain = self.alignment.world_to_terrain(position - self.origin);
        let offset = self.terrain_world_size * 0.5;

        (
            ((terrain.x + offset) / self.terrain_world_size).floor() as i32,
            ((terrain.y + offset) / self.terrain_world_size).floor() as i32,
        )
    }

    /// The world position of the centre of a slot.
    pub fn convert_terrain_slot_to_world_position(&self, x: i32, y: i32) -> Vec3 {
        self.terrain_slot_position(x, y)
    }

    fn terrain_slot_position(&self, x: i32, y: i32) -> Vec3 {
        let terrain = Vec3::new(
            x as f32 * self.terrain_world_size,
            y as f32 * self.terrain_world_size,
            0.0,
        );

        self.alignment.terrain_to_world(terrain) + self.origin
    }

    /// The terrain height at a world position, together with the slot it was taken from.
    pub fn height_at_world_position(&self, position: Vec3) -> Option<(f32, GridKey)> {
        let (x, y) = self.convert_world_position_to_terrain_slot(position);
        let terrain = self.terrain_slot(x, y)?.loaded_terrain()?;
        let height = terrain.read().height_at_world_position(position)?;

        Some((height, GridKey::new(x, y)))
    }

    /// Marches a ray over the loaded terrains and returns the first point below the surface.
    ///
    /// Without `distance_limit` the search ends once the ray crossed several empty slots in a row.
    pub fn ray_intersects(
        &self,
        origin: Vec3,
        direction: Vec3,
        distance_limit: Option<f32>,
    ) -> Option<RayHit> {
        let direction = direction.try_normalize()?;
        let up = self.alignment.up();
        let step = self.terrain_world_size / (self.terrain_size.max(2) - 1) as f32;
        let max_gap = self.terrain_world_size * MAX_RAY_GAPS;
        let limit = distance_limit.unwrap_or(f32::INFINITY);

        let depth = |distance: f32| {
            let point = origin + direction * distance;
            self.height_at_world_position(point)
                .map(|(height, key)| (point.dot(up) - height, key))
        };

        let mut previous = None;
        let mut gap = 0.0;
        let mut distance = 0.0;

        while distance <= limit && gap <= max_gap {
            match depth(distance) {
                Some((above, key)) if above <= 0.0 => {
                    let Some(mut above_distance) = previous else {
                        return Some(RayHit {
                            key,
                            position: origin,
                            distance: 0.0,
                        });
                    };

                    let mut below_distance = distance;
                    let mut hit_key = key;
                    for _ in 0..RAY_REFINE_STEPS {
                        let middle = (above_distance + below_distance) * 0.5;
                        match depth(middle) {
                            Some((above, key)) if above <= 0.0 => {
                                below_distance = middle;
                                hit_key = key;
                            }
                            _ => above_distance = middle,
                        }
                    }

                    return Some(RayHit {
                        key: hit_key,
                        position: origin + direction * below_distance,
                        distance: below_distance,
                    });
                }
                Some(_) => {
                    previous = Some(distance);
                    gap = 0.0;
                }
                None => {
                    previous = None;
                    gap += step;
                }
            }

            distance += step;
        }

        None
    }

    /// The loaded terrains whose world bounds intersect the box.
    pub fn box_intersects(&self, min: Vec3, max: Vec3) -> Vec<GridKey> {
        self.terrains()
            .filter(|(_, terrain)| {
                terrain.read().world_aabb().is_some_and(|(aabb_min, aabb_max)| {
                    aabb_min.cmple(max).all() && aabb_max.cmpge(min).all()
                })
            })
            .map(|(key, _)| key)
            .collect()
    }

    /// The loaded terrains whose world bounds intersect the sphere.
    pub fn sphere_intersects(&self, centre: Vec3, radius: f32) -> Vec<GridKey> {
        self.terrains()
            .filter(|(_, terrain)| {
                terrain.read().world_aabb().is_some_and(|(aabb_min, aabb_max)| {
                    centre.clamp(aabb_min, aabb_max).distance_squared(centre) <= radius * radius
                })
            })
            .map(|(key, _)| key)
            .collect()
    }

    pub fn update(&mut self, synchronous: bool) {
        // geometry first, so neighbours see each others edges before their derived data runs
        self.update_geometry();
        self.update_derived_data(synchronous, DerivedDataMask::ALL);
    }

    pub fn update_geometry(&mut self) {
        for (_, terrain) in self.terrains() {
            terrain.write().update_geometry();
        }
    }

    pub fn update_derived_data(&mut self, synchronous: bool, mask: DerivedDataMask) {
        for (_, terrain) in self.terrains() {
            terrain.write().update_derived_data(synchronous, mask);
        }
    }

    pub fn is_derived_data_update_in_progress(&self) -> bool {
        self.terrains()
            .any(|(_, terrain)| terrain.read().is_derived_data_update_in_progress())
    }

    /// Streams the lods of every loaded terrain for a world space viewpoint.
    pub fn auto_update_lod(&mut self, viewpoint: Vec3, cfactor: f32, synchronous: bool) {
        for (_, terrain) in self.terrains() {
            terrain
                .write()
                .auto_update_lod(viewpoint, cfactor, synchronous);
        }
    }

    /// Selects the rendered batches of every loaded terrain.
    pub fn calculate_lod(&mut self, viewpoint: Vec3, cfactor: f32) {
        for (_, terrain) in self.terrains() {
            terrain.write().calculate_lod(viewpoint, cfactor);
        }
    }

    /// Releases the import data of loaded slots, which were only kept to allow reloading.
    /// Such slots need to be saved before they can be loaded again.
    pub fn free_temporary_resources(&mut self) {
        for slot in self.slots.values_mut() {
            if slot.is_loaded() && slot.definition.as_ref().is_some_and(TerrainDefinition::is_import)
            {
                slot.definition = None;
            }
        }
    }

    /// The file a slot was loaded from or would be saved to.
    pub fn terrain_file(&self, x: i32, y: i32) -> PathBuf {
        match self.terrain_definition(x, y) {
            Some(TerrainDefinition::File(path)) => path.clone(),
            _ => self.generate_filename(x, y),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl Drop for TerrainGroup {
    fn drop(&mut self) {
        self.remove_all_terrains();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::CpuBufferProvider;
    use tempfile::tempdir;

    fn group(size: u16, world_size: f32) -> TerrainGroup {
        let mut group = TerrainGroup::new(
            Alignment::XZ,
            size,
            world_size,
            TerrainOptions::default(),
            Arc::new(CpuBufferProvider::default()),
        );
        group.default_import_data_mut().max_batch_size = 33;
        group
    }

    #[test]
    fn adjacent_slots_become_neighbours() {
        let mut group = TerrainGroup::new(
            Alignment::XZ,
            513,
            1000.0,
            TerrainOptions::default(),
            Arc::new(CpuBufferProvider::default()),
        );
        group.define_terrain_constant(0, 0, 0.0).unwrap();
        group.define_terrain_constant(1, 0, 0.0).unwrap();
        group.load_all_terrains(true);

        let west = group.loaded_terrain(0, 0).unwrap();
        let east = group.loaded_terrain(1, 0).unwrap();

        assert!(west.read().neighbour(Neighbour::East).unwrap().ptr_eq(&east));
        assert!(east.read().neighbour(Neighbour::West).unwrap().ptr_eq(&west));
        assert_eq!(
            east.read().neighbour_link(Neighbour::West).unwrap().key,
            Some(GridKey::new(0, 0))
        );
        assert!(west.read().neighbour(Neighbour::North).is_none());
        assert_eq!(east.read().position(), Vec3::new(1000.0, 0.0, 0.0));
    }

    #[test]
    fn diagonal_neighbours_and_unloading() {
        let mut group = group(65, 100.0);
        for (x, y) in [(0, 0), (1, 1), (0, 1)] {
            group.define_terrain_constant(x, y, 0.0).unwrap();
        }
        group.load_all_terrains(true);

        let origin = group.loaded_terrain(0, 0).unwrap();
        let corner = group.loaded_terrain(1, 1).unwrap();
        assert!(origin.read().neighbour(Neighbour::NorthEast).unwrap().ptr_eq(&corner));
        assert!(corner.read().neighbour(Neighbour::SouthWest).unwrap().ptr_eq(&origin));

        group.unload_terrain(1, 1);
        assert!(origin.read().neighbour(Neighbour::NorthEast).is_none());
        assert!(group.terrain_definition(1, 1).is_some());
        assert!(group.terrain(1, 1).is_none());

        group.load_terrain(1, 1, true).unwrap();
        let corner = group.loaded_terrain(1, 1).unwrap();
        assert!(origin.read().neighbour(Neighbour::NorthEast).unwrap().ptr_eq(&corner));

        group.remove_terrain(0, 1);
        assert!(group.terrain_slot(0, 1).is_none());
        assert!(origin.read().neighbour(Neighbour::North).is_none());
    }

    #[test]
    fn background_loads_finish_on_process() {
        let mut group = group(65, 100.0);
        group.define_terrain_constant(0, 0, 5.0).unwrap();
        group.define_terrain_constant(-1, 0, 5.0).unwrap();
        group.load_all_terrains(false);

        assert!(group.terrain_slot(0, 0).unwrap().is_loading());
        assert_eq!(group.wait_for_loads(), 2);
        assert_eq!(group.loads_in_flight(), 0);

        let east = group.loaded_terrain(0, 0).unwrap();
        let west = group.loaded_terrain(-1, 0).unwrap();
        assert!(east.read().neighbour(Neighbour::West).unwrap().ptr_eq(&west));
    }

    #[test]
    fn failed_prepare_keeps_the_definition() {
        let dir = tempdir().unwrap();
        let mut group = group(65, 100.0);
        group.set_directory(dir.path());
        group.define_terrain(3, -2);

        group.load_terrain(3, -2, true).unwrap();

        let slot = group.terrain_slot(3, -2).unwrap();
        assert!(matches!(slot.instance(), SlotInstance::Empty));
        assert!(matches!(
            slot.definition(),
            Some(TerrainDefinition::File(path)) if path.ends_with("terrain_0003fffe.dat")
        ));
    }

    #[test]
    fn invalid_definitions_are_rejected() {
        let mut group = group(100, 100.0);
        assert!(matches!(
            group.define_terrain_constant(0, 0, 0.0),
            Err(TerrainError::SizeNotPowerOfTwoPlusOne)
        ));

        let mut group = self::group(65, 100.0);
        assert!(matches!(
            group.define_terrain_heights(0, 0, vec![0.0; 10], None),
            Err(TerrainError::HeightDataMismatch { expected: 4225, actual: 10 })
        ));
        assert!(matches!(
            group.define_terrain_heights(0, 0, vec![0.0; 65 * 65], Some(vec![LayerInstance::default()])),
            Err(TerrainError::MissingLayerDeclaration)
        ));
        assert!(group.terrain_slot(0, 0).is_none());
        assert!(matches!(
            group.load_terrain(0, 0, true),
            Err(TerrainError::Undefined(_))
        ));
    }

    #[test]
    fn saved_terrains_reload_from_their_files() {
        let dir = tempdir().unwrap();

        let heights = (0..65 * 65).map(|i| (i % 7) as f32).collect::<Vec<_>>();
        {
            let mut group = group(65, 100.0);
            group.set_directory(dir.path());
            group.define_terrain_heights(2, 1, heights.clone(), None).unwrap();
            group.load_terrain(2, 1, true).unwrap();
            group.save_all_terrains(true, false).unwrap();

            assert!(!group.loaded_terrain(2, 1).unwrap().read().is_modified());
        }

        let mut group = group(65, 100.0);
        group.set_directory(dir.path());
        group.define_terrain(2, 1);
        group.load_terrain(2, 1, true).unwrap();

        let terrain = group.loaded_terrain(2, 1).unwrap();
        let terrain = terrain.read();
        assert_eq!(terrain.height_at_point(3, 0), Some(3.0));
        assert_eq!(terrain.height_at_point(0, 1), Some((65 % 7) as f32));
        assert_eq!(terrain.position(), Vec3::new(200.0, 0.0, -100.0));
    }

    #[test]
    fn slot_conversions() {
        let mut group = group(65, 100.0);
        group.set_origin(Vec3::new(10.0, 0.0, 10.0));

        assert_eq!(
            group.convert_terrain_slot_to_world_position(2, 1),
            Vec3::new(210.0, 0.0, -90.0)
        );
        assert_eq!(
            group.convert_world_position_to_terrain_slot(Vec3::new(210.0, 0.0, -90.0)),
            (2, 1)
        );
        assert_eq!(
            group.convert_world_position_to_terrain_slot(Vec3::new(-45.0, 0.0, 64.0)),
            (-1, -1)
        );

        group.define_terrain_constant(0, 0, 0.0).unwrap();
        group.load_terrain(0, 0, true).unwrap();
        assert!(matches!(
            group.set_terrain_size(129),
            Err(TerrainError::GroupNotEmpty)
        ));

        group.set_origin(Vec3::ZERO);
        assert_eq!(group.loaded_terrain(0, 0).unwrap().read().position(), Vec3::ZERO);
    }

    #[test]
    fn height_and_ray_queries() {
        let mut group = group(65, 100.0);
        group.define_terrain_constant(0, 0, 10.0).unwrap();
        group.define_terrain_constant(1, 0, 20.0).unwrap();
        group.load_all_terrains(true);

        let (height, key) = group
            .height_at_world_position(Vec3::new(5.0, 0.0, 5.0))
            .unwrap();
        assert!((height - 10.0).abs() < 1e-4);
        assert_eq!(key, GridKey::new(0, 0));

        let (height, key) = group
            .height_at_world_position(Vec3::new(120.0, 0.0, 5.0))
            .unwrap();
        assert!((height - 20.0).abs() < 1e-4);
        assert_eq!(key, GridKey::new(1, 0));
        assert_eq!(group.height_at_world_position(Vec3::new(0.0, 0.0, 500.0)), None);

        let hit = group
            .ray_intersects(Vec3::new(5.0, 100.0, 5.0), Vec3::NEG_Y, None)
            .unwrap();
        assert_eq!(hit.key, GridKey::new(0, 0));
        assert!((hit.position.y - 10.0).abs() < 1e-2);
        assert!((hit.distance - 90.0).abs() < 1e-2);

        // flies over the low terrain and hits the side of the high one
        let hit = group
            .ray_intersects(Vec3::new(-40.0, 15.0, 0.0), Vec3::X, None)
            .unwrap();
        assert_eq!(hit.key, GridKey::new(1, 0));

        assert!(group
            .ray_intersects(Vec3::new(-40.0, 50.0, 0.0), Vec3::X, None)
            .is_none());
        assert!(group
            .ray_intersects(Vec3::new(5.0, 100.0, 5.0), Vec3::NEG_Y, Some(50.0))
            .is_none());

        assert_eq!(
            group.box_intersects(Vec3::new(60.0, 0.0, -10.0), Vec3::new(70.0, 30.0, 10.0)),
            vec![GridKey::new(1, 0)]
        );
        let mut keys = group.sphere_intersects(Vec3::new(50.0, 15.0, 0.0), 5.0);
        keys.sort();
        assert_eq!(keys, vec![GridKey::new(0, 0), GridKey::new(1, 0)]);
    }

    #[test]
    fn group_updates_reach_every_terrain() {
        let mut group = group(65, 100.0);
        group.define_terrain_constant(0, 0, 0.0).unwrap();
        group.define_terrain_constant(0, 1, 0.0).unwrap();
        group.load_all_terrains(true);
        group.update(true);

        let south = group.loaded_terrain(0, 0).unwrap();
        let north = group.loaded_terrain(0, 1).unwrap();
        assert!(north.read().normal_map().is_some());

        south.write().set_height_at_point(10, 64, 25.0).unwrap();
        group.update(true);

        assert_eq!(north.read().height_at_point(10, 0), Some(25.0));
        assert!(!group.is_derived_data_update_in_progress());

        group.free_temporary_resources();
        assert!(group.terrain_definition(0, 0).is_none());
    }
}
