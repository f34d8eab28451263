//! The quadtree which splits a terrain into renderable batches and selects their lod.

use crate::{
    gpu::{GpuBufferProvider, IndexBufferKey, PositionVertex, TerrainId, VertexBuffers},
    math::TerrainRect,
    terrain_data::{
        batch::{index_count, populate_index_buffer, BatchIndexData, VertexDataRecord},
        deltas::{DeltaNode, DeltaTree},
        TerrainGeometry,
    },
};
use bevy::math::{Vec2, Vec3};
use ndarray::Array2;
use std::sync::Arc;

/// The lod threshold of skirt vertices, they never morph.
const SKIRT_LOD_THRESHOLD: f32 = 99.0;

/// The share of the distance between two transitions over which a batch morphs.
const MORPH_REGION: f32 = 0.25;

/// Calculates the factor which turns a height delta into the view distance,
/// at which the delta covers `max_pixel_error` pixels on screen.
pub fn cfactor(fov_y: f32, viewport_height: f32, max_pixel_error: f32) -> f32 {
    let a = 1.0 / (fov_y * 0.5).tan();
    let t = 2.0 * max_pixel_error / viewport_height;

    a / t
}

#[derive(Clone, Debug)]
pub struct LodLevel {
    pub batch_size: u16,
    pub max_height_delta: f32,
    last_cfactor: f32,
    last_transition_distance: f32,
    pub index: Option<BatchIndexData>,
}

impl LodLevel {
    fn new(batch_size: u16) -> Self {
        Self {
            batch_size,
            max_height_delta: 0.0,
            last_cfactor: 0.0,
            last_transition_distance: 0.0,
            index: None,
        }
    }

    fn transition_distance(&mut self, cfactor: f32) -> f32 {
        if self.last_cfactor != cfactor {
            self.last_cfactor = cfactor;
            self.last_transition_distance = self.max_height_delta * cfactor;
        }

        self.last_transition_distance
    }
}

#[derive(Clone, Debug)]
pub struct QuadTreeNode {
    pub offset_x: i64,
    pub offset_y: i64,
    /// The number of terrain vertices along one edge of the node.
    pub size: i64,
    pub base_lod: u16,
    pub depth: u16,
    pub parent: Option<usize>,
    pub children: Option<[usize; 4]>,
    pub lod_levels: Vec<LodLevel>,
    /// The centre of the node in local space, at height zero.
    pub local_centre: Vec3,
    pub aabb_min: Vec3,
    pub aabb_max: Vec3,
    pub bounding_radius: f32,
    pub current_lod: Option<u16>,
    pub lod_transition: f32,
    pub self_or_child_rendered: bool,
    /// Only set on the node at the top of the depth range sharing the record.
    pub vertex_data: Option<VertexDataRecord>,
    /// The node owning the record this node renders from.
    pub vertex_owner: Option<usize>,
}

impl QuadTreeNode {
    pub fn rect(&self) -> TerrainRect {
        TerrainRect::new(
            self.offset_x,
            self.offset_y,
            self.offset_x + self.size,
            self.offset_y + self.size,
        )
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    pub fn lod_count(&self) -> u16 {
        self.lod_levels.len() as u16
    }

    /// The morph parameter of the batch: the transition and the first lod which drops vertices.
    pub fn morph(&self) -> Vec2 {
        let lod = self.current_lod.unwrap_or(0);
        Vec2::new(self.lod_transition, (lod + self.base_lod + 1) as f32)
    }

    fn reset_bounds(&mut self) {
        self.aabb_min = Vec3::INFINITY;
        self.aabb_max = Vec3::NEG_INFINITY;
        self.bounding_radius = 0.0;
    }

    fn merge_into_bounds(&mut self, position: Vec3) {
        self.aabb_min = self.aabb_min.min(position);
        self.aabb_max = self.aabb_max.max(position);
        self.bounding_radius = self
            .bounding_radius
            .max((position - self.local_centre).length());
    }

    pub fn has_bounds(&self) -> bool {
        self.aabb_min.cmple(self.aabb_max).all()
    }
}

/// A batch selected for rendering by [`QuadTree::calculate_current_lod`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RenderBatch {
    pub node: usize,
    pub rect: TerrainRect,
    /// The global lod level of the batch.
    pub lod: u16,
    pub morph: Vec2,
    pub local_centre: Vec3,
    pub vertex_buffers: VertexBuffers,
    pub index: BatchIndexData,
}

pub struct QuadTree {
    geometry: TerrainGeometry,
    nodes: Vec<QuadTreeNode>,
    deltas: DeltaTree,
    terrain: TerrainId,
    provider: Arc<dyn GpuBufferProvider>,
}

impl QuadTree {
    pub fn new(
        geometry: &TerrainGeometry,
        terrain: TerrainId,
        provider: Arc<dyn GpuBufferProvider>,
    ) -> Self {
        let mut quadtree = Self {
            geometry: geometry.clone(),
            nodes: Vec::new(),
            deltas: DeltaTree::default(),
            terrain,
            provider,
        };

        quadtree.build_node(
            None,
            0,
            0,
            geometry.size as i64,
            geometry.num_lod_levels() - 1,
            0,
        );

        quadtree.deltas.nodes = quadtree
            .nodes
            .iter()
            .map(|node| DeltaNode {
                offset_x: node.offset_x,
                offset_y: node.offset_y,
                size: node.size,
                base_lod: node.base_lod,
                children: node.children,
                calc_max_height_delta: vec![0.0; node.lod_levels.len()],
                child_with_max_height_delta: None,
            })
            .collect();

        quadtree
    }

    fn build_node(
        &mut self,
        parent: Option<usize>,
        offset_x: i64,
        offset_y: i64,
        size: i64,
        lod: u16,
        depth: u16,
    ) -> usize {
        let geometry = &self.geometry;
        let mid = (size - 1) / 2;
        let index = self.nodes.len();

        let (base_lod, lod_levels) = if (geometry.max_batch_size as i64) < size {
            (lod, vec![LodLevel::new(geometry.min_batch_size)])
        } else {
            let levels = (0..geometry.lod_levels.leaf_lods)
                .map(|i| LodLevel::new(((geometry.max_batch_size - 1) >> i) + 1))
                .collect();
            (0, levels)
        };

        let mut node = QuadTreeNode {
            offset_x,
            offset_y,
            size,
            base_lod,
            depth,
            parent,
            children: None,
            lod_levels,
            local_centre: geometry.point(offset_x + mid, offset_y + mid, 0.0),
            aabb_min: Vec3::ZERO,
            aabb_max: Vec3::ZERO,
            bounding_radius: 0.0,
            current_lod: None,
            lod_transition: 0.0,
            self_or_child_rendered: false,
            vertex_data: None,
            vertex_owner: None,
        };
        node.reset_bounds();

        let split = (geometry.max_batch_size as i64) < size;
        self.nodes.push(node);

        if split {
            let child_size = (size - 1) / 2 + 1;
            let child_offset = child_size - 1;

            let children = [(0, 0), (child_offset, 0), (0, child_offset), (child_offset, child_offset)]
                .map(|(x, y)| {
                    self.build_node(
                        Some(index),
                        offset_x + x,
                        offset_y + y,
                        child_size,
                        lod - 1,
                        depth + 1,
                    )
                });

            self.nodes[index].children = Some(children);
        }

        index
    }

    pub fn geometry(&self) -> &TerrainGeometry {
        &self.geometry
    }

    pub fn nodes(&self) -> &[QuadTreeNode] {
        &self.nodes
    }

    pub fn root(&self) -> &QuadTreeNode {
        &self.nodes[0]
    }

    /// The bounds of the terrain in local space, if any vertex data is assigned.
    pub fn aabb(&self) -> Option<(Vec3, Vec3)> {
        let root = self.root();
        root.has_bounds().then_some((root.aabb_min, root.aabb_max))
    }

    pub fn bounding_radius(&self) -> f32 {
        self.root().bounding_radius
    }

    /// Creates the vertex data for all nodes of the depth range `start..end`, sampled at `resolution`.
    ///
    /// Nodes at depth `start` own a record of `size` vertices per edge,
    /// their descendants down to `end` render out of that record.
    /// Always rebuilds the records, callers skip ranges they assigned already.
    pub fn assign_vertex_data(
        &mut self,
        start: u16,
        end: u16,
        resolution: u16,
        size: u16,
        heights: &Array2<f32>,
        deltas: &Array2<f32>,
    ) {
        self.assign_node(0, start, end, resolution, size, heights, deltas);
    }

    #[allow(clippy::too_many_arguments)]
    fn assign_node(
        &mut self,
        index: usize,
        start: u16,
        end: u16,
        resolution: u16,
        size: u16,
        heights: &Array2<f32>,
        deltas: &Array2<f32>,
    ) {
        let node = &mut self.nodes[index];

        if node.depth == start {
            if let Some(buffers) = node.vertex_data.take().and_then(|record| record.gpu) {
                self.provider.free_vertex_buffers(buffers);
            }

            let node = &mut self.nodes[index];
            node.vertex_data = Some(VertexDataRecord::new(resolution, size, end - start));
            node.vertex_owner = Some(index);

            let rect = node.rect();
            self.fill_vertex_data(index, &rect, heights, deltas, true, true);

            if let Some(children) = self.nodes[index].children {
                if end > start + 1 {
                    for child in children {
                        self.use_ancestor_vertex_data(child, index, end);
                    }
                }
            }
        } else if let Some(children) = node.children {
            for child in children {
                self.assign_node(child, start, end, resolution, size, heights, deltas);
            }
        }
    }

    fn use_ancestor_vertex_data(&mut self, index: usize, owner: usize, end: u16) {
        let node = &mut self.nodes[index];

        if let Some(buffers) = node.vertex_data.take().and_then(|record| record.gpu) {
            self.provider.free_vertex_buffers(buffers);
        }

        let node = &mut self.nodes[index];
        node.vertex_owner = Some(owner);

        if let Some(children) = node.children {
            if end > node.depth + 1 {
                for child in children {
                    self.use_ancestor_vertex_data(child, owner, end);
                }
            }
        }
    }

    /// Refreshes the vertex data overlapping `rect` from the height and delta arrays.
    /// Records which are already on the gpu are uploaded again.
    pub fn update_vertex_data(
        &mut self,
        positions: bool,
        deltas: bool,
        rect: &TerrainRect,
        height_values: &Array2<f32>,
        delta_values: &Array2<f32>,
    ) {
        let owners = (0..self.nodes.len())
            .filter(|&index| {
                let node = &self.nodes[index];
                node.vertex_data.is_some() && node.rect().intersects(rect)
            })
            .collect::<Vec<_>>();

        for owner in owners {
            self.fill_vertex_data(owner, rect, height_values, delta_values, positions, deltas);

            let on_gpu = self.nodes[owner]
                .vertex_data
                .as_ref()
                .is_some_and(|record| record.gpu.is_some());
            if on_gpu {
                self.upload_vertex_data(owner);
            }
        }
    }

    fn fill_vertex_data(
        &mut self,
        owner: usize,
        rect: &TerrainRect,
        heights: &Array2<f32>,
        deltas: &Array2<f32>,
        update_positions: bool,
        update_deltas: bool,
    ) {
        let Some(mut record) = self.nodes[owner].vertex_data.take() else {
            return;
        };

        let node_rect = self.nodes[owner].rect();
        let update = rect.intersect(&node_rect);

        if !update.is_null() {
            if update_positions {
                self.reset_bounds(owner, &update);
            }

            let geometry = self.geometry.clone();
            let local_centre = self.nodes[owner].local_centre;
            let increment = ((geometry.size - 1) / (record.resolution - 1)) as i64;
            let uv_scale = 1.0 / (geometry.size - 1) as f32;

            // record rows and columns touched by the update, rounded outwards
            let first_column = (update.left - node_rect.left + increment - 1) / increment;
            let last_column = (update.right - 1 - node_rect.left) / increment;
            let first_row = (update.top - node_rect.top + increment - 1) / increment;
            let last_row = (update.bottom - 1 - node_rect.top) / increment;

            for row in first_row..=last_row {
                for column in first_column..=last_column {
                    let x = node_rect.left + column * increment;
                    let y = node_rect.top + row * increment;
                    let index = record.main_index(column as usize, row as usize);

                    if update_positions {
                        let height = heights[(y as usize, x as usize)];
                        let position = geometry.point(x, y, height);
                        self.merge_into_bounds(owner, x, y, position);

                        record.positions[index] = PositionVertex {
                            position: (position - local_centre).to_array(),
                            uv: [x as f32 * uv_scale, 1.0 - y as f32 * uv_scale],
                        };
                    }

                    if update_deltas {
                        let delta = &mut record.deltas[index];
                        delta.delta = deltas[(y as usize, x as usize)];
                        delta.lod_threshold =
                            (geometry.lod_level_when_vertex_eliminated(x, y) - 1) as f32;
                    }
                }
            }

            if update_positions {
                self.fill_skirts(&mut record);
            }

            record.gpu_dirty = true;
        }

        self.nodes[owner].vertex_data = Some(record);
    }

    /// Copies every `skirt_row_col_skip`th row and column into the skirts and pulls them down.
    fn fill_skirts(&self, record: &mut VertexDataRecord) {
        let offset = self
            .geometry
            .alignment
            .terrain_to_world(Vec3::new(0.0, 0.0, -self.geometry.skirt_size));
        let size = record.size as usize;

        for skirt in 0..record.num_skirt_rows_cols as usize {
            let line = skirt * record.skirt_row_col_skip as usize;

            for i in 0..size {
                for (main, target) in [
                    (record.main_index(i, line), record.skirt_row_index(skirt, i)),
                    (record.main_index(line, i), record.skirt_column_index(skirt, i)),
                ] {
                    let mut vertex = record.positions[main];
                    vertex.position = (Vec3::from(vertex.position) + offset).to_array();

                    record.positions[target] = vertex;
                    record.deltas[target].delta = 0.0;
                    record.deltas[target].lod_threshold = SKIRT_LOD_THRESHOLD;
                }
            }
        }
    }

    fn reset_bounds(&mut self, index: usize, rect: &TerrainRect) {
        let node = &mut self.nodes[index];
        let bounds = node.rect();

        if rect.left <= bounds.left
            && rect.top <= bounds.top
            && rect.right >= bounds.right
            && rect.bottom >= bounds.bottom
        {
            node.reset_bounds();
        }

        if let Some(children) = node.children {
            for child in children {
                self.reset_bounds(child, rect);
            }
        }
    }

    fn merge_into_bounds(&mut self, index: usize, x: i64, y: i64, position: Vec3) {
        let node = &mut self.nodes[index];

        if !node.rect().contains(x, y) {
            return;
        }

        node.merge_into_bounds(position);

        if let Some(children) = node.children {
            for child in children {
                self.merge_into_bounds(child, x, y, position);
            }
        }
    }

    /// Makes the depth range `start..end` renderable, by uploading its vertex data
    /// and fetching the index buffers of its lod levels.
    ///
    /// # Panics
    /// Panics if no vertex data was assigned to the range before.
    pub fn load(&mut self, start: u16, end: u16) {
        self.load_node(0, start, end);
    }

    fn load_node(&mut self, index: usize, start: u16, end: u16) {
        let depth = self.nodes[index].depth;

        if depth >= start && depth < end {
            let Some(owner) = self.nodes[index].vertex_owner else {
                panic!("quadtree depth {depth} loaded before its vertex data was assigned");
            };

            self.upload_vertex_data(owner);
            self.create_index_data(index, owner);
        }

        if depth + 1 < end {
            if let Some(children) = self.nodes[index].children {
                for child in children {
                    self.load_node(child, start, end);
                }
            }
        }
    }

    /// Loads every node which has vertex data assigned.
    pub fn load_all(&mut self) {
        for index in 0..self.nodes.len() {
            if let Some(owner) = self.nodes[index].vertex_owner {
                self.upload_vertex_data(owner);
                self.create_index_data(index, owner);
            }
        }
    }

    fn upload_vertex_data(&mut self, owner: usize) {
        let Some(record) = self.nodes[owner].vertex_data.as_mut() else {
            return;
        };

        let buffers = match record.gpu {
            Some(buffers) => buffers,
            None => {
                let buffers = self
                    .provider
                    .allocate_vertex_buffers(self.terrain, record.vertex_count());
                record.gpu = Some(buffers);
                record.gpu_dirty = true;
                buffers
            }
        };

        if record.gpu_dirty {
            self.provider
                .upload_vertex_data(buffers, &record.positions, &record.deltas);
            record.gpu_dirty = false;
        }
    }

    fn create_index_data(&mut self, index: usize, owner: usize) {
        let Some(record) = self.nodes[owner].vertex_data.as_ref() else {
            return;
        };

        let ratio = (self.geometry.size - 1) / (record.resolution - 1);
        let node = &self.nodes[index];
        let owner_node = &self.nodes[owner];

        let keys = node
            .lod_levels
            .iter()
            .map(|level| IndexBufferKey {
                batch_size: level.batch_size,
                vdata_size: record.size,
                vertex_increment: ((node.size - 1) as u16 / (level.batch_size - 1)) / ratio,
                x_offset: ((node.offset_x - owner_node.offset_x) as u16) / ratio,
                y_offset: ((node.offset_y - owner_node.offset_y) as u16) / ratio,
                num_skirt_rows_cols: record.num_skirt_rows_cols,
                skirt_row_col_skip: record.skirt_row_col_skip,
            })
            .collect::<Vec<_>>();

        for (level, key) in self.nodes[index].lod_levels.iter_mut().zip(keys) {
            if level.index.is_none() {
                let buffer = self
                    .provider
                    .shared_index_buffer(key, &|| populate_index_buffer(&key));

                level.index = Some(BatchIndexData {
                    key,
                    buffer,
                    index_count: index_count(key.batch_size),
                });
            }
        }
    }

    /// Releases the gpu data of the depth range `start..end` and keeps the cpu side records.
    /// Unloading a range which is not loaded does nothing.
    pub fn unload(&mut self, start: u16, end: u16) {
        self.unload_node(0, start, end);
    }

    pub fn unload_all(&mut self) {
        self.unload(0, u16::MAX);
    }

    fn unload_node(&mut self, index: usize, start: u16, end: u16) {
        let node = &mut self.nodes[index];

        if node.depth >= start && node.depth < end {
            for level in &mut node.lod_levels {
                level.index = None;
            }
            node.current_lod = None;

            if let Some(record) = node.vertex_data.as_mut() {
                if let Some(buffers) = record.gpu.take() {
                    self.provider.free_vertex_buffers(buffers);
                    record.gpu_dirty = true;
                }
            }
        }

        if node.depth + 1 < end {
            if let Some(children) = node.children {
                for child in children {
                    self.unload_node(child, start, end);
                }
            }
        }
    }

    /// Whether every node which renders the global `lod` has its index data loaded.
    pub fn is_renderable_at(&self, lod: u16) -> bool {
        let mut renders = self.nodes.iter().filter_map(|node| {
            lod.checked_sub(node.base_lod)
                .and_then(|level| node.lod_levels.get(level as usize))
        });

        renders.all(|level| level.index.is_some())
    }

    pub fn pre_delta_calculation(&mut self, rect: &TerrainRect) {
        self.deltas.pre_delta_calculation(rect);
    }

    pub fn notify_delta(&mut self, x: i64, y: i64, lod: u16, delta: f32) {
        self.deltas.notify_delta(x, y, lod, delta);
    }

    pub fn post_delta_calculation(&mut self, rect: &TerrainRect) {
        self.deltas.post_delta_calculation(rect);
    }

    /// A copy of the delta bookkeeping, for calculating deltas on a worker thread.
    pub fn delta_tree(&self) -> DeltaTree {
        self.deltas.clone()
    }

    pub fn set_delta_tree(&mut self, deltas: DeltaTree) {
        if deltas.nodes.len() == self.nodes.len() {
            self.deltas = deltas;
        }
    }

    /// Makes the calculated height deltas of all nodes overlapping `rect` the active ones.
    pub fn finalise_delta_values(&mut self, rect: &TerrainRect) {
        for index in self.deltas.overlapping(rect) {
            let calculated = &self.deltas.nodes[index].calc_max_height_delta;

            for (level, &delta) in self.nodes[index].lod_levels.iter_mut().zip(calculated) {
                level.max_height_delta = delta;
                level.last_cfactor = 0.0;
            }
        }
    }

    /// The max height delta of every lod level of every node, depth first.
    pub fn max_height_delta_table(&self) -> Vec<f32> {
        self.nodes
            .iter()
            .flat_map(|node| node.lod_levels.iter().map(|level| level.max_height_delta))
            .collect()
    }

    /// Restores a table produced by [`Self::max_height_delta_table`].
    /// Returns false and leaves the tree untouched if the table does not fit it.
    pub fn set_max_height_delta_table(&mut self, table: &[f32]) -> bool {
        let count = self.nodes.iter().map(|node| node.lod_levels.len()).sum::<usize>();
        if table.len() != count {
            return false;
        }

        let mut values = table.iter().copied();

        for (node, delta_node) in self.nodes.iter_mut().zip(&mut self.deltas.nodes) {
            for (level, calculated) in node
                .lod_levels
                .iter_mut()
                .zip(&mut delta_node.calc_max_height_delta)
            {
                let delta = values.next().unwrap_or_default();
                level.max_height_delta = delta;
                level.last_cfactor = 0.0;
                *calculated = delta;
            }
        }

        true
    }

    fn view_distance(&self, node: &QuadTreeNode, local_viewpoint: Vec3) -> f32 {
        (local_viewpoint - node.local_centre).length() - node.bounding_radius * 0.5
    }

    /// Selects the lod of every node for a viewpoint given in local space.
    ///
    /// A node renders the finest loaded lod whose transition distance lies beyond the viewpoint,
    /// unless one of its children renders. At exactly the transition distance the coarser lod wins.
    /// Lods finer than `min_lod` are never selected.
    pub fn calculate_current_lod(&mut self, local_viewpoint: Vec3, cfactor: f32, min_lod: u16) {
        self.calculate_node_lod(0, local_viewpoint, cfactor, min_lod);
    }

    fn calculate_node_lod(
        &mut self,
        index: usize,
        local_viewpoint: Vec3,
        cfactor: f32,
        min_lod: u16,
    ) -> bool {
        self.nodes[index].self_or_child_rendered = false;

        let mut rendered_children = 0;
        let children = self.nodes[index].children;

        if let Some(children) = children {
            for child in children {
                if self.calculate_node_lod(child, local_viewpoint, cfactor, min_lod) {
                    rendered_children += 1;
                }
            }
        }

        if rendered_children == 0 {
            let distance = self.view_distance(&self.nodes[index], local_viewpoint);
            let node = &mut self.nodes[index];
            let is_root = node.parent.is_none();
            let lod_count = node.lod_levels.len();

            node.current_lod = None;
            node.lod_transition = 0.0;

            for level in 0..lod_count {
                if node.lod_levels[level].index.is_none()
                    || node.base_lod + (level as u16) < min_lod
                {
                    continue;
                }

                // the coarsest lod of the root is the last resort
                if is_root && level + 1 == lod_count {
                    node.current_lod = Some(level as u16);
                    node.self_or_child_rendered = true;
                    break;
                }

                let transition = node.lod_levels[level].transition_distance(cfactor);

                if distance < transition {
                    node.current_lod = Some(level as u16);
                    node.self_or_child_rendered = true;

                    if let Some(next) = node.lod_levels.get_mut(level + 1) {
                        let morph_region =
                            (next.transition_distance(cfactor) - transition) * MORPH_REGION;

                        node.lod_transition = if morph_region > 0.0 {
                            (1.0 - (transition - distance) / morph_region).clamp(0.0, 1.0)
                        } else {
                            0.0
                        };
                    }

                    break;
                }
            }
        } else {
            let node = &mut self.nodes[index];
            node.current_lod = None;
            node.self_or_child_rendered = true;

            // either all or none of the children render, the others fall back to their coarsest lod
            if rendered_children < 4 {
                for child in children.into_iter().flatten() {
                    let child = &mut self.nodes[child];

                    if !child.self_or_child_rendered {
                        child.current_lod = Some(child.lod_count() - 1);
                        child.lod_transition = 1.0;
                    }
                }
            }
        }

        self.nodes[index].self_or_child_rendered
    }

    /// The finest global lod that [`Self::calculate_current_lod`] may select
    /// somewhere in the terrain for the viewpoint, regardless of what is loaded.
    pub fn finest_lod_within(&self, local_viewpoint: Vec3, cfactor: f32) -> u16 {
        let scale = self.geometry.scale();

        self.nodes
            .iter()
            .filter_map(|node| {
                // nodes without vertex data have no bounds yet, fall back to their extent
                let extent = (node.size - 1) as f32 * scale * std::f32::consts::FRAC_1_SQRT_2;
                let radius = node.bounding_radius.max(extent);
                let distance = (local_viewpoint - node.local_centre).length() - radius * 0.5;

                node.lod_levels
                    .iter()
                    .position(|level| distance < level.max_height_delta * cfactor)
                    .map(|level| node.base_lod + level as u16)
            })
            .min()
            .unwrap_or(self.geometry.num_lod_levels() - 1)
    }

    /// The batches selected by the last lod calculation.
    pub fn render_batches(&self) -> Vec<RenderBatch> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(index, node)| {
                let lod = node.current_lod?;
                let level = node.lod_levels.get(lod as usize)?;
                let owner = &self.nodes[node.vertex_owner?];
                let vertex_buffers = owner.vertex_data.as_ref()?.gpu?;

                Some(RenderBatch {
                    node: index,
                    rect: node.rect(),
                    lod: node.base_lod + lod,
                    morph: node.morph(),
                    local_centre: owner.local_centre,
                    vertex_buffers,
                    index: level.index?,
                })
            })
            .collect()
    }
}

impl Drop for QuadTree {
    fn drop(&mut self) {
        self.unload_all();
    }
}
