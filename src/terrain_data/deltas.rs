//! Height delta calculation, the error metric behind the lod selection.
//!
//! For every lod level, each vertex that is dropped by the next coarser level is compared
//! against the triangle of that coarser level covering it. The difference is the vertex's delta
//! (used for morphing) and the maximum over a node's region becomes the node's max height delta.

use crate::{
    math::{Plane, TerrainRect},
    terrain_data::TerrainGeometry,
};
use bevy::math::Vec3;
use ndarray::Array2;

/// The delta bookkeeping of a single quadtree node.
#[derive(Clone, Debug)]
pub struct DeltaNode {
    pub offset_x: i64,
    pub offset_y: i64,
    pub size: i64,
    pub base_lod: u16,
    pub children: Option<[usize; 4]>,
    /// The max height delta per lod level of the node, while it is being calculated.
    pub calc_max_height_delta: Vec<f32>,
    pub child_with_max_height_delta: Option<usize>,
}

impl DeltaNode {
    fn bounds(&self) -> TerrainRect {
        TerrainRect::new(
            self.offset_x,
            self.offset_y,
            self.offset_x + self.size,
            self.offset_y + self.size,
        )
    }

    fn contains(&self, x: i64, y: i64) -> bool {
        self.bounds().contains(x, y)
    }

    fn lod_count(&self) -> u16 {
        self.calc_max_height_delta.len() as u16
    }
}

/// A detached copy of the quadtree layout which accumulates max height deltas.
///
/// It can be moved to a worker thread, filled there and merged back into the quadtree afterwards.
#[derive(Clone, Debug, Default)]
pub struct DeltaTree {
    pub nodes: Vec<DeltaNode>,
}

impl DeltaTree {
    pub fn pre_delta_calculation(&mut self, rect: &TerrainRect) {
        self.pre_delta_node(0, rect);
    }

    fn pre_delta_node(&mut self, index: usize, rect: &TerrainRect) {
        let node = &mut self.nodes[index];
        let bounds = node.bounds();

        if !bounds.intersects(rect) {
            return;
        }

        // a fully covered node is recalculated from scratch, so its deltas may also shrink
        if rect.left <= bounds.left
            && rect.right >= bounds.right
            && rect.top <= bounds.top
            && rect.bottom >= bounds.bottom
        {
            node.calc_max_height_delta.fill(0.0);
        }

        if let Some(children) = node.children {
            for child in children {
                self.pre_delta_node(child, rect);
            }
        }
    }

    /// Records the height delta of a vertex that disappears at the lod after `lod`.
    pub fn notify_delta(&mut self, x: i64, y: i64, lod: u16, delta: f32) {
        self.notify_delta_node(0, x, y, lod, delta);
    }

    fn notify_delta_node(&mut self, index: usize, x: i64, y: i64, lod: u16, delta: f32) {
        let node = &mut self.nodes[index];

        if !node.contains(x, y) {
            return;
        }

        if lod >= node.base_lod && lod < node.base_lod + node.lod_count() {
            let level = &mut node.calc_max_height_delta[(lod - node.base_lod) as usize];
            *level = level.max(delta);
        } else if let Some(children) = node.children {
            for child in children {
                self.notify_delta_node(child, x, y, lod, delta);
            }
        }
    }

    /// Makes the deltas ascend with coarser lods, parents always transition after their children.
    pub fn post_delta_calculation(&mut self, rect: &TerrainRect) {
        self.post_delta_node(0, rect);
    }

    fn post_delta_node(&mut self, index: usize, rect: &TerrainRect) {
        if !self.nodes[index].bounds().intersects(rect) {
            return;
        }

        if let Some(children) = self.nodes[index].children {
            let mut max_child_delta = -1.0;
            let mut child_with_max = None;

            for child in children {
                self.post_delta_node(child, rect);

                let child_delta = *self.nodes[child]
                    .calc_max_height_delta
                    .last()
                    .unwrap_or(&0.0);

                if child_delta > max_child_delta {
                    max_child_delta = child_delta;
                    child_with_max = Some(child);
                }
            }

            let node = &mut self.nodes[index];
            node.calc_max_height_delta[0] = node.calc_max_height_delta[0].max(max_child_delta * 1.05);
            node.child_with_max_height_delta = child_with_max;
        } else {
            let calc = &mut self.nodes[index].calc_max_height_delta;

            for i in 1..calc.len() {
                calc[i] = calc[i].max(calc[i - 1] * 1.05);
            }
        }
    }

    /// The indices of all nodes overlapping `rect`, parents before children.
    pub fn overlapping(&self, rect: &TerrainRect) -> Vec<usize> {
        let mut result = Vec::new();
        let mut stack = vec![0];

        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];

            if node.bounds().intersects(rect) {
                result.push(index);
                if let Some(children) = node.children {
                    stack.extend(children.into_iter().rev());
                }
            }
        }

        result
    }
}

/// Interpolates the heights of a coarser lod cell, with the same diagonals as the index buffer.
pub(crate) struct LodCell {
    t1: Plane,
    t2: Plane,
    backward: bool,
}

impl LodCell {
    /// Builds the cell from its corners `v0` (low x, low y), `v1` (high x), `v2` (high y) and `v3`.
    /// Cells in odd rows split along the other diagonal.
    pub(crate) fn new(v0: Vec3, v1: Vec3, v2: Vec3, v3: Vec3, odd_row: bool) -> Self {
        if odd_row {
            Self {
                t1: Plane::from_points(v1, v3, v2),
                t2: Plane::from_points(v0, v1, v2),
                backward: true,
            }
        } else {
            Self {
                t1: Plane::from_points(v0, v1, v3),
                t2: Plane::from_points(v0, v3, v2),
                backward: false,
            }
        }
    }

    pub(crate) fn interpolate(&self, xpct: f32, ypct: f32, x: f32, y: f32) -> f32 {
        if (xpct > ypct && !self.backward) || (xpct > 1.0 - ypct && self.backward) {
            self.t1.height_at(x, y)
        } else {
            self.t2.height_at(x, y)
        }
    }
}

/// Calculates the height deltas inside of `rect` and feeds them into the delta tree.
///
/// Returns the rectangle of vertices whose deltas changed, which is wider than `rect`,
/// since changing a vertex also affects the coarser triangles around it.
pub fn calculate_height_deltas(
    geometry: &TerrainGeometry,
    heights: &Array2<f32>,
    deltas: &mut Array2<f32>,
    tree: &mut DeltaTree,
    rect: &TerrainRect,
) -> TerrainRect {
    let size = geometry.size as i64;
    let clamped = rect.clamp_to(geometry.size);
    let mut final_rect = clamped;

    if clamped.is_null() {
        return final_rect;
    }

    tree.pre_delta_calculation(&clamped);

    let point = |x: i64, y: i64| geometry.point_xy(x, y, heights[(y as usize, x as usize)]);

    for target_level in 1..geometry.num_lod_levels() {
        let source_level = target_level - 1;
        let step = 1i64 << target_level;
        let half_step = step / 2;

        let widened = clamped.widen(step).clamp_to(geometry.size);
        final_rect.merge(&widened);

        // align the rectangle to the cells of this level
        let left = widened.left - widened.left % step;
        let top = widened.top - widened.top % step;
        let right = widened.right.min(size - 1);
        let bottom = widened.bottom.min(size - 1);

        for j in (top..bottom).step_by(step as usize) {
            for i in (left..right).step_by(step as usize) {
                let v0 = point(i, j);
                let v1 = point(i + step, j);
                let v2 = point(i, j + step);
                let v3 = point(i + step, j + step);

                let cell = LodCell::new(v0, v1, v2, v3, (j / step) % 2 == 1);

                // the last row and column are shared with no other cell
                let y_bound = if j == size - 1 - step { step } else { step - 1 };
                let x_bound = if i == size - 1 - step { step } else { step - 1 };

                for y in 0..=y_bound {
                    for x in 0..=x_bound {
                        let full_x = i + x;
                        let full_y = j + y;

                        if full_x % step == 0 && full_y % step == 0 {
                            continue;
                        }

                        let actual = point(full_x, full_y);
                        let interpolated = cell.interpolate(
                            x as f32 / step as f32,
                            y as f32 / step as f32,
                            actual.x,
                            actual.y,
                        );
                        let delta = interpolated - actual.z;

                        tree.notify_delta(full_x, full_y, source_level, delta.abs());

                        // only the vertices dropped by exactly this level morph towards it
                        if (full_x % step == half_step && full_y % half_step == 0)
                            || (full_y % step == half_step && full_x % half_step == 0)
                        {
                            deltas[(full_y as usize, full_x as usize)] = delta;
                        }
                    }
                }
            }
        }
    }

    tree.post_delta_calculation(&clamped);

    final_rect
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gpu::{CpuBufferProvider, TerrainId},
        math::Alignment,
        terrain_data::quadtree::QuadTree,
    };
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::sync::Arc;

    fn setup() -> (TerrainGeometry, DeltaTree) {
        let geometry = TerrainGeometry::new(Alignment::XZ, 65, 640.0, 33, 17).unwrap();
        let quadtree = QuadTree::new(
            &geometry,
            TerrainId::next(),
            Arc::new(CpuBufferProvider::default()),
        );

        (geometry, quadtree.delta_tree())
    }

    #[test]
    fn planes_have_no_deltas() {
        let (geometry, mut tree) = setup();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..4 {
            let a = rng.random_range(-0.5..0.5);
            let b = rng.random_range(-0.5..0.5);
            let c = rng.random_range(0.0..10.0);
            let heights = Array2::from_shape_fn((65, 65), |(y, x)| a * x as f32 + b * y as f32 + c);
            let mut deltas = Array2::zeros((65, 65));

            let full = TerrainRect::new(0, 0, 65, 65);
            calculate_height_deltas(&geometry, &heights, &mut deltas, &mut tree, &full);

            assert!(deltas.iter().all(|delta: &f32| delta.abs() < 1e-2));
        }
    }

    #[test]
    fn deltas_of_rough_terrain() {
        let (geometry, mut tree) = setup();
        let mut rng = StdRng::seed_from_u64(42);
        let heights = Array2::from_shape_fn((65, 65), |_| rng.random_range(0.0..50.0));
        let mut deltas = Array2::zeros((65, 65));

        let changed = calculate_height_deltas(
            &geometry,
            &heights,
            &mut deltas,
            &mut tree,
            &TerrainRect::new(10, 10, 12, 12),
        );
        // widened by the cell size of the coarsest level
        assert_eq!(changed, TerrainRect::new(6, 6, 16, 16));

        let full = TerrainRect::new(0, 0, 65, 65);
        calculate_height_deltas(&geometry, &heights, &mut deltas, &mut tree, &full);

        // the first vertex along the south edge morphs towards the midpoint of its neighbours
        let expected = (heights[(0, 0)] + heights[(0, 2)]) * 0.5 - heights[(0, 1)];
        assert!((deltas[(0, 1)] - expected).abs() < 1e-3);

        // vertices of the coarsest lod never morph
        assert_eq!(deltas[(0, 0)], 0.0);
        assert_eq!(deltas[(64, 64)], 0.0);
        assert_eq!(deltas[(32, 32)], 0.0);
    }
}
