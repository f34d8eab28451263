//! Data derived from the heights: height deltas, normals and the light map.
//!
//! Each kind is calculated by its own background pass, in the order of [`DerivedDataMask`].
//! The passes only work on snapshots, so the terrain and its neighbours stay usable meanwhile.

use crate::{
    math::TerrainRect,
    terrain::neighbours::neighbour_point_overflow,
    terrain_data::{
        deltas::{calculate_height_deltas, DeltaTree},
        TerrainGeometry,
    },
};
use bevy::math::{Vec2, Vec3};
use itertools::iproduct;
use ndarray::Array2;
use std::sync::Arc;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DerivedDataMask: u8 {
        const DELTAS   = 1 << 0;
        const NORMALS  = 1 << 1;
        const LIGHTMAP = 1 << 2;
        const ALL      = Self::DELTAS.bits() | Self::NORMALS.bits() | Self::LIGHTMAP.bits();
    }
}

/// The heights of the neighbouring terrains, indexed by [`Neighbour`](super::Neighbour).
/// Neighbours with a different size are left out.
pub type NeighbourHeights = [Option<Arc<Array2<f32>>>; 8];

/// The point of vertex `(x, y)` in terrain space, read from a neighbour if it lies outside.
pub fn point_from_self_or_neighbour(
    geometry: &TerrainGeometry,
    heights: &Array2<f32>,
    neighbours: &NeighbourHeights,
    x: i64,
    y: i64,
) -> Option<Vec3> {
    let height = match neighbour_point_overflow(geometry.size, x, y) {
        None => heights[(y as usize, x as usize)],
        Some((neighbour, nx, ny)) => {
            let heights = neighbours[neighbour.index()].as_ref()?;
            *heights.get((ny as usize, nx as usize))?
        }
    };

    Some(geometry.point_xy(x, y, height))
}

const RING: [(i64, i64); 8] = [
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
];

/// The terrain space normal of a vertex, summed over the eight triangles around it.
fn vertex_normal(
    geometry: &TerrainGeometry,
    heights: &Array2<f32>,
    neighbours: &NeighbourHeights,
    x: i64,
    y: i64,
) -> Vec3 {
    let point = |dx: i64, dy: i64| {
        point_from_self_or_neighbour(geometry, heights, neighbours, x + dx, y + dy)
    };

    let Some(centre) = point(0, 0) else {
        return Vec3::Z;
    };
    let ring = RING.map(|(dx, dy)| point(dx, dy));

    let mut sum = Vec3::ZERO;
    for i in 0..8 {
        if let (Some(a), Some(b)) = (ring[i], ring[(i + 1) % 8]) {
            sum += (a - centre).cross(b - centre).normalize_or_zero();
        }
    }

    sum.normalize_or(Vec3::Z)
}

/// Recalculates the rgb8 normal map inside of `rect`.
pub fn calculate_normals(
    geometry: &TerrainGeometry,
    heights: &Array2<f32>,
    neighbours: &NeighbourHeights,
    normal_map: &mut [u8],
    rect: &TerrainRect,
) {
    let size = geometry.size as i64;
    let rect = rect.clamp_to(geometry.size);

    for (y, x) in iproduct!(rect.top..rect.bottom, rect.left..rect.right) {
        let normal = vertex_normal(geometry, heights, neighbours, x, y);
        let encoded = (normal * 0.5 + 0.5) * 255.0;
        let offset = ((y * size + x) * 3) as usize;

        normal_map[offset..offset + 3].copy_from_slice(&encoded.to_array().map(|c| c.round() as u8));
    }
}

pub fn decode_normal(normal_map: &[u8], size: u16, x: usize, y: usize) -> Vec3 {
    let offset = (y * size as usize + x) * 3;
    let [r, g, b] = [0, 1, 2].map(|i| normal_map[offset + i] as f32 / 255.0 * 2.0 - 1.0);

    Vec3::new(r, g, b)
}

/// Marches rays from the terrain towards the light, one vertex spacing per step.
pub struct LightMarch<'a> {
    geometry: &'a TerrainGeometry,
    heights: &'a Array2<f32>,
    neighbours: &'a NeighbourHeights,
    /// Horizontal step in vertices.
    step: Vec2,
    /// Height gained per step.
    rise: f32,
    max_height: f32,
}

impl<'a> LightMarch<'a> {
    /// `light_direction` is the terrain space direction the light travels in.
    pub fn new(
        geometry: &'a TerrainGeometry,
        heights: &'a Array2<f32>,
        neighbours: &'a NeighbourHeights,
        light_direction: Vec3,
    ) -> Option<Self> {
        let towards_light = -light_direction;
        let horizontal = towards_light.truncate().length();

        // light from straight above casts no shadows
        if horizontal < 1e-6 {
            return None;
        }

        let max_height = neighbours
            .iter()
            .flatten()
            .map(|heights| heights.as_ref())
            .chain([heights])
            .flat_map(|heights| heights.iter().copied())
            .fold(f32::NEG_INFINITY, f32::max);

        Some(Self {
            geometry,
            heights,
            neighbours,
            step: towards_light.truncate() / horizontal,
            rise: towards_light.z / horizontal * geometry.scale(),
            max_height,
        })
    }

    /// How many vertices a shadow can reach at most, the range a height change affects.
    pub fn run(&self, min_height: f32) -> i64 {
        let size = self.geometry.size as i64;

        if self.rise <= 0.0 {
            return size;
        }

        (((self.max_height - min_height) / self.rise).ceil() as i64).clamp(1, size)
    }

    /// Bilinear height at a fractional vertex coordinate.
    fn sample(&self, position: Vec2) -> Option<f32> {
        let x = position.x.floor() as i64;
        let y = position.y.floor() as i64;
        let fx = position.x - x as f32;
        let fy = position.y - y as f32;

        let height = |dx: i64, dy: i64| {
            point_from_self_or_neighbour(self.geometry, self.heights, self.neighbours, x + dx, y + dy)
                .map(|point| point.z)
        };

        let bottom = height(0, 0)? * (1.0 - fx) + height(1, 0)? * fx;
        let top = height(0, 1)? * (1.0 - fx) + height(1, 1)? * fx;

        Some(bottom * (1.0 - fy) + top * fy)
    }

    pub fn is_lit(&self, start: Vec2) -> bool {
        let Some(mut ray_height) = self.sample(start) else {
            return true;
        };
        let mut position = start;

        while ray_height < self.max_height {
            position += self.step;
            ray_height += self.rise;

            match self.sample(position) {
                Some(height) if height > ray_height + 1e-3 => return false,
                Some(_) => {}
                None => return true,
            }
        }

        true
    }
}

/// The texel rectangle of a light map covering a vertex rectangle.
pub fn light_map_rect(terrain_size: u16, light_map_size: u16, rect: &TerrainRect) -> TerrainRect {
    let ratio = (light_map_size - 1) as f32 / (terrain_size - 1) as f32;

    TerrainRect::new(
        (rect.left as f32 * ratio).floor() as i64,
        (rect.top as f32 * ratio).floor() as i64,
        (rect.right as f32 * ratio).ceil() as i64 + 1,
        (rect.bottom as f32 * ratio).ceil() as i64 + 1,
    )
    .clamp_to(light_map_size)
}

/// Recalculates the light map texels covering the vertex rectangle `rect`.
/// Lit texels are `255`, shadowed ones `0`.
pub fn calculate_light_map(
    march: Option<&LightMarch>,
    terrain_size: u16,
    light_map_size: u16,
    light_map: &mut [u8],
    rect: &TerrainRect,
) {
    let texels = light_map_rect(terrain_size, light_map_size, rect);
    let to_vertex = (terrain_size - 1) as f32 / (light_map_size - 1) as f32;

    for (y, x) in iproduct!(texels.top..texels.bottom, texels.left..texels.right) {
        let lit = march
            .map(|march| march.is_lit(Vec2::new(x as f32, y as f32) * to_vertex))
            .unwrap_or(true);

        light_map[(y * light_map_size as i64 + x) as usize] = if lit { 255 } else { 0 };
    }
}

/// The snapshot a derived data pass works on.
pub(crate) struct DerivedInput {
    pub geometry: TerrainGeometry,
    pub heights: Arc<Array2<f32>>,
    pub neighbours: NeighbourHeights,
    /// Terrain space direction of the light.
    pub light_direction: Vec3,
    pub rect: TerrainRect,
}

/// One derived data pass, carrying the data it updates.
pub(crate) enum DerivedPass {
    Deltas {
        deltas: Array2<f32>,
        tree: DeltaTree,
    },
    Normals {
        normal_map: Vec<u8>,
    },
    Lightmap {
        size: u16,
        light_map: Vec<u8>,
    },
}

impl DerivedPass {
    pub fn kind(&self) -> DerivedDataMask {
        match self {
            DerivedPass::Deltas { .. } => DerivedDataMask::DELTAS,
            DerivedPass::Normals { .. } => DerivedDataMask::NORMALS,
            DerivedPass::Lightmap { .. } => DerivedDataMask::LIGHTMAP,
        }
    }

    /// Runs the pass, returning it together with the vertex rectangle it changed.
    pub fn run(self, input: DerivedInput) -> (Self, TerrainRect) {
        let DerivedInput {
            geometry,
            heights,
            neighbours,
            light_direction,
            rect,
        } = input;

        match self {
            DerivedPass::Deltas {
                mut deltas,
                mut tree,
            } => {
                let changed =
                    calculate_height_deltas(&geometry, &heights, &mut deltas, &mut tree, &rect);
                (DerivedPass::Deltas { deltas, tree }, changed)
            }
            DerivedPass::Normals { mut normal_map } => {
                calculate_normals(&geometry, &heights, &neighbours, &mut normal_map, &rect);
                (DerivedPass::Normals { normal_map }, rect)
            }
            DerivedPass::Lightmap {
                size,
                mut light_map,
            } => {
                let march = LightMarch::new(&geometry, &heights, &neighbours, light_direction);

                // a changed height also moves the shadows it casts
                let rect = match &march {
                    Some(march) => {
                        let min_height = heights.iter().copied().fold(f32::INFINITY, f32::min);
                        rect.widen(march.run(min_height)).clamp_to(geometry.size)
                    }
                    None => rect,
                };

                calculate_light_map(march.as_ref(), geometry.size, size, &mut light_map, &rect);
                (DerivedPass::Lightmap { size, light_map }, rect)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Alignment;

    fn geometry() -> TerrainGeometry {
        TerrainGeometry::new(Alignment::XZ, 17, 160.0, 17, 9).unwrap()
    }

    #[test]
    fn flat_normals_point_up() {
        let geometry = geometry();
        let heights = Array2::from_elem((17, 17), 5.0);
        let mut normal_map = vec![0; 17 * 17 * 3];

        calculate_normals(
            &geometry,
            &heights,
            &Default::default(),
            &mut normal_map,
            &TerrainRect::full(17),
        );

        assert_eq!(&normal_map[..3], &[128, 128, 255]);
        assert!((decode_normal(&normal_map, 17, 8, 8) - Vec3::Z).length() < 0.01);
    }

    #[test]
    fn edge_normals_use_neighbour_heights() {
        let geometry = geometry();
        // a slope rising towards east, continued by the eastern neighbour
        let heights = Array2::from_shape_fn((17, 17), |(_, x)| x as f32 * 10.0);
        let east = Array2::from_shape_fn((17, 17), |(_, x)| (x + 16) as f32 * 10.0);

        let mut neighbours = NeighbourHeights::default();
        neighbours[0] = Some(Arc::new(east));

        let mut normal_map = vec![0; 17 * 17 * 3];
        calculate_normals(
            &geometry,
            &heights,
            &neighbours,
            &mut normal_map,
            &TerrainRect::full(17),
        );

        let expected = Vec3::new(-1.0, 0.0, 1.0).normalize();
        assert!((decode_normal(&normal_map, 17, 16, 8) - expected).length() < 0.02);
        assert!((decode_normal(&normal_map, 17, 8, 8) - expected).length() < 0.02);
    }

    #[test]
    fn walls_cast_shadows() {
        let geometry = geometry();
        let heights = Array2::from_shape_fn((17, 17), |(_, x)| if x == 10 { 100.0 } else { 0.0 });
        let neighbours = NeighbourHeights::default();

        // light travelling towards -x, down at 45 degrees
        let march =
            LightMarch::new(&geometry, &heights, &neighbours, Vec3::new(-1.0, 0.0, -1.0)).unwrap();

        assert!(!march.is_lit(Vec2::new(5.0, 8.0)));
        assert!(march.is_lit(Vec2::new(12.0, 8.0)));
        assert!(march.run(0.0) >= 10);

        let mut light_map = vec![0; 17 * 17];
        calculate_light_map(Some(&march), 17, 17, &mut light_map, &TerrainRect::full(17));

        assert_eq!(light_map[8 * 17 + 5], 0);
        assert_eq!(light_map[8 * 17 + 12], 255);
    }
}
