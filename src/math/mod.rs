//! Small geometric helpers shared by the terrain data structures.

use bevy::math::Vec3;
use serde::{Deserialize, Serialize};

mod grid;
mod rect;

pub use grid::{pack_index, unpack_index, GridKey};
pub use rect::TerrainRect;

/// Which two world axes span the horizontal plane of a terrain.
///
/// Terrain space is `(x, y, height)`, this enum converts between it and world space.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Alignment {
    /// Terrain `x` maps to world `x`, terrain `y` to world `-z` and height to world `y`.
    #[default]
    XZ,
    /// Terrain `x` maps to world `x`, terrain `y` to world `y` and height to world `z`.
    XY,
    /// Terrain `x` maps to world `-z`, terrain `y` to world `y` and height to world `x`.
    YZ,
}

impl Alignment {
    pub(crate) fn id(self) -> u8 {
        match self {
            Alignment::XZ => 0,
            Alignment::XY => 1,
            Alignment::YZ => 2,
        }
    }

    pub(crate) fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Alignment::XZ),
            1 => Some(Alignment::XY),
            2 => Some(Alignment::YZ),
            _ => None,
        }
    }

    #[inline]
    pub fn terrain_to_world(self, v: Vec3) -> Vec3 {
        match self {
            Alignment::XZ => Vec3::new(v.x, v.z, -v.y),
            Alignment::XY => v,
            Alignment::YZ => Vec3::new(v.z, v.y, -v.x),
        }
    }

    #[inline]
    pub fn world_to_terrain(self, v: Vec3) -> Vec3 {
        match self {
            Alignment::XZ => Vec3::new(v.x, -v.z, v.y),
            Alignment::XY => v,
            Alignment::YZ => Vec3::new(-v.z, v.y, v.x),
        }
    }

    /// The world space up direction of the terrain.
    pub fn up(self) -> Vec3 {
        self.terrain_to_world(Vec3::Z)
    }
}

/// A plane in terrain space, used to interpolate heights across a triangle.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub d: f32,
}

impl Plane {
    pub fn from_points(a: Vec3, b: Vec3, c: Vec3) -> Self {
        let normal = (b - a).cross(c - a).normalize_or_zero();

        Self {
            normal,
            d: -normal.dot(a),
        }
    }

    pub fn distance(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.d
    }

    /// Solves the plane for the height (`z`) at `(x, y)`.
    pub fn height_at(&self, x: f32, y: f32) -> f32 {
        if self.normal.z.abs() < f32::EPSILON {
            return 0.0;
        }

        -(self.normal.x * x + self.normal.y * y + self.d) / self.normal.z
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_round_trip() {
        let v = Vec3::new(1.0, 2.0, 3.0);

        for alignment in [Alignment::XZ, Alignment::XY, Alignment::YZ] {
            let world = alignment.terrain_to_world(v);
            assert_eq!(alignment.world_to_terrain(world), v);
        }

        assert_eq!(Alignment::XZ.up(), Vec3::Y);
        assert_eq!(Alignment::YZ.up(), Vec3::X);
    }

    #[test]
    fn plane_height() {
        let plane = Plane::from_points(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(0.0, 1.0, 0.0),
        );

        assert!((plane.height_at(0.5, 0.5) - 0.5).abs() < 1e-6);
        assert!(plane.distance(Vec3::new(1.0, 1.0, 1.0)).abs() < 1e-6);
    }
}
