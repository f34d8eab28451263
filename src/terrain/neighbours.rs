use crate::{
    math::{GridKey, TerrainRect},
    terrain::Terrain,
};
use std::sync::{RwLock, Weak};

/// The eight compass directions around a terrain, counter clockwise starting at east.
///
/// North is terrain `+y`, east is terrain `+x`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Neighbour {
    East = 0,
    NorthEast = 1,
    North = 2,
    NorthWest = 3,
    West = 4,
    SouthWest = 5,
    South = 6,
    SouthEast = 7,
}

impl Neighbour {
    pub const ALL: [Neighbour; 8] = [
        Neighbour::East,
        Neighbour::NorthEast,
        Neighbour::North,
        Neighbour::NorthWest,
        Neighbour::West,
        Neighbour::SouthWest,
        Neighbour::South,
        Neighbour::SouthEast,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Self {
        Self::ALL[index % 8]
    }

    pub fn opposite(self) -> Self {
        Self::from_index(self.index() + 4)
    }

    /// The grid offset of the neighbouring slot.
    pub fn offset(self) -> (i32, i32) {
        match self {
            Neighbour::East => (1, 0),
            Neighbour::NorthEast => (1, 1),
            Neighbour::North => (0, 1),
            Neighbour::NorthWest => (-1, 1),
            Neighbour::West => (-1, 0),
            Neighbour::SouthWest => (-1, -1),
            Neighbour::South => (0, -1),
            Neighbour::SouthEast => (1, -1),
        }
    }

    /// The direction of a grid offset, `None` for `(0, 0)`.
    pub fn from_offset(dx: i32, dy: i32) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|neighbour| neighbour.offset() == (dx.signum(), dy.signum()))
    }
}

/// A non owning link to a neighbouring terrain.
#[derive(Clone, Debug)]
pub struct NeighbourLink {
    pub key: Option<GridKey>,
    pub terrain: Weak<RwLock<Terrain>>,
}

impl Neighbour {
    /// The rectangle of vertices within `range` of the edge (or corner) facing this direction.
    pub fn edge_rect(self, size: u16, range: i64) -> TerrainRect {
        let size = size as i64;
        let (dx, dy) = self.offset();

        let span = |d: i32| match d {
            1 => (size - range, size),
            -1 => (0, range),
            _ => (0, size),
        };

        let (left, right) = span(dx);
        let (top, bottom) = span(dy);

        TerrainRect::new(left, top, right, bottom)
    }

    /// Converts a vertex coordinate of this terrain into the coordinate of the neighbour
    /// in this direction. The shared edge has coordinate `size - 1` on one side and `0` on the other.
    pub fn neighbour_point(self, size: u16, x: i64, y: i64) -> (i64, i64) {
        let (dx, dy) = self.offset();
        let shift = size as i64 - 1;

        (x - dx as i64 * shift, y - dy as i64 * shift)
    }

    /// Converts a rectangle of this terrain into the coordinates of the neighbour in this direction,
    /// clipped to the neighbour.
    pub fn neighbour_rect(self, size: u16, rect: &TerrainRect) -> TerrainRect {
        let (left, top) = self.neighbour_point(size, rect.left, rect.top);
        let (right, bottom) = self.neighbour_point(size, rect.right, rect.bottom);

        TerrainRect::new(left, top, right, bottom).clamp_to(size)
    }
}

/// Returns the neighbour a vertex coordinate lies in and its coordinate there,
/// or `None` if the coordinate lies inside of the terrain.
pub fn neighbour_point_overflow(size: u16, x: i64, y: i64) -> Option<(Neighbour, i64, i64)> {
    let size = size as i64;
    let side = |v: i64| {
        if v < 0 {
            -1
        } else if v >= size {
            1
        } else {
            0
        }
    };

    let neighbour = Neighbour::from_offset(side(x), side(y))?;
    let (nx, ny) = neighbour.neighbour_point(size as u16, x, y);

    Some((neighbour, nx, ny))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opposites() {
        assert_eq!(Neighbour::East.opposite(), Neighbour::West);
        assert_eq!(Neighbour::NorthEast.opposite(), Neighbour::SouthWest);
        assert_eq!(Neighbour::SouthEast.opposite(), Neighbour::NorthWest);

        for neighbour in Neighbour::ALL {
            let (dx, dy) = neighbour.offset();
            assert_eq!(neighbour.opposite().offset(), (-dx, -dy));
            assert_eq!(Neighbour::from_offset(dx * 3, dy * 3), Some(neighbour));
        }

        assert_eq!(Neighbour::from_offset(0, 0), None);
    }

    #[test]
    fn edge_rects() {
        assert_eq!(
            Neighbour::East.edge_rect(17, 2),
            TerrainRect::new(15, 0, 17, 17)
        );
        assert_eq!(
            Neighbour::SouthWest.edge_rect(17, 1),
            TerrainRect::new(0, 0, 1, 1)
        );
        assert_eq!(
            Neighbour::North.edge_rect(17, 1),
            TerrainRect::new(0, 16, 17, 17)
        );
    }

    #[test]
    fn points_cross_the_shared_edge() {
        assert_eq!(Neighbour::East.neighbour_point(17, 16, 5), (0, 5));
        assert_eq!(Neighbour::SouthWest.neighbour_point(17, 0, 0), (16, 16));

        assert_eq!(neighbour_point_overflow(17, 5, 5), None);
        assert_eq!(
            neighbour_point_overflow(17, 17, -1),
            Some((Neighbour::SouthEast, 1, 15))
        );
        assert_eq!(
            neighbour_point_overflow(17, -1, 3),
            Some((Neighbour::West, 15, 3))
        );

        assert_eq!(
            Neighbour::East.neighbour_rect(17, &TerrainRect::new(15, 2, 17, 6)),
            TerrainRect::new(0, 2, 1, 6)
        );
    }
}
