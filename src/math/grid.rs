use derive_more::derive::{Display, From};
use serde::{Deserialize, Serialize};
use std::{num::ParseIntError, str::FromStr};

/// Packs a signed grid coordinate into a single 32-bit key.
///
/// Each coordinate is reinterpreted as an unsigned 16-bit value, `x` occupies the high
/// and `y` the low half of the key.
/// Coordinates outside of `[-32768, 32767]` are truncated and will alias other slots.
#[inline]
pub fn pack_index(x: i32, y: i32) -> u32 {
    let x16 = x as i16 as u16 as u32;
    let y16 = y as i16 as u16 as u32;

    (x16 << 16) | y16
}

/// Inverse of [`pack_index`].
#[inline]
pub fn unpack_index(key: u32) -> (i32, i32) {
    let x = (key >> 16) as u16 as i16 as i32;
    let y = (key & 0xFFFF) as u16 as i16 as i32;

    (x, y)
}

/// The key of a terrain slot inside of a [`TerrainGroup`](crate::terrain_group::TerrainGroup)
/// and the identifier of a page inside of a [`PagedWorldSection`](crate::paging::PagedWorldSection).
#[derive(
    Copy,
    Clone,
    Default,
    Debug,
    Hash,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    From,
    Display,
    Serialize,
    Deserialize,
)]
#[display("{:08x}", _0)]
pub struct GridKey(pub u32);

impl GridKey {
    pub fn new(x: i32, y: i32) -> Self {
        Self(pack_index(x, y))
    }

    pub fn x(self) -> i32 {
        unpack_index(self.0).0
    }

    pub fn y(self) -> i32 {
        unpack_index(self.0).1
    }

    pub fn coordinate(self) -> (i32, i32) {
        unpack_index(self.0)
    }

    /// The key of the slot offset by `(dx, dy)`.
    pub fn offset(self, dx: i32, dy: i32) -> Self {
        let (x, y) = self.coordinate();
        Self::new(x + dx, y + dy)
    }

    /// The file name used for this slot when no explicit one is defined.
    pub fn filename(self, prefix: &str, extension: &str) -> String {
        format!("{prefix}_{self}.{extension}")
    }
}

impl From<(i32, i32)> for GridKey {
    fn from((x, y): (i32, i32)) -> Self {
        Self::new(x, y)
    }
}

impl FromStr for GridKey {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u32::from_str_radix(s, 16).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy::utils::HashSet;
    use itertools::iproduct;

    #[test]
    fn pack_round_trip() {
        for (x, y) in iproduct!(
            [-32768, -32767, -1000, -1, 0, 1, 255, 256, 32766, 32767],
            [-32768, -2, -1, 0, 1, 2, 4095, 32767]
        ) {
            assert_eq!(unpack_index(pack_index(x, y)), (x, y));
        }
    }

    #[test]
    fn pack_layout() {
        assert_eq!(pack_index(0, 0), 0);
        assert_eq!(pack_index(1, 0), 0x0001_0000);
        assert_eq!(pack_index(0, -1), 0x0000_FFFF);
        assert_eq!(pack_index(-1, 2), 0xFFFF_0002);
    }

    #[test]
    fn pack_does_not_collide() {
        let mut keys = HashSet::new();

        for (x, y) in iproduct!(-64..64, -64..64) {
            assert!(keys.insert(pack_index(x, y)));
        }
    }

    #[test]
    fn grid_key_filename() {
        let key = GridKey::new(1, -1);

        assert_eq!(key.filename("terrain", "dat"), "terrain_0001ffff.dat");
        assert_eq!("0001ffff".parse::<GridKey>().unwrap(), key);
        assert_eq!(key.offset(-1, 1), GridKey::new(0, 0));
    }
}
