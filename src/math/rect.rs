use serde::{Deserialize, Serialize};

/// A rectangle of terrain vertices. `right` and `bottom` are exclusive.
///
/// A rectangle with `right <= left` or `bottom <= top` is null.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TerrainRect {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

impl TerrainRect {
    pub const NULL: Self = Self {
        left: 0,
        top: 0,
        right: 0,
        bottom: 0,
    };

    pub const fn new(left: i64, top: i64, right: i64, bottom: i64) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// The rectangle covering a whole terrain of `size` vertices per edge.
    pub const fn full(size: u16) -> Self {
        Self::new(0, 0, size as i64, size as i64)
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }

    #[inline]
    pub fn width(&self) -> i64 {
        self.right - self.left
    }

    #[inline]
    pub fn height(&self) -> i64 {
        self.bottom - self.top
    }

    #[inline]
    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }

    /// Grows this rectangle to also cover `other`. Merging into a null rectangle replaces it.
    pub fn merge(&mut self, other: &Self) {
        if other.is_null() {
            return;
        }

        if self.is_null() {
            *self = *other;
        } else {
            self.left = self.left.min(other.left);
            self.top = self.top.min(other.top);
            self.right = self.right.max(other.right);
            self.bottom = self.bottom.max(other.bottom);
        }
    }

    pub fn merged(mut self, other: &Self) -> Self {
        self.merge(other);
        self
    }

    pub fn intersect(&self, other: &Self) -> Self {
        let rect = Self::new(
            self.left.max(other.left),
            self.top.max(other.top),
            self.right.min(other.right),
            self.bottom.min(other.bottom),
        );

        if rect.is_null() {
            Self::NULL
        } else {
            rect
        }
    }

    pub fn intersects(&self, other: &Self) -> bool {
        !self.intersect(other).is_null()
    }

    pub fn widen(&self, amount: i64) -> Self {
        Self::new(
            self.left - amount,
            self.top - amount,
            self.right + amount,
            self.bottom + amount,
        )
    }

    /// Clamps the rectangle to the vertex range of a terrain.
    pub fn clamp_to(&self, size: u16) -> Self {
        self.intersect(&Self::full(size))
    }
}
