//! The vertex and index layout of the renderable terrain batches.
//!
//! A vertex data record stores a square grid of `size * size` vertices, followed by the
//! skirt rows and then the skirt columns. Skirts are copies of every `skirt_row_col_skip`th
//! row/column, moved downwards by the skirt size, which hide cracks between batches of different lod.
//!
//! Batches are rendered as a single triangle strip which snakes across the rows of the grid
//! and then walks once around the edge to stitch in the skirts.

use crate::gpu::{BufferHandle, DeltaVertex, IndexBufferKey, PositionVertex, VertexBuffers};

/// The vertex data owned by the node at the top of a quadtree depth range.
#[derive(Clone, Debug)]
pub struct VertexDataRecord {
    /// The resolution of the whole terrain this data is sampled at.
    pub resolution: u16,
    /// The number of vertices along one edge of the grid.
    pub size: u16,
    /// The number of quadtree levels rendering from this data.
    pub tree_levels: u16,
    pub num_skirt_rows_cols: u16,
    pub skirt_row_col_skip: u16,
    pub positions: Vec<PositionVertex>,
    pub deltas: Vec<DeltaVertex>,
    pub gpu: Option<VertexBuffers>,
    pub gpu_dirty: bool,
}

impl VertexDataRecord {
    pub fn new(resolution: u16, size: u16, tree_levels: u16) -> Self {
        let num_skirt_rows_cols = (1 << tree_levels) + 1;
        let skirt_row_col_skip = (size - 1) / (num_skirt_rows_cols - 1);

        let mut record = Self {
            resolution,
            size,
            tree_levels,
            num_skirt_rows_cols,
            skirt_row_col_skip,
            positions: Vec::new(),
            deltas: Vec::new(),
            gpu: None,
            gpu_dirty: true,
        };

        let vertex_count = record.vertex_count();
        record.positions = vec![PositionVertex::default(); vertex_count];
        record.deltas = vec![DeltaVertex::default(); vertex_count];

        record
    }

    pub fn vertex_count(&self) -> usize {
        let size = self.size as usize;
        size * size + 2 * size * self.num_skirt_rows_cols as usize
    }

    #[inline]
    pub(crate) fn main_index(&self, column: usize, row: usize) -> usize {
        row * self.size as usize + column
    }

    #[inline]
    pub(crate) fn skirt_row_index(&self, skirt: usize, column: usize) -> usize {
        let size = self.size as usize;
        size * size + skirt * size + column
    }

    #[inline]
    pub(crate) fn skirt_column_index(&self, skirt: usize, row: usize) -> usize {
        let size = self.size as usize;
        size * size + (self.num_skirt_rows_cols as usize + skirt) * size + row
    }
}

/// The number of indices of a batch with `batch_size` vertices along one edge.
pub fn index_count(batch_size: u16) -> usize {
    let b = batch_size as usize;
    (b * 2 + 1) * (b - 1) + (b - 1) * 2 * 4 + 2
}

/// Maps a main grid vertex to the skirt vertex below it.
fn skirt_vertex_index(main_index: usize, key: &IndexBufferKey, is_column: bool) -> usize {
    let vdata_size = key.vdata_size as usize;
    let row = main_index / vdata_size;
    let column = main_index % vdata_size;
    let base = vdata_size * vdata_size;

    if is_column {
        let skirt = column / key.skirt_row_col_skip as usize;
        base + key.num_skirt_rows_cols as usize * vdata_size + vdata_size * skirt + row
    } else {
        let skirt = row / key.skirt_row_col_skip as usize;
        base + vdata_size * skirt + column
    }
}

/// Builds the triangle strip for a batch described by `key`.
///
/// Rows are emitted alternating right to left and left to right, turning with one degenerate
/// index, afterwards the strip walks counter clockwise around the edge (top, left, bottom, right)
/// alternating between edge and skirt vertices.
pub fn populate_index_buffer(key: &IndexBufferKey) -> Vec<u16> {
    let batch_size = key.batch_size as i64;
    let increment = key.vertex_increment as i64;
    let row_size = key.vdata_size as i64 * increment;

    let mut indices = Vec::with_capacity(index_count(key.batch_size));

    let mut current = (batch_size - 1) * increment
        + key.y_offset as i64 * key.vdata_size as i64
        + key.x_offset as i64;
    let mut right_to_left = true;

    for _ in 0..batch_size - 1 {
        for column in 0..batch_size {
            indices.push(current as u16);
            indices.push((current + row_size) as u16);

            // the last one stays for the degenerate turn
            if column + 1 < batch_size {
                current += if right_to_left { -increment } else { increment };
            }
        }

        right_to_left = !right_to_left;
        current += row_size;
        indices.push(current as u16);
    }

    for side in 0..4 {
        let (edge_increment, skirt_increment) = match side {
            0 => (-increment, -increment), // top
            1 => (-row_size, -increment),  // left
            2 => (increment, increment),   // bottom
            _ => (row_size, increment),    // right
        };

        let mut skirt = skirt_vertex_index(current as usize, key, side % 2 != 0) as i64;
        let steps = if side == 3 { batch_size } else { batch_size - 1 };

        for _ in 0..steps {
            indices.push(current as u16);
            indices.push(skirt as u16);
            current += edge_increment;
            skirt += skirt_increment;
        }
    }

    indices
}

/// The shared index buffer a lod level of a node renders with.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BatchIndexData {
    pub key: IndexBufferKey,
    pub buffer: BufferHandle,
    pub index_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(batch_size: u16, vdata_size: u16, tree_levels: u16) -> IndexBufferKey {
        let record = VertexDataRecord::new(vdata_size, vdata_size, tree_levels);

        IndexBufferKey {
            batch_size,
            vdata_size,
            vertex_increment: (vdata_size - 1) / (batch_size - 1),
            x_offset: 0,
            y_offset: 0,
            num_skirt_rows_cols: record.num_skirt_rows_cols,
            skirt_row_col_skip: record.skirt_row_col_skip,
        }
    }

    #[test]
    fn simple_strip() {
        let indices = populate_index_buffer(&key(3, 3, 0));

        // main strip, then top, left, bottom and right skirts
        assert_eq!(
            &indices[..14],
            &[2, 5, 1, 4, 0, 3, 3, 3, 6, 4, 7, 5, 8, 8]
        );
        assert_eq!(&indices[14..18], &[8, 14, 7, 13]);
        assert_eq!(indices.len(), index_count(3));
    }

    #[test]
    fn index_count_matches_strip() {
        for (batch, vdata, levels) in [(17, 17, 0), (33, 65, 1), (65, 129, 2), (17, 129, 2)] {
            let key = key(batch, vdata, levels);
            let indices = populate_index_buffer(&key);
            let vertex_count = VertexDataRecord::new(vdata, vdata, levels).vertex_count();

            assert_eq!(indices.len(), index_count(batch));
            assert!(indices.iter().all(|&i| (i as usize) < vertex_count));
        }
    }

    #[test]
    fn skirt_layout() {
        let record = VertexDataRecord::new(129, 129, 2);

        assert_eq!(record.num_skirt_rows_cols, 5);
        assert_eq!(record.skirt_row_col_skip, 32);
        assert_eq!(record.vertex_count(), 129 * 129 + 2 * 129 * 5);
        assert_eq!(record.skirt_column_index(0, 0), 129 * 129 + 5 * 129);
    }
}
