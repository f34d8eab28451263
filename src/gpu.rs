//! The interface between the terrain data structures and a rendering back end.
//!
//! The terrain only ever asks for opaque buffer handles and hands over vertex data,
//! so any back end can plug in by implementing [`GpuBufferProvider`].

use bevy::utils::HashMap;
use bytemuck::{Pod, Zeroable};
use slab::Slab;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex, MutexGuard, PoisonError,
};

/// Identifies the terrain that owns a set of vertex buffers.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct TerrainId(pub u64);

impl TerrainId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct BufferHandle(pub u64);

/// The pair of vertex buffers backing one vertex data record.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct VertexBuffers {
    pub positions: BufferHandle,
    pub deltas: BufferHandle,
}

/// Position vertex: terrain position relative to the node centre and texture coordinates.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PositionVertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
}

/// Delta vertex: the height change when the vertex is removed and the lod at which that happens.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct DeltaVertex {
    pub delta: f32,
    pub lod_threshold: f32,
}

/// Describes the topology of a shared index buffer.
/// Batches with identical keys share the same index buffer.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct IndexBufferKey {
    pub batch_size: u16,
    pub vdata_size: u16,
    pub vertex_increment: u16,
    pub x_offset: u16,
    pub y_offset: u16,
    pub num_skirt_rows_cols: u16,
    pub skirt_row_col_skip: u16,
}

/// Allocates and fills the buffers used to render terrain batches.
///
/// All methods are only called from the main thread.
pub trait GpuBufferProvider: Send + Sync {
    fn allocate_vertex_buffers(&self, terrain: TerrainId, vertex_count: usize) -> VertexBuffers;
    fn upload_vertex_data(
        &self,
        buffers: VertexBuffers,
        positions: &[PositionVertex],
        deltas: &[DeltaVertex],
    );
    fn free_vertex_buffers(&self, buffers: VertexBuffers);
    /// Returns the index buffer for `key`, building it with `build` only if it does not exist yet.
    /// Shared index buffers are never freed individually.
    fn shared_index_buffer(&self, key: IndexBufferKey, build: &dyn Fn() -> Vec<u16>)
        -> BufferHandle;
    fn free_all_buffers(&self);
}

#[derive(Default)]
struct CpuBuffers {
    buffers: Slab<(TerrainId, Vec<u8>)>,
    index_buffers: HashMap<IndexBufferKey, BufferHandle>,
}

/// A buffer provider which keeps all buffers in system memory.
///
/// Used by headless tools and tests, or as a staging area for a custom back end.
#[derive(Default)]
pub struct CpuBufferProvider {
    inner: Mutex<CpuBuffers>,
}

impl CpuBufferProvider {
    fn lock(&self) -> MutexGuard<CpuBuffers> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The number of live vertex buffers (two per vertex data record).
    pub fn vertex_buffer_count(&self) -> usize {
        let inner = self.lock();
        inner.buffers.len() - inner.index_buffers.len()
    }

    pub fn index_buffer_count(&self) -> usize {
        self.lock().index_buffers.len()
    }

    pub fn buffer_data(&self, handle: BufferHandle) -> Option<Vec<u8>> {
        self.lock()
            .buffers
            .get(handle.0 as usize)
            .map(|(_, data)| data.clone())
    }

    pub fn index_data(&self, handle: BufferHandle) -> Option<Vec<u16>> {
        self.buffer_data(handle)
            .map(|bytes| bytemuck::pod_collect_to_vec(&bytes))
    }
}

impl GpuBufferProvider for CpuBufferProvider {
    fn allocate_vertex_buffers(&self, terrain: TerrainId, vertex_count: usize) -> VertexBuffers {
        let mut inner = self.lock();

        let positions = inner.buffers.insert((
            terrain,
            vec![0; vertex_count * size_of::<PositionVertex>()],
        ));
        let deltas = inner
            .buffers
            .insert((terrain, vec![0; vertex_count * size_of::<DeltaVertex>()]));

        VertexBuffers {
            positions: BufferHandle(positions as u64),
            deltas: BufferHandle(deltas as u64),
        }
    }

    fn upload_vertex_data(
        &self,
        buffers: VertexBuffers,
        positions: &[PositionVertex],
        deltas: &[DeltaVertex],
    ) {
        let mut inner = self.lock();

        if let Some((_, data)) = inner.buffers.get_mut(buffers.positions.0 as usize) {
            data.clear();
            data.extend_from_slice(bytemuck::cast_slice(positions));
        }
        if let Some((_, data)) = inner.buffers.get_mut(buffers.deltas.0 as usize) {
            data.clear();
            data.extend_from_slice(bytemuck::cast_slice(deltas));
        }
    }

    fn free_vertex_buffers(&self, buffers: VertexBuffers) {
        let mut inner = self.lock();

        inner.buffers.try_remove(buffers.positions.0 as usize);
        inner.buffers.try_remove(buffers.deltas.0 as usize);
    }

    fn shared_index_buffer(
        &self,
        key: IndexBufferKey,
        build: &dyn Fn() -> Vec<u16>,
    ) -> BufferHandle {
        let mut inner = self.lock();

        if let Some(&handle) = inner.index_buffers.get(&key) {
            return handle;
        }

        let indices = build();
        let index = inner.buffers.insert((
            TerrainId(u64::MAX),
            bytemuck::cast_slice(&indices).to_vec(),
        ));
        let handle = BufferHandle(index as u64);
        inner.index_buffers.insert(key, handle);

        handle
    }

    fn free_all_buffers(&self) {
        let mut inner = self.lock();

        inner.buffers.clear();
        inner.index_buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn vertex_buffers_are_freed() {
        let provider = CpuBufferProvider::default();
        let terrain = TerrainId::next();

        let buffers = provider.allocate_vertex_buffers(terrain, 4);
        assert_eq!(provider.vertex_buffer_count(), 2);

        provider.upload_vertex_data(
            buffers,
            &[PositionVertex::default(); 4],
            &[DeltaVertex {
                delta: 1.0,
                lod_threshold: 2.0,
            }; 4],
        );
        let deltas: Vec<f32> =
            bytemuck::pod_collect_to_vec(&provider.buffer_data(buffers.deltas).unwrap());
        assert_eq!(&deltas[..2], &[1.0, 2.0]);

        provider.free_vertex_buffers(buffers);
        assert_eq!(provider.vertex_buffer_count(), 0);
    }

    #[test]
    fn index_buffers_are_shared() {
        let provider = CpuBufferProvider::default();
        let builds = Cell::new(0);
        let key = IndexBufferKey {
            batch_size: 17,
            vdata_size: 17,
            vertex_increment: 1,
            x_offset: 0,
            y_offset: 0,
            num_skirt_rows_cols: 2,
            skirt_row_col_skip: 16,
        };

        let build = || {
            builds.set(builds.get() + 1);
            vec![0, 1, 2]
        };

        let a = provider.shared_index_buffer(key, &build);
        let b = provider.shared_index_buffer(key, &build);

        assert_eq!(a, b);
        assert_eq!(builds.get(), 1);
        assert_eq!(provider.index_data(a).unwrap(), vec![0, 1, 2]);
    }
}
