use crate::{
    gpu::GpuBufferProvider,
    options::TerrainOptions,
    terrain::{neighbours::NeighbourLink, Terrain},
};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Shared ownership of a [`Terrain`].
///
/// The terrain group owns the only strong handle of each terrain,
/// neighbours and background work only keep weak links.
#[derive(Clone)]
pub struct TerrainHandle(Arc<RwLock<Terrain>>);

impl TerrainHandle {
    pub fn new(options: Arc<TerrainOptions>, provider: Arc<dyn GpuBufferProvider>) -> Self {
        Self(Arc::new_cyclic(|link| {
            let mut terrain = Terrain::new(options, provider);
            terrain.self_link = link.clone();
            RwLock::new(terrain)
        }))
    }

    pub fn read(&self) -> RwLockReadGuard<Terrain> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<Terrain> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn link(&self) -> NeighbourLink {
        let key = self.read().key();

        NeighbourLink {
            key,
            terrain: Arc::downgrade(&self.0),
        }
    }

    pub fn ptr_eq(&self, other: &TerrainHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn from_link(link: &NeighbourLink) -> Option<Self> {
        link.terrain.upgrade().map(Self)
    }
}
