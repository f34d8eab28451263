//! Streams lod levels of a terrain in and out.
//!
//! Three cursors track the lod state, smaller means finer:
//! - `highest_lod_prepared`: the finest level whose heights and deltas are resident in memory,
//! - `highest_lod_loaded`: the finest level that is assigned to the quadtree and renderable,
//! - `target_lod_level`: the finest level requested.
//!
//! A cursor equal to the number of lod levels means nothing is resident.
//! Moving towards finer lods reads the missing levels on a worker thread, while moving
//! towards coarser lods only releases quadtree data and happens immediately.

use crate::{
    formats::{
        chunk::ChunkReader,
        terrain_file::{read_lod_levels, LodLevelData, LodSection},
    },
    terrain_data::{lod_info::LodInfoTable, quadtree::QuadTree},
    work::BackgroundJob,
};
use anyhow::{Context, Result};
use bevy::log::{debug, error};
use ndarray::Array2;
use std::{
    fs::File,
    io::BufReader,
    mem,
    path::{Path, PathBuf},
};

/// Where the lod levels of a streamed terrain are read from.
#[derive(Clone, Debug)]
struct LodSource {
    path: PathBuf,
    section: LodSection,
}

/// A background read of the lod levels `coarsest..=finest`.
struct LodRead {
    coarsest: u16,
    finest: u16,
    job: BackgroundJob<Vec<LodLevelData>>,
}

pub struct LodManager {
    table: LodInfoTable,
    size: u16,
    highest_lod_prepared: u16,
    highest_lod_loaded: u16,
    target_lod_level: u16,
    source: Option<LodSource>,
    read: Option<LodRead>,
    read_log: Vec<(u16, u16)>,
    assignments: usize,
    refined: bool,
}

impl LodManager {
    pub fn new(table: LodInfoTable, size: u16) -> Self {
        let none = table.num_lod_levels();

        Self {
            table,
            size,
            highest_lod_prepared: none,
            highest_lod_loaded: none,
            target_lod_level: none,
            source: None,
            read: None,
            read_log: Vec::new(),
            assignments: 0,
            refined: false,
        }
    }

    pub fn table(&self) -> &LodInfoTable {
        &self.table
    }

    pub fn num_lod_levels(&self) -> u16 {
        self.table.num_lod_levels()
    }

    pub fn highest_lod_prepared(&self) -> u16 {
        self.highest_lod_prepared
    }

    pub fn highest_lod_loaded(&self) -> u16 {
        self.highest_lod_loaded
    }

    pub fn target_lod_level(&self) -> u16 {
        self.target_lod_level
    }

    /// The level ranges `(coarsest, finest)` of every disk read, in dispatch order.
    pub fn read_log(&self) -> &[(u16, u16)] {
        &self.read_log
    }

    /// The number of depth ranges assigned to the quadtree so far.
    pub fn assignments(&self) -> usize {
        self.assignments
    }

    /// Whether streamed levels replaced interpolated heights since the last call.
    /// Data derived from the heights has to be recalculated in that case.
    pub fn take_refined(&mut self) -> bool {
        mem::take(&mut self.refined)
    }

    pub fn is_busy(&self) -> bool {
        self.read.is_some()
    }

    /// All levels are resident, for terrains prepared from memory or read completely.
    pub fn prepare_all(&mut self) {
        self.source = None;
        self.highest_lod_prepared = 0;
        self.target_lod_level = 0;
    }

    /// The levels from the coarsest down to `lowest_level` are resident,
    /// the finer ones are read from `path` on demand.
    pub fn prepare_streamed<P: AsRef<Path>>(
        &mut self,
        path: P,
        section: LodSection,
        lowest_level: u16,
    ) {
        self.source = Some(LodSource {
            path: path.as_ref().to_path_buf(),
            section,
        });
        self.highest_lod_prepared = lowest_level.min(self.num_lod_levels());
        self.target_lod_level = self.highest_lod_prepared;
    }

    /// Every level became resident without streaming, e.g. through a full read while saving.
    /// Loaded and target lods stay as they are.
    pub fn mark_all_prepared(&mut self) {
        self.read = None;
        self.source = None;
        self.highest_lod_prepared = 0;
    }

    /// Forgets all resident levels. An in flight read is dropped.
    pub fn unprepare(&mut self) {
        let none = self.num_lod_levels();

        self.read = None;
        self.source = None;
        self.highest_lod_prepared = none;
        self.highest_lod_loaded = none;
        self.target_lod_level = none;
    }

    /// Assigns and loads every prepared level into a freshly created quadtree.
    pub fn load(
        &mut self,
        quadtree: &mut QuadTree,
        heights: &Array2<f32>,
        deltas: &Array2<f32>,
    ) {
        self.highest_lod_loaded = self.num_lod_levels();
        self.promote(quadtree, heights, deltas, self.highest_lod_prepared);
    }

    /// Releases everything loaded into the quadtree.
    pub fn unload_all(&mut self, quadtree: &mut QuadTree) {
        quadtree.unload_all();
        self.highest_lod_loaded = self.num_lod_levels();
    }

    /// Requests `level` to become the finest renderable lod.
    ///
    /// Coarsening happens immediately. Refining reads the missing levels in the background,
    /// or inline if `synchronous` is set. While a read is in flight, asynchronous requests only
    /// update the target, which is re-evaluated once the read completes.
    pub fn update_to_lod_level(
        &mut self,
        level: u16,
        synchronous: bool,
        quadtree: &mut QuadTree,
        heights: &mut Array2<f32>,
        deltas: &mut Array2<f32>,
    ) {
        let level = level.min(self.num_lod_levels() - 1);
        self.target_lod_level = level;

        if level < self.highest_lod_loaded {
            if level >= self.highest_lod_prepared {
                self.promote(quadtree, heights, deltas, level);
            } else if self.read.is_some() {
                if synchronous {
                    self.wait(quadtree, heights, deltas);
                    self.update_to_lod_level(level, true, quadtree, heights, deltas);
                }
            } else {
                // the finest prepared data might not be loaded yet
                let prepared = self.highest_lod_prepared;
                self.promote(quadtree, heights, deltas, prepared);
                self.dispatch_read(synchronous);

                if synchronous {
                    self.wait(quadtree, heights, deltas);
                }
            }
        } else if level > self.highest_lod_loaded {
            self.demote(quadtree, level);
        }
    }

    fn dispatch_read(&mut self, synchronous: bool) {
        let Some(source) = self.source.clone() else {
            error!(
                "lod level {} requested, but the terrain has no data source to stream it from",
                self.target_lod_level
            );
            return;
        };

        let coarsest = self.highest_lod_prepared - 1;
        let finest = self.target_lod_level;
        self.read_log.push((coarsest, finest));

        debug!(
            "reading lod levels {coarsest}..={finest} from {}",
            source.path.display()
        );

        let job = BackgroundJob::spawn(synchronous, move || {
            let file = File::open(&source.path)
                .with_context(|| format!("failed to open {}", source.path.display()))?;
            let mut reader = ChunkReader::new(BufReader::new(file));

            read_lod_levels(&mut reader, source.section, coarsest, finest).with_context(|| {
                format!(
                    "failed to read lod levels {coarsest}..={finest} of {}",
                    source.path.display()
                )
            })
        });

        self.read = Some(LodRead {
            coarsest,
            finest,
            job,
        });
    }

    /// Applies a finished background read. Returns whether the loaded lods changed.
    pub fn poll(
        &mut self,
        quadtree: &mut QuadTree,
        heights: &mut Array2<f32>,
        deltas: &mut Array2<f32>,
    ) -> bool {
        let Some(read) = self.read.as_mut() else {
            return false;
        };
        let Some(result) = read.job.poll() else {
            return false;
        };
        let Some(LodRead {
            coarsest, finest, ..
        }) = self.read.take()
        else {
            return false;
        };

        self.apply_read(result, coarsest, finest, false, quadtree, heights, deltas)
    }

    /// Blocks until no read is in flight anymore, including reads dispatched on completion.
    pub fn wait(
        &mut self,
        quadtree: &mut QuadTree,
        heights: &mut Array2<f32>,
        deltas: &mut Array2<f32>,
    ) {
        while let Some(LodRead {
            coarsest,
            finest,
            job,
        }) = self.read.take()
        {
            let result = job.wait();
            self.apply_read(result, coarsest, finest, true, quadtree, heights, deltas);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_read(
        &mut self,
        result: Result<Vec<LodLevelData>>,
        coarsest: u16,
        finest: u16,
        synchronous: bool,
        quadtree: &mut QuadTree,
        heights: &mut Array2<f32>,
        deltas: &mut Array2<f32>,
    ) -> bool {
        let levels = match result {
            Ok(levels) => levels,
            Err(err) => {
                error!("streaming lod levels {coarsest}..={finest} failed: {err:?}");
                return false;
            }
        };

        let num_lod_levels = self.num_lod_levels();
        for level in &levels {
            level.apply(self.size, num_lod_levels, heights, deltas);
        }
        self.refined |= !levels.is_empty();
        self.highest_lod_prepared = self.highest_lod_prepared.min(finest);

        // the target may have moved while reading, only promote as far as it still asks for
        let loaded = self.highest_lod_loaded;
        let promote_to = self.target_lod_level.max(self.highest_lod_prepared);
        if promote_to < loaded {
            self.promote(quadtree, heights, deltas, promote_to);
        }

        if self.target_lod_level < self.highest_lod_prepared {
            self.dispatch_read(synchronous);
        }

        self.highest_lod_loaded != loaded
    }

    /// Assigns and loads the lods from the current loaded one down to `level`,
    /// assigning each depth range only once.
    fn promote(
        &mut self,
        quadtree: &mut QuadTree,
        heights: &Array2<f32>,
        deltas: &Array2<f32>,
        level: u16,
    ) {
        let mut last_tree_start = None;

        for lod in (level..self.highest_lod_loaded).rev() {
            let info = *self.table.get(lod);

            if last_tree_start != Some(info.tree_start) {
                quadtree.assign_vertex_data(
                    info.tree_start,
                    info.tree_end,
                    info.resolution,
                    info.size,
                    heights,
                    deltas,
                );
                quadtree.load(info.tree_start, info.tree_end);

                last_tree_start = Some(info.tree_start);
                self.assignments += 1;
            }
        }

        self.highest_lod_loaded = self.highest_lod_loaded.min(level);
    }

    /// Releases the depth ranges no lod at or above `level` renders from.
    fn demote(&mut self, quadtree: &mut QuadTree, level: u16) {
        let in_use = (level..self.num_lod_levels())
            .map(|lod| self.table.get(lod).tree_start)
            .collect::<Vec<_>>();

        for lod in self.highest_lod_loaded..level {
            let info = self.table.get(lod);

            if info.is_last && !in_use.contains(&info.tree_start) {
                quadtree.unload(info.tree_start, info.tree_end);
            }
        }

        self.highest_lod_loaded = level;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        formats::{
            chunk::ChunkWriter,
            terrain_file::{read_terrain, write_terrain, TerrainFile, TerrainHeader},
        },
        gpu::{CpuBufferProvider, TerrainId},
        math::Alignment,
        terrain::layers::LayerDeclaration,
        terrain_data::TerrainGeometry,
    };
    use bevy::math::Vec3;
    use std::sync::Arc;

    const SIZE: u16 = 513;

    struct Fixture {
        _dir: tempfile::TempDir,
        manager: LodManager,
        quadtree: QuadTree,
        heights: Array2<f32>,
        deltas: Array2<f32>,
    }

    fn streamed(initial_level: u16) -> Fixture {
        let geometry = TerrainGeometry::new(Alignment::XZ, SIZE, 1000.0, 65, 33).unwrap();
        let heights = Array2::from_shape_fn((SIZE as usize, SIZE as usize), |(y, x)| {
            ((x as f32 * 0.05).sin() + (y as f32 * 0.03).cos()) * 20.0
        });
        let deltas = Array2::zeros((SIZE as usize, SIZE as usize));

        let file = TerrainFile {
            header: TerrainHeader {
                alignment: Alignment::XZ,
                size: SIZE,
                world_size: 1000.0,
                max_batch_size: 65,
                min_batch_size: 33,
                position: Vec3::ZERO,
            },
            layer_declaration: LayerDeclaration::default(),
            layers: Vec::new(),
            blend_map_size: 0,
            blend_maps: Vec::new(),
            normal_map: None,
            light_map: None,
            composite_map: None,
            quadtree_deltas: Vec::new(),
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terrain.dat");
        let mut writer = ChunkWriter::new();
        write_terrain(&mut writer, &file, &heights, &deltas, geometry.num_lod_levels()).unwrap();
        std::fs::write(&path, writer.into_bytes()).unwrap();

        let mut reader = ChunkReader::new(BufReader::new(File::open(&path).unwrap()));
        let read = read_terrain(&mut reader, initial_level).unwrap();

        let table = LodInfoTable::build(SIZE, 65, 33);
        let mut manager = LodManager::new(table, SIZE);
        manager.prepare_streamed(&path, read.lod_section, read.lowest_level);

        let mut quadtree = QuadTree::new(
            &geometry,
            TerrainId::next(),
            Arc::new(CpuBufferProvider::default()),
        );
        manager.load(&mut quadtree, &read.heights, &read.deltas);

        Fixture {
            _dir: dir,
            manager,
            quadtree,
            heights: read.heights,
            deltas: read.deltas,
        }
    }

    impl Fixture {
        fn update(&mut self, level: u16, synchronous: bool) {
            self.manager.update_to_lod_level(
                level,
                synchronous,
                &mut self.quadtree,
                &mut self.heights,
                &mut self.deltas,
            );
            self.check_cursors();
        }

        fn wait(&mut self) {
            self.manager
                .wait(&mut self.quadtree, &mut self.heights, &mut self.deltas);
            self.check_cursors();
        }

        fn check_cursors(&self) {
            assert!(self.manager.highest_lod_prepared() <= self.manager.highest_lod_loaded());
        }
    }

    #[test]
    fn initial_load_renders_prepared_levels() {
        let fixture = streamed(4);

        assert_eq!(fixture.manager.highest_lod_prepared(), 4);
        assert_eq!(fixture.manager.highest_lod_loaded(), 4);
        assert!(fixture.quadtree.is_renderable_at(4));
        assert!(!fixture.quadtree.is_renderable_at(2));
        assert!(fixture.manager.read_log().is_empty());
    }

    #[test]
    fn superseded_request_reads_each_level_once() {
        let mut fixture = streamed(4);

        fixture.update(2, false);
        fixture.update(0, false);
        assert_eq!(fixture.manager.target_lod_level(), 0);

        fixture.wait();

        assert_eq!(fixture.manager.read_log(), &[(3, 2), (1, 0)]);
        assert_eq!(fixture.manager.highest_lod_prepared(), 0);
        assert_eq!(fixture.manager.highest_lod_loaded(), 0);
        assert!(fixture.quadtree.is_renderable_at(0));
        assert!(!fixture.manager.is_busy());
    }

    #[test]
    fn streamed_heights_match_the_source() {
        let mut fixture = streamed(4);
        let expected = ((7.0f32 * 0.05).sin() + (3.0f32 * 0.03).cos()) * 20.0;

        assert_ne!(fixture.heights[(3, 7)], expected);
        fixture.update(0, true);
        assert_eq!(fixture.heights[(3, 7)], expected);
    }

    #[test]
    fn repeated_requests_are_idempotent() {
        let mut fixture = streamed(4);
        fixture.update(0, true);

        let reads = fixture.manager.read_log().len();
        let assignments = fixture.manager.assignments();

        for _ in 0..3 {
            fixture.update(0, true);
            fixture.update(0, false);
        }

        assert_eq!(fixture.manager.read_log().len(), reads);
        assert_eq!(fixture.manager.assignments(), assignments);
    }

    #[test]
    fn coarsening_never_touches_disk() {
        let mut fixture = streamed(4);
        fixture.update(0, true);
        let reads = fixture.manager.read_log().len();

        fixture.update(3, false);
        assert_eq!(fixture.manager.highest_lod_loaded(), 3);
        assert!(!fixture.quadtree.is_renderable_at(0));
        assert!(fixture.quadtree.is_renderable_at(3));

        // the data stayed prepared, refining again needs no read either
        fixture.update(0, false);
        assert_eq!(fixture.manager.highest_lod_loaded(), 0);
        assert_eq!(fixture.manager.read_log().len(), reads);
    }

    #[test]
    fn failed_read_leaves_cursors_unchanged() {
        let mut fixture = streamed(4);
        let section = fixture.manager.source.as_ref().unwrap().section;
        fixture
            .manager
            .prepare_streamed("/nonexistent/terrain.dat", section, 4);

        fixture.update(0, true);

        assert_eq!(fixture.manager.highest_lod_prepared(), 4);
        assert_eq!(fixture.manager.highest_lod_loaded(), 4);
        assert!(!fixture.manager.is_busy());
    }
}
