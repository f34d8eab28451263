//! Streams the slots of a [`TerrainGroup`] in and out around the viewers.
//!
//! Every slot is a page with its [`GridKey`] as id. Requested pages are queued and loaded one at
//! a time, at most once per [`PagingConfig::load_interval`], so many pages becoming visible at
//! once do not saturate the disk.

use crate::{
    math::GridKey,
    options::PagingConfig,
    terrain_group::{TerrainGroup, TerrainSlot},
};
use bevy::{
    log::{debug, warn},
    prelude::*,
};
use std::{collections::VecDeque, time::Duration};

/// Defines the terrain of a page right before it is loaded.
pub trait TerrainDefiner: Send + Sync + 'static {
    fn define(&mut self, group: &mut TerrainGroup, x: i32, y: i32);
}

impl<F> TerrainDefiner for F
where
    F: FnMut(&mut TerrainGroup, i32, i32) + Send + Sync + 'static,
{
    fn define(&mut self, group: &mut TerrainGroup, x: i32, y: i32) {
        self(group, x, y)
    }
}

/// Loads every page from its default file name.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultTerrainDefiner;

impl TerrainDefiner for DefaultTerrainDefiner {
    fn define(&mut self, group: &mut TerrainGroup, x: i32, y: i32) {
        group.define_terrain(x, y);
    }
}

#[derive(Component)]
pub struct PagedWorldSection {
    group: TerrainGroup,
    definer: Box<dyn TerrainDefiner>,
    config: PagingConfig,
    pending: VecDeque<GridKey>,
    in_flight: Option<GridKey>,
    next_load: Duration,
}

impl PagedWorldSection {
    pub fn new(group: TerrainGroup, config: PagingConfig) -> Self {
        Self::with_definer(group, config, DefaultTerrainDefiner)
    }

    pub fn with_definer<D: TerrainDefiner>(
        group: TerrainGroup,
        config: PagingConfig,
        definer: D,
    ) -> Self {
        Self {
            group,
            definer: Box::new(definer),
            config,
            pending: VecDeque::new(),
            in_flight: None,
            next_load: Duration::ZERO,
        }
    }

    pub fn group(&self) -> &TerrainGroup {
        &self.group
    }

    pub fn group_mut(&mut self) -> &mut TerrainGroup {
        &mut self.group
    }

    pub fn config(&self) -> &PagingConfig {
        &self.config
    }

    pub fn set_definer<D: TerrainDefiner>(&mut self, definer: D) {
        self.definer = Box::new(definer);
    }

    pub fn set_page_range(&mut self, min_x: i32, min_y: i32, max_x: i32, max_y: i32) {
        self.config.min_page = (min_x, min_y);
        self.config.max_page = (max_x, max_y);
    }

    pub fn set_load_radius(&mut self, radius: f32) {
        self.config.load_radius = radius;
    }

    pub fn set_hold_radius(&mut self, radius: f32) {
        self.config.hold_radius = radius;
    }

    pub fn set_load_interval(&mut self, interval: Duration) {
        self.config.load_interval = interval;
    }

    pub fn pending_pages(&self) -> impl Iterator<Item = GridKey> + '_ {
        self.pending.iter().copied()
    }

    pub fn is_in_range(&self, page: GridKey) -> bool {
        let (x, y) = page.coordinate();
        let (min_x, min_y) = self.config.min_page;
        let (max_x, max_y) = self.config.max_page;

        (min_x..=max_x).contains(&x) && (min_y..=max_y).contains(&y)
    }

    fn is_resident(&self, page: GridKey) -> bool {
        self.group
            .terrain_slot(page.x(), page.y())
            .is_some_and(|slot| slot.is_loaded() || slot.is_loading())
    }

    /// Queues a page. Pages outside of the range, already queued or already resident are ignored.
    ///
    /// With `force_synchronous` the page is defined and loaded right away.
    pub fn load_page(&mut self, page: GridKey, force_synchronous: bool) {
        if !self.is_in_range(page) || self.is_resident(page) {
            return;
        }

        if force_synchronous {
            self.pending.retain(|&pending| pending != page);
            self.load_now(page, true);
        } else if !self.pending.contains(&page) {
            debug!("queued page {page}");
            self.pending.push_back(page);
        }
    }

    /// Drops a page from the queue, or removes its terrain if it was loaded already.
    pub fn unload_page(&mut self, page: GridKey) {
        if let Some(index) = self.pending.iter().position(|&pending| pending == page) {
            self.pending.remove(index);
            debug!("dequeued page {page}");
            return;
        }

        if self.group.terrain_slot(page.x(), page.y()).is_some() {
            self.group.remove_terrain(page.x(), page.y());
            debug!("unloaded page {page}");
        }

        if self.in_flight == Some(page) {
            self.in_flight = None;
        }
    }

    /// Defines and loads a page. Pages which became resident while queued are left alone,
    /// defining them again would tear down their terrain.
    fn load_now(&mut self, page: GridKey, synchronous: bool) -> bool {
        if self.is_resident(page) {
            debug!("page {page} is already resident");
            return false;
        }

        let (x, y) = page.coordinate();
        self.definer.define(&mut self.group, x, y);

        match self.group.load_terrain(x, y, synchronous) {
            Ok(()) => {
                debug!("loading page {page}");
                true
            }
            Err(err) => {
                warn!("page {page} can not be loaded: {err}");
                false
            }
        }
    }

    /// Starts the next queued load once the previous one completed and the interval has passed.
    pub fn update(&mut self, now: Duration) {
        if let Some(page) = self.in_flight {
            let loading = self
                .group
                .terrain_slot(page.x(), page.y())
                .is_some_and(TerrainSlot::is_loading);
            if loading {
                return;
            }

            self.in_flight = None;
            self.next_load = now + self.config.load_interval;
        }

        while now >= self.next_load {
            let Some(page) = self.pending.pop_front() else {
                return;
            };

            if !self.load_now(page, false) {
                continue;
            }

            let loading = self
                .group
                .terrain_slot(page.x(), page.y())
                .is_some_and(TerrainSlot::is_loading);
            if loading {
                self.in_flight = Some(page);
                return;
            }

            self.next_load = now + self.config.load_interval;
        }
    }

    /// Finishes the loads of the group, see [`TerrainGroup::process_responses`].
    pub fn process_responses(&mut self) -> usize {
        self.group.process_responses()
    }

    /// Whether no page is queued or loading.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_none() && self.group.loads_in_flight() == 0
    }

    /// The distance between a world position and the centre of a page, measured in the terrain plane.
    fn page_distance(&self, page: GridKey, position: Vec3) -> f32 {
        let centre = self
            .group
            .convert_terrain_slot_to_world_position(page.x(), page.y());
        let offset = self.group.alignment().world_to_terrain(position - centre);

        offset.truncate().length()
    }

    /// Requests the pages around a viewer and releases the ones it left behind.
    pub fn notify_viewer(&mut self, position: Vec3) {
        let (cx, cy) = self.group.convert_world_position_to_terrain_slot(position);
        let world_size = self.group.terrain_world_size();
        let range = (self.config.load_radius / world_size).ceil() as i32;

        for (dx, dy) in itertools::iproduct!(-range..=range, -range..=range) {
            let page = GridKey::new(cx + dx, cy + dy);

            if self.page_distance(page, position) <= self.config.load_radius {
                self.load_page(page, false);
            }
        }

        let out_of_range = self
            .group
            .slots()
            .map(TerrainSlot::key)
            .chain(self.pending.iter().copied())
            .filter(|&page| self.page_distance(page, position) > self.config.hold_radius)
            .collect::<Vec<_>>();

        for page in out_of_range {
            self.unload_page(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gpu::CpuBufferProvider, math::Alignment, options::TerrainOptions, terrain::Neighbour,
    };
    use std::sync::Arc;

    fn section(force_synchronous: bool) -> PagedWorldSection {
        let mut group = TerrainGroup::new(
            Alignment::XZ,
            65,
            100.0,
            TerrainOptions {
                force_synchronous,
                ..TerrainOptions::default()
            },
            Arc::new(CpuBufferProvider::default()),
        );
        group.default_import_data_mut().max_batch_size = 33;

        PagedWorldSection::with_definer(
            group,
            PagingConfig {
                load_radius: 150.0,
                hold_radius: 250.0,
                min_page: (-5, -5),
                max_page: (5, 5),
                load_interval: Duration::from_millis(900),
            },
            |group: &mut TerrainGroup, x: i32, y: i32| {
                group
                    .define_terrain_constant(x, y, (x + y) as f32)
                    .unwrap();
            },
        )
    }

    #[test]
    fn pages_are_queued_once() {
        let mut section = section(true);

        section.load_page(GridKey::new(0, 0), false);
        section.load_page(GridKey::new(1, 0), false);
        section.load_page(GridKey::new(0, 0), false);
        section.load_page(GridKey::new(9, 0), false);

        assert_eq!(
            section.pending_pages().collect::<Vec<_>>(),
            vec![GridKey::new(0, 0), GridKey::new(1, 0)]
        );

        section.unload_page(GridKey::new(1, 0));
        assert_eq!(section.pending_pages().count(), 1);
        assert!(!section.is_idle());
    }

    #[test]
    fn loads_respect_the_interval() {
        let mut section = section(true);
        for x in 0..3 {
            section.load_page(GridKey::new(x, 0), false);
        }

        section.update(Duration::ZERO);
        assert!(section.group().loaded_terrain(0, 0).is_some());
        assert!(section.group().terrain_slot(1, 0).is_none());

        section.update(Duration::from_millis(500));
        assert!(section.group().terrain_slot(1, 0).is_none());

        section.update(Duration::from_millis(900));
        assert!(section.group().loaded_terrain(1, 0).is_some());
        assert_eq!(section.pending_pages().count(), 1);

        section.update(Duration::from_millis(1800));
        assert!(section.group().loaded_terrain(2, 0).is_some());
        assert!(section.is_idle());

        // already resident
        section.load_page(GridKey::new(2, 0), false);
        assert!(section.is_idle());
    }

    #[test]
    fn background_loads_block_the_queue() {
        let mut section = section(false);
        section.load_page(GridKey::new(0, 0), false);
        section.load_page(GridKey::new(0, 1), false);

        section.update(Duration::ZERO);
        assert!(section.group().terrain_slot(0, 0).unwrap().is_loading());

        section.update(Duration::from_secs(10));
        assert!(section.group().terrain_slot(0, 1).is_none());

        section.group_mut().wait_for_loads();
        section.update(Duration::from_secs(10));
        assert!(section.group().loaded_terrain(0, 0).is_some());
        assert!(section.group().terrain_slot(0, 1).is_none());

        section.update(Duration::from_secs(11));
        assert!(section.group().terrain_slot(0, 1).unwrap().is_loading());
    }

    #[test]
    fn viewer_moves_pages() {
        let mut section = section(true);
        section.set_load_interval(Duration::ZERO);

        section.notify_viewer(Vec3::ZERO);
        let mut pending = section.pending_pages().collect::<Vec<_>>();
        pending.sort();
        let mut expected = itertools::iproduct!(-1..=1, -1..=1)
            .map(|(x, y)| GridKey::new(x, y))
            .collect::<Vec<_>>();
        expected.sort();
        assert_eq!(pending, expected);

        section.update(Duration::ZERO);
        assert_eq!(section.group().terrains().count(), 9);
        assert!(section.is_idle());

        // the pages of the old position within the hold radius stay
        section.notify_viewer(Vec3::new(200.0, 0.0, 0.0));
        assert!(section.group().loaded_terrain(0, 0).is_some());
        assert!(section.group().terrain_slot(-1, 0).is_none());
        assert_eq!(section.pending_pages().count(), 6);

        // past the page range nothing is requested
        section.notify_viewer(Vec3::new(1000.0, 0.0, 0.0));
        assert_eq!(section.pending_pages().count(), 0);
        assert_eq!(section.group().slots().count(), 0);
    }

    #[test]
    fn queued_pages_loaded_elsewhere_are_kept() {
        let mut section = section(true);
        section.load_page(GridKey::new(0, 0), false);
        section.load_page(GridKey::new(1, 0), false);

        let group = section.group_mut();
        group.define_terrain_constant(0, 0, 7.0).unwrap();
        group.define_terrain_constant(1, 0, 7.0).unwrap();
        group.load_terrain(0, 0, true).unwrap();
        group.load_terrain(1, 0, true).unwrap();
        let terrain = group.loaded_terrain(0, 0).unwrap();

        section.update(Duration::ZERO);

        assert!(section.is_idle());
        let resident = section.group().loaded_terrain(0, 0).unwrap();
        assert!(resident.ptr_eq(&terrain));
        assert_eq!(resident.read().height_at_point(0, 0), Some(7.0));
        assert!(resident.read().neighbour(Neighbour::East).is_some());
    }

    #[test]
    fn forced_pages_skip_the_queue() {
        let mut section = section(false);
        section.load_page(GridKey::new(2, 2), false);
        section.load_page(GridKey::new(2, 2), true);

        assert!(section.group().loaded_terrain(2, 2).is_some());
        assert_eq!(section.pending_pages().count(), 0);
    }
}
