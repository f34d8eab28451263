use crate::{paging::PagedWorldSection, terrain_data::quadtree::cfactor};
use bevy::prelude::*;

/// Marks the entity whose position drives paging and lod selection, usually the camera.
#[derive(Component, Clone, Copy, Debug)]
pub struct TerrainViewer {
    /// Vertical field of view in radians.
    pub fov_y: f32,
    /// Viewport height in pixels.
    pub viewport_height: f32,
    /// The largest tolerated screen space error of a lod, in pixels.
    pub max_pixel_error: f32,
}

impl Default for TerrainViewer {
    fn default() -> Self {
        Self {
            fov_y: std::f32::consts::FRAC_PI_4,
            viewport_height: 1080.0,
            max_pixel_error: 3.0,
        }
    }
}

impl TerrainViewer {
    pub fn cfactor(&self) -> f32 {
        cfactor(self.fov_y, self.viewport_height, self.max_pixel_error)
    }
}

#[derive(Resource, Clone, Copy, Debug)]
pub struct TerrainPagingSettings {
    /// Runs lod streaming and derived data updates on the calling thread.
    pub synchronous: bool,
    /// Streams lod data in and out following the viewer.
    pub auto_update_lod: bool,
}

impl Default for TerrainPagingSettings {
    fn default() -> Self {
        Self {
            synchronous: false,
            auto_update_lod: true,
        }
    }
}

/// Streams the pages of every [`PagedWorldSection`] around the [`TerrainViewer`]s and keeps the
/// loaded terrains up to date.
#[derive(Default)]
pub struct TerrainPagingPlugin {
    pub settings: TerrainPagingSettings,
}

impl Plugin for TerrainPagingPlugin {
    fn build(&self, app: &mut App) {
        app.insert_resource(self.settings).add_systems(
            Last,
            (
                stream_pages.before(process_terrain_responses),
                process_terrain_responses,
                update_terrain_lod.after(process_terrain_responses),
                update_terrain_derived_data.after(update_terrain_lod),
            ),
        );
    }
}

pub fn stream_pages(
    time: Res<Time>,
    viewers: Query<&GlobalTransform, With<TerrainViewer>>,
    mut sections: Query<&mut PagedWorldSection>,
) {
    for mut section in &mut sections {
        for viewer in &viewers {
            section.notify_viewer(viewer.translation());
        }

        section.update(time.elapsed());
    }
}

pub fn process_terrain_responses(mut sections: Query<&mut PagedWorldSection>) {
    for mut section in &mut sections {
        section.process_responses();
    }
}

pub fn update_terrain_lod(
    settings: Res<TerrainPagingSettings>,
    viewers: Query<(&GlobalTransform, &TerrainViewer)>,
    mut sections: Query<&mut PagedWorldSection>,
) {
    let Some((transform, viewer)) = viewers.iter().next() else {
        return;
    };

    let viewpoint = transform.translation();
    let cfactor = viewer.cfactor();

    for mut section in &mut sections {
        let group = section.group_mut();

        if settings.auto_update_lod {
            group.auto_update_lod(viewpoint, cfactor, settings.synchronous);
        }

        group.calculate_lod(viewpoint, cfactor);
    }
}

pub fn update_terrain_derived_data(
    settings: Res<TerrainPagingSettings>,
    mut sections: Query<&mut PagedWorldSection>,
) {
    for mut section in &mut sections {
        section.group_mut().update(settings.synchronous);
    }
}
