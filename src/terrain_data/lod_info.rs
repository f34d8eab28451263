/// The largest batch a single vertex data record may hold along one edge.
pub const MAX_BATCH_SIZE: u16 = 129;

/// Describes how a single lod level is backed by the quadtree.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LodInfo {
    /// The quadtree depth whose nodes own the vertex data of this lod.
    pub tree_start: u16,
    /// One past the deepest quadtree depth rendering from that vertex data.
    pub tree_end: u16,
    /// Whether this lod is the deepest one its depth range can render at.
    /// Moving past it to a coarser lod releases the vertex data of the range.
    pub is_last: bool,
    /// The vertex resolution of the whole terrain at which the data is baked.
    pub resolution: u16,
    /// The vertex resolution of a single record along one edge.
    pub size: u16,
}

/// The lod level layout of a terrain, derived from its size and batch sizes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LodLevels {
    pub num_lod_levels: u16,
    /// The number of lod levels each leaf node of the quadtree renders by itself.
    pub leaf_lods: u16,
    pub tree_depth: u16,
}

#[inline]
fn log2(value: u16) -> u16 {
    value.trailing_zeros() as u16
}

pub fn determine_lod_levels(size: u16, max_batch_size: u16, min_batch_size: u16) -> LodLevels {
    let leaf_lods = log2(max_batch_size - 1) - log2(min_batch_size - 1) + 1;
    let num_lod_levels = log2(size - 1) - log2(min_batch_size - 1) + 1;

    LodLevels {
        num_lod_levels,
        leaf_lods,
        tree_depth: num_lod_levels - leaf_lods + 1,
    }
}

/// Maps every lod level of a terrain to the quadtree depth range that renders it.
///
/// Walking up the tree from the leaves, a depth becomes a split point once its node count
/// divides the baked resolution into records of at most [`MAX_BATCH_SIZE`] vertices.
/// All lods whose natural depth is at or below that split point share its vertex data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LodInfoTable {
    levels: LodLevels,
    entries: Vec<LodInfo>,
}

impl LodInfoTable {
    pub fn build(size: u16, max_batch_size: u16, min_batch_size: u16) -> Self {
        let levels = determine_lod_levels(size, max_batch_size, min_batch_size);
        let LodLevels {
            num_lod_levels,
            leaf_lods,
            tree_depth,
        } = levels;

        let mut entries = vec![LodInfo::default(); num_lod_levels as usize];

        // the deepest tree level at which each lod can be rendered
        let lod_depth = (0..num_lod_levels)
            .map(|level| {
                if level < leaf_lods {
                    tree_depth as i32 - 1
                } else {
                    (num_lod_levels - level) as i32 - 1
                }
            })
            .collect::<Vec<_>>();

        let mut depth = tree_depth;
        let mut prev_depth = tree_depth;
        let mut last = 0usize;
        let mut current_resolution = size;
        let mut baked_resolution = size;
        let mut target_splits = (baked_resolution - 1) / (MAX_BATCH_SIZE - 1);

        while depth > 0 && target_splits > 0 {
            depth -= 1;
            let splits = 1 << depth;

            if splits == target_splits {
                while last < entries.len() && lod_depth[last] >= depth as i32 {
                    entries[last] = LodInfo {
                        tree_start: depth,
                        tree_end: prev_depth,
                        is_last: lod_depth[last] == depth as i32,
                        resolution: baked_resolution,
                        size: (baked_resolution - 1) / splits + 1,
                    };
                    last += 1;
                }

                baked_resolution = ((current_resolution - 1) >> 1) + 1;
                target_splits = (baked_resolution - 1) / (MAX_BATCH_SIZE - 1);
                prev_depth = depth;
            }

            current_resolution = ((current_resolution - 1) >> 1) + 1;
        }

        // the remaining coarse lods are always rendered by the root
        for (level, entry) in entries.iter_mut().enumerate().skip(last) {
            *entry = LodInfo {
                tree_start: 0,
                tree_end: 1,
                is_last: level + 1 == num_lod_levels as usize,
                resolution: baked_resolution,
                size: baked_resolution,
            };
        }

        Self { levels, entries }
    }

    pub fn levels(&self) -> LodLevels {
        self.levels
    }

    pub fn num_lod_levels(&self) -> u16 {
        self.levels.num_lod_levels
    }

    pub fn get(&self, lod: u16) -> &LodInfo {
        &self.entries[lod as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &LodInfo> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    const CONFIGS: [(u16, u16, u16); 8] = [
        (65, 65, 33),
        (129, 65, 17),
        (257, 65, 17),
        (513, 65, 33),
        (513, 129, 17),
        (1025, 65, 17),
        (2049, 129, 33),
        (4097, 65, 33),
    ];

    #[test]
    fn lod_levels() {
        let levels = determine_lod_levels(513, 65, 33);

        assert_eq!(levels.leaf_lods, 2);
        assert_eq!(levels.num_lod_levels, 5);
        assert_eq!(levels.tree_depth, 4);
    }

    #[test]
    fn coarsest_level_starts_at_root() {
        let table = LodInfoTable::build(513, 65, 33);

        let coarsest = table.get(table.num_lod_levels() - 1);
        assert_eq!(coarsest.tree_start, 0);
        assert!(coarsest.is_last);

        let finest = table.get(0);
        assert_eq!((finest.tree_start, finest.tree_end), (2, 4));
        assert_eq!((finest.resolution, finest.size), (513, 129));
        assert_eq!(table.get(3).resolution, 129);
    }

    #[test]
    fn table_is_well_formed() {
        for (size, max_batch, min_batch) in CONFIGS {
            let table = LodInfoTable::build(size, max_batch, min_batch);
            let tree_depth = table.levels().tree_depth;

            for info in table.iter() {
                assert!(info.tree_start < info.tree_end, "{size} {info:?}");
                assert!(info.tree_end <= tree_depth);
                assert!(info.size <= MAX_BATCH_SIZE);
            }

            // lods sharing a depth range are contiguous and the coarsest of them releases it
            for (_, group) in &table.iter().chunk_by(|info| info.tree_start) {
                let group = group.collect_vec();
                assert!(group
                    .iter()
                    .all(|info| (info.tree_end, info.resolution)
                        == (group[0].tree_end, group[0].resolution)));
                assert!(group.last().unwrap().is_last);
            }

            assert_eq!(table.get(table.num_lod_levels() - 1).tree_start, 0);
        }
    }
}
