use crate::math::GridKey;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TerrainError {
    #[error("terrainSize, minBatchSize and maxBatchSize must all be n^2 + 1")]
    SizeNotPowerOfTwoPlusOne,
    #[error("minBatchSize must be less than or equal to maxBatchSize")]
    MinBatchLargerThanMax,
    #[error("maxBatchSize must be no larger than {max}")]
    MaxBatchTooLarge { max: u16 },
    #[error("maxBatchSize must be no larger than terrainSize")]
    BatchLargerThanTerrain,
    #[error("at least one layer declaration element is required")]
    MissingLayerDeclaration,
    #[error("a layer element refers to a missing sampler or channel")]
    InvalidLayerElement,
    #[error("expected {expected} height values, got {actual}")]
    HeightDataMismatch { expected: usize, actual: usize },
    #[error("expected chunk '{expected}', found '{found}'")]
    UnexpectedChunk { expected: String, found: String },
    #[error("chunk '{id}' has unsupported version {version}")]
    UnsupportedChunkVersion { id: String, version: u16 },
    #[error("compressed block decoded to {actual} bytes, expected {expected}")]
    DecompressedSizeMismatch { expected: usize, actual: usize },
    #[error("lod level chunk holds level {found} with {count} points, expected level {expected} with {expected_count}")]
    LodLevelMismatch {
        expected: u16,
        expected_count: usize,
        found: u16,
        count: usize,
    },
    #[error("{count} lod levels do not fit a terrain of size {size}")]
    InvalidLodLevelCount { count: u16, size: u16 },
    #[error("terrain is not prepared")]
    NotPrepared,
    #[error("terrain is not loaded")]
    NotLoaded,
    #[error("no terrain is defined at {0}")]
    Undefined(GridKey),
    #[error("the terrain size can not change while terrains are defined")]
    GroupNotEmpty,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type TerrainResult<T> = Result<T, TerrainError>;
