use crate::math::TerrainRect;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// The maximum number of texture layers a terrain may blend.
pub const MAX_LAYERS: usize = 8;

/// The pixel format of a layer sampler.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum SamplerFormat {
    R8,
    Rgb8,
    Rgba8,
}

impl SamplerFormat {
    pub(crate) fn id(self) -> u8 {
        match self {
            SamplerFormat::R8 => 0,
            SamplerFormat::Rgb8 => 1,
            SamplerFormat::Rgba8 => 2,
        }
    }

    pub(crate) fn from_id(id: u8) -> Self {
        match id {
            0 => SamplerFormat::R8,
            1 => SamplerFormat::Rgb8,
            _ => SamplerFormat::Rgba8,
        }
    }
}

/// One texture slot every layer provides, e.g. `albedo_specular` or `normal_height`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LayerSampler {
    pub alias: String,
    pub format: SamplerFormat,
}

/// What the channels of a sampler element hold.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElementSemantic {
    Albedo,
    Specular,
    Height,
    Normal,
}

impl ElementSemantic {
    pub(crate) fn id(self) -> u8 {
        match self {
            ElementSemantic::Albedo => 0,
            ElementSemantic::Specular => 1,
            ElementSemantic::Height => 2,
            ElementSemantic::Normal => 3,
        }
    }

    pub(crate) fn from_id(id: u8) -> Self {
        match id {
            0 => ElementSemantic::Albedo,
            1 => ElementSemantic::Specular,
            2 => ElementSemantic::Height,
            _ => ElementSemantic::Normal,
        }
    }
}

/// A run of channels inside of one sampler, e.g. the albedo in `rgb` of `albedo_specular`.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub struct LayerSamplerElement {
    /// Index of the sampler in the declaration.
    pub source: u8,
    pub semantic: ElementSemantic,
    pub start: u8,
    pub count: u8,
}

/// Declares the samplers shared by all layers of a terrain, and which channels of them
/// hold which data.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct LayerDeclaration {
    pub samplers: Vec<LayerSampler>,
    pub elements: Vec<LayerSamplerElement>,
}

impl LayerDeclaration {
    pub fn new<S: Into<String>>(samplers: impl IntoIterator<Item = (S, SamplerFormat)>) -> Self {
        Self {
            samplers: samplers
                .into_iter()
                .map(|(alias, format)| LayerSampler {
                    alias: alias.into(),
                    format,
                })
                .collect(),
            elements: Vec::new(),
        }
    }

    /// Declares that `count` channels starting at `start` of sampler `source` hold `semantic`.
    pub fn with_element(
        mut self,
        source: u8,
        semantic: ElementSemantic,
        start: u8,
        count: u8,
    ) -> Self {
        self.elements.push(LayerSamplerElement {
            source,
            semantic,
            start,
            count,
        });
        self
    }

    /// Every element refers to an existing sampler and stays within its four channels.
    pub fn is_valid(&self) -> bool {
        self.elements.iter().all(|element| {
            (element.source as usize) < self.samplers.len()
                && element.count > 0
                && element.start + element.count <= 4
        })
    }

    pub fn is_empty(&self) -> bool {
        self.samplers.is_empty()
    }
}

/// A texture layer: its tiling world size and one texture per declared sampler.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct LayerInstance {
    pub world_size: f32,
    pub texture_names: Vec<String>,
}

/// The blend weights of one layer (all layers except the base layer have one).
#[derive(Clone, Debug, PartialEq)]
pub struct BlendMap {
    pub data: Array2<u8>,
    pub dirty_rect: TerrainRect,
}

impl BlendMap {
    pub fn new(size: u16) -> Self {
        Self {
            data: Array2::zeros((size as usize, size as usize)),
            dirty_rect: TerrainRect::NULL,
        }
    }

    pub fn size(&self) -> u16 {
        self.data.nrows() as u16
    }

    pub fn blend_value(&self, x: usize, y: usize) -> f32 {
        self.data[(y, x)] as f32 / 255.0
    }

    pub fn set_blend_value(&mut self, x: usize, y: usize, value: f32) {
        self.data[(y, x)] = (value.clamp(0.0, 1.0) * 255.0).round() as u8;
        self.dirty_rect
            .merge(&TerrainRect::new(x as i64, y as i64, x as i64 + 1, y as i64 + 1));
    }
}
