use std::fmt;

use wgpu::naga::ShaderStage;

use crate::compile::{DEFAULT_FRAGMENT_GLSL, QUAD_VERTEX_GLSL};

/// Vertex location the quad's `position` attribute is fed through.
pub const POSITION_LOCATION: u32 = 0;

/// Texture unit the source image is bound to; the pipeline only uses one.
pub const SOURCE_TEXTURE_UNIT: u32 = 0;

/// Two triangles covering clip space from (-1,-1) to (1,1).
pub const QUAD_VERTICES: [[f32; 2]; 6] = [
    [-1.0, -1.0],
    [1.0, -1.0],
    [-1.0, 1.0],
    [-1.0, 1.0],
    [1.0, -1.0],
    [1.0, 1.0],
];

pub const QUAD_VERTEX_COUNT: u32 = QUAD_VERTICES.len() as u32;

/// Opaque blue stand-in uploaded before an image finishes decoding.
pub const PLACEHOLDER_PIXEL: [u8; 4] = [0, 0, 255, 255];

/// Shader stage a compiled unit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Vertex,
    Fragment,
}

impl StageKind {
    pub(crate) fn naga_stage(self) -> ShaderStage {
        match self {
            StageKind::Vertex => ShaderStage::Vertex,
            StageKind::Fragment => ShaderStage::Fragment,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Vertex => f.write_str("vertex"),
            StageKind::Fragment => f.write_str("fragment"),
        }
    }
}

/// Value written into a uniform slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Vec2([f32; 2]),
    /// Texture unit a sampler (or texture) binding reads from.
    Sampler(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapMode {
    ClampToEdge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Nearest,
    Linear,
}

/// Sampler state attached to a texture upload. Mipmaps are never generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sampling {
    pub wrap_s: WrapMode,
    pub wrap_t: WrapMode,
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
}

impl Sampling {
    /// Used for the 1×1 placeholder pixel.
    pub const PLACEHOLDER: Sampling = Sampling {
        wrap_s: WrapMode::ClampToEdge,
        wrap_t: WrapMode::ClampToEdge,
        min_filter: FilterMode::Nearest,
        mag_filter: FilterMode::Nearest,
    };

    /// Used once a decoded image replaces the placeholder.
    pub const CLAMP_LINEAR: Sampling = Sampling {
        wrap_s: WrapMode::ClampToEdge,
        wrap_t: WrapMode::ClampToEdge,
        min_filter: FilterMode::Linear,
        mag_filter: FilterMode::Linear,
    };
}

/// Tightly packed RGBA8 pixels, top row first.
#[derive(Debug, Clone, Copy)]
pub struct TexelImage<'a> {
    pub width: u32,
    pub height: u32,
    pub rgba: &'a [u8],
}

impl TexelImage<'static> {
    pub fn placeholder() -> Self {
        Self {
            width: 1,
            height: 1,
            rgba: &PLACEHOLDER_PIXEL,
        }
    }
}

impl TexelImage<'_> {
    /// Whether `rgba` holds exactly `width * height` pixels.
    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.rgba.len() as u64 == u64::from(self.width) * u64::from(self.height) * 4
    }
}

/// Float vertex attribute layout. A `stride` of zero means tightly packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub components: u32,
    pub stride: u32,
    pub offset: u32,
}

impl VertexAttribute {
    /// The quad's 2-component position attribute.
    pub const POSITION: VertexAttribute = VertexAttribute {
        location: POSITION_LOCATION,
        components: 2,
        stride: 0,
        offset: 0,
    };

    pub fn effective_stride(&self) -> u32 {
        if self.stride == 0 {
            self.components * std::mem::size_of::<f32>() as u32
        } else {
            self.stride
        }
    }
}

/// Uniform names the pipeline requires from the linked program.
///
/// Every `Some` entry must resolve at construction time. A `None` entry is
/// neither looked up nor written, which lets a host run shaders that ignore
/// the corresponding input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformNames {
    /// Accumulated seconds (`float`).
    pub time: Option<String>,
    /// Sampler (or texture) binding the source image is read through.
    pub sampler: Option<String>,
    /// Source image size in pixels (`vec2`).
    pub resolution: Option<String>,
}

impl UniformNames {
    /// Declares no uniforms at all.
    pub fn none() -> Self {
        Self {
            time: None,
            sampler: None,
            resolution: None,
        }
    }
}

impl Default for UniformNames {
    fn default() -> Self {
        Self {
            time: Some("uTime".to_string()),
            sampler: Some("sourceSampler".to_string()),
            resolution: Some("sourceResolution".to_string()),
        }
    }
}

/// Shader sources and uniform requirements for one pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDescriptor {
    pub vertex_source: String,
    pub fragment_source: String,
    pub uniforms: UniformNames,
}

impl PipelineDescriptor {
    pub fn new(vertex_source: impl Into<String>, fragment_source: impl Into<String>) -> Self {
        Self {
            vertex_source: vertex_source.into(),
            fragment_source: fragment_source.into(),
            uniforms: UniformNames::default(),
        }
    }

    /// Pairs a fragment shader with the built-in quad vertex shader.
    pub fn with_fragment(fragment_source: impl Into<String>) -> Self {
        Self::new(QUAD_VERTEX_GLSL, fragment_source)
    }

    pub fn uniforms(mut self, uniforms: UniformNames) -> Self {
        self.uniforms = uniforms;
        self
    }
}

impl Default for PipelineDescriptor {
    /// Built-in quad vertex shader plus the default animated image effect.
    fn default() -> Self {
        Self::new(QUAD_VERTEX_GLSL, DEFAULT_FRAGMENT_GLSL)
    }
}

/// Adapter power preference requested by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuPowerPreference {
    Low,
    #[default]
    High,
}

/// Immutable configuration passed to the viewer at start-up.
#[derive(Debug, Clone)]
pub struct ViewerConfig {
    /// Window size in physical pixels.
    pub surface_size: (u32, u32),
    pub title: String,
    pub pipeline: PipelineDescriptor,
    /// Image location loaded into the source texture once the window is up.
    pub source: Option<String>,
    /// Present with vsync (FIFO) when true, lowest latency otherwise.
    pub vsync: bool,
    pub gpu_power: GpuPowerPreference,
}

impl Default for ViewerConfig {
    /// A 640×480 window running the built-in effect with no source image.
    fn default() -> Self {
        Self {
            surface_size: (640, 480),
            title: "shadercanvas".to_string(),
            pipeline: PipelineDescriptor::default(),
            source: None,
            vsync: true,
            gpu_power: GpuPowerPreference::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_covers_clip_space_with_two_triangles() {
        assert_eq!(QUAD_VERTEX_COUNT, 6);
        let min_x = QUAD_VERTICES.iter().map(|v| v[0]).fold(f32::MAX, f32::min);
        let max_y = QUAD_VERTICES.iter().map(|v| v[1]).fold(f32::MIN, f32::max);
        assert_eq!(min_x, -1.0);
        assert_eq!(max_y, 1.0);
        assert_eq!(QUAD_VERTICES[2], QUAD_VERTICES[3]);
        assert_eq!(QUAD_VERTICES[1], QUAD_VERTICES[4]);
    }

    #[test]
    fn packed_stride_derives_from_components() {
        assert_eq!(VertexAttribute::POSITION.effective_stride(), 8);
        let strided = VertexAttribute {
            stride: 16,
            ..VertexAttribute::POSITION
        };
        assert_eq!(strided.effective_stride(), 16);
    }

    #[test]
    fn default_uniform_names() {
        let defaults = UniformNames::default();
        assert_eq!(defaults.time.as_deref(), Some("uTime"));
        assert_eq!(defaults.sampler.as_deref(), Some("sourceSampler"));
        assert_eq!(defaults.resolution.as_deref(), Some("sourceResolution"));

        let none = UniformNames::none();
        assert!(none.time.is_none() && none.sampler.is_none() && none.resolution.is_none());
    }

    #[test]
    fn texel_image_checks_payload_length() {
        assert!(TexelImage::placeholder().is_well_formed());
        let short = TexelImage {
            width: 2,
            height: 2,
            rgba: &[0; 12],
        };
        assert!(!short.is_well_formed());
    }
}
