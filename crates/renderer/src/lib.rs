//! GPU render pipeline manager for full-screen animated shaders.
//!
//! A [`Pipeline`] owns one linked program, one full-screen quad and at most
//! one source texture, and draws them once per [`Pipeline::render`] call. All
//! GPU work goes through a [`GraphicsContext`] passed explicitly to every
//! call:
//!
//! ```text
//!   host (Viewer / tests)
//!          │ &mut C: GraphicsContext
//!          ▼
//!   Pipeline::new ──▶ compile + link ──▶ resolve uniforms
//!   Pipeline::render ──▶ poll_sources ──▶ uTime ──▶ bind ──▶ draw
//!   Pipeline::update_source ──▶ TextureLoader ──▶ worker thread (fetch + decode)
//! ```
//!
//! Two contexts ship with the crate: [`WgpuContext`] draws into a window
//! surface, [`HeadlessContext`] validates shaders and records draws without a
//! GPU.

pub mod compile;
pub mod context;
pub mod error;
pub mod gpu;
pub mod headless;
pub mod pipeline;
pub mod reflect;
pub mod runtime;
pub mod texture;
pub mod types;
pub mod window;

pub use compile::{build_program, compile, link, CompiledStage, DEFAULT_FRAGMENT_GLSL, QUAD_VERTEX_GLSL};
pub use context::{BufferId, GraphicsContext, ProgramId, StageId, TextureId, UniformLocation};
pub use error::{InitError, LoadCause, ShaderCompileError, ShaderLinkError, TextureLoadError};
pub use gpu::{SurfaceErrorAction, WgpuContext};
pub use headless::{DrawRecord, HeadlessContext, TextureSnapshot};
pub use pipeline::{
    ClockState, Pipeline, PipelineOptions, SourceInfo, SourceOutcome, SourceTexture, SourceUpdate,
};
pub use runtime::{BoxedClock, Clock, ManualClock, SystemClock};
pub use texture::{
    decode_image, DecodedImage, FailedLoad, ImageFetcher, ImageLocation, LoadedTexture, LocationFetcher,
    TextureFuture, TextureLoader,
};
pub use types::{
    FilterMode, GpuPowerPreference, PipelineDescriptor, Sampling, StageKind, TexelImage,
    UniformNames, UniformValue, VertexAttribute, ViewerConfig, WrapMode, PLACEHOLDER_PIXEL,
    POSITION_LOCATION, QUAD_VERTEX_COUNT, QUAD_VERTICES, SOURCE_TEXTURE_UNIT,
};
pub use window::Viewer;
