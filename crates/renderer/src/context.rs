//! The graphics-context seam.
//!
//! Every pipeline operation takes the context explicitly instead of relying
//! on ambient "current context" state. Handles returned by a context are only
//! meaningful to that context and only while [`GraphicsContext::is_live`]
//! holds.

use std::fmt;

use crate::types::{Sampling, StageKind, TexelImage, UniformValue, VertexAttribute};

/// GL-shaped command surface implemented by each backend.
///
/// Failure reporting is limited to what a driver reports: compile and link
/// logs. Everything else follows GL's "invalid call is ignored" model and is
/// logged by the backend.
pub trait GraphicsContext {
    type Stage;
    type Program;
    type Buffer;
    type Texture: Clone + PartialEq + fmt::Debug;
    type UniformLocation: Clone + fmt::Debug;

    /// False once the underlying device or surface is gone.
    fn is_live(&self) -> bool;

    /// Largest texture edge the backend accepts.
    fn max_texture_size(&self) -> u32;

    /// Compiles one stage; the error is the backend's diagnostic log.
    fn compile_stage(&mut self, kind: StageKind, source: &str) -> Result<Self::Stage, String>;

    /// Links a vertex and a fragment stage; the error is the link log.
    fn link_program(
        &mut self,
        vertex: &Self::Stage,
        fragment: &Self::Stage,
    ) -> Result<Self::Program, String>;

    fn delete_stage(&mut self, stage: Self::Stage);

    fn delete_program(&mut self, program: Self::Program);

    /// `None` when the program declares no uniform called `name`.
    fn uniform_location(
        &self,
        program: &Self::Program,
        name: &str,
    ) -> Option<Self::UniformLocation>;

    fn set_uniform(
        &mut self,
        program: &Self::Program,
        location: &Self::UniformLocation,
        value: UniformValue,
    );

    /// Uploads an immutable vertex buffer of 2-component positions.
    fn create_vertex_buffer(&mut self, vertices: &[[f32; 2]]) -> Self::Buffer;

    fn delete_buffer(&mut self, buffer: Self::Buffer);

    fn bind_vertex_buffer(&mut self, buffer: &Self::Buffer, attribute: VertexAttribute);

    /// Allocates a texture object with no storage yet.
    fn create_texture(&mut self) -> Self::Texture;

    /// Replaces the texture's storage in place; the handle stays the same.
    fn upload_texture(&mut self, texture: &Self::Texture, image: TexelImage<'_>, sampling: Sampling);

    fn delete_texture(&mut self, texture: Self::Texture);

    /// `None` unbinds the unit.
    fn bind_texture(&mut self, unit: u32, texture: Option<&Self::Texture>);

    fn use_program(&mut self, program: &Self::Program);

    /// Draws `count` vertices starting at `first` as a triangle list.
    fn draw_triangles(&mut self, first: u32, count: u32);
}

macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn raw(self) -> u32 {
                self.0
            }
        }
    };
}

object_id!(
    /// Compiled stage owned by a backend.
    StageId
);
object_id!(
    /// Linked program owned by a backend.
    ProgramId
);
object_id!(
    /// Vertex buffer owned by a backend.
    BufferId
);
object_id!(
    /// Texture owned by a backend.
    TextureId
);

/// Resolved uniform: the program it belongs to and its slot in the program's
/// reflected interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniformLocation {
    pub(crate) program: ProgramId,
    pub(crate) slot: usize,
}

/// Monotonic id source shared by the backends; ids are never reused.
#[derive(Debug, Default)]
pub(crate) struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    pub(crate) fn next(&mut self) -> u32 {
        self.next = self.next.wrapping_add(1);
        self.next
    }
}
