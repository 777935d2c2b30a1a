//! wgpu implementation of [`GraphicsContext`].
//!
//! - `context` owns the instance, device and window surface and knows how
//!   to reconfigure the swapchain after resizes and surface errors.
//! - `program` turns reflected GLSL stages into bind group layouts and render
//!   pipelines, and keeps a CPU copy of each uniform block.
//! - `texture` uploads RGBA8 images with their sampler state.
//!
//! Each `draw_triangles` call renders and presents one frame, cleared to
//! black first.

mod context;
mod program;
mod texture;

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{trace, warn};
use wgpu::util::DeviceExt;
use winit::dpi::PhysicalSize;

pub use context::SurfaceErrorAction;

use crate::context::{
    BufferId, GraphicsContext, IdAllocator, ProgramId, StageId, TextureId, UniformLocation,
};
use crate::reflect::parse_stage;
use crate::types::{GpuPowerPreference, Sampling, StageKind, TexelImage, UniformValue, VertexAttribute};

use self::context::GpuSurface;
use self::program::{BoundUnit, GpuProgram, GpuStage};
use self::texture::GpuTexture;

pub struct WgpuContext {
    gpu: GpuSurface,
    ids: IdAllocator,
    stages: HashMap<StageId, GpuStage>,
    programs: HashMap<ProgramId, GpuProgram>,
    buffers: HashMap<BufferId, wgpu::Buffer>,
    textures: HashMap<TextureId, Option<GpuTexture>>,
    units: BTreeMap<u32, TextureId>,
    vertex_input: Option<(BufferId, VertexAttribute)>,
    current_program: Option<ProgramId>,
    fallback: GpuTexture,
}

impl WgpuContext {
    /// Opens a device and configures a surface for `target`.
    pub fn new<T>(
        target: &T,
        size: (u32, u32),
        vsync: bool,
        gpu_power: GpuPowerPreference,
    ) -> Result<Self>
    where
        T: HasDisplayHandle + HasWindowHandle,
    {
        let gpu = GpuSurface::new(target, PhysicalSize::new(size.0, size.1), vsync, gpu_power)?;
        let fallback = GpuTexture::fallback(&gpu.device, &gpu.queue);
        Ok(Self {
            gpu,
            ids: IdAllocator::default(),
            stages: HashMap::new(),
            programs: HashMap::new(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            units: BTreeMap::new(),
            vertex_input: None,
            current_program: None,
            fallback,
        })
    }

    /// Reconfigures the surface; zero-sized requests are ignored.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.gpu.resize(PhysicalSize::new(width, height));
    }

}

impl GraphicsContext for WgpuContext {
    type Stage = StageId;
    type Program = ProgramId;
    type Buffer = BufferId;
    type Texture = TextureId;
    type UniformLocation = UniformLocation;

    fn is_live(&self) -> bool {
        !self.gpu.is_lost()
    }

    fn max_texture_size(&self) -> u32 {
        self.gpu.device.limits().max_texture_dimension_2d
    }

    fn compile_stage(&mut self, kind: StageKind, source: &str) -> Result<StageId, String> {
        if !self.is_live() {
            return Err("GPU device is lost".to_string());
        }
        let interface = parse_stage(kind, source)?;
        let stage = GpuStage::compile(&self.gpu.device, kind, source, interface)?;
        let id = StageId(self.ids.next());
        self.stages.insert(id, stage);
        Ok(id)
    }

    fn link_program(&mut self, vertex: &StageId, fragment: &StageId) -> Result<ProgramId, String> {
        if !self.is_live() {
            return Err("GPU device is lost".to_string());
        }
        let (Some(vs), Some(fs)) = (self.stages.get(vertex), self.stages.get(fragment)) else {
            return Err("stage was deleted before linking".to_string());
        };
        let program = GpuProgram::link(&self.gpu.device, self.gpu.config.format, vs, fs)?;
        let id = ProgramId(self.ids.next());
        self.programs.insert(id, program);
        Ok(id)
    }

    fn delete_stage(&mut self, stage: StageId) {
        self.stages.remove(&stage);
    }

    fn delete_program(&mut self, program: ProgramId) {
        self.programs.remove(&program);
        if self.current_program == Some(program) {
            self.current_program = None;
        }
    }

    fn uniform_location(&self, program: &ProgramId, name: &str) -> Option<UniformLocation> {
        let slot = self.programs.get(program)?.interface.find(name)?;
        Some(UniformLocation {
            program: *program,
            slot,
        })
    }

    fn set_uniform(&mut self, program: &ProgramId, location: &UniformLocation, value: UniformValue) {
        if location.program != *program {
            warn!(program = program.raw(), "uniform location belongs to another program");
            return;
        }
        let Some(state) = self.programs.get_mut(program) else {
            return;
        };
        if !state.set(location.slot, value) {
            warn!(slot = location.slot, ?value, "uniform write ignored");
        }
    }

    fn create_vertex_buffer(&mut self, vertices: &[[f32; 2]]) -> BufferId {
        let buffer = self
            .gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("vertex buffer"),
                contents: bytemuck::cast_slice(vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let id = BufferId(self.ids.next());
        self.buffers.insert(id, buffer);
        id
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        if let Some(buffer) = self.buffers.remove(&buffer) {
            buffer.destroy();
        }
        if matches!(self.vertex_input, Some((bound, _)) if bound == buffer) {
            self.vertex_input = None;
        }
    }

    fn bind_vertex_buffer(&mut self, buffer: &BufferId, attribute: VertexAttribute) {
        self.vertex_input = Some((*buffer, attribute));
    }

    fn create_texture(&mut self) -> TextureId {
        let id = TextureId(self.ids.next());
        self.textures.insert(id, None);
        id
    }

    fn upload_texture(&mut self, texture: &TextureId, image: TexelImage<'_>, sampling: Sampling) {
        let max = self.max_texture_size();
        if !image.is_well_formed() || image.width > max || image.height > max {
            warn!(
                width = image.width,
                height = image.height,
                bytes = image.rgba.len(),
                max,
                "texture upload rejected"
            );
            return;
        }
        let Some(slot) = self.textures.get_mut(texture) else {
            warn!(texture = texture.raw(), "upload to a deleted texture ignored");
            return;
        };
        *slot = Some(GpuTexture::upload(
            &self.gpu.device,
            &self.gpu.queue,
            image,
            sampling,
        ));
    }

    fn delete_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
        self.units.retain(|_, bound| *bound != texture);
    }

    fn bind_texture(&mut self, unit: u32, texture: Option<&TextureId>) {
        match texture {
            Some(texture) if self.textures.contains_key(texture) => {
                self.units.insert(unit, *texture);
            }
            _ => {
                self.units.remove(&unit);
            }
        }
    }

    fn use_program(&mut self, program: &ProgramId) {
        self.current_program = self.programs.contains_key(program).then_some(*program);
    }

    fn draw_triangles(&mut self, first: u32, count: u32) {
        if !self.is_live() {
            return;
        }
        let Some(program_id) = self.current_program else {
            warn!("draw issued with no program in use");
            return;
        };
        let Some(program) = self.programs.get_mut(&program_id) else {
            return;
        };

        let vertex_buffer = match (program.needs_vertex_buffer(), self.vertex_input) {
            (false, _) => None,
            (true, Some((id, _))) => match self.buffers.get(&id) {
                Some(buffer) => Some(buffer),
                None => {
                    warn!("bound vertex buffer was deleted, draw skipped");
                    return;
                }
            },
            (true, None) => {
                warn!("program reads vertex attributes but none are bound, draw skipped");
                return;
            }
        };

        let key = program.pipeline_key(self.vertex_input.map(|(_, attribute)| attribute));
        if let Err(log) = program.prepare_pipeline(&self.gpu.device, self.gpu.config.format, key) {
            warn!(%log, "render pipeline rejected the bound vertex layout");
            return;
        }
        let program = &*program;
        let Some(pipeline) = program.pipeline_for(key) else {
            return;
        };

        let frame = match self.gpu.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(err) => {
                let action = self.gpu.handle_surface_error(err);
                warn!(?action, "failed to acquire surface texture, frame skipped");
                return;
            }
        };

        let units = &self.units;
        let textures = &self.textures;
        let fallback = &self.fallback;
        let lookup = |unit: u32| {
            let texture = units
                .get(&unit)
                .and_then(|id| textures.get(id))
                .and_then(Option::as_ref)
                .unwrap_or(fallback);
            BoundUnit {
                view: &texture.view,
                sampler: &texture.sampler,
            }
        };

        program.flush_uniforms(&self.gpu.queue);
        let bind_groups = program.bind_groups(&self.gpu.device, lookup);

        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame encoder"),
            });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("frame pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            render_pass.set_pipeline(pipeline);
            for (index, group) in bind_groups.iter().enumerate() {
                render_pass.set_bind_group(index as u32, group, &[]);
            }
            if let Some(buffer) = vertex_buffer {
                render_pass.set_vertex_buffer(0, buffer.slice(..));
            }
            render_pass.draw(first..first + count, 0..1);
        }

        self.gpu.queue.submit(std::iter::once(encoder.finish()));
        frame.present();
        trace!(program = program_id.raw(), count, "frame presented");
    }
}
