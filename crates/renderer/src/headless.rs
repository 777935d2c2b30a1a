//! CPU-side [`GraphicsContext`] that needs no GPU.
//!
//! Shaders go through the same naga parse/validate/reflect path as the wgpu
//! backend, so compile logs, link checks and uniform lookups behave the same.
//! Nothing is rasterised; every draw call is recorded together with the
//! uniform values and the texture bound at that moment.

use std::collections::{BTreeMap, HashMap};

use tracing::{trace, warn};

use crate::context::{
    BufferId, GraphicsContext, IdAllocator, ProgramId, StageId, TextureId, UniformLocation,
};
use crate::reflect::{parse_stage, ProgramInterface, StageInterface, UniformKind};
use crate::types::{Sampling, StageKind, TexelImage, UniformValue, VertexAttribute};

const DEFAULT_MAX_TEXTURE_SIZE: u32 = 8192;
const DEFAULT_DRAW_HISTORY: usize = 1024;

/// Copy of a texture's contents taken when it was sampled by a draw.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureSnapshot {
    pub id: TextureId,
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
    pub sampling: Option<Sampling>,
}

impl TextureSnapshot {
    /// RGBA of the pixel at `(x, y)`, top row first.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let row = y as usize * self.width as usize;
        let start = (row + x as usize) * 4;
        let texel = self.rgba.get(start..start + 4)?;
        Some([texel[0], texel[1], texel[2], texel[3]])
    }
}

/// One recorded `draw_triangles` call.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    pub program: ProgramId,
    pub first: u32,
    pub count: u32,
    /// Vertex positions the draw consumed, in submission order.
    pub positions: Vec<[f32; 2]>,
    pub uniforms: BTreeMap<String, UniformValue>,
    /// Texture bound to unit 0 at draw time.
    pub unit0: Option<TextureSnapshot>,
}

impl DrawRecord {
    pub fn uniform(&self, name: &str) -> Option<UniformValue> {
        self.uniforms.get(name).copied()
    }

    pub fn float(&self, name: &str) -> Option<f32> {
        match self.uniform(name)? {
            UniformValue::Float(value) => Some(value),
            _ => None,
        }
    }

    pub fn vec2(&self, name: &str) -> Option<[f32; 2]> {
        match self.uniform(name)? {
            UniformValue::Vec2(value) => Some(value),
            _ => None,
        }
    }

    /// Whether the draw covered clip space from (-1,-1) to (1,1).
    pub fn covers_clip_space(&self) -> bool {
        let bounds = self.positions.iter().fold(
            [f32::MAX, f32::MAX, f32::MIN, f32::MIN],
            |[x0, y0, x1, y1], [x, y]| [x0.min(*x), y0.min(*y), x1.max(*x), y1.max(*y)],
        );
        self.positions.len() % 3 == 0 && bounds == [-1.0, -1.0, 1.0, 1.0]
    }
}

#[derive(Debug)]
struct ProgramState {
    interface: ProgramInterface,
    values: BTreeMap<String, UniformValue>,
}

#[derive(Debug, Default)]
struct TextureState {
    width: u32,
    height: u32,
    rgba: Vec<u8>,
    sampling: Option<Sampling>,
}

#[derive(Debug)]
pub struct HeadlessContext {
    ids: IdAllocator,
    live: bool,
    max_texture_size: u32,
    stages: HashMap<StageId, StageInterface>,
    programs: HashMap<ProgramId, ProgramState>,
    buffers: HashMap<BufferId, Vec<[f32; 2]>>,
    textures: HashMap<TextureId, TextureState>,
    units: BTreeMap<u32, TextureId>,
    vertex_input: Option<(BufferId, VertexAttribute)>,
    current_program: Option<ProgramId>,
    draws: Vec<DrawRecord>,
    draw_history: usize,
    draw_count: u64,
}

impl Default for HeadlessContext {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessContext {
    pub fn new() -> Self {
        Self {
            ids: IdAllocator::default(),
            live: true,
            max_texture_size: DEFAULT_MAX_TEXTURE_SIZE,
            stages: HashMap::new(),
            programs: HashMap::new(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            units: BTreeMap::new(),
            vertex_input: None,
            current_program: None,
            draws: Vec::new(),
            draw_history: DEFAULT_DRAW_HISTORY,
            draw_count: 0,
        }
    }

    pub fn with_max_texture_size(mut self, max: u32) -> Self {
        self.max_texture_size = max;
        self
    }

    /// Number of most recent draws kept for inspection. Older records are
    /// dropped; [`draw_count`](Self::draw_count) still counts them.
    pub fn with_draw_history(mut self, history: usize) -> Self {
        self.draw_history = history.max(1);
        self
    }

    /// Simulates losing the device; later calls become no-ops.
    pub fn lose(&mut self) {
        self.live = false;
    }

    /// The retained draws, oldest first.
    pub fn draws(&self) -> &[DrawRecord] {
        &self.draws
    }

    /// Every draw recorded since creation, including ones no longer retained.
    pub fn draw_count(&self) -> u64 {
        self.draw_count
    }

    pub fn last_draw(&self) -> Option<&DrawRecord> {
        self.draws.last()
    }

    pub fn texture(&self, id: TextureId) -> Option<TextureSnapshot> {
        self.textures.get(&id).map(|state| TextureSnapshot {
            id,
            width: state.width,
            height: state.height,
            rgba: state.rgba.clone(),
            sampling: state.sampling,
        })
    }

    pub fn bound_texture(&self, unit: u32) -> Option<TextureId> {
        self.units.get(&unit).copied()
    }

    pub fn live_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    fn vertex_positions(&self, first: u32, count: u32) -> Vec<[f32; 2]> {
        let Some((buffer, attribute)) = self.vertex_input else {
            return Vec::new();
        };
        let Some(vertices) = self.buffers.get(&buffer) else {
            return Vec::new();
        };
        // Buffers hold packed vec2s, so only whole-vertex strides map onto them.
        let step = (attribute.effective_stride() / 8).max(1) as usize;
        let skip = (attribute.offset / 8) as usize;
        vertices
            .iter()
            .skip(skip)
            .step_by(step)
            .skip(first as usize)
            .take(count as usize)
            .copied()
            .collect()
    }
}

fn accepts(kind: UniformKind, value: UniformValue) -> bool {
    matches!(
        (kind, value),
        (UniformKind::Float, UniformValue::Float(_))
            | (UniformKind::Vec2, UniformValue::Vec2(_))
            | (UniformKind::Sampler | UniformKind::Texture, UniformValue::Sampler(_))
    )
}

impl GraphicsContext for HeadlessContext {
    type Stage = StageId;
    type Program = ProgramId;
    type Buffer = BufferId;
    type Texture = TextureId;
    type UniformLocation = UniformLocation;

    fn is_live(&self) -> bool {
        self.live
    }

    fn max_texture_size(&self) -> u32 {
        self.max_texture_size
    }

    fn compile_stage(&mut self, kind: StageKind, source: &str) -> Result<StageId, String> {
        if !self.live {
            return Err("graphics context is lost".to_string());
        }
        let interface = parse_stage(kind, source)?;
        let id = StageId(self.ids.next());
        self.stages.insert(id, interface);
        Ok(id)
    }

    fn link_program(&mut self, vertex: &StageId, fragment: &StageId) -> Result<ProgramId, String> {
        if !self.live {
            return Err("graphics context is lost".to_string());
        }
        let (Some(vs), Some(fs)) = (self.stages.get(vertex), self.stages.get(fragment)) else {
            return Err("stage was deleted before linking".to_string());
        };
        let interface = ProgramInterface::link(vs, fs)?;
        let id = ProgramId(self.ids.next());
        self.programs.insert(
            id,
            ProgramState {
                interface,
                values: BTreeMap::new(),
            },
        );
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
        let state = self.programs.get(program)?;
        state.interface.find(name).map(|slot| UniformLocation {
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
        let Some(slot) = state.interface.slot(location.slot) else {
            return;
        };
        if !accepts(slot.kind, value) {
            warn!(uniform = %slot.name, ?value, "uniform type mismatch, write ignored");
            return;
        }
        state.values.insert(slot.name.clone(), value);
    }

    fn create_vertex_buffer(&mut self, vertices: &[[f32; 2]]) -> BufferId {
        let id = BufferId(self.ids.next());
        self.buffers.insert(id, vertices.to_vec());
        id
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer);
        if matches!(self.vertex_input, Some((bound, _)) if bound == buffer) {
            self.vertex_input = None;
        }
    }

    fn bind_vertex_buffer(&mut self, buffer: &BufferId, attribute: VertexAttribute) {
        self.vertex_input = Some((*buffer, attribute));
    }

    fn create_texture(&mut self) -> TextureId {
        let id = TextureId(self.ids.next());
        self.textures.insert(id, TextureState::default());
        id
    }

    fn upload_texture(&mut self, texture: &TextureId, image: TexelImage<'_>, sampling: Sampling) {
        if !image.is_well_formed() {
            warn!(
                width = image.width,
                height = image.height,
                bytes = image.rgba.len(),
                "texel payload does not match its size, upload ignored"
            );
            return;
        }
        let Some(state) = self.textures.get_mut(texture) else {
            warn!(texture = texture.raw(), "upload to a deleted texture ignored");
            return;
        };
        state.width = image.width;
        state.height = image.height;
        state.rgba = image.rgba.to_vec();
        state.sampling = Some(sampling);
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
            Some(texture) => {
                warn!(texture = texture.raw(), unit, "binding a deleted texture, unit cleared");
                self.units.remove(&unit);
            }
            None => {
                self.units.remove(&unit);
            }
        }
    }

    fn use_program(&mut self, program: &ProgramId) {
        self.current_program = self.programs.contains_key(program).then_some(*program);
    }

    fn draw_triangles(&mut self, first: u32, count: u32) {
        if !self.live {
            return;
        }
        let Some(program) = self.current_program else {
            warn!("draw issued with no program in use");
            return;
        };
        let uniforms = self
            .programs
            .get(&program)
            .map(|state| state.values.clone())
            .unwrap_or_default();
        let unit0 = self.units.get(&0).and_then(|id| self.texture(*id));
        let positions = self.vertex_positions(first, count);
        trace!(program = program.raw(), count, "recorded draw");
        if self.draws.len() >= self.draw_history {
            let excess = self.draws.len() + 1 - self.draw_history;
            self.draws.drain(..excess);
        }
        self.draw_count += 1;
        self.draws.push(DrawRecord {
            program,
            first,
            count,
            positions,
            uniforms,
            unit0,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{build_program, QUAD_VERTEX_GLSL};
    use crate::types::QUAD_VERTICES;

    const TIMED_FRAGMENT: &str = r"#version 450
layout(location = 0) out vec4 outColor;
layout(std140, set = 0, binding = 0) uniform Params { float uTime; };
void main() { outColor = vec4(sin(uTime), 0.0, 0.0, 1.0); }
";

    #[test]
    fn draw_history_keeps_the_most_recent_frames() {
        let mut ctx = HeadlessContext::new().with_draw_history(3);
        let program = build_program(&mut ctx, QUAD_VERTEX_GLSL, TIMED_FRAGMENT).unwrap();
        let time = ctx.uniform_location(&program, "uTime").unwrap();
        ctx.use_program(&program);
        for frame in 0..5 {
            ctx.set_uniform(&program, &time, UniformValue::Float(frame as f32));
            ctx.draw_triangles(0, 6);
        }

        assert_eq!(ctx.draw_count(), 5);
        let kept: Vec<f32> = ctx.draws().iter().map(|d| d.float("uTime").unwrap()).collect();
        assert_eq!(kept, [2.0, 3.0, 4.0]);
    }

    #[test]
    fn pixel_lookup_on_huge_dimensions_does_not_overflow() {
        let snapshot = TextureSnapshot {
            id: TextureId(0),
            width: 70_000,
            height: 70_000,
            rgba: vec![255; 16],
            sampling: None,
        };
        assert_eq!(snapshot.pixel(1, 0), Some([255; 4]));
        assert_eq!(snapshot.pixel(69_999, 69_999), None);
    }

    #[test]
    fn records_quad_draws_with_uniform_values() {
        let mut ctx = HeadlessContext::new();
        let program = build_program(&mut ctx, QUAD_VERTEX_GLSL, TIMED_FRAGMENT).unwrap();
        let buffer = ctx.create_vertex_buffer(&QUAD_VERTICES);
        let time = ctx.uniform_location(&program, "uTime").unwrap();
        ctx.set_uniform(&program, &time, UniformValue::Float(1.5));
        ctx.bind_vertex_buffer(&buffer, VertexAttribute::POSITION);
        ctx.use_program(&program);
        ctx.draw_triangles(0, 6);

        let draw = ctx.last_draw().unwrap();
        assert_eq!(draw.float("uTime"), Some(1.5));
        assert_eq!(draw.positions, QUAD_VERTICES.to_vec());
        assert!(draw.covers_clip_space());
        assert!(draw.unit0.is_none());
    }

    #[test]
    fn mistyped_uniform_writes_are_ignored() {
        let mut ctx = HeadlessContext::new();
        let program = build_program(&mut ctx, QUAD_VERTEX_GLSL, TIMED_FRAGMENT).unwrap();
        let time = ctx.uniform_location(&program, "uTime").unwrap();
        ctx.set_uniform(&program, &time, UniformValue::Vec2([1.0, 2.0]));
        ctx.use_program(&program);
        ctx.draw_triangles(0, 3);
        assert_eq!(ctx.last_draw().unwrap().uniform("uTime"), None);
    }

    #[test]
    fn deleting_a_texture_unbinds_it() {
        let mut ctx = HeadlessContext::new();
        let texture = ctx.create_texture();
        ctx.upload_texture(&texture, TexelImage::placeholder(), Sampling::PLACEHOLDER);
        ctx.bind_texture(0, Some(&texture));
        assert_eq!(ctx.bound_texture(0), Some(texture));
        ctx.delete_texture(texture);
        assert_eq!(ctx.bound_texture(0), None);
        assert_eq!(ctx.live_textures(), 0);
    }

    #[test]
    fn malformed_uploads_leave_the_texture_alone() {
        let mut ctx = HeadlessContext::new();
        let texture = ctx.create_texture();
        ctx.upload_texture(&texture, TexelImage::placeholder(), Sampling::PLACEHOLDER);
        ctx.upload_texture(
            &texture,
            TexelImage {
                width: 4,
                height: 4,
                rgba: &[0; 8],
            },
            Sampling::CLAMP_LINEAR,
        );
        let snapshot = ctx.texture(texture).unwrap();
        assert_eq!((snapshot.width, snapshot.height), (1, 1));
        assert_eq!(snapshot.pixel(0, 0), Some([0, 0, 255, 255]));
    }

    #[test]
    fn lost_context_refuses_new_work() {
        let mut ctx = HeadlessContext::new();
        ctx.lose();
        assert!(!ctx.is_live());
        assert!(ctx.compile_stage(StageKind::Vertex, QUAD_VERTEX_GLSL).is_err());
    }
}
