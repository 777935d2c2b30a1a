use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::reflect::{BindingKind, ProgramInterface, StageInterface, UniformKind};
use crate::types::{StageKind, UniformValue, VertexAttribute};

/// Runs `build` inside a validation error scope and returns the captured
/// message, which doubles as the compile or link log.
pub(crate) fn validated<T>(device: &wgpu::Device, build: impl FnOnce() -> T) -> Result<T, String> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = build();
    match pollster::block_on(device.pop_error_scope()) {
        Some(error) => Err(error.to_string()),
        None => Ok(value),
    }
}

pub(crate) struct GpuStage {
    pub module: wgpu::ShaderModule,
    pub interface: StageInterface,
}

impl GpuStage {
    pub(crate) fn compile(
        device: &wgpu::Device,
        kind: StageKind,
        source: &str,
        interface: StageInterface,
    ) -> Result<Self, String> {
        let label = format!("{kind} stage");
        let module = validated(device, || {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&label),
                source: wgpu::ShaderSource::Glsl {
                    shader: Cow::Owned(source.to_string()),
                    stage: kind.naga_stage(),
                    defines: &[],
                },
            })
        })?;
        Ok(Self { module, interface })
    }
}

/// CPU copy of a uniform block, flushed to its buffer before each draw.
struct UniformBlock {
    bytes: Vec<u8>,
    buffer: wgpu::Buffer,
}

pub(crate) struct GpuProgram {
    pub interface: ProgramInterface,
    vertex_module: wgpu::ShaderModule,
    fragment_module: wgpu::ShaderModule,
    vertex_inputs: BTreeSet<u32>,
    layouts: Vec<wgpu::BindGroupLayout>,
    pipeline_layout: wgpu::PipelineLayout,
    pipelines: HashMap<Option<VertexAttribute>, wgpu::RenderPipeline>,
    blocks: BTreeMap<(u32, u32), UniformBlock>,
    units: HashMap<(u32, u32), u32>,
}

/// Resource the backend hands out for a texture or sampler binding.
pub(crate) struct BoundUnit<'a> {
    pub view: &'a wgpu::TextureView,
    pub sampler: &'a wgpu::Sampler,
}

impl GpuProgram {
    /// Creates the bind group layouts and the render pipeline for the default
    /// quad attribute. Validation errors become the link log.
    pub(crate) fn link(
        device: &wgpu::Device,
        format: wgpu::TextureFormat,
        vertex: &GpuStage,
        fragment: &GpuStage,
    ) -> Result<Self, String> {
        let interface = ProgramInterface::link(&vertex.interface, &fragment.interface)?;

        let group_count = interface.max_group().map_or(0, |group| group + 1);
        let layouts = (0..group_count)
            .map(|group| {
                let entries: Vec<_> = interface
                    .bindings
                    .iter()
                    .filter(|layout| layout.group == group)
                    .map(|layout| {
                        let mut visibility = wgpu::ShaderStages::NONE;
                        if layout.vertex {
                            visibility |= wgpu::ShaderStages::VERTEX;
                        }
                        if layout.fragment {
                            visibility |= wgpu::ShaderStages::FRAGMENT;
                        }
                        wgpu::BindGroupLayoutEntry {
                            binding: layout.binding,
                            visibility,
                            ty: binding_type(layout.kind),
                            count: None,
                        }
                    })
                    .collect();
                device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(&format!("program group {group}")),
                    entries: &entries,
                })
            })
            .collect::<Vec<_>>();

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("program layout"),
            bind_group_layouts: &layouts.iter().collect::<Vec<_>>(),
            push_constant_ranges: &[],
        });

        let blocks = interface
            .bindings
            .iter()
            .filter_map(|layout| match layout.kind {
                BindingKind::UniformBlock { size } => {
                    let size = size.max(16).next_multiple_of(16);
                    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
                        label: Some("uniform block"),
                        size: u64::from(size),
                        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                        mapped_at_creation: false,
                    });
                    Some((
                        (layout.group, layout.binding),
                        UniformBlock {
                            bytes: vec![0; size as usize],
                            buffer,
                        },
                    ))
                }
                _ => None,
            })
            .collect();

        let mut program = Self {
            interface,
            vertex_module: vertex.module.clone(),
            fragment_module: fragment.module.clone(),
            vertex_inputs: vertex.interface.inputs.clone(),
            layouts,
            pipeline_layout,
            pipelines: HashMap::new(),
            blocks,
            units: HashMap::new(),
        };

        let key = program.pipeline_key(Some(VertexAttribute::POSITION));
        let pipeline = validated(device, || program.build_pipeline(device, format, key))?;
        program.pipelines.insert(key, pipeline);
        Ok(program)
    }

    /// Programs whose vertex stage reads no attributes draw without a vertex
    /// buffer.
    pub(crate) fn pipeline_key(&self, attribute: Option<VertexAttribute>) -> Option<VertexAttribute> {
        if self.vertex_inputs.is_empty() {
            None
        } else {
            attribute
        }
    }

    pub(crate) fn needs_vertex_buffer(&self) -> bool {
        !self.vertex_inputs.is_empty()
    }

    /// Builds and caches the render pipeline for `key` unless it exists.
    pub(crate) fn prepare_pipeline(
        &mut self,
        device: &wgpu::Device,
        format: wgpu::TextureFormat,
        key: Option<VertexAttribute>,
    ) -> Result<(), String> {
        if !self.pipelines.contains_key(&key) {
            let pipeline = validated(device, || self.build_pipeline(device, format, key))?;
            self.pipelines.insert(key, pipeline);
        }
        Ok(())
    }

    pub(crate) fn pipeline_for(&self, key: Option<VertexAttribute>) -> Option<&wgpu::RenderPipeline> {
        self.pipelines.get(&key)
    }

    fn build_pipeline(
        &self,
        device: &wgpu::Device,
        format: wgpu::TextureFormat,
        attribute: Option<VertexAttribute>,
    ) -> wgpu::RenderPipeline {
        let attributes: Vec<wgpu::VertexAttribute> = attribute
            .map(|attribute| wgpu::VertexAttribute {
                format: vertex_format(attribute.components),
                offset: u64::from(attribute.offset),
                shader_location: attribute.location,
            })
            .into_iter()
            .collect();
        let buffers: Vec<wgpu::VertexBufferLayout<'_>> = attribute
            .map(|attribute| wgpu::VertexBufferLayout {
                array_stride: u64::from(attribute.effective_stride()),
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &attributes,
            })
            .into_iter()
            .collect();

        device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("program pipeline"),
            layout: Some(&self.pipeline_layout),
            vertex: wgpu::VertexState {
                module: &self.vertex_module,
                entry_point: Some("main"),
                buffers: &buffers,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &self.fragment_module,
                entry_point: Some("main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            multiview: None,
            cache: None,
        })
    }

    /// Writes `value` into the CPU copy of its block, or records the texture
    /// unit a texture/sampler binding reads from. Mismatched writes are
    /// dropped.
    pub(crate) fn set(&mut self, slot: usize, value: UniformValue) -> bool {
        let Some(slot) = self.interface.slot(slot) else {
            return false;
        };
        let key = (slot.group, slot.binding);
        match (slot.kind, value) {
            (UniformKind::Texture | UniformKind::Sampler, UniformValue::Sampler(unit)) => {
                self.units.insert(key, unit);
                true
            }
            (UniformKind::Float, UniformValue::Float(v)) => {
                self.write_block(key, slot.offset, bytemuck::bytes_of(&v))
            }
            (UniformKind::Vec2, UniformValue::Vec2(v)) => {
                self.write_block(key, slot.offset, bytemuck::cast_slice(&v))
            }
            _ => false,
        }
    }

    fn write_block(&mut self, key: (u32, u32), offset: u32, bytes: &[u8]) -> bool {
        let Some(block) = self.blocks.get_mut(&key) else {
            return false;
        };
        let start = offset as usize;
        match block.bytes.get_mut(start..start + bytes.len()) {
            Some(target) => {
                target.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    pub(crate) fn flush_uniforms(&self, queue: &wgpu::Queue) {
        for block in self.blocks.values() {
            queue.write_buffer(&block.buffer, 0, &block.bytes);
        }
    }

    /// Builds one bind group per layout. `unit` resolves a texture unit to
    /// the resource bound there (or the fallback).
    pub(crate) fn bind_groups<'a>(
        &self,
        device: &wgpu::Device,
        unit: impl Fn(u32) -> BoundUnit<'a>,
    ) -> Vec<wgpu::BindGroup> {
        self.layouts
            .iter()
            .enumerate()
            .map(|(group, layout)| {
                let group = group as u32;
                let entries: Vec<wgpu::BindGroupEntry<'_>> = self
                    .interface
                    .bindings
                    .iter()
                    .filter(|binding| binding.group == group)
                    .filter_map(|binding| {
                        let key = (binding.group, binding.binding);
                        let resource = match binding.kind {
                            BindingKind::UniformBlock { .. } => {
                                self.blocks.get(&key)?.buffer.as_entire_binding()
                            }
                            BindingKind::Texture => wgpu::BindingResource::TextureView(
                                unit(self.units.get(&key).copied().unwrap_or(0)).view,
                            ),
                            BindingKind::Sampler => wgpu::BindingResource::Sampler(
                                unit(self.units.get(&key).copied().unwrap_or(0)).sampler,
                            ),
                        };
                        Some(wgpu::BindGroupEntry {
                            binding: binding.binding,
                            resource,
                        })
                    })
                    .collect();
                device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(&format!("program group {group}")),
                    layout,
                    entries: &entries,
                })
            })
            .collect()
    }
}

fn binding_type(kind: BindingKind) -> wgpu::BindingType {
    match kind {
        BindingKind::UniformBlock { .. } => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingKind::Texture => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        BindingKind::Sampler => {
            wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering)
        }
    }
}

fn vertex_format(components: u32) -> wgpu::VertexFormat {
    match components {
        1 => wgpu::VertexFormat::Float32,
        2 => wgpu::VertexFormat::Float32x2,
        3 => wgpu::VertexFormat::Float32x3,
        _ => wgpu::VertexFormat::Float32x4,
    }
}
