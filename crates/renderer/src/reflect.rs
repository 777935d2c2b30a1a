//! Stage reflection through naga's GLSL frontend.
//!
//! Both backends parse and validate every stage here so that "uniform not
//! found" and stage-interface mismatches are decided the same way whether or
//! not a GPU is present. The accepted dialect is Vulkan GLSL (`#version 450`):
//! plain uniforms live in a `std140` block, textures and samplers are separate
//! `texture2D`/`sampler` bindings, and every resource carries an explicit
//! `layout(set = .., binding = ..)`.

use std::collections::{BTreeMap, BTreeSet};

use wgpu::naga;
use wgpu::naga::front::glsl::{Frontend, Options};
use wgpu::naga::valid::{Capabilities, ValidationFlags, Validator};

use crate::types::StageKind;

/// Data type of a reflected uniform, as far as the pipeline cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniformKind {
    Float,
    Vec2,
    /// Any other block member (ints, matrices, vec3/vec4, arrays).
    Other,
    Texture,
    Sampler,
}

/// One named uniform. Block members carry their byte offset inside the
/// block; handles have an offset of zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformSlot {
    pub name: String,
    pub group: u32,
    pub binding: u32,
    pub offset: u32,
    pub kind: UniformKind,
}

/// What lives at one `(set, binding)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    UniformBlock { size: u32 },
    Texture,
    Sampler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingLayout {
    pub group: u32,
    pub binding: u32,
    pub kind: BindingKind,
    pub vertex: bool,
    pub fragment: bool,
}

/// Reflected interface of a single compiled stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInterface {
    pub kind: StageKind,
    pub uniforms: Vec<UniformSlot>,
    pub bindings: Vec<BindingLayout>,
    pub inputs: BTreeSet<u32>,
    pub outputs: BTreeSet<u32>,
}

/// Parses and validates `source`, returning its interface or the frontend's
/// diagnostic log (message, `glsl:line:column` and the offending source line).
pub fn parse_stage(kind: StageKind, source: &str) -> Result<StageInterface, String> {
    let module = Frontend::default()
        .parse(&Options::from(kind.naga_stage()), source)
        .map_err(|errors| errors.emit_to_string(source).trim_end().to_string())?;

    Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .map_err(|err| {
            err.emit_to_string_with_path(source, "glsl")
                .trim_end()
                .to_string()
        })?;

    Ok(reflect_module(kind, &module))
}

fn reflect_module(kind: StageKind, module: &naga::Module) -> StageInterface {
    let mut uniforms = Vec::new();
    let mut bindings = Vec::new();
    let in_vertex = kind == StageKind::Vertex;

    for (_, var) in module.global_variables.iter() {
        let Some(resource) = var.binding.as_ref() else {
            continue;
        };
        let (group, binding) = (resource.group, resource.binding);
        match var.space {
            naga::AddressSpace::Uniform => {
                let inner = &module.types[var.ty].inner;
                let size = inner.size(module.to_ctx());
                if let naga::TypeInner::Struct { members, .. } = inner {
                    for member in members {
                        if let Some(name) = &member.name {
                            uniforms.push(UniformSlot {
                                name: name.clone(),
                                group,
                                binding,
                                offset: member.offset,
                                kind: value_kind(&module.types[member.ty].inner),
                            });
                        }
                    }
                } else if let Some(name) = &var.name {
                    uniforms.push(UniformSlot {
                        name: name.clone(),
                        group,
                        binding,
                        offset: 0,
                        kind: value_kind(inner),
                    });
                }
                bindings.push(BindingLayout {
                    group,
                    binding,
                    kind: BindingKind::UniformBlock { size },
                    vertex: in_vertex,
                    fragment: !in_vertex,
                });
            }
            naga::AddressSpace::Handle => {
                let (uniform_kind, binding_kind) = match module.types[var.ty].inner {
                    naga::TypeInner::Image { .. } => (UniformKind::Texture, BindingKind::Texture),
                    naga::TypeInner::Sampler { .. } => (UniformKind::Sampler, BindingKind::Sampler),
                    _ => continue,
                };
                if let Some(name) = &var.name {
                    uniforms.push(UniformSlot {
                        name: name.clone(),
                        group,
                        binding,
                        offset: 0,
                        kind: uniform_kind,
                    });
                }
                bindings.push(BindingLayout {
                    group,
                    binding,
                    kind: binding_kind,
                    vertex: in_vertex,
                    fragment: !in_vertex,
                });
            }
            _ => {}
        }
    }

    let mut inputs = BTreeSet::new();
    let mut outputs = BTreeSet::new();
    let stage = kind.naga_stage();
    if let Some(entry) = module.entry_points.iter().find(|entry| entry.stage == stage) {
        for argument in &entry.function.arguments {
            collect_locations(module, argument.binding.as_ref(), argument.ty, &mut inputs);
        }
        if let Some(result) = &entry.function.result {
            collect_locations(module, result.binding.as_ref(), result.ty, &mut outputs);
        }
    }

    StageInterface {
        kind,
        uniforms,
        bindings,
        inputs,
        outputs,
    }
}

fn value_kind(inner: &naga::TypeInner) -> UniformKind {
    match inner {
        naga::TypeInner::Scalar(naga::Scalar {
            kind: naga::ScalarKind::Float,
            width: 4,
        }) => UniformKind::Float,
        naga::TypeInner::Vector {
            size: naga::VectorSize::Bi,
            scalar:
                naga::Scalar {
                    kind: naga::ScalarKind::Float,
                    width: 4,
                },
        } => UniformKind::Vec2,
        _ => UniformKind::Other,
    }
}

fn collect_locations(
    module: &naga::Module,
    binding: Option<&naga::Binding>,
    ty: naga::Handle<naga::Type>,
    out: &mut BTreeSet<u32>,
) {
    match binding {
        Some(naga::Binding::Location { location, .. }) => {
            out.insert(*location);
        }
        Some(naga::Binding::BuiltIn(_)) => {}
        None => {
            if let naga::TypeInner::Struct { members, .. } = &module.types[ty].inner {
                for member in members {
                    if let Some(naga::Binding::Location { location, .. }) = &member.binding {
                        out.insert(*location);
                    }
                }
            }
        }
    }
}

/// Interface of a linked program: the union of both stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramInterface {
    pub uniforms: Vec<UniformSlot>,
    pub bindings: Vec<BindingLayout>,
}

impl ProgramInterface {
    /// Checks that the stages agree with each other and merges their
    /// resources. The error string is the link log.
    pub fn link(vertex: &StageInterface, fragment: &StageInterface) -> Result<Self, String> {
        if vertex.kind != StageKind::Vertex {
            return Err(format!("expected a vertex stage, got a {} stage", vertex.kind));
        }
        if fragment.kind != StageKind::Fragment {
            return Err(format!(
                "expected a fragment stage, got a {} stage",
                fragment.kind
            ));
        }

        let mut log = Vec::new();
        for location in fragment.inputs.difference(&vertex.outputs) {
            log.push(format!(
                "fragment input at location {location} is not written by the vertex stage"
            ));
        }

        let mut uniforms: Vec<UniformSlot> = vertex.uniforms.clone();
        for slot in &fragment.uniforms {
            match uniforms.iter().find(|existing| existing.name == slot.name) {
                Some(existing) if existing != slot => log.push(format!(
                    "uniform `{}` is declared differently in the vertex and fragment stages",
                    slot.name
                )),
                Some(_) => {}
                None => uniforms.push(slot.clone()),
            }
        }

        let mut merged: BTreeMap<(u32, u32), BindingLayout> = BTreeMap::new();
        for layout in vertex.bindings.iter().chain(&fragment.bindings) {
            let key = (layout.group, layout.binding);
            match merged.get_mut(&key) {
                None => {
                    merged.insert(key, *layout);
                }
                Some(existing) => match (&mut existing.kind, layout.kind) {
                    (BindingKind::UniformBlock { size }, BindingKind::UniformBlock { size: other }) => {
                        *size = (*size).max(other);
                        existing.vertex |= layout.vertex;
                        existing.fragment |= layout.fragment;
                    }
                    (current, other) if *current == other => {
                        existing.vertex |= layout.vertex;
                        existing.fragment |= layout.fragment;
                    }
                    _ => log.push(format!(
                        "set {} binding {} holds different resource types across stages",
                        layout.group, layout.binding
                    )),
                },
            }
        }

        if !log.is_empty() {
            return Err(log.join("\n"));
        }

        Ok(Self {
            uniforms,
            bindings: merged.into_values().collect(),
        })
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.uniforms.iter().position(|slot| slot.name == name)
    }

    pub fn slot(&self, index: usize) -> Option<&UniformSlot> {
        self.uniforms.get(index)
    }

    /// Highest bind group index in use, if any resource is bound.
    pub fn max_group(&self) -> Option<u32> {
        self.bindings.iter().map(|layout| layout.group).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::QUAD_VERTEX_GLSL;

    const FRAGMENT: &str = r"#version 450
layout(location = 0) in vec2 v_uv;
layout(location = 0) out vec4 outColor;

layout(std140, set = 0, binding = 0) uniform Params {
    float uTime;
    vec2 sourceResolution;
};
layout(set = 1, binding = 0) uniform texture2D sourceTexture;
layout(set = 1, binding = 1) uniform sampler sourceSampler;

void main() {
    vec4 texel = texture(sampler2D(sourceTexture, sourceSampler), v_uv);
    outColor = vec4(texel.rgb * (0.5 + 0.5 * sin(uTime)), sourceResolution.x);
}
";

    #[test]
    fn reflects_block_members_and_handles() {
        let stage = parse_stage(StageKind::Fragment, FRAGMENT).expect("fragment parses");
        let time = stage.uniforms.iter().find(|s| s.name == "uTime").unwrap();
        assert_eq!(time.kind, UniformKind::Float);
        assert_eq!((time.group, time.binding, time.offset), (0, 0, 0));

        let resolution = stage
            .uniforms
            .iter()
            .find(|s| s.name == "sourceResolution")
            .unwrap();
        assert_eq!(resolution.kind, UniformKind::Vec2);
        assert_eq!(resolution.offset, 8);

        let sampler = stage
            .uniforms
            .iter()
            .find(|s| s.name == "sourceSampler")
            .unwrap();
        assert_eq!(sampler.kind, UniformKind::Sampler);
        assert_eq!((sampler.group, sampler.binding), (1, 1));
        assert!(stage.inputs.contains(&0));
    }

    #[test]
    fn syntax_errors_surface_as_logs() {
        let log = parse_stage(StageKind::Vertex, "#version 450\nvoid main() { gl_Position = ; }")
            .expect_err("broken source must not parse");
        assert!(!log.is_empty());
    }

    #[test]
    fn syntax_error_logs_point_at_the_line() {
        let source = "#version 450\nlayout(location = 0) out vec4 c;\nvoid main() {\n    c = vec4(1.0) +;\n}\n";
        let log = parse_stage(StageKind::Fragment, source).unwrap_err();
        assert!(log.contains("glsl:4:"), "{log}");
        assert!(log.contains("c = vec4(1.0) +;"), "{log}");
        assert!(!log.contains("Span {"), "{log}");
    }

    #[test]
    fn link_rejects_unfed_fragment_inputs() {
        let vertex = parse_stage(StageKind::Vertex, QUAD_VERTEX_GLSL).unwrap();
        let fragment = parse_stage(
            StageKind::Fragment,
            r"#version 450
layout(location = 3) in vec4 v_color;
layout(location = 0) out vec4 outColor;
void main() { outColor = v_color; }
",
        )
        .unwrap();
        let log = ProgramInterface::link(&vertex, &fragment).unwrap_err();
        assert!(log.contains("location 3"));
    }

    #[test]
    fn link_merges_bindings_from_both_stages() {
        let vertex = parse_stage(StageKind::Vertex, QUAD_VERTEX_GLSL).unwrap();
        let fragment = parse_stage(StageKind::Fragment, FRAGMENT).unwrap();
        let program = ProgramInterface::link(&vertex, &fragment).unwrap();
        assert_eq!(program.max_group(), Some(1));
        assert_eq!(program.bindings.len(), 3);
        assert!(program.find("sourceTexture").is_some());
        assert!(program.find("iChannel0").is_none());
        assert!(program.bindings.iter().all(|b| b.fragment && !b.vertex));
    }

    #[test]
    fn link_rejects_swapped_stages() {
        let vertex = parse_stage(StageKind::Vertex, QUAD_VERTEX_GLSL).unwrap();
        let log = ProgramInterface::link(&vertex, &vertex).unwrap_err();
        assert!(log.contains("expected a fragment stage"));
    }
}
