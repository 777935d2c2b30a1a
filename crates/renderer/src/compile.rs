use tracing::{debug, warn};

use crate::context::GraphicsContext;
use crate::error::{InitError, ShaderCompileError, ShaderLinkError};
use crate::types::StageKind;

/// One successfully compiled stage, tagged with what it was compiled as.
///
/// Consumed by [`link`]; a stage that never reaches `link` must be handed
/// back with [`CompiledStage::release`].
#[derive(Debug)]
pub struct CompiledStage<S> {
    kind: StageKind,
    handle: S,
}

impl<S> CompiledStage<S> {
    pub fn release<C>(self, ctx: &mut C)
    where
        C: GraphicsContext<Stage = S>,
    {
        ctx.delete_stage(self.handle);
    }
}

/// Compiles `source` as a `kind` stage. The error carries the backend's log
/// untouched.
pub fn compile<C: GraphicsContext>(
    ctx: &mut C,
    kind: StageKind,
    source: &str,
) -> Result<CompiledStage<C::Stage>, ShaderCompileError> {
    match ctx.compile_stage(kind, source) {
        Ok(handle) => {
            debug!(stage = %kind, "compiled shader stage");
            Ok(CompiledStage { kind, handle })
        }
        Err(log) => {
            warn!(stage = %kind, "shader stage failed to compile");
            Err(ShaderCompileError { stage: kind, log })
        }
    }
}

/// Links a vertex and a fragment stage. Both stages are released whether or
/// not linking succeeds.
pub fn link<C: GraphicsContext>(
    ctx: &mut C,
    vertex: CompiledStage<C::Stage>,
    fragment: CompiledStage<C::Stage>,
) -> Result<C::Program, ShaderLinkError> {
    let result = if vertex.kind != StageKind::Vertex || fragment.kind != StageKind::Fragment {
        Err(format!(
            "cannot link a {} stage with a {} stage",
            vertex.kind, fragment.kind
        ))
    } else {
        ctx.link_program(&vertex.handle, &fragment.handle)
    };

    vertex.release(ctx);
    fragment.release(ctx);

    result.map_err(|log| {
        warn!("shader program failed to link");
        ShaderLinkError { log }
    })
}

/// Compiles both stages and links them. Nothing stays allocated on failure.
pub fn build_program<C: GraphicsContext>(
    ctx: &mut C,
    vertex_source: &str,
    fragment_source: &str,
) -> Result<C::Program, InitError> {
    let vertex = compile(ctx, StageKind::Vertex, vertex_source)?;
    let fragment = match compile(ctx, StageKind::Fragment, fragment_source) {
        Ok(fragment) => fragment,
        Err(err) => {
            vertex.release(ctx);
            return Err(err.into());
        }
    };
    Ok(link(ctx, vertex, fragment)?)
}

/// Full-screen quad vertex shader. Feeds `position` straight through and
/// emits texture coordinates with (0, 0) at the top-left corner so images
/// appear upright.
pub const QUAD_VERTEX_GLSL: &str = r"#version 450
layout(location = 0) in vec2 position;
layout(location = 0) out vec2 v_uv;

void main() {
    v_uv = vec2(position.x * 0.5 + 0.5, 0.5 - position.y * 0.5);
    gl_Position = vec4(position, 0.0, 1.0);
}
";

/// Default effect: the source image with a slow ripple and a breathing tint.
pub const DEFAULT_FRAGMENT_GLSL: &str = r"#version 450
layout(location = 0) in vec2 v_uv;
layout(location = 0) out vec4 outColor;

layout(std140, set = 0, binding = 0) uniform Params {
    float uTime;
    vec2 sourceResolution;
};
layout(set = 1, binding = 0) uniform texture2D sourceTexture;
layout(set = 1, binding = 1) uniform sampler sourceSampler;

void main() {
    vec2 texel = 1.0 / max(sourceResolution, vec2(1.0));
    vec2 centered = v_uv - vec2(0.5);
    float ripple = sin(length(centered) * 24.0 - uTime * 2.0);
    vec2 uv = v_uv + normalize(centered + texel) * ripple * texel * 4.0;
    vec4 color = texture(sampler2D(sourceTexture, sourceSampler), uv);
    float breath = 0.85 + 0.15 * sin(uTime * 0.7);
    outColor = vec4(color.rgb * breath, 1.0);
}
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessContext;

    const SOLID_FRAGMENT: &str = r"#version 450
layout(location = 0) out vec4 outColor;
void main() { outColor = vec4(1.0, 0.0, 0.0, 1.0); }
";

    #[test]
    fn builtin_sources_compile_and_link() {
        let mut ctx = HeadlessContext::new();
        let program = build_program(&mut ctx, QUAD_VERTEX_GLSL, DEFAULT_FRAGMENT_GLSL)
            .expect("built-in shaders link");
        assert_eq!(ctx.live_programs(), 1);
        assert_eq!(ctx.live_stages(), 0);
        for name in ["uTime", "sourceSampler", "sourceResolution"] {
            assert!(ctx.uniform_location(&program, name).is_some(), "{name}");
        }
    }

    #[test]
    fn compile_error_keeps_backend_log() {
        let mut ctx = HeadlessContext::new();
        let err = compile(&mut ctx, StageKind::Fragment, "#version 450\nvoid main() {")
            .expect_err("unterminated body");
        assert_eq!(err.stage, StageKind::Fragment);
        assert!(!err.log.is_empty());
        assert_eq!(ctx.live_stages(), 0);
    }

    #[test]
    fn fragment_failure_releases_the_vertex_stage() {
        let mut ctx = HeadlessContext::new();
        let err = build_program(&mut ctx, QUAD_VERTEX_GLSL, "not glsl").unwrap_err();
        assert!(matches!(
            err,
            InitError::ShaderCompile(ShaderCompileError {
                stage: StageKind::Fragment,
                ..
            })
        ));
        assert_eq!(ctx.live_stages(), 0);
    }

    #[test]
    fn link_consumes_stages_on_failure() {
        let mut ctx = HeadlessContext::new();
        let vertex = compile(&mut ctx, StageKind::Vertex, QUAD_VERTEX_GLSL).unwrap();
        let other = compile(&mut ctx, StageKind::Vertex, QUAD_VERTEX_GLSL).unwrap();
        assert_eq!(ctx.live_stages(), 2);
        let err = link(&mut ctx, vertex, other).unwrap_err();
        assert!(err.log.contains("vertex stage"));
        assert_eq!(ctx.live_stages(), 0);
        assert_eq!(ctx.live_programs(), 0);
    }

    #[test]
    fn solid_fragment_needs_no_uniforms() {
        let mut ctx = HeadlessContext::new();
        let program = build_program(&mut ctx, QUAD_VERTEX_GLSL, SOLID_FRAGMENT).unwrap();
        assert!(ctx.uniform_location(&program, "uTime").is_none());
    }
}
