use crate::types::StageKind;

/// A stage was rejected by the backend compiler. `log` is the backend's own
/// diagnostic text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{stage} shader failed to compile: {log}")]
pub struct ShaderCompileError {
    pub stage: StageKind,
    pub log: String,
}

/// The compiled stages could not be linked into a program.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("shader program failed to link: {log}")]
pub struct ShaderLinkError {
    pub log: String,
}

/// Pipeline construction failed; no pipeline exists and nothing may be
/// rendered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    #[error("no live graphics context")]
    NoGraphicsContext,

    #[error(transparent)]
    ShaderCompile(#[from] ShaderCompileError),

    #[error(transparent)]
    ShaderLink(#[from] ShaderLinkError),

    #[error("uniform `{name}` is not declared by the shader program")]
    MissingUniform { name: String },
}

/// Why an image could not become a texture.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadCause {
    #[error("image location is empty")]
    EmptyLocation,

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("image is {width}x{height}, larger than the {max}px texture limit")]
    TooLarge { width: u32, height: u32, max: u32 },

    #[error("loader worker exited before reporting a result")]
    WorkerLost,

    #[error("pipeline was disposed before the load resolved")]
    Disposed,
}

/// Non-fatal: the pipeline keeps rendering with its previous texture.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to load texture from `{url}`: {cause}")]
pub struct TextureLoadError {
    pub url: String,
    pub cause: LoadCause,
}

impl TextureLoadError {
    pub fn new(url: impl Into<String>, cause: LoadCause) -> Self {
        Self {
            url: url.into(),
            cause,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_names_the_stage() {
        let err = InitError::from(ShaderCompileError {
            stage: StageKind::Fragment,
            log: "0:3: syntax error".to_string(),
        });
        let message = err.to_string();
        assert!(message.starts_with("fragment shader failed to compile"));
        assert!(message.contains("0:3: syntax error"));
    }

    #[test]
    fn missing_uniform_names_the_uniform() {
        let err = InitError::MissingUniform {
            name: "sourceResolution".to_string(),
        };
        assert!(err.to_string().contains("`sourceResolution`"));
    }

    #[test]
    fn load_error_carries_url_and_cause() {
        let err = TextureLoadError::new("missing.png", LoadCause::Fetch("not found".into()));
        assert_eq!(
            err.to_string(),
            "failed to load texture from `missing.png`: fetch failed: not found"
        );
    }
}
