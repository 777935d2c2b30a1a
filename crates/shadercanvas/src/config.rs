use std::fs;
use std::path::{Path, PathBuf};

use renderer::{GpuPowerPreference, ImageLocation, UniformNames};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Contents of the optional TOML configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub window: WindowSection,
    pub shader: ShaderSection,
    pub uniforms: UniformSection,
    pub image: ImageSection,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WindowSection {
    pub title: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub vsync: Option<bool>,
    pub gpu_power: Option<PowerSetting>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerSetting {
    High,
    Low,
}

impl From<PowerSetting> for GpuPowerPreference {
    fn from(value: PowerSetting) -> Self {
        match value {
            PowerSetting::High => GpuPowerPreference::High,
            PowerSetting::Low => GpuPowerPreference::Low,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShaderSection {
    pub vertex: Option<PathBuf>,
    pub fragment: Option<PathBuf>,
}

/// Uniform names the shader must declare. A missing key keeps the default
/// name; an empty string means the shader does not use that input.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UniformSection {
    pub time: Option<String>,
    pub sampler: Option<String>,
    pub resolution: Option<String>,
}

impl UniformSection {
    pub fn to_names(&self) -> UniformNames {
        let defaults = UniformNames::default();
        let pick = |configured: &Option<String>, default: Option<String>| match configured {
            None => default,
            Some(name) if name.trim().is_empty() => None,
            Some(name) => Some(name.trim().to_string()),
        };
        UniformNames {
            time: pick(&self.time, defaults.time),
            sampler: pick(&self.sampler, defaults.sampler),
            resolution: pick(&self.resolution, defaults.resolution),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageSection {
    pub source: Option<String>,
}

impl FileConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: FileConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path` and resolves relative shader and image paths against the
    /// file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let input = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&input)?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.width == Some(0) || self.window.height == Some(0) {
            return Err(ConfigError::Invalid(
                "window width and height must be greater than zero".into(),
            ));
        }
        if self.window.width.is_some() != self.window.height.is_some() {
            return Err(ConfigError::Invalid(
                "window width and height must be set together".into(),
            ));
        }
        if let Some(source) = &self.image.source {
            if source.trim().is_empty() {
                return Err(ConfigError::Invalid("image source must not be empty".into()));
            }
        }
        Ok(())
    }

    pub fn surface_size(&self) -> Option<(u32, u32)> {
        Some((self.window.width?, self.window.height?))
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        for path in [&mut self.shader.vertex, &mut self.shader.fragment]
            .into_iter()
            .flatten()
        {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }

        if let Some(source) = self.image.source.as_mut() {
            if let Ok(ImageLocation::File(path)) = ImageLocation::parse(source) {
                if path.is_relative() {
                    *source = base.join(path).to_string_lossy().into_owned();
                }
            }
        }
    }
}
