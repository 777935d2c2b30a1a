use std::path::PathBuf;

use clap::Parser;
use renderer::GpuPowerPreference;

#[derive(Parser, Debug)]
#[command(
    name = "shadercanvas",
    author,
    version,
    about = "Render an animated GLSL shader over an image"
)]
pub struct Cli {
    /// Image sampled as the source texture (path, `file://` or `http(s)://` URL).
    #[arg(value_name = "IMAGE")]
    pub image: Option<String>,

    /// TOML configuration file; command-line flags override its values.
    #[arg(long, short, value_name = "FILE", env = "SHADERCANVAS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Fragment shader (Vulkan GLSL, `#version 450`).
    #[arg(long, value_name = "FILE")]
    pub fragment: Option<PathBuf>,

    /// Vertex shader; defaults to the built-in full-screen quad.
    #[arg(long, value_name = "FILE")]
    pub vertex: Option<PathBuf>,

    /// Initial window size (e.g. `1280x720`).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    pub size: Option<SurfaceSize>,

    /// Window title.
    #[arg(long)]
    pub title: Option<String>,

    /// Present without waiting for vertical sync.
    #[arg(long)]
    pub no_vsync: bool,

    /// GPU adapter preference: `high` or `low`.
    #[arg(long, value_name = "MODE", value_parser = parse_gpu_power)]
    pub gpu_power: Option<GpuPowerPreference>,

    /// Compile and link the shaders (and decode the image) without opening a
    /// window, then exit.
    #[arg(long)]
    pub check: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceSize {
    pub width: u32,
    pub height: u32,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_size(value: &str) -> Result<SurfaceSize, String> {
    let trimmed = value.trim();
    let (width, height) = trimmed
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("invalid size '{trimmed}'; expected WIDTHxHEIGHT"))?;
    let width: u32 = width
        .trim()
        .parse()
        .map_err(|_| format!("invalid width in '{trimmed}'"))?;
    let height: u32 = height
        .trim()
        .parse()
        .map_err(|_| format!("invalid height in '{trimmed}'"))?;
    if width == 0 || height == 0 {
        return Err("window size must be non-zero".to_string());
    }
    Ok(SurfaceSize { width, height })
}

pub fn parse_gpu_power(value: &str) -> Result<GpuPowerPreference, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "high" | "performance" | "discrete" => Ok(GpuPowerPreference::High),
        "low" | "battery" | "integrated" => Ok(GpuPowerPreference::Low),
        "" => Err("GPU power preference must not be empty".to_string()),
        other => Err(format!("unknown GPU power preference '{other}' (expected high or low)")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_accepts_either_separator_case() {
        assert_eq!(
            parse_size("1280x720"),
            Ok(SurfaceSize {
                width: 1280,
                height: 720
            })
        );
        assert_eq!(parse_size(" 64X48 ").map(|s| s.height), Ok(48));
    }

    #[test]
    fn size_rejects_zero_and_garbage() {
        assert!(parse_size("0x10").is_err());
        assert!(parse_size("wide").is_err());
        assert!(parse_size("10x").is_err());
    }

    #[test]
    fn gpu_power_aliases() {
        assert_eq!(parse_gpu_power("Battery"), Ok(GpuPowerPreference::Low));
        assert_eq!(parse_gpu_power("high"), Ok(GpuPowerPreference::High));
        assert!(parse_gpu_power("turbo").is_err());
    }

    #[test]
    fn flags_parse_together() {
        let cli = Cli::try_parse_from([
            "shadercanvas",
            "photo.png",
            "--fragment",
            "wave.frag",
            "--size",
            "320x200",
            "--no-vsync",
            "--check",
        ])
        .unwrap();
        assert_eq!(cli.image.as_deref(), Some("photo.png"));
        assert_eq!(cli.size.map(|s| s.width), Some(320));
        assert!(cli.no_vsync && cli.check);
        assert!(cli.vertex.is_none());
    }
}
